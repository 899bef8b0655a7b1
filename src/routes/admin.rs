//! Administrative identity management.

use rocket::serde::json::Json;
use rocket::{State, put};
use rocket_okapi::openapi;
use uuid::Uuid;

use crate::auth::guards::AdminOnly;
use crate::auth::responses::{RoleChangeRequest, UserSummary};
use crate::auth::routes::{AuthRouteResult, respond_error};
use crate::auth::{AuthError, AuthState, Gate};

/// Changes an identity's role. Takes effect on that identity's next request.
#[openapi(tag = "Admin")]
#[put("/admin/identities/<id>/role", data = "<payload>")]
pub async fn change_role(
    state: &State<AuthState>,
    gate: Gate<AdminOnly>,
    id: String,
    payload: Json<RoleChangeRequest>,
) -> AuthRouteResult<UserSummary> {
    let admin = gate.session().map_err(respond_error)?;
    let target = Uuid::parse_str(&id)
        .map_err(|_| respond_error(AuthError::BadRequest("identity id must be a UUID".into())))?;

    let identity = state
        .change_role(target, payload.role)
        .await
        .map_err(respond_error)?;
    log::info!(
        "admin {} set role of {} to {}",
        admin.principal.id,
        identity.id,
        identity.role.as_str()
    );
    Ok(Json(identity.summary()))
}
