//! Routes for the signed-in identity's own profile.

use chrono::Utc;
use rocket::serde::json::Json;
use rocket::{State, get, post, put};
use rocket_okapi::openapi;

use crate::auth::Gate;
use crate::auth::AuthState;
use crate::auth::guards::AnyIdentity;
use crate::auth::responses::{CodeIssuedResponse, OtpRequest, PhoneRequest, UserSummary};
use crate::auth::routes::{AuthRouteResult, respond_error};

#[openapi(tag = "Account")]
#[get("/me")]
pub async fn me(state: &State<AuthState>, gate: Gate<AnyIdentity>) -> AuthRouteResult<UserSummary> {
    let auth = gate.session().map_err(respond_error)?;
    let identity = state
        .profile(auth.principal.id)
        .await
        .map_err(respond_error)?;
    Ok(Json(identity.summary()))
}

/// Replaces the phone number; it stays unverified until the SMS code comes back.
#[openapi(tag = "Account")]
#[put("/me/phone", data = "<payload>")]
pub async fn change_phone(
    state: &State<AuthState>,
    gate: Gate<AnyIdentity>,
    payload: Json<PhoneRequest>,
) -> AuthRouteResult<CodeIssuedResponse> {
    let auth = gate.session().map_err(respond_error)?;
    let expires_at = state
        .change_phone(auth.principal.id, &payload.phone, Utc::now())
        .await
        .map_err(respond_error)?;
    Ok(Json(CodeIssuedResponse { expires_at }))
}

#[openapi(tag = "Account")]
#[post("/me/phone/verify", data = "<payload>")]
pub async fn verify_phone(
    state: &State<AuthState>,
    gate: Gate<AnyIdentity>,
    payload: Json<OtpRequest>,
) -> AuthRouteResult<UserSummary> {
    let auth = gate.session().map_err(respond_error)?;
    let identity = state
        .verify_phone(auth.principal.id, &payload.otp, Utc::now())
        .await
        .map_err(respond_error)?;
    Ok(Json(identity.summary()))
}
