//! Liveness endpoint used for readiness checks and tests.

use rocket::serde::json::Json;
use rocket_okapi::okapi::schemars::JsonSchema;
use rocket_okapi::openapi;
use serde::{Deserialize, Serialize};

use crate::auth::Gate;
use crate::auth::guards::PublicRoute;

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct HealthResponse {
    pub status: String,
    /// Whether the caller presented a valid session.
    pub authenticated: bool,
}

#[openapi(tag = "Health")]
#[get("/health")]
pub fn health_check(gate: Gate<PublicRoute>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        authenticated: gate.principal().is_some(),
    })
}
