use std::sync::Arc;

use rocket::http::{Cookie, Status};
use rocket::routes;
use shop_api::auth::notifier::RecordingNotifier;
use shop_api::routes::health::{HealthResponse, health_check};
use shop_api::test_support::{TestRocketBuilder, memory_state};

#[test]
fn health_endpoint_returns_ok() {
    let client = TestRocketBuilder::new()
        .manage_auth_state(memory_state(Arc::new(RecordingNotifier::new())))
        .mount_api_routes(routes![health_check])
        .blocking_client();

    let response = client.get("/api/v1/health").dispatch();
    assert_eq!(response.status(), Status::Ok);

    let payload: HealthResponse = response.into_json().expect("valid JSON payload");
    assert_eq!(payload.status, "ok");
    assert!(!payload.authenticated);
}

#[test]
fn garbage_session_cookie_does_not_break_public_routes() {
    let client = TestRocketBuilder::new()
        .manage_auth_state(memory_state(Arc::new(RecordingNotifier::new())))
        .mount_api_routes(routes![health_check])
        .blocking_client();

    let response = client
        .get("/api/v1/health")
        .cookie(Cookie::new("session", "not.a.cookie"))
        .dispatch();
    assert_eq!(response.status(), Status::Ok);

    let payload: HealthResponse = response.into_json().expect("valid JSON payload");
    assert!(!payload.authenticated);
}
