use std::sync::Arc;

use rocket::http::{ContentType, Cookie, Status};
use rocket::local::asynchronous::{Client, LocalResponse};
use serde_json::json;
use shop_api::auth::notifier::{Channel, RecordingNotifier};
use shop_api::auth::one_time_codes::VerificationKind;
use shop_api::auth::responses::{CodeIssuedResponse, SessionResponse, UserSummary};
use shop_api::auth::routes::AuthErrorResponse;
use shop_api::test_support::{TestRocketBuilder, memory_state};

const SESSION: &str = "session";
const EMAIL: &str = "grace@example.com";
const PASSWORD: &str = "hopper-1906";

async fn client(notifier: Arc<RecordingNotifier>) -> Client {
    TestRocketBuilder::new()
        .manage_auth_state(memory_state(notifier))
        .with_full_api()
        .untracked_async_client()
        .await
}

fn session_cookie(response: &LocalResponse<'_>) -> String {
    response
        .cookies()
        .get(SESSION)
        .map(|cookie| cookie.value().to_string())
        .expect("session cookie set")
}

async fn login(client: &Client, email: &str, password: &str) -> String {
    let response = client
        .post("/api/v1/auth/login")
        .header(ContentType::JSON)
        .json(&json!({ "email": email, "password": password }))
        .dispatch()
        .await;
    assert_eq!(response.status(), Status::Ok);
    session_cookie(&response)
}

async fn register_and_confirm(client: &Client, notifier: &RecordingNotifier) -> UserSummary {
    let response = client
        .post("/api/v1/auth/register")
        .json(&json!({ "email": EMAIL, "password": PASSWORD, "phone": "+1 555 010 7788" }))
        .dispatch()
        .await;
    assert_eq!(response.status(), Status::Created);
    let user: UserSummary = response.into_json().await.expect("user summary");
    assert!(!user.email_verified);

    let token = notifier
        .last_code(VerificationKind::RegistrationEmail)
        .expect("confirmation token sent");
    let response = client
        .post("/api/v1/auth/confirm-email")
        .json(&json!({ "token": token }))
        .dispatch()
        .await;
    assert_eq!(response.status(), Status::Ok);
    user
}

#[tokio::test]
async fn full_session_lifecycle() {
    let notifier = Arc::new(RecordingNotifier::new());
    let client = client(notifier.clone()).await;
    let user = register_and_confirm(&client, &notifier).await;

    // Password + OTP sign-in.
    let response = client
        .post("/api/v1/auth/request-otp")
        .json(&json!({ "email": EMAIL, "password": PASSWORD }))
        .dispatch()
        .await;
    assert_eq!(response.status(), Status::Ok);
    let issued: CodeIssuedResponse = response.into_json().await.expect("expiry");
    assert!(issued.expires_at > chrono::Utc::now());

    let sent = notifier.sent();
    assert_eq!(
        sent.last().map(|notification| notification.channel.clone()),
        Some(Channel::Sms("+1 555 010 7788".into()))
    );
    let otp = notifier.last_code(VerificationKind::PhoneOtp).expect("otp sent");
    assert_eq!(otp.len(), 6);

    let response = client
        .post("/api/v1/auth/verify-otp")
        .json(&json!({ "email": EMAIL, "otp": otp }))
        .dispatch()
        .await;
    assert_eq!(response.status(), Status::Ok);
    let otp_cookie = session_cookie(&response);
    let session: SessionResponse = response.into_json().await.expect("session");
    assert_eq!(session.user.id, user.id);
    assert!(session.user.phone_verified);
    assert!(session.access_token_expires_at < session.refresh_token_expires_at);
    assert!(!otp_cookie.is_empty());

    // Plain password login starts a new session.
    let cookie = login(&client, EMAIL, PASSWORD).await;

    let response = client
        .put("/api/v1/me/phone")
        .cookie(Cookie::new(SESSION, cookie.clone()))
        .json(&json!({ "phone": "+1 555 010 9900" }))
        .dispatch()
        .await;
    assert_eq!(response.status(), Status::Ok);

    let response = client
        .post("/api/v1/auth/logout")
        .cookie(Cookie::new(SESSION, cookie.clone()))
        .dispatch()
        .await;
    assert_eq!(response.status(), Status::Ok);
    let removal = response.cookies().get(SESSION).map(|cookie| cookie.value().to_string());
    assert_eq!(removal.as_deref(), Some(""));

    // Replaying the old cookie on a mutating route is rejected.
    let response = client
        .put("/api/v1/me/phone")
        .cookie(Cookie::new(SESSION, cookie.clone()))
        .json(&json!({ "phone": "+1 555 010 1111" }))
        .dispatch()
        .await;
    assert_eq!(response.status(), Status::Unauthorized);
    let body: AuthErrorResponse = response.into_json().await.expect("error body");
    assert_eq!(body.message, "authentication required");

    // Logout skips the revocation check, so the revoked cookie can still end
    // the session again.
    let response = client
        .post("/api/v1/auth/logout")
        .cookie(Cookie::new(SESSION, cookie.clone()))
        .dispatch()
        .await;
    assert_eq!(response.status(), Status::Ok);

    // Reads skip the revocation registry until the access credential expires.
    let response = client
        .get("/api/v1/me")
        .cookie(Cookie::new(SESSION, cookie.clone()))
        .dispatch()
        .await;
    assert_eq!(response.status(), Status::Ok);

    // The refresh credential was cleared.
    let response = client
        .post("/api/v1/auth/refresh")
        .cookie(Cookie::new(SESSION, cookie))
        .dispatch()
        .await;
    assert_eq!(response.status(), Status::Unauthorized);
}

#[tokio::test]
async fn refresh_rotates_the_session() {
    let notifier = Arc::new(RecordingNotifier::new());
    let client = client(notifier.clone()).await;
    register_and_confirm(&client, &notifier).await;

    let first = login(&client, EMAIL, PASSWORD).await;
    let response = client
        .post("/api/v1/auth/refresh")
        .cookie(Cookie::new(SESSION, first.clone()))
        .dispatch()
        .await;
    assert_eq!(response.status(), Status::Ok);
    let second = session_cookie(&response);
    assert_ne!(first, second);

    let response = client
        .post("/api/v1/auth/refresh")
        .cookie(Cookie::new(SESSION, first))
        .dispatch()
        .await;
    assert_eq!(response.status(), Status::Unauthorized);

    let response = client
        .get("/api/v1/me")
        .cookie(Cookie::new(SESSION, second))
        .dispatch()
        .await;
    assert_eq!(response.status(), Status::Ok);
    let me: UserSummary = response.into_json().await.expect("profile");
    assert_eq!(me.email, EMAIL);
}

#[tokio::test]
async fn missing_or_tampered_cookies_are_rejected_uniformly() {
    let notifier = Arc::new(RecordingNotifier::new());
    let client = client(notifier.clone()).await;
    register_and_confirm(&client, &notifier).await;
    let cookie = login(&client, EMAIL, PASSWORD).await;

    let response = client.get("/api/v1/me").dispatch().await;
    assert_eq!(response.status(), Status::Unauthorized);
    let missing: AuthErrorResponse = response.into_json().await.expect("error body");

    let mut tampered = cookie.into_bytes();
    let last = tampered.len() - 1;
    tampered[last] = if tampered[last] == b'A' { b'B' } else { b'A' };
    let tampered = String::from_utf8(tampered).expect("ascii cookie");

    let response = client
        .get("/api/v1/me")
        .cookie(Cookie::new(SESSION, tampered))
        .dispatch()
        .await;
    assert_eq!(response.status(), Status::Unauthorized);
    let rejected: AuthErrorResponse = response.into_json().await.expect("error body");
    assert_eq!(missing.message, rejected.message);
}

#[tokio::test]
async fn password_reset_round_trip() {
    let notifier = Arc::new(RecordingNotifier::new());
    let client = client(notifier.clone()).await;
    register_and_confirm(&client, &notifier).await;

    let response = client
        .post("/api/v1/auth/forgot-password")
        .json(&json!({ "email": "unknown@example.com" }))
        .dispatch()
        .await;
    assert_eq!(response.status(), Status::Ok);
    assert!(notifier.last_code(VerificationKind::PasswordReset).is_none());

    let response = client
        .post("/api/v1/auth/forgot-password")
        .json(&json!({ "email": EMAIL }))
        .dispatch()
        .await;
    assert_eq!(response.status(), Status::Ok);
    let token = notifier
        .last_code(VerificationKind::PasswordReset)
        .expect("reset token sent");

    let response = client
        .post("/api/v1/auth/reset-password")
        .json(&json!({ "token": token, "password": "a brand new secret" }))
        .dispatch()
        .await;
    assert_eq!(response.status(), Status::Ok);

    let response = client
        .post("/api/v1/auth/login")
        .json(&json!({ "email": EMAIL, "password": PASSWORD }))
        .dispatch()
        .await;
    assert_eq!(response.status(), Status::Unauthorized);

    login(&client, EMAIL, "a brand new secret").await;
}

#[tokio::test]
async fn wrong_otp_and_duplicate_registration() {
    let notifier = Arc::new(RecordingNotifier::new());
    let client = client(notifier.clone()).await;
    register_and_confirm(&client, &notifier).await;

    let response = client
        .post("/api/v1/auth/register")
        .json(&json!({ "email": EMAIL.to_uppercase(), "password": PASSWORD }))
        .dispatch()
        .await;
    assert_eq!(response.status(), Status::Conflict);

    let response = client
        .post("/api/v1/auth/verify-otp")
        .json(&json!({ "email": EMAIL, "otp": "000000" }))
        .dispatch()
        .await;
    assert_eq!(response.status(), Status::NotFound);
    assert!(response.cookies().get(SESSION).is_none());
}
