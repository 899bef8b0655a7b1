use chrono::Utc;
use rocket::http::{Cookie, CookieJar, SameSite, Status};
use rocket::response::status;
use rocket::serde::json::Json;
use rocket::{Request, State, catch, post};
use rocket_okapi::okapi::schemars::JsonSchema;
use rocket_okapi::openapi;
use time::Duration as TimeDuration;

use crate::auth::guards::{Gate, GateRejection, LogoutPolicy, PublicRoute, RefreshPolicy};
use crate::auth::responses::{
    CodeIssuedResponse, ForgotPasswordRequest, LoginRequest, MessageResponse, RegisterRequest,
    ResetPasswordRequest, SessionResponse, TokenRequest, UserSummary, VerifyOtpRequest,
};
use crate::auth::service::SessionGrant;
use crate::auth::{AuthError, AuthState};

pub type AuthRouteResult<T> = Result<Json<T>, status::Custom<Json<AuthErrorResponse>>>;

#[derive(Debug, serde::Serialize, serde::Deserialize, JsonSchema)]
pub struct AuthErrorResponse {
    pub status: u16,
    pub message: String,
}

#[openapi(tag = "Auth")]
#[post("/auth/register", data = "<payload>")]
pub async fn register(
    state: &State<AuthState>,
    _gate: Gate<PublicRoute>,
    payload: Json<RegisterRequest>,
) -> Result<status::Custom<Json<UserSummary>>, status::Custom<Json<AuthErrorResponse>>> {
    let identity = state
        .register(payload.into_inner(), Utc::now())
        .await
        .map_err(respond_error)?;
    Ok(status::Custom(Status::Created, Json(identity.summary())))
}

#[openapi(tag = "Auth")]
#[post("/auth/confirm-email", data = "<payload>")]
pub async fn confirm_email(
    state: &State<AuthState>,
    _gate: Gate<PublicRoute>,
    payload: Json<TokenRequest>,
) -> AuthRouteResult<MessageResponse> {
    state
        .confirm_email(&payload.token, Utc::now())
        .await
        .map_err(respond_error)?;
    Ok(Json(MessageResponse::new("email confirmed")))
}

#[openapi(tag = "Auth")]
#[post("/auth/request-otp", data = "<payload>")]
pub async fn request_otp(
    state: &State<AuthState>,
    _gate: Gate<PublicRoute>,
    payload: Json<LoginRequest>,
) -> AuthRouteResult<CodeIssuedResponse> {
    let expires_at = state
        .request_otp(&payload.email, &payload.password, Utc::now())
        .await
        .map_err(respond_error)?;
    Ok(Json(CodeIssuedResponse { expires_at }))
}

#[openapi(tag = "Auth")]
#[post("/auth/verify-otp", data = "<payload>")]
pub async fn verify_otp(
    state: &State<AuthState>,
    cookies: &CookieJar<'_>,
    _gate: Gate<PublicRoute>,
    payload: Json<VerifyOtpRequest>,
) -> AuthRouteResult<SessionResponse> {
    let grant = state
        .verify_otp(&payload.email, &payload.otp, Utc::now())
        .await
        .map_err(respond_error)?;
    Ok(Json(set_session_cookie(cookies, state, &grant)))
}

#[openapi(tag = "Auth")]
#[post("/auth/login", data = "<payload>")]
pub async fn login(
    state: &State<AuthState>,
    cookies: &CookieJar<'_>,
    _gate: Gate<PublicRoute>,
    payload: Json<LoginRequest>,
) -> AuthRouteResult<SessionResponse> {
    let email = payload.email.trim();
    if email.is_empty() || payload.password.is_empty() {
        return Err(respond_error(AuthError::BadRequest(
            "email and password are required".into(),
        )));
    }

    let grant = state
        .login(email, &payload.password, Utc::now())
        .await
        .map_err(respond_error)?;
    Ok(Json(set_session_cookie(cookies, state, &grant)))
}

#[openapi(tag = "Auth")]
#[post("/auth/refresh")]
pub async fn refresh(
    state: &State<AuthState>,
    cookies: &CookieJar<'_>,
    gate: Gate<RefreshPolicy>,
) -> AuthRouteResult<SessionResponse> {
    let auth = gate.session().map_err(respond_error)?;
    let grant = state
        .refresh(auth, Utc::now())
        .await
        .map_err(respond_error)?;
    Ok(Json(set_session_cookie(cookies, state, &grant)))
}

#[openapi(tag = "Auth")]
#[post("/auth/logout")]
pub async fn logout(
    state: &State<AuthState>,
    cookies: &CookieJar<'_>,
    gate: Gate<LogoutPolicy>,
) -> AuthRouteResult<MessageResponse> {
    let auth = gate.session().map_err(respond_error)?;
    state.logout(auth).await.map_err(respond_error)?;
    clear_session_cookie(cookies, state);
    Ok(Json(MessageResponse::new("logged out")))
}

#[openapi(tag = "Auth")]
#[post("/auth/forgot-password", data = "<payload>")]
pub async fn forgot_password(
    state: &State<AuthState>,
    _gate: Gate<PublicRoute>,
    payload: Json<ForgotPasswordRequest>,
) -> AuthRouteResult<MessageResponse> {
    state
        .forgot_password(&payload.email, Utc::now())
        .await
        .map_err(respond_error)?;
    Ok(Json(MessageResponse::new(
        "if the address is registered, a reset link is on its way",
    )))
}

#[openapi(tag = "Auth")]
#[post("/auth/reset-password", data = "<payload>")]
pub async fn reset_password(
    state: &State<AuthState>,
    _gate: Gate<PublicRoute>,
    payload: Json<ResetPasswordRequest>,
) -> AuthRouteResult<MessageResponse> {
    let ResetPasswordRequest { token, password } = payload.into_inner();
    state
        .reset_password(&token, password, Utc::now())
        .await
        .map_err(respond_error)?;
    Ok(Json(MessageResponse::new("password updated")))
}

fn set_session_cookie(
    cookies: &CookieJar<'_>,
    state: &State<AuthState>,
    grant: &SessionGrant,
) -> SessionResponse {
    let mut cookie = Cookie::build((
        state.config.session_cookie_name.clone(),
        grant.cookie.value.clone(),
    ))
    .path("/")
    .http_only(true)
    .same_site(SameSite::Lax)
    .secure(state.config.cookie_secure)
    .max_age(TimeDuration::seconds(state.config.session_ttl_secs))
    .build();

    if let Some(domain) = &state.config.cookie_domain {
        cookie.set_domain(domain.clone());
    }

    cookies.add(cookie);
    grant.response()
}

fn clear_session_cookie(cookies: &CookieJar<'_>, state: &State<AuthState>) {
    let mut cookie = Cookie::build(state.config.session_cookie_name.clone())
        .path("/")
        .build();
    if let Some(domain) = &state.config.cookie_domain {
        cookie.set_domain(domain.clone());
    }
    cookies.remove(cookie);
}

pub fn respond_error(err: AuthError) -> status::Custom<Json<AuthErrorResponse>> {
    let status = err.status();
    status::Custom(
        status,
        Json(AuthErrorResponse {
            status: status.code,
            message: err.public_message(),
        }),
    )
}

fn respond_message(
    status: Status,
    message: impl Into<String>,
) -> status::Custom<Json<AuthErrorResponse>> {
    status::Custom(
        status,
        Json(AuthErrorResponse {
            status: status.code,
            message: message.into(),
        }),
    )
}

fn rejection_or(request: &Request<'_>, status: Status, fallback: &str) -> status::Custom<Json<AuthErrorResponse>> {
    match &request.local_cache(GateRejection::default).0 {
        Some((cached, message)) if *cached == status => respond_message(status, message.clone()),
        _ => respond_message(status, fallback),
    }
}

#[catch(400)]
pub fn bad_request(request: &Request<'_>) -> status::Custom<Json<AuthErrorResponse>> {
    rejection_or(request, Status::BadRequest, "malformed request")
}

#[catch(401)]
pub fn unauthorized(request: &Request<'_>) -> status::Custom<Json<AuthErrorResponse>> {
    rejection_or(
        request,
        Status::Unauthorized,
        crate::auth::error::UNAUTHORIZED_MESSAGE,
    )
}

#[catch(403)]
pub fn forbidden(request: &Request<'_>) -> status::Custom<Json<AuthErrorResponse>> {
    rejection_or(request, Status::Forbidden, "forbidden")
}

#[catch(404)]
pub fn not_found(_request: &Request<'_>) -> status::Custom<Json<AuthErrorResponse>> {
    respond_message(Status::NotFound, "not found")
}

#[catch(422)]
pub fn unprocessable(_request: &Request<'_>) -> status::Custom<Json<AuthErrorResponse>> {
    respond_message(Status::UnprocessableEntity, "request body could not be parsed")
}

#[catch(500)]
pub fn internal_error(_request: &Request<'_>) -> status::Custom<Json<AuthErrorResponse>> {
    respond_message(Status::InternalServerError, "internal server error")
}
