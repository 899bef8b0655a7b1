use std::marker::PhantomData;

use chrono::Utc;
use rocket::Request;
use rocket::State;
use rocket::http::Status;
use rocket::request::{FromRequest, Outcome};
use rocket_okapi::r#gen::OpenApiGenerator;
use rocket_okapi::request::{OpenApiFromRequest, RequestHeaderInput};

use crate::auth::gate::{Authenticated, Principal, RouteMeta, RoutePolicy, is_mutating};
use crate::auth::responses::Role;
use crate::auth::{AuthError, AuthResult, AuthState};

/// Any authenticated identity.
pub struct AnyIdentity;

impl RoutePolicy for AnyIdentity {
    const META: RouteMeta = RouteMeta::authenticated();
}

pub struct AdminOnly;

impl RoutePolicy for AdminOnly {
    const META: RouteMeta = RouteMeta::authenticated().roles(&[Role::Admin]);
}

/// Anonymous access allowed; a valid session is still picked up.
pub struct PublicRoute;

impl RoutePolicy for PublicRoute {
    const META: RouteMeta = RouteMeta::public();
}

/// Logging out must work even after the access credential was revoked.
pub struct LogoutPolicy;

impl RoutePolicy for LogoutPolicy {
    const META: RouteMeta = RouteMeta::authenticated().skip_revocation();
}

pub struct RefreshPolicy;

impl RoutePolicy for RefreshPolicy {
    const META: RouteMeta = RouteMeta::authenticated()
        .refresh_credential()
        .skip_revocation();
}

/// Rejection of the gate for the current request, read back by catchers.
#[derive(Debug, Clone, Default)]
pub struct GateRejection(pub Option<(Status, String)>);

/// Request guard running the session pipeline under policy `P`.
pub struct Gate<P: RoutePolicy> {
    auth: Option<Authenticated>,
    _policy: PhantomData<fn() -> P>,
}

impl<P: RoutePolicy> Gate<P> {
    /// The session; always present on non-public routes.
    pub fn session(&self) -> AuthResult<&Authenticated> {
        self.auth.as_ref().ok_or(AuthError::Unauthorized)
    }

    pub fn principal(&self) -> Option<&Principal> {
        self.auth.as_ref().map(|auth| &auth.principal)
    }
}

#[rocket::async_trait]
impl<'r, P: RoutePolicy> FromRequest<'r> for Gate<P> {
    type Error = AuthError;

    async fn from_request(request: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        let state = match request.guard::<&State<AuthState>>().await {
            Outcome::Success(state) => state,
            _ => return reject(request, AuthError::Config("AuthState not available".into())),
        };

        let cookie = request
            .cookies()
            .get(&state.config.session_cookie_name)
            .map(|cookie| cookie.value().to_string());

        match state
            .gate
            .evaluate(&P::META, is_mutating(request.method()), cookie.as_deref(), Utc::now())
            .await
        {
            Ok(auth) => Outcome::Success(Gate {
                auth,
                _policy: PhantomData,
            }),
            Err(err) => reject(request, err),
        }
    }
}

fn reject<S>(request: &Request<'_>, err: AuthError) -> Outcome<S, AuthError> {
    let status = err.status();
    let message = err.public_message();
    request.local_cache(|| GateRejection(Some((status, message))));
    Outcome::Error((status, err))
}

impl<'r, P: RoutePolicy> OpenApiFromRequest<'r> for Gate<P> {
    fn from_request_input(
        _gen: &mut OpenApiGenerator,
        _name: String,
        _required: bool,
    ) -> rocket_okapi::Result<RequestHeaderInput> {
        Ok(RequestHeaderInput::None)
    }
}
