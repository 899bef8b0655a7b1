//! Per-request authentication pipeline.
//!
//! ```text
//! Start -> CookieDecoded -> [RevocationChecked] -> CredentialValidated
//!       -> IdentityResolved -> RoleChecked -> Dispatch
//! ```
//!
//! `RevocationChecked` only runs for mutating requests on routes that do not
//! opt out. Every stage can short-circuit with a rejection; on public routes
//! a rejection degrades to an anonymous request instead.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::auth::identity::IdentityStore;
use crate::auth::responses::Role;
use crate::auth::revocation::RevocationRegistry;
use crate::auth::session_cookie::{SessionCookieCodec, SessionPayload};
use crate::auth::validators::{AccessTokenValidator, RefreshTokenValidator, ValidatedCredential};
use crate::auth::{AuthError, AuthResult};

/// Which credential of the session a route authenticates with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialKind {
    Access,
    Refresh,
}

/// Declarative access policy attached to a route.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteMeta {
    /// No authentication required; a valid session is still resolved.
    pub public: bool,
    /// Mutating requests skip the revocation registry.
    pub skip_revocation: bool,
    pub credential: CredentialKind,
    /// Empty means any authenticated identity.
    pub roles: &'static [Role],
}

impl RouteMeta {
    pub const fn authenticated() -> Self {
        Self {
            public: false,
            skip_revocation: false,
            credential: CredentialKind::Access,
            roles: &[],
        }
    }

    pub const fn public() -> Self {
        Self {
            public: true,
            ..Self::authenticated()
        }
    }

    pub const fn skip_revocation(self) -> Self {
        Self {
            skip_revocation: true,
            ..self
        }
    }

    pub const fn refresh_credential(self) -> Self {
        Self {
            credential: CredentialKind::Refresh,
            ..self
        }
    }

    pub const fn roles(self, roles: &'static [Role]) -> Self {
        Self { roles, ..self }
    }
}

/// Marker types carry a route's policy at the type level so handlers
/// declare it in their signature.
pub trait RoutePolicy: Send + Sync + 'static {
    const META: RouteMeta;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateStage {
    Start,
    CookieDecoded,
    RevocationChecked,
    CredentialValidated,
    IdentityResolved,
    RoleChecked,
    Dispatch,
}

/// Minimal identity context handed to handlers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub id: Uuid,
    pub role: Role,
}

impl Principal {
    pub fn roles(&self) -> &[Role] {
        std::slice::from_ref(&self.role)
    }
}

#[derive(Debug, Clone)]
pub struct Authenticated {
    pub principal: Principal,
    pub session: SessionPayload,
    pub credential: ValidatedCredential,
}

/// Pass iff nothing is required or the held roles intersect the required
/// ones.
pub fn role_gate(required: &[Role], held: &[Role]) -> AuthResult<()> {
    if required.is_empty() || required.iter().any(|role| held.contains(role)) {
        Ok(())
    } else {
        Err(AuthError::Forbidden {
            required: required.to_vec(),
        })
    }
}

/// Read-only methods bypass the revocation registry.
pub fn is_mutating(method: rocket::http::Method) -> bool {
    use rocket::http::Method;
    !matches!(method, Method::Get | Method::Head | Method::Options)
}

#[derive(Clone)]
pub struct RequestGate {
    codec: SessionCookieCodec,
    revocation: Arc<dyn RevocationRegistry>,
    access: AccessTokenValidator,
    refresh: RefreshTokenValidator,
    identities: Arc<dyn IdentityStore>,
}

impl RequestGate {
    pub fn new(
        codec: SessionCookieCodec,
        revocation: Arc<dyn RevocationRegistry>,
        access: AccessTokenValidator,
        refresh: RefreshTokenValidator,
        identities: Arc<dyn IdentityStore>,
    ) -> Self {
        Self {
            codec,
            revocation,
            access,
            refresh,
            identities,
        }
    }

    /// Runs the pipeline for one request.
    ///
    /// `Ok(None)` is an anonymous request on a public route.
    pub async fn evaluate(
        &self,
        meta: &RouteMeta,
        mutating: bool,
        cookie: Option<&str>,
        now: DateTime<Utc>,
    ) -> AuthResult<Option<Authenticated>> {
        let mut stage = GateStage::Start;
        match self.run(meta, mutating, cookie, now, &mut stage).await {
            Ok(authenticated) => Ok(Some(authenticated)),
            Err(err) if meta.public && !is_infrastructure(&err) => {
                log::debug!("public route continuing anonymously after {:?}: {}", stage, err);
                Ok(None)
            }
            Err(err) => {
                log::debug!("request rejected after {:?}: {}", stage, err);
                Err(err)
            }
        }
    }

    async fn run(
        &self,
        meta: &RouteMeta,
        mutating: bool,
        cookie: Option<&str>,
        now: DateTime<Utc>,
        stage: &mut GateStage,
    ) -> AuthResult<Authenticated> {
        let session = cookie
            .and_then(|value| match self.codec.decode(value, now) {
                Ok(session) => Some(session),
                Err(err) => {
                    log::debug!("ignoring session cookie: {}", err);
                    None
                }
            })
            .ok_or(AuthError::Unauthorized)?;
        *stage = GateStage::CookieDecoded;

        if mutating && !meta.skip_revocation {
            if self.revocation.contains(&session.access_token, now).await? {
                return Err(AuthError::Unauthorized);
            }
            *stage = GateStage::RevocationChecked;
        }

        let credential = match meta.credential {
            CredentialKind::Access => self.access.validate(&session.access_token)?,
            CredentialKind::Refresh => self.refresh.validate(&session.refresh_token).await?,
        };
        *stage = GateStage::CredentialValidated;

        let identity = self
            .identities
            .find_by_id(credential.subject)
            .await?
            .ok_or(AuthError::Unauthorized)?;
        let principal = Principal {
            id: identity.id,
            role: identity.role,
        };
        *stage = GateStage::IdentityResolved;

        if !meta.public {
            role_gate(meta.roles, principal.roles())?;
        }
        *stage = GateStage::RoleChecked;

        *stage = GateStage::Dispatch;
        Ok(Authenticated {
            principal,
            session,
            credential,
        })
    }
}

fn is_infrastructure(err: &AuthError) -> bool {
    err.status().code >= 500
}
