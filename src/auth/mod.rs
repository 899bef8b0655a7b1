//! Session and credential security: configuration, credential minting and
//! validation, refresh bookkeeping, revocation, the encrypted session
//! cookie, one-time codes, the request gate and the HTTP routes on top.

use std::sync::Arc;

use rocket_db_pools::sqlx::PgPool;

pub mod config;
pub mod error;
pub mod gate;
pub mod guards;
pub mod identity;
pub mod jwt;
pub mod notifier;
pub mod one_time_codes;
pub mod passwords;
pub mod refresh_store;
pub mod responses;
pub mod revocation;
pub mod routes;
pub mod service;
pub mod session_cookie;
pub mod validators;

pub use config::AuthConfig;
pub use error::{AuthError, AuthResult};
pub use gate::{Principal, RequestGate, RouteMeta, RoutePolicy};
pub use guards::Gate;
pub use identity::IdentityStore;
pub use jwt::CredentialIssuer;
pub use notifier::Notifier;
pub use one_time_codes::OneTimeCodeEngine;
pub use passwords::PasswordService;
pub use refresh_store::RefreshTokenStore;
pub use revocation::RevocationRegistry;
pub use session_cookie::SessionCookieCodec;

use identity::{MemoryIdentityStore, PgIdentityStore};
use notifier::LogNotifier;
use one_time_codes::{MemoryVerificationStore, PgVerificationStore, VerificationStore};
use refresh_store::{MemoryRefreshHashStore, PgRefreshHashStore, RefreshHashStore};
use revocation::{MemoryRevocationRegistry, PgRevocationRegistry};
use validators::{AccessTokenValidator, RefreshTokenValidator};

/// Storage and delivery collaborators the core is wired against.
#[derive(Clone)]
pub struct AuthBackends {
    pub identities: Arc<dyn IdentityStore>,
    pub refresh_hashes: Arc<dyn RefreshHashStore>,
    pub revocation: Arc<dyn RevocationRegistry>,
    pub verification: Arc<dyn VerificationStore>,
    pub notifier: Arc<dyn Notifier>,
}

impl AuthBackends {
    pub fn postgres(pool: PgPool) -> Self {
        Self {
            identities: Arc::new(PgIdentityStore::new(pool.clone())),
            refresh_hashes: Arc::new(PgRefreshHashStore::new(pool.clone())),
            revocation: Arc::new(PgRevocationRegistry::new(pool.clone())),
            verification: Arc::new(PgVerificationStore::new(pool)),
            notifier: Arc::new(LogNotifier),
        }
    }

    pub fn memory() -> Self {
        Self {
            identities: Arc::new(MemoryIdentityStore::new()),
            refresh_hashes: Arc::new(MemoryRefreshHashStore::new()),
            revocation: Arc::new(MemoryRevocationRegistry::new()),
            verification: Arc::new(MemoryVerificationStore::new()),
            notifier: Arc::new(LogNotifier),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }
}

#[derive(Clone)]
pub struct AuthState {
    pub config: Arc<AuthConfig>,
    pub passwords: PasswordService,
    pub issuer: Arc<CredentialIssuer>,
    pub refresh_store: RefreshTokenStore,
    pub revocation: Arc<dyn RevocationRegistry>,
    pub codes: OneTimeCodeEngine,
    pub identities: Arc<dyn IdentityStore>,
    pub notifier: Arc<dyn Notifier>,
    pub codec: SessionCookieCodec,
    pub gate: RequestGate,
}

impl AuthState {
    pub fn new(config: AuthConfig, backends: AuthBackends) -> AuthResult<Self> {
        let passwords = PasswordService::from_config(&config)?;
        let issuer = Arc::new(CredentialIssuer::from_config(&config));
        let refresh_store = RefreshTokenStore::new(backends.refresh_hashes, passwords.clone());
        let codec = SessionCookieCodec::from_config(&config);
        let gate = RequestGate::new(
            codec.clone(),
            backends.revocation.clone(),
            AccessTokenValidator::new(issuer.clone()),
            RefreshTokenValidator::new(issuer.clone(), refresh_store.clone()),
            backends.identities.clone(),
        );

        Ok(Self {
            config: Arc::new(config),
            passwords,
            issuer,
            refresh_store,
            revocation: backends.revocation,
            codes: OneTimeCodeEngine::new(backends.verification),
            identities: backends.identities,
            notifier: backends.notifier,
            codec,
            gate,
        })
    }
}
