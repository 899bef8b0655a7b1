use std::sync::Arc;

use uuid::Uuid;

use crate::auth::jwt::{Claims, CredentialIssuer, JwtKeys, TokenKind};
use crate::auth::{AuthError, AuthResult, RefreshTokenStore};

#[derive(Debug, Clone)]
pub struct ValidatedCredential {
    pub subject: Uuid,
    pub claims: Claims,
}

fn verify_with(keys: &JwtKeys, token: &str) -> AuthResult<ValidatedCredential> {
    let claims = keys.verify(token).map_err(|err| {
        log::debug!("{:?} credential rejected: {}", keys.kind(), err);
        AuthError::Unauthorized
    })?;

    if claims.typ != keys.kind() {
        log::debug!("credential presented as {:?} but minted as {:?}", keys.kind(), claims.typ);
        return Err(AuthError::Unauthorized);
    }

    let subject = claims.sub.parse::<Uuid>().map_err(|_| AuthError::Unauthorized)?;
    Ok(ValidatedCredential { subject, claims })
}

/// Signature and expiry check for access credentials.
#[derive(Clone)]
pub struct AccessTokenValidator {
    issuer: Arc<CredentialIssuer>,
}

impl AccessTokenValidator {
    pub fn new(issuer: Arc<CredentialIssuer>) -> Self {
        Self { issuer }
    }

    pub fn validate(&self, token: &str) -> AuthResult<ValidatedCredential> {
        verify_with(self.issuer.access_keys(), token)
    }
}

/// Signature and expiry check for refresh credentials, cross-checked
/// against the stored hash of the identity's live session.
#[derive(Clone)]
pub struct RefreshTokenValidator {
    issuer: Arc<CredentialIssuer>,
    store: RefreshTokenStore,
}

impl RefreshTokenValidator {
    pub fn new(issuer: Arc<CredentialIssuer>, store: RefreshTokenStore) -> Self {
        Self { issuer, store }
    }

    pub async fn validate(&self, token: &str) -> AuthResult<ValidatedCredential> {
        let validated = verify_with(self.issuer.refresh_keys(), token)?;
        self.store.validate(validated.subject, token).await?;
        Ok(validated)
    }
}
