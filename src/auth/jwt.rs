use chrono::{DateTime, Duration, TimeZone, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::auth::{AuthConfig, AuthResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenKind {
    Access,
    Refresh,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub iss: String,
    pub iat: i64,
    pub exp: i64,
    pub jti: String,
    pub typ: TokenKind,
}

impl Claims {
    pub fn expires_at(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(self.exp, 0)
            .single()
            .unwrap_or_else(Utc::now)
    }
}

#[derive(Debug, Clone)]
pub struct SignedToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CredentialPair {
    pub access: SignedToken,
    pub refresh: SignedToken,
}

/// Clock skew tolerated past `exp` when verifying.
pub const VALIDATION_LEEWAY_SECS: u64 = 30;

/// Signing and verification material for one token kind.
pub struct JwtKeys {
    kind: TokenKind,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    issuer: String,
    ttl: Duration,
}

impl JwtKeys {
    pub fn new(kind: TokenKind, secret: &str, issuer: &str, ttl_secs: i64) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[issuer]);
        validation.set_required_spec_claims(&["exp", "iss", "sub"]);
        validation.leeway = VALIDATION_LEEWAY_SECS;

        Self {
            kind,
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
            issuer: issuer.to_string(),
            ttl: Duration::seconds(ttl_secs),
        }
    }

    pub fn kind(&self) -> TokenKind {
        self.kind
    }

    pub fn leeway(&self) -> Duration {
        Duration::seconds(self.validation.leeway as i64)
    }

    /// Last instant at which `claims` still pass verification.
    pub fn accepted_until(&self, claims: &Claims) -> DateTime<Utc> {
        claims.expires_at() + self.leeway()
    }

    pub fn sign(&self, subject: Uuid, now: DateTime<Utc>) -> AuthResult<SignedToken> {
        let expires_at = now + self.ttl;
        let claims = Claims {
            sub: subject.to_string(),
            iss: self.issuer.clone(),
            iat: now.timestamp(),
            exp: expires_at.timestamp(),
            jti: Uuid::new_v4().to_string(),
            typ: self.kind,
        };

        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)?;
        Ok(SignedToken { token, expires_at })
    }

    /// Verifies signature, issuer and expiry. The caller checks `typ`.
    pub fn verify(&self, token: &str) -> Result<Claims, jsonwebtoken::errors::Error> {
        decode::<Claims>(token, &self.decoding_key, &self.validation).map(|data| data.claims)
    }
}

/// Mints access and refresh credentials, each under its own secret.
///
/// Minting has no side effects; committing the refresh hash is a separate
/// step owned by the caller.
pub struct CredentialIssuer {
    access: JwtKeys,
    refresh: JwtKeys,
}

impl CredentialIssuer {
    pub fn from_config(config: &AuthConfig) -> Self {
        Self {
            access: JwtKeys::new(
                TokenKind::Access,
                &config.access_token_secret,
                &config.issuer,
                config.access_token_ttl_secs,
            ),
            refresh: JwtKeys::new(
                TokenKind::Refresh,
                &config.refresh_token_secret,
                &config.issuer,
                config.refresh_token_ttl_secs,
            ),
        }
    }

    pub fn issue_pair(&self, subject: Uuid) -> AuthResult<CredentialPair> {
        self.issue_pair_at(subject, Utc::now())
    }

    pub fn issue_pair_at(&self, subject: Uuid, now: DateTime<Utc>) -> AuthResult<CredentialPair> {
        Ok(CredentialPair {
            access: self.access.sign(subject, now)?,
            refresh: self.refresh.sign(subject, now)?,
        })
    }

    pub fn access_keys(&self) -> &JwtKeys {
        &self.access
    }

    pub fn refresh_keys(&self) -> &JwtKeys {
        &self.refresh
    }
}
