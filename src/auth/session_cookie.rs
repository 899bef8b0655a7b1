//! Authenticated-encryption codec for the `session` cookie.
//!
//! Wire format, three base64url (no padding) segments joined by `.`:
//!
//! ```text
//! header . nonce . ciphertext||tag
//! ```
//!
//! The header is JSON `{"alg":"dir","enc":"A256GCM","iat":..,"exp":..}` and
//! is fed to AES-256-GCM as associated data, so the validity window cannot be
//! altered without breaking the tag. The plaintext is the JSON
//! [`SessionPayload`].

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::auth::config::{AuthConfig, COOKIE_KEY_LEN};

const NONCE_LEN: usize = 12;
const ALG: &str = "dir";
const ENC: &str = "A256GCM";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CookieError {
    #[error("session cookie is malformed")]
    Malformed,
    #[error("session cookie failed authentication")]
    Tampered,
    #[error("session cookie has expired")]
    Expired,
    #[error("session cookie could not be sealed")]
    Seal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionPayload {
    pub access_token: String,
    pub refresh_token: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct EnvelopeHeader {
    alg: String,
    enc: String,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Clone)]
pub struct SealedCookie {
    pub value: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct SessionCookieCodec {
    cipher: Aes256Gcm,
    ttl: Duration,
}

impl SessionCookieCodec {
    pub fn new(key: &[u8; COOKIE_KEY_LEN], ttl: Duration) -> Self {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
        Self { cipher, ttl }
    }

    pub fn from_config(config: &AuthConfig) -> Self {
        Self::new(&config.cookie_key, Duration::seconds(config.session_ttl_secs))
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn encode(
        &self,
        payload: &SessionPayload,
        now: DateTime<Utc>,
    ) -> Result<SealedCookie, CookieError> {
        let expires_at = now + self.ttl;
        let header = EnvelopeHeader {
            alg: ALG.into(),
            enc: ENC.into(),
            iat: now.timestamp(),
            exp: expires_at.timestamp(),
        };
        let header_bytes = serde_json::to_vec(&header).map_err(|_| CookieError::Seal)?;
        let plaintext = serde_json::to_vec(payload).map_err(|_| CookieError::Seal)?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: &plaintext,
                    aad: &header_bytes,
                },
            )
            .map_err(|_| CookieError::Seal)?;

        let value = format!(
            "{}.{}.{}",
            URL_SAFE_NO_PAD.encode(&header_bytes),
            URL_SAFE_NO_PAD.encode(nonce_bytes),
            URL_SAFE_NO_PAD.encode(&ciphertext)
        );

        Ok(SealedCookie { value, expires_at })
    }

    pub fn decode(&self, value: &str, now: DateTime<Utc>) -> Result<SessionPayload, CookieError> {
        let mut segments = value.split('.');
        let (Some(header_b64), Some(nonce_b64), Some(body_b64), None) = (
            segments.next(),
            segments.next(),
            segments.next(),
            segments.next(),
        ) else {
            return Err(CookieError::Malformed);
        };

        let header_bytes = decode_segment(header_b64)?;
        let nonce_bytes = decode_segment(nonce_b64)?;
        let ciphertext = decode_segment(body_b64)?;
        if nonce_bytes.len() != NONCE_LEN {
            return Err(CookieError::Malformed);
        }

        let plaintext = self
            .cipher
            .decrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: &ciphertext,
                    aad: &header_bytes,
                },
            )
            .map_err(|_| CookieError::Tampered)?;

        let header: EnvelopeHeader =
            serde_json::from_slice(&header_bytes).map_err(|_| CookieError::Malformed)?;
        if header.alg != ALG || header.enc != ENC {
            return Err(CookieError::Malformed);
        }
        if now.timestamp() >= header.exp {
            return Err(CookieError::Expired);
        }

        serde_json::from_slice(&plaintext).map_err(|_| CookieError::Malformed)
    }
}

fn decode_segment(segment: &str) -> Result<Vec<u8>, CookieError> {
    if segment.is_empty() {
        return Err(CookieError::Malformed);
    }
    URL_SAFE_NO_PAD
        .decode(segment)
        .map_err(|_| CookieError::Malformed)
}
