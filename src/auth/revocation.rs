//! Registry of access credentials revoked before their natural expiry.
//!
//! Entries are keyed by a SHA-256 digest of the credential so the table
//! never holds a usable bearer token. An entry only matters until its own
//! expiry; past that the access validator rejects the credential anyway, so
//! purging is an optimisation.

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rocket_db_pools::sqlx::{self, PgPool};
use sha2::{Digest, Sha256};

use crate::auth::AuthResult;

#[rocket::async_trait]
pub trait RevocationRegistry: Send + Sync {
    async fn add(&self, credential: &str, expires_at: DateTime<Utc>) -> AuthResult<()>;

    async fn contains(&self, credential: &str, now: DateTime<Utc>) -> AuthResult<bool>;

    async fn purge_expired(&self, now: DateTime<Utc>) -> AuthResult<u64>;
}

pub fn credential_digest(credential: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(credential.as_bytes()))
}

#[derive(Debug, Clone)]
pub struct PgRevocationRegistry {
    pool: PgPool,
}

impl PgRevocationRegistry {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[rocket::async_trait]
impl RevocationRegistry for PgRevocationRegistry {
    async fn add(&self, credential: &str, expires_at: DateTime<Utc>) -> AuthResult<()> {
        sqlx::query(
            "INSERT INTO revoked_tokens (token_digest, expires_at) VALUES ($1, $2) \
             ON CONFLICT (token_digest) DO UPDATE SET expires_at = GREATEST(revoked_tokens.expires_at, EXCLUDED.expires_at)",
        )
        .bind(credential_digest(credential))
        .bind(expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn contains(&self, credential: &str, now: DateTime<Utc>) -> AuthResult<bool> {
        let found: Option<i32> = sqlx::query_scalar(
            "SELECT 1 FROM revoked_tokens WHERE token_digest = $1 AND expires_at > $2",
        )
        .bind(credential_digest(credential))
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        Ok(found.is_some())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> AuthResult<u64> {
        let result = sqlx::query("DELETE FROM revoked_tokens WHERE expires_at <= $1")
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[derive(Debug, Default)]
pub struct MemoryRevocationRegistry {
    entries: DashMap<String, DateTime<Utc>>,
}

impl MemoryRevocationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[rocket::async_trait]
impl RevocationRegistry for MemoryRevocationRegistry {
    async fn add(&self, credential: &str, expires_at: DateTime<Utc>) -> AuthResult<()> {
        self.entries
            .entry(credential_digest(credential))
            .and_modify(|existing| {
                if expires_at > *existing {
                    *existing = expires_at;
                }
            })
            .or_insert(expires_at);
        Ok(())
    }

    async fn contains(&self, credential: &str, now: DateTime<Utc>) -> AuthResult<bool> {
        Ok(self
            .entries
            .get(&credential_digest(credential))
            .map(|entry| *entry.value() > now)
            .unwrap_or(false))
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> AuthResult<u64> {
        let mut removed = 0u64;
        self.entries.retain(|_, expires_at| {
            let live = *expires_at > now;
            if !live {
                removed += 1;
            }
            live
        });
        Ok(removed)
    }
}
