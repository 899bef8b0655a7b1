use std::sync::Arc;

use dashmap::DashMap;
use rocket_db_pools::sqlx::{self, PgPool};
use uuid::Uuid;

use crate::auth::{AuthError, AuthResult, PasswordService};

/// Durable slot holding the one-way hash of an identity's live refresh
/// credential. `None` means no active session.
#[rocket::async_trait]
pub trait RefreshHashStore: Send + Sync {
    async fn load_hash(&self, user_id: Uuid) -> AuthResult<Option<String>>;

    /// Overwrites the slot. Passing `None` clears it.
    async fn store_hash(&self, user_id: Uuid, hash: Option<String>) -> AuthResult<()>;
}

#[derive(Debug, Clone)]
pub struct PgRefreshHashStore {
    pool: PgPool,
}

impl PgRefreshHashStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[rocket::async_trait]
impl RefreshHashStore for PgRefreshHashStore {
    async fn load_hash(&self, user_id: Uuid) -> AuthResult<Option<String>> {
        let hash: Option<Option<String>> =
            sqlx::query_scalar("SELECT refresh_token_hash FROM users WHERE id = $1")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(hash.flatten())
    }

    async fn store_hash(&self, user_id: Uuid, hash: Option<String>) -> AuthResult<()> {
        sqlx::query("UPDATE users SET refresh_token_hash = $1, updated_at = now() WHERE id = $2")
            .bind(hash)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryRefreshHashStore {
    hashes: DashMap<Uuid, String>,
}

impl MemoryRefreshHashStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[rocket::async_trait]
impl RefreshHashStore for MemoryRefreshHashStore {
    async fn load_hash(&self, user_id: Uuid) -> AuthResult<Option<String>> {
        Ok(self.hashes.get(&user_id).map(|entry| entry.value().clone()))
    }

    async fn store_hash(&self, user_id: Uuid, hash: Option<String>) -> AuthResult<()> {
        match hash {
            Some(hash) => {
                self.hashes.insert(user_id, hash);
            }
            None => {
                self.hashes.remove(&user_id);
            }
        }
        Ok(())
    }
}

/// Single-session refresh credential bookkeeping.
///
/// `commit` replaces whatever hash was stored, so a new login invalidates
/// the previous refresh credential; `clear` makes logout stick even though
/// the signed token itself has not expired.
#[derive(Clone)]
pub struct RefreshTokenStore {
    backend: Arc<dyn RefreshHashStore>,
    hasher: PasswordService,
}

impl RefreshTokenStore {
    pub fn new(backend: Arc<dyn RefreshHashStore>, hasher: PasswordService) -> Self {
        Self { backend, hasher }
    }

    pub async fn commit(&self, user_id: Uuid, refresh_token: &str) -> AuthResult<()> {
        let hash = self.hasher.hash_blocking(refresh_token.to_string()).await?;
        self.backend.store_hash(user_id, Some(hash)).await
    }

    pub async fn validate(&self, user_id: Uuid, presented: &str) -> AuthResult<()> {
        let stored = self
            .backend
            .load_hash(user_id)
            .await?
            .filter(|hash| !hash.is_empty())
            .ok_or(AuthError::Unauthorized)?;

        match self
            .hasher
            .verify_blocking(presented.to_string(), stored)
            .await
        {
            Ok(true) => Ok(()),
            Ok(false) => Err(AuthError::Unauthorized),
            Err(err @ AuthError::Join(_)) => Err(err),
            Err(err) => {
                log::warn!("stored refresh hash for {} is unreadable: {}", user_id, err);
                Err(AuthError::Unauthorized)
            }
        }
    }

    pub async fn clear(&self, user_id: Uuid) -> AuthResult<()> {
        self.backend.store_hash(user_id, None).await
    }
}
