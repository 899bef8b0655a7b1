//! Short-lived, single-use verification codes.
//!
//! A record is consumable iff it is unused and `now < expires_at`. The flip
//! to `used` happens in the same conditional write that checks those two
//! facts, so two concurrent consumers of one code cannot both succeed.

use std::collections::HashMap;
use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use rand::rngs::OsRng;
use rand::{Rng, RngCore};
use rocket_db_pools::sqlx::{self, PgPool};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::auth::{AuthError, AuthResult};

const OTP_DIGITS: u32 = 6;
const TOKEN_BYTES: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VerificationKind {
    RegistrationEmail,
    PasswordReset,
    PhoneOtp,
}

impl VerificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerificationKind::RegistrationEmail => "registration_email",
            VerificationKind::PasswordReset => "password_reset",
            VerificationKind::PhoneOtp => "phone_otp",
        }
    }

    /// Numeric codes are typed by a person; the rest travel inside links.
    pub fn is_numeric(&self) -> bool {
        matches!(self, VerificationKind::PhoneOtp)
    }
}

#[derive(Debug, Clone)]
pub struct VerificationRecord {
    pub id: Uuid,
    pub identity_id: Uuid,
    pub kind: VerificationKind,
    pub code_digest: String,
    pub used: bool,
    pub used_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl VerificationRecord {
    pub fn is_consumable(&self, now: DateTime<Utc>) -> bool {
        !self.used && now < self.expires_at
    }
}

/// A freshly issued record plus the plaintext code, which is never stored.
#[derive(Debug, Clone)]
pub struct IssuedCode {
    pub record: VerificationRecord,
    pub code: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeOutcome {
    Consumed,
    Expired,
    NotFound,
}

#[rocket::async_trait]
pub trait VerificationStore: Send + Sync {
    async fn insert(&self, record: &VerificationRecord) -> AuthResult<()>;

    /// Atomically flips `used` on a matching consumable record.
    async fn consume(
        &self,
        identity_id: Uuid,
        kind: VerificationKind,
        code_digest: &str,
        now: DateTime<Utc>,
    ) -> AuthResult<ConsumeOutcome>;

    /// Owner of an unused record with this digest, expired or not.
    async fn find_owner(
        &self,
        kind: VerificationKind,
        code_digest: &str,
    ) -> AuthResult<Option<Uuid>>;

    /// Drops records that expired or were used before `cutoff`.
    async fn purge(&self, cutoff: DateTime<Utc>) -> AuthResult<u64>;
}

pub fn code_digest(code: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(code.trim().as_bytes()))
}

fn generate_code(kind: VerificationKind) -> String {
    if kind.is_numeric() {
        let upper = 10u32.pow(OTP_DIGITS);
        format!("{:0width$}", OsRng.gen_range(0..upper), width = OTP_DIGITS as usize)
    } else {
        let mut bytes = [0u8; TOKEN_BYTES];
        OsRng.fill_bytes(&mut bytes);
        URL_SAFE_NO_PAD.encode(bytes)
    }
}

#[derive(Clone)]
pub struct OneTimeCodeEngine {
    store: Arc<dyn VerificationStore>,
}

impl OneTimeCodeEngine {
    pub fn new(store: Arc<dyn VerificationStore>) -> Self {
        Self { store }
    }

    pub async fn issue(
        &self,
        identity_id: Uuid,
        kind: VerificationKind,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> AuthResult<IssuedCode> {
        let code = generate_code(kind);
        let record = VerificationRecord {
            id: Uuid::new_v4(),
            identity_id,
            kind,
            code_digest: code_digest(&code),
            used: false,
            used_at: None,
            expires_at: now + ttl,
            created_at: now,
        };
        self.store.insert(&record).await?;
        log::debug!("issued {} code {} for {}", kind.as_str(), record.id, identity_id);
        Ok(IssuedCode { record, code })
    }

    pub async fn consume(
        &self,
        identity_id: Uuid,
        kind: VerificationKind,
        presented: &str,
        now: DateTime<Utc>,
    ) -> AuthResult<()> {
        match self
            .store
            .consume(identity_id, kind, &code_digest(presented), now)
            .await?
        {
            ConsumeOutcome::Consumed => Ok(()),
            ConsumeOutcome::Expired => Err(AuthError::CodeExpired),
            ConsumeOutcome::NotFound => Err(AuthError::CodeNotFound),
        }
    }

    /// Consumes a link-style token when the caller does not know the owner.
    pub async fn consume_token(
        &self,
        kind: VerificationKind,
        token: &str,
        now: DateTime<Utc>,
    ) -> AuthResult<Uuid> {
        let owner = self
            .store
            .find_owner(kind, &code_digest(token))
            .await?
            .ok_or(AuthError::CodeNotFound)?;
        self.consume(owner, kind, token, now).await?;
        Ok(owner)
    }

    pub async fn purge_expired(&self, now: DateTime<Utc>) -> AuthResult<u64> {
        self.store.purge(now - Duration::days(1)).await
    }
}

#[derive(Debug, Clone)]
pub struct PgVerificationStore {
    pool: PgPool,
}

impl PgVerificationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[rocket::async_trait]
impl VerificationStore for PgVerificationStore {
    async fn insert(&self, record: &VerificationRecord) -> AuthResult<()> {
        sqlx::query(
            "INSERT INTO verification_codes (id, identity_id, kind, code_digest, used, used_at, expires_at, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(record.id)
        .bind(record.identity_id)
        .bind(record.kind.as_str())
        .bind(&record.code_digest)
        .bind(record.used)
        .bind(record.used_at)
        .bind(record.expires_at)
        .bind(record.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn consume(
        &self,
        identity_id: Uuid,
        kind: VerificationKind,
        code_digest: &str,
        now: DateTime<Utc>,
    ) -> AuthResult<ConsumeOutcome> {
        let flipped: Option<Uuid> = sqlx::query_scalar(
            "UPDATE verification_codes SET used = TRUE, used_at = $4 \
             WHERE identity_id = $1 AND kind = $2 AND code_digest = $3 \
             AND used = FALSE AND expires_at > $4 \
             RETURNING id",
        )
        .bind(identity_id)
        .bind(kind.as_str())
        .bind(code_digest)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        if flipped.is_some() {
            return Ok(ConsumeOutcome::Consumed);
        }

        let expired: Option<i32> = sqlx::query_scalar(
            "SELECT 1 FROM verification_codes \
             WHERE identity_id = $1 AND kind = $2 AND code_digest = $3 \
             AND used = FALSE AND expires_at <= $4 LIMIT 1",
        )
        .bind(identity_id)
        .bind(kind.as_str())
        .bind(code_digest)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        Ok(if expired.is_some() {
            ConsumeOutcome::Expired
        } else {
            ConsumeOutcome::NotFound
        })
    }

    async fn find_owner(
        &self,
        kind: VerificationKind,
        code_digest: &str,
    ) -> AuthResult<Option<Uuid>> {
        let owner: Option<Uuid> = sqlx::query_scalar(
            "SELECT identity_id FROM verification_codes \
             WHERE kind = $1 AND code_digest = $2 AND used = FALSE \
             ORDER BY created_at DESC LIMIT 1",
        )
        .bind(kind.as_str())
        .bind(code_digest)
        .fetch_optional(&self.pool)
        .await?;
        Ok(owner)
    }

    async fn purge(&self, cutoff: DateTime<Utc>) -> AuthResult<u64> {
        let result = sqlx::query(
            "DELETE FROM verification_codes WHERE expires_at <= $1 OR (used AND used_at <= $1)",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[derive(Debug, Default)]
pub struct MemoryVerificationStore {
    records: Mutex<HashMap<Uuid, VerificationRecord>>,
}

impl MemoryVerificationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

#[rocket::async_trait]
impl VerificationStore for MemoryVerificationStore {
    async fn insert(&self, record: &VerificationRecord) -> AuthResult<()> {
        self.records.lock().insert(record.id, record.clone());
        Ok(())
    }

    async fn consume(
        &self,
        identity_id: Uuid,
        kind: VerificationKind,
        code_digest: &str,
        now: DateTime<Utc>,
    ) -> AuthResult<ConsumeOutcome> {
        let mut records = self.records.lock();
        let mut outcome = ConsumeOutcome::NotFound;
        for record in records.values_mut().filter(|record| {
            record.identity_id == identity_id
                && record.kind == kind
                && !record.used
                && record.code_digest == code_digest
        }) {
            if record.is_consumable(now) {
                record.used = true;
                record.used_at = Some(now);
                return Ok(ConsumeOutcome::Consumed);
            }
            outcome = ConsumeOutcome::Expired;
        }
        Ok(outcome)
    }

    async fn find_owner(
        &self,
        kind: VerificationKind,
        code_digest: &str,
    ) -> AuthResult<Option<Uuid>> {
        Ok(self
            .records
            .lock()
            .values()
            .filter(|record| record.kind == kind && !record.used && record.code_digest == code_digest)
            .max_by_key(|record| record.created_at)
            .map(|record| record.identity_id))
    }

    async fn purge(&self, cutoff: DateTime<Utc>) -> AuthResult<u64> {
        let mut records = self.records.lock();
        let before = records.len();
        records.retain(|_, record| {
            let used_before_cutoff = record.used_at.is_some_and(|used_at| used_at <= cutoff);
            !(record.expires_at <= cutoff || used_before_cutoff)
        });
        Ok((before - records.len()) as u64)
    }
}
