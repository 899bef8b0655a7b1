//! Identity collaborator: the user records the session core reads.
//!
//! The core only needs id and role for authorization; login flows also read
//! the password hash and lockout state.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rocket_db_pools::sqlx::{self, FromRow, PgPool};
use uuid::Uuid;

use crate::auth::responses::{Role, UserSummary};
use crate::auth::{AuthError, AuthResult};

#[derive(Debug, Clone)]
pub struct Identity {
    pub id: Uuid,
    pub email: String,
    pub phone: Option<String>,
    pub password_hash: String,
    pub role: Role,
    pub email_verified: bool,
    pub phone_verified: bool,
    pub failed_logins: i32,
    pub locked_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Identity {
    pub fn is_locked(&self, now: DateTime<Utc>) -> bool {
        self.locked_until.is_some_and(|until| until > now)
    }

    pub fn summary(&self) -> UserSummary {
        UserSummary {
            id: self.id.to_string(),
            email: self.email.clone(),
            phone: self.phone.clone(),
            role: self.role,
            email_verified: self.email_verified,
            phone_verified: self.phone_verified,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewIdentity {
    pub email: String,
    pub phone: Option<String>,
    pub password_hash: String,
    pub role: Role,
}

#[rocket::async_trait]
pub trait IdentityStore: Send + Sync {
    /// Fails with [`AuthError::Conflict`] when the email is taken.
    async fn create(&self, new: NewIdentity) -> AuthResult<Identity>;

    async fn find_by_id(&self, id: Uuid) -> AuthResult<Option<Identity>>;

    async fn find_by_email(&self, email: &str) -> AuthResult<Option<Identity>>;

    async fn set_password_hash(&self, id: Uuid, password_hash: &str) -> AuthResult<()>;

    /// Returns `false` when no identity has this id.
    async fn set_role(&self, id: Uuid, role: Role) -> AuthResult<bool>;

    /// Replaces the phone number and resets its verified flag.
    async fn set_phone(&self, id: Uuid, phone: &str) -> AuthResult<()>;

    async fn mark_email_verified(&self, id: Uuid) -> AuthResult<()>;

    async fn mark_phone_verified(&self, id: Uuid) -> AuthResult<()>;

    /// Bumps the failed-login counter and returns the new value.
    async fn record_login_failure(&self, id: Uuid) -> AuthResult<i32>;

    async fn lock_until(&self, id: Uuid, until: DateTime<Utc>) -> AuthResult<()>;

    async fn reset_login_failures(&self, id: Uuid) -> AuthResult<()>;
}

#[derive(Debug, FromRow)]
struct IdentityRow {
    id: Uuid,
    email: String,
    phone: Option<String>,
    password_hash: String,
    role: String,
    email_verified: bool,
    phone_verified: bool,
    failed_logins: i32,
    locked_until: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl TryFrom<IdentityRow> for Identity {
    type Error = AuthError;

    fn try_from(row: IdentityRow) -> AuthResult<Self> {
        let role = Role::parse(&row.role)
            .ok_or_else(|| AuthError::Other(format!("unknown role '{}' for {}", row.role, row.id)))?;
        Ok(Identity {
            id: row.id,
            email: row.email,
            phone: row.phone,
            password_hash: row.password_hash,
            role,
            email_verified: row.email_verified,
            phone_verified: row.phone_verified,
            failed_logins: row.failed_logins,
            locked_until: row.locked_until,
            created_at: row.created_at,
        })
    }
}

const IDENTITY_COLUMNS: &str = "id, email, phone, password_hash, role, email_verified, \
     phone_verified, failed_logins, locked_until, created_at";

#[derive(Debug, Clone)]
pub struct PgIdentityStore {
    pool: PgPool,
}

impl PgIdentityStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.code().map(|code| code == "23505").unwrap_or(false)
    )
}

#[rocket::async_trait]
impl IdentityStore for PgIdentityStore {
    async fn create(&self, new: NewIdentity) -> AuthResult<Identity> {
        let sql = format!(
            "INSERT INTO users (id, email, phone, password_hash, role) VALUES ($1, $2, $3, $4, $5) \
             RETURNING {IDENTITY_COLUMNS}"
        );
        let row = sqlx::query_as::<_, IdentityRow>(&sql)
            .bind(Uuid::new_v4())
            .bind(&new.email)
            .bind(&new.phone)
            .bind(&new.password_hash)
            .bind(new.role.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(|err| {
                if is_unique_violation(&err) {
                    AuthError::Conflict("email already registered".into())
                } else {
                    AuthError::from(err)
                }
            })?;
        row.try_into()
    }

    async fn find_by_id(&self, id: Uuid) -> AuthResult<Option<Identity>> {
        let sql = format!("SELECT {IDENTITY_COLUMNS} FROM users WHERE id = $1");
        sqlx::query_as::<_, IdentityRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(Identity::try_from)
            .transpose()
    }

    async fn find_by_email(&self, email: &str) -> AuthResult<Option<Identity>> {
        let sql = format!("SELECT {IDENTITY_COLUMNS} FROM users WHERE lower(email) = lower($1)");
        sqlx::query_as::<_, IdentityRow>(&sql)
            .bind(email)
            .fetch_optional(&self.pool)
            .await?
            .map(Identity::try_from)
            .transpose()
    }

    async fn set_password_hash(&self, id: Uuid, password_hash: &str) -> AuthResult<()> {
        sqlx::query("UPDATE users SET password_hash = $1, updated_at = now() WHERE id = $2")
            .bind(password_hash)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_role(&self, id: Uuid, role: Role) -> AuthResult<bool> {
        let result = sqlx::query("UPDATE users SET role = $1, updated_at = now() WHERE id = $2")
            .bind(role.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn set_phone(&self, id: Uuid, phone: &str) -> AuthResult<()> {
        sqlx::query(
            "UPDATE users SET phone = $1, phone_verified = FALSE, updated_at = now() WHERE id = $2",
        )
        .bind(phone)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_email_verified(&self, id: Uuid) -> AuthResult<()> {
        sqlx::query("UPDATE users SET email_verified = TRUE, updated_at = now() WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn mark_phone_verified(&self, id: Uuid) -> AuthResult<()> {
        sqlx::query("UPDATE users SET phone_verified = TRUE, updated_at = now() WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn record_login_failure(&self, id: Uuid) -> AuthResult<i32> {
        let count: i32 = sqlx::query_scalar(
            "UPDATE users SET failed_logins = failed_logins + 1 WHERE id = $1 RETURNING failed_logins",
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn lock_until(&self, id: Uuid, until: DateTime<Utc>) -> AuthResult<()> {
        sqlx::query("UPDATE users SET locked_until = $1 WHERE id = $2")
            .bind(until)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn reset_login_failures(&self, id: Uuid) -> AuthResult<()> {
        sqlx::query("UPDATE users SET failed_logins = 0, locked_until = NULL WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryIdentityStore {
    identities: DashMap<Uuid, Identity>,
    emails: DashMap<String, Uuid>,
}

impl MemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn update<F>(&self, id: Uuid, apply: F) -> bool
    where
        F: FnOnce(&mut Identity),
    {
        match self.identities.get_mut(&id) {
            Some(mut identity) => {
                apply(identity.value_mut());
                true
            }
            None => false,
        }
    }
}

#[rocket::async_trait]
impl IdentityStore for MemoryIdentityStore {
    async fn create(&self, new: NewIdentity) -> AuthResult<Identity> {
        let key = new.email.to_lowercase();
        let id = Uuid::new_v4();
        match self.emails.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(AuthError::Conflict("email already registered".into()));
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(id);
            }
        }

        let identity = Identity {
            id,
            email: new.email,
            phone: new.phone,
            password_hash: new.password_hash,
            role: new.role,
            email_verified: false,
            phone_verified: false,
            failed_logins: 0,
            locked_until: None,
            created_at: Utc::now(),
        };
        self.identities.insert(id, identity.clone());
        Ok(identity)
    }

    async fn find_by_id(&self, id: Uuid) -> AuthResult<Option<Identity>> {
        Ok(self.identities.get(&id).map(|entry| entry.value().clone()))
    }

    async fn find_by_email(&self, email: &str) -> AuthResult<Option<Identity>> {
        let Some(id) = self.emails.get(&email.to_lowercase()).map(|entry| *entry.value()) else {
            return Ok(None);
        };
        self.find_by_id(id).await
    }

    async fn set_password_hash(&self, id: Uuid, password_hash: &str) -> AuthResult<()> {
        self.update(id, |identity| identity.password_hash = password_hash.to_string());
        Ok(())
    }

    async fn set_role(&self, id: Uuid, role: Role) -> AuthResult<bool> {
        Ok(self.update(id, |identity| identity.role = role))
    }

    async fn set_phone(&self, id: Uuid, phone: &str) -> AuthResult<()> {
        self.update(id, |identity| {
            identity.phone = Some(phone.to_string());
            identity.phone_verified = false;
        });
        Ok(())
    }

    async fn mark_email_verified(&self, id: Uuid) -> AuthResult<()> {
        self.update(id, |identity| identity.email_verified = true);
        Ok(())
    }

    async fn mark_phone_verified(&self, id: Uuid) -> AuthResult<()> {
        self.update(id, |identity| identity.phone_verified = true);
        Ok(())
    }

    async fn record_login_failure(&self, id: Uuid) -> AuthResult<i32> {
        let mut count = 0;
        self.update(id, |identity| {
            identity.failed_logins += 1;
            count = identity.failed_logins;
        });
        Ok(count)
    }

    async fn lock_until(&self, id: Uuid, until: DateTime<Utc>) -> AuthResult<()> {
        self.update(id, |identity| identity.locked_until = Some(until));
        Ok(())
    }

    async fn reset_login_failures(&self, id: Uuid) -> AuthResult<()> {
        self.update(id, |identity| {
            identity.failed_logins = 0;
            identity.locked_until = None;
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_identity(email: &str) -> NewIdentity {
        NewIdentity {
            email: email.into(),
            phone: None,
            password_hash: "$argon2id$placeholder".into(),
            role: Role::Buyer,
        }
    }

    #[tokio::test]
    async fn duplicate_emails_conflict_case_insensitively() {
        let store = MemoryIdentityStore::new();
        store.create(new_identity("shopper@example.com")).await.expect("create");

        let err = store
            .create(new_identity("Shopper@Example.com"))
            .await
            .expect_err("duplicate");
        assert!(matches!(err, AuthError::Conflict(_)));
    }

    #[tokio::test]
    async fn role_changes_are_visible_on_next_lookup() {
        let store = MemoryIdentityStore::new();
        let created = store.create(new_identity("seller@example.com")).await.expect("create");

        assert!(store.set_role(created.id, Role::Seller).await.expect("set role"));
        let reloaded = store.find_by_id(created.id).await.expect("lookup").expect("exists");
        assert_eq!(reloaded.role, Role::Seller);
        assert!(!store.set_role(Uuid::new_v4(), Role::Admin).await.expect("set role"));
    }

    #[tokio::test]
    async fn phone_change_resets_verification() {
        let store = MemoryIdentityStore::new();
        let created = store.create(new_identity("phone@example.com")).await.expect("create");

        store.set_phone(created.id, "+15550100").await.expect("phone");
        store.mark_phone_verified(created.id).await.expect("verify");
        store.set_phone(created.id, "+15550199").await.expect("phone");

        let reloaded = store.find_by_id(created.id).await.expect("lookup").expect("exists");
        assert_eq!(reloaded.phone.as_deref(), Some("+15550199"));
        assert!(!reloaded.phone_verified);
    }

    #[tokio::test]
    async fn failed_logins_accumulate_and_reset() {
        let store = MemoryIdentityStore::new();
        let created = store.create(new_identity("lock@example.com")).await.expect("create");
        let now = Utc::now();

        assert_eq!(store.record_login_failure(created.id).await.expect("fail"), 1);
        assert_eq!(store.record_login_failure(created.id).await.expect("fail"), 2);
        store
            .lock_until(created.id, now + chrono::Duration::minutes(5))
            .await
            .expect("lock");
        let locked = store.find_by_id(created.id).await.expect("lookup").expect("exists");
        assert!(locked.is_locked(now));

        store.reset_login_failures(created.id).await.expect("reset");
        let unlocked = store.find_by_id(created.id).await.expect("lookup").expect("exists");
        assert_eq!(unlocked.failed_logins, 0);
        assert!(!unlocked.is_locked(now));
    }
}
