use std::fmt;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;

use crate::auth::{AuthError, AuthResult};

pub const COOKIE_KEY_LEN: usize = 32;
/// Upper bound for any configured lifetime or interval (ten years).
pub const MAX_DURATION_SECS: i64 = 10 * 365 * 24 * 60 * 60;

/// Secrets and tunables for the session core, loaded once at ignite.
#[derive(Clone)]
pub struct AuthConfig {
    pub issuer: String,
    pub access_token_secret: String,
    pub access_token_ttl_secs: i64,
    pub refresh_token_secret: String,
    pub refresh_token_ttl_secs: i64,
    pub cookie_key: [u8; COOKIE_KEY_LEN],
    pub session_cookie_name: String,
    pub session_ttl_secs: i64,
    pub cookie_secure: bool,
    pub cookie_domain: Option<String>,
    pub otp_ttl_secs: i64,
    pub email_token_ttl_secs: i64,
    pub reset_token_ttl_secs: i64,
    pub argon2_memory_kib: u32,
    pub argon2_iterations: u32,
    pub argon2_parallelism: u32,
    pub purge_interval_secs: u64,
}

impl AuthConfig {
    pub fn from_env() -> AuthResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup.
    ///
    /// Missing secrets are a configuration error; the server must not start
    /// without them.
    pub fn from_lookup<F>(lookup: F) -> AuthResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &str| {
            lookup(key)
                .filter(|value| !value.trim().is_empty())
                .ok_or_else(|| AuthError::Config(format!("{key} is required")))
        };
        let seconds = |key: &str, default: i64| -> AuthResult<i64> {
            match lookup(key) {
                None => Ok(default),
                Some(value) => value
                    .trim()
                    .parse::<i64>()
                    .ok()
                    .filter(|secs| (1..=MAX_DURATION_SECS).contains(secs))
                    .ok_or_else(|| {
                        AuthError::Config(format!(
                            "{key} must be between 1 and {MAX_DURATION_SECS} seconds, got '{value}'"
                        ))
                    }),
            }
        };
        let parameter = |key: &str, default: u32| -> AuthResult<u32> {
            match lookup(key) {
                None => Ok(default),
                Some(value) => value
                    .trim()
                    .parse::<u64>()
                    .ok()
                    .and_then(|raw| u32::try_from(raw).ok())
                    .filter(|raw| *raw > 0)
                    .ok_or_else(|| {
                        AuthError::Config(format!("{key} must be a positive 32-bit integer, got '{value}'"))
                    }),
            }
        };

        let access_token_secret = required("SHOP_ACCESS_TOKEN_SECRET")?;
        let refresh_token_secret = required("SHOP_REFRESH_TOKEN_SECRET")?;
        if access_token_secret == refresh_token_secret {
            return Err(AuthError::Config(
                "SHOP_ACCESS_TOKEN_SECRET and SHOP_REFRESH_TOKEN_SECRET must differ".into(),
            ));
        }
        let cookie_key = decode_cookie_key(&required("SHOP_COOKIES_SECRET")?)?;

        let cookie_secure = lookup("SHOP_COOKIE_SECURE")
            .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "on"))
            .unwrap_or(true);

        Ok(Self {
            issuer: lookup("SHOP_JWT_ISSUER").unwrap_or_else(|| "shop-api".into()),
            access_token_secret,
            access_token_ttl_secs: seconds("SHOP_ACCESS_TOKEN_TTL_SECS", 15 * 60)?,
            refresh_token_secret,
            refresh_token_ttl_secs: seconds("SHOP_REFRESH_TOKEN_TTL_SECS", 7 * 24 * 60 * 60)?,
            cookie_key,
            session_cookie_name: lookup("SHOP_SESSION_COOKIE_NAME")
                .unwrap_or_else(|| "session".into()),
            session_ttl_secs: seconds("SHOP_SESSION_TTL_SECS", 7 * 24 * 60 * 60)?,
            cookie_secure,
            cookie_domain: lookup("SHOP_COOKIE_DOMAIN"),
            otp_ttl_secs: seconds("SHOP_OTP_TTL_SECS", 2 * 60)?,
            email_token_ttl_secs: seconds("SHOP_EMAIL_TOKEN_TTL_SECS", 24 * 60 * 60)?,
            reset_token_ttl_secs: seconds("SHOP_RESET_TOKEN_TTL_SECS", 60 * 60)?,
            argon2_memory_kib: parameter("SHOP_ARGON2_MEMORY_KIB", 19 * 1024)?,
            argon2_iterations: parameter("SHOP_ARGON2_ITERATIONS", 2)?,
            argon2_parallelism: parameter("SHOP_ARGON2_PARALLELISM", 1)?,
            purge_interval_secs: seconds("SHOP_PURGE_INTERVAL_SECS", 60 * 60)?.unsigned_abs(),
        })
    }
}

/// Where identities, refresh hashes, revocations and codes live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    Postgres,
    /// Process-local maps; state is lost on restart.
    Memory,
}

impl StorageBackend {
    pub fn from_env() -> AuthResult<Self> {
        Self::parse(std::env::var("SHOP_STORAGE").ok().as_deref())
    }

    pub fn parse(value: Option<&str>) -> AuthResult<Self> {
        match value.map(|value| value.trim().to_ascii_lowercase()).as_deref() {
            None | Some("") | Some("postgres") => Ok(StorageBackend::Postgres),
            Some("memory") => Ok(StorageBackend::Memory),
            Some(other) => Err(AuthError::Config(format!(
                "SHOP_STORAGE must be 'postgres' or 'memory', got '{other}'"
            ))),
        }
    }
}

fn decode_cookie_key(encoded: &str) -> AuthResult<[u8; COOKIE_KEY_LEN]> {
    let bytes = STANDARD.decode(encoded.trim())?;
    bytes.try_into().map_err(|bytes: Vec<u8>| {
        AuthError::Config(format!(
            "SHOP_COOKIES_SECRET must decode to {COOKIE_KEY_LEN} bytes, got {}",
            bytes.len()
        ))
    })
}

impl fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthConfig")
            .field("issuer", &self.issuer)
            .field("access_token_secret", &"<redacted>")
            .field("access_token_ttl_secs", &self.access_token_ttl_secs)
            .field("refresh_token_secret", &"<redacted>")
            .field("refresh_token_ttl_secs", &self.refresh_token_ttl_secs)
            .field("cookie_key", &"<redacted>")
            .field("session_cookie_name", &self.session_cookie_name)
            .field("session_ttl_secs", &self.session_ttl_secs)
            .field("cookie_secure", &self.cookie_secure)
            .field("cookie_domain", &self.cookie_domain)
            .field("otp_ttl_secs", &self.otp_ttl_secs)
            .finish_non_exhaustive()
    }
}
