use rocket::http::Status;
use thiserror::Error;

use crate::auth::responses::Role;

pub type AuthResult<T> = Result<T, AuthError>;

/// Message returned for every authentication failure, whatever the cause.
pub const UNAUTHORIZED_MESSAGE: &str = "authentication required";

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("account locked")]
    AccountLocked,
    #[error("unauthorized")]
    Unauthorized,
    #[error("forbidden: requires one of [{}]", format_roles(.required))]
    Forbidden { required: Vec<Role> },
    #[error("identity not found")]
    IdentityNotFound,
    #[error("verification code not found")]
    CodeNotFound,
    #[error("verification code expired")]
    CodeExpired,
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("database error: {0}")]
    Sqlx(#[from] rocket_db_pools::sqlx::Error),
    #[error("jwt error: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),
    #[error("argon2 parameter error: {0}")]
    Argon2(String),
    #[error("password hashing error: {0}")]
    PasswordHash(String),
    #[error("base64 error: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("unexpected error: {0}")]
    Other(String),
}

impl AuthError {
    pub fn status(&self) -> Status {
        match self {
            AuthError::InvalidCredentials | AuthError::Unauthorized => Status::Unauthorized,
            AuthError::AccountLocked => Status::Locked,
            AuthError::Forbidden { .. } => Status::Forbidden,
            AuthError::CodeNotFound | AuthError::IdentityNotFound => Status::NotFound,
            AuthError::CodeExpired => Status::Gone,
            AuthError::Conflict(_) => Status::Conflict,
            AuthError::BadRequest(_) => Status::BadRequest,
            AuthError::Config(_)
            | AuthError::Sqlx(_)
            | AuthError::Jwt(_)
            | AuthError::Argon2(_)
            | AuthError::PasswordHash(_)
            | AuthError::Base64(_)
            | AuthError::Join(_)
            | AuthError::Other(_) => Status::InternalServerError,
        }
    }

    /// Text safe to hand back to the client.
    ///
    /// Authentication failures collapse to one message so a caller cannot
    /// tell a bad signature from an expired or revoked credential.
    /// Infrastructure failures are logged here and replaced with a generic
    /// message.
    pub fn public_message(&self) -> String {
        match self {
            AuthError::InvalidCredentials | AuthError::Unauthorized => {
                UNAUTHORIZED_MESSAGE.to_string()
            }
            AuthError::AccountLocked
            | AuthError::Forbidden { .. }
            | AuthError::IdentityNotFound
            | AuthError::CodeNotFound
            | AuthError::CodeExpired
            | AuthError::Conflict(_)
            | AuthError::BadRequest(_) => self.to_string(),
            other => {
                log::error!("internal auth failure: {}", other);
                "internal server error".to_string()
            }
        }
    }
}

fn format_roles(roles: &[Role]) -> String {
    roles
        .iter()
        .map(|role| role.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

impl From<argon2::Error> for AuthError {
    fn from(err: argon2::Error) -> Self {
        AuthError::Argon2(err.to_string())
    }
}

impl From<argon2::password_hash::Error> for AuthError {
    fn from(err: argon2::password_hash::Error) -> Self {
        AuthError::PasswordHash(err.to_string())
    }
}
