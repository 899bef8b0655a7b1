//! Account and session flows built from the core pieces.
//!
//! Every flow takes the current time explicitly; handlers pass `Utc::now()`.

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::auth::gate::Authenticated;
use crate::auth::identity::{Identity, NewIdentity};
use crate::auth::jwt::CredentialPair;
use crate::auth::notifier::{Channel, Notification};
use crate::auth::one_time_codes::VerificationKind;
use crate::auth::responses::{RegisterRequest, Role, SessionResponse};
use crate::auth::session_cookie::{SealedCookie, SessionPayload};
use crate::auth::{AuthError, AuthResult, AuthState};

pub const MAX_FAILED_LOGINS: i32 = 5;
pub const LOCKOUT_MINUTES: i64 = 5;
pub const MIN_PASSWORD_LEN: usize = 8;

/// Everything a handler needs to answer a successful sign-in.
#[derive(Debug, Clone)]
pub struct SessionGrant {
    pub identity: Identity,
    pub pair: CredentialPair,
    pub cookie: SealedCookie,
}

impl SessionGrant {
    pub fn response(&self) -> SessionResponse {
        SessionResponse {
            user: self.identity.summary(),
            access_token_expires_at: self.pair.access.expires_at,
            refresh_token_expires_at: self.pair.refresh.expires_at,
            session_expires_at: self.cookie.expires_at,
        }
    }
}

pub fn normalize_email(email: &str) -> AuthResult<String> {
    let email = email.trim().to_lowercase();
    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() && !domain.is_empty() => Ok(email),
        _ => Err(AuthError::BadRequest("a valid email address is required".into())),
    }
}

fn check_password(password: &str) -> AuthResult<()> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(AuthError::BadRequest(format!(
            "password must be at least {MIN_PASSWORD_LEN} characters"
        )));
    }
    Ok(())
}

fn normalize_phone(phone: &str) -> AuthResult<String> {
    let phone = phone.trim();
    let digits = phone.chars().filter(|c| c.is_ascii_digit()).count();
    let allowed = phone
        .chars()
        .all(|c| c.is_ascii_digit() || matches!(c, '+' | ' ' | '-' | '(' | ')'));
    if !allowed || !(7..=15).contains(&digits) {
        return Err(AuthError::BadRequest("a valid phone number is required".into()));
    }
    Ok(phone.to_string())
}

impl AuthState {
    pub async fn register(&self, request: RegisterRequest, now: DateTime<Utc>) -> AuthResult<Identity> {
        let email = normalize_email(&request.email)?;
        check_password(&request.password)?;
        let phone = request
            .phone
            .as_deref()
            .filter(|phone| !phone.trim().is_empty())
            .map(normalize_phone)
            .transpose()?;

        let password_hash = self.passwords.hash_blocking(request.password).await?;
        let identity = self
            .identities
            .create(NewIdentity {
                email,
                phone,
                password_hash,
                role: Role::Buyer,
            })
            .await?;
        log::info!("registered identity {}", identity.id);

        self.send_code(
            &identity,
            VerificationKind::RegistrationEmail,
            Channel::Email(identity.email.clone()),
            self.config.email_token_ttl_secs,
            now,
        )
        .await?;

        Ok(identity)
    }

    pub async fn confirm_email(&self, token: &str, now: DateTime<Utc>) -> AuthResult<()> {
        let owner = self
            .codes
            .consume_token(VerificationKind::RegistrationEmail, token, now)
            .await?;
        self.identities.mark_email_verified(owner).await?;
        log::info!("email confirmed for {}", owner);
        Ok(())
    }

    /// Password check followed by a one-time code to the identity's phone,
    /// or its email when no phone is on file.
    pub async fn request_otp(
        &self,
        email: &str,
        password: &str,
        now: DateTime<Utc>,
    ) -> AuthResult<DateTime<Utc>> {
        let identity = self.authenticate_password(email, password, now).await?;
        let channel = match &identity.phone {
            Some(phone) => Channel::Sms(phone.clone()),
            None => Channel::Email(identity.email.clone()),
        };
        self.send_code(
            &identity,
            VerificationKind::PhoneOtp,
            channel,
            self.config.otp_ttl_secs,
            now,
        )
        .await
    }

    pub async fn verify_otp(&self, email: &str, otp: &str, now: DateTime<Utc>) -> AuthResult<SessionGrant> {
        let email = normalize_email(email)?;
        let identity = self
            .identities
            .find_by_email(&email)
            .await?
            .ok_or(AuthError::CodeNotFound)?;

        self.codes
            .consume(identity.id, VerificationKind::PhoneOtp, otp, now)
            .await?;
        if identity.phone.is_some() && !identity.phone_verified {
            self.identities.mark_phone_verified(identity.id).await?;
        }

        self.start_session(identity.id, now).await
    }

    pub async fn login(&self, email: &str, password: &str, now: DateTime<Utc>) -> AuthResult<SessionGrant> {
        let identity = self.authenticate_password(email, password, now).await?;
        self.start_session(identity.id, now).await
    }

    async fn authenticate_password(
        &self,
        email: &str,
        password: &str,
        now: DateTime<Utc>,
    ) -> AuthResult<Identity> {
        let email = normalize_email(email).map_err(|_| AuthError::InvalidCredentials)?;
        let identity = self
            .identities
            .find_by_email(&email)
            .await?
            .ok_or(AuthError::InvalidCredentials)?;

        if identity.is_locked(now) {
            return Err(AuthError::AccountLocked);
        }

        let verified = self
            .passwords
            .verify_blocking(password.to_string(), identity.password_hash.clone())
            .await?;
        if !verified {
            // A lapsed lock starts a fresh window.
            if identity.locked_until.is_some() {
                self.identities.reset_login_failures(identity.id).await?;
            }
            let failures = self.identities.record_login_failure(identity.id).await?;
            if failures >= MAX_FAILED_LOGINS {
                let until = now + Duration::minutes(LOCKOUT_MINUTES);
                self.identities.lock_until(identity.id, until).await?;
                log::warn!("identity {} locked until {} after {} failures", identity.id, until, failures);
            }
            return Err(AuthError::InvalidCredentials);
        }

        if identity.failed_logins > 0 || identity.locked_until.is_some() {
            self.identities.reset_login_failures(identity.id).await?;
        }
        Ok(identity)
    }

    /// Mints a fresh credential pair, records the refresh hash and seals both
    /// into a session cookie. Any earlier session of the identity stops
    /// refreshing.
    pub async fn start_session(&self, identity_id: Uuid, now: DateTime<Utc>) -> AuthResult<SessionGrant> {
        let identity = self
            .identities
            .find_by_id(identity_id)
            .await?
            .ok_or(AuthError::Unauthorized)?;

        let pair = self.issuer.issue_pair_at(identity.id, now)?;
        self.refresh_store.commit(identity.id, &pair.refresh.token).await?;

        let cookie = self
            .codec
            .encode(
                &SessionPayload {
                    access_token: pair.access.token.clone(),
                    refresh_token: pair.refresh.token.clone(),
                },
                now,
            )
            .map_err(|err| AuthError::Other(format!("sealing session cookie: {err}")))?;

        log::info!("session started for {}", identity.id);
        Ok(SessionGrant {
            identity,
            pair,
            cookie,
        })
    }

    pub async fn refresh(&self, auth: &Authenticated, now: DateTime<Utc>) -> AuthResult<SessionGrant> {
        self.start_session(auth.principal.id, now).await
    }

    /// Ends the session: the refresh hash is cleared and the access
    /// credential is revoked for as long as the validator would accept it.
    pub async fn logout(&self, auth: &Authenticated) -> AuthResult<()> {
        self.refresh_store.clear(auth.principal.id).await?;
        let revoked_until = self.issuer.access_keys().accepted_until(&auth.credential.claims);
        self.revocation
            .add(&auth.session.access_token, revoked_until)
            .await?;
        log::info!("session ended for {}", auth.principal.id);
        Ok(())
    }

    /// Always succeeds so the response does not reveal whether the email
    /// is registered.
    pub async fn forgot_password(&self, email: &str, now: DateTime<Utc>) -> AuthResult<()> {
        let Ok(email) = normalize_email(email) else {
            return Ok(());
        };
        if let Some(identity) = self.identities.find_by_email(&email).await? {
            self.send_code(
                &identity,
                VerificationKind::PasswordReset,
                Channel::Email(identity.email.clone()),
                self.config.reset_token_ttl_secs,
                now,
            )
            .await?;
        }
        Ok(())
    }

    pub async fn reset_password(&self, token: &str, password: String, now: DateTime<Utc>) -> AuthResult<()> {
        check_password(&password)?;
        let owner = self
            .codes
            .consume_token(VerificationKind::PasswordReset, token, now)
            .await?;
        let hash = self.passwords.hash_blocking(password).await?;
        self.identities.set_password_hash(owner, &hash).await?;
        self.refresh_store.clear(owner).await?;
        self.identities.reset_login_failures(owner).await?;
        log::info!("password reset for {}", owner);
        Ok(())
    }

    pub async fn change_phone(
        &self,
        identity_id: Uuid,
        phone: &str,
        now: DateTime<Utc>,
    ) -> AuthResult<DateTime<Utc>> {
        let phone = normalize_phone(phone)?;
        self.identities.set_phone(identity_id, &phone).await?;
        let identity = self
            .identities
            .find_by_id(identity_id)
            .await?
            .ok_or(AuthError::IdentityNotFound)?;
        self.send_code(
            &identity,
            VerificationKind::PhoneOtp,
            Channel::Sms(phone),
            self.config.otp_ttl_secs,
            now,
        )
        .await
    }

    pub async fn verify_phone(&self, identity_id: Uuid, otp: &str, now: DateTime<Utc>) -> AuthResult<Identity> {
        self.codes
            .consume(identity_id, VerificationKind::PhoneOtp, otp, now)
            .await?;
        self.identities.mark_phone_verified(identity_id).await?;
        self.profile(identity_id).await
    }

    pub async fn change_role(&self, identity_id: Uuid, role: Role) -> AuthResult<Identity> {
        if !self.identities.set_role(identity_id, role).await? {
            return Err(AuthError::IdentityNotFound);
        }
        log::info!("role of {} changed to {}", identity_id, role.as_str());
        self.profile(identity_id).await
    }

    pub async fn profile(&self, identity_id: Uuid) -> AuthResult<Identity> {
        self.identities
            .find_by_id(identity_id)
            .await?
            .ok_or(AuthError::IdentityNotFound)
    }

    /// Removes inert revocation entries and spent verification codes.
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> AuthResult<(u64, u64)> {
        let revoked = self.revocation.purge_expired(now).await?;
        let codes = self.codes.purge_expired(now).await?;
        Ok((revoked, codes))
    }

    async fn send_code(
        &self,
        identity: &Identity,
        kind: VerificationKind,
        channel: Channel,
        ttl_secs: i64,
        now: DateTime<Utc>,
    ) -> AuthResult<DateTime<Utc>> {
        let issued = self
            .codes
            .issue(identity.id, kind, Duration::seconds(ttl_secs), now)
            .await?;
        let expires_at = issued.record.expires_at;

        if let Err(err) = self
            .notifier
            .deliver(Notification {
                channel,
                kind,
                code: issued.code,
            })
            .await
        {
            log::warn!("failed to deliver {} code to {}: {}", kind.as_str(), identity.id, err);
        }
        Ok(expires_at)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::auth::RouteMeta;
    use crate::auth::notifier::RecordingNotifier;
    use crate::test_support::memory_state;

    fn register_request(email: &str, phone: Option<&str>) -> RegisterRequest {
        RegisterRequest {
            email: email.into(),
            password: "correct horse".into(),
            phone: phone.map(str::to_string),
        }
    }

    async fn registered(state: &AuthState, notifier: &RecordingNotifier, now: DateTime<Utc>) -> Identity {
        let identity = state
            .register(register_request("Ada@Example.com ", Some("+44 20 7946 0958")), now)
            .await
            .expect("register");
        let token = notifier
            .last_code(VerificationKind::RegistrationEmail)
            .expect("confirmation sent");
        state.confirm_email(&token, now).await.expect("confirm");
        identity
    }

    #[test]
    fn emails_are_normalized() {
        assert_eq!(normalize_email("  Ada@Example.COM ").unwrap(), "ada@example.com");
        assert!(normalize_email("no-at-sign").is_err());
        assert!(normalize_email("@example.com").is_err());
    }

    #[test]
    fn phones_are_checked() {
        assert!(normalize_phone("+1 (555) 010-9999").is_ok());
        assert!(normalize_phone("12").is_err());
        assert!(normalize_phone("call me").is_err());
    }

    #[tokio::test]
    async fn registration_sends_confirmation_and_rejects_duplicates() {
        let notifier = Arc::new(RecordingNotifier::new());
        let state = memory_state(notifier.clone());
        let now = Utc::now();

        let identity = registered(&state, &notifier, now).await;
        assert_eq!(identity.email, "ada@example.com");
        assert_eq!(identity.role, Role::Buyer);
        assert!(state.profile(identity.id).await.unwrap().email_verified);

        let err = state
            .register(register_request("ada@example.com", None), now)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Conflict(_)));

        let err = state
            .register(
                RegisterRequest {
                    email: "short@example.com".into(),
                    password: "short".into(),
                    phone: None,
                },
                now,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::BadRequest(_)));
    }

    #[tokio::test]
    async fn otp_login_marks_phone_verified() {
        let notifier = Arc::new(RecordingNotifier::new());
        let state = memory_state(notifier.clone());
        let now = Utc::now();
        let identity = registered(&state, &notifier, now).await;

        let expires_at = state
            .request_otp("ada@example.com", "correct horse", now)
            .await
            .expect("otp requested");
        assert_eq!(expires_at, now + Duration::seconds(state.config.otp_ttl_secs));

        let sent = notifier.sent();
        let last = sent.last().expect("otp delivered");
        assert_eq!(last.channel, Channel::Sms("+44 20 7946 0958".into()));

        let otp = notifier.last_code(VerificationKind::PhoneOtp).unwrap();
        let grant = state.verify_otp("ada@example.com", &otp, now).await.expect("verified");
        assert_eq!(grant.identity.id, identity.id);
        assert!(grant.identity.phone_verified);

        let err = state.verify_otp("ada@example.com", &otp, now).await.unwrap_err();
        assert!(matches!(err, AuthError::CodeNotFound));
    }

    #[tokio::test]
    async fn repeated_failures_lock_the_account() {
        let notifier = Arc::new(RecordingNotifier::new());
        let state = memory_state(notifier.clone());
        let now = Utc::now();
        registered(&state, &notifier, now).await;

        for _ in 0..MAX_FAILED_LOGINS {
            let err = state.login("ada@example.com", "wrong password", now).await.unwrap_err();
            assert!(matches!(err, AuthError::InvalidCredentials));
        }

        let err = state.login("ada@example.com", "correct horse", now).await.unwrap_err();
        assert!(matches!(err, AuthError::AccountLocked));

        let later = now + Duration::minutes(LOCKOUT_MINUTES) + Duration::seconds(1);
        state
            .login("ada@example.com", "correct horse", later)
            .await
            .expect("lock lapses");
    }

    #[tokio::test]
    async fn a_lapsed_lock_restarts_the_failure_count() {
        let notifier = Arc::new(RecordingNotifier::new());
        let state = memory_state(notifier.clone());
        let now = Utc::now();
        let identity = registered(&state, &notifier, now).await;

        for _ in 0..MAX_FAILED_LOGINS {
            state.login("ada@example.com", "wrong password", now).await.unwrap_err();
        }

        let later = now + Duration::minutes(LOCKOUT_MINUTES) + Duration::seconds(1);
        let err = state.login("ada@example.com", "wrong password", later).await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidCredentials));
        let profile = state.identities.find_by_id(identity.id).await.unwrap().expect("identity");
        assert_eq!(profile.failed_logins, 1);
        assert!(profile.locked_until.is_none());

        state
            .login("ada@example.com", "correct horse", later)
            .await
            .expect("one miss after a lapsed lock does not relock");

        // A fresh run of failures still locks.
        for _ in 0..MAX_FAILED_LOGINS {
            state.login("ada@example.com", "wrong password", later).await.unwrap_err();
        }
        let err = state.login("ada@example.com", "correct horse", later).await.unwrap_err();
        assert!(matches!(err, AuthError::AccountLocked));
    }

    #[tokio::test]
    async fn unknown_email_and_wrong_password_look_the_same() {
        let notifier = Arc::new(RecordingNotifier::new());
        let state = memory_state(notifier.clone());
        let now = Utc::now();
        registered(&state, &notifier, now).await;

        let unknown = state.login("nobody@example.com", "correct horse", now).await.unwrap_err();
        let wrong = state.login("ada@example.com", "nope nope nope", now).await.unwrap_err();
        assert_eq!(unknown.public_message(), wrong.public_message());
        assert_eq!(unknown.status(), wrong.status());
    }

    #[tokio::test]
    async fn logout_revokes_through_the_validation_leeway() {
        let notifier = Arc::new(RecordingNotifier::new());
        let state = memory_state(notifier.clone());
        let now = Utc::now();
        registered(&state, &notifier, now).await;

        // The access credential expired ten seconds ago but is still within
        // the verification leeway.
        let issued = now - Duration::seconds(state.config.access_token_ttl_secs + 10);
        let grant = state.login("ada@example.com", "correct horse", issued).await.unwrap();
        let meta = RouteMeta::authenticated();
        let auth = state
            .gate
            .evaluate(&meta, true, Some(&grant.cookie.value), now)
            .await
            .unwrap()
            .expect("accepted inside the leeway");
        assert!(auth.credential.claims.expires_at() < now);

        state.logout(&auth).await.expect("logout");

        let err = state
            .gate
            .evaluate(&meta, true, Some(&grant.cookie.value), Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Unauthorized));
        assert!(
            state
                .revocation
                .contains(&auth.session.access_token, auth.credential.claims.expires_at() + Duration::seconds(20))
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn logout_revokes_access_and_clears_refresh() {
        let notifier = Arc::new(RecordingNotifier::new());
        let state = memory_state(notifier.clone());
        let now = Utc::now();
        registered(&state, &notifier, now).await;

        let grant = state.login("ada@example.com", "correct horse", now).await.unwrap();
        let meta = RouteMeta::authenticated();
        let auth = state
            .gate
            .evaluate(&meta, true, Some(&grant.cookie.value), now)
            .await
            .unwrap()
            .expect("authenticated");

        state.logout(&auth).await.expect("logout");

        let err = state
            .gate
            .evaluate(&meta, true, Some(&grant.cookie.value), now)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Unauthorized));

        // Reads do not consult the revocation registry.
        assert!(
            state
                .gate
                .evaluate(&meta, false, Some(&grant.cookie.value), now)
                .await
                .unwrap()
                .is_some()
        );

        // Routes that skip revocation still admit the revoked credential.
        let logout_meta = RouteMeta::authenticated().skip_revocation();
        let again = state
            .gate
            .evaluate(&logout_meta, true, Some(&grant.cookie.value), now)
            .await
            .unwrap()
            .expect("skip-revocation route admits the session");
        state.logout(&again).await.expect("repeated logout");

        let refresh_meta = RouteMeta::authenticated().refresh_credential().skip_revocation();
        let err = state
            .gate
            .evaluate(&refresh_meta, true, Some(&grant.cookie.value), now)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Unauthorized));
    }

    #[tokio::test]
    async fn refresh_rotates_and_retires_the_previous_session() {
        let notifier = Arc::new(RecordingNotifier::new());
        let state = memory_state(notifier.clone());
        let now = Utc::now();
        registered(&state, &notifier, now).await;

        let first = state.login("ada@example.com", "correct horse", now).await.unwrap();
        let refresh_meta = RouteMeta::authenticated().refresh_credential().skip_revocation();
        let auth = state
            .gate
            .evaluate(&refresh_meta, true, Some(&first.cookie.value), now)
            .await
            .unwrap()
            .expect("refresh accepted");

        let later = now + Duration::seconds(5);
        let second = state.refresh(&auth, later).await.expect("rotated");
        assert_ne!(second.pair.refresh.token, first.pair.refresh.token);

        assert!(
            state
                .gate
                .evaluate(&refresh_meta, true, Some(&first.cookie.value), later)
                .await
                .is_err()
        );
        assert!(
            state
                .gate
                .evaluate(&refresh_meta, true, Some(&second.cookie.value), later)
                .await
                .unwrap()
                .is_some()
        );
    }

    #[tokio::test]
    async fn password_reset_replaces_the_password() {
        let notifier = Arc::new(RecordingNotifier::new());
        let state = memory_state(notifier.clone());
        let now = Utc::now();
        registered(&state, &notifier, now).await;

        state.forgot_password("nobody@example.com", now).await.expect("silent");
        assert!(notifier.last_code(VerificationKind::PasswordReset).is_none());

        state.forgot_password("ada@example.com", now).await.unwrap();
        let token = notifier.last_code(VerificationKind::PasswordReset).unwrap();
        state
            .reset_password(&token, "battery staple".into(), now)
            .await
            .expect("reset");

        assert!(state.login("ada@example.com", "correct horse", now).await.is_err());
        state.login("ada@example.com", "battery staple", now).await.expect("new password");

        let err = state
            .reset_password(&token, "another password".into(), now)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::CodeNotFound));
    }

    #[tokio::test]
    async fn phone_change_requires_fresh_verification() {
        let notifier = Arc::new(RecordingNotifier::new());
        let state = memory_state(notifier.clone());
        let now = Utc::now();
        let identity = registered(&state, &notifier, now).await;

        state
            .change_phone(identity.id, "+1 555 010 1234", now)
            .await
            .expect("phone changed");
        let profile = state.profile(identity.id).await.unwrap();
        assert_eq!(profile.phone.as_deref(), Some("+1 555 010 1234"));
        assert!(!profile.phone_verified);

        let otp = notifier.last_code(VerificationKind::PhoneOtp).unwrap();
        let late = now + Duration::seconds(state.config.otp_ttl_secs + 1);
        let err = state.verify_phone(identity.id, &otp, late).await.unwrap_err();
        assert!(matches!(err, AuthError::CodeExpired));

        state
            .change_phone(identity.id, "+1 555 010 1234", now)
            .await
            .unwrap();
        let otp = notifier.last_code(VerificationKind::PhoneOtp).unwrap();
        let profile = state.verify_phone(identity.id, &otp, now).await.expect("verified");
        assert!(profile.phone_verified);
    }

    #[tokio::test]
    async fn role_change_needs_an_existing_identity() {
        let notifier = Arc::new(RecordingNotifier::new());
        let state = memory_state(notifier.clone());
        let now = Utc::now();
        let identity = registered(&state, &notifier, now).await;

        let updated = state.change_role(identity.id, Role::Seller).await.unwrap();
        assert_eq!(updated.role, Role::Seller);

        let err = state.change_role(Uuid::new_v4(), Role::Admin).await.unwrap_err();
        assert!(matches!(err, AuthError::IdentityNotFound));
    }
}
