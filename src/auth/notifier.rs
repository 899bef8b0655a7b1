use parking_lot::Mutex;

use crate::auth::AuthResult;
use crate::auth::one_time_codes::VerificationKind;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Channel {
    Email(String),
    Sms(String),
}

/// A verification code on its way to the identity that owns it.
#[derive(Debug, Clone)]
pub struct Notification {
    pub channel: Channel,
    pub kind: VerificationKind,
    pub code: String,
}

/// Outbound delivery sink (mail or SMS gateway).
#[rocket::async_trait]
pub trait Notifier: Send + Sync {
    async fn deliver(&self, notification: Notification) -> AuthResult<()>;
}

/// Writes a delivery line to the log without the code itself.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[rocket::async_trait]
impl Notifier for LogNotifier {
    async fn deliver(&self, notification: Notification) -> AuthResult<()> {
        let target = match &notification.channel {
            Channel::Email(address) => format!("email {}", address),
            Channel::Sms(number) => format!("sms {}", number),
        };
        log::info!("queued {} code for {}", notification.kind.as_str(), target);
        Ok(())
    }
}

/// Keeps every notification in memory; tests read codes back from it.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().clone()
    }

    pub fn last_code(&self, kind: VerificationKind) -> Option<String> {
        self.sent
            .lock()
            .iter()
            .rev()
            .find(|notification| notification.kind == kind)
            .map(|notification| notification.code.clone())
    }
}

#[rocket::async_trait]
impl Notifier for RecordingNotifier {
    async fn deliver(&self, notification: Notification) -> AuthResult<()> {
        self.sent.lock().push(notification);
        Ok(())
    }
}
