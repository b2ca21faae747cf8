//! Delivery Dispatcher
//!
//! Attempts delivery of one due follow-up and decides its terminal status:
//! - no email on file: `failed_no_email`, nothing is sent
//! - send succeeds: `sent`
//! - send errors or times out: `failed`

use bremi_channels::{CheckupEmail, EmailChannel};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::followup::{FollowUpStatus, ScheduledFollowUp};

/// Greeting used when no name can be derived from the address
pub const DEFAULT_DISPLAY_NAME: &str = "Friend";

/// Upper bound on one delivery attempt
pub const SEND_TIMEOUT: Duration = Duration::from_secs(10);

pub struct DeliveryDispatcher {
    email: Arc<dyn EmailChannel>,
    send_timeout: Duration,
}

impl DeliveryDispatcher {
    pub fn new(email: Arc<dyn EmailChannel>, send_timeout: Duration) -> Self {
        Self {
            email,
            send_timeout,
        }
    }

    /// Deliver one record and return the status it should end in
    pub async fn dispatch(&self, record: &ScheduledFollowUp) -> FollowUpStatus {
        let Some(address) = record.delivery_address() else {
            warn!(
                user = %record.user_id,
                topic = %record.topic,
                "No email address on file for follow-up {}",
                record.id
            );
            return FollowUpStatus::FailedNoEmail;
        };

        let email = CheckupEmail {
            to: address.to_string(),
            name: display_name(address),
            topic: record.topic.clone(),
            content: record.email_content.clone(),
        };

        match tokio::time::timeout(self.send_timeout, self.email.send_checkup(&email)).await {
            Ok(Ok(())) => {
                info!(
                    user = %record.user_id,
                    email = %address,
                    topic = %record.topic,
                    channel = self.email.name(),
                    "📤 Follow-up delivered"
                );
                FollowUpStatus::Sent
            }
            Ok(Err(e)) => {
                error!(
                    user = %record.user_id,
                    email = %address,
                    topic = %record.topic,
                    "Follow-up delivery failed: {}",
                    e
                );
                FollowUpStatus::Failed
            }
            Err(_) => {
                error!(
                    user = %record.user_id,
                    email = %address,
                    topic = %record.topic,
                    "Follow-up delivery timed out after {:?}",
                    self.send_timeout
                );
                FollowUpStatus::Failed
            }
        }
    }
}

/// Greeting name derived from an email address.
///
/// Uses the first run of two or more letters in the local part
/// ("ada.obi@x" -> "Ada"), falling back to "Friend".
pub fn display_name(email: &str) -> String {
    let local = email.split('@').next().unwrap_or_default();
    local
        .split(|c: char| !c.is_alphabetic())
        .find(|token| token.chars().count() >= 2)
        .map(|token| {
            let lower = token.to_lowercase();
            let mut chars = lower.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => DEFAULT_DISPLAY_NAME.to_string(),
            }
        })
        .unwrap_or_else(|| DEFAULT_DISPLAY_NAME.to_string())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use bremi_channels::ChannelError;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use uuid::Uuid;

    /// Scripted email channel that records every call
    pub(crate) struct FakeMailer {
        pub succeed: bool,
        pub delay: Option<Duration>,
        pub calls: AtomicUsize,
        pub sent: Mutex<Vec<CheckupEmail>>,
    }

    impl FakeMailer {
        pub(crate) fn new(succeed: bool) -> Self {
            Self {
                succeed,
                delay: None,
                calls: AtomicUsize::new(0),
                sent: Mutex::new(Vec::new()),
            }
        }

        pub(crate) fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl EmailChannel for FakeMailer {
        fn name(&self) -> &str {
            "fake"
        }

        async fn send_checkup(&self, email: &CheckupEmail) -> Result<(), ChannelError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.sent.lock().unwrap().push(email.clone());
            if self.succeed {
                Ok(())
            } else {
                Err(ChannelError::Api {
                    status: 503,
                    message: "unavailable".to_string(),
                })
            }
        }
    }

    fn record(email: Option<&str>) -> ScheduledFollowUp {
        let now = Utc::now();
        ScheduledFollowUp {
            id: Uuid::new_v4(),
            user_id: "user-1".to_string(),
            user_email: email.map(str::to_string),
            topic: "Job Interview".to_string(),
            context_summary: "Interview tomorrow".to_string(),
            email_content: "How did it go?".to_string(),
            fingerprint: "user-1|job interview".to_string(),
            status: FollowUpStatus::Pending,
            created_at: now,
            scheduled_time: now,
            processed_at: None,
        }
    }

    #[tokio::test]
    async fn test_missing_email_never_sends() {
        let mailer = Arc::new(FakeMailer::new(true));
        let dispatcher = DeliveryDispatcher::new(mailer.clone(), Duration::from_secs(1));

        assert_eq!(
            dispatcher.dispatch(&record(None)).await,
            FollowUpStatus::FailedNoEmail
        );
        assert_eq!(
            dispatcher.dispatch(&record(Some(""))).await,
            FollowUpStatus::FailedNoEmail
        );
        assert_eq!(mailer.calls(), 0);
    }

    #[tokio::test]
    async fn test_successful_send() {
        let mailer = Arc::new(FakeMailer::new(true));
        let dispatcher = DeliveryDispatcher::new(mailer.clone(), Duration::from_secs(1));

        let status = dispatcher
            .dispatch(&record(Some("ada.obi@example.com")))
            .await;
        assert_eq!(status, FollowUpStatus::Sent);
        assert_eq!(mailer.calls(), 1);

        let sent = mailer.sent.lock().unwrap();
        assert_eq!(sent[0].to, "ada.obi@example.com");
        assert_eq!(sent[0].name, "Ada");
        assert_eq!(sent[0].topic, "Job Interview");
        assert_eq!(sent[0].content, "How did it go?");
    }

    #[tokio::test]
    async fn test_failed_send() {
        let mailer = Arc::new(FakeMailer::new(false));
        let dispatcher = DeliveryDispatcher::new(mailer.clone(), Duration::from_secs(1));

        assert_eq!(
            dispatcher.dispatch(&record(Some("ada@example.com"))).await,
            FollowUpStatus::Failed
        );
        assert_eq!(mailer.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_send_times_out() {
        let mut mailer = FakeMailer::new(true);
        mailer.delay = Some(Duration::from_secs(60));
        let dispatcher = DeliveryDispatcher::new(Arc::new(mailer), SEND_TIMEOUT);

        let started = tokio::time::Instant::now();
        assert_eq!(
            dispatcher.dispatch(&record(Some("ada@example.com"))).await,
            FollowUpStatus::Failed
        );
        assert!(started.elapsed() < Duration::from_secs(11));
    }

    #[test]
    fn test_display_name() {
        assert_eq!(display_name("ada.obi@example.com"), "Ada");
        assert_eq!(display_name("CHIDI_99@example.com"), "Chidi");
        assert_eq!(display_name("j.okafor@example.com"), "Okafor");
        assert_eq!(display_name("12345@example.com"), "Friend");
        assert_eq!(display_name(""), "Friend");
    }
}
