mod slack;

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

use crate::config::{NotificationChannelType, NotificationConfig};

/// Events that trigger notifications
#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    TransferStarted {
        kind: String,
        job: String,
        transfer: String,
    },
    Completed {
        kind: String,
        job: String,
        deleted: usize,
        duration_secs: Option<i64>,
    },
    PartiallyFailed {
        kind: String,
        job: String,
        message: String,
    },
    Failed {
        kind: String,
        job: String,
        error: String,
    },
}

impl JobEvent {
    pub fn job(&self) -> &str {
        match self {
            JobEvent::TransferStarted { job, .. }
            | JobEvent::Completed { job, .. }
            | JobEvent::PartiallyFailed { job, .. }
            | JobEvent::Failed { job, .. } => job,
        }
    }
}

/// Trait for notification channel implementations (Slack, Discord, etc.)
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    async fn notify(&self, event: JobEvent) -> Result<()>;
}

/// Factory function to create a notifier based on config
pub fn create_notifier(config: &NotificationConfig) -> Option<Arc<dyn NotificationChannel>> {
    match &config.channel {
        NotificationChannelType::None => None,
        NotificationChannelType::Slack => {
            let webhook = config.slack_webhook.as_ref()?;
            if webhook.is_empty() {
                return None;
            }
            Some(Arc::new(slack::SlackNotifier::new(webhook.clone())))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_notifier_without_webhook() {
        let config = NotificationConfig {
            channel: NotificationChannelType::Slack,
            slack_webhook: Some(String::new()),
        };
        assert!(create_notifier(&config).is_none());
        assert!(create_notifier(&NotificationConfig::default()).is_none());
    }
}
