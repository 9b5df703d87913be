use super::{JobEvent, NotificationChannel};
use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;

pub struct SlackNotifier {
    webhook_url: String,
    client: reqwest::Client,
}

impl SlackNotifier {
    pub fn new(webhook_url: String) -> Self {
        Self {
            webhook_url,
            client: reqwest::Client::new(),
        }
    }

    fn format_message(&self, event: &JobEvent) -> serde_json::Value {
        let (title, kind, job, detail) = match event {
            JobEvent::TransferStarted {
                kind,
                job,
                transfer,
            } => (
                "Transfer Started",
                kind,
                job,
                format!("*Trigger:*\n`{}`", transfer),
            ),
            JobEvent::Completed {
                kind,
                job,
                deleted,
                duration_secs,
            } => {
                let duration = duration_secs
                    .map(|secs| format!("{}s", secs))
                    .unwrap_or_else(|| "unknown".to_string());
                (
                    "Job Complete",
                    kind,
                    job,
                    format!("*Duration:*\n{} ({} staged resources reclaimed)", duration, deleted),
                )
            }
            JobEvent::PartiallyFailed { kind, job, message } => (
                "Transfer Failed",
                kind,
                job,
                format!("*Transfer:*\n```{}```", message),
            ),
            JobEvent::Failed { kind, job, error } => {
                ("Job Failed", kind, job, format!("*Error:*\n```{}```", error))
            }
        };

        json!({
            "blocks": [
                {
                    "type": "header",
                    "text": {
                        "type": "plain_text",
                        "text": title,
                        "emoji": true
                    }
                },
                {
                    "type": "section",
                    "fields": [
                        {
                            "type": "mrkdwn",
                            "text": format!("*Kind:*\n{}", kind)
                        },
                        {
                            "type": "mrkdwn",
                            "text": format!("*Job:*\n`{}`", job)
                        }
                    ]
                },
                {
                    "type": "section",
                    "text": {
                        "type": "mrkdwn",
                        "text": detail
                    }
                }
            ]
        })
    }
}

#[async_trait]
impl NotificationChannel for SlackNotifier {
    async fn notify(&self, event: JobEvent) -> Result<()> {
        let payload = self.format_message(&event);
        self.client
            .post(&self.webhook_url)
            .json(&payload)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failed_message_carries_error() {
        let notifier = SlackNotifier::new("http://localhost/hook".into());
        let payload = notifier.format_message(&JobEvent::Failed {
            kind: "VolumeSnapshotBackup".into(),
            job: "apps/b1".into(),
            error: "secret missing".into(),
        });
        assert_eq!(payload["blocks"][0]["text"]["text"], "Job Failed");
        let detail = payload["blocks"][2]["text"]["text"].as_str().unwrap();
        assert!(detail.contains("secret missing"));
    }
}
