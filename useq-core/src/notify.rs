use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::Result;
use crate::lims::RunMetadata;
use crate::pipeline::run::{RunRecord, Stage};
use crate::storage::StorageSnapshot;

/// Addressing for operator notifications.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    pub sender: Option<String>,
    pub recipients: Vec<String>,
}

/// A message handed to the delivery collaborator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub recipients: Vec<String>,
    pub subject: String,
    pub body: String,
}

impl Notification {
    pub fn run_failed(
        recipients: &[String],
        record: &RunRecord,
        stage: Stage,
        error: &str,
        metadata: Option<&RunMetadata>,
    ) -> Self {
        let mut body = format!(
            "Run {} failed during {stage}.\n\nPath: {}\nAttempts: {}\nError: {error}\n",
            record.run_id,
            record.path.display(),
            record.retry_count,
        );
        if let Some(metadata) = metadata {
            body.push_str(&format!("Project: {}\n", metadata.project_id));
        }
        body.push_str(&format!(
            "\nRe-arm with `useq runs rearm {}` once resolved.\n",
            record.run_id
        ));
        Self {
            recipients: recipients.to_vec(),
            subject: format!("[USEQ] Run {} failed ({stage})", record.run_id),
            body,
        }
    }

    pub fn storage_breached(
        recipients: &[String],
        snapshot: &StorageSnapshot,
        threshold_bytes: u64,
    ) -> Self {
        Self {
            recipients: recipients.to_vec(),
            subject: "[USEQ] Remote storage threshold reached".to_string(),
            body: format!(
                "Free space on the remote storage dropped to {} bytes \
                 (threshold {threshold_bytes} bytes, used {} of {} bytes).\n\
                 Transfers are deferred until space is released.\n",
                snapshot.free_bytes, snapshot.used_bytes, snapshot.total_bytes,
            ),
        }
    }

    pub fn storage_cleared(
        recipients: &[String],
        snapshot: &StorageSnapshot,
    ) -> Self {
        Self {
            recipients: recipients.to_vec(),
            subject: "[USEQ] Remote storage threshold cleared".to_string(),
            body: format!(
                "Free space on the remote storage recovered to {} bytes \
                 (used {} of {} bytes). Transfers resume on the next cycle.\n",
                snapshot.free_bytes, snapshot.used_bytes, snapshot.total_bytes,
            ),
        }
    }
}

/// Delivery collaborator. The core only produces message content.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: Notification) -> Result<()>;
}

/// Notifier that logs the message it would send.
#[derive(Clone, Debug, Default)]
pub struct TracingNotifier {
    sender: Option<String>,
}

impl TracingNotifier {
    pub fn new(sender: Option<String>) -> Self {
        Self { sender }
    }
}

#[async_trait]
impl Notifier for TracingNotifier {
    async fn notify(&self, notification: Notification) -> Result<()> {
        info!(
            target: "notify",
            sender = self.sender.as_deref().unwrap_or("-"),
            recipients = %notification.recipients.join(","),
            subject = %notification.subject,
            body = %notification.body,
            "notification"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lims::MetadataField;
    use crate::pipeline::run::ConversionFlags;
    use crate::types::ids::RunId;
    use std::path::PathBuf;

    #[test]
    fn failure_message_names_run_stage_and_project() {
        let record = RunRecord::discovered(
            RunId::new("R7").unwrap(),
            PathBuf::from("/runs/R7"),
            ConversionFlags::default(),
        );
        let metadata = RunMetadata {
            project_id: MetadataField::Unavailable,
            barcode_mismatches: MetadataField::Unavailable,
            contact_email: MetadataField::Available("pi@lab.example".into()),
        };
        let msg = Notification::run_failed(
            &["ops@lab.example".to_string()],
            &record,
            Stage::Transfer,
            "checksum mismatch",
            Some(&metadata),
        );
        assert_eq!(msg.recipients, vec!["ops@lab.example".to_string()]);
        assert!(msg.subject.contains("R7"));
        assert!(msg.body.contains("transfer"));
        assert!(msg.body.contains("checksum mismatch"));
        assert!(msg.body.contains("Project: NA"));
    }
}
