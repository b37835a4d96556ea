use super::OutgoingEmail;
use crate::orchestration::error::StepError;
use crate::shared::fs_atomic::write_file_atomically;
use serde_json::json;
use std::path::{Path, PathBuf};

/// Delivery seam for the email handler. Returns the provider message id.
pub trait EmailTransport: Send + Sync {
    fn send_simple(&self, email: &OutgoingEmail) -> Result<String, StepError>;

    fn send_raw(&self, email: &OutgoingEmail, raw_message: &[u8]) -> Result<String, StepError>;
}

/// Writes each message into a local outbox directory instead of sending it:
/// `<id>.json` for every message plus `<id>.eml` for raw MIME sends.
#[derive(Debug, Clone)]
pub struct OutboxEmailTransport {
    dir: PathBuf,
}

impl OutboxEmailTransport {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn write(&self, path: &Path, content: &[u8]) -> Result<(), StepError> {
        write_file_atomically(path, content).map_err(|err| {
            StepError::transient(format!("failed to write outbox file {}: {err}", path.display()))
        })
    }

    fn write_summary(
        &self,
        message_id: &str,
        email: &OutgoingEmail,
        raw: bool,
    ) -> Result<(), StepError> {
        let summary = json!({
            "messageId": message_id,
            "from": email.from,
            "to": email.to,
            "cc": email.cc,
            "bcc": email.bcc,
            "replyTo": email.reply_to,
            "subject": email.subject,
            "body": email.body,
            "bodyFormat": email.body_format,
            "attachments": email
                .attachments
                .iter()
                .map(|a| {
                    json!({
                        "filename": a.filename,
                        "contentType": a.content_type,
                        "size": a.data.len()
                    })
                })
                .collect::<Vec<_>>(),
            "raw": raw,
        });
        let body = serde_json::to_vec_pretty(&summary).map_err(|err| {
            StepError::permanent(format!("failed to encode outbox summary: {err}"))
        })?;
        self.write(&self.dir.join(format!("{message_id}.json")), &body)
    }
}

impl EmailTransport for OutboxEmailTransport {
    fn send_simple(&self, email: &OutgoingEmail) -> Result<String, StepError> {
        let message_id = uuid::Uuid::new_v4().to_string();
        self.write_summary(&message_id, email, false)?;
        Ok(message_id)
    }

    fn send_raw(&self, email: &OutgoingEmail, raw_message: &[u8]) -> Result<String, StepError> {
        let message_id = uuid::Uuid::new_v4().to_string();
        self.write(&self.dir.join(format!("{message_id}.eml")), raw_message)?;
        self.write_summary(&message_id, email, true)?;
        Ok(message_id)
    }
}
