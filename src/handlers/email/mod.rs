pub mod address;
pub mod mime;
pub mod transport;

pub use address::{mailbox, split_address_list, validate_address};
pub use transport::{EmailTransport, OutboxEmailTransport};

use super::{StepHandler, StepHandlerOutput};
use crate::definition::{EmailBodyFormat, EmailConfig, ResolvedStep, StepPayload};
use crate::orchestration::error::StepError;
use crate::orchestration::state::FlowRuntimeState;
use crate::orchestration::template::render_against;
use crate::storage::{PayloadOffloader, S3Pointer};
use serde_json::{json, Map, Value};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailAttachment {
    pub filename: String,
    pub content_type: String,
    pub data: Vec<u8>,
}

/// A fully rendered and validated message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingEmail {
    pub from: String,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub reply_to: Vec<String>,
    pub subject: String,
    pub body: String,
    pub body_format: EmailBodyFormat,
    pub attachments: Vec<EmailAttachment>,
}

pub struct EmailHandler {
    transport: Arc<dyn EmailTransport>,
    offloader: Option<Arc<PayloadOffloader>>,
    max_attachment_bytes: usize,
}

fn validate_structure(config: &EmailConfig) -> Result<(), StepError> {
    for (field, value) in [
        ("from", &config.from),
        ("to", &config.to),
        ("subject", &config.subject),
    ] {
        if value.trim().is_empty() {
            return Err(StepError::permanent(format!("email `{field}` must be set")));
        }
    }
    Ok(())
}

fn render_field(field: &str, template: &str, context: &Value) -> Result<String, StepError> {
    render_against(template, context)
        .map_err(|reason| StepError::permanent(format!("email `{field}`: {reason}")))
}

fn resolved_addresses(field: &str, rendered: &str) -> Result<Vec<String>, StepError> {
    let addresses = split_address_list(rendered);
    for address in &addresses {
        validate_address(address)
            .map_err(|reason| StepError::permanent(format!("email `{field}`: {reason}")))?;
    }
    Ok(addresses)
}

impl EmailHandler {
    pub fn new(
        transport: Arc<dyn EmailTransport>,
        offloader: Option<Arc<PayloadOffloader>>,
        max_attachment_bytes: usize,
    ) -> Self {
        Self {
            transport,
            offloader,
            max_attachment_bytes,
        }
    }

    fn attachments(&self, input: &Map<String, Value>) -> Result<Vec<EmailAttachment>, StepError> {
        let Some(items) = input.get("attachments").and_then(Value::as_array) else {
            return Ok(Vec::new());
        };
        if items.is_empty() {
            return Ok(Vec::new());
        }
        let offloader = self.offloader.as_ref().ok_or_else(|| {
            StepError::permanent("email attachments require a configured blob store")
        })?;

        let mut attachments = Vec::with_capacity(items.len());
        let mut total = 0usize;
        for (index, item) in items.iter().enumerate() {
            let source = item.get("source").unwrap_or(item);
            let pointer = S3Pointer::from_wrapper(source)
                .or_else(|| S3Pointer::from_value(source))
                .ok_or_else(|| {
                    StepError::permanent(format!("attachments[{index}] has no blob pointer"))
                })?;
            let object = offloader.get_raw(&pointer)?;
            total = total.saturating_add(object.body.len());
            if total > self.max_attachment_bytes {
                return Err(StepError::permanent(format!(
                    "email attachments exceed the {} byte limit",
                    self.max_attachment_bytes
                )));
            }
            let filename = item
                .get("filename")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| {
                    pointer
                        .key
                        .rsplit('/')
                        .next()
                        .unwrap_or("attachment")
                        .to_string()
                });
            let content_type = item
                .get("contentType")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or(object.content_type);
            attachments.push(EmailAttachment {
                filename,
                content_type,
                data: object.body,
            });
        }
        Ok(attachments)
    }

    fn compose(
        &self,
        config: &EmailConfig,
        input: &Map<String, Value>,
    ) -> Result<OutgoingEmail, StepError> {
        validate_structure(config)?;
        let context = Value::Object(input.clone());
        let optional = |field: &str, template: &Option<String>| -> Result<Vec<String>, StepError> {
            match template {
                Some(template) => {
                    resolved_addresses(field, &render_field(field, template, &context)?)
                }
                None => Ok(Vec::new()),
            }
        };

        let from = render_field("from", &config.from, &context)?;
        validate_address(&from)
            .map_err(|reason| StepError::permanent(format!("email `from`: {reason}")))?;
        let to = resolved_addresses("to", &render_field("to", &config.to, &context)?)?;
        if to.is_empty() {
            return Err(StepError::permanent("email `to` resolved to no recipients"));
        }

        Ok(OutgoingEmail {
            from,
            to,
            cc: optional("cc", &config.cc)?,
            bcc: optional("bcc", &config.bcc)?,
            reply_to: optional("replyTo", &config.reply_to)?,
            subject: render_field("subject", &config.subject, &context)?,
            body: render_field("body", &config.body, &context)?,
            body_format: config.body_format,
            attachments: self.attachments(input)?,
        })
    }
}

impl StepHandler for EmailHandler {
    fn handle(
        &self,
        step: &ResolvedStep,
        input: &Map<String, Value>,
        _state: &FlowRuntimeState,
    ) -> Result<StepHandlerOutput, StepError> {
        let StepPayload::Email(config) = &step.payload else {
            return Err(StepError::permanent("email handler needs an EMAIL step"));
        };
        let email = self.compose(config, input)?;

        let (message_id, mode) = if email.attachments.is_empty() {
            (self.transport.send_simple(&email)?, "SIMPLE")
        } else {
            let boundary = format!("allma-{}", uuid::Uuid::new_v4().simple());
            let raw = mime::build_raw_message(&email, &boundary);
            (self.transport.send_raw(&email, &raw)?, "RAW")
        };
        tracing::info!(
            step_instance_id = %step.step_instance_id,
            message_id = %message_id,
            recipients = email.to.len() + email.cc.len() + email.bcc.len(),
            mode,
            "email sent"
        );

        Ok(StepHandlerOutput::data(json!({
            "messageId": message_id,
            "to": email.to,
            "attachmentCount": email.attachments.len(),
            "mode": mode,
        })))
    }
}
