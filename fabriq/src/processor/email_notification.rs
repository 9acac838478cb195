//! Processor for transactional email notification jobs.
//!
//! Template content is owned by the mail service; this processor validates
//! the recipient, composes the outgoing message, and dispatches it. A
//! rejected message is a permanent business failure; an unreachable mail
//! service is thrown so the store retries the send.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{elapsed_ms, ActiveJob, JobError, JobResult, Processor, ProcessorError, ServiceError};
use crate::job::JobType;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailNotificationJobData {
    pub tenant_id: String,
    pub user_id: Option<String>,
    pub correlation_id: Option<String>,
    #[serde(rename = "type")]
    pub kind: EmailKind,
    pub recipient_email: String,
    pub recipient_name: Option<String>,
    #[serde(default)]
    pub template_data: Value,
    pub attachments: Option<Vec<AttachmentRef>>,
    #[serde(default)]
    pub cancelled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EmailKind {
    QuoteReady,
    QuoteAccepted,
    QuoteExpired,
    OrderShipped,
}

impl EmailKind {
    fn subject(&self) -> &'static str {
        match self {
            EmailKind::QuoteReady => "Your quote is ready",
            EmailKind::QuoteAccepted => "Your quote has been accepted",
            EmailKind::QuoteExpired => "Your quote has expired",
            EmailKind::OrderShipped => "Your order has shipped",
        }
    }

    fn template(&self) -> &'static str {
        match self {
            EmailKind::QuoteReady => "quote-ready",
            EmailKind::QuoteAccepted => "quote-accepted",
            EmailKind::QuoteExpired => "quote-expired",
            EmailKind::OrderShipped => "order-shipped",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentRef {
    pub filename: String,
    pub path: Option<String>,
}

/// A fully composed message handed to the mail service.
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingEmail {
    pub to: String,
    pub to_name: Option<String>,
    pub subject: String,
    pub template: String,
    pub template_data: Value,
    pub attachments: Vec<AttachmentRef>,
}

/// The external mail delivery service.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Mailer: Send + Sync {
    /// Returns the provider-assigned message id.
    async fn send(&self, email: OutgoingEmail) -> Result<String, ServiceError>;
}

pub struct EmailNotificationProcessor {
    mailer: Arc<dyn Mailer>,
}

impl EmailNotificationProcessor {
    pub fn new(mailer: Arc<dyn Mailer>) -> Self {
        Self { mailer }
    }
}

#[async_trait]
impl Processor for EmailNotificationProcessor {
    const KIND: JobType = JobType::EmailNotification;
    type Data = EmailNotificationJobData;

    async fn process(&self, job: ActiveJob<Self::Data>) -> Result<JobResult, ProcessorError> {
        let started = Instant::now();
        let data = job.data().clone();
        tracing::info!(
            job_id = %job.id(),
            tenant_id = %data.tenant_id,
            kind = ?data.kind,
            "Starting email notification to {}",
            data.recipient_email
        );

        job.report_progress(10, "Validating recipient", "validating").await;
        if !data.recipient_email.contains('@') {
            return Ok(JobResult::failure(
                JobError::new(
                    "INVALID_RECIPIENT",
                    format!("Invalid recipient address: {}", data.recipient_email),
                ),
                elapsed_ms(started),
            ));
        }

        job.report_progress(40, "Composing message", "composing").await;
        let email = OutgoingEmail {
            to: data.recipient_email.clone(),
            to_name: data.recipient_name.clone(),
            subject: data.kind.subject().to_owned(),
            template: data.kind.template().to_owned(),
            template_data: data.template_data.clone(),
            attachments: data.attachments.clone().unwrap_or_default(),
        };

        if job.is_cancelled().await {
            return Ok(JobResult::failure(
                JobError::new("CANCELLED", "Job cancelled before dispatch"),
                elapsed_ms(started),
            ));
        }

        job.report_progress(70, "Dispatching message", "sending").await;
        let message_id = match self.mailer.send(email).await {
            Ok(message_id) => message_id,
            Err(ServiceError::Unavailable(message)) => {
                return Err(ProcessorError::new("mailer_unavailable", message));
            }
            Err(ServiceError::Failed { code, message }) => {
                return Ok(JobResult::failure(
                    JobError::new(code, message),
                    elapsed_ms(started),
                ));
            }
        };

        job.report_progress(100, "Email notification completed", "done").await;
        Ok(JobResult::success(
            serde_json::json!({
                "messageId": message_id,
                "recipient": data.recipient_email,
            }),
            elapsed_ms(started),
        ))
    }
}
