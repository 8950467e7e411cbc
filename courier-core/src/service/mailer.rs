//! Outbound mail transport
//!
//! The queue worker decides *whether* to send; this module only knows
//! *how*. One delivery attempt per call; retry policy lives with the
//! caller.

use async_trait::async_trait;
use lettre::{
    message::{header::ContentType, Mailbox},
    transport::smtp::authentication::Credentials,
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use tracing::info;

use crate::config::MailConfig;
use crate::models::MailMessage;

/// Mask an email address for safe logging: `user***@example.com`
#[must_use]
pub fn mask_email(email: &str) -> String {
    if let Some(at_pos) = email.find('@') {
        let local = &email[..at_pos];
        let domain = &email[at_pos..];
        let visible = local.len().min(3);
        format!("{}***{}", &local[..visible], domain)
    } else {
        "***".to_string()
    }
}

/// Mail delivery error
#[derive(Debug, thiserror::Error)]
pub enum MailError {
    #[error("Mail transport not configured")]
    NotConfigured,

    #[error("Invalid email address: {0}")]
    InvalidAddress(String),

    #[error("Send error: {0}")]
    Send(String),
}

/// One-shot mail delivery seam between the queue worker and SMTP
#[async_trait]
pub trait MailTransport: Send + Sync {
    /// Attempt to deliver `mail` once; success or failure is reported
    /// back to the caller, which owns retries.
    async fn deliver(&self, mail: &MailMessage) -> Result<(), MailError>;
}

/// SMTP mail transport backed by lettre
#[derive(Clone)]
pub struct SmtpMailer {
    config: MailConfig,
}

impl std::fmt::Debug for SmtpMailer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmtpMailer")
            .field("smtp_host", &self.config.smtp_host)
            .field("smtp_port", &self.config.smtp_port)
            .field("use_tls", &self.config.use_tls)
            .finish()
    }
}

impl SmtpMailer {
    pub fn new(config: MailConfig) -> Result<Self, MailError> {
        if config.smtp_host.is_empty() || config.from_email.is_empty() {
            return Err(MailError::NotConfigured);
        }
        Ok(Self { config })
    }

    fn build_message(&self, mail: &MailMessage) -> Result<Message, MailError> {
        let from_mailbox: Mailbox =
            format!("{} <{}>", self.config.from_name, self.config.from_email)
                .parse()
                .map_err(|e| MailError::InvalidAddress(format!("from address: {e}")))?;

        let to_mailbox: Mailbox = mail
            .to
            .parse()
            .map_err(|e| MailError::InvalidAddress(format!("to address: {e}")))?;

        Message::builder()
            .from(from_mailbox)
            .to(to_mailbox)
            .subject(&mail.subject)
            .header(ContentType::TEXT_HTML)
            .body(mail.html.clone())
            .map_err(|e| MailError::Send(format!("Failed to build email: {e}")))
    }

    fn build_transport(&self) -> Result<AsyncSmtpTransport<Tokio1Executor>, MailError> {
        let creds = Credentials::new(
            self.config.smtp_username.clone(),
            self.config.smtp_password.clone(),
        );

        let transport = if self.config.use_tls {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&self.config.smtp_host)
                .map_err(|e| MailError::Send(format!("Failed to create SMTP transport: {e}")))?
                .credentials(creds)
                .port(self.config.smtp_port)
                .build()
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&self.config.smtp_host)
                .credentials(creds)
                .port(self.config.smtp_port)
                .build()
        };

        Ok(transport)
    }
}

#[async_trait]
impl MailTransport for SmtpMailer {
    async fn deliver(&self, mail: &MailMessage) -> Result<(), MailError> {
        let message = self.build_message(mail)?;
        let transport = self.build_transport()?;

        transport
            .send(message)
            .await
            .map_err(|e| MailError::Send(format!("Failed to send email: {e}")))?;

        info!(
            to = %mask_email(&mail.to),
            smtp = %format!("{}:{}", self.config.smtp_host, self.config.smtp_port),
            "Email sent"
        );

        Ok(())
    }
}
