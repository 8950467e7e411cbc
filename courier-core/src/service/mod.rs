pub mod mailer;

pub use mailer::{MailError, MailTransport, SmtpMailer};
