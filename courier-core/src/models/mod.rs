pub mod mail;
pub mod notification;

pub use mail::{DeadLetter, MailKind, MailMessage};
pub use notification::NotificationPayload;
