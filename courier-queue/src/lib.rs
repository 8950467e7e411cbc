pub mod worker;

pub use worker::MailQueueWorker;
