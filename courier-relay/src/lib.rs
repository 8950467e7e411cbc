pub mod registry;
pub mod relay;

pub use registry::{Audience, ConnectionRegistry, PayloadSender, Session};
pub use relay::NotificationRelay;
