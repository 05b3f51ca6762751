pub mod message;
pub mod outbox;

pub use message::*;
pub use outbox::*;
