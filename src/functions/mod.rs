pub mod dispatch;
pub mod listener;
pub mod outbox;
pub mod pool;

pub use dispatch::*;
pub use listener::*;
pub use outbox::*;
pub use pool::*;
