pub mod address;
pub mod outbox_store;
pub mod transport;

pub use address::*;
pub use outbox_store::*;
pub use transport::*;
