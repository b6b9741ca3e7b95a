pub mod cli;
pub mod config;
pub mod queue;
pub mod store;
pub mod transport;

pub use queue::{spawn_drain_on_reconnect, DrainReport, OfflineQueue, QueueOptions, SendAttempt};
pub use store::{QueueStore, QueuedMessage};
pub use transport::{HttpTransport, Transport, TransportError};
