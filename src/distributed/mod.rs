//! Distributed mode
//!
//! Workers can run on other hosts that share the database and temporary
//! directory paths with the coordinator:
//!
//! - **Node service**: listens for coordinator connections and hosts one worker
//!   driver per connection
//! - **Remote pool**: the coordinator side, a [`WorkerPool`] backed by TCP
//!   connections to node services
//!
//! [`WorkerPool`]: crate::coordinator::WorkerPool

pub mod coordinator;
pub mod node_service;
pub mod protocol;

pub use coordinator::RemotePool;
pub use node_service::NodeService;
pub use protocol::{
    ConfigMessage, ErrorMessage, Message, ProcessMessage, ReadyMessage, ShutdownMessage, PROTOCOL_VERSION,
};
