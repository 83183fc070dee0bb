//! Bus-facing side of the gateway.
//!
//! The connection supervisor owns the connection, the channel supervisor owns
//! the current channel and dispatches its events, and the handler runs the
//! call protocol on top of both.

pub mod connection;
pub mod handler;
pub mod supervisor;

pub use connection::ConnectionSupervisor;
pub use handler::RpcHandler;
pub use supervisor::{ActiveChannel, ChannelSupervisor};
