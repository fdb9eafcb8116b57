//! Connection layer: the duplex link to the message server, its lifecycle
//! state machine, heartbeat, reconnect backoff and the outbound dispatch
//! queue.

pub mod backoff;
pub mod connection;
pub mod error;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
pub mod queue;
pub mod transport;

pub use backoff::Backoff;
pub use connection::{
    spawn_connection, ConnectionConfig, ConnectionHandle, ConnectionNotification,
    ConnectionSnapshot,
};
pub use error::{NetError, TransportError, TransportResult};
pub use queue::DispatchQueue;
pub use transport::{Connector, FrameSink, Link, TransportEvent, WebSocketConnector};
