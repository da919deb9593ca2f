//! Realtime session layer: websocket transport and the session driver task.
//!
//! `chatter-core` defines what a session does; this crate makes it run by
//! opening tokio-tungstenite connections, feeding decoded frames through the
//! state machine, and executing the effects it returns.

/// Session driver task and caller-facing handle.
pub mod driver;
/// Transport trait seam and the websocket implementation.
pub mod transport;

pub use driver::{RealtimeConfig, SessionHandle};
pub use transport::{
    Connector, Transport, TransportError, TransportEvent, WsConnector, WsTransport,
    session_endpoint_url,
};
