//! Socket state machines for the three socket kinds.

pub mod config;
pub mod datagram;
pub mod listener;
pub mod stream;

use std::sync::Arc;

use crate::{endpoint::Endpoint, error::Result};

pub use config::{
    ConnectOptions, DatagramSocketOptions, ListenerOptions, SocketConfig, StreamSocketOptions,
};
pub use datagram::DatagramSocket;
pub use listener::ListenerSocket;
pub use stream::StreamSocket;

/// Lifecycle of a socket. A socket is always in exactly one state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    /// Created, no descriptor attached to a reactor yet.
    Detached,
    /// Descriptor attached to a reactor, not yet connected/listening.
    Attached,
    /// Connected (stream/datagram) or listening.
    Active,
    /// Send side closing once the send queue drains.
    ShuttingDownSend,
    /// Receive side has seen or issued EOF; send side still open.
    ShuttingDownReceive,
    /// Both directions down; descriptor still held.
    ShutDown,
    /// Descriptor released.
    Closed,
}

/// Which direction of a full-duplex socket to shut down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownDirection {
    Send,
    Receive,
}

/// Completion of a connect request.
#[derive(Debug)]
pub struct ConnectEvent {
    pub result: Result<()>,
    /// Peer the socket ended up connected to.
    pub endpoint: Option<Endpoint>,
}

/// Completion of an accept request.
pub struct AcceptEvent {
    pub result: Result<Arc<StreamSocket>>,
    pub peer: Option<Endpoint>,
}

/// Announcement that one direction finished shutting down.
#[derive(Debug, Clone, Copy)]
pub struct ShutdownEvent {
    pub direction: ShutdownDirection,
}

/// One-shot send-queue watermark announcement.
///
/// High and low strictly alternate, starting with high: the enqueue that
/// reaches the high boundary authorizes `HighWatermark` (further sends
/// observe `WouldBlock`), and the drain that reaches the low boundary
/// authorizes `LowWatermark` and re-admits sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendQueueEvent {
    HighWatermark,
    LowWatermark,
}
