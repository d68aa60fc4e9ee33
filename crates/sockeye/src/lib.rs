//! Asynchronous socket I/O over a poll-based reactor.
//!
//! An [`interface::Interface`] owns a pool of I/O worker threads, each
//! driving one [`reactor::Reactor`]. Stream, datagram, and listener sockets
//! created through the interface expose non-blocking operations whose
//! completions are delivered through callbacks or [`awaiter::Awaitable`]
//! handles on the worker threads.

pub mod awaiter;
pub mod buffer;
pub mod endpoint;
pub mod error;
pub mod executor;
pub mod framing;
pub mod global;
pub mod interface;
pub mod metrics;
pub mod queue;
pub mod reactor;
pub mod resolve;
pub mod session;
pub mod socket;
pub(crate) mod sys;

pub use error::{Error, ErrorKind, Result};
