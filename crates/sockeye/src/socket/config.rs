//! Socket configuration and per-operation option bags.

use std::os::fd::RawFd;

use serde::{Deserialize, Serialize};
use sockeye_timing::{Duration, Nanos};
use tracing::debug;

use crate::{
    endpoint::{Endpoint, IpAddress, IpAddressType, TransportProtocol},
    error::{ErrorKind, Result},
    queue::CancelToken,
    sys,
};

/// Linger behavior on close.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Linger {
    pub enabled: bool,
    /// Whole seconds the close may block flushing.
    pub duration: u32,
}

/// Kernel-level socket options. Every field is nullable; `None` means
/// "inherit or platform default" and emits no syscall.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SocketConfig {
    pub reuse_address: Option<bool>,
    pub keep_alive: Option<bool>,
    pub cork: Option<bool>,
    /// `false` disables Nagle (sets `TCP_NODELAY`).
    pub delay_transmission: Option<bool>,
    /// `false` requests immediate acknowledgements (`TCP_QUICKACK`).
    pub delay_acknowledgement: Option<bool>,
    pub send_buffer_size: Option<u32>,
    pub send_buffer_low_watermark: Option<u32>,
    pub receive_buffer_size: Option<u32>,
    pub receive_buffer_low_watermark: Option<u32>,
    pub debug: Option<bool>,
    pub linger: Option<Linger>,
    pub broadcast: Option<bool>,
    pub bypass_routing: Option<bool>,
    pub inline_out_of_band_data: Option<bool>,
    pub timestamp_incoming: Option<bool>,
    pub timestamp_outgoing: Option<bool>,
    pub zero_copy: Option<bool>,
}

impl SocketConfig {
    /// Applies every set field to `fd`. Options the transport does not
    /// support are skipped.
    pub(crate) fn apply(&self, fd: RawFd) -> Result<()> {
        let mut apply = |result: Result<()>| match result {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::Unsupported => {
                debug!(fd, %err, "skipping unsupported socket option");
                Ok(())
            }
            Err(err) => Err(err),
        };

        if let Some(v) = self.reuse_address {
            apply(sys::set_option_bool(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, v))?;
        }
        if let Some(v) = self.keep_alive {
            apply(sys::set_option_bool(fd, libc::SOL_SOCKET, libc::SO_KEEPALIVE, v))?;
        }
        if let Some(v) = self.cork {
            apply(sys::set_option_bool(fd, libc::IPPROTO_TCP, libc::TCP_CORK, v))?;
        }
        if let Some(v) = self.delay_transmission {
            apply(sys::set_option_bool(fd, libc::IPPROTO_TCP, libc::TCP_NODELAY, !v))?;
        }
        if let Some(v) = self.delay_acknowledgement {
            apply(sys::set_option_bool(fd, libc::IPPROTO_TCP, libc::TCP_QUICKACK, !v))?;
        }
        if let Some(v) = self.send_buffer_size {
            apply(sys::set_option_int(fd, libc::SOL_SOCKET, libc::SO_SNDBUF, v as i32))?;
        }
        if let Some(v) = self.send_buffer_low_watermark {
            apply(sys::set_option_int(fd, libc::SOL_SOCKET, libc::SO_SNDLOWAT, v as i32))?;
        }
        if let Some(v) = self.receive_buffer_size {
            apply(sys::set_option_int(fd, libc::SOL_SOCKET, libc::SO_RCVBUF, v as i32))?;
        }
        if let Some(v) = self.receive_buffer_low_watermark {
            apply(sys::set_option_int(fd, libc::SOL_SOCKET, libc::SO_RCVLOWAT, v as i32))?;
        }
        if let Some(v) = self.debug {
            apply(sys::set_option_bool(fd, libc::SOL_SOCKET, libc::SO_DEBUG, v))?;
        }
        if let Some(linger) = self.linger {
            apply(sys::set_option_linger(fd, linger.enabled, linger.duration as i32))?;
        }
        if let Some(v) = self.broadcast {
            apply(sys::set_option_bool(fd, libc::SOL_SOCKET, libc::SO_BROADCAST, v))?;
        }
        if let Some(v) = self.bypass_routing {
            apply(sys::set_option_bool(fd, libc::SOL_SOCKET, libc::SO_DONTROUTE, v))?;
        }
        if let Some(v) = self.inline_out_of_band_data {
            apply(sys::set_option_bool(fd, libc::SOL_SOCKET, libc::SO_OOBINLINE, v))?;
        }
        if let Some(v) = self.timestamp_incoming {
            apply(sys::set_option_bool(fd, libc::SOL_SOCKET, libc::SO_TIMESTAMPNS, v))?;
        }
        if let Some(v) = self.timestamp_outgoing {
            let flags = if v {
                (libc::SOF_TIMESTAMPING_TX_SOFTWARE | libc::SOF_TIMESTAMPING_SOFTWARE) as i32
            } else {
                0
            };
            apply(sys::set_option_int(fd, libc::SOL_SOCKET, libc::SO_TIMESTAMPING, flags))?;
        }
        if let Some(v) = self.zero_copy {
            apply(sys::set_option_bool(fd, libc::SOL_SOCKET, libc::SO_ZEROCOPY, v))?;
        }
        Ok(())
    }
}

/// Construction options for stream and datagram sockets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamSocketOptions {
    pub config: SocketConfig,
    /// Bind before connecting when set.
    pub source_endpoint: Option<Endpoint>,
    pub send_queue_low_watermark: usize,
    pub send_queue_high_watermark: usize,
    pub receive_queue_low_watermark: usize,
    pub receive_queue_high_watermark: usize,
    /// Leave the send side open after a peer-initiated receive shutdown.
    pub keep_half_open: bool,
    /// Bounds on one read's buffer allocation, rounded up to the buffer
    /// pool's buffer size.
    pub min_incoming_transfer_size: usize,
    pub max_incoming_transfer_size: usize,
    /// Default cap on buffers per gather batch.
    pub max_gather_buffers: usize,
}

impl Default for StreamSocketOptions {
    fn default() -> Self {
        Self {
            config: SocketConfig::default(),
            source_endpoint: None,
            send_queue_low_watermark: 0,
            send_queue_high_watermark: usize::MAX,
            receive_queue_low_watermark: 0,
            receive_queue_high_watermark: usize::MAX,
            keep_half_open: false,
            min_incoming_transfer_size: 1,
            max_incoming_transfer_size: 64 * 1024,
            max_gather_buffers: sys::MAX_GATHER_BUFFERS,
        }
    }
}

/// Construction options for datagram sockets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatagramSocketOptions {
    pub config: SocketConfig,
    /// Bind before use when set.
    pub source_endpoint: Option<Endpoint>,
    pub send_queue_low_watermark: usize,
    pub send_queue_high_watermark: usize,
    pub receive_queue_low_watermark: usize,
    pub receive_queue_high_watermark: usize,
    /// Largest datagram one read must be able to hold, rounded up to the
    /// buffer pool's buffer size.
    pub max_incoming_transfer_size: usize,
    pub max_gather_buffers: usize,
}

impl Default for DatagramSocketOptions {
    fn default() -> Self {
        Self {
            config: SocketConfig::default(),
            source_endpoint: None,
            send_queue_low_watermark: 0,
            send_queue_high_watermark: usize::MAX,
            receive_queue_low_watermark: 0,
            receive_queue_high_watermark: usize::MAX,
            max_incoming_transfer_size: 64 * 1024,
            max_gather_buffers: sys::MAX_GATHER_BUFFERS,
        }
    }
}

/// Listener construction options: the accepted-socket configuration plus
/// the listen/admission parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerOptions {
    /// Options applied to every accepted socket.
    pub stream: StreamSocketOptions,
    pub source_endpoint: Option<Endpoint>,
    pub backlog: u32,
    pub accept_queue_low_watermark: usize,
    pub accept_queue_high_watermark: usize,
    /// Accept in a loop per readable event rather than once.
    pub accept_greedily: bool,
    /// Policy for placing accepted sockets; `None` inherits the
    /// interface's policy.
    pub load_balancing: Option<crate::interface::LoadBalancing>,
}

impl Default for ListenerOptions {
    fn default() -> Self {
        Self {
            stream: StreamSocketOptions::default(),
            source_endpoint: None,
            backlog: 1024,
            accept_queue_low_watermark: 0,
            accept_queue_high_watermark: usize::MAX,
            accept_greedily: true,
            load_balancing: None,
        }
    }
}

/// Options for one connect attempt (by endpoint or by name).
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub token: Option<CancelToken>,
    /// Additional attempts after the first failure.
    pub retry_count: u32,
    pub retry_interval: Duration,
    /// Address used when the name resolves to nothing.
    pub ip_address_fallback: Option<IpAddress>,
    pub ip_address_type: IpAddressType,
    /// Modular index into the resolved address set.
    pub ip_address_selector: Option<usize>,
    /// Port used when the service resolves to nothing.
    pub port_fallback: Option<u16>,
    pub port_selector: Option<usize>,
    pub transport: Option<TransportProtocol>,
    pub deadline: Option<Nanos>,
    /// Ask upstream servers to recurse during resolution.
    pub recurse: bool,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            token: None,
            retry_count: 0,
            retry_interval: Duration::from_secs(1),
            ip_address_fallback: None,
            ip_address_type: IpAddressType::Any,
            ip_address_selector: None,
            port_fallback: None,
            port_selector: None,
            transport: None,
            deadline: None,
            recurse: true,
        }
    }
}
