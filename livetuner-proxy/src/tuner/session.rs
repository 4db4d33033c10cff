//! Stream session identity, addressing and lifecycle state.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use livetuner_protocol::CONTROL_PORT;

/// Upper bound on the tuners probed on one device.
pub const MAX_TUNER_COUNT: u32 = 16;

/// Lifecycle of one logical live stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Created, not opened yet.
    Idle,
    /// First generation in progress, no data yet.
    Opening,
    /// Data is flowing.
    Streaming,
    /// A generation failed after data had flowed; re-issuing the start command.
    Reconnecting,
    /// Close requested, teardown running.
    Closing,
    /// Resources released. Terminal.
    Closed,
}

impl SessionState {
    /// Whether the session has begun or finished teardown.
    pub fn is_terminating(self) -> bool {
        matches!(self, SessionState::Closing | SessionState::Closed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Idle => "idle",
            SessionState::Opening => "opening",
            SessionState::Streaming => "streaming",
            SessionState::Reconnecting => "reconnecting",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// One open-to-close lifetime of a live feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSession {
    /// Unique id assigned by the session allocator.
    pub id: String,
    /// Catalog entry being watched.
    pub origin_stream_id: String,
    /// Tuner device address.
    pub remote_address: IpAddr,
    /// Tuner control port. Always [`CONTROL_PORT`] on real devices.
    pub control_port: u16,
    /// Local UDP port to receive datagrams on. 0 lets the OS pick one.
    pub local_port: u16,
    /// Channel to tune, e.g. `ch5`.
    pub feed_locator: String,
    /// Number of physical tuners on the device.
    pub tuner_count: u32,
}

impl StreamSession {
    /// Create a session. `tuner_count` is clamped to `1..=MAX_TUNER_COUNT`.
    pub fn new(
        id: impl Into<String>,
        origin_stream_id: impl Into<String>,
        remote_address: IpAddr,
        local_port: u16,
        feed_locator: impl Into<String>,
        tuner_count: u32,
    ) -> Self {
        Self {
            id: id.into(),
            origin_stream_id: origin_stream_id.into(),
            remote_address,
            control_port: CONTROL_PORT,
            local_port,
            feed_locator: feed_locator.into(),
            tuner_count: tuner_count.clamp(1, MAX_TUNER_COUNT),
        }
    }

    /// Override the control port (port-forwarded devices, loopback tests).
    pub fn with_control_port(mut self, port: u16) -> Self {
        self.control_port = port;
        self
    }

    /// Address of the device control endpoint.
    pub fn control_addr(&self) -> SocketAddr {
        SocketAddr::new(self.remote_address, self.control_port)
    }

    /// Wildcard address of the same family as the tuner, on the local port.
    pub fn local_bind_addr(&self) -> SocketAddr {
        let ip = match self.remote_address {
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        SocketAddr::new(ip, self.local_port)
    }
}
