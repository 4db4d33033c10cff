//! livetuner-proxy: reconnecting fan-out relay for network TV tuners.
//!
//! A [`StreamSupervisor`] tells a tuner device to stream a channel to a local
//! UDP port, turns the RTP datagrams into a byte stream and shares that stream
//! with any number of consumers. Transient failures after the stream started
//! are retried without the consumers noticing.

pub mod logging;
pub mod server;
pub mod stream;
pub mod tuner;

#[cfg(test)]
mod testing;

pub use stream::{
    ConsumerHandle, MulticastRelay, PacketStreamAdapter, SessionError, StreamSupervisor,
    SupervisorConfig,
};
pub use tuner::{SessionState, StreamSession, TunerCommandClient};
