//! Datagram intake, fan-out and session supervision.
//!
//! - [`PacketStreamAdapter`]: RTP datagrams to a sequential byte stream
//! - [`MulticastRelay`]: one upstream, many independently paced consumers
//! - [`StreamSupervisor`]: open/reconnect/close state machine for a session

pub mod packet;
pub mod relay;
pub mod supervisor;

pub use packet::{ByteSource, PacketStreamAdapter, StreamError};
pub use relay::{
    ConsumerHandle, ConsumerId, ConsumerInfo, MulticastRelay, RelayConfig, RelayError,
    RELAY_CHUNK_SIZE,
};
pub use supervisor::{SessionError, StreamSupervisor, SupervisorConfig};
