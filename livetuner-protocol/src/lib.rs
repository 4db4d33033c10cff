//! Control and transport protocol definitions for network TV tuners.
//!
//! Tuner devices are driven over a TCP control connection on port
//! [`CONTROL_PORT`] with GET/SET packets and deliver the tuned feed as RTP
//! datagrams: a [`RTP_HEADER_SIZE`]-byte header followed by
//! [`TS_PAYLOAD_SIZE`] bytes of MPEG-TS.
//!
//! # Packet Format
//!
//! ```text
//! +--------+--------+------------------+--------+
//! | Type   | Length |   TLV payload    | CRC-32 |
//! | u16 BE | u16 BE |    (variable)    | u32 LE |
//! +--------+--------+------------------+--------+
//! ```
//!
//! # Example
//!
//! ```rust
//! use livetuner_protocol::{ControlMessage, encode_control_message, decode_header, decode_control_message};
//!
//! let msg = ControlMessage::set("/tuner0/channel", "auto:5", Some(1234));
//! let encoded = encode_control_message(&msg).unwrap();
//!
//! let header = decode_header(&encoded).unwrap().unwrap();
//! let decoded = decode_control_message(&header, &encoded).unwrap();
//! assert_eq!(decoded, msg);
//! ```

pub mod codec;
pub mod error;
pub mod types;

pub use codec::{
    crc32, decode_control_message, decode_header, encode_control_message, FrameHeader, CRC_SIZE,
    HEADER_SIZE,
};
pub use error::ProtocolError;
pub use types::{
    channel_settings, target_url, tuner_variable, ControlMessage, PacketType, Tag, TunerCommand,
    CONTROL_PORT, MAX_CONTROL_PAYLOAD, MAX_DATAGRAM_SIZE, RTP_HEADER_SIZE, TS_PACKET_SIZE,
    TS_PAYLOAD_SIZE,
};
