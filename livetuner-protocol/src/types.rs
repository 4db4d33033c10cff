//! Message type definitions for the tuner control protocol.

use std::net::IpAddr;

/// TCP port on which tuner devices accept control connections.
pub const CONTROL_PORT: u16 = 65001;

/// Size of the RTP header in front of every media datagram.
pub const RTP_HEADER_SIZE: usize = 12;

/// MPEG-TS packet size.
pub const TS_PACKET_SIZE: usize = 188;

/// Media payload carried by one datagram: 7 TS packets (1316 bytes).
pub const TS_PAYLOAD_SIZE: usize = TS_PACKET_SIZE * 7;

/// Largest datagram a device will send: header plus one payload.
pub const MAX_DATAGRAM_SIZE: usize = RTP_HEADER_SIZE + TS_PAYLOAD_SIZE;

/// Maximum control packet payload accepted by device firmware.
pub const MAX_CONTROL_PAYLOAD: usize = 1452;

/// Control packet types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum PacketType {
    /// GET/SET request sent to the device.
    GetSetRequest = 0x0004,
    /// GET/SET reply from the device.
    GetSetReply = 0x0005,
}

impl TryFrom<u16> for PacketType {
    type Error = u16;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0x0004 => Ok(PacketType::GetSetRequest),
            0x0005 => Ok(PacketType::GetSetReply),
            other => Err(other),
        }
    }
}

impl From<PacketType> for u16 {
    fn from(value: PacketType) -> Self {
        value as u16
    }
}

/// TLV tags used inside GET/SET packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Tag {
    GetSetName = 0x03,
    GetSetValue = 0x04,
    ErrorMessage = 0x05,
    GetSetLockkey = 0x15,
}

impl TryFrom<u8> for Tag {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x03 => Ok(Tag::GetSetName),
            0x04 => Ok(Tag::GetSetValue),
            0x05 => Ok(Tag::ErrorMessage),
            0x15 => Ok(Tag::GetSetLockkey),
            other => Err(other),
        }
    }
}

/// A decoded control message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// Read (`value == None`) or write a device variable.
    GetSetRequest {
        name: String,
        value: Option<String>,
        lockkey: Option<u32>,
    },
    /// Device answer. `error` is set when the device refused the request.
    GetSetReply {
        name: String,
        value: Option<String>,
        error: Option<String>,
    },
}

impl ControlMessage {
    /// Build a SET request for `name`.
    pub fn set(name: impl Into<String>, value: impl Into<String>, lockkey: Option<u32>) -> Self {
        ControlMessage::GetSetRequest {
            name: name.into(),
            value: Some(value.into()),
            lockkey,
        }
    }

    /// Build a GET request for `name`.
    pub fn get(name: impl Into<String>) -> Self {
        ControlMessage::GetSetRequest {
            name: name.into(),
            value: None,
            lockkey: None,
        }
    }

    /// Packet type used on the wire.
    pub fn packet_type(&self) -> PacketType {
        match self {
            ControlMessage::GetSetRequest { .. } => PacketType::GetSetRequest,
            ControlMessage::GetSetReply { .. } => PacketType::GetSetReply,
        }
    }

    /// Variable name this message refers to.
    pub fn name(&self) -> &str {
        match self {
            ControlMessage::GetSetRequest { name, .. } | ControlMessage::GetSetReply { name, .. } => {
                name
            }
        }
    }

    /// Claim `tuner` with `lockkey`. Other clients cannot retune it until released.
    pub fn claim_lockkey(tuner: u32, lockkey: u32) -> Self {
        ControlMessage::set(tuner_variable(tuner, "lockkey"), lockkey.to_string(), None)
    }
}

/// Path of a per-tuner device variable, e.g. `/tuner1/target`.
pub fn tuner_variable(tuner: u32, name: &str) -> String {
    format!("/tuner{}/{}", tuner, name)
}

/// Split a feed locator into the device `channel` value and optional `program`.
///
/// `ch5` becomes `auto:5`, `ch5-3` becomes `auto:5` with program `3`.
/// Anything else is handed to the device verbatim.
pub fn channel_settings(feed_locator: &str) -> (String, Option<String>) {
    if let Some(rest) = feed_locator.strip_prefix("ch") {
        let (channel, program) = match rest.split_once('-') {
            Some((c, p)) => (c, Some(p)),
            None => (rest, None),
        };
        let is_number = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
        if is_number(channel) && program.map_or(true, is_number) {
            return (format!("auto:{}", channel), program.map(str::to_string));
        }
    }
    (feed_locator.to_string(), None)
}

/// A tuner state transition requested by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunerCommand {
    /// Tune `feed_locator` and send RTP datagrams to `target_address:target_port`.
    Start {
        feed_locator: String,
        target_address: IpAddr,
        target_port: u16,
        tuner_count: u32,
    },
    /// Stop delivery and release the tuner.
    Stop,
}

impl TunerCommand {
    /// Render the command as the SET requests for one claimed tuner.
    ///
    /// The lock key claim itself is not included; see [`ControlMessage::claim_lockkey`].
    pub fn requests(&self, tuner: u32, lockkey: u32) -> Vec<ControlMessage> {
        let key = Some(lockkey);
        match self {
            TunerCommand::Start {
                feed_locator,
                target_address,
                target_port,
                ..
            } => {
                let (channel, program) = channel_settings(feed_locator);
                let mut out = vec![ControlMessage::set(tuner_variable(tuner, "channel"), channel, key)];
                if let Some(program) = program {
                    out.push(ControlMessage::set(tuner_variable(tuner, "program"), program, key));
                }
                out.push(ControlMessage::set(
                    tuner_variable(tuner, "target"),
                    target_url(*target_address, *target_port),
                    key,
                ));
                out
            }
            TunerCommand::Stop => vec![
                ControlMessage::set(tuner_variable(tuner, "target"), "none", key),
                ControlMessage::set(tuner_variable(tuner, "lockkey"), "none", key),
            ],
        }
    }
}

/// Target URL the device streams RTP datagrams to.
pub fn target_url(address: IpAddr, port: u16) -> String {
    match address {
        IpAddr::V4(v4) => format!("rtp://{}:{}", v4, port),
        IpAddr::V6(v6) => format!("rtp://[{}]:{}", v6, port),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_payload_constants() {
        assert_eq!(TS_PAYLOAD_SIZE, 1316);
        assert_eq!(MAX_DATAGRAM_SIZE, 1328);
    }

    #[test]
    fn test_channel_settings() {
        assert_eq!(channel_settings("ch5"), ("auto:5".to_string(), None));
        assert_eq!(
            channel_settings("ch27-3"),
            ("auto:27".to_string(), Some("3".to_string()))
        );
        assert_eq!(channel_settings("auto:8vsb:57000000"), ("auto:8vsb:57000000".to_string(), None));
        assert_eq!(channel_settings("channel"), ("channel".to_string(), None));
    }

    #[test]
    fn test_start_requests() {
        let cmd = TunerCommand::Start {
            feed_locator: "ch5".to_string(),
            target_address: IpAddr::V4(Ipv4Addr::new(192, 168, 1, 10)),
            target_port: 5004,
            tuner_count: 2,
        };
        let reqs = cmd.requests(1, 42);
        assert_eq!(
            reqs,
            vec![
                ControlMessage::set("/tuner1/channel", "auto:5", Some(42)),
                ControlMessage::set("/tuner1/target", "rtp://192.168.1.10:5004", Some(42)),
            ]
        );
    }

    #[test]
    fn test_stop_requests() {
        let reqs = TunerCommand::Stop.requests(0, 7);
        assert_eq!(reqs[0], ControlMessage::set("/tuner0/target", "none", Some(7)));
        assert_eq!(reqs[1], ControlMessage::set("/tuner0/lockkey", "none", Some(7)));
    }
}
