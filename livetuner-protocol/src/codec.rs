//! Codec for encoding and decoding control packets.
//!
//! Packet format:
//! ```text
//! +--------+--------+------------------+--------+
//! | Type   | Length |   TLV payload    | CRC-32 |
//! | u16 BE | u16 BE |    (variable)    | u32 LE |
//! +--------+--------+------------------+--------+
//! | 2 bytes| 2 bytes|  Length bytes    | 4 bytes|
//! ```
//!
//! Each TLV is `tag (1 byte) | length (1 or 2 bytes) | value`. Lengths above
//! 127 use two bytes: `0x80 | (len & 0x7F)` followed by `len >> 7`.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;
use crate::types::*;

/// Packet header size: 2 (type) + 2 (length) = 4 bytes.
pub const HEADER_SIZE: usize = 4;

/// Trailing CRC size.
pub const CRC_SIZE: usize = 4;

const CRC32_TABLE: [u32; 256] = build_crc32_table();

const fn build_crc32_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u32;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ 0xEDB8_8320
            } else {
                crc >> 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

/// CRC-32 (IEEE 802.3, reflected) as used by the control protocol.
pub fn crc32(data: &[u8]) -> u32 {
    let mut crc = 0xFFFF_FFFFu32;
    for &byte in data {
        crc = CRC32_TABLE[((crc ^ byte as u32) & 0xFF) as usize] ^ (crc >> 8);
    }
    !crc
}

/// Encode a control message into a complete packet.
pub fn encode_control_message(msg: &ControlMessage) -> Result<Bytes, ProtocolError> {
    let mut payload = BytesMut::new();

    match msg {
        ControlMessage::GetSetRequest { name, value, lockkey } => {
            put_string(&mut payload, Tag::GetSetName, name)?;
            if let Some(value) = value {
                put_string(&mut payload, Tag::GetSetValue, value)?;
            }
            if let Some(key) = lockkey {
                put_tlv(&mut payload, Tag::GetSetLockkey, &key.to_be_bytes())?;
            }
        }
        ControlMessage::GetSetReply { name, value, error } => {
            put_string(&mut payload, Tag::GetSetName, name)?;
            if let Some(value) = value {
                put_string(&mut payload, Tag::GetSetValue, value)?;
            }
            if let Some(error) = error {
                put_string(&mut payload, Tag::ErrorMessage, error)?;
            }
        }
    }

    encode_frame(msg.packet_type(), payload.freeze())
}

/// Wrap a payload with header and CRC.
fn encode_frame(packet_type: PacketType, payload: Bytes) -> Result<Bytes, ProtocolError> {
    if payload.len() > MAX_CONTROL_PAYLOAD {
        return Err(ProtocolError::PayloadTooLarge(payload.len(), MAX_CONTROL_PAYLOAD));
    }

    let mut frame = BytesMut::with_capacity(HEADER_SIZE + payload.len() + CRC_SIZE);
    frame.put_u16(packet_type.into());
    frame.put_u16(payload.len() as u16);
    frame.put_slice(&payload);
    let crc = crc32(&frame);
    frame.put_u32_le(crc);

    Ok(frame.freeze())
}

fn put_var_length(buf: &mut BytesMut, len: usize) -> Result<(), ProtocolError> {
    if len <= 0x7F {
        buf.put_u8(len as u8);
    } else if len <= 0x7FFF {
        buf.put_u8(0x80 | (len & 0x7F) as u8);
        buf.put_u8((len >> 7) as u8);
    } else {
        return Err(ProtocolError::PayloadTooLarge(len, 0x7FFF));
    }
    Ok(())
}

fn put_tlv(buf: &mut BytesMut, tag: Tag, value: &[u8]) -> Result<(), ProtocolError> {
    buf.put_u8(tag as u8);
    put_var_length(buf, value.len())?;
    buf.put_slice(value);
    Ok(())
}

/// Strings travel NUL terminated.
fn put_string(buf: &mut BytesMut, tag: Tag, s: &str) -> Result<(), ProtocolError> {
    let mut value = Vec::with_capacity(s.len() + 1);
    value.extend_from_slice(s.as_bytes());
    value.push(0);
    put_tlv(buf, tag, &value)
}

/// Decoded packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub packet_type: PacketType,
    pub payload_len: u16,
}

impl FrameHeader {
    /// Total packet size including header and CRC.
    pub fn frame_len(&self) -> usize {
        HEADER_SIZE + self.payload_len as usize + CRC_SIZE
    }
}

/// Try to decode a packet header from the buffer.
/// Returns None if there's not enough data yet.
pub fn decode_header(buf: &[u8]) -> Result<Option<FrameHeader>, ProtocolError> {
    if buf.len() < HEADER_SIZE {
        return Ok(None);
    }

    let type_val = u16::from_be_bytes([buf[0], buf[1]]);
    let packet_type =
        PacketType::try_from(type_val).map_err(ProtocolError::UnknownPacketType)?;

    let payload_len = u16::from_be_bytes([buf[2], buf[3]]);
    if payload_len as usize > MAX_CONTROL_PAYLOAD {
        return Err(ProtocolError::PayloadTooLarge(
            payload_len as usize,
            MAX_CONTROL_PAYLOAD,
        ));
    }

    Ok(Some(FrameHeader {
        packet_type,
        payload_len,
    }))
}

/// Decode a control message from a complete packet (header included).
pub fn decode_control_message(
    header: &FrameHeader,
    frame: &[u8],
) -> Result<ControlMessage, ProtocolError> {
    let frame_len = header.frame_len();
    if frame.len() < frame_len {
        return Err(ProtocolError::IncompleteFrame {
            expected: frame_len,
            actual: frame.len(),
        });
    }

    let crc_offset = frame_len - CRC_SIZE;
    let expected = u32::from_le_bytes([
        frame[crc_offset],
        frame[crc_offset + 1],
        frame[crc_offset + 2],
        frame[crc_offset + 3],
    ]);
    let actual = crc32(&frame[..crc_offset]);
    if expected != actual {
        return Err(ProtocolError::CrcMismatch { expected, actual });
    }

    let mut payload = Bytes::copy_from_slice(&frame[HEADER_SIZE..crc_offset]);
    let mut name = None;
    let mut value = None;
    let mut error = None;
    let mut lockkey = None;

    while payload.has_remaining() {
        let tag = payload.get_u8();
        let len = get_var_length(&mut payload)?;
        if payload.remaining() < len {
            return Err(ProtocolError::IncompleteFrame {
                expected: len,
                actual: payload.remaining(),
            });
        }
        let field = payload.copy_to_bytes(len);

        match Tag::try_from(tag) {
            Ok(Tag::GetSetName) => name = Some(decode_string(&field)?),
            Ok(Tag::GetSetValue) => value = Some(decode_string(&field)?),
            Ok(Tag::ErrorMessage) => error = Some(decode_string(&field)?),
            Ok(Tag::GetSetLockkey) => {
                let bytes: [u8; 4] = field.as_ref().try_into().map_err(|_| {
                    ProtocolError::DecodeError(format!("lockkey must be 4 bytes, got {}", len))
                })?;
                lockkey = Some(u32::from_be_bytes(bytes));
            }
            // Devices add tags this engine does not use.
            Err(_) => {}
        }
    }

    let name = name.ok_or(ProtocolError::MissingTag("name"))?;
    match header.packet_type {
        PacketType::GetSetRequest => Ok(ControlMessage::GetSetRequest {
            name,
            value,
            lockkey,
        }),
        PacketType::GetSetReply => Ok(ControlMessage::GetSetReply { name, value, error }),
    }
}

fn get_var_length(buf: &mut Bytes) -> Result<usize, ProtocolError> {
    if !buf.has_remaining() {
        return Err(ProtocolError::IncompleteFrame {
            expected: 1,
            actual: 0,
        });
    }
    let first = buf.get_u8() as usize;
    if first & 0x80 == 0 {
        return Ok(first);
    }
    if !buf.has_remaining() {
        return Err(ProtocolError::IncompleteFrame {
            expected: 1,
            actual: 0,
        });
    }
    let second = buf.get_u8() as usize;
    Ok((first & 0x7F) | (second << 7))
}

fn decode_string(field: &[u8]) -> Result<String, ProtocolError> {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8(field[..end].to_vec()).map_err(|e| ProtocolError::DecodeError(e.to_string()))
}
