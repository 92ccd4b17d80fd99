//! Wire-level message primitives: opcodes and datagram encoding/decoding.
//!
//! Each UDP datagram carries exactly one [`Message`]. The layout is a
//! fixed little-endian header followed by the payload (data messages only);
//! little-endian matches the 16-bit word pairing used by the checksum.

use std::fmt;

use bytes::Bytes;

use crate::checksum::data_checksum;

pub const CONNECT: u8 = 0x00;
pub const DATA: u8 = 0x01;
pub const ACK: u8 = 0x02;
pub const CACK: u8 = 0x03;

/// Opcode + connection id + sequence number.
const SHORT_HEADER: usize = 9;
/// Short header + declared size + checksum.
const DATA_HEADER: usize = 15;

/// Receive buffer length, comfortably above the 2000-byte datagram floor.
pub(crate) const RECV_BUFFER: usize = 1 << 16;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum WireError {
    #[error("frame too short for opcode {0:#x}")]
    FrameTooShort(u8),
    #[error("unknown opcode {0:#x}")]
    UnknownOpcode(u8),
    #[error("payload shorter than declared size ({actual} < {declared})")]
    PayloadTruncated { declared: u32, actual: usize },
    #[error("checksum mismatch (header {header:#06x}, computed {computed:#06x})")]
    ChecksumMismatch { header: u16, computed: u16 },
}

/// One protocol message.
///
/// `Ack { seq: 0 }` is the keep-alive heartbeat. A connect request always
/// carries `conn_id: 0`; the server's answering ack carries the assigned id
/// and echoes the initial sequence number.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    Connect { conn_id: u32, seq: u32 },
    Data { conn_id: u32, seq: u32, size: u32, checksum: u16, payload: Bytes },
    Ack { conn_id: u32, seq: u32 },
    CAck { conn_id: u32, seq: u32 },
}

impl Message {
    /// Connect request carrying the client-chosen initial sequence number.
    pub fn connect(initial_seq: u32) -> Self {
        Message::Connect { conn_id: 0, seq: initial_seq }
    }

    /// Data message with the checksum computed over its fields and payload.
    pub fn data(conn_id: u32, seq: u32, payload: Bytes) -> Self {
        let size = payload.len() as u32;
        let checksum = data_checksum(conn_id, seq, size, &payload);
        Message::Data { conn_id, seq, size, checksum, payload }
    }

    pub fn ack(conn_id: u32, seq: u32) -> Self {
        Message::Ack { conn_id, seq }
    }

    pub fn cack(conn_id: u32, seq: u32) -> Self {
        Message::CAck { conn_id, seq }
    }

    pub fn conn_id(&self) -> u32 {
        match self {
            Message::Connect { conn_id, .. }
            | Message::Data { conn_id, .. }
            | Message::Ack { conn_id, .. }
            | Message::CAck { conn_id, .. } => *conn_id,
        }
    }

    pub fn seq(&self) -> u32 {
        match self {
            Message::Connect { seq, .. }
            | Message::Data { seq, .. }
            | Message::Ack { seq, .. }
            | Message::CAck { seq, .. } => *seq,
        }
    }

    /// Encode this message into a new owned buffer.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Message::Connect { conn_id, seq } => short_frame(CONNECT, *conn_id, *seq),
            Message::Ack { conn_id, seq } => short_frame(ACK, *conn_id, *seq),
            Message::CAck { conn_id, seq } => short_frame(CACK, *conn_id, *seq),
            Message::Data { conn_id, seq, size, checksum, payload } => {
                let mut out = Vec::with_capacity(DATA_HEADER + payload.len());
                out.push(DATA);
                out.extend_from_slice(&conn_id.to_le_bytes());
                out.extend_from_slice(&seq.to_le_bytes());
                out.extend_from_slice(&size.to_le_bytes());
                out.extend_from_slice(&checksum.to_le_bytes());
                out.extend_from_slice(payload);
                out
            }
        }
    }

    /// Decode one datagram.
    ///
    /// Data frames are normalized per the integrity policy: a payload longer
    /// than the declared size is truncated to it before verification, a
    /// shorter one is rejected, and the checksum is verified over the
    /// normalized payload. Callers drop erroneous frames silently.
    ///
    /// # Errors
    /// Returns a [`WireError`] for short frames, unknown opcodes, truncated
    /// payloads, and checksum mismatches.
    pub fn decode(raw: &[u8]) -> Result<Message, WireError> {
        let Some(&opcode) = raw.first() else {
            return Err(WireError::FrameTooShort(0));
        };
        if raw.len() < SHORT_HEADER {
            return Err(WireError::FrameTooShort(opcode));
        }
        let conn_id = read_u32(raw, 1);
        let seq = read_u32(raw, 5);
        match opcode {
            CONNECT => Ok(Message::Connect { conn_id, seq }),
            ACK => Ok(Message::Ack { conn_id, seq }),
            CACK => Ok(Message::CAck { conn_id, seq }),
            DATA => {
                if raw.len() < DATA_HEADER {
                    return Err(WireError::FrameTooShort(DATA));
                }
                let size = read_u32(raw, 9);
                let header = u16::from_le_bytes([raw[13], raw[14]]);
                let actual = raw.len() - DATA_HEADER;
                if actual < size as usize {
                    return Err(WireError::PayloadTruncated { declared: size, actual });
                }
                let payload = &raw[DATA_HEADER..DATA_HEADER + size as usize];
                let computed = data_checksum(conn_id, seq, size, payload);
                if computed != header {
                    return Err(WireError::ChecksumMismatch { header, computed });
                }
                Ok(Message::Data {
                    conn_id,
                    seq,
                    size,
                    checksum: header,
                    payload: Bytes::copy_from_slice(payload),
                })
            }
            other => Err(WireError::UnknownOpcode(other)),
        }
    }
}

fn short_frame(opcode: u8, conn_id: u32, seq: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(SHORT_HEADER);
    out.push(opcode);
    out.extend_from_slice(&conn_id.to_le_bytes());
    out.extend_from_slice(&seq.to_le_bytes());
    out
}

fn read_u32(raw: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([raw[at], raw[at + 1], raw[at + 2], raw[at + 3]])
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::Connect { conn_id, seq } => write!(f, "[Connect {conn_id} {seq}]"),
            Message::Ack { conn_id, seq } => write!(f, "[Ack {conn_id} {seq}]"),
            Message::CAck { conn_id, seq } => write!(f, "[CAck {conn_id} {seq}]"),
            Message::Data { conn_id, seq, checksum, payload, .. } => {
                write!(
                    f,
                    "[Data {conn_id} {seq} {checksum} {}]",
                    String::from_utf8_lossy(payload)
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn connect_roundtrip() {
        let msg = Message::connect(42);
        assert_eq!(Message::decode(&msg.encode()).unwrap(), msg);
    }

    #[test]
    fn ack_roundtrip() {
        let msg = Message::ack(7, 43);
        assert_eq!(Message::decode(&msg.encode()).unwrap(), msg);
    }

    #[test]
    fn cack_roundtrip() {
        let msg = Message::cack(7, 50);
        assert_eq!(Message::decode(&msg.encode()).unwrap(), msg);
    }

    #[test]
    fn data_roundtrip() {
        let msg = Message::data(3, 44, Bytes::from_static(b"hello"));
        assert_eq!(Message::decode(&msg.encode()).unwrap(), msg);
    }

    #[test]
    fn decode_rejects_empty_frame() {
        assert_eq!(Message::decode(&[]), Err(WireError::FrameTooShort(0)));
    }

    #[test]
    fn decode_rejects_unknown_opcode() {
        let raw = [0xffu8; SHORT_HEADER];
        assert_eq!(Message::decode(&raw), Err(WireError::UnknownOpcode(0xff)));
    }

    #[test]
    fn short_payload_is_rejected() {
        let mut raw = Message::data(1, 2, Bytes::from_static(b"abcd")).encode();
        raw.truncate(raw.len() - 1);
        assert_eq!(
            Message::decode(&raw),
            Err(WireError::PayloadTruncated { declared: 4, actual: 3 })
        );
    }

    #[test]
    fn oversize_payload_is_truncated_to_declared_size() {
        let mut raw = Message::data(1, 2, Bytes::from_static(b"abcd")).encode();
        raw.extend_from_slice(b"trailing junk");
        let decoded = Message::decode(&raw).unwrap();
        match decoded {
            Message::Data { payload, size, .. } => {
                assert_eq!(size, 4);
                assert_eq!(payload, Bytes::from_static(b"abcd"));
            }
            other => panic!("expected data, got {other}"),
        }
    }

    #[test]
    fn corrupt_payload_is_rejected() {
        let mut raw = Message::data(1, 2, Bytes::from_static(b"abcd")).encode();
        let last = raw.len() - 1;
        raw[last] ^= 0x01;
        assert!(matches!(
            Message::decode(&raw),
            Err(WireError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn display_matches_reference_format() {
        let msg = Message::data(5, 43, Bytes::from_static(b"abc"));
        let checksum = match msg {
            Message::Data { checksum, .. } => checksum,
            _ => unreachable!(),
        };
        assert_eq!(format!("{msg}"), format!("[Data 5 43 {checksum} abc]"));
        assert_eq!(format!("{}", Message::connect(42)), "[Connect 0 42]");
    }

    proptest! {
        #[test]
        fn data_roundtrip_prop(
            conn_id in any::<u32>(),
            seq in any::<u32>(),
            payload in proptest::collection::vec(any::<u8>(), 0..512),
        ) {
            let msg = Message::data(conn_id, seq, Bytes::from(payload.clone()));
            let raw = msg.encode();
            prop_assert_eq!(raw.len(), DATA_HEADER + payload.len());
            prop_assert_eq!(Message::decode(&raw).unwrap(), msg);
        }

        #[test]
        fn mutated_payload_byte_is_rejected(
            conn_id in any::<u32>(),
            seq in any::<u32>(),
            payload in proptest::collection::vec(any::<u8>(), 1..256),
            at in any::<prop::sample::Index>(),
            flip in 1..=255u8,
        ) {
            let mut raw = Message::data(conn_id, seq, Bytes::from(payload.clone())).encode();
            let at = DATA_HEADER + at.index(payload.len());
            raw[at] ^= flip;
            let is_checksum_mismatch = matches!(
                Message::decode(&raw),
                Err(WireError::ChecksumMismatch { .. })
            );
            prop_assert!(is_checksum_mismatch);
        }
    }
}
