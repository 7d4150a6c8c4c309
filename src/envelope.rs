//! Control envelope framing (spec.md §3, §6).
//!
//! Fixed 1033-byte wire record, little-endian, no interior padding:
//!
//! ```text
//! offset 0      : 1 byte   msg_type
//! offset 1..4   : 4 bytes  session_id  (u32 LE)
//! offset 5..8   : 4 bytes  payload_size (u32 LE, <= 1024)
//! offset 9..1032: 1024 bytes payload
//! ```

use byteorder::{ByteOrder, LittleEndian};

use crate::config::{ENVELOPE_SIZE, MAX_PAYLOAD_SIZE};
use crate::error::UcpError;

/// `msg_type` values from spec.md §6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    NewSession = 0,
    AcceptSession = 1,
    RejectSession = 2,
    CloseSession = 3,
    Data = 4,
    Heartbeat = 5,
}

impl MessageType {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(MessageType::NewSession),
            1 => Some(MessageType::AcceptSession),
            2 => Some(MessageType::RejectSession),
            3 => Some(MessageType::CloseSession),
            4 => Some(MessageType::Data),
            5 => Some(MessageType::Heartbeat),
            _ => None,
        }
    }
}

/// A decoded control envelope. `payload` is truncated to `payload_size`
/// bytes; the undefined padding bytes transmitted on the wire are not kept.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub msg_type: MessageType,
    pub session_id: u32,
    pub payload: Vec<u8>,
}

impl Envelope {
    pub fn control(msg_type: MessageType, session_id: u32) -> Self {
        Self {
            msg_type,
            session_id,
            payload: Vec::new(),
        }
    }

    pub fn data(session_id: u32, payload: &[u8]) -> Self {
        Self {
            msg_type: MessageType::Data,
            session_id,
            payload: payload.to_vec(),
        }
    }

    /// Encode to the fixed 1033-byte wire record. Unused payload bytes are
    /// zeroed (spec.md says they're "undefined but transmitted" — zero is
    /// as good as any other fixed value and keeps encoding deterministic).
    pub fn encode(&self) -> [u8; ENVELOPE_SIZE] {
        debug_assert!(self.payload.len() <= MAX_PAYLOAD_SIZE);
        let mut buf = [0u8; ENVELOPE_SIZE];
        buf[0] = self.msg_type as u8;
        LittleEndian::write_u32(&mut buf[1..5], self.session_id);
        LittleEndian::write_u32(&mut buf[5..9], self.payload.len() as u32);
        buf[9..9 + self.payload.len()].copy_from_slice(&self.payload);
        buf
    }

    /// Decode a datagram. Any size other than 1033 bytes, any unknown
    /// `msg_type`, or a `payload_size` exceeding 1024 is malformed and
    /// rejected — the caller is expected to drop the datagram (client:
    /// fatal; server: ignored, per spec.md §7).
    pub fn decode(bytes: &[u8], from: &str) -> Result<Self, UcpError> {
        if bytes.len() != ENVELOPE_SIZE {
            return Err(UcpError::MalformedEnvelope {
                from: from.to_string(),
                reason: format!("expected {ENVELOPE_SIZE} bytes, got {}", bytes.len()),
            });
        }

        let msg_type = MessageType::from_u8(bytes[0]).ok_or_else(|| UcpError::MalformedEnvelope {
            from: from.to_string(),
            reason: format!("unknown msg_type {}", bytes[0]),
        })?;
        let session_id = LittleEndian::read_u32(&bytes[1..5]);
        let payload_size = LittleEndian::read_u32(&bytes[5..9]) as usize;
        if payload_size > MAX_PAYLOAD_SIZE {
            return Err(UcpError::MalformedEnvelope {
                from: from.to_string(),
                reason: format!("payload_size {payload_size} exceeds {MAX_PAYLOAD_SIZE}"),
            });
        }

        let payload = bytes[9..9 + payload_size].to_vec();
        Ok(Self {
            msg_type,
            session_id,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_new_session() {
        let env = Envelope::control(MessageType::NewSession, 0);
        let wire = env.encode();
        assert_eq!(wire.len(), 1033);
        let decoded = Envelope::decode(&wire, "peer").unwrap();
        assert_eq!(decoded.msg_type, MessageType::NewSession);
        assert_eq!(decoded.session_id, 0);
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn round_trips_data_with_payload() {
        let env = Envelope::data(42, b"hello");
        let wire = env.encode();
        let decoded = Envelope::decode(&wire, "peer").unwrap();
        assert_eq!(decoded.msg_type, MessageType::Data);
        assert_eq!(decoded.session_id, 42);
        assert_eq!(decoded.payload, b"hello");
    }

    #[test]
    fn rejects_wrong_size() {
        let err = Envelope::decode(&[0u8; 10], "peer").unwrap_err();
        assert_eq!(err.kind(), "MalformedEnvelope");
    }

    #[test]
    fn rejects_unknown_type() {
        let mut wire = Envelope::control(MessageType::Data, 1).encode();
        wire[0] = 0xff;
        let err = Envelope::decode(&wire, "peer").unwrap_err();
        assert_eq!(err.kind(), "MalformedEnvelope");
    }

    #[test]
    fn rejects_oversized_payload_size_field() {
        let mut wire = Envelope::control(MessageType::Data, 1).encode();
        LittleEndian::write_u32(&mut wire[5..9], 2000);
        let err = Envelope::decode(&wire, "peer").unwrap_err();
        assert_eq!(err.kind(), "MalformedEnvelope");
    }
}
