//! The framed application message passed between the wire codec and the
//! dispatch pipeline.

use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::CoreError;

/// Size of the header this module reads and writes: opcode(4) +
/// serial(8) + status(4) + flags(2).
const HEADER_LEN: usize = 4 + 8 + 4 + 2;

bitflags! {
    /// Bits carried in the packet header; see the wire format in the
    /// external-interfaces section of the governing document.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct PacketFlags: u16 {
        const RELIABLE     = 0b0000_0001;
        const BROADCAST    = 0b0000_0010;
        const ONEWAY       = 0b0000_0100;
        const EXPECT_REPLY = 0b0000_1000;
        const CLOSE_ON_ERROR = 0b0001_0000;
    }
}

/// A decoded (or about-to-be-encoded) application message.
///
/// `serial` is assigned by the sender's service at enqueue time and a
/// reply packet must carry the serial of the request it answers —
/// callers build replies with [`Packet::reply_to`] rather than setting
/// `serial` by hand.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Packet {
    pub opcode: u32,
    pub serial: u64,
    pub status: i32,
    pub flags: PacketFlags,
    pub session_id: u64,
    pub payload: Bytes,
}

impl Packet {
    pub fn new(opcode: u32, serial: u64, session_id: u64, payload: impl Into<Bytes>) -> Self {
        Self {
            opcode,
            serial,
            status: 0,
            flags: PacketFlags::empty(),
            session_id,
            payload: payload.into(),
        }
    }

    pub fn with_flags(mut self, flags: PacketFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_status(mut self, status: i32) -> Self {
        self.status = status;
        self
    }

    /// Builds a reply to `self`: same session and serial, caller-supplied
    /// opcode/status/payload, and `EXPECT_REPLY` cleared since a reply is
    /// not itself expecting a further reply.
    pub fn reply_to(&self, opcode: u32, status: i32, payload: impl Into<Bytes>) -> Self {
        Self {
            opcode,
            serial: self.serial,
            status,
            flags: self.flags.difference(PacketFlags::EXPECT_REPLY),
            session_id: self.session_id,
            payload: payload.into(),
        }
    }

    pub fn expects_reply(&self) -> bool {
        self.flags.contains(PacketFlags::EXPECT_REPLY)
    }

    pub fn close_on_error(&self) -> bool {
        self.flags.contains(PacketFlags::CLOSE_ON_ERROR)
    }

    /// Serializes the header and payload in wire order: `[opcode
    /// u32][serial u64][status i32][flags u16][payload]`. The leading
    /// length prefix is added by the framing codec layer, not here —
    /// this is the part of the wire format that is always the same
    /// regardless of which framing layer a service configures.
    pub fn encode_wire(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        buf.put_u32(self.opcode);
        buf.put_u64(self.serial);
        buf.put_i32(self.status);
        buf.put_u16(self.flags.bits());
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Parses a header-plus-payload frame (as already delimited by a
    /// framing codec layer) into a `Packet` addressed to `session_id`.
    /// Returns `ProtocolError` if the frame is shorter than a header.
    pub fn decode_wire(mut frame: Bytes, session_id: u64) -> Result<Self, CoreError> {
        if frame.len() < HEADER_LEN {
            return Err(CoreError::protocol("frame shorter than packet header"));
        }
        let opcode = frame.get_u32();
        let serial = frame.get_u64();
        let status = frame.get_i32();
        let flags = PacketFlags::from_bits_truncate(frame.get_u16());
        Ok(Self {
            opcode,
            serial,
            status,
            flags,
            session_id,
            payload: frame,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_carries_originating_serial() {
        let request = Packet::new(0x10, 7, 1, Bytes::from_static(b"hello"))
            .with_flags(PacketFlags::EXPECT_REPLY);
        let reply = request.reply_to(0x11, 0, Bytes::from_static(b"hello"));
        assert_eq!(reply.serial, request.serial);
        assert!(!reply.expects_reply());
    }

    #[test]
    fn flag_helpers_read_distinct_bits() {
        let p = Packet::new(1, 1, 1, Bytes::new())
            .with_flags(PacketFlags::EXPECT_REPLY | PacketFlags::CLOSE_ON_ERROR);
        assert!(p.expects_reply());
        assert!(p.close_on_error());
    }

    #[test]
    fn wire_encoding_round_trips() {
        let p = Packet::new(0x10, 42, 7, Bytes::from_static(b"hello"))
            .with_flags(PacketFlags::EXPECT_REPLY)
            .with_status(-1);
        let encoded = p.encode_wire();
        let decoded = Packet::decode_wire(encoded, p.session_id).unwrap();
        assert_eq!(decoded, p);
    }

    #[test]
    fn decode_wire_rejects_truncated_header() {
        let err = Packet::decode_wire(Bytes::from_static(b"short"), 1).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ProtocolError);
    }
}
