//! Per-connection framing state: receive/send buffers plus the state
//! machine a connection moves through from accept/connect to close.

use bytes::{Bytes, BytesMut};

use crate::codec::{CodecChain, DecodeOutcome};
use crate::error::CoreError;
use crate::ids::SessionId;
use crate::packet::Packet;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Connected,
    Closing,
    Closed,
}

impl SessionState {
    /// Transitions are linear and monotonic: there is no path back to an
    /// earlier state.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Connecting, Connected)
                | (Connecting, Closing)
                | (Connected, Closing)
                | (Closing, Closed)
        )
    }
}

/// Why a session closed, attached to the `OnClosed` poller event and
/// logged at the point of closure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseReason {
    PeerClosed,
    LocalClose,
    ProtocolError,
    IoError,
}

/// High-water mark beyond which `Send` backs off with `WouldBlock`.
const DEFAULT_SEND_HIGH_WATER: usize = 1024 * 1024;

pub struct Session {
    id: SessionId,
    service_id: u64,
    peer_addr: Option<std::net::SocketAddr>,
    recv_buf: BytesMut,
    send_buf: BytesMut,
    state: SessionState,
    send_high_water: usize,
}

impl Session {
    pub fn new(service_id: u64, peer_addr: Option<std::net::SocketAddr>) -> Self {
        Self {
            id: SessionId::next(),
            service_id,
            peer_addr,
            recv_buf: BytesMut::new(),
            send_buf: BytesMut::new(),
            state: SessionState::Connecting,
            send_high_water: DEFAULT_SEND_HIGH_WATER,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn service_id(&self) -> u64 {
        self.service_id
    }

    pub fn peer_addr(&self) -> Option<std::net::SocketAddr> {
        self.peer_addr
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn with_send_high_water(mut self, bytes: usize) -> Self {
        self.send_high_water = bytes;
        self
    }

    /// Overrides the auto-assigned id. The service loop uses this to
    /// make a `Session`'s id match the `SessionId` its owning `Poller`
    /// already handed out in the `Accepted`/`Connected` event, rather
    /// than carrying two different ids for the same connection.
    pub fn with_id(mut self, id: SessionId) -> Self {
        self.id = id;
        self
    }

    pub fn transition_to(&mut self, next: SessionState) -> Result<(), CoreError> {
        if !self.state.can_transition_to(next) {
            return Err(CoreError::state(format!(
                "session cannot move from {:?} to {next:?}",
                self.state
            )));
        }
        self.state = next;
        Ok(())
    }

    /// True once `Closed` has been reached and both buffers are empty —
    /// the point at which this session's resources can actually be
    /// dropped, not just marked closed.
    pub fn fully_drained(&self) -> bool {
        self.state == SessionState::Closed && self.recv_buf.is_empty() && self.send_buf.is_empty()
    }

    /// Appends newly read bytes and decodes as many complete frames as
    /// the codec chain can find, each wrapped into a [`Packet`]. Returns
    /// `Err` with [`crate::error::ErrorKind::ProtocolError`] on the
    /// first malformed frame; the caller is expected to close the
    /// session with [`CloseReason::ProtocolError`] when that happens.
    /// The contract guarantees at most one decode pass is in flight per
    /// session at a time, which is just "don't call this re-entrantly".
    pub fn ingest(&mut self, bytes: &[u8], codec: &CodecChain) -> Result<Vec<Packet>, CoreError> {
        self.recv_buf.extend_from_slice(bytes);
        let mut packets = Vec::new();
        loop {
            match codec.decode(&self.recv_buf) {
                DecodeOutcome::Consumed { consumed, frame } => {
                    let _ = self.recv_buf.split_to(consumed);
                    packets.push(Packet::decode_wire(frame, self.id.as_raw())?);
                }
                DecodeOutcome::NeedMore => break,
                DecodeOutcome::Malformed => {
                    return Err(CoreError::protocol("malformed frame"));
                }
            }
        }
        Ok(packets)
    }

    /// Queues bytes for send. Returns `WouldBlock` once the send buffer
    /// is already at or above its high-water mark; the caller is
    /// expected to propagate that to the originating component rather
    /// than retry in a loop.
    pub fn queue_send(&mut self, bytes: Bytes) -> Result<(), CoreError> {
        if self.send_buf.len() >= self.send_high_water {
            return Err(CoreError::would_block());
        }
        self.send_buf.extend_from_slice(&bytes);
        Ok(())
    }

    pub fn take_pending_send(&mut self) -> Bytes {
        std::mem::take(&mut self.send_buf).freeze()
    }

    pub fn pending_send_len(&self) -> usize {
        self.send_buf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::LengthPrefixLayer;

    #[test]
    fn state_transitions_are_linear_and_monotonic() {
        let mut session = Session::new(1, None);
        assert_eq!(session.state(), SessionState::Connecting);
        session.transition_to(SessionState::Connected).unwrap();
        assert!(session
            .transition_to(SessionState::Connecting)
            .is_err());
        session.transition_to(SessionState::Closing).unwrap();
        session.transition_to(SessionState::Closed).unwrap();
        assert!(session.fully_drained());
    }

    #[test]
    fn ingest_decodes_complete_frames_and_buffers_partial_ones() {
        let codec = CodecChain::new(vec![Box::new(LengthPrefixLayer::default())]);
        let mut session = Session::new(1, None);
        let wire = Packet::new(0x10, 7, 1, Bytes::from_static(b"hello")).encode_wire();
        let encoded = codec.encode(&wire).unwrap();

        let packets = session.ingest(&encoded[..encoded.len() - 2], &codec).unwrap();
        assert!(packets.is_empty());

        let packets = session.ingest(&encoded[encoded.len() - 2..], &codec).unwrap();
        assert_eq!(packets.len(), 1);
        assert_eq!(&packets[0].payload[..], b"hello");
    }

    #[test]
    fn malformed_frame_is_reported_as_protocol_error() {
        let codec = CodecChain::new(vec![Box::new(LengthPrefixLayer::new(4))]);
        let mut session = Session::new(1, None);
        let mut bogus = BytesMut::new();
        bogus.extend_from_slice(&(0xFFFF_FFFFu32).to_be_bytes());
        let err = session.ingest(&bogus, &codec).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ProtocolError);
    }

    #[test]
    fn send_backs_off_at_high_water_mark() {
        let mut session = Session::new(1, None).with_send_high_water(4);
        session.queue_send(Bytes::from_static(b"abcd")).unwrap();
        let err = session.queue_send(Bytes::from_static(b"e")).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::WouldBlock);

        let drained = session.take_pending_send();
        assert_eq!(&drained[..], b"abcd");
        session.queue_send(Bytes::from_static(b"e")).unwrap();
    }
}
