//! Pluggable per-service codec layers (compression, encryption, framing)
//! composed into an ordered chain: encoding runs the chain in reverse,
//! decoding runs it forward.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::CoreError;

/// Result of attempting to decode one frame out of a byte buffer.
pub enum DecodeOutcome {
    /// A full frame was decoded, consuming `consumed` bytes from the front.
    Consumed { consumed: usize, frame: Bytes },
    /// Not enough bytes buffered yet; call again once more data arrives.
    NeedMore,
    /// The buffered bytes can never form a valid frame under this codec.
    Malformed,
}

/// One layer of a codec chain. `encode` takes an already-framed-by-inner-layers
/// payload and wraps it further; `decode` takes raw bytes and attempts to
/// peel one layer off.
pub trait CodecLayer: Send + Sync {
    fn name(&self) -> &'static str;
    fn encode(&self, input: &[u8], out: &mut BytesMut) -> Result<(), CoreError>;
    fn decode(&self, input: &[u8]) -> DecodeOutcome;
}

/// The identity layer: passes bytes through unchanged. Used as a
/// placeholder layer and in tests where framing alone is being
/// exercised.
#[derive(Default)]
pub struct IdentityLayer;

impl CodecLayer for IdentityLayer {
    fn name(&self) -> &'static str {
        "identity"
    }

    fn encode(&self, input: &[u8], out: &mut BytesMut) -> Result<(), CoreError> {
        out.put_slice(input);
        Ok(())
    }

    fn decode(&self, input: &[u8]) -> DecodeOutcome {
        if input.is_empty() {
            DecodeOutcome::NeedMore
        } else {
            DecodeOutcome::Consumed {
                consumed: input.len(),
                frame: Bytes::copy_from_slice(input),
            }
        }
    }
}

/// The default wire framing: a 4-byte big-endian length prefix covering
/// everything after itself, followed by the payload.
pub struct LengthPrefixLayer {
    max_frame_len: usize,
}

impl LengthPrefixLayer {
    pub fn new(max_frame_len: usize) -> Self {
        Self { max_frame_len }
    }
}

impl Default for LengthPrefixLayer {
    fn default() -> Self {
        Self::new(16 * 1024 * 1024)
    }
}

impl CodecLayer for LengthPrefixLayer {
    fn name(&self) -> &'static str {
        "length_prefix"
    }

    fn encode(&self, input: &[u8], out: &mut BytesMut) -> Result<(), CoreError> {
        if input.len() > self.max_frame_len {
            return Err(CoreError::protocol(format!(
                "frame of {} bytes exceeds max {}",
                input.len(),
                self.max_frame_len
            )));
        }
        out.put_u32(input.len() as u32);
        out.put_slice(input);
        Ok(())
    }

    fn decode(&self, input: &[u8]) -> DecodeOutcome {
        if input.len() < 4 {
            return DecodeOutcome::NeedMore;
        }
        let len = (&input[..4]).get_u32() as usize;
        if len > self.max_frame_len {
            return DecodeOutcome::Malformed;
        }
        if input.len() < 4 + len {
            return DecodeOutcome::NeedMore;
        }
        DecodeOutcome::Consumed {
            consumed: 4 + len,
            frame: Bytes::copy_from_slice(&input[4..4 + len]),
        }
    }
}

/// An ordered list of [`CodecLayer`]s applied as one unit: encoding
/// applies layers in reverse (last-registered wraps innermost), decoding
/// applies them forward, so `decode(encode(p)) == p` for a well-formed
/// chain regardless of how many layers it holds.
pub struct CodecChain {
    layers: Vec<Box<dyn CodecLayer>>,
}

impl CodecChain {
    pub fn new(layers: Vec<Box<dyn CodecLayer>>) -> Self {
        Self { layers }
    }

    /// The reference chain: length-prefix framing as the outermost (wire)
    /// layer, wrapping an identity inner layer.
    pub fn identity_length_prefixed(max_frame_len: usize) -> Self {
        Self::new(vec![
            Box::new(LengthPrefixLayer::new(max_frame_len)),
            Box::new(IdentityLayer),
        ])
    }

    pub fn encode(&self, payload: &[u8]) -> Result<Bytes, CoreError> {
        let mut buf = BytesMut::from(payload);
        for layer in self.layers.iter().rev() {
            let mut next = BytesMut::new();
            layer.encode(&buf, &mut next)?;
            buf = next;
        }
        Ok(buf.freeze())
    }

    /// Runs the whole chain forward over `input`, first element (the
    /// outermost, wire-closest layer) to last. Only that first layer can
    /// tell how many raw bytes make up one frame; every layer after it
    /// operates on the already-delimited frame the previous layer
    /// produced.
    pub fn decode(&self, input: &[u8]) -> DecodeOutcome {
        let Some((outermost, inner_layers)) = self.layers.split_first() else {
            return DecodeOutcome::Consumed {
                consumed: input.len(),
                frame: Bytes::copy_from_slice(input),
            };
        };
        let (consumed, mut frame) = match outermost.decode(input) {
            DecodeOutcome::Consumed { consumed, frame } => (consumed, frame),
            other => return other,
        };
        for layer in inner_layers {
            match layer.decode(&frame) {
                DecodeOutcome::Consumed { frame: inner, .. } => frame = inner,
                DecodeOutcome::NeedMore | DecodeOutcome::Malformed => return DecodeOutcome::Malformed,
            }
        }
        DecodeOutcome::Consumed { consumed, frame }
    }
}
