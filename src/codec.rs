use crate::performative::Performative;
use crate::Result;

/// One frame as seen by the event loop: either an AMQP frame carrying a
/// performative on a channel, or an empty frame (the AMQP 1.0 heartbeat).
#[derive(Clone, Debug, PartialEq)]
pub enum Frame {
    Amqp {
        channel: u16,
        performative: Performative,
    },
    Empty,
}

impl Frame {
    pub fn amqp(channel: u16, performative: Performative) -> Frame {
        Frame::Amqp {
            channel,
            performative,
        }
    }
}

/// Result of a single decode attempt against buffered input.
#[derive(Clone, Debug, PartialEq)]
pub enum Decoded {
    /// A complete frame was decoded from the first `consumed` bytes.
    Frame { frame: Frame, consumed: usize },
    /// More bytes are required. `needed`, when known, is the total number of
    /// bytes the next frame occupies; the read path uses it to size reads.
    NeedMoreData { needed: Option<usize> },
}

/// The wire codec the runtime delegates to.
///
/// Implementations translate between byte buffers and typed
/// [`Performative`]s. They are treated as pure functions over their inputs:
/// the runtime owns all buffering, and version-negotiation preambles (the
/// `AMQP` protocol header) are the codec/transport's concern, handled before
/// bytes reach these methods.
pub trait FrameCodec: Send + 'static {
    /// Attempt to decode one frame from the front of `buf`.
    ///
    /// Returns [`Decoded::NeedMoreData`] when `buf` holds only a partial
    /// frame, or an error when the bytes cannot form a valid frame. Must not
    /// consume anything on `NeedMoreData`.
    fn decode(&self, buf: &[u8]) -> Result<Decoded>;

    /// Append the encoding of `frame` to `buf`.
    fn encode(&self, frame: &Frame, buf: &mut Vec<u8>) -> Result<()>;
}
