use crate::codec::{Frame, FrameCodec};
use crate::errors::Result;
use log::trace;
use std::ops::{Index, RangeFrom};

/// Buffer of encoded frames waiting to be written to the transport.
#[derive(Debug, Default)]
pub(crate) struct OutputBuffer(Vec<u8>);

impl OutputBuffer {
    pub(crate) fn empty() -> OutputBuffer {
        OutputBuffer(Vec::new())
    }

    pub(crate) fn push_frame<C: FrameCodec>(&mut self, codec: &C, frame: &Frame) -> Result<()> {
        codec.encode(frame, &mut self.0)
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.0.len()
    }

    #[inline]
    pub(crate) fn clear(&mut self) {
        self.0.clear()
    }

    #[inline]
    pub(crate) fn drain_written(&mut self, n: usize) {
        self.0.drain(0..n);
    }
}

impl Index<RangeFrom<usize>> for OutputBuffer {
    type Output = [u8];

    #[inline]
    fn index(&self, index: RangeFrom<usize>) -> &[u8] {
        &self.0[index]
    }
}

/// An [`OutputBuffer`] that can be sealed once a Close has been encoded.
///
/// Anything pushed after sealing is silently discarded; only the bytes
/// already buffered will reach the wire. `unseal` reopens the buffer for the
/// next connection generation.
pub(crate) struct SealableOutputBuffer {
    buf: OutputBuffer,
    sealed: bool,
}

impl SealableOutputBuffer {
    pub(crate) fn new(buf: OutputBuffer) -> SealableOutputBuffer {
        SealableOutputBuffer { buf, sealed: false }
    }

    #[inline]
    pub(crate) fn seal(&mut self) {
        trace!("sealing writes - no more frames will be enqueued");
        self.sealed = true;
    }

    #[inline]
    pub(crate) fn unseal(&mut self) {
        self.sealed = false;
    }

    #[inline]
    pub(crate) fn is_sealed(&self) -> bool {
        self.sealed
    }

    #[inline]
    pub(crate) fn push_frame<C: FrameCodec>(&mut self, codec: &C, frame: &Frame) -> Result<()> {
        if self.sealed {
            Ok(())
        } else {
            self.buf.push_frame(codec, frame)
        }
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.buf.len()
    }

    #[inline]
    pub(crate) fn clear(&mut self) {
        self.buf.clear()
    }

    #[inline]
    pub(crate) fn drain_written(&mut self, n: usize) {
        self.buf.drain_written(n)
    }
}

impl Index<RangeFrom<usize>> for SealableOutputBuffer {
    type Output = [u8];

    #[inline]
    fn index(&self, index: RangeFrom<usize>) -> &[u8] {
        &self.buf[index]
    }
}
