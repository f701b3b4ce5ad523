use crate::codec::{Decoded, Frame, FrameCodec};
use crate::errors::*;
use input_buffer::{InputBuffer, MIN_READ};
use log::trace;
use snafu::ResultExt;
use std::io;

/// What the frame handler wants the read loop to do next.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ReadLoop {
    Continue,
    /// The connection reached a terminal state; stop reading. A socket that
    /// hits EOF after an orderly close exchange is not an error.
    Stop,
}

/// Incremental read buffer between the transport and the frame codec.
///
/// Owns the bytes read from the stream; the codec only ever sees a slice of
/// the front of the buffer and reports how much it consumed.
pub(crate) struct FrameBuffer {
    buf: InputBuffer,
}

impl FrameBuffer {
    pub(crate) fn new() -> FrameBuffer {
        FrameBuffer {
            buf: InputBuffer::new(),
        }
    }

    /// Discard any partially buffered frame. Called between connection
    /// generations so stale bytes from a dead transport never reach the
    /// codec.
    pub(crate) fn clear(&mut self) {
        use bytes::Buf;
        let len = self.buf.chunk().len();
        self.buf.advance(len);
    }

    /// Read from `stream` until it would block or the handler calls a stop,
    /// handing every complete frame to `handler`. Returns the number of
    /// bytes read (0 is possible if the stream was not actually readable).
    pub(crate) fn read_from<S, C, F>(
        &mut self,
        stream: &mut S,
        codec: &C,
        mut handler: F,
    ) -> Result<usize>
    where
        S: io::Read,
        C: FrameCodec,
        F: FnMut(Frame) -> Result<ReadLoop>,
    {
        use bytes::Buf;
        let mut bytes_read = 0;

        loop {
            // decode everything we already have buffered before touching the
            // stream again
            let mut reserve = MIN_READ;
            match codec.decode(self.buf.chunk())? {
                Decoded::Frame { frame, consumed } => {
                    trace!("decoded frame {:?} ({} bytes)", frame, consumed);
                    let verdict = handler(frame)?;
                    self.buf.advance(consumed);
                    if verdict == ReadLoop::Stop {
                        return Ok(bytes_read);
                    }
                    continue;
                }
                Decoded::NeedMoreData { needed } => {
                    if let Some(needed) = needed {
                        reserve = usize::max(MIN_READ, needed);
                    }
                }
            }

            match self.buf.prepare_reserve(reserve).read_from(stream) {
                Ok(0) => return UnexpectedSocketCloseSnafu.fail(),
                Ok(n) => {
                    trace!("read {} bytes", n);
                    bytes_read += n;
                }
                Err(err) => match err.kind() {
                    io::ErrorKind::WouldBlock => return Ok(bytes_read),
                    _ => return Err(err).context(IoSnafu),
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::performative::{Close, Performative};
    use mockstream::FailingMockStream;
    use std::io::{Cursor, Read};

    // Toy codec: [tag byte][len byte][len-2 payload bytes]. A payload of
    // "fail" decodes to a malformed-frame error; anything else becomes a
    // Close performative on channel `tag`.
    struct FakeCodec;

    impl FrameCodec for FakeCodec {
        fn decode(&self, buf: &[u8]) -> Result<Decoded> {
            if buf.len() < 2 {
                return Ok(Decoded::NeedMoreData { needed: None });
            }
            let size = buf[1] as usize;
            if buf.len() < size {
                return Ok(Decoded::NeedMoreData { needed: Some(size) });
            }
            if &buf[2..size] == b"fail" {
                return ReceivedMalformedSnafu {
                    message: "fake frame",
                }
                .fail();
            }
            Ok(Decoded::Frame {
                frame: Frame::amqp(buf[0] as u16, Performative::Close(Close::default())),
                consumed: size,
            })
        }

        fn encode(&self, _frame: &Frame, _buf: &mut Vec<u8>) -> Result<()> {
            unimplemented!("encode not used by these tests")
        }
    }

    fn would_block() -> FailingMockStream {
        FailingMockStream::new(io::ErrorKind::WouldBlock, "", 1)
    }

    fn collect(got: &mut Vec<Frame>, frame: Frame) -> Result<ReadLoop> {
        got.push(frame);
        Ok(ReadLoop::Continue)
    }

    fn channels_of(frames: &[Frame]) -> Vec<u16> {
        frames
            .iter()
            .map(|f| match f {
                Frame::Amqp { channel, .. } => *channel,
                Frame::Empty => panic!("unexpected empty frame"),
            })
            .collect()
    }

    #[test]
    fn full_frame_available() {
        let mut c = Cursor::new(b"a\x04aa").chain(would_block());

        let mut got = Vec::new();
        let mut buf = FrameBuffer::new();
        let n = buf.read_from(&mut c, &FakeCodec, |f| collect(&mut got, f)).unwrap();

        assert_eq!(n, 4);
        assert_eq!(channels_of(&got), vec![b'a' as u16]);
    }

    #[test]
    fn two_full_frames_available() {
        let mut c = Cursor::new(b"a\x04aa")
            .chain(Cursor::new(b"b\x04bb"))
            .chain(would_block());

        let mut got = Vec::new();
        let mut buf = FrameBuffer::new();
        let n = buf.read_from(&mut c, &FakeCodec, |f| collect(&mut got, f)).unwrap();

        assert_eq!(n, 8);
        assert_eq!(channels_of(&got), vec![b'a' as u16, b'b' as u16]);
    }

    #[test]
    fn partial_frame_resumes() {
        let mut c = Cursor::new(b"a\x04")
            .chain(would_block())
            .chain(Cursor::new(b"aa"))
            .chain(would_block());

        let mut got = Vec::new();
        let mut buf = FrameBuffer::new();
        let n = buf.read_from(&mut c, &FakeCodec, |f| collect(&mut got, f)).unwrap();
        assert_eq!(n, 2);
        assert!(got.is_empty());

        let n = buf.read_from(&mut c, &FakeCodec, |f| collect(&mut got, f)).unwrap();
        assert_eq!(n, 2);
        assert_eq!(channels_of(&got), vec![b'a' as u16]);
    }

    #[test]
    fn split_frames() {
        let mut c = Cursor::new(b"a\x04")
            .chain(would_block())
            .chain(Cursor::new(b"aab\x04b"))
            .chain(would_block())
            .chain(Cursor::new(b"b"))
            .chain(would_block());

        let mut got = Vec::new();
        let mut buf = FrameBuffer::new();
        buf.read_from(&mut c, &FakeCodec, |f| collect(&mut got, f)).unwrap();
        assert!(got.is_empty());

        buf.read_from(&mut c, &FakeCodec, |f| collect(&mut got, f)).unwrap();
        assert_eq!(channels_of(&got), vec![b'a' as u16]);

        buf.read_from(&mut c, &FakeCodec, |f| collect(&mut got, f)).unwrap();
        assert_eq!(channels_of(&got), vec![b'a' as u16, b'b' as u16]);
    }

    #[test]
    fn decode_fail() {
        let mut c = Cursor::new(b"x\x06fail").chain(would_block());

        let mut buf = FrameBuffer::new();
        let res = buf.read_from(&mut c, &FakeCodec, |_| panic!("should not be called"));
        match res.unwrap_err() {
            Error::ReceivedMalformed { .. } => (),
            err => panic!("unexpected error {}", err),
        }
    }

    #[test]
    fn handler_fail() {
        let mut c = Cursor::new(b"a\x04aa").chain(would_block());

        let mut buf = FrameBuffer::new();
        let res = buf.read_from(&mut c, &FakeCodec, |_| AlreadySettledSnafu.fail());
        match res.unwrap_err() {
            Error::AlreadySettled => (),
            err => panic!("unexpected error {}", err),
        }
    }

    #[test]
    fn eof_fail() {
        let mut c = Cursor::new(b"a\x04a");

        let mut buf = FrameBuffer::new();
        let res = buf.read_from(&mut c, &FakeCodec, |_| panic!("should not be called"));
        match res.unwrap_err() {
            Error::UnexpectedSocketClose => (),
            err => panic!("unexpected error {}", err),
        }
    }

    #[test]
    fn handler_stop_ends_read_before_eof() {
        // the stream hits EOF right after the frame; a handler that stops
        // the loop (orderly close) means the EOF is never treated as an
        // unexpected socket close
        let mut c = Cursor::new(b"a\x04aa");

        let mut buf = FrameBuffer::new();
        let n = buf
            .read_from(&mut c, &FakeCodec, |_| Ok(ReadLoop::Stop))
            .unwrap();
        assert_eq!(n, 4);
    }

    #[test]
    fn io_fail() {
        let mut c = Cursor::new(b"a\x04a").chain(FailingMockStream::new(
            io::ErrorKind::ConnectionReset,
            "",
            1,
        ));

        let mut buf = FrameBuffer::new();
        let res = buf.read_from(&mut c, &FakeCodec, |_| panic!("should not be called"));
        match res.unwrap_err() {
            Error::Io { .. } => (),
            err => panic!("unexpected error {}", err),
        }
    }

    #[test]
    fn clear_discards_partial_frame() {
        let mut c = Cursor::new(b"a\x04a").chain(would_block());

        let mut buf = FrameBuffer::new();
        buf.read_from(&mut c, &FakeCodec, |_| panic!("should not be called"))
            .unwrap();
        buf.clear();

        // a fresh, complete frame decodes cleanly after the stale partial
        // frame was dropped
        let mut c = Cursor::new(b"b\x04bb").chain(would_block());
        let mut got = Vec::new();
        buf.read_from(&mut c, &FakeCodec, |f| collect(&mut got, f)).unwrap();
        assert_eq!(channels_of(&got), vec![b'b' as u16]);
    }
}
