//! The single-threaded event loop driving one connection.
//!
//! Everything protocol-visible happens on this thread: socket readiness,
//! timer expirations, and submitted work tasks are multiplexed over one
//! poll, frames are decoded and fed to the state machine, and the state
//! machine's outbox is encoded and written back out. Other threads only
//! ever talk to the loop through the pollable work queue.

use crate::codec::{Frame, FrameCodec};
use crate::endpoint::{Endpoint, EndpointSet};
use crate::errors::*;
use crate::frame_buffer::{FrameBuffer, ReadLoop};
use crate::handler::Handler;
use crate::heartbeats::IdleState;
use crate::reconnect::RetrySchedule;
use crate::transport::Transport;
use log::{debug, error, trace, warn};
use mio::{Events, Poll, PollOpt, Ready, Token};
use mio_extras::channel::Receiver as MioReceiver;
use snafu::{IntoError, ResultExt};
use std::io::{self, Write};
use std::sync::mpsc::TryRecvError;
use std::time::Duration;

mod context;
mod idle_timers;
mod link;
pub(crate) mod machine;
mod outbuf;
mod session;
mod session_slots;
pub(crate) mod work_queue;

pub use context::Context;

use idle_timers::{IdleTimers, TimerKind};
use machine::{ConnectionState, Core};
use outbuf::{OutputBuffer, SealableOutputBuffer};
use work_queue::{ResultSlot, Task};

const STREAM: Token = Token(0);
const TIMER: Token = Token(1);
const WORK: Token = Token(2);

pub(crate) struct Reactor<H: Handler, T: Transport, C: FrameCodec> {
    handler: H,
    transport: T,
    codec: C,
    core: Core,
    poll: Poll,
    timers: IdleTimers,
    work_rx: MioReceiver<Task>,
    frame_buffer: FrameBuffer,
    outbuf: SealableOutputBuffer,
    endpoints: EndpointSet,
    retry: Option<RetrySchedule>,
    result: ResultSlot,
}

impl<H: Handler, T: Transport, C: FrameCodec> Reactor<H, T, C> {
    pub(crate) fn new(
        handler: H,
        transport: T,
        codec: C,
        options: crate::options::ConnectionOptions,
        work_rx: MioReceiver<Task>,
        result: ResultSlot,
    ) -> Result<Reactor<H, T, C>> {
        let endpoints = EndpointSet::from_list(options.endpoints.clone())?;
        let retry = options.reconnect.clone().map(RetrySchedule::new);
        let timers = IdleTimers::default();

        let poll = Poll::new().context(IoSnafu)?;
        poll.register(&timers.timer, TIMER, Ready::readable(), PollOpt::edge())
            .context(IoSnafu)?;
        poll.register(&work_rx, WORK, Ready::readable(), PollOpt::edge())
            .context(IoSnafu)?;

        Ok(Reactor {
            handler,
            transport,
            codec,
            core: Core::new(options),
            poll,
            timers,
            work_rx,
            frame_buffer: FrameBuffer::new(),
            outbuf: SealableOutputBuffer::new(OutputBuffer::empty()),
            endpoints,
            retry,
            result,
        })
    }

    /// Run the loop to completion, publishing the final result in the
    /// shared slot for submitters to consult.
    pub(crate) fn run(mut self) -> Result<()> {
        let result = self.run_inner();
        match &result {
            Ok(()) => debug!("event loop finished"),
            Err(err) => error!("event loop finished with error: {}", err),
        }
        *self.result.lock().expect("result slot poisoned") = Some(result.clone());
        // deliver the final close callback if a failure path set it up late
        self.core.drain_pending(&mut self.handler);
        result
    }

    fn run_inner(&mut self) -> Result<()> {
        loop {
            // a close may have been requested while disconnected
            if let Some(done) = self.core.done() {
                return done.clone();
            }

            self.core.set_connecting();
            let endpoint = self.endpoints.current().clone();
            debug!("connecting to {}", endpoint);
            let connected = self.transport.connect(
                &endpoint,
                &self.core.options().sasl,
                self.core.options().connect_timeout,
            );
            match connected {
                Ok(stream) => match self.run_connection(stream, &endpoint) {
                    Ok(()) => {
                        return self
                            .core
                            .done()
                            .cloned()
                            .expect("connection loop finished without a result")
                    }
                    Err(err) => self.handle_failure(err)?,
                },
                Err(err) => self.handle_failure(err)?,
            }
        }
    }

    /// Decide what a connection failure means: schedule a retry for
    /// transport errors while attempts remain, finish the loop otherwise.
    fn handle_failure(&mut self, err: Error) -> Result<()> {
        if !err.is_transport() {
            self.core.fail(err);
            self.core.drain_pending(&mut self.handler);
            return self.core.done().cloned().expect("failed connection has a result");
        }
        let delay = self.retry.as_mut().and_then(RetrySchedule::next);
        let delay = match delay {
            Some(delay) => delay,
            None => {
                let err = match &self.retry {
                    Some(retry) if retry.attempts() > 0 => {
                        ReconnectExhaustedSnafu {
                            attempts: retry.attempts(),
                        }
                        .into_error(err)
                    }
                    _ => err,
                };
                self.core.fail(err);
                self.core.drain_pending(&mut self.handler);
                return self.core.done().cloned().expect("failed connection has a result");
            }
        };
        self.core.fail_over(&err, &mut self.handler);
        self.endpoints.advance();
        self.wait_backoff(delay)
    }

    /// Sit out the backoff delay, still serving the work queue so
    /// submitters are not blocked on a dead connection.
    fn wait_backoff(&mut self, delay: Duration) -> Result<()> {
        debug!("retrying in {:?}", delay);
        let timeout = self.timers.timer.set_timeout(delay, TimerKind::Backoff);
        let mut events = Events::with_capacity(16);
        loop {
            if self.core.done().is_some() {
                self.timers.timer.cancel_timeout(&timeout);
                return Ok(());
            }
            self.poll.poll(&mut events, None).context(IoSnafu)?;
            for event in events.iter() {
                match event.token() {
                    TIMER => {
                        while let Some(kind) = self.timers.timer.poll() {
                            if kind == TimerKind::Backoff {
                                return Ok(());
                            }
                        }
                    }
                    WORK => self.drain_work(),
                    _ => unreachable!("no stream is registered while disconnected"),
                }
            }
        }
    }

    fn run_connection(&mut self, mut stream: T::Stream, endpoint: &Endpoint) -> Result<()> {
        self.poll
            .register(
                &stream,
                STREAM,
                Ready::readable() | Ready::writable(),
                PollOpt::edge(),
            )
            .context(IoSnafu)?;

        let result = self.connection_loop(&mut stream, endpoint);

        let _ = self.poll.deregister(&stream);
        self.timers.stop();
        self.frame_buffer.clear();
        self.outbuf.clear();
        self.outbuf.unseal();
        result
    }

    fn connection_loop(&mut self, stream: &mut T::Stream, endpoint: &Endpoint) -> Result<()> {
        let poll_timeout = self.core.options().poll_timeout;
        self.core.transport_connected(&endpoint.host);

        // tasks may have queued while we were disconnected
        self.drain_work();
        self.flush_core()?;

        let mut retry_reset = false;
        let mut events = Events::with_capacity(128);
        loop {
            self.poll.poll(&mut events, poll_timeout).context(IoSnafu)?;
            if events.is_empty() {
                continue;
            }

            let had_data_to_write = !self.outbuf.is_empty();

            trace!("-- processing poll events --");
            for event in events.iter() {
                match event.token() {
                    STREAM => {
                        if event.readiness().is_writable() {
                            self.write_to_stream(stream)?;
                        }
                        if event.readiness().is_readable() {
                            self.read_from_stream(stream)?;
                        }
                    }
                    TIMER => self.process_timers()?,
                    WORK => self.drain_work(),
                    _ => unreachable!(),
                }
            }

            self.flush_core()?;

            if !retry_reset && self.core.state() == ConnectionState::Open {
                // the connection proved itself; future failures start a
                // fresh backoff schedule
                if let Some(retry) = &mut self.retry {
                    retry.reset();
                }
                retry_reset = true;
            }

            if self.core.done().is_some() && self.outbuf.is_empty() {
                return Ok(());
            }

            // If we have data to write, reregister for readable|writable;
            // this may be spurious, but if we buffered new data without
            // hitting WouldBlock, mio won't wake us again without it. If we
            // don't, drop back to readable only (but only if we were
            // registered for writable, to avoid a syscall per pass).
            if !self.outbuf.is_empty() {
                trace!("ending poll pass with data still to write - reregistering for writable");
                self.poll
                    .reregister(
                        stream,
                        STREAM,
                        Ready::readable() | Ready::writable(),
                        PollOpt::edge(),
                    )
                    .context(IoSnafu)?;
            } else if had_data_to_write {
                trace!("had queued data but now we don't - waiting for socket to be readable");
                self.poll
                    .reregister(stream, STREAM, Ready::readable(), PollOpt::edge())
                    .context(IoSnafu)?;
            }
        }
    }

    /// Move negotiated timers and queued frames from the state machine to
    /// the write buffer.
    fn flush_core(&mut self) -> Result<()> {
        if let Some(plan) = self.core.take_idle_plan() {
            self.timers.start(plan);
        }
        for frame in self.core.take_outbox() {
            self.outbuf.push_frame(&self.codec, &frame)?;
        }
        if self.core.writes_sealed() && !self.outbuf.is_sealed() {
            self.outbuf.seal();
        }
        Ok(())
    }

    fn drain_work(&mut self) {
        loop {
            match self.work_rx.try_recv() {
                Ok(task) => {
                    // contained like handler callbacks; a panicking task must
                    // not take the loop down with it
                    let core = &mut self.core;
                    machine::shielded("work task", || task(&mut Context::new(core)));
                    self.core.drain_pending(&mut self.handler);
                }
                Err(TryRecvError::Empty) => return,
                // all handles dropped; the handler may still drive the
                // connection to completion on its own
                Err(TryRecvError::Disconnected) => return,
            }
        }
    }

    fn process_timers(&mut self) -> Result<()> {
        while let Some(kind) = self.timers.timer.poll() {
            match kind {
                TimerKind::Rx => match self.timers.fire_rx() {
                    IdleState::StillRunning => {
                        trace!("rx deadline fired, but have received data since last");
                    }
                    IdleState::Expired => {
                        error!("missed heartbeats from peer - closing connection");
                        return MissedRemoteHeartbeatsSnafu.fail();
                    }
                },
                TimerKind::Tx => match self.timers.fire_tx() {
                    IdleState::StillRunning => {
                        trace!("tx deadline fired, but have sent data since last");
                    }
                    IdleState::Expired => {
                        if self.outbuf.is_empty() {
                            debug!("sending empty frame");
                            self.outbuf.push_frame(&self.codec, &Frame::Empty)?;
                        } else {
                            warn!("tx deadline fired, but already have queued data to write - possible socket problem");
                        }
                    }
                },
                // stale timeout from a canceled backoff
                TimerKind::Backoff => (),
            }
        }
        Ok(())
    }

    fn read_from_stream(&mut self, stream: &mut T::Stream) -> Result<()> {
        let codec = &self.codec;
        let core = &mut self.core;
        let handler = &mut self.handler;
        let n = self.frame_buffer.read_from(stream, codec, |frame| {
            core.process_frame(frame, handler)?;
            // stop reading once a close exchange (or failure) finished; an
            // EOF behind the peer's final frame is not an error
            Ok(match core.done() {
                Some(_) => ReadLoop::Stop,
                None => ReadLoop::Continue,
            })
        })?;
        if n > 0 {
            self.timers.record_rx_activity();
        }
        Ok(())
    }

    fn write_to_stream(&mut self, stream: &mut T::Stream) -> Result<()> {
        let len = self.outbuf.len();
        let mut pos = 0;

        // keep writing until all buffered bytes are out or we hit WouldBlock
        while pos < len {
            trace!("trying to write {} bytes", len - pos);
            let n = match stream.write(&self.outbuf[pos..]) {
                Ok(n) => {
                    trace!("wrote {} bytes", n);
                    self.timers.record_tx_activity();
                    n
                }
                Err(err) => match err.kind() {
                    io::ErrorKind::WouldBlock => {
                        self.outbuf.drain_written(pos);
                        return Ok(());
                    }
                    _ => return Err(err).context(IoSnafu),
                },
            };
            pos += n;
        }

        self.outbuf.clear();
        Ok(())
    }
}
