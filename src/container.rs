use crate::codec::FrameCodec;
use crate::errors::*;
use crate::handler::Handler;
use crate::options::ConnectionOptions;
use crate::reactor::work_queue::{work_queue, ResultSlot, WorkSender};
use crate::reactor::{Context, Reactor};
use crate::transport::Transport;
use snafu::ResultExt;
use std::sync::{Arc, Mutex};
use std::thread::{Builder, JoinHandle};

/// One reactive messaging container: a handler, a transport, a codec, and
/// the event loop that connects them.
///
/// A container drives exactly one connection (re-established across
/// failovers). All protocol activity happens on the event loop thread;
/// other threads interact with it through a [`ContainerHandle`].
///
/// ```rust,no_run
/// use quiver::{Container, ConnectionOptions, Endpoint, TcpTransport};
/// # use quiver::{Context, Handler, Result};
/// # struct App;
/// # impl Handler for App {
/// #     fn on_connection_open(&mut self, ctx: &mut Context) {
/// #         let _ = ctx.open_session();
/// #     }
/// # }
/// # struct Codec;
/// # impl quiver::FrameCodec for Codec {
/// #     fn decode(&self, _: &[u8]) -> Result<quiver::Decoded> { unimplemented!() }
/// #     fn encode(&self, _: &quiver::Frame, _: &mut Vec<u8>) -> Result<()> { unimplemented!() }
/// # }
/// # fn main() -> Result<()> {
/// let options = ConnectionOptions::new("ticker-feed")
///     .endpoint(Endpoint::new("broker", 5672));
/// let container = Container::new(App, TcpTransport::default(), Codec, options)?;
/// let thread = container.spawn()?;
/// // ... the handler drives the connection ...
/// thread.close()
/// # }
/// ```
pub struct Container<H: Handler, T: Transport, C: FrameCodec> {
    reactor: Reactor<H, T, C>,
    work: WorkSender,
}

impl<H: Handler, T: Transport, C: FrameCodec> Container<H, T, C> {
    /// Build a container. Validates `options` and fails fast; no I/O
    /// happens until the container runs.
    pub fn new(
        handler: H,
        transport: T,
        codec: C,
        options: ConnectionOptions,
    ) -> Result<Container<H, T, C>> {
        options.validate()?;
        let result: ResultSlot = Arc::new(Mutex::new(None));
        let (work, work_rx) = work_queue(
            options.work_queue_bound,
            options.work_queue_policy,
            Arc::clone(&result),
        );
        let reactor = Reactor::new(handler, transport, codec, options, work_rx, result)?;
        Ok(Container { reactor, work })
    }

    /// A handle for submitting work from other threads. Handles stay valid
    /// for the life of the process; operations on a finished container
    /// report its terminal result.
    pub fn handle(&self) -> ContainerHandle {
        ContainerHandle {
            work: self.work.clone(),
        }
    }

    /// Run the event loop on the calling thread until the connection
    /// finishes.
    pub fn run(self) -> Result<()> {
        let Container { reactor, work } = self;
        drop(work);
        reactor.run()
    }

    /// Run the event loop on a dedicated thread.
    pub fn spawn(self) -> Result<ContainerThread> {
        let handle = self.handle();
        let Container { reactor, work } = self;
        drop(work);
        let join = Builder::new()
            .name("quiver-io".to_string())
            .spawn(move || reactor.run())
            .context(ForkFailedSnafu)?;
        Ok(ContainerThread { join, handle })
    }
}

/// Cloneable, thread-safe handle to a running container.
#[derive(Clone)]
pub struct ContainerHandle {
    work: WorkSender,
}

impl ContainerHandle {
    /// Queue a closure for execution on the event loop thread and return as
    /// soon as it is enqueued. At capacity the configured
    /// [`WorkQueuePolicy`](crate::WorkQueuePolicy) decides between blocking
    /// and failing with [`Error::WorkQueueFull`](crate::Error::WorkQueueFull).
    pub fn submit<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut Context) + Send + 'static,
    {
        self.work.submit(Box::new(f))
    }

    /// Run a closure on the event loop thread and block until its return
    /// value comes back. Must not be called from a handler callback; the
    /// loop cannot serve a task it is itself waiting on.
    pub fn call<R, F>(&self, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut Context) -> R + Send + 'static,
    {
        self.work.call(f)
    }

    /// Request an orderly close of the connection.
    pub fn close(&self) -> Result<()> {
        self.call(|ctx| ctx.close())?
    }
}

/// A container running on its own thread, created by
/// [`Container::spawn`](Container::spawn).
pub struct ContainerThread {
    join: JoinHandle<Result<()>>,
    handle: ContainerHandle,
}

impl ContainerThread {
    pub fn handle(&self) -> ContainerHandle {
        self.handle.clone()
    }

    /// Request an orderly close and wait for the event loop to wind down,
    /// returning the connection's final result.
    pub fn close(self) -> Result<()> {
        let requested = self.handle.close();
        if let Err(err) = &requested {
            // a full queue would leave us joining a loop that never learns
            // of the close request
            if err.is_capacity() {
                return requested;
            }
            // any other error means the loop already finished; the join
            // result is authoritative
        }
        self.join()
    }

    /// Wait for the event loop thread to finish without requesting a close.
    pub fn join(self) -> Result<()> {
        match self.join.join() {
            Ok(result) => result,
            Err(payload) => {
                let message = if let Some(s) = payload.downcast_ref::<&str>() {
                    (*s).to_string()
                } else if let Some(s) = payload.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "non-string panic payload".to_string()
                };
                IoThreadPanicSnafu { message }.fail()
            }
        }
    }
}
