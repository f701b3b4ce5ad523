use crate::errors::*;
use crate::options::WorkQueuePolicy;
use crate::reactor::Context;
use mio_extras::channel::{sync_channel, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};

/// A closure shipped to the event loop thread for execution against the
/// connection.
pub(crate) type Task = Box<dyn FnOnce(&mut Context) + Send + 'static>;

/// Shared slot holding the event loop's final result. Written exactly once,
/// when the loop exits; submitters consult it to turn a dead channel into a
/// meaningful error.
pub(crate) type ResultSlot = Arc<Mutex<Option<Result<()>>>>;

pub(crate) fn work_queue(
    bound: usize,
    policy: WorkQueuePolicy,
    result: ResultSlot,
) -> (WorkSender, Receiver<Task>) {
    let (tx, rx) = sync_channel(bound);
    (WorkSender { tx, policy, result }, rx)
}

/// Cloneable submission side of the work queue. The receiving side lives in
/// the event loop and is pollable, so a submission wakes the loop.
#[derive(Clone)]
pub(crate) struct WorkSender {
    tx: SyncSender<Task>,
    policy: WorkQueuePolicy,
    result: ResultSlot,
}

impl WorkSender {
    /// Enqueue a task. At capacity this blocks or rejects according to the
    /// configured policy; after the event loop has exited it reports the
    /// loop's terminal result instead.
    pub(crate) fn submit(&self, task: Task) -> Result<()> {
        match self.policy {
            WorkQueuePolicy::Block => self.tx.send(task).map_err(|_| self.terminal_error()),
            WorkQueuePolicy::Reject => self.tx.try_send(task).map_err(|err| match err {
                TrySendError::Full(_) => WorkQueueFullSnafu.build(),
                TrySendError::Io(_) | TrySendError::Disconnected(_) => self.terminal_error(),
            }),
        }
    }

    /// Enqueue a task and block until the event loop has run it, returning
    /// its result. Must not be called from the event loop thread.
    pub(crate) fn call<R, F>(&self, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut Context) -> R + Send + 'static,
    {
        let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
        self.submit(Box::new(move |ctx| {
            let _ = reply_tx.send(f(ctx));
        }))?;
        // an error here means the loop dropped the task without running it
        reply_rx.recv().map_err(|_| self.terminal_error())
    }

    fn terminal_error(&self) -> Error {
        match &*self.result.lock().expect("result slot poisoned") {
            Some(Err(err)) => err.clone(),
            Some(Ok(())) => ConnectionClosedSnafu.build(),
            None => EventLoopDroppedSnafu.build(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::TryRecvError;

    fn reject_queue(bound: usize) -> (WorkSender, Receiver<Task>, ResultSlot) {
        let slot: ResultSlot = Arc::new(Mutex::new(None));
        let (tx, rx) = work_queue(bound, WorkQueuePolicy::Reject, Arc::clone(&slot));
        (tx, rx, slot)
    }

    #[test]
    fn tasks_arrive_in_submission_order() {
        let (tx, rx, _slot) = reject_queue(4);
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let log = Arc::clone(&log);
            tx.submit(Box::new(move |_| log.lock().unwrap().push(i)))
                .unwrap();
        }

        let mut core = crate::reactor::machine::Core::new(
            crate::ConnectionOptions::new("test")
                .endpoint(crate::Endpoint::new("localhost", 5672)),
        );
        let mut ran = 0;
        loop {
            match rx.try_recv() {
                Ok(task) => {
                    task(&mut Context::new(&mut core));
                    ran += 1;
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => panic!("sender alive"),
            }
        }
        assert_eq!(ran, 3);
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn reject_policy_fails_fast_at_capacity() {
        let (tx, _rx, _slot) = reject_queue(1);
        tx.submit(Box::new(|_| ())).unwrap();
        match tx.submit(Box::new(|_| ())).unwrap_err() {
            Error::WorkQueueFull => (),
            err => panic!("unexpected error {}", err),
        }
    }

    #[test]
    fn dead_queue_reports_loop_result() {
        let (tx, rx, slot) = reject_queue(1);
        *slot.lock().unwrap() = Some(Err(UnexpectedSocketCloseSnafu.build()));
        drop(rx);
        match tx.submit(Box::new(|_| ())).unwrap_err() {
            Error::UnexpectedSocketClose => (),
            err => panic!("unexpected error {}", err),
        }
    }

    #[test]
    fn dead_queue_after_orderly_exit_reports_closed() {
        let (tx, rx, slot) = reject_queue(1);
        *slot.lock().unwrap() = Some(Ok(()));
        drop(rx);
        match tx.submit(Box::new(|_| ())).unwrap_err() {
            Error::ConnectionClosed => (),
            err => panic!("unexpected error {}", err),
        }
    }
}
