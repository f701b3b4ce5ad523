use crate::heartbeats::{IdleDeadline, IdleState};
use crate::reactor::machine::IdlePlan;
use log::{debug, trace};
use mio_extras::timer::Timer;

/// Events delivered through the event loop's single timer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum TimerKind {
    /// The peer's inactivity window elapsed.
    Rx,
    /// Our obligation to produce traffic came due.
    Tx,
    /// The reconnect backoff delay elapsed.
    Backoff,
}

struct RxTx {
    rx: Option<IdleDeadline<TimerKind>>,
    tx: Option<IdleDeadline<TimerKind>>,
}

/// The event loop's timer plus the pair of idle deadlines negotiated from
/// the Open exchange. Deadlines exist only while a connection generation is
/// live; the backoff timeout shares the same timer between generations.
#[derive(Default)]
pub(crate) struct IdleTimers {
    pub(crate) timer: Timer<TimerKind>,
    deadlines: Option<RxTx>,
}

impl IdleTimers {
    pub(crate) fn start(&mut self, plan: IdlePlan) {
        assert!(
            self.deadlines.is_none(),
            "idle deadlines started while already running"
        );
        debug!("starting idle timers (tx {:?}, rx {:?})", plan.tx, plan.rx);
        let rx = plan
            .rx
            .map(|window| IdleDeadline::start(TimerKind::Rx, window, &mut self.timer));
        let tx = plan
            .tx
            .map(|window| IdleDeadline::start(TimerKind::Tx, window, &mut self.timer));
        self.deadlines = Some(RxTx { rx, tx });
    }

    /// Tear down the deadlines at the end of a connection generation.
    pub(crate) fn stop(&mut self) {
        if let Some(deadlines) = self.deadlines.take() {
            if let Some(rx) = &deadlines.rx {
                rx.cancel(&mut self.timer);
            }
            if let Some(tx) = &deadlines.tx {
                tx.cancel(&mut self.timer);
            }
        }
    }

    pub(crate) fn record_rx_activity(&mut self) {
        if let Some(RxTx { rx: Some(rx), .. }) = &mut self.deadlines {
            trace!("recording rx activity");
            rx.record_activity();
        }
    }

    pub(crate) fn record_tx_activity(&mut self) {
        if let Some(RxTx { tx: Some(tx), .. }) = &mut self.deadlines {
            trace!("recording tx activity");
            tx.record_activity();
        }
    }

    /// Fire the rx deadline. Returns `Expired` when the peer has been
    /// silent for the whole window.
    pub(crate) fn fire_rx(&mut self) -> IdleState {
        match &mut self.deadlines {
            Some(RxTx { rx: Some(rx), .. }) => rx.fire(&mut self.timer),
            // stale timeout from a previous generation
            _ => IdleState::StillRunning,
        }
    }

    /// Fire the tx deadline. Returns `Expired` when we have produced no
    /// traffic for the whole window and owe the peer a frame.
    pub(crate) fn fire_tx(&mut self) -> IdleState {
        match &mut self.deadlines {
            Some(RxTx { tx: Some(tx), .. }) => tx.fire(&mut self.timer),
            _ => IdleState::StillRunning,
        }
    }
}
