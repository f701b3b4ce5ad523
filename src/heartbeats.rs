use log::trace;
use mio_extras::timer::{Timeout, Timer};
use std::fmt::Debug;
use std::time::{Duration, Instant};

/// Result of firing an idle deadline.
#[derive(Debug, Copy, Clone, PartialEq)]
pub(crate) enum IdleState {
    StillRunning,
    Expired,
}

/// A resettable deadline over a window of inactivity.
///
/// Activity is recorded cheaply (a timestamp store); the timer itself is only
/// rescheduled when it fires, at which point the recorded activity decides
/// whether the window truly expired or the deadline just slides forward.
#[derive(Debug)]
pub(crate) struct IdleDeadline<T: Copy + Debug> {
    val: T,
    last: Instant,
    timeout: Timeout,
    window: Duration,
}

impl<T: Copy + Debug> IdleDeadline<T> {
    pub(crate) fn start(val: T, window: Duration, timer: &mut Timer<T>) -> IdleDeadline<T> {
        assert!(
            window > Duration::from_millis(0),
            "idle window cannot be 0"
        );
        let last = Instant::now();
        let timeout = timer.set_timeout(window, val);
        IdleDeadline {
            val,
            last,
            timeout,
            window,
        }
    }

    pub(crate) fn record_activity(&mut self) {
        self.last = Instant::now();
    }

    pub(crate) fn cancel(&self, timer: &mut Timer<T>) {
        timer.cancel_timeout(&self.timeout);
    }

    pub(crate) fn fire(&mut self, timer: &mut Timer<T>) -> IdleState {
        timer.cancel_timeout(&self.timeout);

        // See if the window has expired (in which case we restart for the
        // full window) or if there were intervening record_activity() calls
        // (in which case we restart for the remaining time).
        //
        // A few ms of fudge handles imprecise wakeups; during unit tests we
        // sometimes wake <1ms before expiration but want to count that as
        // expired. Idle timeouts are hundreds of ms at minimum, so this is
        // harmless.
        let elapsed = self.last.elapsed();
        let (when, state) = if self.window <= elapsed + Duration::from_millis(5) {
            (self.window, IdleState::Expired)
        } else {
            (self.window - elapsed, IdleState::StillRunning)
        };

        trace!(
            "setting new idle deadline {:?} for {:?} (window = {:?}, elapsed = {:?})",
            self.val,
            when,
            self.window,
            elapsed
        );
        self.timeout = timer.set_timeout(when, self.val);
        state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::{Events, Poll, PollOpt, Ready, Token};
    use mio_extras::timer::Builder;

    struct Harness {
        poll: Poll,
        events: Events,
        timer: Timer<u32>,
    }

    impl Harness {
        const TOKEN: Token = Token(0);

        fn new() -> Harness {
            let poll = Poll::new().unwrap();
            let events = Events::with_capacity(16);
            let timer = Builder::default().tick_duration(millis(10)).build();
            poll.register(&timer, Self::TOKEN, Ready::readable(), PollOpt::edge())
                .unwrap();
            Harness {
                poll,
                events,
                timer,
            }
        }

        fn poll(&mut self, timeout: Duration) {
            self.poll.poll(&mut self.events, Some(timeout)).unwrap();
        }

        fn poll_until_fire(&mut self, d: &mut IdleDeadline<u32>) -> IdleState {
            loop {
                self.poll.poll(&mut self.events, None).unwrap();
                for ev in &self.events {
                    assert_eq!(ev.token(), Self::TOKEN);
                    if self.timer.poll().is_some() {
                        return d.fire(&mut self.timer);
                    }
                }
            }
        }
    }

    fn millis(u: u64) -> Duration {
        Duration::from_millis(u)
    }

    fn assert_duration_is_about(one: Duration, two: Duration) {
        // NOTE: assumes two is >= 50ms, or will panic on the subtraction.
        // Fine for all our tests which are 100s of ms test durations
        assert!(one > two - millis(50));
        assert!(one < two + millis(50));
    }

    #[test]
    fn fire_after_expiration() {
        let mut t = Harness::new();
        let mut d = IdleDeadline::start(0, millis(400), &mut t.timer);
        let start = Instant::now();

        let state = t.poll_until_fire(&mut d);

        assert_duration_is_about(start.elapsed(), millis(400));
        assert_eq!(state, IdleState::Expired);
    }

    #[test]
    fn fire_after_activity() {
        let mut t = Harness::new();
        let mut d = IdleDeadline::start(0, millis(400), &mut t.timer);
        let start = Instant::now();

        // deadline shouldn't fire yet
        t.poll(millis(200));
        assert_duration_is_about(start.elapsed(), millis(200));
        assert!(t.events.is_empty());
        d.record_activity();

        // deadline should fire, but should be set back to "still running"
        let state = t.poll_until_fire(&mut d);
        assert_duration_is_about(start.elapsed(), millis(400));
        assert_eq!(state, IdleState::StillRunning);

        // deadline should fire again and expire in just ~200ms
        let state = t.poll_until_fire(&mut d);
        assert_duration_is_about(start.elapsed(), millis(600));
        assert_eq!(state, IdleState::Expired);
    }
}
