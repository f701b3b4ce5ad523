use crate::options::ReconnectOptions;
use std::time::Duration;

/// Tracks consecutive failed connection attempts and produces the delay
/// before each retry.
///
/// The schedule is exponential with a cap; it resets whenever a connection
/// reaches the open state, so a long-lived connection that eventually dies
/// starts retrying from the initial delay again.
#[derive(Debug)]
pub(crate) struct RetrySchedule {
    options: ReconnectOptions,
    attempts: u32,
    next_delay: Duration,
}

impl RetrySchedule {
    pub(crate) fn new(options: ReconnectOptions) -> RetrySchedule {
        let next_delay = options.initial_delay;
        RetrySchedule {
            options,
            attempts: 0,
            next_delay,
        }
    }

    /// The delay to wait before the next attempt, or `None` when the
    /// configured attempt limit is exhausted.
    pub(crate) fn next(&mut self) -> Option<Duration> {
        if let Some(max_attempts) = self.options.max_attempts {
            if self.attempts >= max_attempts {
                return None;
            }
        }
        self.attempts += 1;
        let delay = self.next_delay;
        self.next_delay = Duration::min(
            self.next_delay.mul_f64(self.options.multiplier),
            self.options.max_delay,
        );
        Some(delay)
    }

    pub(crate) fn attempts(&self) -> u32 {
        self.attempts
    }

    pub(crate) fn reset(&mut self) {
        self.attempts = 0;
        self.next_delay = self.options.initial_delay;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn millis(u: u64) -> Duration {
        Duration::from_millis(u)
    }

    fn options() -> ReconnectOptions {
        ReconnectOptions::default()
            .initial_delay(millis(100))
            .max_delay(millis(1000))
            .multiplier(2.0)
    }

    #[test]
    fn delays_double_and_cap() {
        let mut schedule = RetrySchedule::new(options());
        assert_eq!(schedule.next(), Some(millis(100)));
        assert_eq!(schedule.next(), Some(millis(200)));
        assert_eq!(schedule.next(), Some(millis(400)));
        assert_eq!(schedule.next(), Some(millis(800)));
        assert_eq!(schedule.next(), Some(millis(1000)));
        assert_eq!(schedule.next(), Some(millis(1000)));
    }

    #[test]
    fn attempt_limit_exhausts() {
        let mut schedule = RetrySchedule::new(options().max_attempts(Some(2)));
        assert!(schedule.next().is_some());
        assert!(schedule.next().is_some());
        assert_eq!(schedule.next(), None);
        assert_eq!(schedule.attempts(), 2);
    }

    #[test]
    fn reset_restores_initial_delay() {
        let mut schedule = RetrySchedule::new(options().max_attempts(Some(3)));
        schedule.next();
        schedule.next();
        schedule.reset();
        assert_eq!(schedule.attempts(), 0);
        assert_eq!(schedule.next(), Some(millis(100)));
    }
}
