//! Reconnect backoff: exponential with jitter.

use std::time::Duration;

use rand::Rng;

const INITIAL: Duration = Duration::from_secs(1);
const CAP: Duration = Duration::from_secs(10 * 60);

/// How long a connection must survive before the delay resets.
pub const STABLE_CONNECTION: Duration = Duration::from_secs(60);

/// Exponential backoff starting at 1s, doubling to a 10-minute cap,
/// with ±20% jitter on every draw.
#[derive(Debug)]
pub struct Backoff {
    current: Duration,
}

impl Backoff {
    pub fn new() -> Self {
        Backoff { current: INITIAL }
    }

    /// The next delay to sleep; advances the schedule.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.current;
        self.current = (self.current * 2).min(CAP);
        jitter(base)
    }

    /// Back to the initial delay, after a stable connection.
    pub fn reset(&mut self) {
        self.current = INITIAL;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::new()
    }
}

fn jitter(base: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.8..=1.2);
    base.mul_f64(factor)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn in_jitter_range(value: Duration, base: Duration) -> bool {
        value >= base.mul_f64(0.8) && value <= base.mul_f64(1.2)
    }

    #[test]
    fn doubles_up_to_cap() {
        let mut backoff = Backoff::new();
        let mut base = INITIAL;
        for _ in 0..12 {
            let delay = backoff.next_delay();
            assert!(
                in_jitter_range(delay, base),
                "delay {delay:?} outside jitter range of {base:?}"
            );
            base = (base * 2).min(CAP);
        }
        // Once capped it stays capped.
        let delay = backoff.next_delay();
        assert!(in_jitter_range(delay, CAP));
    }

    #[test]
    fn reset_returns_to_initial() {
        let mut backoff = Backoff::new();
        for _ in 0..5 {
            backoff.next_delay();
        }
        backoff.reset();
        assert!(in_jitter_range(backoff.next_delay(), INITIAL));
    }
}
