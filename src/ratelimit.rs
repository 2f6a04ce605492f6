//! Rate-limit helper for the "warn, but at most once per 15s" requirement
//! on daemon-absence and pipe-timeout warnings (§4.3).

use std::sync::Mutex;
use std::time::{Duration, Instant};

pub struct RateLimiter {
    period: Duration,
    last: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(period: Duration) -> Self {
        RateLimiter {
            period,
            last: Mutex::new(None),
        }
    }

    /// Returns `true` if the caller should emit its warning now.
    pub fn allow(&self) -> bool {
        let now = Instant::now();
        let mut last = self.last.lock().unwrap();
        match *last {
            Some(prev) if now.duration_since(prev) < self.period => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_first_then_suppresses() {
        let rl = RateLimiter::new(Duration::from_secs(15));
        assert!(rl.allow());
        assert!(!rl.allow());
    }
}
