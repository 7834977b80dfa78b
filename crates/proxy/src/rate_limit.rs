use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Sliding-window request limiter keyed by workspace. A limit of zero
/// disables the check for that call.
#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<Mutex<HashMap<String, VecDeque<Instant>>>>,
    window: Duration,
    max_keys: usize,
}

impl RateLimiter {
    pub fn new(window: Duration, max_keys: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            window,
            max_keys,
        }
    }

    pub fn allow(&self, key: &str, limit: u32) -> bool {
        if limit == 0 {
            return true;
        }

        let now = Instant::now();
        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let window = self.window;
        let events = inner.entry(key.to_string()).or_default();
        while events
            .front()
            .is_some_and(|t| now.duration_since(*t) > window)
        {
            events.pop_front();
        }

        let allowed = events.len() < limit as usize;
        if allowed {
            events.push_back(now);
        }

        // Bound memory across many idle workspaces.
        if inner.len() > self.max_keys {
            inner.retain(|_, events| {
                events
                    .back()
                    .is_some_and(|t| now.duration_since(*t) <= window)
            });
            while inner.len() > self.max_keys {
                let Some(victim) = inner.keys().next().cloned() else {
                    break;
                };
                inner.remove(&victim);
            }
        }

        allowed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn limiter_rejects_once_the_window_is_full() {
        let limiter = RateLimiter::new(Duration::from_secs(60), 64);
        assert!(limiter.allow("mut:A1", 2));
        assert!(limiter.allow("mut:A1", 2));
        assert!(!limiter.allow("mut:A1", 2));
    }

    #[test]
    fn limiter_is_per_key() {
        let limiter = RateLimiter::new(Duration::from_secs(60), 64);
        assert!(limiter.allow("mut:A1", 1));
        assert!(!limiter.allow("mut:A1", 1));
        assert!(limiter.allow("mut:B1", 1));
    }

    #[test]
    fn limiter_recovers_after_the_window_elapses() {
        let limiter = RateLimiter::new(Duration::from_millis(5), 64);
        assert!(limiter.allow("mut:A1", 1));
        assert!(!limiter.allow("mut:A1", 1));
        thread::sleep(Duration::from_millis(10));
        assert!(limiter.allow("mut:A1", 1));
    }

    #[test]
    fn zero_limit_disables_the_check() {
        let limiter = RateLimiter::new(Duration::from_secs(60), 64);
        for _ in 0..100 {
            assert!(limiter.allow("mut:A1", 0));
        }
    }
}
