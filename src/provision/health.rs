use log::debug;
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, timeout, Instant};

use crate::config::HealthPolicy;

/// Growing delay between polls, clamped to the policy maximum.
pub(crate) struct Backoff {
    next: Duration,
    max: Duration,
    multiplier: f64,
}

impl Backoff {
    pub(crate) fn new(policy: &HealthPolicy) -> Self {
        Self {
            next: policy.initial_interval.min(policy.max_interval),
            max: policy.max_interval,
            multiplier: policy.multiplier.max(1.0),
        }
    }

    pub(crate) fn next_delay(&mut self) -> Duration {
        let current = self.next;
        self.next = self.next.mul_f64(self.multiplier).min(self.max);
        current
    }
}

/// Poll `probe` until it reports `true` or `deadline` elapses.
///
/// No probe or sleep extends past the deadline.
pub(crate) async fn wait_until<F, Fut>(policy: &HealthPolicy, deadline: Duration, mut probe: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let started = Instant::now();
    let mut backoff = Backoff::new(policy);
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        let remaining = deadline.saturating_sub(started.elapsed());
        if remaining.is_zero() {
            break;
        }
        if let Ok(true) = timeout(remaining, probe()).await {
            debug!("health_ok: attempt={} elapsed_ms={}", attempt, started.elapsed().as_millis());
            return true;
        }

        let remaining = deadline.saturating_sub(started.elapsed());
        if remaining.is_zero() {
            break;
        }
        let delay = backoff.next_delay().min(remaining);
        debug!("health_wait: attempt={} delay_ms={}", attempt, delay.as_millis());
        sleep(delay).await;
    }

    debug!("health_deadline: attempts={} deadline_ms={}", attempt, deadline.as_millis());
    false
}
