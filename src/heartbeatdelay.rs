use std::time::Duration;

use tokio::select;
use tokio::sync::Notify;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

/// Produces delays that line up with a fixed period, skipping ticks that were
/// missed entirely.
#[derive(Debug)]
pub(crate) struct Metronome {
    period: Duration,
    next_tick: Instant,
}

impl Metronome {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            next_tick: Instant::now(),
        }
    }

    pub fn next_tick_delay(&mut self) -> Duration {
        self.next_tick_delay_at(Instant::now())
    }

    fn next_tick_delay_at(&mut self, now: Instant) -> Duration {
        if now < self.next_tick {
            return self.next_tick - now;
        }

        if self.period.is_zero() {
            self.next_tick = now;
            return Duration::ZERO;
        }

        let behind = now - self.next_tick;
        let missed = behind.as_nanos() / self.period.as_nanos();
        let advance = self.period.as_nanos() * (missed + 1);
        self.next_tick += Duration::from_nanos(advance.min(u64::MAX as u128) as u64);

        self.next_tick - now
    }
}

/// The wait between two heartbeats.
///
/// A requested heartbeat wakes the waiter early, but never before
/// `min_heartbeat_interval` has passed since the delay was created.
#[derive(Debug)]
pub(crate) struct HeartbeatDelay {
    next_heartbeat_at: Instant,
    earliest_heartbeat_at: Instant,
    requested: Notify,
}

impl HeartbeatDelay {
    pub fn new(heartbeat_interval: Duration, min_heartbeat_interval: Duration) -> Self {
        let now = Instant::now();
        Self {
            next_heartbeat_at: now + heartbeat_interval,
            earliest_heartbeat_at: now + min_heartbeat_interval,
            requested: Notify::new(),
        }
    }

    pub fn request_heartbeat(&self) {
        self.requested.notify_one();
    }

    pub async fn wait(&self, shutdown_token: &CancellationToken) {
        select! {
            _ = shutdown_token.cancelled() => {}
            _ = sleep_until(self.next_heartbeat_at) => {}
            _ = async {
                self.requested.notified().await;
                sleep_until(self.earliest_heartbeat_at).await;
            } => {}
        }
    }
}
