use std::{
    sync::Arc,
    time::Duration,
};

use tokio::{
    sync::{Mutex, watch},
    time::{self, Instant, MissedTickBehavior},
};

/// A single client's admission quota: a continuously replenished token
/// bucket with its own background refill task.
///
/// The refill task is spawned at construction and runs until `stop()` is
/// called or the bucket is dropped. All counter mutation happens under one
/// lock so concurrent `allow` calls can never spend the same token twice.
pub struct TokenBucket {
    state: Arc<Mutex<BucketState>>,
    interval_tx: watch::Sender<Duration>,
    stop_tx: watch::Sender<bool>,
}

#[derive(Debug)]
struct BucketState {
    capacity: u32,
    rate_per_sec: f64,
    available: f64,
    last_refill: Instant,
}

impl BucketState {
    /// Credits tokens for the time elapsed since the last refill, capped at
    /// the current capacity.
    fn settle(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.available = (self.available + elapsed * self.rate_per_sec).min(self.capacity as f64);
        self.last_refill = now;
    }
}

impl TokenBucket {
    /// Callers guarantee `capacity > 0` and `rate_per_sec > 0`; values come
    /// validated from config parsing or the admin API.
    pub fn new(capacity: u32, rate_per_sec: f64) -> Self {
        let state = Arc::new(Mutex::new(BucketState {
            capacity,
            rate_per_sec,
            available: capacity as f64,
            last_refill: Instant::now(),
        }));

        let (interval_tx, interval_rx) = watch::channel(tick_interval(rate_per_sec));
        let (stop_tx, stop_rx) = watch::channel(false);

        // the first tick deadline is anchored here, not at the spawned
        // task's first poll, so a late-scheduled task does not push the
        // first credit past one full period after construction
        let ticker = new_ticker(tick_interval(rate_per_sec));
        tokio::spawn(run_refill(state.clone(), ticker, interval_rx, stop_rx));

        Self {
            state,
            interval_tx,
            stop_tx,
        }
    }

    /// Admits the request if at least one whole token is available,
    /// consuming exactly one. Never fails.
    pub async fn allow(&self) -> bool {
        let mut state = self.state.lock().await;
        if state.available >= 1.0 {
            state.available -= 1.0;
            true
        } else {
            false
        }
    }

    /// Applies a new quota. Time elapsed since the last refill is settled
    /// at the old rate (capped at the old capacity) before the new
    /// parameters take effect, so a policy change neither discards accrued
    /// quota nor applies the new rate retroactively.
    pub async fn update_config(&self, new_capacity: u32, new_rate_per_sec: f64) {
        {
            let mut state = self.state.lock().await;
            let now = Instant::now();
            state.settle(now);
            state.capacity = new_capacity;
            state.rate_per_sec = new_rate_per_sec;
            state.available = state.available.clamp(0.0, new_capacity as f64);
            state.last_refill = now;
        }
        let _ = self.interval_tx.send(tick_interval(new_rate_per_sec));
    }

    /// Cancels the refill task. Safe to call more than once; after this the
    /// bucket no longer replenishes.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    #[cfg(test)]
    pub(crate) async fn available(&self) -> f64 {
        self.state.lock().await.available
    }

    #[cfg(test)]
    pub(crate) async fn capacity(&self) -> u32 {
        self.state.lock().await.capacity
    }
}

async fn run_refill(
    state: Arc<Mutex<BucketState>>,
    mut ticker: time::Interval,
    mut interval_rx: watch::Receiver<Duration>,
    mut stop_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                state.lock().await.settle(Instant::now());
            }
            changed = interval_rx.changed() => {
                if changed.is_err() {
                    return;
                }
                ticker = new_ticker(*interval_rx.borrow());
            }
            _ = stop_rx.changed() => return,
        }
    }
}

fn new_ticker(period: Duration) -> time::Interval {
    // interval() would fire immediately; the first credit belongs one full
    // period in the future.
    let mut ticker = time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker
}

/// Tick interval tiering: tight granularity for fast buckets, bounded
/// wake-ups for slow ones.
fn tick_interval(rate_per_sec: f64) -> Duration {
    if rate_per_sec >= 10.0 {
        Duration::from_millis(100)
    } else if rate_per_sec >= 1.0 {
        Duration::from_secs_f64(1.0 / rate_per_sec)
    } else {
        Duration::from_secs(1)
    }
}
