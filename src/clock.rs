// Shared hourly clock. On subscribe it replays every full hour from the
// configured minimum timestamp up to now (oldest first), then fires once per
// hour boundary. Subscribers push timestamps to the front of their task queue,
// which turns the oldest-first replay into newest-first backfill.

use crate::types::{UnixTime, HOUR};
use log::debug;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

pub type TickCallback = Box<dyn Fn(UnixTime) + Send + Sync>;

/// Clock abstraction so reconcilers can be driven by a mock in tests.
/// Callbacks must tolerate being invoked for timestamps they already know.
pub trait Clock: Send + Sync {
    fn on_every_hour(&self, callback: TickCallback) -> ClockHandle;
}

/// Subscription handle; dropping it or calling `unsubscribe` stops the ticks.
pub struct ClockHandle {
    task: Option<JoinHandle<()>>,
}

impl ClockHandle {
    pub fn detached() -> Self {
        ClockHandle { task: None }
    }

    pub fn from_task(task: JoinHandle<()>) -> Self {
        ClockHandle { task: Some(task) }
    }

    pub fn unsubscribe(mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for ClockHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Wall-clock implementation firing on every full hour since `min_timestamp`.
pub struct HourlyClock {
    min_timestamp: UnixTime,
    /// How often the boundary check wakes up. An hour is the production value;
    /// tests shrink it so the loop stays responsive.
    poll_interval: Duration,
}

impl HourlyClock {
    pub fn new(min_timestamp: UnixTime) -> Self {
        Self {
            min_timestamp: min_timestamp.to_start_of_hour(),
            poll_interval: Duration::from_secs(10),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

impl Clock for HourlyClock {
    fn on_every_hour(&self, callback: TickCallback) -> ClockHandle {
        let min = self.min_timestamp;
        let poll = self.poll_interval;
        let task = tokio::spawn(async move {
            let callback = Arc::new(callback);

            // Replay history oldest-first so that front-insertion downstream
            // resolves the newest hours first.
            let mut last_fired = min.add_hours(-1);
            let now = UnixTime::now().to_start_of_hour();
            let mut ts = min;
            while ts <= now {
                callback(ts);
                last_fired = ts;
                ts = ts.add_hours(1);
            }
            debug!("Clock replayed hours {} through {}", min, last_fired);

            loop {
                let now = UnixTime::now();
                let next = last_fired.add_hours(1);
                if now.as_secs() >= next.as_secs() {
                    // Catch up if the process slept across more than one boundary.
                    let mut ts = next;
                    let current = now.to_start_of_hour();
                    while ts <= current {
                        callback(ts);
                        last_fired = ts;
                        ts = ts.add_hours(1);
                    }
                }
                let wait = (next.as_secs() - now.as_secs()).clamp(1, HOUR);
                tokio::time::sleep(poll.min(Duration::from_secs(wait as u64))).await;
            }
        });
        ClockHandle::from_task(task)
    }
}

pub mod test_support {
    use super::*;

    /// Deterministic clock for tests: fires the configured timestamps
    /// synchronously on subscribe.
    pub struct ManualClock {
        pub ticks: Vec<UnixTime>,
    }

    impl Clock for ManualClock {
        fn on_every_hour(&self, callback: TickCallback) -> ClockHandle {
            for ts in &self.ticks {
                callback(*ts);
            }
            ClockHandle::detached()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[tokio::test]
    async fn test_replays_history_oldest_first() {
        let now = UnixTime::now().to_start_of_hour();
        let min = now.add_hours(-3);
        let clock = HourlyClock::new(min);

        let seen: Arc<Mutex<Vec<UnixTime>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_cb = Arc::clone(&seen);
        let handle = clock.on_every_hour(Box::new(move |ts| {
            seen_cb.lock().unwrap().push(ts);
        }));

        // Replay happens at subscription, a short wait is enough.
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.unsubscribe();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 4);
        assert_eq!(seen[0], min);
        assert_eq!(*seen.last().unwrap(), now);
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
    }
}
