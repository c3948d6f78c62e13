use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

use crate::config::QueueConfig;

#[derive(Debug)]
struct TimerState {
    last_work: Instant,
    interval: Duration,
}

/// Paces the poll loop: fast while there is work, backing off while idle.
#[derive(Debug)]
pub struct PollTimer {
    config: QueueConfig,
    state: Mutex<TimerState>,
    wake: Notify,
}

impl PollTimer {
    pub fn new(config: QueueConfig) -> Self {
        let interval = config.poll_interval;
        Self {
            config,
            state: Mutex::new(TimerState {
                last_work: Instant::now(),
                interval,
            }),
            wake: Notify::new(),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, TimerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The loop found (or is blocked by) work; stay at the fast interval.
    pub fn work_seen(&self) {
        self.state().last_work = Instant::now();
    }

    /// Interval before the next poll, from how long the loop has been idle.
    pub fn next_interval(&self) -> Duration {
        let mut state = self.state();
        let interval = self.config.poll_interval_after(state.last_work.elapsed());
        if interval != state.interval {
            tracing::debug!(interval = ?interval, "Poll interval changed");
        }
        state.interval = interval;
        interval
    }

    pub fn current_interval(&self) -> Duration {
        self.state().interval
    }

    pub fn is_backed_off(&self) -> bool {
        self.current_interval() != self.config.poll_interval
    }

    /// New work may exist. Drops back to fast polling and, if the loop was
    /// backed off, wakes it now.
    pub fn enqueued(&self) {
        let mut state = self.state();
        if state.interval == self.config.poll_interval {
            return;
        }
        state.last_work = Instant::now();
        state.interval = self.config.poll_interval;
        drop(state);
        self.wake.notify_one();
    }

    /// Sleep for `interval`, or less if [`enqueued`](Self::enqueued) fires.
    pub async fn wait(&self, interval: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = self.wake.notified() => {}
        }
    }
}
