//! Abstract time source used by every time-dependent component.
//!
//! Nothing in the control plane reads `Utc::now()` or `tokio::time::sleep`
//! directly. Every loop and every bookkeeping struct is handed a `Clock`,
//! so tests can drive the virtual clock forward instead of sleeping on
//! wall time.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::mpsc;

/// `now()` plus a ticker factory. A real and a fake implementation both
/// satisfy this contract.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now(&self) -> DateTime<Utc>;

    /// Produce a ticker that fires roughly every `interval`.
    fn new_ticker(&self, interval: StdDuration) -> Ticker;
}

/// A channel-like receive source for periodic ticks, with `stop`.
pub struct Ticker {
    rx: mpsc::UnboundedReceiver<DateTime<Utc>>,
    stop: Arc<std::sync::atomic::AtomicBool>,
    _task: Option<tokio::task::JoinHandle<()>>,
}

impl Ticker {
    /// Wait for the next tick. Returns `None` once the ticker has been
    /// stopped and drained.
    pub async fn tick(&mut self) -> Option<DateTime<Utc>> {
        self.rx.recv().await
    }

    pub fn stop(&mut self) {
        self.stop.store(true, std::sync::atomic::Ordering::SeqCst);
        if let Some(task) = self._task.take() {
            task.abort();
        }
    }
}

// ─── SystemClock ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn new_ticker(&self, interval: StdDuration) -> Ticker {
        let (tx, rx) = mpsc::unbounded_channel();
        let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let stop_for_task = stop.clone();
        let task = tokio::spawn(async move {
            let mut interval_timer = tokio::time::interval(interval);
            interval_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval_timer.tick().await;
                if stop_for_task.load(std::sync::atomic::Ordering::SeqCst) {
                    break;
                }
                if tx.send(Utc::now()).is_err() {
                    break;
                }
            }
        });
        Ticker {
            rx,
            stop,
            _task: Some(task),
        }
    }
}

// ─── FakeClock ──────────────────────────────────────────────────────────────

struct FakeTickerState {
    interval: chrono::Duration,
    next_fire: DateTime<Utc>,
    tx: mpsc::UnboundedSender<DateTime<Utc>>,
}

struct FakeClockInner {
    now: DateTime<Utc>,
    tickers: Vec<FakeTickerState>,
}

/// A clock that only advances on explicit request. `advance` fires every
/// ticker whose next virtual moment falls within the advanced window,
/// possibly more than once, enabling deterministic evaluation-loop tests.
#[derive(Clone)]
pub struct FakeClock {
    inner: Arc<Mutex<FakeClockInner>>,
}

impl std::fmt::Debug for FakeClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakeClock")
            .field("now", &self.inner.lock().now)
            .finish()
    }
}

impl FakeClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(FakeClockInner {
                now: start,
                tickers: Vec::new(),
            })),
        }
    }

    /// Advance the virtual clock and fire any due tickers along the way.
    pub fn advance(&self, by: StdDuration) {
        let delta = chrono::Duration::from_std(by).expect("duration fits in chrono::Duration");
        let mut inner = self.inner.lock();
        let target = inner.now + delta;
        for ticker in &mut inner.tickers {
            while ticker.next_fire <= target {
                if ticker.tx.send(ticker.next_fire).is_err() {
                    break;
                }
                ticker.next_fire += ticker.interval;
            }
        }
        inner.now = target;
    }
}

impl Clock for FakeClock {
    fn now(&self) -> DateTime<Utc> {
        self.inner.lock().now
    }

    fn new_ticker(&self, interval: StdDuration) -> Ticker {
        let (tx, rx) = mpsc::unbounded_channel();
        let chrono_interval =
            chrono::Duration::from_std(interval).expect("duration fits in chrono::Duration");
        let mut inner = self.inner.lock();
        let next_fire = inner.now + chrono_interval;
        inner.tickers.push(FakeTickerState {
            interval: chrono_interval,
            next_fire,
            tx,
        });
        Ticker {
            rx,
            stop: Arc::new(std::sync::atomic::AtomicBool::new(false)),
            _task: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fake_clock_now_starts_at_given_instant() {
        let start = Utc::now();
        let clock = FakeClock::new(start);
        assert_eq!(clock.now(), start);
    }

    #[test]
    fn fake_clock_advance_moves_now_forward() {
        let start = Utc::now();
        let clock = FakeClock::new(start);
        clock.advance(StdDuration::from_secs(30));
        assert_eq!(clock.now(), start + chrono::Duration::seconds(30));
    }

    #[tokio::test]
    async fn fake_ticker_fires_once_per_interval_crossed() {
        let clock = FakeClock::new(Utc::now());
        let mut ticker = clock.new_ticker(StdDuration::from_secs(10));

        clock.advance(StdDuration::from_secs(10));
        let first = ticker.tick().await;
        assert!(first.is_some());

        // No further tick queued yet.
        assert!(ticker.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn fake_ticker_fires_multiple_times_when_advanced_past_several_intervals() {
        let clock = FakeClock::new(Utc::now());
        let mut ticker = clock.new_ticker(StdDuration::from_secs(10));

        clock.advance(StdDuration::from_secs(35));

        let mut count = 0;
        while ticker.rx.try_recv().is_ok() {
            count += 1;
        }
        assert_eq!(count, 3);
        let _ = &mut ticker;
    }

    #[tokio::test]
    async fn fake_ticker_stop_aborts_nothing_but_marks_stopped() {
        let clock = FakeClock::new(Utc::now());
        let mut ticker = clock.new_ticker(StdDuration::from_secs(5));
        ticker.stop();
        assert!(ticker.stop.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn system_clock_now_is_close_to_wall_clock() {
        let clock = SystemClock;
        let before = Utc::now();
        let observed = clock.now();
        let after = Utc::now();
        assert!(observed >= before && observed <= after);
    }
}
