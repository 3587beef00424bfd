//! Cancellable timers driving the proof loop.

use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

/// Source of proof-loop ticks.
#[async_trait]
pub trait Ticker: Send {
    /// Wait for the next tick.
    async fn tick(&mut self);
}

/// Ticks once per period, starting one period from now.
pub struct IntervalTicker {
    interval: Interval,
}

impl IntervalTicker {
    /// Create a ticker with the given period.
    #[must_use]
    pub fn new(period: Duration) -> Self {
        let period = period.max(Duration::from_millis(1));
        let mut interval = interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self { interval }
    }

    /// The tick period.
    #[must_use]
    pub fn period(&self) -> Duration {
        self.interval.period()
    }
}

#[async_trait]
impl Ticker for IntervalTicker {
    async fn tick(&mut self) {
        self.interval.tick().await;
    }
}

/// Ticks only when its [`ManualTickHandle`] says so.
pub struct ManualTicker {
    rx: mpsc::UnboundedReceiver<()>,
}

/// Fires ticks on a [`ManualTicker`].
#[derive(Clone)]
pub struct ManualTickHandle {
    tx: mpsc::UnboundedSender<()>,
}

/// Create a manually driven ticker.
#[must_use]
pub fn manual_ticker() -> (ManualTicker, ManualTickHandle) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ManualTicker { rx }, ManualTickHandle { tx })
}

impl ManualTickHandle {
    /// Fire one tick. Returns false if the ticker is gone.
    pub fn tick(&self) -> bool {
        self.tx.send(()).is_ok()
    }
}

#[async_trait]
impl Ticker for ManualTicker {
    async fn tick(&mut self) {
        if self.rx.recv().await.is_none() {
            // Handle dropped: never tick again, only a stop request ends the loop.
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_interval_ticker_skips_immediate_tick() {
        let mut ticker = IntervalTicker::new(Duration::from_secs(10));
        let start = Instant::now();
        ticker.tick().await;
        assert_eq!(start.elapsed(), Duration::from_secs(10));
        ticker.tick().await;
        assert_eq!(start.elapsed(), Duration::from_secs(20));
    }

    #[tokio::test]
    async fn test_manual_ticker() {
        let (mut ticker, handle) = manual_ticker();
        assert!(handle.tick());
        assert!(handle.tick());
        ticker.tick().await;
        ticker.tick().await;

        drop(ticker);
        assert!(!handle.tick());
    }
}
