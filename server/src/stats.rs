//! Process-wide traffic counters.
//!
//! Updates are lock-free atomics; a background sampler derives a rolling
//! 1-second tx/rx speed from the running totals. Consumed only by the
//! observability surface (`api::get_stats`).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

pub struct GlobalStats {
    total_tx: AtomicU64,
    total_rx: AtomicU64,
    window_tx_start: AtomicU64,
    window_rx_start: AtomicU64,
    tx_speed: AtomicU64,
    rx_speed: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub total_tx: u64,
    pub total_rx: u64,
    pub tx_speed: u64,
    pub rx_speed: u64,
}

impl GlobalStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            total_tx: AtomicU64::new(0),
            total_rx: AtomicU64::new(0),
            window_tx_start: AtomicU64::new(0),
            window_rx_start: AtomicU64::new(0),
            tx_speed: AtomicU64::new(0),
            rx_speed: AtomicU64::new(0),
        })
    }

    pub fn add_tx(&self, n: u64) {
        self.total_tx.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_rx(&self, n: u64) {
        self.total_rx.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            total_tx: self.total_tx.load(Ordering::Relaxed),
            total_rx: self.total_rx.load(Ordering::Relaxed),
            tx_speed: self.tx_speed.load(Ordering::Relaxed),
            rx_speed: self.rx_speed.load(Ordering::Relaxed),
        }
    }

    /// Spawns the 1-second sampler that turns running totals into a
    /// windowed speed. Runs for the lifetime of the process.
    pub fn spawn_sampler(self: &Arc<Self>) {
        let this = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(1));
            loop {
                tick.tick().await;
                let tx = this.total_tx.load(Ordering::Relaxed);
                let rx = this.total_rx.load(Ordering::Relaxed);
                let prev_tx = this.window_tx_start.swap(tx, Ordering::Relaxed);
                let prev_rx = this.window_rx_start.swap(rx, Ordering::Relaxed);
                this.tx_speed
                    .store(tx.saturating_sub(prev_tx), Ordering::Relaxed);
                this.rx_speed
                    .store(rx.saturating_sub(prev_rx), Ordering::Relaxed);
            }
        });
    }
}
