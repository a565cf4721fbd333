//! Host CPU load from `/proc/stat`.
//!
//! The sampler reads the aggregate `cpu` line every interval and publishes
//! the busy share of the elapsed jiffies, 0–100, on a watch channel. Hosts
//! without `/proc/stat` publish 0.

use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const PROC_STAT: &str = "/proc/stat";

/// Cumulative jiffies from the aggregate `cpu` line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuTimes {
    pub busy: u64,
    pub total: u64,
}

impl CpuTimes {
    /// Parse the `cpu ` line of `/proc/stat`.
    pub fn parse(stat: &str) -> Option<Self> {
        let line = stat.lines().find(|l| l.starts_with("cpu "))?;
        let fields: Vec<u64> = line
            .split_whitespace()
            .skip(1)
            .take(8)
            .map(str::parse)
            .collect::<Result<_, _>>()
            .ok()?;
        if fields.len() < 4 {
            return None;
        }
        // user nice system idle iowait irq softirq steal
        let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
        let total: u64 = fields.iter().sum();
        Some(Self {
            busy: total.saturating_sub(idle),
            total,
        })
    }
}

/// Busy percentage between two samples.
pub fn usage_between(prev: CpuTimes, next: CpuTimes) -> f64 {
    let total = next.total.saturating_sub(prev.total);
    if total == 0 {
        return 0.0;
    }
    let busy = next.busy.saturating_sub(prev.busy);
    (busy as f64 / total as f64 * 100.0).clamp(0.0, 100.0)
}

async fn read_times() -> Option<CpuTimes> {
    let stat = tokio::fs::read_to_string(PROC_STAT).await.ok()?;
    CpuTimes::parse(&stat)
}

/// Start sampling; the receiver holds the latest reading.
pub fn spawn_sampler(interval: Duration, shutdown: CancellationToken) -> watch::Receiver<f64> {
    let (tx, rx) = watch::channel(0.0);

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut prev = read_times().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let next = read_times().await;
                    let usage = match (prev, next) {
                        (Some(p), Some(n)) => usage_between(p, n),
                        _ => 0.0,
                    };
                    prev = next;
                    debug!(usage, "cpu sample");
                    if tx.send(usage).is_err() {
                        break;
                    }
                }
            }
        }
    });

    rx
}
