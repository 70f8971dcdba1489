// The elastic heartbeat: periodic work driven by an activity-adaptive
// interval. Activity resets to the base cadence, idleness doubles it up
// to the cap, and any ingest preempts the backoff.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::warn;

use refinery_common::Config;

use crate::coordinator::Coordinator;

pub const SETTING_NEXT_INTERVAL: &str = "next_interval_ms";
pub const SETTING_LAST_DIGEST: &str = "last_digest_at";
pub const SETTING_LAST_JANITOR: &str = "last_janitor_at";

/// Digest synthesis and janitor cadence.
pub const MAINTENANCE_CADENCE_MS: i64 = 12 * 60 * 60 * 1000;
/// InternalLog retention.
pub const LOG_RETENTION_DAYS: i64 = 7;
/// Feed channels are polled when last_polled_at is older than this.
pub const FEED_STALENESS_MINUTES: i64 = 15;
/// Follow-up delay when a pass left items pending.
pub const PENDING_FOLLOWUP_MS: i64 = 2_000;

/// Cross-task wake signal. An ingest tickles this to pull the next tick
/// forward; the permit is retained if nobody is waiting yet.
#[derive(Clone, Default)]
pub struct WakeHandle(Arc<Notify>);

impl WakeHandle {
    pub fn new() -> Self {
        Self(Arc::new(Notify::new()))
    }

    pub fn wake(&self) {
        self.0.notify_one();
    }

    pub async fn notified(&self) {
        self.0.notified().await;
    }
}

/// What one tick reports back to the driving loop.
#[derive(Debug, Clone, Copy)]
pub struct TickOutcome {
    pub active: bool,
    /// Persisted interval until the next scheduled tick.
    pub next_interval_ms: i64,
    /// The analyzer left work behind; follow up sooner.
    pub pending_remaining: bool,
}

/// The interval discipline: `BASE` after activity, doubling to `MAX`
/// while idle.
pub fn next_interval_ms(previous_ms: i64, active: bool, config: &Config) -> i64 {
    if active {
        config.base_heartbeat_ms
    } else {
        previous_ms
            .max(config.min_heartbeat_ms)
            .saturating_mul(2)
            .min(config.max_heartbeat_ms)
    }
}

/// Drive ticks until shutdown. Sleeps the persisted interval, wakes
/// early on a tickle (then ticks within the minimum interval), and
/// follows up fast while the analyzer has a backlog.
pub async fn run_loop(
    coordinator: Arc<Coordinator>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let config = coordinator.config().clone();
    let mut delay_ms = coordinator.initial_interval_ms().await;

    loop {
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(delay_ms.max(0) as u64)) => {
                delay_ms = match coordinator.on_heartbeat().await {
                    Ok(outcome) if outcome.pending_remaining => PENDING_FOLLOWUP_MS,
                    Ok(outcome) => outcome.next_interval_ms,
                    Err(e) => {
                        warn!(error = %e, "Heartbeat tick failed");
                        config.base_heartbeat_ms
                    }
                };
            }
            _ = coordinator.wake().notified() => {
                // Preempted by an ingest: tick soon.
                delay_ms = config.min_heartbeat_ms;
            }
            _ = shutdown.changed() => break,
        }
    }
}
