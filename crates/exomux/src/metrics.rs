//! Periodic per-host gauges.

use std::sync::Arc;
use std::sync::Weak;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::warn;

use crate::error::Result;
use crate::host::HostStats;
use crate::pool::PoolInner;

/// Receives host gauges from a pool. Failures are logged and otherwise ignored.
#[async_trait::async_trait]
pub trait MetricsSink: Send + Sync + 'static {
    async fn report(&self, stats: &HostStats) -> Result<()>;
}

/// Emits gauges as `tracing` events.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

#[async_trait::async_trait]
impl MetricsSink for TracingSink {
    async fn report(&self, stats: &HostStats) -> Result<()> {
        debug!(
            host = %stats.key,
            conns = stats.conns,
            active_conns = stats.active_conns,
            streams = stats.streams,
            "pool gauges"
        );
        Ok(())
    }
}

/// Reports every host's stats each `interval` until the pool goes away.
pub(crate) async fn report_loop(
    pool: Weak<PoolInner>,
    sink: Arc<dyn MetricsSink>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let Some(pool) = pool.upgrade() else {
            return;
        };
        let stats = pool.host_stats();
        drop(pool);

        for host in &stats {
            if let Err(err) = sink.report(host).await {
                warn!(host = %host.key, error = %err, "failed to emit pool gauges");
            }
        }
    }
}
