//! Configuration structures for pool behavior.

use std::time::Duration;

/// Tuning knobs for a `Pool`. None of these are visible on the wire.
#[derive(Clone, Debug)]
pub struct PoolConfig {
    /// Maximum physical connections per host. Zero means unlimited.
    pub max_conns_per_host: usize,

    /// Maximum concurrent virtual streams per physical connection. Zero means unlimited.
    pub max_streams_per_conn: usize,

    /// Idle connections a host keeps before closing the excess.
    pub max_idle_conns_per_host: usize,

    /// Capacity of the outbound queue of a stream connection.
    pub send_queue_size: usize,

    /// Fail writes with `SendQueueFull` instead of waiting for room.
    pub drop_on_full: bool,

    /// Timeout for one dial attempt.
    pub dial_timeout: Duration,

    /// Backoff before the first reconnect; attempt `n` waits `n` times this.
    pub initial_backoff: Duration,

    /// Upper bound on the reconnect backoff.
    pub max_backoff: Duration,

    /// Consecutive reconnect attempts before a connection is closed for good.
    pub max_reconnect_count: u32,

    /// A session that lived at least this long resets the reconnect budget.
    pub reconnect_reset_interval: Duration,

    /// Interval of per-host gauge emission. `None` disables it.
    pub metrics_interval: Option<Duration>,

    /// Initial capacity of the read buffer of a connection.
    pub read_buffer_size: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_conns_per_host: 32,
            max_streams_per_conn: 0,
            max_idle_conns_per_host: 2,
            send_queue_size: 1024,
            drop_on_full: false,
            dial_timeout: Duration::from_secs(5),
            initial_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(50),
            max_reconnect_count: 10,
            reconnect_reset_interval: Duration::from_secs(1),
            metrics_interval: None,
            read_buffer_size: 16 * 1024,
        }
    }
}

impl PoolConfig {
    /// Short timeouts and backoffs for loopback or same-rack peers.
    pub fn local_network() -> Self {
        Self {
            dial_timeout: Duration::from_millis(500),
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(10),
            reconnect_reset_interval: Duration::from_millis(200),
            ..Self::default()
        }
    }

    pub fn with_max_conns_per_host(mut self, max: usize) -> Self {
        self.max_conns_per_host = max;
        self
    }

    pub fn with_max_streams_per_conn(mut self, max: usize) -> Self {
        self.max_streams_per_conn = max;
        self
    }

    pub fn with_max_idle_conns_per_host(mut self, max: usize) -> Self {
        self.max_idle_conns_per_host = max;
        self
    }

    pub fn with_send_queue(mut self, size: usize, drop_on_full: bool) -> Self {
        self.send_queue_size = size;
        self.drop_on_full = drop_on_full;
        self
    }

    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max;
        self
    }

    pub fn with_reconnect(mut self, max_count: u32, reset_interval: Duration) -> Self {
        self.max_reconnect_count = max_count;
        self.reconnect_reset_interval = reset_interval;
        self
    }

    pub fn with_metrics_interval(mut self, interval: Duration) -> Self {
        self.metrics_interval = Some(interval);
        self
    }

    /// Delay before reconnect attempt `attempt` (1-based).
    pub(crate) fn backoff(&self, attempt: u32) -> Duration {
        self.initial_backoff.saturating_mul(attempt).min(self.max_backoff)
    }

    pub(crate) fn stream_limit_reached(&self, streams: usize) -> bool {
        self.max_streams_per_conn != 0 && streams >= self.max_streams_per_conn
    }

    pub(crate) fn conn_limit_reached(&self, conns: usize) -> bool {
        self.max_conns_per_host != 0 && conns >= self.max_conns_per_host
    }
}
