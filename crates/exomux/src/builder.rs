//! # Pool Builder
//!
//! Provides a fluent API for composing a pool from its configuration, its
//! dialer and an optional metrics sink.

use std::sync::Arc;

use crate::config::PoolConfig;
use crate::metrics::MetricsSink;
use crate::metrics::TracingSink;
use crate::pool::Pool;
use crate::transport::Dialer;
use crate::transport::NetDialer;

/// Fluent builder for creating a `Pool`.
pub struct PoolBuilder {
    config: PoolConfig,
    dialer: Arc<dyn Dialer>,
    sink: Arc<dyn MetricsSink>,
}

impl PoolBuilder {
    pub fn new() -> Self {
        Self {
            config: PoolConfig::default(),
            dialer: Arc::new(NetDialer),
            sink: Arc::new(TracingSink),
        }
    }

    pub fn config(mut self, config: PoolConfig) -> Self {
        self.config = config;
        self
    }

    /// Replaces the plain network dialer, e.g. with one that speaks TLS.
    pub fn dialer(mut self, dialer: Arc<dyn Dialer>) -> Self {
        self.dialer = dialer;
        self
    }

    /// Where host gauges go when `PoolConfig::metrics_interval` is set.
    pub fn metrics_sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Builds the pool.
    ///
    /// Must run inside a tokio runtime when a metrics interval is configured,
    /// since the reporter is spawned here.
    pub fn build(self) -> Pool {
        Pool::from_parts(self.config, self.dialer, self.sink)
    }
}

impl Default for PoolBuilder {
    fn default() -> Self {
        Self::new()
    }
}
