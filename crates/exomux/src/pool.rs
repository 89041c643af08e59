//! # Pool Registry
//!
//! The public entry point. Maps `(network, address)` to a `Host` and hands
//! out virtual streams multiplexed over the host's physical connections.
//!
//! Uses DashMap for the host map so lookups for different destinations never
//! contend on a global lock; no lock is held across more than one host.

use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Duration;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::builder::PoolBuilder;
use crate::config::PoolConfig;
use crate::context::Context;
use crate::error::Error;
use crate::error::Result;
use crate::frame::FrameParserBuilder;
use crate::host::Host;
use crate::host::HostStats;
use crate::host::host_key;
use crate::metrics;
use crate::metrics::MetricsSink;
use crate::stream::VirtualStream;
use crate::transport::Dialer;
use crate::transport::Network;
use crate::transport::TlsOptions;

/// Per-call options of `Pool::get_virtual_conn`.
#[derive(Clone, Default)]
pub struct GetOptions {
    /// Required: how inbound bytes are split into frames.
    pub frame_parser: Option<Arc<dyn FrameParserBuilder>>,
    /// Identifier of the new stream; unique per physical connection.
    pub stream_id: u32,
    /// Local address to bind when a new connection is dialed.
    pub local_addr: Option<String>,
    pub tls: Option<TlsOptions>,
    /// Overrides `PoolConfig::dial_timeout` for a dial this call triggers.
    pub dial_timeout: Option<Duration>,
}

impl GetOptions {
    pub fn new(frame_parser: impl FrameParserBuilder, stream_id: u32) -> Self {
        Self {
            frame_parser: Some(Arc::new(frame_parser)),
            stream_id,
            ..Self::default()
        }
    }

    pub fn with_stream_id(mut self, stream_id: u32) -> Self {
        self.stream_id = stream_id;
        self
    }

    pub fn with_local_addr(mut self, local_addr: impl Into<String>) -> Self {
        self.local_addr = Some(local_addr.into());
        self
    }

    pub fn with_tls(mut self, tls: TlsOptions) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = Some(timeout);
        self
    }
}

pub(crate) struct PoolInner {
    hosts: DashMap<String, Arc<Host>>,
    config: Arc<PoolConfig>,
    dialer: Arc<dyn Dialer>,
    shutdown: CancellationToken,
}

impl PoolInner {
    /// Returns the host for a destination, creating it on first use.
    fn host(self: &Arc<Self>, network: Network, address: &str) -> Arc<Host> {
        self.hosts
            .entry(host_key(network, address))
            .or_insert_with(|| {
                debug!(network = %network, address, "creating host");
                Arc::new(Host::new(
                    network,
                    address,
                    Arc::downgrade(self),
                    self.config.clone(),
                    self.dialer.clone(),
                    self.shutdown.child_token(),
                ))
            })
            .clone()
    }

    /// Removes `host` unless a newer host has already taken its key.
    pub(crate) fn remove_host(&self, host: &Host) {
        let removed = self
            .hosts
            .remove_if(host.key(), |_, current| std::ptr::eq(Arc::as_ptr(current), host));
        if removed.is_some() {
            debug!(host = %host.key(), "host removed");
        }
    }

    pub(crate) fn host_stats(&self) -> Vec<HostStats> {
        // Collected first so no map shard is held while a host gate is taken.
        let hosts: Vec<Arc<Host>> = self.hosts.iter().map(|entry| entry.value().clone()).collect();
        hosts.iter().map(|host| host.stats()).collect()
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// A multiplexed connection pool. Cheap to clone; clones share the pool.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl Pool {
    /// Creates a pool that dials plain TCP/UDP/Unix sockets.
    pub fn new(config: PoolConfig) -> Self {
        PoolBuilder::new().config(config).build()
    }

    pub fn with_dialer(config: PoolConfig, dialer: Arc<dyn Dialer>) -> Self {
        PoolBuilder::new().config(config).dialer(dialer).build()
    }

    pub fn builder() -> PoolBuilder {
        PoolBuilder::new()
    }

    pub(crate) fn from_parts(config: PoolConfig, dialer: Arc<dyn Dialer>, sink: Arc<dyn MetricsSink>) -> Self {
        let interval = config.metrics_interval;
        let inner = Arc::new(PoolInner {
            hosts: DashMap::new(),
            config: Arc::new(config),
            dialer,
            shutdown: CancellationToken::new(),
        });

        if let Some(interval) = interval {
            tokio::spawn(metrics::report_loop(
                Arc::downgrade(&inner),
                sink,
                interval,
                inner.shutdown.clone(),
            ));
        }

        Self { inner }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Returns a new virtual stream to `(network, address)`.
    ///
    /// Reuses a physical connection with spare capacity, or dials a new one,
    /// joining a dial already in flight for the same destination. Waiting
    /// observes `ctx`; a canceled wait leaves no stream registered behind.
    pub async fn get_virtual_conn(
        &self,
        ctx: &Context,
        network: &str,
        address: &str,
        opts: GetOptions,
    ) -> Result<VirtualStream> {
        let Some(parser) = opts.frame_parser.clone() else {
            return Err(Error::FrameParserMissing);
        };
        let network = Network::parse(network)?;

        loop {
            if self.inner.shutdown.is_cancelled() {
                return Err(Error::ConnClosed);
            }
            if let Some(err) = ctx.err() {
                return Err(err);
            }

            let host = self.inner.host(network, address);
            match host.get_stream(ctx, &opts, &parser).await {
                // The host was torn down under us; resolve a fresh one.
                Err(Error::ConnClosed) if !host.is_open() => {
                    self.inner.remove_host(&host);
                    continue;
                }
                Err(err) => {
                    host.retire_if_empty();
                    return Err(err);
                }
                Ok(stream) => return Ok(stream),
            }
        }
    }

    pub fn contains_host(&self, network: &str, address: &str) -> bool {
        match Network::parse(network) {
            Ok(network) => self.inner.hosts.contains_key(&host_key(network, address)),
            Err(_) => false,
        }
    }

    /// Gauge snapshot of every host.
    pub fn host_stats(&self) -> Vec<HostStats> {
        self.inner.host_stats()
    }

    /// Closes every connection. Later calls to `get_virtual_conn` fail with
    /// `ConnClosed`.
    pub fn close(&self) {
        self.inner.shutdown.cancel();
        let hosts: Vec<Arc<Host>> = self.inner.hosts.iter().map(|entry| entry.value().clone()).collect();
        for host in hosts {
            host.close();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }
}

/// A process-wide pool with the default configuration.
///
/// Meant for the outermost wiring of an application; libraries should accept
/// a `Pool` from their caller instead.
pub fn default_pool() -> &'static Pool {
    static DEFAULT: OnceLock<Pool> = OnceLock::new();
    DEFAULT.get_or_init(|| Pool::new(PoolConfig::default()))
}
