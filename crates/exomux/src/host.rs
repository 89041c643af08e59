//! # Host
//!
//! All physical connections to one `(network, address)`. A host reuses
//! connections with spare capacity, collapses concurrent demand for a new
//! connection into a single dial, closes idle connections beyond its limit,
//! and removes itself from the pool when its last connection goes away.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::Weak;

use futures::FutureExt;
use futures::future::BoxFuture;
use futures::future::Shared;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::PoolConfig;
use crate::connection::ConnSettings;
use crate::connection::ConnState;
use crate::connection::Connection;
use crate::context::Context;
use crate::error::Error;
use crate::error::Result;
use crate::frame::FrameParserBuilder;
use crate::gate::Gate;
use crate::pool::GetOptions;
use crate::pool::PoolInner;
use crate::stream::VirtualStream;
use crate::transport::DialOptions;
use crate::transport::Dialer;
use crate::transport::Network;

type SharedDial = Shared<BoxFuture<'static, Result<Arc<Connection>>>>;

/// What a caller that found no room on any connection should do next.
enum DialPlan {
    /// Await this dial, shared with every other caller.
    Join(SharedDial),
    /// Wait for capacity: the host is at its limit, or a connection is
    /// re-dialing and may come back.
    Wait,
    /// The destination refused the latest dial; fail with its error.
    Unreachable(Error),
}

/// Gauge snapshot of one host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostStats {
    pub key: String,
    pub network: Network,
    pub address: String,
    /// Physical connections in any state but closed.
    pub conns: usize,
    pub active_conns: usize,
    pub streams: usize,
}

pub(crate) struct Host {
    key: String,
    network: Network,
    address: String,
    pool: Weak<PoolInner>,
    config: Arc<PoolConfig>,
    dialer: Arc<dyn Dialer>,
    conns: Gate<Vec<Arc<Connection>>>,
    /// The in-flight dial, shared by every caller waiting for a new connection.
    dialing: Mutex<Option<SharedDial>>,
    /// Woken whenever a connection may have gained room for a stream or
    /// finished a dial attempt.
    capacity: Notify,
    shutdown: CancellationToken,
}

impl Host {
    pub(crate) fn new(
        network: Network,
        address: &str,
        pool: Weak<PoolInner>,
        config: Arc<PoolConfig>,
        dialer: Arc<dyn Dialer>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            key: host_key(network, address),
            network,
            address: address.to_string(),
            pool,
            config,
            dialer,
            conns: Gate::new(Vec::new()),
            dialing: Mutex::new(None),
            capacity: Notify::new(),
            shutdown,
        }
    }

    pub(crate) fn key(&self) -> &str {
        &self.key
    }

    pub(crate) fn is_open(&self) -> bool {
        self.conns.is_open()
    }

    pub(crate) fn notify_capacity(&self) {
        self.capacity.notify_waiters();
    }

    /// Returns a stream on a connection with spare capacity, dialing a new
    /// connection when none has room.
    pub(crate) async fn get_stream(
        self: &Arc<Self>,
        ctx: &Context,
        opts: &GetOptions,
        parser: &Arc<dyn FrameParserBuilder>,
    ) -> Result<VirtualStream> {
        loop {
            if let Some(stream) = self.scan(ctx, opts.stream_id)? {
                return Ok(stream);
            }

            // Registered before the re-scan so a release in between is not missed.
            let capacity = self.capacity.notified();
            tokio::pin!(capacity);
            capacity.as_mut().enable();

            let dial = {
                let Some(mut conns) = self.conns.write() else {
                    return Err(Error::ConnClosed);
                };
                if let Some(stream) = register_any(&conns, ctx, opts.stream_id)? {
                    return Ok(stream);
                }
                self.singleflight_dial(&mut conns, opts, parser)
            };

            match dial {
                DialPlan::Join(dial) => {
                    let conn = ctx.run(dial).await??;
                    match conn.try_register(ctx, opts.stream_id) {
                        Ok(Some(stream)) => return Ok(stream),
                        // Saturated by a concurrent burst, or already gone.
                        Ok(None) | Err(Error::ConnClosed) => continue,
                        Err(err) => return Err(err),
                    }
                }
                DialPlan::Wait => {
                    debug!(host = %self.key, "no connection available, waiting for capacity");
                    ctx.run(capacity).await?;
                }
                DialPlan::Unreachable(err) => return Err(err),
            }
        }
    }

    /// Read-gated pass over existing connections.
    fn scan(&self, ctx: &Context, id: u32) -> Result<Option<VirtualStream>> {
        let Some(conns) = self.conns.read() else {
            return Err(Error::ConnClosed);
        };
        register_any(&conns, ctx, id)
    }

    /// Joins the in-flight dial, or starts one if the host has room for
    /// another connection.
    ///
    /// Never dials while another connection is re-dialing the same
    /// destination: callers either wait for it or, if its latest dial
    /// failed, fail with that error.
    fn singleflight_dial(
        self: &Arc<Self>,
        conns: &mut Vec<Arc<Connection>>,
        opts: &GetOptions,
        parser: &Arc<dyn FrameParserBuilder>,
    ) -> DialPlan {
        let mut dialing = self.dialing.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(dial) = dialing.as_ref() {
            return DialPlan::Join(dial.clone());
        }

        let mut redialing = false;
        for conn in conns.iter() {
            if matches!(conn.state(), ConnState::Dialing | ConnState::Reconnecting) {
                if let Some(err) = conn.dial_error() {
                    return DialPlan::Unreachable(err);
                }
                redialing = true;
            }
        }
        if redialing || self.config.conn_limit_reached(conns.len()) {
            return DialPlan::Wait;
        }

        let settings = ConnSettings {
            dial: DialOptions {
                network: self.network,
                address: self.address.clone(),
                local_addr: opts.local_addr.clone(),
                timeout: opts.dial_timeout.unwrap_or(self.config.dial_timeout),
                tls: opts.tls.clone(),
            },
            dialer: self.dialer.clone(),
            parser: parser.clone(),
            config: self.config.clone(),
            shutdown: self.shutdown.child_token(),
        };
        let (conn, ready) = Connection::spawn(self, settings);
        conns.push(conn.clone());
        debug!(host = %self.key, conn = conn.id(), conns = conns.len(), "dialing new connection");

        // The dial runs on its own task so waiters giving up do not abandon it.
        let host = self.clone();
        let task = tokio::spawn(async move {
            let outcome = match ready.await {
                Ok(Ok(())) => Ok(conn),
                Ok(Err(err)) => Err(err),
                Err(_) => Err(Error::ConnClosed),
            };
            host.dialing.lock().unwrap_or_else(PoisonError::into_inner).take();
            outcome
        });
        let dial = async move {
            task.await.unwrap_or_else(|join| Err(Error::Dial(format!("dial task failed: {}", join))))
        }
        .boxed()
        .shared();

        *dialing = Some(dial.clone());
        DialPlan::Join(dial)
    }

    /// Removes a closed connection. Removing the last one tears the host
    /// down, and is reported by returning `true`.
    pub(crate) fn delete_conn(&self, conn: &Connection) -> bool {
        let last = {
            let Some(mut conns) = self.conns.write() else {
                return false;
            };
            conns.retain(|c| c.id() != conn.id());
            if conns.is_empty() {
                drop(conns.close());
                true
            } else {
                false
            }
        };
        self.notify_capacity();

        if last {
            debug!(host = %self.key, "last connection gone, removing host");
            if let Some(pool) = self.pool.upgrade() {
                pool.remove_host(self);
            }
        }
        last
    }

    /// Called when `conn` has just released its last stream.
    pub(crate) fn on_idle(&self, conn: &Connection) {
        let idle = match self.conns.read() {
            Some(conns) => conns.iter().filter(|c| c.is_idle()).count(),
            None => return,
        };
        if idle > self.config.max_idle_conns_per_host && conn.close_if_idle() {
            debug!(host = %self.key, conn = conn.id(), idle, "closing excess idle connection");
        }
    }

    /// Closes every connection; the host disappears once they are all gone.
    pub(crate) fn close(&self) {
        let conns = match self.conns.read() {
            Some(conns) => conns.clone(),
            None => return,
        };
        for conn in conns {
            conn.close();
        }
        self.retire_if_empty();
    }

    /// Tears the host down if it holds no connection at all, e.g. when the
    /// caller that created it gave up before dialing.
    pub(crate) fn retire_if_empty(&self) {
        let empty = match self.conns.write() {
            Some(conns) if conns.is_empty() => {
                drop(conns.close());
                true
            }
            _ => false,
        };
        if empty {
            if let Some(pool) = self.pool.upgrade() {
                pool.remove_host(self);
            }
        }
    }

    pub(crate) fn stats(&self) -> HostStats {
        let (conns, active_conns, streams) = match self.conns.read() {
            Some(conns) => {
                let live: Vec<_> = conns.iter().filter(|c| c.state() != ConnState::Closed).collect();
                let active = live.iter().filter(|c| c.state() == ConnState::Active).count();
                let streams = live.iter().map(|c| c.stream_count()).sum();
                (live.len(), active, streams)
            }
            None => (0, 0, 0),
        };
        HostStats {
            key: self.key.clone(),
            network: self.network,
            address: self.address.clone(),
            conns,
            active_conns,
            streams,
        }
    }
}

pub(crate) fn host_key(network: Network, address: &str) -> String {
    format!("{}_{}", network, address)
}

/// Tries each connection in order until one admits the stream.
fn register_any(conns: &[Arc<Connection>], ctx: &Context, id: u32) -> Result<Option<VirtualStream>> {
    for conn in conns {
        match conn.try_register(ctx, id) {
            Ok(Some(stream)) => return Ok(Some(stream)),
            Ok(None) | Err(Error::ConnClosed) => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(None)
}
