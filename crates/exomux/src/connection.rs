//! # Physical Connection with Async Pump
//!
//! A `Connection` owns one physical transport and a registry of the virtual
//! streams multiplexed over it. A supervisor task dials the transport, runs
//! the read loop that demultiplexes inbound frames to streams by identifier,
//! and re-dials with bounded, linear backoff when the transport fails.
//!
//! ## Lifecycle
//!
//! `Dialing -> Active -> (Reconnecting -> Active)* -> Closed`
//!
//! Streams are admitted only while `Active`. Every transport failure fails
//! all admitted streams with its cause; `Closed` is permanent and removes the
//! connection from its host.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::RwLock;
use std::sync::Weak;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use bytes::Bytes;
use bytes::BytesMut;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::trace;
use tracing::warn;

use crate::config::PoolConfig;
use crate::context::Context;
use crate::error::Error;
use crate::error::Result;
use crate::frame::Frame;
use crate::frame::FrameParserBuilder;
use crate::gate::Gate;
use crate::host::Host;
use crate::registry::ShardedRegistry;
use crate::stream::StreamSlot;
use crate::stream::VirtualStream;
use crate::transport::DialOptions;
use crate::transport::Dialer;
use crate::transport::Transport;
use crate::transport::TransportKind;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnState {
    Dialing = 0,
    Active = 1,
    Reconnecting = 2,
    Closed = 3,
}

impl ConnState {
    fn from_u8(state: u8) -> Self {
        match state {
            0 => Self::Dialing,
            1 => Self::Active,
            2 => Self::Reconnecting,
            _ => Self::Closed,
        }
    }
}

/// A queued outbound frame, tagged with the session it was written in.
struct Outbound {
    generation: u64,
    frame: Bytes,
}

/// Everything a connection needs that outlives any single session.
pub(crate) struct ConnSettings {
    pub(crate) dial: DialOptions,
    pub(crate) dialer: Arc<dyn Dialer>,
    pub(crate) parser: Arc<dyn FrameParserBuilder>,
    pub(crate) config: Arc<PoolConfig>,
    pub(crate) shutdown: CancellationToken,
}

pub(crate) struct Connection {
    id: u64,
    host: Weak<Host>,
    settings: ConnSettings,
    streams: Gate<ShardedRegistry<Arc<StreamSlot>>>,
    /// Admitted streams; may briefly run ahead of the registry length.
    admitted: AtomicUsize,
    state: AtomicU8,
    generation: AtomicU64,
    transport: RwLock<Option<Arc<dyn Transport>>>,
    /// Why the latest dial failed; cleared by the next successful one.
    dial_error: Mutex<Option<Error>>,
    outbound: mpsc::Sender<Outbound>,
    outbound_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Outbound>>>,
    faults: mpsc::UnboundedSender<(u64, Error)>,
}

impl Connection {
    /// Creates a connection and spawns its supervisor.
    ///
    /// The returned receiver resolves with the outcome of the first dial.
    pub(crate) fn spawn(
        host: &Arc<Host>,
        settings: ConnSettings,
    ) -> (Arc<Self>, oneshot::Receiver<Result<()>>) {
        let (outbound, outbound_rx) = mpsc::channel(settings.config.send_queue_size.max(1));
        let (faults, faults_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();

        let conn = Arc::new(Self {
            id: NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed),
            host: Arc::downgrade(host),
            settings,
            streams: Gate::new(ShardedRegistry::new()),
            admitted: AtomicUsize::new(0),
            state: AtomicU8::new(ConnState::Dialing as u8),
            generation: AtomicU64::new(0),
            transport: RwLock::new(None),
            dial_error: Mutex::new(None),
            outbound,
            outbound_rx: Arc::new(tokio::sync::Mutex::new(outbound_rx)),
            faults,
        });

        tokio::spawn(conn.clone().supervise(ready_tx, faults_rx));
        (conn, ready_rx)
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn state(&self) -> ConnState {
        ConnState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ConnState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub(crate) fn stream_count(&self) -> usize {
        self.admitted.load(Ordering::Acquire)
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.state() == ConnState::Active && self.stream_count() == 0
    }

    fn current_transport(&self) -> Option<Arc<dyn Transport>> {
        self.transport.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// The error of the latest dial if it failed and no dial has succeeded
    /// since, i.e. the destination is currently known to be unreachable.
    pub(crate) fn dial_error(&self) -> Option<Error> {
        self.dial_error.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub(crate) fn local_addr(&self) -> Option<String> {
        self.current_transport().and_then(|t| t.local_addr())
    }

    pub(crate) fn remote_addr(&self) -> Option<String> {
        self.current_transport().and_then(|t| t.remote_addr())
    }

    /// Admits stream `id` if the connection is active and has room.
    ///
    /// Returns `Ok(None)` when the connection cannot take the stream right
    /// now (full, dialing, reconnecting) and `Err(ConnClosed)` once closed.
    pub(crate) fn try_register(self: &Arc<Self>, ctx: &Context, id: u32) -> Result<Option<VirtualStream>> {
        let Some(streams) = self.streams.read() else {
            return Err(Error::ConnClosed);
        };
        match self.state() {
            ConnState::Active => {}
            ConnState::Closed => return Err(Error::ConnClosed),
            ConnState::Dialing | ConnState::Reconnecting => return Ok(None),
        }

        let limit = &self.settings.config;
        let reserved = self.admitted.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
            (!limit.stream_limit_reached(n)).then_some(n + 1)
        });
        if reserved.is_err() {
            return Ok(None);
        }

        let generation = self.generation.load(Ordering::Acquire);
        let (slot, inbound) = StreamSlot::new(id, generation, ctx.child());
        let (_, existed) = streams.load_or_store(id, slot.clone());
        if existed {
            self.admitted.fetch_sub(1, Ordering::AcqRel);
            return Err(Error::DuplicateStreamId(id));
        }
        drop(streams);

        trace!(conn = self.id, stream = id, "stream admitted");
        Ok(Some(VirtualStream::new(slot, inbound, self.clone())))
    }

    /// Deregisters a stream closed by its owner.
    pub(crate) fn remove_stream(&self, slot: &Arc<StreamSlot>) {
        let removed = match self.streams.read() {
            Some(streams) => streams.delete_if(slot.id, |s| Arc::ptr_eq(s, slot)).is_some(),
            None => false,
        };
        if !removed {
            return;
        }

        let remaining = self.admitted.fetch_sub(1, Ordering::AcqRel).saturating_sub(1);
        trace!(conn = self.id, stream = slot.id, remaining, "stream released");
        if let Some(host) = self.host.upgrade() {
            host.notify_capacity();
            if remaining == 0 {
                host.on_idle(self);
            }
        }
    }

    /// Queues or sends one frame for a stream admitted in `generation`.
    pub(crate) async fn write(&self, generation: u64, frame: Bytes) -> Result<()> {
        let Some(transport) = self.current_transport() else {
            return Err(Error::ConnClosed);
        };

        if transport.kind() == TransportKind::Datagram {
            return transport.send(&frame).await.inspect_err(|e| {
                let _ = self.faults.send((generation, e.clone()));
            });
        }

        let outbound = Outbound { generation, frame };
        if self.settings.config.drop_on_full {
            return self.outbound.try_send(outbound).map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => Error::SendQueueFull,
                mpsc::error::TrySendError::Closed(_) => Error::ConnClosed,
            });
        }
        self.outbound.send(outbound).await.map_err(|_| Error::ConnClosed)
    }

    /// Stops admitting streams and asks the supervisor to tear down.
    pub(crate) fn close(&self) {
        if let Some(_streams) = self.streams.write() {
            self.set_state(ConnState::Closed);
        }
        self.settings.shutdown.cancel();
    }

    /// Closes the connection only if it still carries no streams.
    pub(crate) fn close_if_idle(&self) -> bool {
        {
            let Some(_streams) = self.streams.write() else {
                return false;
            };
            if !self.is_idle() {
                return false;
            }
            self.set_state(ConnState::Closed);
        }
        self.settings.shutdown.cancel();
        true
    }

    fn dispatch(&self, frame: Frame) {
        let Some(streams) = self.streams.read() else {
            return;
        };
        match streams.load(frame.stream_id) {
            Some(slot) => slot.deliver(frame.payload),
            // The stream was closed locally while its response was in flight.
            None => trace!(conn = self.id, stream = frame.stream_id, "dropping frame for unknown stream"),
        }
    }

    /// Installs a freshly dialed transport and opens admission for a new session.
    fn activate(&self, transport: Arc<dyn Transport>) -> u64 {
        *self.transport.write().unwrap_or_else(PoisonError::into_inner) = Some(transport);
        self.dial_error.lock().unwrap_or_else(PoisonError::into_inner).take();
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        if let Some(_streams) = self.streams.write() {
            if self.state() != ConnState::Closed {
                self.set_state(ConnState::Active);
            }
        }
        generation
    }

    /// Fails every admitted stream with `cause` and stops admission until the
    /// next successful dial.
    fn fail_streams(&self, cause: &Error) {
        let slots = {
            let Some(streams) = self.streams.write() else {
                return;
            };
            if self.state() != ConnState::Closed {
                self.set_state(ConnState::Reconnecting);
            }
            let slots = streams.load_all();
            streams.reset();
            self.admitted.store(0, Ordering::Release);
            slots
        };
        if !slots.is_empty() {
            debug!(conn = self.id, streams = slots.len(), error = %cause, "failing streams");
        }
        for slot in slots {
            slot.fail(cause.clone());
        }
    }

    /// Permanently closes the connection and removes it from its host.
    fn teardown(&self, cause: Error) {
        let slots = match self.streams.close() {
            Some(streams) => {
                self.set_state(ConnState::Closed);
                let slots = streams.load_all();
                streams.reset();
                self.admitted.store(0, Ordering::Release);
                slots
            }
            None => Vec::new(),
        };
        for slot in slots {
            slot.fail(cause.clone());
        }
        // Releases the socket even while closed streams still hold the connection.
        self.transport.write().unwrap_or_else(PoisonError::into_inner).take();

        info!(conn = self.id, address = %self.settings.dial.address, error = %cause, "connection closed");
        if let Some(host) = self.host.upgrade() {
            host.delete_conn(self);
        }
    }

    async fn supervise(
        self: Arc<Self>,
        ready: oneshot::Sender<Result<()>>,
        mut faults: mpsc::UnboundedReceiver<(u64, Error)>,
    ) {
        let mut ready = Some(ready);
        let mut attempt: u32 = 0;
        let shutdown = self.settings.shutdown.clone();
        let config = self.settings.config.clone();

        let cause = loop {
            let dialed = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break Error::ConnClosed,
                dialed = self.settings.dialer.dial(&self.settings.dial) => dialed,
            };

            let err = match dialed {
                Ok(transport) => {
                    let generation = self.activate(transport.clone());
                    debug!(conn = self.id, address = %self.settings.dial.address, generation, "connection established");
                    if let Some(ready) = ready.take() {
                        let _ = ready.send(Ok(()));
                    }
                    if let Some(host) = self.host.upgrade() {
                        host.notify_capacity();
                    }

                    let started = Instant::now();
                    let err = self.serve(&transport, generation, &mut faults).await;
                    transport.close().await;
                    if shutdown.is_cancelled() {
                        break if err == Error::ConnClosed { err } else { Error::ConnClosed.merge(err) };
                    }
                    if started.elapsed() >= config.reconnect_reset_interval {
                        attempt = 0;
                    }
                    err
                }
                Err(err) => {
                    *self.dial_error.lock().unwrap_or_else(PoisonError::into_inner) = Some(err.clone());
                    if let Some(ready) = ready.take() {
                        let _ = ready.send(Err(err.clone()));
                    }
                    // Callers waiting on this connection re-check and fail fast.
                    if let Some(host) = self.host.upgrade() {
                        host.notify_capacity();
                    }
                    err
                }
            };

            self.fail_streams(&err);
            if err.is_configuration() {
                warn!(conn = self.id, address = %self.settings.dial.address, error = %err, "dial rejected, not retrying");
                break err;
            }
            if attempt >= config.max_reconnect_count {
                warn!(conn = self.id, address = %self.settings.dial.address, attempts = attempt, error = %err, "reconnect attempts exhausted");
                break Error::ReconnectExhausted { attempts: attempt };
            }

            attempt += 1;
            let delay = config.backoff(attempt);
            warn!(conn = self.id, address = %self.settings.dial.address, attempt, ?delay, error = %err, "connection failed, reconnecting");
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break Error::ConnClosed,
                _ = tokio::time::sleep(delay) => {}
            }
        };

        self.teardown(cause);
    }

    /// Runs one session until the transport fails or shutdown is requested.
    async fn serve(
        &self,
        transport: &Arc<dyn Transport>,
        generation: u64,
        faults: &mut mpsc::UnboundedReceiver<(u64, Error)>,
    ) -> Error {
        let mut writer: Option<JoinHandle<Error>> = match transport.kind() {
            TransportKind::Stream => Some(tokio::spawn(drain(
                self.outbound_rx.clone(),
                transport.clone(),
                generation,
            ))),
            TransportKind::Datagram => None,
        };

        let err = {
            let writer_failed = async {
                match writer.as_mut() {
                    Some(handle) => match handle.await {
                        Ok(err) => err,
                        Err(join) => Error::Io(format!("writer task failed: {}", join)),
                    },
                    None => std::future::pending().await,
                }
            };
            let write_fault = async {
                loop {
                    match faults.recv().await {
                        Some((fault_generation, err)) if fault_generation == generation => break err,
                        Some(_) => continue,
                        None => std::future::pending::<()>().await,
                    }
                }
            };

            tokio::select! {
                _ = self.settings.shutdown.cancelled() => Error::ConnClosed,
                err = self.read_loop(transport.as_ref()) => err,
                err = writer_failed => err,
                err = write_fault => err,
            }
        };

        if let Some(handle) = writer {
            handle.abort();
        }
        err
    }

    async fn read_loop(&self, transport: &dyn Transport) -> Error {
        let mut parser = self.settings.parser.build();
        let mut buf = BytesMut::with_capacity(self.settings.config.read_buffer_size);
        let datagram = transport.kind() == TransportKind::Datagram;

        loop {
            match transport.recv(&mut buf).await {
                Ok(0) if !datagram => {
                    return Error::ConnectionLost("peer closed the connection".into());
                }
                Ok(_) => {}
                Err(err) => return err,
            }

            loop {
                match parser.decode(&mut buf) {
                    Ok(Some(frame)) => self.dispatch(frame),
                    Ok(None) => break,
                    Err(err) => return err,
                }
            }

            // A datagram never continues into the next one.
            if datagram {
                buf.clear();
            }
        }
    }
}

/// Drains the outbound queue into the transport for one session.
async fn drain(
    outbound: Arc<tokio::sync::Mutex<mpsc::Receiver<Outbound>>>,
    transport: Arc<dyn Transport>,
    generation: u64,
) -> Error {
    let mut outbound = outbound.lock().await;
    while let Some(item) = outbound.recv().await {
        if item.generation != generation {
            continue;
        }
        if let Err(err) = transport.send(&item.frame).await {
            return err;
        }
    }
    Error::ConnClosed
}

/// Read-only view of a physical connection, obtained from a stream.
#[derive(Clone)]
pub struct ConnHandle {
    conn: Arc<Connection>,
}

impl ConnHandle {
    pub(crate) fn new(conn: Arc<Connection>) -> Self {
        Self { conn }
    }

    pub fn id(&self) -> u64 {
        self.conn.id()
    }

    pub fn state(&self) -> ConnState {
        self.conn.state()
    }

    pub fn is_active(&self) -> bool {
        self.conn.state() == ConnState::Active
    }

    pub fn stream_count(&self) -> usize {
        self.conn.stream_count()
    }

    /// Local address of the physical connection; `None` once it is closed.
    pub fn local_addr(&self) -> Option<String> {
        self.conn.local_addr()
    }

    pub fn remote_addr(&self) -> Option<String> {
        self.conn.remote_addr()
    }

    /// Closes the physical connection, failing every stream on it.
    pub fn close(&self) {
        self.conn.close();
    }
}

impl std::fmt::Debug for ConnHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnHandle")
            .field("id", &self.conn.id())
            .field("state", &self.conn.state())
            .field("streams", &self.conn.stream_count())
            .finish()
    }
}
