//! # Virtual Streams
//!
//! A `VirtualStream` is the caller's end of one logical channel on a shared
//! physical connection. Its dispatch end, a `StreamSlot`, lives in the
//! connection's registry: the read loop pushes payloads into it, and a
//! failing connection records the causal error on it.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::connection::ConnHandle;
use crate::connection::Connection;
use crate::context::Context;
use crate::error::Error;
use crate::error::Result;

/// Registry entry for one stream.
pub(crate) struct StreamSlot {
    pub(crate) id: u32,
    /// Session the stream was admitted in; its frames are dropped by any other.
    pub(crate) generation: u64,
    inbound: mpsc::UnboundedSender<Bytes>,
    ctx: Context,
    terminal: Mutex<Option<Error>>,
    closed: AtomicBool,
}

impl StreamSlot {
    pub(crate) fn new(
        id: u32,
        generation: u64,
        ctx: Context,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Bytes>) {
        let (inbound, rx) = mpsc::unbounded_channel();
        let slot = Arc::new(Self {
            id,
            generation,
            inbound,
            ctx,
            terminal: Mutex::new(None),
            closed: AtomicBool::new(false),
        });
        (slot, rx)
    }

    pub(crate) fn deliver(&self, payload: Bytes) {
        // The receiver only goes away with the stream itself.
        let _ = self.inbound.send(payload);
    }

    /// Marks the stream terminated by `cause`. Only the first cause sticks.
    pub(crate) fn fail(&self, cause: Error) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.terminal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_or_insert(cause);
        self.ctx.cancel();
        true
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn terminal_error(&self) -> Option<Error> {
        self.terminal.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

/// One logical, bidirectional, message-oriented channel.
///
/// `read` follows a single-reader discipline; `write` may be called
/// concurrently with `read` and with other writes. Dropping the stream closes it.
pub struct VirtualStream {
    slot: Arc<StreamSlot>,
    inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<Bytes>>,
    conn: Arc<Connection>,
}

impl VirtualStream {
    pub(crate) fn new(
        slot: Arc<StreamSlot>,
        inbound: mpsc::UnboundedReceiver<Bytes>,
        conn: Arc<Connection>,
    ) -> Self {
        Self {
            slot,
            inbound: tokio::sync::Mutex::new(inbound),
            conn,
        }
    }

    pub fn id(&self) -> u32 {
        self.slot.id
    }

    /// Sends one already-framed message over the physical connection.
    pub async fn write(&self, frame: &[u8]) -> Result<()> {
        if self.slot.is_closed() {
            return Err(self.slot.terminal_error().unwrap_or(Error::ConnClosed));
        }
        let frame = Bytes::copy_from_slice(frame);
        match self.slot.ctx.run(self.conn.write(self.slot.generation, frame)).await {
            Ok(written) => written,
            Err(ctx_err) => Err(self.settle(ctx_err)),
        }
    }

    /// Waits for the next payload addressed to this stream.
    ///
    /// Payloads that arrived before the stream failed are still returned
    /// first. Once the caller's context is done the stream is closed and the
    /// context error is returned.
    pub async fn read(&self) -> Result<Bytes> {
        let mut inbound = self.inbound.lock().await;
        tokio::select! {
            biased;
            payload = inbound.recv() => match payload {
                Some(payload) => Ok(payload),
                None => Err(self.slot.terminal_error().unwrap_or(Error::ConnClosed)),
            },
            ctx_err = self.slot.ctx.done() => Err(self.settle(ctx_err)),
        }
    }

    /// Resolves the error to report after the stream context finished: the
    /// recorded terminal error if the stream was failed or closed, otherwise
    /// the caller's own cancellation, which also closes the stream.
    fn settle(&self, ctx_err: Error) -> Error {
        if let Some(terminal) = self.slot.terminal_error() {
            return terminal;
        }
        self.close_with(ctx_err.clone());
        self.slot.terminal_error().unwrap_or(ctx_err)
    }

    /// Local address of the physical connection; `None` once it is closed.
    pub fn local_addr(&self) -> Option<String> {
        self.conn.local_addr()
    }

    pub fn remote_addr(&self) -> Option<String> {
        self.conn.remote_addr()
    }

    /// The physical connection carrying this stream.
    pub fn connection(&self) -> ConnHandle {
        ConnHandle::new(self.conn.clone())
    }

    /// Closes the stream and releases its identifier. Idempotent.
    pub fn close(&self) {
        self.close_with(Error::ConnClosed);
    }

    fn close_with(&self, cause: Error) {
        if self.slot.fail(cause) {
            self.conn.remove_stream(&self.slot);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.slot.is_closed()
    }
}

impl Drop for VirtualStream {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for VirtualStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualStream")
            .field("id", &self.slot.id)
            .field("conn", &self.conn.id())
            .field("closed", &self.slot.is_closed())
            .finish()
    }
}
