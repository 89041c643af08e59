//! Mock dialers for testing.
//!
//! These are used internally by the test suite and are not part of the public API.
//! Every dial creates an in-memory duplex pipe whose far end is served by a
//! peer task, so tests control the remote side without touching sockets.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::io::DuplexStream;
use tokio_util::sync::CancellationToken;

use crate::error::Error;
use crate::error::Result;
use crate::frame::FrameParser;
use crate::frame::LengthDelimited;
use crate::frame::encode_frame;
use crate::transport::DialOptions;
use crate::transport::Dialer;
use crate::transport::StreamTransport;
use crate::transport::Transport;

/// How the far end of a mock connection behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerMode {
    /// Sends every frame back to the stream it came from.
    Echo,
    /// Reads and discards everything.
    Silent,
    /// Never reads, so the pipe fills up and writes block.
    Stalled,
}

/// A dialer whose connections end in an in-process peer task.
pub struct MockDialer {
    mode: PeerMode,
    pipe_size: usize,
    delay: Duration,
    dials: AtomicU32,
    /// Returned by every dial while set.
    rejection: Mutex<Option<Error>>,
    peers: Mutex<Vec<CancellationToken>>,
}

impl MockDialer {
    pub fn new(mode: PeerMode) -> Self {
        Self {
            mode,
            pipe_size: 64 * 1024,
            delay: Duration::ZERO,
            dials: AtomicU32::new(0),
            rejection: Mutex::new(None),
            peers: Mutex::new(Vec::new()),
        }
    }

    pub fn echo() -> Self {
        Self::new(PeerMode::Echo)
    }

    /// A dialer that refuses every dial.
    pub fn refusing() -> Self {
        let dialer = Self::echo();
        dialer.refuse(true);
        dialer
    }

    /// Makes every dial take `delay` before it completes.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_pipe_size(mut self, size: usize) -> Self {
        self.pipe_size = size;
        self
    }

    pub fn refuse(&self, refuse: bool) {
        let rejection = refuse.then(|| Error::Dial("connection refused".into()));
        *self.rejection.lock().unwrap() = rejection;
    }

    /// Makes every dial fail with `err`.
    pub fn reject_with(&self, err: Error) {
        *self.rejection.lock().unwrap() = Some(err);
    }

    /// Number of dials attempted so far, refused ones included.
    pub fn dials(&self) -> u32 {
        self.dials.load(Ordering::SeqCst)
    }

    /// Kills every peer; their connections observe end-of-stream.
    pub fn sever_all(&self) {
        for peer in self.peers.lock().unwrap().drain(..) {
            peer.cancel();
        }
    }
}

#[async_trait::async_trait]
impl Dialer for MockDialer {
    async fn dial(&self, opts: &DialOptions) -> Result<Arc<dyn Transport>> {
        let attempt = self.dials.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let rejection = self.rejection.lock().unwrap().clone();
        if let Some(err) = rejection {
            return Err(err);
        }

        let (near, far) = tokio::io::duplex(self.pipe_size);
        let token = CancellationToken::new();
        self.peers.lock().unwrap().push(token.clone());
        tokio::spawn(serve_peer(far, self.mode, token));

        let local = opts.local_addr.clone().unwrap_or_else(|| format!("mock-local-{}", attempt));
        let (reader, writer) = tokio::io::split(near);
        Ok(Arc::new(StreamTransport::new(
            reader,
            writer,
            Some(local),
            Some(opts.address.clone()),
        )))
    }
}

async fn serve_peer(pipe: DuplexStream, mode: PeerMode, token: CancellationToken) {
    let (mut reader, mut writer) = tokio::io::split(pipe);
    if mode == PeerMode::Stalled {
        token.cancelled().await;
        return;
    }

    let mut parser = LengthDelimited::new();
    let mut buf = BytesMut::with_capacity(4096);
    loop {
        let read = tokio::select! {
            _ = token.cancelled() => return,
            read = reader.read_buf(&mut buf) => read,
        };
        match read {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }

        while let Ok(Some(frame)) = parser.decode(&mut buf) {
            if mode != PeerMode::Echo {
                continue;
            }
            let Ok(reply) = encode_frame(frame.stream_id, &frame.payload) else {
                return;
            };
            if writer.write_all(&reply).await.is_err() {
                return;
            }
        }
    }
}
