//! # Error Definitions
//!
//! Every failure the pool can surface, from configuration mistakes to a
//! connection that ran out of reconnect attempts.
//!
//! Errors are `Clone`: one causal error is fanned out to every virtual stream
//! of a failed connection and to every waiter of a shared dial.

/// Failures surfaced by the pool, its connections and its streams.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// `get_virtual_conn` was called without a frame parser.
    FrameParserMissing,
    /// A stream with this identifier is already live on the connection.
    DuplicateStreamId(u32),
    /// The network name is not one of tcp/udp/unix (and their variants).
    UnsupportedNetwork(String),
    /// The options cannot be honored (e.g. TLS on the plain dialer).
    Config(String),
    /// The stream, connection, host or pool was closed under the caller.
    ConnClosed,
    /// The caller canceled its context.
    Canceled,
    /// The caller's deadline expired.
    DeadlineExceeded,
    /// Establishing the physical connection failed.
    Dial(String),
    /// Reading or writing the physical connection failed.
    Io(String),
    /// The peer closed the physical connection.
    ConnectionLost(String),
    /// The frame parser rejected the inbound bytes.
    Protocol(String),
    /// The connection gave up after this many consecutive reconnect attempts.
    ReconnectExhausted { attempts: u32 },
    /// The send queue is full and the pool is configured to drop.
    SendQueueFull,
    /// Several causes coincided; delivered together.
    Multiple(Vec<Error>),
}

impl Error {
    /// Whether the caller gave up, as opposed to the network failing.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Canceled | Self::DeadlineExceeded)
    }

    /// Whether retrying the same request can never succeed.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::FrameParserMissing | Self::DuplicateStreamId(_) | Self::UnsupportedNetwork(_) | Self::Config(_)
        )
    }

    /// Merges two causes into one error, flattening nested aggregates and
    /// skipping exact duplicates.
    pub fn merge(self, other: Error) -> Error {
        let mut causes = match self {
            Self::Multiple(causes) => causes,
            single => vec![single],
        };
        let others = match other {
            Self::Multiple(others) => others,
            single => vec![single],
        };
        for cause in others {
            if !causes.contains(&cause) {
                causes.push(cause);
            }
        }
        if causes.len() == 1 {
            causes.remove(0)
        } else {
            Self::Multiple(causes)
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FrameParserMissing => write!(f, "frame parser is required for multiplexing"),
            Self::DuplicateStreamId(id) => write!(f, "stream id {} is already in use on this connection", id),
            Self::UnsupportedNetwork(network) => write!(f, "unsupported network: {}", network),
            Self::Config(msg) => write!(f, "invalid configuration: {}", msg),
            Self::ConnClosed => write!(f, "connection is closed"),
            Self::Canceled => write!(f, "context canceled"),
            Self::DeadlineExceeded => write!(f, "context deadline exceeded"),
            Self::Dial(msg) => write!(f, "dial failed: {}", msg),
            Self::Io(msg) => write!(f, "I/O error: {}", msg),
            Self::ConnectionLost(msg) => write!(f, "connection lost: {}", msg),
            Self::Protocol(msg) => write!(f, "protocol error: {}", msg),
            Self::ReconnectExhausted { attempts } => {
                write!(f, "gave up after {} reconnect attempts", attempts)
            }
            Self::SendQueueFull => write!(f, "send queue is full"),
            Self::Multiple(causes) => {
                write!(f, "multiple errors: ")?;
                for (i, cause) in causes.iter().enumerate() {
                    if i > 0 {
                        write!(f, "; ")?;
                    }
                    write!(f, "{}", cause)?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
