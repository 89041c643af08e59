pub mod builder;
pub mod config;
pub mod connection;
pub mod context;
pub mod error;
pub mod frame;
pub mod gate;
mod host;
pub mod metrics;
pub mod pool;
pub mod registry;
pub mod stream;
pub mod transport;

pub use builder::PoolBuilder;
pub use config::PoolConfig;
pub use connection::ConnHandle;
pub use connection::ConnState;
pub use context::Context;
pub use error::Error;
pub use error::Result;
pub use frame::Frame;
pub use frame::FrameParser;
pub use frame::FrameParserBuilder;
pub use frame::LengthDelimited;
pub use frame::encode_frame;
pub use host::HostStats;
pub use metrics::MetricsSink;
pub use pool::GetOptions;
pub use pool::Pool;
pub use pool::default_pool;
pub use stream::VirtualStream;
pub use transport::Dialer;
pub use transport::NetDialer;
pub use transport::Transport;

#[cfg(test)]
mod mock_transport;
