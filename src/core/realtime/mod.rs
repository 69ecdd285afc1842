//! Realtime (streaming) synthesis over a pooled duplex connection.
//!
//! - [`events`]: MessagePack frames exchanged with the service
//! - [`transport`]: the socket abstraction and its WebSocket implementation
//! - [`pool`]: keyed connection reuse with expiry and fair waiting
//! - [`session`]: the writer/reader loops bound to one connection

mod base;
pub mod events;
pub mod pool;
pub mod session;
pub mod transport;

pub use base::{
    DEFAULT_AUDIO_BUFFER, DEFAULT_PACKET_BUFFER, DEFAULT_PING_INTERVAL, RealtimeError,
    RealtimeResult, SessionOptions,
};
pub use events::{ClientEvent, EventError, FinishReason, ServerEvent};
pub use pool::{ConnectionId, ConnectionPool, KeyPoolStats, PoolConfig, PoolError, PoolKey, PoolLease};
pub use session::{ClosedSignal, ConnectionControl, DirectConnection, RealtimeSession, SessionController};
pub use transport::{Transport, TransportError, TransportOptions, WsTransport};
