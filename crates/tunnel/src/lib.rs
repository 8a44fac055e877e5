//! A multiplexing tunnel: many independent byte streams carried as framed
//! "fibers" over one authenticated substrate connection, with per-stream
//! sliding-window flow control.
//!
//! The building blocks, bottom up:
//! - [`frame`]: the wire codec (5-byte header, typed payloads).
//! - [`queue`]: the per-stream receive buffer.
//! - [`stream`]: [`Conn`], a reliable ordered bidirectional stream with a
//!   TCP-like state machine, usable anywhere a tokio stream is.
//! - [`fabric`]: the multiplexer owning the substrate and all streams on it.
//! - [`auth`], [`server`], [`dns`]: the handshake, the server-side SYN
//!   handlers, and the out-of-band DNS relay.

use std::time::Duration;

pub mod auth;
pub mod dialer;
pub mod dns;
pub mod fabric;
pub mod frame;
pub mod queue;
pub mod server;
pub mod stream;

pub use auth::Authenticator;
pub use dialer::{ByteStream, NetDialer, TcpDialer};
pub use fabric::{Fabric, Role, Session};
pub use frame::{Errno, Frame, FrameType};
pub use server::{Handler, ServerContext};
pub use stream::Conn;

/// Initial per-direction flow-control credit, in bytes.
pub const WINDOWSIZE: u32 = 4 * 1024 * 1024;

/// Maximum DATA payload carried by a single frame.
pub const BUFFERSIZE: usize = 8 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("frame payload overflows the u16 length field")]
    FrameOverflow,
    #[error("malformed {0} payload")]
    Payload(&'static str, #[source] serde_json::Error),
    #[error("unexpected frame {0:?}")]
    UnexpectedFrame(FrameType),
    #[error("authentication failed")]
    AuthFailed,
    #[error("authentication timed out")]
    AuthTimeout,
    #[error("unknown network '{0}'")]
    UnknownNetwork(String),
    #[error("stream id space exhausted")]
    StreamOutOfId,
    #[error("stream id {0} already in use")]
    IdExist(u16),
    #[error("remote connect failed")]
    ConnFailed,
    #[error("dial timed out")]
    DialTimeout,
    #[error("dns exchange timed out")]
    DnsTimeout,
    #[error("fabric closed")]
    Closed,
    #[error("invalid stream state")]
    State,
}

/// Tunables honored by the core. Every timeout bounds one specific wait;
/// none of them are load-bearing for correctness.
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// Initial per-direction flow-control credit.
    pub window_size: u32,
    /// Largest DATA payload per frame.
    pub buffer_size: usize,
    /// Bound on the AUTH/RESULT exchange after substrate connect.
    pub auth_timeout: Duration,
    /// Bound on the SYN -> RESULT wait, and on server-side egress dials.
    pub dial_timeout: Duration,
    /// How long a half-closed stream may linger before an abortive reset.
    pub close_timeout: Duration,
    /// Bound on any single substrate write; expiry is fatal to the fabric.
    pub write_timeout: Duration,
    /// Bound on an out-of-band DNS exchange.
    pub dns_timeout: Duration,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            window_size: WINDOWSIZE,
            buffer_size: BUFFERSIZE,
            auth_timeout: Duration::from_secs(10),
            dial_timeout: Duration::from_secs(30),
            close_timeout: Duration::from_secs(30),
            write_timeout: Duration::from_secs(10),
            dns_timeout: Duration::from_secs(30),
        }
    }
}
