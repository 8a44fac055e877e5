//! The two seams the core composes over: [`ByteStream`], any reliable
//! ordered byte channel a fabric may run on top of, and [`NetDialer`],
//! anything that can produce one for a `(network, address)` pair. A TLS or
//! cipher wrapper slots in beneath either without the core noticing.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// A reliable, ordered, bidirectional byte channel with known endpoints.
pub trait ByteStream: AsyncRead + AsyncWrite + Send + Unpin {
    fn local_addr(&self) -> io::Result<SocketAddr>;
    fn peer_addr(&self) -> io::Result<SocketAddr>;
}

impl ByteStream for TcpStream {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        TcpStream::local_addr(self)
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        TcpStream::peer_addr(self)
    }
}

/// Produces a [`ByteStream`] for a target descriptor.
///
/// `network` names the address family the way the wire protocol does:
/// `tcp`, `tcp4` or `tcp6`.
#[async_trait::async_trait]
pub trait NetDialer: Send + Sync {
    async fn dial(&self, network: &str, address: &str) -> io::Result<Box<dyn ByteStream>>;

    async fn dial_timeout(
        &self,
        network: &str,
        address: &str,
        timeout: Duration,
    ) -> io::Result<Box<dyn ByteStream>> {
        match tokio::time::timeout(timeout, self.dial(network, address)).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("dial {network} {address} timed out"),
            )),
        }
    }
}

/// The standard dialer: plain TCP with optional v4/v6 pinning.
#[derive(Debug, Default, Clone)]
pub struct TcpDialer;

#[async_trait::async_trait]
impl NetDialer for TcpDialer {
    async fn dial(&self, network: &str, address: &str) -> io::Result<Box<dyn ByteStream>> {
        let stream = match network {
            "tcp" => TcpStream::connect(address).await?,
            "tcp4" => connect_pinned(address, |addr| addr.is_ipv4()).await?,
            "tcp6" => connect_pinned(address, |addr| addr.is_ipv6()).await?,
            other => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("unknown network '{other}'"),
                ))
            }
        };
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}

async fn connect_pinned(
    address: &str,
    family: impl Fn(&SocketAddr) -> bool,
) -> io::Result<TcpStream> {
    let mut last_err = None;
    for addr in tokio::net::lookup_host(address).await? {
        if !family(&addr) {
            continue;
        }
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(err) => last_err = Some(err),
        }
    }
    Err(last_err.unwrap_or_else(|| {
        io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("no address of the requested family for {address}"),
        )
    }))
}
