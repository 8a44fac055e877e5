//! Out-of-band DNS over the fabric: a raw DNS wire message rides a DNS
//! frame at a fresh stream id with no SYN handshake. The server relays
//! queries to its upstream resolver over TCP (RFC 1035 §4.2.2 two-byte
//! length framing) and answers on the same id; responses route back to the
//! channel fiber registered by the waiting client.

use std::io;
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::fabric::{Fabric, Role, Session};
use crate::frame::Frame;
use crate::Error;

/// Offset of the flags byte carrying QR; anything shorter than a DNS
/// header cannot be routed.
const DNS_HEADER_LEN: usize = 12;

fn is_response(message: &[u8]) -> bool {
    message.len() >= DNS_HEADER_LEN && message[2] & 0x80 != 0
}

impl Session {
    /// Send one DNS query through the fabric and await its response.
    pub async fn dns_exchange(&self, query: Bytes) -> Result<Bytes, Error> {
        let fabric = self.fabric();
        let (streamid, mut responses) = fabric.register_chan()?;

        let result = async {
            fabric.send(Frame::dns(streamid, query)).await?;
            match tokio::time::timeout(fabric.config().dns_timeout, responses.recv()).await {
                Ok(Some(frame)) => Ok(frame.data),
                Ok(None) => Err(Error::Closed),
                Err(_) => Err(Error::DnsTimeout),
            }
        }
        .await;

        fabric.remove_fiber(streamid);
        result
    }
}

/// Route one inbound DNS frame. Responses go to the mapped waiter (or are
/// dropped if it timed out); queries are resolved on a detached task when
/// this fabric serves with a configured resolver.
pub(crate) fn dispatch(fabric: &Arc<Fabric>, role: &Role, frame: Frame) {
    if is_response(&frame.data) {
        let streamid = frame.streamid;
        if !fabric.route_to_chan(frame) {
            tracing::debug!(fabric = %fabric, streamid, "dns response with no waiter dropped");
        }
        return;
    }

    let resolver = match role {
        Role::Server(ctx) => ctx.resolver(),
        Role::Client => None,
    };
    let Some(resolver) = resolver else {
        tracing::debug!(fabric = %fabric, streamid = frame.streamid, "dns query ignored");
        return;
    };

    let fabric = fabric.clone();
    let timeout = fabric.config().dns_timeout;
    tokio::spawn(async move {
        let streamid = frame.streamid;
        match tokio::time::timeout(timeout, exchange_tcp(&resolver, &frame.data)).await {
            Ok(Ok(response)) => {
                let _ = fabric.send(Frame::dns(streamid, response)).await;
            }
            Ok(Err(err)) => {
                tracing::warn!(fabric = %fabric, streamid, %err, "dns relay failed")
            }
            Err(_) => tracing::warn!(fabric = %fabric, streamid, "dns relay timed out"),
        }
    });
}

/// One query/response exchange with the resolver over TCP.
async fn exchange_tcp(resolver: &str, query: &[u8]) -> io::Result<Bytes> {
    if query.len() > u16::MAX as usize {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "dns query too large",
        ));
    }

    let mut stream = TcpStream::connect(resolver).await?;
    stream
        .write_all(&(query.len() as u16).to_be_bytes())
        .await?;
    stream.write_all(query).await?;

    let mut len = [0u8; 2];
    stream.read_exact(&mut len).await?;
    let mut response = vec![0u8; u16::from_be_bytes(len) as usize];
    stream.read_exact(&mut response).await?;
    Ok(response.into())
}
