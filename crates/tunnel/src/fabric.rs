//! The fabric: one substrate connection carrying many streams.
//!
//! A fabric owns its substrate exclusively. A single reader task
//! demultiplexes inbound frames to fibers looked up in the stream table; a
//! single writer task serializes every outbound frame under a write timeout.
//! Streams interact with their fabric only through [`FabricHandle`], a
//! narrow send-one-frame/detach capability, so there is no reference cycle
//! between the table and the streams it holds.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock, Weak};

use futures::{SinkExt, TryStreamExt};
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::dialer::ByteStream;
use crate::dns;
use crate::frame::{Frame, FrameCodec, FrameType};
use crate::server::{self, ServerContext};
use crate::stream::{Conn, ConnCore, Status};
use crate::{Error, TunnelConfig};

/// Outbound frames queued ahead of the writer task.
const OUTBOUND_DEPTH: usize = 64;

/// What to do with a frame whose stream id is not in the table.
pub enum Role {
    /// Unmapped frames are a protocol violation.
    Client,
    /// An unmapped SYN creates the stream and runs its handler.
    Server(Arc<ServerContext>),
}

/// A dispatch target in the stream table: a full stream, or a bare channel
/// for out-of-band exchanges that never leave frame granularity (DNS).
#[derive(Clone)]
pub(crate) enum Fiber {
    Stream(Arc<ConnCore>),
    Chan(mpsc::Sender<Frame>),
}

struct Weaves {
    closed: bool,
    next_id: u16,
    map: HashMap<u16, Fiber>,
}

impl Weaves {
    /// Claim the next free id of this fabric's parity, advancing past
    /// occupied slots. A full wrap of the id space is an error.
    fn alloc_id(&mut self) -> Result<u16, Error> {
        let start = self.next_id;
        while self.map.contains_key(&self.next_id) {
            self.next_id = self.next_id.wrapping_add(2);
            if self.next_id == start {
                return Err(Error::StreamOutOfId);
            }
        }
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(2);
        Ok(id)
    }
}

pub struct Fabric {
    local: SocketAddr,
    peer: SocketAddr,
    weaves: Arc<RwLock<Weaves>>,
    outbound: mpsc::Sender<Frame>,
    cfg: Arc<TunnelConfig>,
    shutdown: CancellationToken,
}

impl std::fmt::Display for Fabric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}->{}", self.local, self.peer)
    }
}

impl Fabric {
    /// Wrap an authenticated substrate and spawn its reader and writer
    /// tasks. `framed` carries over any bytes buffered during the handshake.
    pub fn spawn(
        framed: Framed<Box<dyn ByteStream>, FrameCodec>,
        role: Role,
        cfg: Arc<TunnelConfig>,
    ) -> Result<Session, Error> {
        let parts = framed.into_parts();
        let local = parts.io.local_addr()?;
        let peer = parts.io.peer_addr()?;

        // Client-anchored fabrics allocate even ids, server-anchored odd.
        let next_id = match role {
            Role::Client => 0,
            Role::Server(_) => 1,
        };

        let (read_half, write_half) = tokio::io::split(parts.io);
        let mut reader = FramedRead::new(read_half, FrameCodec);
        reader.read_buffer_mut().extend_from_slice(&parts.read_buf);
        let writer = FramedWrite::new(write_half, FrameCodec);

        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_DEPTH);

        let fabric = Arc::new(Fabric {
            local,
            peer,
            weaves: Arc::new(RwLock::new(Weaves {
                closed: false,
                next_id,
                map: HashMap::new(),
            })),
            outbound,
            cfg,
            shutdown: CancellationToken::new(),
        });

        tokio::spawn(write_loop(fabric.clone(), writer, outbound_rx));
        tokio::spawn(read_loop(fabric.clone(), reader, role));

        Ok(Session { fab: fabric })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Number of live fibers on this fabric.
    pub fn len(&self) -> usize {
        self.weaves.read().unwrap().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Open a new stream to `(network, address)` through this fabric.
    pub async fn dial(&self, network: &str, address: &str) -> Result<Conn, Error> {
        let core = {
            let mut weaves = self.weaves.write().unwrap();
            if weaves.closed {
                return Err(Error::Closed);
            }
            let id = weaves.alloc_id()?;
            let core = ConnCore::new(
                id,
                network.to_string(),
                address.to_string(),
                Status::Unknown,
                self.handle(),
                self.cfg.clone(),
            );
            weaves.map.insert(id, Fiber::Stream(core.clone()));
            core
        };

        tracing::debug!(fabric = %self, conn = %core, "dial");
        core.connect().await?;
        Ok(Conn::new(core))
    }

    /// Register a stream at the id chosen by the peer's SYN.
    pub(crate) fn put_into_id(&self, id: u16, fiber: Fiber) -> Result<(), Error> {
        let mut weaves = self.weaves.write().unwrap();
        if weaves.closed {
            return Err(Error::Closed);
        }
        if weaves.map.contains_key(&id) {
            return Err(Error::IdExist(id));
        }
        weaves.map.insert(id, fiber);
        Ok(())
    }

    /// Allocate a fresh id carrying a bare frame channel (DNS waiters).
    pub(crate) fn register_chan(&self) -> Result<(u16, mpsc::Receiver<Frame>), Error> {
        let (tx, rx) = mpsc::channel(1);
        let mut weaves = self.weaves.write().unwrap();
        if weaves.closed {
            return Err(Error::Closed);
        }
        let id = weaves.alloc_id()?;
        weaves.map.insert(id, Fiber::Chan(tx));
        Ok((id, rx))
    }

    pub(crate) fn remove_fiber(&self, id: u16) {
        self.weaves.write().unwrap().map.remove(&id);
    }

    /// Deliver a frame to the channel fiber mapped at its id, if any.
    pub(crate) fn route_to_chan(&self, frame: Frame) -> bool {
        let fiber = {
            let weaves = self.weaves.read().unwrap();
            weaves.map.get(&frame.streamid).cloned()
        };
        match fiber {
            Some(Fiber::Chan(tx)) => {
                let _ = tx.try_send(frame);
                true
            }
            _ => false,
        }
    }

    pub(crate) fn config(&self) -> &TunnelConfig {
        &self.cfg
    }

    pub(crate) async fn send(&self, frame: Frame) -> Result<(), Error> {
        self.outbound.send(frame).await.map_err(|_| Error::Closed)
    }

    pub(crate) fn handle(&self) -> FabricHandle {
        FabricHandle {
            outbound: self.outbound.clone(),
            weaves: Arc::downgrade(&self.weaves),
            local: self.local,
            peer: self.peer,
        }
    }

    /// Tear the fabric down: mark closed, stop both tasks, and reset every
    /// registered fiber so blocked readers and writers unblock. Idempotent.
    pub fn close(&self) {
        let fibers: Vec<(u16, Fiber)> = {
            let mut weaves = self.weaves.write().unwrap();
            if weaves.closed {
                return;
            }
            weaves.closed = true;
            weaves.map.drain().collect()
        };
        self.shutdown.cancel();

        if !fibers.is_empty() {
            tracing::warn!(fabric = %self, streams = fibers.len(), "closing all streams");
        }
        for (_, fiber) in fibers {
            match fiber {
                Fiber::Stream(core) => core.reset(),
                Fiber::Chan(tx) => drop(tx),
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

/// A live fabric as held by its owner: the client pool, or the server's
/// per-substrate task. Cloning shares the underlying fabric.
#[derive(Clone)]
pub struct Session {
    fab: Arc<Fabric>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Session({})", self.fab)
    }
}

impl Session {
    pub async fn dial(&self, network: &str, address: &str) -> Result<Conn, Error> {
        self.fab.dial(network, address).await
    }

    /// Live stream count, the pool's load measure.
    pub fn len(&self) -> usize {
        self.fab.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fab.is_empty()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.fab.local_addr()
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.fab.peer_addr()
    }

    pub fn close(&self) {
        self.fab.close()
    }

    pub fn is_closed(&self) -> bool {
        self.fab.is_closed()
    }

    /// Resolves when the fabric has shut down.
    pub async fn closed(&self) {
        self.fab.shutdown.cancelled().await
    }

    /// Whether two handles share one underlying fabric.
    pub fn same(&self, other: &Session) -> bool {
        Arc::ptr_eq(&self.fab, &other.fab)
    }

    pub(crate) fn fabric(&self) -> &Arc<Fabric> {
        &self.fab
    }
}

/// The narrow capability a stream holds on its fabric: queue one frame,
/// detach from the table, name the endpoints. `Weak` so that a stream
/// handle kept alive by the application cannot pin a dead fabric's table.
#[derive(Clone)]
pub(crate) struct FabricHandle {
    outbound: mpsc::Sender<Frame>,
    weaves: Weak<RwLock<Weaves>>,
    local: SocketAddr,
    peer: SocketAddr,
}

impl FabricHandle {
    pub(crate) fn outbound(&self) -> mpsc::Sender<Frame> {
        self.outbound.clone()
    }

    pub(crate) async fn send(&self, frame: Frame) -> Result<(), Error> {
        self.outbound.send(frame).await.map_err(|_| Error::Closed)
    }

    pub(crate) fn try_send(&self, frame: Frame) -> Result<(), Error> {
        self.outbound.try_send(frame).map_err(|_| Error::Closed)
    }

    pub(crate) fn close_fiber(&self, streamid: u16) {
        if let Some(weaves) = self.weaves.upgrade() {
            if weaves.write().unwrap().map.remove(&streamid).is_some() {
                tracing::debug!(fabric = %self.peer, streamid, "stream removed");
            }
        }
    }

    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub(crate) fn peer_addr(&self) -> SocketAddr {
        self.peer
    }
}

async fn write_loop(
    fabric: Arc<Fabric>,
    mut writer: FramedWrite<tokio::io::WriteHalf<Box<dyn ByteStream>>, FrameCodec>,
    mut outbound_rx: mpsc::Receiver<Frame>,
) {
    loop {
        let frame = tokio::select! {
            frame = outbound_rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
            _ = fabric.shutdown.cancelled() => break,
        };

        tracing::trace!(
            fabric = %fabric,
            frame_type = ?frame.frame_type,
            streamid = frame.streamid,
            len = frame.data.len(),
            "send frame",
        );
        match tokio::time::timeout(fabric.cfg.write_timeout, writer.send(frame)).await {
            Ok(Ok(())) => (),
            Ok(Err(err)) => {
                tracing::error!(fabric = %fabric, %err, "substrate write failed");
                break;
            }
            Err(_) => {
                tracing::error!(fabric = %fabric, "substrate write timed out");
                break;
            }
        }
    }
    fabric.close();
}

async fn read_loop(
    fabric: Arc<Fabric>,
    mut reader: FramedRead<tokio::io::ReadHalf<Box<dyn ByteStream>>, FrameCodec>,
    role: Role,
) {
    loop {
        let frame = tokio::select! {
            frame = reader.try_next() => match frame {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    tracing::info!(fabric = %fabric, "substrate EOF");
                    break;
                }
                Err(err) => {
                    tracing::error!(fabric = %fabric, %err, "substrate read failed");
                    break;
                }
            },
            _ = fabric.shutdown.cancelled() => break,
        };

        tracing::trace!(
            fabric = %fabric,
            frame_type = ?frame.frame_type,
            streamid = frame.streamid,
            len = frame.data.len(),
            "recv frame",
        );
        if let Err(err) = dispatch(&fabric, &role, frame).await {
            tracing::error!(fabric = %fabric, %err, "fatal dispatch error");
            break;
        }
    }
    fabric.close();
}

/// Route one inbound frame. `Err` is a protocol violation fatal to the
/// fabric; stream-level trouble is contained inside the stream itself.
async fn dispatch(fabric: &Arc<Fabric>, role: &Role, frame: Frame) -> Result<(), Error> {
    match frame.frame_type {
        // Keepalive and filler are consumed without dispatch.
        FrameType::Ping | FrameType::Spam => return Ok(()),
        FrameType::Dns => {
            dns::dispatch(fabric, role, frame);
            return Ok(());
        }
        _ => (),
    }

    let fiber = {
        let weaves = fabric.weaves.read().unwrap();
        weaves.map.get(&frame.streamid).cloned()
    };

    match fiber {
        Some(Fiber::Stream(core)) => {
            core.handle_frame(frame);
            Ok(())
        }
        Some(Fiber::Chan(tx)) => {
            // A frame-granular waiter; it only ever expects DNS replies.
            let _ = tx.try_send(frame);
            Ok(())
        }
        None => match role {
            Role::Client => Err(Error::UnexpectedFrame(frame.frame_type)),
            Role::Server(ctx) => {
                if frame.frame_type == FrameType::Syn {
                    server::on_syn(fabric, ctx, frame).await
                } else {
                    Err(Error::UnexpectedFrame(frame.frame_type))
                }
            }
        },
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn weaves(next_id: u16) -> Weaves {
        Weaves {
            closed: false,
            next_id,
            map: HashMap::new(),
        }
    }

    #[test]
    fn test_alloc_preserves_parity() {
        let mut even = weaves(0);
        assert_eq!(even.alloc_id().unwrap(), 0);
        assert_eq!(even.alloc_id().unwrap(), 2);

        let mut odd = weaves(1);
        assert_eq!(odd.alloc_id().unwrap(), 1);
        assert_eq!(odd.alloc_id().unwrap(), 3);
    }

    #[test]
    fn test_alloc_skips_occupied_slots() {
        let mut w = weaves(0);
        let id = w.alloc_id().unwrap();
        w.map.insert(id, Fiber::Chan(mpsc::channel(1).0));
        // Slot 2 claimed out of band; the allocator must step over it.
        w.map.insert(2, Fiber::Chan(mpsc::channel(1).0));
        w.next_id = 0;
        assert_eq!(w.alloc_id().unwrap(), 4);
    }

    #[test]
    fn test_alloc_exhaustion_terminates() {
        let mut w = weaves(0);
        let (tx, _rx) = mpsc::channel(1);
        for id in (0..=u16::MAX).step_by(2) {
            w.map.insert(id, Fiber::Chan(tx.clone()));
        }
        match w.alloc_id() {
            Err(Error::StreamOutOfId) => (),
            other => panic!("expected StreamOutOfId, got {other:?}"),
        }
    }
}
