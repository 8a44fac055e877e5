//! [`Conn`]: one logical bidirectional byte stream inside a fabric.
//!
//! A stream walks an explicit TCP-like state machine and carries its own
//! flow control per direction: credit starts at the configured window size,
//! the sender deducts on every DATA frame, and the receiver renews credit
//! with WND frames sized to what the application actually drained.
//!
//! The state machine is a sum type so that invalid transitions are
//! unrepresentable: the SYN result channel only exists in `SynSent`, and the
//! half-close reaper only exists in `FinSent`/`FinRecv`.

use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, Weak};
use std::task::{ready, Context, Poll, Waker};

use bytes::{Buf, Bytes};
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tokio_util::sync::PollSender;

use crate::fabric::FabricHandle;
use crate::frame::{Errno, Frame, FrameType, Syn};
use crate::queue::ChunkQueue;
use crate::{Error, TunnelConfig};

pub(crate) enum Status {
    Unknown,
    SynSent(Option<oneshot::Sender<Errno>>),
    SynRecv,
    Estab,
    FinSent(AbortHandle),
    FinRecv(AbortHandle),
}

impl Status {
    fn name(&self) -> &'static str {
        match self {
            Status::Unknown => "UNKNOWN",
            Status::SynSent(_) => "SYN_SENT",
            Status::SynRecv => "SYN_RECV",
            Status::Estab => "ESTAB",
            Status::FinSent(_) => "FIN_SENT",
            Status::FinRecv(_) => "FIN_RECV",
        }
    }
}

struct State {
    status: Status,
    // Remote receive credit still available to us, in bytes.
    window: i32,
    // Writer parked until credit arrives or the stream dies.
    wnd_waker: Option<Waker>,
}

/// Shared stream state: registered in the fabric's table for inbound
/// dispatch, and referenced by the application-facing halves.
pub(crate) struct ConnCore {
    pub(crate) streamid: u16,
    pub(crate) network: String,
    pub(crate) address: String,
    weak: Weak<ConnCore>,
    fab: FabricHandle,
    cfg: Arc<TunnelConfig>,
    state: Mutex<State>,
    rqueue: ChunkQueue,
}

impl std::fmt::Display for ConnCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.fab.peer_addr(), self.streamid)
    }
}

impl ConnCore {
    pub(crate) fn new(
        streamid: u16,
        network: String,
        address: String,
        initial: Status,
        fab: FabricHandle,
        cfg: Arc<TunnelConfig>,
    ) -> Arc<ConnCore> {
        Arc::new_cyclic(|weak| ConnCore {
            streamid,
            network,
            address,
            weak: weak.clone(),
            fab,
            state: Mutex::new(State {
                status: initial,
                window: cfg.window_size as i32,
                wnd_waker: None,
            }),
            cfg,
            rqueue: ChunkQueue::new(),
        })
    }

    pub(crate) fn status_name(&self) -> &'static str {
        self.state.lock().unwrap().status.name()
    }

    /// UNKNOWN -> SYN_SENT; emit SYN and await the RESULT reply.
    pub(crate) async fn connect(&self) -> Result<(), Error> {
        let (tx, rx) = oneshot::channel();
        {
            let mut st = self.state.lock().unwrap();
            match st.status {
                Status::Unknown => st.status = Status::SynSent(Some(tx)),
                _ => return Err(Error::State),
            }
        }

        let syn = Syn {
            network: self.network.clone(),
            address: self.address.clone(),
        };
        if let Err(err) = self.fab.send(Frame::syn(self.streamid, &syn)?).await {
            self.reset();
            return Err(err);
        }

        let errno = match tokio::time::timeout(self.cfg.dial_timeout, rx).await {
            Ok(Ok(errno)) => errno,
            // The stream was reset while we waited.
            Ok(Err(_)) => Errno::Closed,
            Err(_) => Errno::Timeout,
        };

        if errno != Errno::None {
            tracing::warn!(
                conn = %self, network = %self.network, address = %self.address,
                ?errno, "connect failed",
            );
            self.reset();
            return Err(match errno {
                Errno::Auth => Error::AuthFailed,
                Errno::IdExist => Error::IdExist(self.streamid),
                Errno::ConnFailed => Error::ConnFailed,
                Errno::Timeout => Error::DialTimeout,
                Errno::UnknownNetwork => Error::UnknownNetwork(self.network.clone()),
                Errno::Closed | Errno::None => Error::Closed,
            });
        }

        let mut st = self.state.lock().unwrap();
        match st.status {
            Status::SynSent(_) => {
                st.status = Status::Estab;
                Ok(())
            }
            _ => Err(Error::State),
        }
    }

    /// SYN_RECV -> ESTAB; emit RESULT(NONE).
    pub(crate) async fn accept(&self) -> Result<(), Error> {
        {
            let mut st = self.state.lock().unwrap();
            match st.status {
                Status::SynRecv => st.status = Status::Estab,
                _ => return Err(Error::State),
            }
        }
        self.fab
            .send(Frame::result(self.streamid, Errno::None))
            .await
    }

    /// SYN_RECV -> UNKNOWN; emit RESULT(CONNFAILED) and detach.
    pub(crate) async fn deny(&self) -> Result<(), Error> {
        let result = self
            .fab
            .send(Frame::result(self.streamid, Errno::ConnFailed))
            .await;
        self.reset();
        result
    }

    /// Dispatch one inbound frame addressed to this stream. Violations are
    /// contained: the stream resets, the fabric lives on.
    pub(crate) fn handle_frame(&self, frame: Frame) {
        match frame.frame_type {
            FrameType::Result => {
                let tx = {
                    let mut st = self.state.lock().unwrap();
                    match &mut st.status {
                        Status::SynSent(tx) => tx.take(),
                        _ => {
                            drop(st);
                            tracing::warn!(conn = %self, "RESULT outside SYN_SENT, reset");
                            self.reset();
                            return;
                        }
                    }
                };
                match frame.decode_result() {
                    Ok(errno) => {
                        if let Some(tx) = tx {
                            // The dialer is either waiting or already timed out.
                            let _ = tx.send(errno);
                        }
                    }
                    Err(err) => {
                        tracing::warn!(conn = %self, %err, "bad RESULT payload, reset");
                        self.reset();
                    }
                }
            }

            FrameType::Data => {
                let len = frame.data.len();
                if self.rqueue.push(frame.data).is_err() {
                    // Peer raced our close; drop the payload.
                    tracing::debug!(conn = %self, len, "data after close dropped");
                } else {
                    tracing::trace!(conn = %self, len, "recv data");
                }
            }

            FrameType::Wnd => match frame.decode_u32() {
                Ok(n) => {
                    let waker = {
                        let mut st = self.state.lock().unwrap();
                        st.window += n as i32;
                        tracing::trace!(conn = %self, n, window = st.window, "window renewed");
                        st.wnd_waker.take()
                    };
                    if let Some(waker) = waker {
                        waker.wake();
                    }
                }
                Err(err) => {
                    tracing::warn!(conn = %self, %err, "bad WND payload, reset");
                    self.reset();
                }
            },

            FrameType::Fin => self.close_read(),

            FrameType::Rst => {
                tracing::debug!(conn = %self, "peer reset");
                self.reset();
            }

            other => {
                tracing::warn!(conn = %self, frame_type = ?other, "unexpected frame, reset");
                self.reset();
            }
        }
    }

    /// Peer finished writing: ESTAB -> FIN_RECV, FIN_SENT -> UNKNOWN.
    fn close_read(&self) {
        tracing::debug!(conn = %self, "read close");
        let finalize = {
            let mut st = self.state.lock().unwrap();
            match std::mem::replace(&mut st.status, Status::Unknown) {
                Status::Estab => {
                    st.status = Status::FinRecv(self.spawn_reaper());
                    false
                }
                Status::FinSent(reaper) => {
                    reaper.abort();
                    true
                }
                Status::Unknown => return,
                other => {
                    tracing::warn!(conn = %self, status = other.name(), "FIN in bad state, reset");
                    drop(st);
                    self.reset();
                    return;
                }
            }
        };
        self.rqueue.close();
        if finalize {
            self.finalize();
        }
    }

    /// Local half-close. Returns the FIN frame to emit when the transition
    /// happened, `None` when it is a no-op, `Err` when the state forbids it.
    fn begin_close_write(&self) -> Result<Option<Frame>, Error> {
        let mut st = self.state.lock().unwrap();
        match std::mem::replace(&mut st.status, Status::Unknown) {
            Status::Estab => {
                st.status = Status::FinSent(self.spawn_reaper());
                tracing::debug!(conn = %self, "write close");
                Ok(Some(Frame::fin(self.streamid)))
            }
            Status::FinRecv(reaper) => {
                reaper.abort();
                drop(st);
                tracing::debug!(conn = %self, "write close, both halves down");
                self.finalize();
                Ok(Some(Frame::fin(self.streamid)))
            }
            Status::Unknown => Ok(None),
            Status::FinSent(reaper) => {
                st.status = Status::FinSent(reaper);
                Ok(None)
            }
            other => {
                st.status = other;
                Err(Error::State)
            }
        }
    }

    /// Abortive teardown: UNKNOWN, queue closed, writers woken, detached.
    pub(crate) fn reset(&self) {
        let waker = {
            let mut st = self.state.lock().unwrap();
            match std::mem::replace(&mut st.status, Status::Unknown) {
                Status::FinSent(reaper) | Status::FinRecv(reaper) => reaper.abort(),
                _ => (),
            }
            st.wnd_waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
        self.rqueue.close();
        self.finalize();
    }

    /// Remove this stream from its fabric's table, freeing the id.
    fn finalize(&self) {
        self.fab.close_fiber(self.streamid);
    }

    /// A half-closed stream that never completes is reset after
    /// `close_timeout` so its id does not linger forever.
    fn spawn_reaper(&self) -> AbortHandle {
        let weak = self.weak.clone();
        let timeout = self.cfg.close_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(core) = weak.upgrade() {
                tracing::info!(conn = %core, "half-close timed out, reset");
                core.reset();
            }
        })
        .abort_handle()
    }

    // WND renewal after our own FIN would race the peer's teardown and
    // arrive as an unmapped frame; suppress it in those states.
    fn may_send_wnd(&self) -> bool {
        !matches!(
            self.state.lock().unwrap().status,
            Status::FinSent(_) | Status::Unknown
        )
    }
}

/// One end-to-end byte stream over a fabric, satisfying tokio's
/// `AsyncRead`/`AsyncWrite` so it can be spliced or wrapped like any socket.
pub struct Conn {
    read: ReadHalf,
    write: WriteHalf,
}

impl std::fmt::Debug for Conn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Conn(streamid={})", self.streamid())
    }
}

impl Conn {
    pub(crate) fn new(core: Arc<ConnCore>) -> Conn {
        let outbound = core.fab.outbound();
        Conn {
            read: ReadHalf {
                core: core.clone(),
                r_rest: None,
                pending_wnd: 0,
                wnd_tx: PollSender::new(outbound.clone()),
            },
            write: WriteHalf {
                core,
                data_tx: PollSender::new(outbound),
                closed: false,
            },
        }
    }

    pub fn streamid(&self) -> u16 {
        self.read.core.streamid
    }

    /// The `(network, address)` descriptor this stream was opened for.
    pub fn target(&self) -> (&str, &str) {
        (&self.read.core.network, &self.read.core.address)
    }

    pub fn status_name(&self) -> &'static str {
        self.read.core.status_name()
    }

    /// Transition a server-received stream into ESTAB, replying RESULT(NONE).
    pub async fn accept(&self) -> Result<(), Error> {
        self.read.core.accept().await
    }

    /// Refuse a server-received stream, replying RESULT(CONNFAILED).
    pub async fn deny(&self) -> Result<(), Error> {
        self.read.core.deny().await
    }

    /// Half-close the write side (FIN). Reads continue until the peer closes.
    pub async fn close(&mut self) -> io::Result<()> {
        use tokio::io::AsyncWriteExt;
        self.write.shutdown().await
    }

    pub fn into_split(self) -> (ReadHalf, WriteHalf) {
        (self.read, self.write)
    }
}

impl crate::dialer::ByteStream for Conn {
    fn local_addr(&self) -> io::Result<std::net::SocketAddr> {
        Ok(self.read.core.fab.local_addr())
    }

    fn peer_addr(&self) -> io::Result<std::net::SocketAddr> {
        Ok(self.read.core.fab.peer_addr())
    }
}

pub struct ReadHalf {
    core: Arc<ConnCore>,
    // Unconsumed remainder of the most recent chunk.
    r_rest: Option<Bytes>,
    // Bytes drained but not yet renewed to the peer.
    pending_wnd: u32,
    wnd_tx: PollSender<Frame>,
}

impl ReadHalf {
    /// Renew the peer's credit for everything drained so far. Credits are
    /// accumulated when the outbound channel is momentarily full and are
    /// never dropped for a live stream.
    fn flush_window(&mut self, cx: &mut Context<'_>) {
        if self.pending_wnd == 0 {
            return;
        }
        if !self.core.may_send_wnd() {
            self.pending_wnd = 0;
            return;
        }
        match self.wnd_tx.poll_reserve(cx) {
            Poll::Ready(Ok(())) => {
                let frame = Frame::wnd(self.core.streamid, self.pending_wnd);
                if self.wnd_tx.send_item(frame).is_ok() {
                    self.pending_wnd = 0;
                }
            }
            Poll::Ready(Err(_)) => self.pending_wnd = 0, // fabric gone
            Poll::Pending => (),
        }
    }
}

impl tokio::io::AsyncRead for ReadHalf {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if let Some(chunk) = this.r_rest.as_mut() {
                let n = chunk.len().min(buf.remaining());
                buf.put_slice(&chunk[..n]);
                chunk.advance(n);
                if chunk.is_empty() {
                    this.r_rest = None;
                }
                this.pending_wnd += n as u32;
                this.flush_window(cx);
                return Poll::Ready(Ok(()));
            }
            match this.core.rqueue.poll_pop(cx) {
                Poll::Ready(Some(chunk)) => {
                    if !chunk.is_empty() {
                        this.r_rest = Some(chunk);
                    }
                }
                // Closed and drained: EOF.
                Poll::Ready(None) => {
                    this.flush_window(cx);
                    return Poll::Ready(Ok(()));
                }
                Poll::Pending => {
                    this.flush_window(cx);
                    return Poll::Pending;
                }
            }
        }
    }
}

pub struct WriteHalf {
    core: Arc<ConnCore>,
    data_tx: PollSender<Frame>,
    closed: bool,
}

impl tokio::io::AsyncWrite for WriteHalf {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        // Reserve the outbound slot first so that once we hold credit the
        // frame goes out without another suspension point.
        if ready!(this.data_tx.poll_reserve(cx)).is_err() {
            return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
        }

        let len = buf.len().min(this.core.cfg.buffer_size);
        {
            let mut st = this.core.state.lock().unwrap();
            if !matches!(st.status, Status::Estab) {
                this.data_tx.abort_send();
                return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
            }
            if st.window < len as i32 {
                st.wnd_waker = Some(cx.waker().clone());
                return Poll::Pending;
            }
            st.window -= len as i32;
        }

        let frame = Frame::data(this.core.streamid, Bytes::copy_from_slice(&buf[..len]));
        if this.data_tx.send_item(frame).is_err() {
            return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
        }
        tracing::trace!(conn = %this.core, len, "send data");
        Poll::Ready(Ok(len))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Frames are handed to the fabric's writer as they are produced.
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.closed {
            return Poll::Ready(Ok(()));
        }
        if ready!(this.data_tx.poll_reserve(cx)).is_err() {
            // Fabric already gone; there is nobody left to FIN.
            this.closed = true;
            return Poll::Ready(Ok(()));
        }
        this.closed = true;
        match this.core.begin_close_write() {
            Ok(Some(fin)) => {
                let _ = this.data_tx.send_item(fin);
                Poll::Ready(Ok(()))
            }
            Ok(None) => {
                this.data_tx.abort_send();
                Poll::Ready(Ok(()))
            }
            Err(_) => {
                this.data_tx.abort_send();
                Poll::Ready(Err(io::ErrorKind::NotConnected.into()))
            }
        }
    }
}

impl Drop for WriteHalf {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        // Run the close transition so the table slot is always reclaimed:
        // the reaper armed here upgrades to a reset if the FIN is lost.
        match self.core.begin_close_write() {
            Ok(Some(fin)) => {
                let _ = self.core.fab.try_send(fin);
            }
            Ok(None) => (),
            // Dropped before the handshake settled; nothing to half-close.
            Err(_) => self.core.reset(),
        }
    }
}

impl tokio::io::AsyncRead for Conn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().read).poll_read(cx, buf)
    }
}

impl tokio::io::AsyncWrite for Conn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().write).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().write).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().write).poll_shutdown(cx)
    }
}
