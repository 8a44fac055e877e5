//! Server side of the tunnel: the substrate accept loop and the registry of
//! SYN handlers. A handler receives the half-open stream, opens whatever
//! egress the network name implies, and settles the handshake with
//! `accept()` or `deny()`.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use crate::auth::{self, Authenticator};
use crate::dialer::{ByteStream, NetDialer};
use crate::fabric::{Fabric, Fiber, Role};
use crate::frame::{Errno, Frame, FrameCodec};
use crate::stream::{Conn, ConnCore, Status};
use crate::{Error, TunnelConfig};

/// A SYN handler for one network name.
#[async_trait::async_trait]
pub trait Handler: Send + Sync {
    /// Serve one stream still in SYN_RECV. The handler must settle the
    /// handshake (`accept` or `deny`) before moving bytes.
    async fn serve(&self, conn: Conn) -> anyhow::Result<()>;
}

/// Shared server state: the handler registry plus the egress environment.
pub struct ServerContext {
    handlers: HashMap<String, Arc<dyn Handler>>,
    resolver: Option<String>,
    pub(crate) cfg: Arc<TunnelConfig>,
}

impl ServerContext {
    /// A context with the built-in handler set: `tcp`/`tcp4`/`tcp6` proxy,
    /// `myip` diagnostics, and (when a resolver is configured) `dns`.
    pub fn new(
        dialer: Arc<dyn NetDialer>,
        resolver: Option<String>,
        cfg: Arc<TunnelConfig>,
    ) -> ServerContext {
        let mut ctx = ServerContext {
            handlers: HashMap::new(),
            resolver: resolver.clone(),
            cfg: cfg.clone(),
        };

        let tcp = Arc::new(TcpProxyHandler {
            dialer: dialer.clone(),
            cfg: cfg.clone(),
        });
        for network in ["tcp", "tcp4", "tcp6"] {
            ctx.register(network, tcp.clone());
        }
        ctx.register("myip", Arc::new(MyIpHandler));
        if let Some(resolver) = resolver {
            ctx.register(
                "dns",
                Arc::new(DnsProxyHandler {
                    dialer,
                    resolver,
                    cfg,
                }),
            );
        }
        ctx
    }

    /// Register or replace the handler for a network name.
    pub fn register(&mut self, network: &str, handler: Arc<dyn Handler>) {
        self.handlers.insert(network.to_string(), handler);
    }

    /// Upstream resolver for out-of-band DNS frames, if configured.
    pub(crate) fn resolver(&self) -> Option<String> {
        self.resolver.clone()
    }
}

/// Handle an unmapped SYN: instantiate the stream at the peer's id and run
/// its handler on a detached task. Only substrate loss is fatal here;
/// refusals are answered in-band.
pub(crate) async fn on_syn(
    fabric: &Arc<Fabric>,
    ctx: &Arc<ServerContext>,
    frame: Frame,
) -> Result<(), Error> {
    let streamid = frame.streamid;
    let syn = frame.decode_syn()?;

    let Some(handler) = ctx.handlers.get(&syn.network).cloned() else {
        tracing::warn!(fabric = %fabric, streamid, network = %syn.network, "unknown network");
        return fabric
            .send(Frame::result(streamid, Errno::UnknownNetwork))
            .await;
    };

    let core = ConnCore::new(
        streamid,
        syn.network.clone(),
        syn.address.clone(),
        Status::SynRecv,
        fabric.handle(),
        ctx.cfg.clone(),
    );
    if let Err(err) = fabric.put_into_id(streamid, Fiber::Stream(core.clone())) {
        tracing::warn!(fabric = %fabric, streamid, %err, "syn for occupied id");
        return fabric.send(Frame::result(streamid, Errno::IdExist)).await;
    }

    // Opening the egress may take a dial timeout's worth of waiting; do not
    // stall the reader loop on it.
    let conn = Conn::new(core);
    tokio::spawn(async move {
        let (network, address) = conn.target();
        let (network, address) = (network.to_string(), address.to_string());
        if let Err(err) = handler.serve(conn).await {
            tracing::warn!(streamid, %network, %address, err = ?err, "handler failed");
        }
    });
    Ok(())
}

/// The TCP proxy: dial the SYN's target, then splice bytes both ways.
pub struct TcpProxyHandler {
    dialer: Arc<dyn NetDialer>,
    cfg: Arc<TunnelConfig>,
}

#[async_trait::async_trait]
impl Handler for TcpProxyHandler {
    async fn serve(&self, mut conn: Conn) -> anyhow::Result<()> {
        let (network, address) = conn.target();
        let (network, address) = (network.to_string(), address.to_string());

        let mut egress = match self
            .dialer
            .dial_timeout(&network, &address, self.cfg.dial_timeout)
            .await
        {
            Ok(egress) => egress,
            Err(err) => {
                tracing::info!(conn = conn.streamid(), %network, %address, %err, "egress dial failed");
                conn.deny().await?;
                return Ok(());
            }
        };

        conn.accept().await?;
        tracing::debug!(conn = conn.streamid(), %network, %address, "connected");

        let _ = tokio::io::copy_bidirectional(&mut conn, &mut egress).await;
        Ok(())
    }
}

/// Diagnostic: report the tunnel client's address back to it.
pub struct MyIpHandler;

#[async_trait::async_trait]
impl Handler for MyIpHandler {
    async fn serve(&self, mut conn: Conn) -> anyhow::Result<()> {
        use tokio::io::AsyncWriteExt;

        conn.accept().await?;
        let yourip = ByteStream::peer_addr(&conn)?.to_string();
        tracing::debug!(conn = conn.streamid(), %yourip, "myip");
        conn.write_all(yourip.as_bytes()).await?;
        conn.close().await?;
        Ok(())
    }
}

/// `dns` streams are proxied to the configured upstream resolver's TCP port.
pub struct DnsProxyHandler {
    dialer: Arc<dyn NetDialer>,
    resolver: String,
    cfg: Arc<TunnelConfig>,
}

#[async_trait::async_trait]
impl Handler for DnsProxyHandler {
    async fn serve(&self, mut conn: Conn) -> anyhow::Result<()> {
        let mut egress = match self
            .dialer
            .dial_timeout("tcp", &self.resolver, self.cfg.dial_timeout)
            .await
        {
            Ok(egress) => egress,
            Err(err) => {
                tracing::info!(conn = conn.streamid(), resolver = %self.resolver, %err, "resolver dial failed");
                conn.deny().await?;
                return Ok(());
            }
        };

        conn.accept().await?;
        let _ = tokio::io::copy_bidirectional(&mut conn, &mut egress).await;
        Ok(())
    }
}

/// Accept substrates until cancelled: authenticate each one, wrap it in a
/// server fabric, and hold it until that fabric closes.
pub async fn serve(
    listener: TcpListener,
    auth: Arc<Authenticator>,
    ctx: Arc<ServerContext>,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    loop {
        let (socket, addr) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(err) => {
                    tracing::error!(%err, "accept failed");
                    continue;
                }
            },
            _ = shutdown.cancelled() => return Ok(()),
        };

        tracing::info!(%addr, "substrate accepted");
        let _ = socket.set_nodelay(true);
        let auth = auth.clone();
        let ctx = ctx.clone();
        tokio::spawn(handle_substrate(Box::new(socket), auth, ctx));
    }
}

async fn handle_substrate(
    stream: Box<dyn ByteStream>,
    auth: Arc<Authenticator>,
    ctx: Arc<ServerContext>,
) {
    let peer = stream.peer_addr().ok();
    let cfg = ctx.cfg.clone();
    let mut framed = Framed::new(stream, FrameCodec);

    if let Err(err) = auth::server_handshake(&mut framed, &auth, &cfg).await {
        tracing::warn!(?peer, %err, "handshake failed, dropping substrate");
        return;
    }

    match Fabric::spawn(framed, Role::Server(ctx), cfg) {
        Ok(session) => {
            session.closed().await;
            tracing::info!(?peer, "server session quit");
        }
        Err(err) => tracing::error!(?peer, %err, "failed to start fabric"),
    }
}
