//! `tunnel-proxy`: the two ends of the tunnel as a CLI.
//!
//! `serve` listens for client substrates, authenticates them, and proxies
//! their streams onward. `forward` binds a local port and splices every
//! accepted connection to a fixed target through the session pool.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use connpool::{Dialer, Endpoint, PoolConfig};
use tokio_util::sync::CancellationToken;
use tunnel::{Authenticator, ServerContext, TcpDialer, TunnelConfig};

#[derive(Debug, Parser)]
#[command(about, version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[command(flatten)]
    timeouts: TimeoutArgs,
}

#[derive(Debug, Args)]
struct TimeoutArgs {
    /// Bound on the AUTH/RESULT exchange after substrate connect.
    #[arg(long, value_parser = humantime::parse_duration, default_value = "10s", global = true)]
    auth_timeout: Duration,
    /// Bound on SYN -> RESULT waits and server-side egress dials.
    #[arg(long, value_parser = humantime::parse_duration, default_value = "30s", global = true)]
    dial_timeout: Duration,
    /// How long a half-closed stream may linger before an abortive reset.
    #[arg(long, value_parser = humantime::parse_duration, default_value = "30s", global = true)]
    close_timeout: Duration,
    /// Bound on any single substrate write.
    #[arg(long, value_parser = humantime::parse_duration, default_value = "10s", global = true)]
    write_timeout: Duration,
}

impl TimeoutArgs {
    fn build(&self) -> TunnelConfig {
        TunnelConfig {
            auth_timeout: self.auth_timeout,
            dial_timeout: self.dial_timeout,
            close_timeout: self.close_timeout,
            write_timeout: self.write_timeout,
            ..TunnelConfig::default()
        }
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the tunnel server end.
    Serve {
        /// Address to listen on for client substrates.
        #[arg(long, default_value = "0.0.0.0:5233")]
        listen: String,
        /// JSON file mapping usernames to passwords. Omit to accept anyone.
        #[arg(long)]
        passwd: Option<std::path::PathBuf>,
        /// Upstream resolver (host:port) for tunneled DNS. Omit to disable.
        #[arg(long)]
        resolver: Option<String>,
    },
    /// Run the client end: forward a local port through the tunnel.
    Forward {
        /// Local address to listen on.
        #[arg(long, default_value = "127.0.0.1:5234")]
        listen: String,
        /// Tunnel server address(es); tried in randomized order.
        #[arg(long, required = true)]
        server: Vec<String>,
        /// Target `host:port` every accepted connection is spliced to.
        #[arg(long)]
        target: String,
        #[arg(long, default_value = "")]
        username: String,
        #[arg(long, default_value = "")]
        password: String,
        /// Minimum number of sessions kept in the pool.
        #[arg(long, default_value = "1")]
        min_sess: usize,
        /// Streams per session before the pool grows.
        #[arg(long, default_value = "32")]
        max_conn: usize,
    },
}

fn install_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    install_logging();
    let cli = Cli::parse();
    let cfg = Arc::new(cli.timeouts.build());

    let shutdown = CancellationToken::new();
    let ctrl_c = shutdown.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to listen for CTRL-C");
        tracing::info!("received ctrl-c, shutting down");
        ctrl_c.cancel();
    });

    match cli.command {
        Command::Serve {
            listen,
            passwd,
            resolver,
        } => serve(listen, passwd, resolver, cfg, shutdown).await,
        Command::Forward {
            listen,
            server,
            target,
            username,
            password,
            min_sess,
            max_conn,
        } => {
            forward(
                listen, server, target, username, password, min_sess, max_conn, cfg, shutdown,
            )
            .await
        }
    }
}

async fn serve(
    listen: String,
    passwd: Option<std::path::PathBuf>,
    resolver: Option<String>,
    cfg: Arc<TunnelConfig>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let auth = match passwd {
        Some(path) => {
            let raw = std::fs::read(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let users: HashMap<String, String> =
                serde_json::from_slice(&raw).context("failed to parse password file")?;
            Arc::new(Authenticator::new(users))
        }
        None => Arc::new(Authenticator::open()),
    };

    let ctx = Arc::new(ServerContext::new(Arc::new(TcpDialer), resolver, cfg));
    let listener = tokio::net::TcpListener::bind(&listen)
        .await
        .with_context(|| format!("failed to bind {listen}"))?;
    tracing::info!(%listen, "tunnel server listening");

    tunnel::server::serve(listener, auth, ctx, shutdown)
        .await
        .context("server accept loop failed")
}

#[allow(clippy::too_many_arguments)]
async fn forward(
    listen: String,
    servers: Vec<String>,
    target: String,
    username: String,
    password: String,
    min_sess: usize,
    max_conn: usize,
    cfg: Arc<TunnelConfig>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let dialer = Dialer::new(
        PoolConfig {
            min_sess,
            max_conn,
            ..PoolConfig::default()
        },
        cfg,
    );
    for server in servers {
        dialer.add_endpoint(Endpoint::new(
            Arc::new(TcpDialer),
            server,
            username.clone(),
            password.clone(),
        ));
    }

    let listener = tokio::net::TcpListener::bind(&listen)
        .await
        .with_context(|| format!("failed to bind {listen}"))?;
    tracing::info!(%listen, %target, "forwarding local port through the tunnel");

    loop {
        let (mut socket, addr) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(err) => {
                    tracing::error!(%err, "accept failed");
                    continue;
                }
            },
            _ = shutdown.cancelled() => return Ok(()),
        };

        let dialer = dialer.clone();
        let target = target.clone();
        tokio::spawn(async move {
            match dialer.dial("tcp", &target).await {
                Ok(mut conn) => {
                    tracing::debug!(%addr, %target, "splicing");
                    let _ = tokio::io::copy_bidirectional(&mut socket, &mut conn).await;
                }
                Err(err) => tracing::warn!(%addr, %target, %err, "tunnel dial failed"),
            }
        });
    }
}
