//! End-to-end tunnel scenarios over loopback TCP: a real echo server, a
//! real tunnel server, and client fabrics dialed against them.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tunnel::frame::{Errno, Frame, FrameCodec, FrameType, Syn};
use tunnel::{auth, Authenticator, ByteStream, Conn};
use tunnel::{Error, Fabric, Handler, Role, ServerContext, Session, TcpDialer, TunnelConfig};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tunnel=debug".into()),
        )
        .with_test_writer()
        .try_init();
}

/// A TCP echo server on an ephemeral loopback port.
async fn spawn_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => {
                            if socket.write_all(&buf[..n]).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

/// A tunnel server on an ephemeral loopback port.
async fn spawn_server(
    auth: Authenticator,
    cfg: Arc<TunnelConfig>,
    customize: impl FnOnce(&mut ServerContext),
) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let mut ctx = ServerContext::new(Arc::new(TcpDialer), None, cfg);
    customize(&mut ctx);
    tokio::spawn(tunnel::server::serve(
        listener,
        Arc::new(auth),
        Arc::new(ctx),
        CancellationToken::new(),
    ));
    addr
}

/// Dial and authenticate a client session against a tunnel server.
async fn client_session(
    server: SocketAddr,
    username: &str,
    password: &str,
    cfg: Arc<TunnelConfig>,
) -> Result<Session, Error> {
    let stream = TcpStream::connect(server).await?;
    let stream: Box<dyn ByteStream> = Box::new(stream);
    let mut framed = Framed::new(stream, FrameCodec);
    auth::client_handshake(&mut framed, username, password, &cfg).await?;
    Fabric::spawn(framed, Role::Client, cfg)
}

async fn echo_roundtrip(conn: &mut Conn, rounds: usize) {
    for i in 0..rounds {
        let payload = format!("foobar{i}");
        conn.write_all(payload.as_bytes()).await.unwrap();

        let mut buf = vec![0u8; payload.len()];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, payload.as_bytes());
    }
}

/// Wait for a condition that settles asynchronously (FIN round-trips,
/// reapers, background creations).
async fn eventually(mut check: impl FnMut() -> bool, what: &str) {
    for _ in 0..100 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {what}");
}

/// A handler that accepts and then sits on the stream forever, never
/// reading and never closing.
struct SinkHandler;

#[async_trait::async_trait]
impl Handler for SinkHandler {
    async fn serve(&self, conn: Conn) -> anyhow::Result<()> {
        conn.accept().await?;
        std::future::pending::<()>().await;
        Ok(())
    }
}

#[tokio::test]
async fn test_echo_over_one_stream() {
    init_tracing();
    let cfg = Arc::new(TunnelConfig::default());
    let echo = spawn_echo().await;
    let server = spawn_server(Authenticator::open(), cfg.clone(), |_| {}).await;

    let session = client_session(server, "", "", cfg).await.unwrap();
    let mut conn = session.dial("tcp", &echo.to_string()).await.unwrap();

    echo_roundtrip(&mut conn, 100).await;

    conn.close().await.unwrap();
    eventually(|| session.is_empty(), "stream removal").await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_concurrent_streams_share_one_fabric() {
    init_tracing();
    let cfg = Arc::new(TunnelConfig::default());
    let echo = spawn_echo().await;
    let server = spawn_server(Authenticator::open(), cfg.clone(), |_| {}).await;
    let session = client_session(server, "", "", cfg).await.unwrap();

    let mut tasks = Vec::new();
    for _ in 0..10 {
        let session = session.clone();
        let echo = echo.to_string();
        tasks.push(tokio::spawn(async move {
            let mut conn = session.dial("tcp", &echo).await.unwrap();
            echo_roundtrip(&mut conn, 100).await;
            conn.close().await.unwrap();
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert!(!session.is_closed());
    eventually(|| session.is_empty(), "all streams removed").await;
}

#[tokio::test]
async fn test_auth_failure_closes_substrate() {
    init_tracing();
    let cfg = Arc::new(TunnelConfig::default());
    let users = HashMap::from([("alice".to_string(), "secret".to_string())]);
    let server = spawn_server(Authenticator::new(users), cfg.clone(), |_| {}).await;

    match client_session(server, "alice", "wrong", cfg.clone()).await {
        Err(Error::AuthFailed) => (),
        other => panic!("expected AuthFailed, got {other:?}"),
    }

    // Correct credentials still work on a fresh substrate.
    let session = client_session(server, "alice", "secret", cfg).await.unwrap();
    assert!(!session.is_closed());
}

#[tokio::test]
async fn test_unknown_network_refused_in_band() {
    init_tracing();
    let cfg = Arc::new(TunnelConfig::default());
    let server = spawn_server(Authenticator::open(), cfg.clone(), |_| {}).await;
    let session = client_session(server, "", "", cfg).await.unwrap();

    match session.dial("gopher", "example.com:70").await {
        Err(Error::UnknownNetwork(network)) => assert_eq!(network, "gopher"),
        other => panic!("expected UnknownNetwork, got {other:?}"),
    }
    // The refusal is per-stream: the fabric survives.
    assert!(!session.is_closed());
    assert!(session.is_empty());
}

#[tokio::test]
async fn test_connect_failure_surfaced() {
    init_tracing();
    // Dialing a port nothing listens on must come back as CONNFAILED.
    let cfg = Arc::new(TunnelConfig {
        dial_timeout: Duration::from_secs(5),
        ..TunnelConfig::default()
    });
    let server = spawn_server(Authenticator::open(), cfg.clone(), |_| {}).await;
    let session = client_session(server, "", "", cfg).await.unwrap();

    match session.dial("tcp", "127.0.0.1:1").await {
        Err(Error::ConnFailed) => (),
        other => panic!("expected ConnFailed, got {other:?}"),
    }
    eventually(|| session.is_empty(), "failed stream removal").await;
}

#[tokio::test]
async fn test_duplicate_syn_answers_idexist() {
    init_tracing();
    let cfg = Arc::new(TunnelConfig::default());
    let echo = spawn_echo().await;
    let server = spawn_server(Authenticator::open(), cfg.clone(), |_| {}).await;

    // Speak the wire protocol by hand to inject the duplicate SYN.
    let stream = TcpStream::connect(server).await.unwrap();
    let stream: Box<dyn ByteStream> = Box::new(stream);
    let mut framed = Framed::new(stream, FrameCodec);
    auth::client_handshake(&mut framed, "", "", &cfg).await.unwrap();

    use futures::{SinkExt, TryStreamExt};
    let syn = Syn {
        network: "tcp".to_string(),
        address: echo.to_string(),
    };
    framed.send(Frame::syn(0, &syn).unwrap()).await.unwrap();
    let reply = framed.try_next().await.unwrap().unwrap();
    assert_eq!(reply.frame_type, FrameType::Result);
    assert_eq!(reply.streamid, 0);
    assert_eq!(reply.decode_result().unwrap(), Errno::None);

    // Same id again while the first stream is ESTAB.
    framed.send(Frame::syn(0, &syn).unwrap()).await.unwrap();
    let reply = framed.try_next().await.unwrap().unwrap();
    assert_eq!(reply.frame_type, FrameType::Result);
    assert_eq!(reply.decode_result().unwrap(), Errno::IdExist);

    // The original stream is untouched: data still echoes. The server may
    // interleave WND renewals with the echoed payload; skip them.
    framed
        .send(Frame::data(0, Bytes::from_static(b"still alive")))
        .await
        .unwrap();
    let reply = loop {
        let frame = framed.try_next().await.unwrap().unwrap();
        if frame.frame_type != FrameType::Wnd {
            break frame;
        }
    };
    assert_eq!(reply.frame_type, FrameType::Data);
    assert_eq!(&reply.data[..], b"still alive");
}

#[tokio::test]
async fn test_half_close_reaper_resets_stream() {
    init_tracing();
    let cfg = Arc::new(TunnelConfig {
        close_timeout: Duration::from_millis(200),
        ..TunnelConfig::default()
    });
    let server = spawn_server(Authenticator::open(), cfg.clone(), |ctx| {
        ctx.register("sink", Arc::new(SinkHandler));
    })
    .await;
    let session = client_session(server, "", "", cfg).await.unwrap();

    let mut conn = session.dial("sink", "nowhere:0").await.unwrap();
    conn.write_all(b"going away").await.unwrap();
    conn.close().await.unwrap();
    assert_eq!(conn.status_name(), "FIN_SENT");

    // The peer never closes its half; the reaper must upgrade to a reset
    // and reclaim the table slot.
    eventually(|| session.is_empty(), "reaper sweep").await;
    assert_eq!(conn.status_name(), "UNKNOWN");
}

#[tokio::test]
async fn test_close_is_idempotent() {
    init_tracing();
    let cfg = Arc::new(TunnelConfig::default());
    let echo = spawn_echo().await;
    let server = spawn_server(Authenticator::open(), cfg.clone(), |_| {}).await;
    let session = client_session(server, "", "", cfg).await.unwrap();

    let mut conn = session.dial("tcp", &echo.to_string()).await.unwrap();
    conn.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    conn.read_exact(&mut buf).await.unwrap();

    conn.close().await.unwrap();
    // Echo sees our EOF, closes back, and the stream settles in UNKNOWN.
    eventually(|| conn.status_name() == "UNKNOWN", "close settle").await;
    conn.close().await.unwrap();
    assert_eq!(conn.status_name(), "UNKNOWN");

    // Writing after close is a broken pipe.
    let err = conn.write_all(b"nope").await.unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::BrokenPipe);
}

#[tokio::test]
async fn test_window_exhaustion_blocks_writer() {
    init_tracing();
    let window = 64 * 1024u32;
    let cfg = Arc::new(TunnelConfig {
        window_size: window,
        ..TunnelConfig::default()
    });
    let server = spawn_server(Authenticator::open(), cfg.clone(), |ctx| {
        ctx.register("sink", Arc::new(SinkHandler));
    })
    .await;
    let session = client_session(server, "", "", cfg).await.unwrap();
    let mut conn = session.dial("sink", "nowhere:0").await.unwrap();

    // Exactly one window's worth goes through without any renewal.
    let payload = vec![0x5a; window as usize];
    tokio::time::timeout(Duration::from_secs(5), conn.write_all(&payload))
        .await
        .expect("a full window must not block")
        .unwrap();

    // The next byte has no credit and must park until a WND arrives,
    // which the sink never sends.
    let blocked = tokio::time::timeout(Duration::from_millis(300), conn.write_all(b"x")).await;
    assert!(blocked.is_err(), "write beyond the window must block");
}

#[tokio::test]
async fn test_myip_reports_peer_address() {
    init_tracing();
    let cfg = Arc::new(TunnelConfig::default());
    let server = spawn_server(Authenticator::open(), cfg.clone(), |_| {}).await;
    let session = client_session(server, "", "", cfg).await.unwrap();

    let mut conn = session.dial("myip", "").await.unwrap();
    let mut reported = String::new();
    conn.read_to_string(&mut reported).await.unwrap();

    let reported: SocketAddr = reported.parse().unwrap();
    assert_eq!(reported, session.local_addr());
}

#[tokio::test]
async fn test_dns_exchange_roundtrip() {
    init_tracing();

    // A stub resolver: echo the query back with the QR bit set.
    let resolver = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let resolver_addr = resolver.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = resolver.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut len = [0u8; 2];
                if socket.read_exact(&mut len).await.is_err() {
                    return;
                }
                let mut msg = vec![0u8; u16::from_be_bytes(len) as usize];
                if socket.read_exact(&mut msg).await.is_err() {
                    return;
                }
                msg[2] |= 0x80;
                let _ = socket.write_all(&len).await;
                let _ = socket.write_all(&msg).await;
            });
        }
    });

    let cfg = Arc::new(TunnelConfig::default());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let server_addr = listener.local_addr().unwrap();
    let ctx = ServerContext::new(
        Arc::new(TcpDialer),
        Some(resolver_addr.to_string()),
        cfg.clone(),
    );
    tokio::spawn(tunnel::server::serve(
        listener,
        Arc::new(Authenticator::open()),
        Arc::new(ctx),
        CancellationToken::new(),
    ));

    let session = client_session(server_addr, "", "", cfg).await.unwrap();

    // A minimal DNS header (id 0xbeef, QR clear) plus padding.
    let mut query = vec![0u8; 16];
    query[0] = 0xbe;
    query[1] = 0xef;
    let response = session.dns_exchange(Bytes::from(query)).await.unwrap();

    assert_eq!(&response[..2], &[0xbe, 0xef]);
    assert_ne!(response[2] & 0x80, 0, "response must carry the QR bit");
    eventually(|| session.is_empty(), "dns waiter removal").await;
}
