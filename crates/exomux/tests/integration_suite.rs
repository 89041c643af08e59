//! Integration tests for exomux over loopback sockets.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use bytes::BytesMut;
use rand::Rng;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::net::UdpSocket;

use exomux::Context;
use exomux::Error;
use exomux::FrameParser;
use exomux::GetOptions;
use exomux::LengthDelimited;
use exomux::Pool;
use exomux::PoolConfig;
use exomux::encode_frame;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn opts(id: u32) -> GetOptions {
    GetOptions::new(LengthDelimited::new(), id)
}

/// A TCP server that echoes every frame back on the stream it came from.
struct EchoServer {
    address: String,
    accepted: Arc<AtomicUsize>,
}

impl EchoServer {
    async fn start() -> anyhow::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let address = listener.local_addr()?.to_string();
        let accepted = Arc::new(AtomicUsize::new(0));

        let counter = accepted.clone();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(echo(socket));
            }
        });

        Ok(Self { address, accepted })
    }

    fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }
}

async fn echo(mut socket: tokio::net::TcpStream) {
    let mut parser = LengthDelimited::new();
    let mut buf = BytesMut::with_capacity(4096);
    loop {
        match socket.read_buf(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
        while let Ok(Some(frame)) = parser.decode(&mut buf) {
            let Ok(reply) = encode_frame(frame.stream_id, &frame.payload) else {
                return;
            };
            if socket.write_all(&reply).await.is_err() {
                return;
            }
        }
    }
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// --- Test 1: Byte-Exact Round Trip ---

#[tokio::test]
async fn test_tcp_round_trip() -> anyhow::Result<()> {
    init_tracing();
    let server = EchoServer::start().await?;
    let pool = Pool::new(PoolConfig::local_network());
    let ctx = Context::with_timeout(Duration::from_secs(5));

    let stream = pool.get_virtual_conn(&ctx, "tcp", &server.address, opts(1)).await?;
    let payload: Vec<u8> = {
        let mut rng = rand::thread_rng();
        (0..64 * 1024).map(|_| rng.r#gen()).collect()
    };
    stream.write(&encode_frame(1, &payload)?).await?;

    let echoed = stream.read().await?;
    assert_eq!(&echoed[..], &payload[..]);
    assert_eq!(stream.remote_addr().as_deref(), Some(server.address.as_str()));
    Ok(())
}

// --- Test 2: Interleaved Streams Stay Separate ---

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_interleaved_streams() -> anyhow::Result<()> {
    init_tracing();
    let server = EchoServer::start().await?;
    let pool = Pool::new(PoolConfig::local_network());

    let mut tasks = Vec::new();
    for id in 1..=8u32 {
        let pool = pool.clone();
        let address = server.address.clone();
        tasks.push(tokio::spawn(async move {
            let ctx = Context::with_timeout(Duration::from_secs(5));
            let stream = pool.get_virtual_conn(&ctx, "tcp", &address, opts(id)).await?;
            for round in 0..20u32 {
                let message = format!("stream {} round {}", id, round);
                stream.write(&encode_frame(id, message.as_bytes())?).await?;
                let reply = stream.read().await?;
                assert_eq!(&reply[..], message.as_bytes());
            }
            anyhow::Ok(())
        }));
    }
    for task in tasks {
        task.await??;
    }

    assert_eq!(server.accepted(), 1);
    Ok(())
}

// --- Test 3: Fan-Out Beyond The Stream Limit ---

#[tokio::test]
async fn test_fan_out_over_stream_limit() -> anyhow::Result<()> {
    init_tracing();
    let server = EchoServer::start().await?;
    let limit = 3;
    let pool = Pool::new(PoolConfig::local_network().with_max_streams_per_conn(limit));
    let ctx = Context::with_timeout(Duration::from_secs(5));

    let mut streams = Vec::new();
    for id in 0..(2 * limit as u32 + 1) {
        streams.push(pool.get_virtual_conn(&ctx, "tcp", &server.address, opts(id)).await?);
    }

    let conns: HashSet<u64> = streams.iter().map(|s| s.connection().id()).collect();
    assert!(conns.len() >= 3);
    assert!(streams.iter().all(|s| s.connection().stream_count() <= limit));

    let stats = pool.host_stats();
    assert_eq!(stats.len(), 1);
    assert_eq!(stats[0].streams, streams.len());
    Ok(())
}

// --- Test 4: Two Streams Per Connection ---

#[tokio::test]
async fn test_streams_share_connections_up_to_limit() -> anyhow::Result<()> {
    init_tracing();
    let server = EchoServer::start().await?;
    let pool = Pool::new(PoolConfig::local_network().with_max_streams_per_conn(2));
    let ctx = Context::with_timeout(Duration::from_secs(5));

    let s1 = pool.get_virtual_conn(&ctx, "tcp", &server.address, opts(1)).await?;
    let s2 = pool.get_virtual_conn(&ctx, "tcp", &server.address, opts(2)).await?;
    let s3 = pool.get_virtual_conn(&ctx, "tcp", &server.address, opts(3)).await?;

    assert_eq!(s1.local_addr(), s2.local_addr());
    assert_ne!(s1.local_addr(), s3.local_addr());

    for stream in [&s1, &s2, &s3] {
        stream.write(&encode_frame(stream.id(), b"hi")?).await?;
        assert_eq!(&stream.read().await?[..], b"hi");
    }
    assert_eq!(server.accepted(), 2);
    Ok(())
}

// --- Test 5: Cascading Teardown ---

#[tokio::test]
async fn test_closing_everything_removes_host() -> anyhow::Result<()> {
    init_tracing();
    let server = EchoServer::start().await?;
    let pool = Pool::new(PoolConfig::local_network());
    let ctx = Context::background();

    let s1 = pool.get_virtual_conn(&ctx, "tcp", &server.address, opts(1)).await?;
    let s2 = pool.get_virtual_conn(&ctx, "tcp", &server.address, opts(2)).await?;
    assert!(pool.contains_host("tcp", &server.address));

    let conn = s1.connection();
    s1.close();
    s2.close();
    assert_eq!(conn.stream_count(), 0);

    conn.close();
    eventually("host removal", || !pool.contains_host("tcp", &server.address)).await;
    assert!(pool.host_stats().is_empty());
    Ok(())
}

// --- Test 6: Duplicate Identifiers ---

#[tokio::test]
async fn test_duplicate_stream_id_rejected() -> anyhow::Result<()> {
    init_tracing();
    let server = EchoServer::start().await?;
    let pool = Pool::new(PoolConfig::local_network());
    let ctx = Context::background();

    let _first = pool.get_virtual_conn(&ctx, "tcp", &server.address, opts(42)).await?;
    let second = pool.get_virtual_conn(&ctx, "tcp", &server.address, opts(42)).await;
    assert_eq!(second.unwrap_err(), Error::DuplicateStreamId(42));
    Ok(())
}

// --- Test 7: Refused Dial ---

#[tokio::test]
async fn test_refused_dial_gives_up() -> anyhow::Result<()> {
    init_tracing();
    let address = {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        listener.local_addr()?.to_string()
    };
    let pool = Pool::new(PoolConfig::local_network().with_reconnect(1, Duration::from_secs(1)));

    let err = pool
        .get_virtual_conn(&Context::background(), "tcp", &address, opts(1))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Dial(_)), "got {:?}", err);
    eventually("host removal", || !pool.contains_host("tcp", &address)).await;
    Ok(())
}

// --- Test 8: Server Goes Away ---

#[tokio::test]
async fn test_peer_disconnect_fails_stream() -> anyhow::Result<()> {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let address = listener.local_addr()?.to_string();
    tokio::spawn(async move {
        // Hang up on the first connection once it has sent something.
        if let Ok((mut socket, _)) = listener.accept().await {
            let mut buf = [0u8; 64];
            let _ = socket.read(&mut buf).await;
        }
    });

    let pool = Pool::new(PoolConfig::local_network().with_reconnect(0, Duration::from_secs(1)));
    let stream = pool
        .get_virtual_conn(&Context::background(), "tcp", &address, opts(1))
        .await?;
    stream.write(&encode_frame(1, b"bye")?).await?;

    let err = stream.read().await.unwrap_err();
    assert!(matches!(err, Error::ConnectionLost(_) | Error::Io(_)), "got {:?}", err);
    eventually("host removal", || !pool.contains_host("tcp", &address)).await;
    Ok(())
}

// --- Test 9: Local Address Binding ---

#[tokio::test]
async fn test_local_addr_binding() -> anyhow::Result<()> {
    init_tracing();
    let server = EchoServer::start().await?;
    let pool = Pool::new(PoolConfig::local_network());

    let stream = pool
        .get_virtual_conn(
            &Context::background(),
            "tcp4",
            &server.address,
            opts(1).with_local_addr("127.0.0.1:0"),
        )
        .await?;
    let local = stream.local_addr().unwrap_or_default();
    assert!(local.starts_with("127.0.0.1:"), "bound to {}", local);
    Ok(())
}

// --- Test 10: UDP ---

#[tokio::test]
async fn test_udp_round_trip() -> anyhow::Result<()> {
    init_tracing();
    let socket = UdpSocket::bind("127.0.0.1:0").await?;
    let address = socket.local_addr()?.to_string();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 64 * 1024];
        while let Ok((n, peer)) = socket.recv_from(&mut buf).await {
            let _ = socket.send_to(&buf[..n], peer).await;
        }
    });

    let pool = Pool::new(PoolConfig::local_network());
    let ctx = Context::with_timeout(Duration::from_secs(5));
    let a = pool.get_virtual_conn(&ctx, "udp", &address, opts(1)).await?;
    let b = pool.get_virtual_conn(&ctx, "udp", &address, opts(2)).await?;

    a.write(&encode_frame(1, b"first")?).await?;
    b.write(&encode_frame(2, b"second")?).await?;
    assert_eq!(&a.read().await?[..], b"first");
    assert_eq!(&b.read().await?[..], b"second");
    assert_eq!(a.connection().id(), b.connection().id());
    Ok(())
}

// --- Test 11: Unix Sockets ---

#[cfg(unix)]
#[tokio::test]
async fn test_unix_round_trip() -> anyhow::Result<()> {
    init_tracing();
    let path = std::env::temp_dir().join(format!(
        "exomux-{}-{}.sock",
        std::process::id(),
        rand::random::<u32>()
    ));
    let listener = tokio::net::UnixListener::bind(&path)?;
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = socket.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });

    let pool = Pool::new(PoolConfig::local_network());
    let address = path.display().to_string();
    let stream = pool
        .get_virtual_conn(&Context::with_timeout(Duration::from_secs(5)), "unix", &address, opts(5))
        .await?;
    stream.write(&encode_frame(5, b"over unix")?).await?;
    assert_eq!(&stream.read().await?[..], b"over unix");

    drop(stream);
    pool.close();
    let _ = std::fs::remove_file(&path);
    Ok(())
}

// --- Test 12: Shared Default Pool ---

#[tokio::test]
async fn test_default_pool() -> anyhow::Result<()> {
    init_tracing();
    let server = EchoServer::start().await?;
    assert!(std::ptr::eq(exomux::default_pool(), exomux::default_pool()));

    let stream = exomux::default_pool()
        .get_virtual_conn(&Context::with_timeout(Duration::from_secs(5)), "tcp", &server.address, opts(9))
        .await?;
    stream.write(&encode_frame(9, b"default")?).await?;
    assert_eq!(&stream.read().await?[..], b"default");
    Ok(())
}
