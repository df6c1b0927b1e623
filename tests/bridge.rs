//! End-to-end bridge scenarios over real TCP
//!
//! Each test starts a rotator listener backed by a stub upstream source and
//! a fake upstream HTTP proxy, then drives the client side of the wire
//! protocol.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use magpie::error::Result;
use magpie::models::{Protocol, RotatingProxy, RotatorNext, TransportProtocol};
use magpie::rotator::server::RotatorServer;
use magpie::rotator::UpstreamSource;

/// Upstream source that always hands out the same proxy
struct StubSource {
    next: RotatorNext,
}

#[async_trait]
impl UpstreamSource for StubSource {
    async fn next(&self, _user_id: i64, _rotator_id: i64) -> Result<RotatorNext> {
        Ok(self.next.clone())
    }
}

fn rotator(listen_protocol: Protocol, listen_port: u16, auth_required: bool) -> RotatingProxy {
    RotatingProxy {
        id: 42,
        user_id: 7,
        name: "bridge-test".to_string(),
        instance_id: "test-instance".to_string(),
        instance_name: "test-instance".to_string(),
        instance_region: "Unknown".to_string(),
        protocol: Protocol::Http,
        listen_protocol,
        transport: TransportProtocol::Tcp,
        listen_transport: TransportProtocol::Tcp,
        uptime_filter: None,
        listen_port,
        auth_required,
        auth_username: if auth_required {
            "rot-user".to_string()
        } else {
            String::new()
        },
        auth_password: if auth_required {
            "rot-pass".to_string()
        } else {
            String::new()
        },
        reputation_labels: Vec::new(),
        last_proxy_id: None,
        last_rotation_at: None,
        created_at: Utc::now(),
    }
}

fn stub_source(upstream_port: u16) -> Arc<dyn UpstreamSource> {
    Arc::new(StubSource {
        next: RotatorNext {
            proxy_id: 1,
            ip: "127.0.0.1".to_string(),
            port: upstream_port,
            username: String::new(),
            password: String::new(),
            has_auth: false,
            protocol: Protocol::Http,
        },
    })
}

async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Fake upstream HTTP proxy: accepts one CONNECT, then plays the remote
/// peer in the tunnel (expects "ping", answers "pong").
async fn spawn_fake_upstream(expected_target: &'static str) -> (u16, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let task = tokio::spawn(async move {
        let (mut conn, _) = listener.accept().await.unwrap();

        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            conn.read_exact(&mut byte).await.unwrap();
            head.push(byte[0]);
        }
        let head = String::from_utf8_lossy(&head).into_owned();
        assert!(
            head.starts_with(&format!("CONNECT {} HTTP/1.1\r\n", expected_target)),
            "unexpected CONNECT head: {head}"
        );

        conn.write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
            .await
            .unwrap();

        let mut ping = [0u8; 4];
        conn.read_exact(&mut ping).await.unwrap();
        assert_eq!(&ping, b"ping");
        conn.write_all(b"pong").await.unwrap();
        conn.flush().await.unwrap();
    });

    (port, task)
}

async fn read_http_head(conn: &mut TcpStream) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        conn.read_exact(&mut byte).await.unwrap();
        head.push(byte[0]);
    }
    String::from_utf8_lossy(&head).into_owned()
}

// S1: HTTP CONNECT bridge with bidirectional forwarding.
#[tokio::test]
async fn test_http_connect_bridge() {
    let (upstream_port, upstream_task) = spawn_fake_upstream("example.com:443").await;

    let listen_port = free_port().await;
    let server = RotatorServer::start(
        rotator(Protocol::Http, listen_port, false),
        stub_source(upstream_port),
    )
    .await
    .unwrap();

    let mut client = TcpStream::connect(("127.0.0.1", listen_port)).await.unwrap();
    client
        .write_all(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n")
        .await
        .unwrap();

    let head = read_http_head(&mut client).await;
    assert!(
        head.starts_with("HTTP/1.1 200 Connection Established\r\n"),
        "unexpected response head: {head}"
    );
    assert!(
        head.contains("Proxy-Agent: Magpie Rotator"),
        "missing Proxy-Agent header: {head}"
    );

    client.write_all(b"ping").await.unwrap();
    let mut pong = [0u8; 4];
    client.read_exact(&mut pong).await.unwrap();
    assert_eq!(&pong, b"pong");

    upstream_task.await.unwrap();
    server.stop().await;
}

// S2: SOCKS5 with username/password auth, then CONNECT and pipe.
#[tokio::test]
async fn test_socks5_bridge_with_auth() {
    let (upstream_port, upstream_task) = spawn_fake_upstream("example.com:80").await;

    let listen_port = free_port().await;
    let server = RotatorServer::start(
        rotator(Protocol::Socks5, listen_port, true),
        stub_source(upstream_port),
    )
    .await
    .unwrap();

    let mut client = TcpStream::connect(("127.0.0.1", listen_port)).await.unwrap();

    // Greeting: only username/password offered
    client.write_all(&[0x05, 0x01, 0x02]).await.unwrap();
    let mut selected = [0u8; 2];
    client.read_exact(&mut selected).await.unwrap();
    assert_eq!(selected, [0x05, 0x02]);

    // RFC 1929 credentials
    let mut auth = vec![0x01, 0x08];
    auth.extend_from_slice(b"rot-user");
    auth.push(0x08);
    auth.extend_from_slice(b"rot-pass");
    client.write_all(&auth).await.unwrap();
    let mut auth_reply = [0u8; 2];
    client.read_exact(&mut auth_reply).await.unwrap();
    assert_eq!(auth_reply, [0x01, 0x00]);

    // CONNECT example.com:80 via domain address
    let mut request = vec![0x05, 0x01, 0x00, 0x03, 0x0B];
    request.extend_from_slice(b"example.com");
    request.extend_from_slice(&[0x00, 0x50]);
    client.write_all(&request).await.unwrap();

    let mut reply = [0u8; 10];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply[..4], &[0x05, 0x00, 0x00, 0x01]);

    client.write_all(b"ping").await.unwrap();
    let mut pong = [0u8; 4];
    client.read_exact(&mut pong).await.unwrap();
    assert_eq!(&pong, b"pong");

    upstream_task.await.unwrap();
    server.stop().await;
}

// SOCKS5 rejects bad credentials with (0x01, 0x01).
#[tokio::test]
async fn test_socks5_rejects_invalid_credentials() {
    let listen_port = free_port().await;
    let server = RotatorServer::start(
        rotator(Protocol::Socks5, listen_port, true),
        stub_source(1), // never reached
    )
    .await
    .unwrap();

    let mut client = TcpStream::connect(("127.0.0.1", listen_port)).await.unwrap();

    client.write_all(&[0x05, 0x01, 0x02]).await.unwrap();
    let mut selected = [0u8; 2];
    client.read_exact(&mut selected).await.unwrap();
    assert_eq!(selected, [0x05, 0x02]);

    let mut auth = vec![0x01, 0x08];
    auth.extend_from_slice(b"rot-user");
    auth.push(0x05);
    auth.extend_from_slice(b"wrong");
    client.write_all(&auth).await.unwrap();

    let mut auth_reply = [0u8; 2];
    client.read_exact(&mut auth_reply).await.unwrap();
    assert_eq!(auth_reply, [0x01, 0x01]);

    server.stop().await;
}

// S3: SOCKS4 with user ident auth, reply echoes the request address.
#[tokio::test]
async fn test_socks4_bridge_with_ident() {
    let (upstream_port, upstream_task) = spawn_fake_upstream("1.1.1.1:1080").await;

    let listen_port = free_port().await;
    let server = RotatorServer::start(
        rotator(Protocol::Socks4, listen_port, true),
        stub_source(upstream_port),
    )
    .await
    .unwrap();

    let mut client = TcpStream::connect(("127.0.0.1", listen_port)).await.unwrap();

    let mut request = vec![0x04, 0x01, 0x04, 0x38, 1, 1, 1, 1];
    request.extend_from_slice(b"rot-user:rot-pass");
    request.push(0x00);
    client.write_all(&request).await.unwrap();

    let mut reply = [0u8; 8];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, [0x00, 0x5A, 0x04, 0x38, 1, 1, 1, 1]);

    client.write_all(b"ping").await.unwrap();
    let mut pong = [0u8; 4];
    client.read_exact(&mut pong).await.unwrap();
    assert_eq!(&pong, b"pong");

    upstream_task.await.unwrap();
    server.stop().await;
}

// SOCKS4 rejects a wrong ident with 0x5B before selecting an upstream.
#[tokio::test]
async fn test_socks4_rejects_wrong_ident() {
    let listen_port = free_port().await;
    let server = RotatorServer::start(
        rotator(Protocol::Socks4, listen_port, true),
        stub_source(1), // never reached
    )
    .await
    .unwrap();

    let mut client = TcpStream::connect(("127.0.0.1", listen_port)).await.unwrap();

    let mut request = vec![0x04, 0x01, 0x00, 0x50, 1, 1, 1, 1];
    request.extend_from_slice(b"intruder");
    request.push(0x00);
    client.write_all(&request).await.unwrap();

    let mut reply = [0u8; 8];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply[..2], &[0x00, 0x5B]);

    server.stop().await;
}

// HTTP listener demands credentials before bridging.
#[tokio::test]
async fn test_http_auth_challenge() {
    let listen_port = free_port().await;
    let server = RotatorServer::start(
        rotator(Protocol::Http, listen_port, true),
        stub_source(1), // never reached
    )
    .await
    .unwrap();

    let mut client = TcpStream::connect(("127.0.0.1", listen_port)).await.unwrap();
    client
        .write_all(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n")
        .await
        .unwrap();

    let head = read_http_head(&mut client).await;
    assert!(
        head.starts_with("HTTP/1.1 407"),
        "expected 407 challenge, got: {head}"
    );
    assert!(
        head.contains("Proxy-Authenticate: Basic realm=\"Magpie Rotator\""),
        "missing challenge header: {head}"
    );

    server.stop().await;
}
