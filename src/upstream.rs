//! Upstream proxy plumbing shared by the checker and the rotator bridges
//!
//! Dials upstream proxies (with the TLS-then-plain fallback for proxies
//! labeled `https`), performs the cross-protocol tunnel handshakes
//! (HTTP CONNECT, SOCKS4/4a, SOCKS5) and pipes established tunnels.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::error::{MagpieError, Result};
use crate::models::{Protocol, Proxy, RotatorNext};

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Byte stream to an upstream proxy, TLS-wrapped or plain
pub trait UpstreamStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send + 'static> UpstreamStream for T {}

pub type BoxedStream = Box<dyn UpstreamStream>;

/// An upstream proxy endpoint to dial through
#[derive(Debug, Clone)]
pub struct UpstreamProxy {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub protocol: Protocol,
}

impl UpstreamProxy {
    pub fn from_next(next: &RotatorNext) -> Self {
        Self {
            host: next.ip.clone(),
            port: next.port,
            username: next.username.clone(),
            password: next.password.clone(),
            protocol: next.protocol,
        }
    }

    pub fn from_proxy(proxy: &Proxy, protocol: Protocol) -> Self {
        Self {
            host: proxy.ip.clone(),
            port: proxy.port,
            username: proxy.username.clone(),
            password: proxy.password.clone(),
            protocol,
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn has_auth(&self) -> bool {
        !self.username.is_empty() && !self.password.is_empty()
    }

    fn basic_auth(&self) -> String {
        BASE64.encode(format!("{}:{}", self.username, self.password).as_bytes())
    }
}

/// Dial the upstream proxy's control channel.
///
/// Proxies labeled `https` get a TLS 1.3 attempt with certificate
/// verification disabled and a 5 s handshake deadline; on handshake failure
/// the dial falls back to plain TCP. Returns the stream and the local
/// socket address (the SOCKS5 listen bridge reports it as the bound
/// address).
pub async fn dial_upstream(proxy: &UpstreamProxy) -> Result<(BoxedStream, SocketAddr)> {
    let stream = tcp_connect(&proxy.addr()).await?;
    let local_addr = stream.local_addr()?;

    if proxy.protocol != Protocol::Https {
        return Ok((Box::new(stream), local_addr));
    }

    match tls_handshake_insecure(stream, &proxy.host).await {
        Ok(tls_stream) => Ok((Box::new(tls_stream), local_addr)),
        Err(e) => {
            debug!(addr = %proxy.addr(), "TLS attempt failed, falling back to TCP: {}", e);
            let fallback = tcp_connect(&proxy.addr()).await?;
            let local_addr = fallback.local_addr()?;
            Ok((Box::new(fallback), local_addr))
        }
    }
}

/// Establish a tunnel to `target` through the upstream proxy, dispatching on
/// the upstream protocol.
pub async fn connect_through_upstream(
    target_host: &str,
    target_port: u16,
    proxy: &UpstreamProxy,
) -> Result<(BoxedStream, SocketAddr)> {
    let (mut stream, local_addr) = dial_upstream(proxy).await?;

    match proxy.protocol {
        Protocol::Http | Protocol::Https => {
            perform_http_connect(&mut stream, target_host, target_port, proxy).await?;
        }
        Protocol::Socks5 => {
            perform_socks5_connect(&mut stream, target_host, target_port, proxy).await?;
        }
        Protocol::Socks4 => {
            perform_socks4_connect(&mut stream, target_host, target_port, proxy).await?;
        }
    }

    Ok((stream, local_addr))
}

/// Issue an HTTP CONNECT on an established upstream stream; success requires
/// a 200 status line.
pub async fn perform_http_connect(
    stream: &mut BoxedStream,
    target_host: &str,
    target_port: u16,
    proxy: &UpstreamProxy,
) -> Result<()> {
    let authority = format_authority(target_host, target_port);
    let mut request = format!(
        "CONNECT {} HTTP/1.1\r\nHost: {}\r\nProxy-Connection: Keep-Alive\r\n",
        authority, authority
    );
    if proxy.has_auth() {
        request.push_str(&format!(
            "Proxy-Authorization: Basic {}\r\n",
            proxy.basic_auth()
        ));
    }
    request.push_str("\r\n");

    stream
        .write_all(request.as_bytes())
        .await
        .map_err(|e| MagpieError::UpstreamHandshake(format!("CONNECT write failed: {}", e)))?;

    let head = read_http_head(stream).await?;
    let status_line = head.lines().next().unwrap_or("");
    if !status_line.starts_with("HTTP/1.1 200") && !status_line.starts_with("HTTP/1.0 200") {
        return Err(MagpieError::UpstreamReject(format!(
            "upstream returned non-200 response: {}",
            status_line
        )));
    }

    Ok(())
}

/// SOCKS5 CONNECT handshake against the upstream proxy (RFC 1928/1929)
pub async fn perform_socks5_connect(
    stream: &mut BoxedStream,
    target_host: &str,
    target_port: u16,
    proxy: &UpstreamProxy,
) -> Result<()> {
    let method: u8 = if proxy.has_auth() { 0x02 } else { 0x00 };
    stream
        .write_all(&[0x05, 0x01, method])
        .await
        .map_err(socks_write_err)?;

    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await.map_err(socks_read_err)?;
    if reply[0] != 0x05 {
        return Err(MagpieError::UpstreamHandshake(
            "invalid socks5 response from upstream".into(),
        ));
    }
    if reply[1] == 0xff {
        return Err(MagpieError::UpstreamAuth(
            "upstream socks5 proxy offered no acceptable authentication methods".into(),
        ));
    }
    if proxy.has_auth() && reply[1] != 0x02 {
        return Err(MagpieError::UpstreamHandshake(
            "upstream socks5 proxy does not accept username/password authentication".into(),
        ));
    }

    if proxy.has_auth() && reply[1] == 0x02 {
        send_socks5_credentials(stream, &proxy.username, &proxy.password).await?;
    }

    let (atyp, addr_bytes) = encode_socks5_address(target_host)?;
    let mut request = vec![0x05, 0x01, 0x00, atyp];
    request.extend_from_slice(&addr_bytes);
    request.extend_from_slice(&target_port.to_be_bytes());

    stream.write_all(&request).await.map_err(socks_write_err)?;

    let mut connect_reply = [0u8; 4];
    stream
        .read_exact(&mut connect_reply)
        .await
        .map_err(socks_read_err)?;
    if connect_reply[0] != 0x05 {
        return Err(MagpieError::UpstreamHandshake(
            "invalid socks5 connect reply".into(),
        ));
    }
    if connect_reply[1] != 0x00 {
        return Err(MagpieError::UpstreamReject(format!(
            "socks5 connect failed with code {}",
            connect_reply[1]
        )));
    }

    discard_socks5_bound_address(stream, connect_reply[3]).await
}

/// SOCKS4/4a CONNECT handshake; non-IP hosts use the 4a form with the
/// `0.0.0.1` marker address and a trailing hostname.
pub async fn perform_socks4_connect(
    stream: &mut BoxedStream,
    target_host: &str,
    target_port: u16,
    proxy: &UpstreamProxy,
) -> Result<()> {
    let (ip_bytes, domain) = match target_host.parse::<std::net::Ipv4Addr>() {
        Ok(ip) => (ip.octets(), None),
        Err(_) => ([0x00, 0x00, 0x00, 0x01], Some(target_host)),
    };

    let mut request = vec![0x04, 0x01];
    request.extend_from_slice(&target_port.to_be_bytes());
    request.extend_from_slice(&ip_bytes);
    if proxy.has_auth() {
        if proxy.password.is_empty() {
            request.extend_from_slice(proxy.username.as_bytes());
        } else {
            request.extend_from_slice(
                format!("{}:{}", proxy.username, proxy.password).as_bytes(),
            );
        }
    }
    request.push(0x00);
    if let Some(domain) = domain {
        request.extend_from_slice(domain.as_bytes());
        request.push(0x00);
    }

    stream.write_all(&request).await.map_err(socks_write_err)?;

    let mut reply = [0u8; 8];
    stream.read_exact(&mut reply).await.map_err(socks_read_err)?;
    if reply[1] != 0x5A {
        return Err(MagpieError::UpstreamReject(format!(
            "socks4 connect failed with code {:#04x}",
            reply[1]
        )));
    }

    Ok(())
}

/// Bridge two established connections. Two copy tasks run concurrently; the
/// pipe returns when either direction completes, and both sides are closed.
pub async fn pipe<A, B>(client: A, upstream: B)
where
    A: AsyncRead + AsyncWrite + Unpin + Send,
    B: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream);

    tokio::select! {
        result = tokio::io::copy(&mut client_read, &mut upstream_write) => {
            if let Err(e) = result {
                debug!("client to upstream copy ended: {}", e);
            }
        }
        result = tokio::io::copy(&mut upstream_read, &mut client_write) => {
            if let Err(e) = result {
                debug!("upstream to client copy ended: {}", e);
            }
        }
    }

    let _ = client_write.shutdown().await;
    let _ = upstream_write.shutdown().await;
}

/// Split a `host:port` target, bracketed IPv6 included
pub fn split_target(target: &str) -> Result<(String, u16)> {
    if let Some(rest) = target.strip_prefix('[') {
        let (host, port_part) = rest.split_once("]:").ok_or_else(|| {
            MagpieError::InvalidRequest(format!("invalid target address {:?}", target))
        })?;
        let port = port_part
            .parse()
            .map_err(|_| MagpieError::InvalidRequest(format!("invalid port in {:?}", target)))?;
        return Ok((host.to_string(), port));
    }

    let (host, port_part) = target.rsplit_once(':').ok_or_else(|| {
        MagpieError::InvalidRequest(format!("invalid target address {:?}", target))
    })?;
    let port = port_part
        .parse()
        .map_err(|_| MagpieError::InvalidRequest(format!("invalid port in {:?}", target)))?;
    Ok((host.to_string(), port))
}

/// `host:port`, bracketing bare IPv6 hosts
pub fn format_authority(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

async fn tcp_connect(addr: &str) -> Result<TcpStream> {
    let stream = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| MagpieError::UpstreamDial(format!("connect to {} timed out", addr)))?
        .map_err(|e| MagpieError::UpstreamDial(format!("connect to {} failed: {}", addr, e)))?;
    Ok(stream)
}

/// TLS 1.3 client handshake with verification disabled, bounded by the
/// 5 s handshake deadline.
async fn tls_handshake_insecure(
    stream: TcpStream,
    host: &str,
) -> Result<tokio_rustls::client::TlsStream<TcpStream>> {
    let config = rustls::ClientConfig::builder_with_protocol_versions(&[&rustls::version::TLS13])
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoVerify::new()))
        .with_no_client_auth();

    let server_name = server_name_for(host)?;
    let connector = TlsConnector::from(Arc::new(config));

    let tls_stream = tokio::time::timeout(
        TLS_HANDSHAKE_TIMEOUT,
        connector.connect(server_name, stream),
    )
    .await
    .map_err(|_| MagpieError::UpstreamHandshake("TLS handshake timed out".into()))?
    .map_err(|e| MagpieError::UpstreamHandshake(format!("TLS handshake failed: {}", e)))?;

    Ok(tls_stream)
}

fn server_name_for(host: &str) -> Result<ServerName<'static>> {
    match host.parse::<IpAddr>() {
        Ok(ip) => Ok(ServerName::IpAddress(ip.into())),
        Err(_) => ServerName::try_from(host.to_string())
            .map_err(|_| MagpieError::InvalidRequest(format!("invalid TLS server name {:?}", host))),
    }
}

async fn send_socks5_credentials(
    stream: &mut BoxedStream,
    username: &str,
    password: &str,
) -> Result<()> {
    if username.len() > 255 || password.len() > 255 {
        return Err(MagpieError::UpstreamHandshake(
            "socks5 credentials too long".into(),
        ));
    }

    let mut payload = vec![0x01, username.len() as u8];
    payload.extend_from_slice(username.as_bytes());
    payload.push(password.len() as u8);
    payload.extend_from_slice(password.as_bytes());

    stream.write_all(&payload).await.map_err(socks_write_err)?;

    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await.map_err(socks_read_err)?;
    if reply[1] != 0x00 {
        return Err(MagpieError::UpstreamAuth(
            "socks5 authentication failed".into(),
        ));
    }

    Ok(())
}

fn encode_socks5_address(host: &str) -> Result<(u8, Vec<u8>)> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(match ip {
            IpAddr::V4(v4) => (0x01, v4.octets().to_vec()),
            IpAddr::V6(v6) => (0x04, v6.octets().to_vec()),
        });
    }

    if host.is_empty() {
        return Err(MagpieError::InvalidRequest("empty target host".into()));
    }
    if host.len() > 255 {
        return Err(MagpieError::InvalidRequest("target hostname too long".into()));
    }

    let mut bytes = vec![host.len() as u8];
    bytes.extend_from_slice(host.as_bytes());
    Ok((0x03, bytes))
}

async fn discard_socks5_bound_address(stream: &mut BoxedStream, atyp: u8) -> Result<()> {
    let addr_len = match atyp {
        0x01 => 4,
        0x04 => 16,
        0x03 => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await.map_err(socks_read_err)?;
            len[0] as usize
        }
        _ => {
            return Err(MagpieError::UpstreamHandshake(
                "unsupported address type in socks5 reply".into(),
            ))
        }
    };

    let mut discard = vec![0u8; addr_len + 2];
    stream
        .read_exact(&mut discard)
        .await
        .map_err(socks_read_err)?;
    Ok(())
}

/// Read an HTTP response head (through the blank line) from a raw stream
async fn read_http_head(stream: &mut BoxedStream) -> Result<String> {
    let mut head = Vec::with_capacity(512);
    let mut byte = [0u8; 1];

    while !head.ends_with(b"\r\n\r\n") {
        if head.len() > 16 * 1024 {
            return Err(MagpieError::UpstreamHandshake(
                "upstream response head too large".into(),
            ));
        }
        let n = stream.read(&mut byte).await.map_err(socks_read_err)?;
        if n == 0 {
            return Err(MagpieError::UpstreamHandshake(
                "upstream closed during CONNECT response".into(),
            ));
        }
        head.push(byte[0]);
    }

    Ok(String::from_utf8_lossy(&head).into_owned())
}

fn socks_write_err(e: std::io::Error) -> MagpieError {
    MagpieError::UpstreamHandshake(format!("write failed: {}", e))
}

fn socks_read_err(e: std::io::Error) -> MagpieError {
    MagpieError::UpstreamHandshake(format!("read failed: {}", e))
}

/// Certificate verifier that accepts anything. Upstream proxy certificates
/// are routinely self-signed or mismatched.
#[derive(Debug)]
struct NoVerify;

impl NoVerify {
    const fn new() -> Self {
        Self
    }
}

impl ServerCertVerifier for NoVerify {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[test]
    fn test_split_target() {
        assert_eq!(
            split_target("example.com:443").unwrap(),
            ("example.com".to_string(), 443)
        );
        assert_eq!(
            split_target("192.0.2.1:80").unwrap(),
            ("192.0.2.1".to_string(), 80)
        );
        assert_eq!(
            split_target("[2001:db8::1]:8080").unwrap(),
            ("2001:db8::1".to_string(), 8080)
        );
        assert!(split_target("no-port").is_err());
        assert!(split_target("host:notaport").is_err());
    }

    #[test]
    fn test_format_authority() {
        assert_eq!(format_authority("example.com", 443), "example.com:443");
        assert_eq!(format_authority("2001:db8::1", 80), "[2001:db8::1]:80");
        assert_eq!(format_authority("[2001:db8::1]", 80), "[2001:db8::1]:80");
    }

    #[test]
    fn test_encode_socks5_address() {
        let (atyp, bytes) = encode_socks5_address("192.0.2.1").unwrap();
        assert_eq!(atyp, 0x01);
        assert_eq!(bytes, vec![192, 0, 2, 1]);

        let (atyp, bytes) = encode_socks5_address("2001:db8::1").unwrap();
        assert_eq!(atyp, 0x04);
        assert_eq!(bytes.len(), 16);

        let (atyp, bytes) = encode_socks5_address("example.com").unwrap();
        assert_eq!(atyp, 0x03);
        assert_eq!(bytes[0], 11);
        assert_eq!(&bytes[1..], b"example.com");

        assert!(encode_socks5_address("").is_err());
        assert!(encode_socks5_address(&"x".repeat(256)).is_err());
    }

    #[tokio::test]
    async fn test_pipe_forwards_both_directions_and_returns_on_close() {
        let (client_side, client_remote) = duplex(1024);
        let (upstream_side, upstream_remote) = duplex(1024);

        let pipe_task = tokio::spawn(pipe(client_side, upstream_side));

        let (mut client_remote_read, mut client_remote_write) =
            tokio::io::split(client_remote);
        let (mut upstream_remote_read, mut upstream_remote_write) =
            tokio::io::split(upstream_remote);

        client_remote_write.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        upstream_remote_read.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        upstream_remote_write.write_all(b"pong").await.unwrap();
        let mut buf = [0u8; 4];
        client_remote_read.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        // Closing one direction finishes the pipe.
        client_remote_write.shutdown().await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), pipe_task)
            .await
            .expect("pipe did not return after one side closed")
            .unwrap();
    }

    #[tokio::test]
    async fn test_perform_socks4_connect_wire_format() {
        let (local, mut remote) = duplex(1024);
        let mut stream: BoxedStream = Box::new(local);

        let proxy = UpstreamProxy {
            host: "10.0.0.1".to_string(),
            port: 1080,
            username: "user".to_string(),
            password: "pass".to_string(),
            protocol: Protocol::Socks4,
        };

        let handshake = tokio::spawn(async move {
            perform_socks4_connect(&mut stream, "example.com", 80, &proxy).await
        });

        // Request: VER CMD PORT 0.0.0.1 ident NUL domain NUL
        let mut request = vec![0u8; 8 + 9 + 1 + 11 + 1];
        remote.read_exact(&mut request).await.unwrap();
        assert_eq!(&request[..2], &[0x04, 0x01]);
        assert_eq!(&request[2..4], &80u16.to_be_bytes());
        assert_eq!(&request[4..8], &[0x00, 0x00, 0x00, 0x01]);
        assert_eq!(&request[8..17], b"user:pass");
        assert_eq!(request[17], 0x00);
        assert_eq!(&request[18..29], b"example.com");
        assert_eq!(request[29], 0x00);

        remote
            .write_all(&[0x00, 0x5A, 0, 0, 0, 0, 0, 0])
            .await
            .unwrap();

        handshake.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_perform_socks5_connect_with_auth() {
        let (local, mut remote) = duplex(1024);
        let mut stream: BoxedStream = Box::new(local);

        let proxy = UpstreamProxy {
            host: "10.0.0.1".to_string(),
            port: 1080,
            username: "u".to_string(),
            password: "p".to_string(),
            protocol: Protocol::Socks5,
        };

        let handshake = tokio::spawn(async move {
            perform_socks5_connect(&mut stream, "192.0.2.5", 443, &proxy).await
        });

        let mut greeting = [0u8; 3];
        remote.read_exact(&mut greeting).await.unwrap();
        assert_eq!(greeting, [0x05, 0x01, 0x02]);
        remote.write_all(&[0x05, 0x02]).await.unwrap();

        // RFC 1929 credentials
        let mut auth = [0u8; 5];
        remote.read_exact(&mut auth).await.unwrap();
        assert_eq!(auth, [0x01, 0x01, b'u', 0x01, b'p']);
        remote.write_all(&[0x01, 0x00]).await.unwrap();

        let mut request = [0u8; 10];
        remote.read_exact(&mut request).await.unwrap();
        assert_eq!(&request[..4], &[0x05, 0x01, 0x00, 0x01]);
        assert_eq!(&request[4..8], &[192, 0, 2, 5]);
        assert_eq!(&request[8..10], &443u16.to_be_bytes());

        remote
            .write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
            .await
            .unwrap();

        handshake.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_perform_http_connect_rejects_non_200() {
        let (local, mut remote) = duplex(1024);
        let mut stream: BoxedStream = Box::new(local);

        let proxy = UpstreamProxy {
            host: "10.0.0.1".to_string(),
            port: 3128,
            username: String::new(),
            password: String::new(),
            protocol: Protocol::Http,
        };

        let handshake = tokio::spawn(async move {
            perform_http_connect(&mut stream, "example.com", 443, &proxy).await
        });

        let mut buf = vec![0u8; 512];
        let n = remote.read(&mut buf).await.unwrap();
        let request = String::from_utf8_lossy(&buf[..n]).into_owned();
        assert!(request.starts_with("CONNECT example.com:443 HTTP/1.1\r\n"));
        assert!(request.contains("Proxy-Connection: Keep-Alive\r\n"));

        remote
            .write_all(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n")
            .await
            .unwrap();

        let result = handshake.await.unwrap();
        assert!(matches!(result, Err(MagpieError::UpstreamReject(_))));
    }
}
