//! SOCKS4/4a and SOCKS5 listen-side bridges
//!
//! Raw TCP state machines dispatched per connection. Only CMD=CONNECT is
//! supported; reply codes follow RFC 1928 (`0x01` general failure, `0x05`
//! connection refused, `0x07` command not supported, `0x08` address type
//! not supported) and the SOCKS4 CD codes `0x5A`/`0x5B`.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use crate::models::{Protocol, RotatingProxy};
use crate::upstream::{self, UpstreamProxy};

use super::UpstreamSource;

const MAX_IDENT_LEN: usize = 512;

pub struct SocksHandler {
    rotator: RotatingProxy,
    source: Arc<dyn UpstreamSource>,
}

impl SocksHandler {
    pub fn new(rotator: RotatingProxy, source: Arc<dyn UpstreamSource>) -> Self {
        Self { rotator, source }
    }

    pub async fn handle(&self, conn: TcpStream) {
        let result = match self.rotator.listen_protocol {
            Protocol::Socks4 => self.handle_socks4(conn).await,
            _ => self.handle_socks5(conn).await,
        };

        if let Err(e) = result {
            debug!(rotator_id = self.rotator.id, "SOCKS connection ended: {}", e);
        }
    }

    async fn handle_socks5(&self, mut conn: TcpStream) -> std::io::Result<()> {
        let target = match self.socks5_handshake(&mut conn).await? {
            Some(target) => target,
            None => return Ok(()),
        };

        let next = match self.source.next(self.rotator.user_id, self.rotator.id).await {
            Ok(next) => next,
            Err(_) => {
                write_socks5_reply(&mut conn, 0x01).await?;
                return Ok(());
            }
        };

        let (host, port) = match upstream::split_target(&target) {
            Ok(parts) => parts,
            Err(_) => {
                write_socks5_reply(&mut conn, 0x01).await?;
                return Ok(());
            }
        };

        let upstream_proxy = UpstreamProxy::from_next(&next);
        let (upstream_conn, local_addr) =
            match upstream::connect_through_upstream(&host, port, &upstream_proxy).await {
                Ok(established) => established,
                Err(_) => {
                    write_socks5_reply(&mut conn, 0x05).await?;
                    return Ok(());
                }
            };

        write_socks5_success(&mut conn, local_addr).await?;
        upstream::pipe(conn, upstream_conn).await;
        Ok(())
    }

    /// Greeting, method negotiation, optional RFC 1929 auth, target parse.
    /// Returns `None` when the handshake failed and a reply was written.
    async fn socks5_handshake(&self, conn: &mut TcpStream) -> std::io::Result<Option<String>> {
        let mut header = [0u8; 2];
        conn.read_exact(&mut header).await?;
        if header[0] != 0x05 {
            write_socks5_reply(conn, 0x01).await?;
            return Ok(None);
        }

        let mut methods = vec![0u8; header[1] as usize];
        conn.read_exact(&mut methods).await?;

        let selected = if self.rotator.auth_required {
            methods.contains(&0x02).then_some(0x02)
        } else if methods.contains(&0x00) {
            Some(0x00)
        } else {
            // Client insists on auth even though none is required
            methods.contains(&0x02).then_some(0x02)
        };

        let selected = match selected {
            Some(method) => method,
            None => {
                conn.write_all(&[0x05, 0xff]).await?;
                return Ok(None);
            }
        };

        conn.write_all(&[0x05, selected]).await?;

        if selected == 0x02 && !self.verify_socks5_credentials(conn).await? {
            return Ok(None);
        }

        self.read_socks5_target(conn).await
    }

    async fn verify_socks5_credentials(&self, conn: &mut TcpStream) -> std::io::Result<bool> {
        let mut header = [0u8; 2];
        conn.read_exact(&mut header).await?;
        if header[0] != 0x01 {
            conn.write_all(&[0x01, 0x01]).await?;
            return Ok(false);
        }

        let mut username = vec![0u8; header[1] as usize];
        conn.read_exact(&mut username).await?;

        let mut pass_len = [0u8; 1];
        conn.read_exact(&mut pass_len).await?;
        let mut password = vec![0u8; pass_len[0] as usize];
        conn.read_exact(&mut password).await?;

        let valid = !self.rotator.auth_required
            || (username == self.rotator.auth_username.as_bytes()
                && password == self.rotator.auth_password.as_bytes());

        if !valid {
            conn.write_all(&[0x01, 0x01]).await?;
            return Ok(false);
        }

        conn.write_all(&[0x01, 0x00]).await?;
        Ok(true)
    }

    async fn read_socks5_target(&self, conn: &mut TcpStream) -> std::io::Result<Option<String>> {
        let mut header = [0u8; 4];
        conn.read_exact(&mut header).await?;

        if header[0] != 0x05 {
            write_socks5_reply(conn, 0x01).await?;
            return Ok(None);
        }
        if header[1] != 0x01 {
            write_socks5_reply(conn, 0x07).await?;
            return Ok(None);
        }

        let host = match header[3] {
            0x01 => {
                let mut ip = [0u8; 4];
                conn.read_exact(&mut ip).await?;
                std::net::Ipv4Addr::from(ip).to_string()
            }
            0x03 => {
                let mut len = [0u8; 1];
                conn.read_exact(&mut len).await?;
                let mut domain = vec![0u8; len[0] as usize];
                conn.read_exact(&mut domain).await?;
                String::from_utf8_lossy(&domain).into_owned()
            }
            0x04 => {
                let mut ip = [0u8; 16];
                conn.read_exact(&mut ip).await?;
                std::net::Ipv6Addr::from(ip).to_string()
            }
            _ => {
                write_socks5_reply(conn, 0x08).await?;
                return Ok(None);
            }
        };

        let mut port_bytes = [0u8; 2];
        conn.read_exact(&mut port_bytes).await?;
        let port = u16::from_be_bytes(port_bytes);

        Ok(Some(upstream::format_authority(&host, port)))
    }

    async fn handle_socks4(&self, mut conn: TcpStream) -> std::io::Result<()> {
        let mut header = [0u8; 8];
        conn.read_exact(&mut header).await?;

        let dst_port = [header[2], header[3]];
        let dst_ip = [header[4], header[5], header[6], header[7]];

        if header[0] != 0x04 || header[1] != 0x01 {
            write_socks4_response(&mut conn, 0x5B, dst_port, dst_ip).await?;
            return Ok(());
        }

        let ident = match read_nul_terminated(&mut conn).await? {
            Some(ident) => ident,
            None => {
                write_socks4_response(&mut conn, 0x5B, dst_port, dst_ip).await?;
                return Ok(());
            }
        };

        // SOCKS4a marker: 0.0.0.x with x != 0 means a hostname follows
        let target_host = if dst_ip[0] == 0 && dst_ip[1] == 0 && dst_ip[2] == 0 && dst_ip[3] != 0 {
            match read_nul_terminated(&mut conn).await? {
                Some(domain) => domain,
                None => {
                    write_socks4_response(&mut conn, 0x5B, dst_port, dst_ip).await?;
                    return Ok(());
                }
            }
        } else {
            std::net::Ipv4Addr::from(dst_ip).to_string()
        };

        if self.rotator.auth_required {
            let expected = if self.rotator.auth_password.is_empty() {
                self.rotator.auth_username.clone()
            } else {
                format!("{}:{}", self.rotator.auth_username, self.rotator.auth_password)
            };
            if ident != expected {
                write_socks4_response(&mut conn, 0x5B, dst_port, dst_ip).await?;
                return Ok(());
            }
        }

        let port = u16::from_be_bytes(dst_port);

        let next = match self.source.next(self.rotator.user_id, self.rotator.id).await {
            Ok(next) => next,
            Err(_) => {
                write_socks4_response(&mut conn, 0x5B, dst_port, dst_ip).await?;
                return Ok(());
            }
        };

        let upstream_proxy = UpstreamProxy::from_next(&next);
        let (upstream_conn, _) =
            match upstream::connect_through_upstream(&target_host, port, &upstream_proxy).await {
                Ok(established) => established,
                Err(_) => {
                    write_socks4_response(&mut conn, 0x5B, dst_port, dst_ip).await?;
                    return Ok(());
                }
            };

        write_socks4_response(&mut conn, 0x5A, dst_port, dst_ip).await?;
        upstream::pipe(conn, upstream_conn).await;
        Ok(())
    }
}

async fn read_nul_terminated(conn: &mut TcpStream) -> std::io::Result<Option<String>> {
    let mut bytes = Vec::new();
    let mut byte = [0u8; 1];

    loop {
        conn.read_exact(&mut byte).await?;
        if byte[0] == 0x00 {
            return Ok(Some(String::from_utf8_lossy(&bytes).into_owned()));
        }
        bytes.push(byte[0]);
        if bytes.len() > MAX_IDENT_LEN {
            return Ok(None);
        }
    }
}

pub(crate) async fn write_socks5_reply(conn: &mut TcpStream, code: u8) -> std::io::Result<()> {
    let mut reply = vec![0x05, code, 0x00, 0x01];
    reply.extend_from_slice(&[0, 0, 0, 0, 0, 0]);
    conn.write_all(&reply).await
}

pub(crate) async fn write_socks5_success(
    conn: &mut TcpStream,
    bound: SocketAddr,
) -> std::io::Result<()> {
    let mut reply = vec![0x05, 0x00, 0x00];
    match bound {
        SocketAddr::V4(addr) => {
            reply.push(0x01);
            reply.extend_from_slice(&addr.ip().octets());
        }
        SocketAddr::V6(addr) => {
            reply.push(0x04);
            reply.extend_from_slice(&addr.ip().octets());
        }
    }
    reply.extend_from_slice(&bound.port().to_be_bytes());
    conn.write_all(&reply).await
}

pub(crate) async fn write_socks4_response(
    conn: &mut TcpStream,
    status: u8,
    port: [u8; 2],
    ip: [u8; 4],
) -> std::io::Result<()> {
    let mut reply = vec![0x00, status];
    reply.extend_from_slice(&port);
    reply.extend_from_slice(&ip);
    conn.write_all(&reply).await
}
