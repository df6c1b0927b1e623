//! HTTP/3 rotator listener
//!
//! Serves plain proxy requests over QUIC (ALPN "h3", TLS 1.3, the
//! per-process self-signed certificate). CONNECT is rejected with 405;
//! datagrams are enabled only for the `quic` transport flavor.

use std::sync::Arc;

use bytes::{Buf, Bytes, BytesMut};
use http_body_util::{BodyExt, Full};
use hyper::{Method, Request, Response, StatusCode};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::models::RotatingProxy;
use crate::upstream::{self, UpstreamProxy};

use super::handler::RotatorHandler;
use super::UpstreamSource;

pub async fn serve(
    endpoint: quinn::Endpoint,
    rotator: RotatingProxy,
    source: Arc<dyn UpstreamSource>,
    enable_datagrams: bool,
    mut shutdown: watch::Receiver<bool>,
) {
    let handler = Arc::new(RotatorHandler::new(rotator.clone(), source.clone()));

    info!(
        rotator_id = rotator.id,
        port = rotator.listen_port,
        "HTTP/3 rotator listening"
    );

    loop {
        tokio::select! {
            incoming = endpoint.accept() => {
                let Some(incoming) = incoming else { break };
                let handler = handler.clone();
                let source = source.clone();
                tokio::spawn(async move {
                    match incoming.await {
                        Ok(conn) => {
                            serve_connection(conn, handler, source, enable_datagrams).await;
                        }
                        Err(e) => debug!("HTTP/3 handshake failed: {}", e),
                    }
                });
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    // HTTP/3 shuts down immediately, no drain.
    endpoint.close(0u32.into(), b"shutting down");
    info!(rotator_id = rotator.id, "HTTP/3 rotator stopped");
}

async fn serve_connection(
    conn: quinn::Connection,
    handler: Arc<RotatorHandler>,
    source: Arc<dyn UpstreamSource>,
    enable_datagrams: bool,
) {
    let mut builder = h3::server::builder();
    builder.enable_datagram(enable_datagrams);

    let mut h3_conn = match builder
        .build::<_, Bytes>(h3_quinn::Connection::new(conn))
        .await
    {
        Ok(conn) => conn,
        Err(e) => {
            debug!("HTTP/3 connection setup failed: {}", e);
            return;
        }
    };

    loop {
        match h3_conn.accept().await {
            Ok(Some(resolver)) => {
                let handler = handler.clone();
                let source = source.clone();
                tokio::spawn(async move {
                    let (req, stream) = match resolver.resolve_request().await {
                        Ok(resolved) => resolved,
                        Err(e) => {
                            debug!("HTTP/3 request resolution failed: {}", e);
                            return;
                        }
                    };
                    if let Err(e) = handle_request(req, stream, handler, source).await {
                        debug!("HTTP/3 request failed: {}", e);
                    }
                });
            }
            Ok(None) => break,
            Err(e) => {
                debug!("HTTP/3 accept ended: {}", e);
                break;
            }
        }
    }
}

async fn handle_request(
    req: Request<()>,
    mut stream: h3::server::RequestStream<h3_quinn::BidiStream<Bytes>, Bytes>,
    handler: Arc<RotatorHandler>,
    source: Arc<dyn UpstreamSource>,
) -> Result<(), h3::error::StreamError> {
    // CONNECT has no tunnel semantics worth supporting over HTTP/3 here.
    if req.method() == Method::CONNECT {
        let response = Response::builder()
            .status(StatusCode::METHOD_NOT_ALLOWED)
            .body(())
            .unwrap_or_default();
        stream.send_response(response).await?;
        stream
            .send_data(Bytes::from_static(
                b"CONNECT is not supported for HTTP/3 rotators",
            ))
            .await?;
        return stream.finish().await;
    }

    if !handler.client_authorized(&req) {
        let response = Response::builder()
            .status(StatusCode::PROXY_AUTHENTICATION_REQUIRED)
            .header("Proxy-Authenticate", "Basic realm=\"Magpie Rotator\"")
            .body(())
            .unwrap_or_default();
        stream.send_response(response).await?;
        stream
            .send_data(Bytes::from_static(b"Proxy authentication required"))
            .await?;
        return stream.finish().await;
    }

    // Drain the request body before forwarding.
    let mut body = BytesMut::new();
    while let Some(mut chunk) = stream.recv_data().await? {
        let bytes = chunk.copy_to_bytes(chunk.remaining());
        body.extend_from_slice(&bytes);
    }

    let rotator = handler.rotator();
    let response = match source.next(rotator.user_id, rotator.id).await {
        Ok(next) => {
            match forward(req, body.freeze(), &next).await {
                Ok(response) => response,
                Err(e) => {
                    warn!(rotator_id = rotator.id, "HTTP/3 upstream request failed: {}", e);
                    plain_response(StatusCode::BAD_GATEWAY, "upstream proxy request failed")
                }
            }
        }
        Err(e) => {
            debug!(rotator_id = rotator.id, "No upstream available: {}", e);
            plain_response(StatusCode::BAD_GATEWAY, "failed to acquire upstream proxy")
        }
    };

    let (parts, body) = response.into_parts();
    stream.send_response(Response::from_parts(parts, ())).await?;
    if !body.is_empty() {
        stream.send_data(body).await?;
    }
    stream.finish().await
}

/// Forward a buffered HTTP/3 request through the next upstream over HTTP/1.1
async fn forward(
    req: Request<()>,
    body: Bytes,
    next: &crate::models::RotatorNext,
) -> crate::error::Result<Response<Bytes>> {
    use crate::error::MagpieError;
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
    use hyper::header::{CONNECTION, PROXY_AUTHORIZATION};
    use hyper_util::rt::TokioIo;

    let (parts, ()) = req.into_parts();

    let authority = parts
        .uri
        .authority()
        .map(|a| a.to_string())
        .or_else(|| {
            parts
                .headers
                .get(hyper::header::HOST)
                .and_then(|v| v.to_str().ok())
                .map(String::from)
        })
        .ok_or_else(|| MagpieError::InvalidRequest("missing target authority".into()))?;

    let (host, port) = upstream::split_target(&authority)
        .unwrap_or_else(|_| (authority.clone(), 80));

    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    let upstream_proxy = UpstreamProxy::from_next(next);
    let (stream, absolute_form) = match next.protocol {
        crate::models::Protocol::Http | crate::models::Protocol::Https => {
            let (stream, _) = upstream::dial_upstream(&upstream_proxy).await?;
            (stream, true)
        }
        _ => {
            let (stream, _) =
                upstream::connect_through_upstream(&host, port, &upstream_proxy).await?;
            (stream, false)
        }
    };

    let io = TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
        .await
        .map_err(|e| MagpieError::UpstreamHandshake(format!("handshake failed: {}", e)))?;
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!("Upstream connection ended: {}", e);
        }
    });

    let uri = if absolute_form {
        format!("http://{}{}", authority, path)
    } else {
        path
    };

    let mut builder = Request::builder().method(parts.method.clone()).uri(&uri);
    for (name, value) in &parts.headers {
        if name == PROXY_AUTHORIZATION {
            continue;
        }
        builder = builder.header(name, value);
    }
    builder = builder.header(CONNECTION, "close");
    if absolute_form && next.has_auth {
        let auth = BASE64.encode(format!("{}:{}", next.username, next.password).as_bytes());
        builder = builder.header(PROXY_AUTHORIZATION, format!("Basic {}", auth));
    }

    let upstream_req = builder
        .body(Full::new(body))
        .map_err(|e| MagpieError::InvalidRequest(format!("failed to build request: {}", e)))?;

    let response = sender
        .send_request(upstream_req)
        .await
        .map_err(|e| MagpieError::Http(format!("upstream request failed: {}", e)))?;

    let (resp_parts, resp_body) = response.into_parts();
    let resp_bytes = resp_body
        .collect()
        .await
        .map_err(|e| MagpieError::Http(format!("failed to read response: {}", e)))?
        .to_bytes();

    Ok(Response::from_parts(resp_parts, resp_bytes))
}

fn plain_response(status: StatusCode, message: &'static str) -> Response<Bytes> {
    Response::builder()
        .status(status)
        .body(Bytes::from_static(message.as_bytes()))
        .unwrap_or_default()
}

/// quinn endpoint for a rotator port; datagram support follows the
/// transport flavor.
pub fn build_endpoint(
    listen_port: u16,
    tls: Arc<rustls::ServerConfig>,
    enable_datagrams: bool,
) -> crate::error::Result<quinn::Endpoint> {
    use crate::error::MagpieError;

    let quic_crypto = quinn::crypto::rustls::QuicServerConfig::try_from((*tls).clone())
        .map_err(|e| MagpieError::Crypto(format!("QUIC TLS config failed: {}", e)))?;

    let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(quic_crypto));
    if let Some(transport) = Arc::get_mut(&mut server_config.transport) {
        if enable_datagrams {
            transport.datagram_receive_buffer_size(Some(64 * 1024));
        } else {
            transport.datagram_receive_buffer_size(None);
        }
    }

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], listen_port));
    let endpoint = quinn::Endpoint::server(server_config, addr).map_err(|e| {
        error!(port = listen_port, "Failed to bind HTTP/3 endpoint: {}", e);
        MagpieError::Io(e)
    })?;

    Ok(endpoint)
}
