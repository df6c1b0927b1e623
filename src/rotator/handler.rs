//! HTTP-side rotator bridges: client auth, the plain-HTTP bridge and the
//! CONNECT bridge.

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::ext::ReasonPhrase;
use hyper::header::{HeaderValue, CONNECTION, HOST, PROXY_AUTHENTICATE, PROXY_AUTHORIZATION};
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tracing::{debug, instrument, warn};

use crate::error::{MagpieError, Result};
use crate::models::{Protocol, RotatingProxy, RotatorNext};
use crate::upstream::{self, UpstreamProxy};

use super::UpstreamSource;

const PROXY_AGENT: &str = "Magpie Rotator";
const AUTH_CHALLENGE: &str = "Basic realm=\"Magpie Rotator\"";

pub struct RotatorHandler {
    rotator: RotatingProxy,
    source: Arc<dyn UpstreamSource>,
}

impl RotatorHandler {
    pub fn new(rotator: RotatingProxy, source: Arc<dyn UpstreamSource>) -> Self {
        Self { rotator, source }
    }

    pub fn rotator(&self) -> &RotatingProxy {
        &self.rotator
    }

    /// Entry point for one request on a TCP/HTTP listener
    #[instrument(skip(self, req), fields(rotator_id = self.rotator.id, method = %req.method()))]
    pub async fn handle(self: Arc<Self>, req: Request<Incoming>) -> Response<Full<Bytes>> {
        if !self.client_authorized(&req) {
            return auth_required_response();
        }

        if req.method() == Method::CONNECT {
            self.handle_connect(req).await
        } else {
            self.handle_http(req).await
        }
    }

    /// Validate `Proxy-Authorization: Basic` against the rotator credentials
    pub fn client_authorized<B>(&self, req: &Request<B>) -> bool {
        if !self.rotator.auth_required {
            return true;
        }

        let header = match req
            .headers()
            .get(PROXY_AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
        {
            Some(value) => value.trim(),
            None => return false,
        };

        let encoded = match header.split_once(' ') {
            Some((scheme, rest)) if scheme.eq_ignore_ascii_case("basic") => rest,
            _ => return false,
        };

        let decoded = match BASE64.decode(encoded) {
            Ok(bytes) => bytes,
            Err(_) => return false,
        };
        let credentials = String::from_utf8_lossy(&decoded);

        match credentials.split_once(':') {
            Some((user, pass)) => {
                user == self.rotator.auth_username && pass == self.rotator.auth_password
            }
            None => false,
        }
    }

    /// Plain (non-CONNECT) bridge: buffer the body, rebuild an absolute
    /// target, strip the client's proxy auth and forward through the next
    /// upstream. Keep-alives stay disabled end to end.
    async fn handle_http(&self, req: Request<Incoming>) -> Response<Full<Bytes>> {
        let next = match self.source.next(self.rotator.user_id, self.rotator.id).await {
            Ok(next) => next,
            Err(e) => {
                debug!(rotator_id = self.rotator.id, "No upstream available: {}", e);
                return error_response(StatusCode::BAD_GATEWAY, "failed to acquire upstream proxy");
            }
        };

        match forward_http(req, &next).await {
            Ok(response) => response,
            Err(e) => {
                warn!(rotator_id = self.rotator.id, "Upstream request failed: {}", e);
                error_response(StatusCode::BAD_GATEWAY, "upstream proxy request failed")
            }
        }
    }

    /// CONNECT bridge: establish the upstream tunnel first, then accept the
    /// upgrade and pipe bytes until either side finishes.
    async fn handle_connect(&self, req: Request<Incoming>) -> Response<Full<Bytes>> {
        let target = match req.uri().authority() {
            Some(authority) => authority.to_string(),
            None => {
                return error_response(StatusCode::BAD_REQUEST, "CONNECT requires an authority")
            }
        };

        let (host, port) = match upstream::split_target(&target) {
            Ok(parts) => parts,
            Err(_) => (target.clone(), 443),
        };

        let next = match self.source.next(self.rotator.user_id, self.rotator.id).await {
            Ok(next) => next,
            Err(e) => {
                debug!(rotator_id = self.rotator.id, "No upstream available: {}", e);
                return error_response(StatusCode::BAD_GATEWAY, "failed to acquire upstream proxy");
            }
        };

        let upstream_proxy = UpstreamProxy::from_next(&next);
        let (upstream_conn, _) =
            match upstream::connect_through_upstream(&host, port, &upstream_proxy).await {
                Ok(established) => established,
                Err(e) => {
                    warn!(rotator_id = self.rotator.id, "Upstream CONNECT failed: {}", e);
                    return error_response(StatusCode::BAD_GATEWAY, "upstream CONNECT failed");
                }
            };

        let rotator_id = self.rotator.id;
        tokio::spawn(async move {
            match hyper::upgrade::on(req).await {
                Ok(upgraded) => {
                    upstream::pipe(TokioIo::new(upgraded), upstream_conn).await;
                }
                Err(e) => {
                    debug!(rotator_id, "CONNECT upgrade failed: {}", e);
                }
            }
        });

        connect_established_response()
    }
}

/// Forward one buffered request through the upstream proxy and buffer the
/// response back.
pub(crate) async fn forward_http(
    req: Request<Incoming>,
    next: &RotatorNext,
) -> Result<Response<Full<Bytes>>> {
    let (parts, body) = req.into_parts();

    let body_bytes = body
        .collect()
        .await
        .map_err(|e| MagpieError::InvalidRequest(format!("failed to read body: {}", e)))?
        .to_bytes();

    // Absolute-form target for the upstream hop; relative URIs are rebuilt
    // from the Host header.
    let (target_uri, target_host, target_port) = resolve_target(&parts)?;

    let upstream_proxy = UpstreamProxy::from_next(next);

    let (stream, absolute_form) = match next.protocol {
        Protocol::Http | Protocol::Https => {
            let (stream, _) = upstream::dial_upstream(&upstream_proxy).await?;
            (stream, true)
        }
        Protocol::Socks4 | Protocol::Socks5 => {
            let (stream, _) =
                upstream::connect_through_upstream(&target_host, target_port, &upstream_proxy)
                    .await?;
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
        target_uri
    } else {
        parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string())
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
        .body(Full::new(body_bytes))
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

    Ok(Response::from_parts(resp_parts, Full::new(resp_bytes)))
}

/// Absolute target URI, host and port for a proxied plain request
fn resolve_target(parts: &http::request::Parts) -> Result<(String, String, u16)> {
    if let Some(authority) = parts.uri.authority() {
        let host = authority.host().to_string();
        let port = authority.port_u16().unwrap_or(80);
        return Ok((parts.uri.to_string(), host, port));
    }

    let host_header = parts
        .headers
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| MagpieError::InvalidRequest("missing Host header".into()))?;

    let (host, port) = match upstream::split_target(host_header) {
        Ok(parts) => parts,
        Err(_) => (host_header.to_string(), 80),
    };

    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    Ok((format!("http://{}{}", host_header, path), host, port))
}

/// `407` with the rotator's Basic challenge
pub(crate) fn auth_required_response() -> Response<Full<Bytes>> {
    let mut response = Response::builder()
        .status(StatusCode::PROXY_AUTHENTICATION_REQUIRED)
        .body(Full::new(Bytes::from("Proxy authentication required")))
        .unwrap_or_default();
    response
        .headers_mut()
        .insert(PROXY_AUTHENTICATE, HeaderValue::from_static(AUTH_CHALLENGE));
    response
}

/// The CONNECT success preamble:
/// `HTTP/1.1 200 Connection Established` + `Proxy-Agent: Magpie Rotator`
fn connect_established_response() -> Response<Full<Bytes>> {
    let mut response = Response::builder()
        .status(StatusCode::OK)
        .header("Proxy-Agent", PROXY_AGENT)
        .body(Full::new(Bytes::new()))
        .unwrap_or_default();
    response
        .extensions_mut()
        .insert(ReasonPhrase::from_static(b"Connection Established"));
    response
}

fn error_response(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("Content-Type", "text/plain")
        .body(Full::new(Bytes::from(message.to_string())))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TransportProtocol;
    use chrono::Utc;

    struct NoSource;

    #[async_trait::async_trait]
    impl UpstreamSource for NoSource {
        async fn next(&self, _user_id: i64, _rotator_id: i64) -> Result<RotatorNext> {
            Err(MagpieError::NoAliveProxies)
        }
    }

    fn handler(auth_required: bool) -> RotatorHandler {
        RotatorHandler::new(
            RotatingProxy {
                id: 42,
                user_id: 7,
                name: "edge".to_string(),
                instance_id: "i".to_string(),
                instance_name: "i".to_string(),
                instance_region: "Unknown".to_string(),
                protocol: Protocol::Http,
                listen_protocol: Protocol::Http,
                transport: TransportProtocol::Tcp,
                listen_transport: TransportProtocol::Tcp,
                uptime_filter: None,
                listen_port: 20000,
                auth_required,
                auth_username: "rot-user".to_string(),
                auth_password: "rot-pass".to_string(),
                reputation_labels: Vec::new(),
                last_proxy_id: None,
                last_rotation_at: None,
                created_at: Utc::now(),
            },
            Arc::new(NoSource),
        )
    }

    fn request_with_auth(value: Option<&str>) -> Request<()> {
        let mut builder = Request::builder().uri("http://example.com/");
        if let Some(value) = value {
            builder = builder.header(PROXY_AUTHORIZATION, value);
        }
        builder.body(()).unwrap()
    }

    #[test]
    fn test_auth_disabled_allows_everything() {
        let handler = handler(false);
        assert!(handler.client_authorized(&request_with_auth(None)));
    }

    #[test]
    fn test_auth_required_rejects_missing_and_malformed() {
        let handler = handler(true);
        assert!(!handler.client_authorized(&request_with_auth(None)));
        assert!(!handler.client_authorized(&request_with_auth(Some("Bearer token"))));
        assert!(!handler.client_authorized(&request_with_auth(Some("Basic !!!"))));
    }

    #[test]
    fn test_auth_required_validates_credentials() {
        let handler = handler(true);

        let good = BASE64.encode(b"rot-user:rot-pass");
        assert!(handler.client_authorized(&request_with_auth(Some(&format!("Basic {}", good)))));

        let bad = BASE64.encode(b"rot-user:wrong");
        assert!(!handler.client_authorized(&request_with_auth(Some(&format!("Basic {}", bad)))));
    }

    #[test]
    fn test_auth_challenge_response() {
        let response = auth_required_response();
        assert_eq!(response.status(), StatusCode::PROXY_AUTHENTICATION_REQUIRED);
        assert_eq!(
            response.headers().get(PROXY_AUTHENTICATE).unwrap(),
            AUTH_CHALLENGE
        );
    }

    #[test]
    fn test_connect_established_reason_phrase() {
        let response = connect_established_response();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get("Proxy-Agent").unwrap(), PROXY_AGENT);
        assert_eq!(
            response.extensions().get::<ReasonPhrase>().unwrap().as_bytes(),
            b"Connection Established"
        );
    }
}
