//! Per-proxy probe
//!
//! Computes the union of owning users' enabled protocols, groups judge
//! requests so one HTTP exchange evaluates every regex in its bucket, and
//! produces one statistic per `(regex, protocol)` pair.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper::header;
use hyper::{Method, Request};
use hyper_util::rt::TokioIo;
use regex::Regex;
use rustls::pki_types::ServerName;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_socks::tcp::Socks5Stream;
use tracing::{debug, warn};

use crate::error::{MagpieError, Result};
use crate::models::{
    Judge, Protocol, Proxy, ProxyStatistic, QueuedProxy, RequestScheme,
};
use crate::upstream::{self, BoxedStream, UpstreamProxy};

use super::classify;
use super::CheckerContext;

/// One judge exchange evaluating several regexes for one protocol bucket
struct ProbeGroup {
    judge: Arc<Judge>,
    scheme: RequestScheme,
    protocol: Protocol,
    regexes: Vec<Regex>,
}

/// Probe a queued proxy over every protocol its owners enabled.
///
/// Returns the statistics to record; an empty vector when no owner has a
/// usable judge.
pub async fn probe(ctx: &CheckerContext, queued: &QueuedProxy) -> Vec<ProxyStatistic> {
    let mut groups: HashMap<(i64, RequestScheme, Protocol), ProbeGroup> = HashMap::new();

    for user in &queued.users {
        for protocol in user.enabled_protocols() {
            let scheme = RequestScheme::for_protocol(protocol, user.use_https_for_socks);

            let entry = match ctx.judges.next_judge(user.id, scheme) {
                Some(entry) => entry,
                None => {
                    warn!(
                        user_id = user.id,
                        scheme = %scheme,
                        "No judge available; skipping probe"
                    );
                    continue;
                }
            };

            let group = groups
                .entry((entry.judge.id, scheme, protocol))
                .or_insert_with(|| ProbeGroup {
                    judge: entry.judge.clone(),
                    scheme,
                    protocol,
                    regexes: Vec::new(),
                });
            if !group
                .regexes
                .iter()
                .any(|existing| existing.as_str() == entry.regex.as_str())
            {
                group.regexes.push(entry.regex.clone());
            }
        }
    }

    let timeout = Duration::from_millis(queued.max_timeout_ms());
    let retries = queued.max_retries();
    let country = ctx.geo.country(&queued.proxy.ip);
    let estimated_type = ctx.geo.estimated_type(&queued.proxy.ip);

    let mut stats = Vec::new();
    for group in groups.into_values() {
        let (outcome, response_time_ms, attempt) = check_with_retries(
            &queued.proxy,
            &group.judge,
            group.scheme,
            group.protocol,
            timeout,
            retries,
        )
        .await;

        if let Err(ref e) = outcome {
            debug!(
                proxy = %queued.proxy.addr(),
                protocol = %group.protocol,
                "Probe failed: {}", e
            );
        }

        for regex in &group.regexes {
            let mut stat = ProxyStatistic {
                id: 0,
                proxy_id: queued.proxy.id,
                protocol: group.protocol,
                judge_id: group.judge.id,
                alive: false,
                response_time_ms: response_time_ms as i32,
                attempt,
                level: None,
                country: country.clone(),
                estimated_type,
                created_at: chrono::Utc::now(),
            };

            if let Ok(body) = &outcome {
                if regex.is_match(body) {
                    stat.alive = true;
                    stat.level = Some(classify::anonymity_level(
                        body,
                        &ctx.config.public_ip,
                        &ctx.config.proxy_headers,
                    ));
                }
            }

            stats.push(stat);
        }
    }

    stats
}

/// Probe with retries. Each attempt is individually timed; the first
/// success returns with its 0-based attempt index, total failure returns
/// the last error with `attempt` set to the retry budget.
pub async fn check_with_retries(
    proxy: &Proxy,
    judge: &Judge,
    scheme: RequestScheme,
    protocol: Protocol,
    timeout: Duration,
    retries: u8,
) -> (Result<String>, i64, i16) {
    retry_probe(retries, || {
        probe_once(proxy, judge, scheme, protocol, timeout)
    })
    .await
}

/// Retry driver for a probe attempt. A retry budget of zero still performs
/// exactly one attempt.
pub async fn retry_probe<F, Fut>(retries: u8, mut attempt_fn: F) -> (Result<String>, i64, i16)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<String>>,
{
    let attempts = retries.max(1);
    let mut last_err = MagpieError::ProbeFailed("no attempt performed".into());
    let mut elapsed_ms = 0i64;

    for attempt in 0..attempts {
        let start = Instant::now();
        let result = attempt_fn().await;
        elapsed_ms = start.elapsed().as_millis() as i64;

        match result {
            Ok(body) => return (Ok(body), elapsed_ms, attempt as i16),
            Err(e) => last_err = e,
        }
    }

    (Err(last_err), elapsed_ms, retries as i16)
}

/// One probe attempt: reach the judge through the proxy using the checked
/// protocol, perform a single HTTP exchange and return the response body.
async fn probe_once(
    proxy: &Proxy,
    judge: &Judge,
    scheme: RequestScheme,
    protocol: Protocol,
    timeout: Duration,
) -> Result<String> {
    let exchange = async {
        match (protocol, scheme) {
            // HTTP proxies take the judge request in absolute form.
            (Protocol::Http | Protocol::Https, RequestScheme::Http) => {
                let stream = tcp_connect(&proxy.addr()).await?;
                let uri = format!(
                    "http://{}{}",
                    upstream::format_authority(judge.hostname(), judge.port()),
                    judge.path_and_query()
                );
                let proxy_auth = proxy.has_auth().then(|| basic_auth(proxy));
                http_exchange(stream, uri, judge.hostname().to_string(), proxy_auth).await
            }
            // HTTPS judges tunnel via CONNECT, then TLS with the judge's
            // hostname as SNI; the dial target pins the cached IP.
            (Protocol::Http | Protocol::Https, RequestScheme::Https) => {
                let stream = tcp_connect(&proxy.addr()).await?;
                let mut boxed: BoxedStream = Box::new(stream);
                let (target_host, target_port) = judge_target(judge);
                upstream::perform_http_connect(
                    &mut boxed,
                    &target_host,
                    target_port,
                    &UpstreamProxy::from_proxy(proxy, protocol),
                )
                .await?;
                let tls = judge_tls_connect(boxed, judge.hostname()).await?;
                http_exchange(
                    tls,
                    judge.path_and_query(),
                    judge.hostname().to_string(),
                    None,
                )
                .await
            }
            (Protocol::Socks5, _) => {
                let (target_host, target_port) = judge_target(judge);
                let socket = tcp_connect(&proxy.addr()).await?;
                let stream = if proxy.has_auth() {
                    Socks5Stream::connect_with_password_and_socket(
                        socket,
                        (target_host.as_str(), target_port),
                        &proxy.username,
                        &proxy.password,
                    )
                    .await
                } else {
                    Socks5Stream::connect_with_socket(
                        socket,
                        (target_host.as_str(), target_port),
                    )
                    .await
                }
                .map_err(|e| {
                    MagpieError::UpstreamHandshake(format!("SOCKS5 connect failed: {}", e))
                })?;

                finish_judge_exchange(stream.into_inner(), judge, scheme).await
            }
            (Protocol::Socks4, _) => {
                let (target_host, target_port) = judge_target(judge);
                let socket = tcp_connect(&proxy.addr()).await?;
                let mut boxed: BoxedStream = Box::new(socket);
                upstream::perform_socks4_connect(
                    &mut boxed,
                    &target_host,
                    target_port,
                    &UpstreamProxy::from_proxy(proxy, Protocol::Socks4),
                )
                .await?;

                finish_judge_exchange(boxed, judge, scheme).await
            }
        }
    };

    tokio::time::timeout(timeout, exchange)
        .await
        .map_err(|_| MagpieError::Timeout)?
}

/// Complete a tunneled judge exchange: TLS when the judge is HTTPS, then
/// the origin-form request.
async fn finish_judge_exchange<S>(stream: S, judge: &Judge, scheme: RequestScheme) -> Result<String>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    match scheme {
        RequestScheme::Https => {
            let tls = judge_tls_connect(stream, judge.hostname()).await?;
            http_exchange(tls, judge.path_and_query(), judge.hostname().to_string(), None).await
        }
        RequestScheme::Http => {
            http_exchange(
                stream,
                judge.path_and_query(),
                judge.hostname().to_string(),
                None,
            )
            .await
        }
    }
}

/// The judge endpoint to dial, preferring the pinned IP
fn judge_target(judge: &Judge) -> (String, u16) {
    match judge.ip() {
        Some(ip) => (ip.to_string(), judge.port()),
        None => (judge.hostname().to_string(), judge.port()),
    }
}

fn basic_auth(proxy: &Proxy) -> String {
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
    BASE64.encode(format!("{}:{}", proxy.username, proxy.password).as_bytes())
}

async fn tcp_connect(addr: &str) -> Result<TcpStream> {
    TcpStream::connect(addr)
        .await
        .map_err(|e| MagpieError::UpstreamDial(format!("connect to {} failed: {}", addr, e)))
}

/// One HTTP/1.1 request over an established stream; keep-alives are
/// irrelevant since the connection is dropped after the exchange.
async fn http_exchange<S>(
    stream: S,
    uri: String,
    host: String,
    proxy_auth: Option<String>,
) -> Result<String>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
        .await
        .map_err(|e| MagpieError::ProbeFailed(format!("handshake failed: {}", e)))?;

    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!("Probe connection ended: {}", e);
        }
    });

    let mut builder = Request::builder()
        .method(Method::GET)
        .uri(&uri)
        .header(header::HOST, &host)
        .header(header::CONNECTION, "close");
    if let Some(auth) = proxy_auth {
        builder = builder.header(header::PROXY_AUTHORIZATION, format!("Basic {}", auth));
    }

    let request = builder
        .body(Empty::<Bytes>::new())
        .map_err(|e| MagpieError::ProbeFailed(format!("request build failed: {}", e)))?;

    let response = sender
        .send_request(request)
        .await
        .map_err(|e| MagpieError::ProbeFailed(format!("request failed: {}", e)))?;

    let body = response
        .into_body()
        .collect()
        .await
        .map_err(|e| MagpieError::ProbeFailed(format!("body read failed: {}", e)))?
        .to_bytes();

    Ok(String::from_utf8_lossy(&body).into_owned())
}

/// TLS to a judge with real certificate verification, SNI = judge hostname
async fn judge_tls_connect<S>(
    stream: S,
    hostname: &str,
) -> Result<tokio_rustls::client::TlsStream<S>>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    static JUDGE_TLS: OnceLock<Arc<rustls::ClientConfig>> = OnceLock::new();
    let config = JUDGE_TLS
        .get_or_init(|| {
            let mut roots = rustls::RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            Arc::new(
                rustls::ClientConfig::builder()
                    .with_root_certificates(roots)
                    .with_no_client_auth(),
            )
        })
        .clone();

    let server_name = ServerName::try_from(hostname.to_string())
        .map_err(|_| MagpieError::InvalidRequest(format!("invalid judge hostname {:?}", hostname)))?;

    TlsConnector::from(config)
        .connect(server_name, stream)
        .await
        .map_err(|e| MagpieError::UpstreamHandshake(format!("judge TLS failed: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_retry_probe_zero_retries_is_one_attempt() {
        let calls = AtomicU32::new(0);

        let (result, _, attempt) = retry_probe(0, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(MagpieError::ProbeFailed("nope".into())) }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(result.is_err());
        assert_eq!(attempt, 0);
    }

    #[tokio::test]
    async fn test_retry_probe_stops_on_first_success() {
        let calls = AtomicU32::new(0);

        let (result, _, attempt) = retry_probe(3, || {
            let call = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if call == 1 {
                    Ok("body".to_string())
                } else {
                    Err(MagpieError::ProbeFailed("not yet".into()))
                }
            }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(result.unwrap(), "body");
        assert_eq!(attempt, 1);
    }

    #[tokio::test]
    async fn test_retry_probe_exhaustion_reports_retry_budget() {
        let calls = AtomicU32::new(0);

        let (result, _, attempt) = retry_probe(3, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(MagpieError::ProbeFailed("still down".into())) }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(result.is_err());
        assert_eq!(attempt, 3);
    }
}
