//! Per-tenant rotator servers
//!
//! One server per rotator, on its leased port. Kind is determined by the
//! listen transport and protocol: TCP+HTTP, TCP+SOCKS, or QUIC/HTTP3.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::error::{MagpieError, Result};
use crate::models::{RotatingProxy, TransportProtocol};

use super::handler::RotatorHandler;
use super::socks::SocksHandler;
use super::{http3, tls, UpstreamSource};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// A running rotator listener. Stopping is idempotent by construction:
/// `stop` consumes the server.
pub struct RotatorServer {
    rotator_id: i64,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl RotatorServer {
    /// Bind and start serving. Bind failures surface here so the manager
    /// can log and skip the rotator without crashing the process.
    pub async fn start(
        rotator: RotatingProxy,
        source: Arc<dyn UpstreamSource>,
    ) -> Result<RotatorServer> {
        if !rotator.listen_config_valid() {
            return Err(MagpieError::Validation(
                "socks rotators require tcp transport".into(),
            ));
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let rotator_id = rotator.id;

        let task = if rotator.listen_transport.is_quic_based() {
            let tls_config = tls::rotator_tls_config()?;
            let enable_datagrams = rotator.listen_transport == TransportProtocol::Quic;
            let endpoint =
                http3::build_endpoint(rotator.listen_port, tls_config, enable_datagrams)?;
            tokio::spawn(http3::serve(
                endpoint,
                rotator,
                source,
                enable_datagrams,
                shutdown_rx,
            ))
        } else if rotator.listen_protocol.is_socks() {
            let listener = bind(rotator.listen_port).await?;
            tokio::spawn(serve_socks(listener, rotator, source, shutdown_rx))
        } else {
            let listener = bind(rotator.listen_port).await?;
            tokio::spawn(serve_http(listener, rotator, source, shutdown_rx))
        };

        Ok(RotatorServer {
            rotator_id,
            shutdown_tx,
            task,
        })
    }

    pub fn rotator_id(&self) -> i64 {
        self.rotator_id
    }

    /// Signal shutdown and wait for the accept loop to drain, up to 5 s.
    pub async fn stop(self) {
        let rotator_id = self.rotator_id;
        let _ = self.shutdown_tx.send(true);

        if tokio::time::timeout(DRAIN_TIMEOUT, self.task).await.is_err() {
            debug!(rotator_id, "Rotator server drain timed out");
        }

        info!(rotator_id, "Rotator server stopped");
    }
}

async fn bind(port: u16) -> Result<TcpListener> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    TcpListener::bind(addr).await.map_err(|e| {
        error!(port = port, "Failed to bind rotator listener: {}", e);
        MagpieError::Io(e)
    })
}

/// TCP listener serving the HTTP bridge (plain requests and CONNECT)
async fn serve_http(
    listener: TcpListener,
    rotator: RotatingProxy,
    source: Arc<dyn UpstreamSource>,
    mut shutdown: watch::Receiver<bool>,
) {
    let handler = Arc::new(RotatorHandler::new(rotator.clone(), source));
    info!(
        rotator_id = rotator.id,
        port = rotator.listen_port,
        "HTTP rotator listening"
    );

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _peer)) => {
                        let handler = handler.clone();
                        tokio::spawn(async move {
                            let io = TokioIo::new(stream);
                            let service = service_fn(move |req| {
                                let handler = handler.clone();
                                async move {
                                    Ok::<_, std::convert::Infallible>(handler.handle(req).await)
                                }
                            });

                            if let Err(e) = http1::Builder::new()
                                .preserve_header_case(true)
                                .title_case_headers(true)
                                .serve_connection(io, service)
                                .with_upgrades()
                                .await
                            {
                                debug!("Rotator connection ended: {}", e);
                            }
                        });
                    }
                    Err(e) => error!(rotator_id = rotator.id, "Accept error: {}", e),
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

/// Raw TCP accept loop dispatching to the SOCKS state machine
async fn serve_socks(
    listener: TcpListener,
    rotator: RotatingProxy,
    source: Arc<dyn UpstreamSource>,
    mut shutdown: watch::Receiver<bool>,
) {
    let handler = Arc::new(SocksHandler::new(rotator.clone(), source));
    info!(
        rotator_id = rotator.id,
        port = rotator.listen_port,
        protocol = %rotator.listen_protocol,
        "SOCKS rotator listening"
    );

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _peer)) => {
                        let handler = handler.clone();
                        tokio::spawn(async move {
                            handler.handle(stream).await;
                        });
                    }
                    Err(e) => error!(rotator_id = rotator.id, "Accept error: {}", e),
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}
