use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::mpsc;
use std::thread::JoinHandle;

use anyhow::{Context, Result, anyhow};
use hyper::body::Bytes;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, StatusCode};
use tokio::sync::oneshot;

use super::MetricsCollector;

/// Serves the live metrics of a pipeline run while it executes.
pub struct MetricsServer {
    shutdown_tx: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
    address: SocketAddr,
}

impl MetricsServer {
    pub fn start(listen: SocketAddr, collector: MetricsCollector) -> Result<Self> {
        let (tx, rx) = oneshot::channel::<()>();
        let (addr_tx, addr_rx) = mpsc::channel::<Result<SocketAddr, String>>();
        let collector = Arc::new(collector);

        let thread = std::thread::spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(err) => {
                    addr_tx.send(Err(err.to_string())).ok();
                    return;
                }
            };

            runtime.block_on(async move {
                let make_svc = make_service_fn(move |_| {
                    let collector = collector.clone();
                    async move {
                        Ok::<_, hyper::Error>(service_fn(move |req| {
                            let collector = collector.clone();
                            async move { handle_request(req, collector).await }
                        }))
                    }
                });

                let builder = match hyper::Server::try_bind(&listen) {
                    Ok(builder) => builder,
                    Err(err) => {
                        addr_tx.send(Err(err.to_string())).ok();
                        return;
                    }
                };
                addr_tx.send(Ok(builder.local_addr())).ok();
                let server = builder.serve(make_svc);
                let graceful = server.with_graceful_shutdown(async move {
                    let _ = rx.await;
                });

                if let Err(err) = graceful.await {
                    tracing::error!(error = %err, "Metrics server error");
                }
            });
        });

        let address = addr_rx
            .recv()
            .context("Metrics server thread exited before binding")?
            .map_err(|err| anyhow!("Failed to bind metrics server on {listen}: {err}"))?;
        tracing::info!(%address, "Metrics server listening");

        Ok(Self {
            shutdown_tx: Some(tx),
            thread: Some(thread),
            address,
        })
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for MetricsServer {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn handle_request(
    req: Request<Body>,
    collector: Arc<MetricsCollector>,
) -> Result<Response<Body>, hyper::Error> {
    let response = match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => Response::builder()
            .header("Content-Type", "text/plain; version=0.0.4")
            .body(Body::from(collector.snapshot().to_prometheus())),
        (&Method::GET, "/metrics.json") => {
            let body = serde_json::to_vec(&collector.snapshot()).unwrap_or_else(|_| b"{}".to_vec());
            Response::builder()
                .header("Content-Type", "application/json")
                .body(Body::from(body))
        }
        (&Method::GET, "/healthz") => Response::builder().body(Body::from("ok")),
        _ => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Body::from(Bytes::from_static(b"Not Found"))),
    };

    Ok(response.unwrap_or_else(|_| Response::new(Body::empty())))
}
