// SPDX-License-Identifier: Apache-2.0

//! HTTP scrape endpoint for the KPI gauges.

use crate::listener::Listener;

use http::Method;
use http_body_util::Full;
use hyper::body::Body;
use hyper::body::Bytes;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder;
use hyper_util::service::TowerToHyperService;
use prometheus::{Encoder, Registry, TextEncoder};

use std::error::Error as StdError;
use std::fmt::{Debug, Display};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio_util::sync::CancellationToken;
use tower::Service;
use tracing::error;

/// Serves the text exposition of the gauge registry at the configured
/// metrics path and 404 for everything else.
pub struct MetricsServer {
    registry: Registry,
    metrics_path: String,
}

impl MetricsServer {
    pub fn new(registry: Registry, metrics_path: String) -> Self {
        Self {
            registry,
            metrics_path,
        }
    }

    /// Accept and serve connections until cancelled.
    pub async fn serve(
        &self,
        listener: Listener,
        cancellation: CancellationToken,
    ) -> Result<(), Box<dyn StdError + Send + Sync>> {
        let svc = ScrapeService::new(self.registry.clone(), self.metrics_path.clone());

        // To bridge Tower->Hyper we must wrap the tower service
        let svc = TowerToHyperService::new(svc);

        let timer = hyper_util::rt::TokioTimer::new();
        let graceful = hyper_util::server::graceful::GracefulShutdown::new();

        let mut builder = Builder::new(TokioExecutor::new());
        builder.http1().timer(timer.clone());
        builder.http2().timer(timer);

        let listener = listener.into_async()?;
        loop {
            let stream = tokio::select! {
                r = listener.accept() => {
                    match r {
                        Ok((stream, _)) => stream,
                        Err(e) => return Err(e.into()),
                    }
                },
                _ = cancellation.cancelled() => break
            };

            let io = TokioIo::new(stream);

            let conn = builder.serve_connection(io, svc.clone());
            let fut = graceful.watch(conn.into_owned());

            tokio::spawn(async move {
                let _ = fut.await.map_err(|e| {
                    error!("error serving metrics connection: {:?}", e);
                });
            });
        }

        // gracefully shutdown existing connections
        graceful.shutdown().await;

        Ok(())
    }
}

#[derive(Clone)]
struct ScrapeService {
    registry: Registry,
    metrics_path: String,
}

impl ScrapeService {
    fn new(registry: Registry, metrics_path: String) -> Self {
        Self {
            registry,
            metrics_path,
        }
    }

    fn render(&self) -> Result<Response<Full<Bytes>>, prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut output = String::new();
        encoder.encode_utf8(&self.registry.gather(), &mut output)?;
        Ok(Response::builder()
            .status(StatusCode::OK)
            .header(http::header::CONTENT_TYPE, encoder.format_type())
            .body(Full::new(Bytes::from(output)))
            .unwrap())
    }
}

impl<H> Service<Request<H>> for ScrapeService
where
    H: Body + Send + Sync + 'static,
    <H as Body>::Data: Send + Sync + Clone,
    <H as Body>::Error: Display + Debug + Send + Sync + ToString,
{
    type Response = Response<Full<Bytes>>;
    type Error = hyper::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<H>) -> Self::Future {
        let response = if req.method() == Method::GET && req.uri().path() == self.metrics_path {
            match self.render() {
                Ok(response) => response,
                Err(err) => Response::builder()
                    .status(StatusCode::INTERNAL_SERVER_ERROR)
                    .body(Full::new(Bytes::from(format!(
                        "Failed to encode metrics: {}",
                        err
                    ))))
                    .unwrap(),
            }
        } else {
            Response::builder()
                .status(StatusCode::NOT_FOUND)
                .body(Full::new(Bytes::from_static(b"Not Found")))
                .unwrap()
        };
        Box::pin(futures::future::ok(response))
    }
}
