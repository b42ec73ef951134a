use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::header::HeaderValue;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::admin::{handle_admin, ServiceRegistry};

use super::metrics;

fn text_response(status: StatusCode, body: String) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response
}

async fn handle_request(
    registry: Arc<ServiceRegistry>,
    req: Request<hyper::body::Incoming>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let path = req.uri().path();
    let response = match path {
        "/metrics" => {
            let mut response = text_response(StatusCode::OK, metrics().gather());
            response.headers_mut().insert(
                hyper::header::CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4; charset=utf-8"),
            );
            response
        }
        "/health" => text_response(StatusCode::OK, "OK".to_string()),
        p if p.starts_with("/admin/") => {
            let (status, body) = handle_admin(&registry, req.method(), p);
            text_response(status, body)
        }
        _ => text_response(StatusCode::NOT_FOUND, "Not Found".to_string()),
    };
    Ok(response)
}

/// Serve `/metrics`, `/health` and the shard cache admin routes
pub async fn start_metrics_server(addr: &str, registry: Arc<ServiceRegistry>) -> anyhow::Result<()> {
    let addr: SocketAddr = addr.parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %addr, "Metrics server listening");

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let registry = registry.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req| handle_request(registry.clone(), req));
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                error!(error = %e, "Metrics server connection error");
            }
        });
    }
}
