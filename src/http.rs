//! HTTP status endpoint
//!
//! Small operational surface for monitoring:
//!
//! - `GET /health` - liveness probe
//! - `GET /status` - per-component health (artifact replicas, partition
//!   health, cache hit rate, chain height, peer count)
//! - `GET /history` - recent finalized voting outcomes

use crate::node::SynodNode;
use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{header, Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

/// History page size for `GET /history`
const HISTORY_LIMIT: usize = 50;

/// Status server over a running node
pub struct StatusServer {
    node: Arc<SynodNode>,
    bind_addr: SocketAddr,
}

impl StatusServer {
    pub fn new(node: Arc<SynodNode>, bind_addr: SocketAddr) -> Self {
        Self { node, bind_addr }
    }

    /// Run the HTTP server
    pub async fn run(self: Arc<Self>) -> Result<(), crate::error::SynodError> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "Status server listening");

        loop {
            let (stream, remote_addr) = listener.accept().await?;
            let io = TokioIo::new(stream);
            let server = self.clone();

            tokio::spawn(async move {
                let service = service_fn(move |req| {
                    let server = server.clone();
                    async move { server.handle_request(req).await }
                });

                if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                    warn!(addr = %remote_addr, error = %err, "Connection error");
                }
            });
        }
    }

    async fn handle_request(
        &self,
        req: Request<Incoming>,
    ) -> Result<Response<Full<Bytes>>, hyper::Error> {
        let path = req.uri().path().to_string();
        let method = req.method().clone();
        debug!(method = %method, path = %path, "Incoming request");

        let response = match (method, path.as_str()) {
            (Method::GET, "/health") => json_response(StatusCode::OK, r#"{"status":"ok"}"#.into()),
            (Method::GET, "/status") => match self.node.status() {
                Ok(status) => match serde_json::to_string(&status) {
                    Ok(body) => json_response(StatusCode::OK, body),
                    Err(e) => error_response(e.to_string()),
                },
                Err(e) => error_response(e.to_string()),
            },
            (Method::GET, "/history") => {
                match self.node.consensus.voting_history(HISTORY_LIMIT) {
                    Ok(history) => match serde_json::to_string(&history) {
                        Ok(body) => json_response(StatusCode::OK, body),
                        Err(e) => error_response(e.to_string()),
                    },
                    Err(e) => error_response(e.to_string()),
                }
            }
            _ => json_response(StatusCode::NOT_FOUND, r#"{"error":"not found"}"#.into()),
        };
        Ok(response)
    }
}

fn json_response(status: StatusCode, body: String) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(body)))
        .unwrap()
}

fn error_response(message: String) -> Response<Full<Bytes>> {
    let body = serde_json::json!({ "error": message }).to_string();
    json_response(StatusCode::INTERNAL_SERVER_ERROR, body)
}
