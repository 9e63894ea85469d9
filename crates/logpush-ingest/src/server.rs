// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use hyper::service::service_fn;
use hyper::{http, Method, Request, StatusCode};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

use crate::http_utils::{empty_response, log_and_create_http_response, HttpResponse};
use crate::ingest_handler::IngestHandler;

const PUSH_STREAM_PATH_PREFIX: &str = "/push/stream/";
const HEALTH_PATH: &str = "/health";

pub struct IngestServer {
    handler: Arc<IngestHandler>,
}

impl IngestServer {
    pub fn new(handler: Arc<IngestHandler>) -> Self {
        IngestServer { handler }
    }

    pub async fn bind(addr: &str) -> io::Result<TcpListener> {
        TcpListener::bind(addr).await
    }

    /// Accepts connections until the listener fails. Each connection is served on its own task.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), Box<dyn std::error::Error>> {
        if let Ok(addr) = listener.local_addr() {
            info!("Log ingester listening on {addr}");
        }

        let server = hyper::server::conn::http1::Builder::new();
        let mut joinset = tokio::task::JoinSet::new();

        loop {
            let (conn, peer) = tokio::select! {
                con_res = listener.accept() => match con_res {
                    Err(e)
                        if matches!(
                            e.kind(),
                            io::ErrorKind::ConnectionAborted
                                | io::ErrorKind::ConnectionReset
                                | io::ErrorKind::ConnectionRefused
                        ) =>
                    {
                        continue;
                    }
                    Err(e) => {
                        error!("Server error: {e}");
                        return Err(e.into());
                    }
                    Ok(accepted) => accepted,
                },
                finished = async {
                    match joinset.join_next().await {
                        Some(finished) => finished,
                        None => std::future::pending().await,
                    }
                } => match finished {
                    Err(e) if e.is_panic() => {
                        // a panicking connection must not take the server down
                        error!("Connection handler panicked: {:?}", e);
                        continue;
                    },
                    Ok(()) | Err(_) => continue,
                },
            };

            let handler = Arc::clone(&self.handler);
            let service = service_fn(move |req| {
                let handler = Arc::clone(&handler);
                async move { route(&handler, req, peer).await }
            });

            let conn = hyper_util::rt::TokioIo::new(conn);
            let server = server.clone();
            joinset.spawn(async move {
                if let Err(e) = server.serve_connection(conn, service).await {
                    debug!("Connection error: {e}");
                }
            });
        }
    }
}

async fn route(
    handler: &IngestHandler,
    req: Request<hyper::body::Incoming>,
    peer: SocketAddr,
) -> http::Result<HttpResponse> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    match (&method, path.as_str()) {
        (&Method::POST, path) if path.starts_with(PUSH_STREAM_PATH_PREFIX) => {
            let stream_id = &path[PUSH_STREAM_PATH_PREFIX.len()..];
            handler.handle(req, stream_id, Some(peer)).await
        }
        (&Method::GET, HEALTH_PATH) => empty_response(StatusCode::NO_CONTENT),
        _ => log_and_create_http_response(
            &format!("no route for {method} {path}"),
            StatusCode::NOT_FOUND,
        ),
    }
}
