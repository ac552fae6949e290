//! HTTP front end.
//!
//! A plain hyper HTTP/1.1 accept loop. Every request is either an admin call
//! under the configured prefix or handed to [`Runtime::dispatch`].
//!
//! # Admin endpoints
//!
//! - `POST {prefix}/reload?name=<n>&interrupt=<bool>`: body is the program
//!   source. `202` on success, `400` on a compile error.
//! - `GET {prefix}/metrics`: [`MetricsSnapshot`](vesper_metrics::MetricsSnapshot) as JSON
//! - `GET {prefix}/info`: [`ServerInfo`](vesper_metrics::ServerInfo) as JSON
//!
//! # Example
//!
//! ```no_run
//! use vesper_server::{HttpServer, Runtime, RuntimeConfig, ServerConfig};
//! use std::sync::Arc;
//!
//! # async fn run() -> vesper_common::Result<()> {
//! let runtime = Arc::new(Runtime::new(RuntimeConfig::new())?);
//! let server = HttpServer::new(runtime, ServerConfig::default());
//! server.run().await
//! # }
//! ```

use crate::config::ServerConfig;
use crate::fleet::Runtime;
use crate::request::{
    Fallthrough, HostRequest, HttpResponse, NoContent, empty_response, json_response,
    text_response,
};
use bytes::Bytes;
use http::{Method, StatusCode};
use http_body_util::{BodyExt, Limited};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::TokioIo;
use serde_json::json;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use vesper_common::{Result, VesperError};

/// Everything a connection task needs.
struct Shared {
    runtime: Arc<Runtime>,
    config: ServerConfig,
    fallthrough: Arc<dyn Fallthrough>,
    shutdown: CancellationToken,
}

/// HTTP server for a vesper [`Runtime`].
pub struct HttpServer {
    shared: Arc<Shared>,
}

impl HttpServer {
    /// Creates a server answering fallthroughs with `204 No Content`.
    pub fn new(runtime: Arc<Runtime>, config: ServerConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                runtime,
                config,
                fallthrough: Arc::new(NoContent),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Replaces the collaborator that answers requests a handler passes on.
    pub fn with_fallthrough(self, fallthrough: Arc<dyn Fallthrough>) -> Self {
        let shared = Arc::new(Shared {
            runtime: Arc::clone(&self.shared.runtime),
            config: self.shared.config.clone(),
            fallthrough,
            shutdown: self.shared.shutdown.clone(),
        });
        Self { shared }
    }

    /// Token that stops the accept loop and cancels in-flight requests.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shared.shutdown.clone()
    }

    /// Binds the configured address and serves until shut down.
    pub async fn run(self) -> Result<()> {
        let listener = TcpListener::bind(self.shared.config.bind)
            .await
            .map_err(|e| {
                let bind = self.shared.config.bind;
                VesperError::Transport(format!("Failed to bind to {bind}: {e}"))
            })?;
        self.serve(listener).await
    }

    /// Serves connections from `listener` until the shutdown token fires.
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        self.shared.config.validate()?;
        let local = listener
            .local_addr()
            .map_err(|e| VesperError::Transport(format!("Failed to get local address: {e}")))?;
        tracing::info!("HTTP server listening on {local}");

        loop {
            let (stream, remote) = tokio::select! {
                _ = self.shared.shutdown.cancelled() => {
                    tracing::info!("HTTP server stopped accepting connections");
                    return Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        tracing::warn!("Failed to accept connection: {e}");
                        continue;
                    }
                },
            };

            let io = TokioIo::new(stream);
            let shared = Arc::clone(&self.shared);

            tokio::task::spawn(async move {
                let service = service_fn(move |req| {
                    let shared = Arc::clone(&shared);
                    async move {
                        Ok::<_, Infallible>(Self::handle_request(shared, req, remote).await)
                    }
                });

                if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                    tracing::debug!("Error serving connection: {err}");
                }
            });
        }
    }

    async fn handle_request(
        shared: Arc<Shared>,
        req: Request<Incoming>,
        remote: SocketAddr,
    ) -> HttpResponse {
        if shared.config.admin_enabled
            && let Some(rest) = req.uri().path().strip_prefix(shared.config.admin_prefix.as_str())
            && (rest.is_empty() || rest.starts_with('/'))
        {
            let route = rest.to_string();
            return Self::handle_admin(&shared, &route, req).await;
        }

        let request = HostRequest::from_http(req)
            .with_remote(remote)
            .with_cancel(shared.shutdown.child_token());
        shared
            .runtime
            .dispatch(request, shared.fallthrough.as_ref())
            .await
    }

    async fn handle_admin(shared: &Shared, route: &str, req: Request<Incoming>) -> HttpResponse {
        match (req.method(), route) {
            (&Method::POST, "/reload") => Self::handle_reload(shared, req).await,
            (&Method::GET, "/metrics") => {
                let snapshot = shared.runtime.metrics().snapshot();
                match serde_json::to_vec(&snapshot) {
                    Ok(body) => json_response(StatusCode::OK, body),
                    Err(e) => text_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
                }
            }
            (&Method::GET, "/info") => match serde_json::to_vec(&shared.runtime.info()) {
                Ok(body) => json_response(StatusCode::OK, body),
                Err(e) => text_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
            },
            (_, "/reload" | "/metrics" | "/info") => empty_response(StatusCode::METHOD_NOT_ALLOWED),
            _ => empty_response(StatusCode::NOT_FOUND),
        }
    }

    async fn handle_reload(shared: &Shared, req: Request<Incoming>) -> HttpResponse {
        let query = req.uri().query().unwrap_or("").to_string();
        let name = query_param(&query, "name").unwrap_or_else(|| "script.js".to_string());
        let interrupt = matches!(query_param(&query, "interrupt").as_deref(), Some("true" | "1"));

        let limit = shared.runtime.config().max_body_bytes;
        let body = match Limited::new(req.into_body(), limit).collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                return text_response(
                    StatusCode::BAD_REQUEST,
                    format!("Failed to read program: {e}"),
                );
            }
        };
        let Ok(source) = String::from_utf8(body.to_vec()) else {
            return text_response(StatusCode::BAD_REQUEST, "program is not valid UTF-8");
        };

        match shared.runtime.reload(&name, &source, interrupt).await {
            Ok(()) => {
                let info = shared.runtime.info();
                let body = json!({ "script": name, "generation": info.generation });
                json_response(StatusCode::ACCEPTED, Bytes::from(body.to_string()))
            }
            Err(err @ VesperError::Compile { .. }) => {
                text_response(StatusCode::BAD_REQUEST, err.to_string())
            }
            Err(err @ VesperError::Registration(_)) => {
                text_response(StatusCode::UNPROCESSABLE_ENTITY, err.to_string())
            }
            Err(err @ VesperError::ShardStopped) => {
                text_response(StatusCode::SERVICE_UNAVAILABLE, err.to_string())
            }
            Err(err) => text_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
        }
    }
}

/// First value of `key` in a form-encoded query string, percent-decoded.
fn query_param(query: &str, key: &str) -> Option<String> {
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_param() {
        let query = "name=app.js&interrupt=true&flag";
        assert_eq!(query_param(query, "name").as_deref(), Some("app.js"));
        assert_eq!(query_param(query, "interrupt").as_deref(), Some("true"));
        assert_eq!(query_param(query, "flag").as_deref(), Some(""));
        assert_eq!(query_param(query, "missing"), None);
        assert_eq!(query_param("", "name"), None);
    }

    #[test]
    fn test_query_param_is_percent_decoded() {
        assert_eq!(query_param("name=my%20app.js", "name").as_deref(), Some("my app.js"));
        assert_eq!(query_param("name=a+b%2Fc.js", "name").as_deref(), Some("a b/c.js"));
        assert_eq!(query_param("na%6De=x.js", "name").as_deref(), Some("x.js"));
    }
}
