//! Outbound HTTP for scripts.
//!
//! Scripts reach the network only through an [`OutboundTransport`]. The
//! default [`HttpTransport`] keeps one pooled `reqwest` client with rustls for
//! the whole process, so both `http://` and `https://` URLs work. Every call
//! is admitted by the request's [`IoContext`](crate::IoContext) and raced
//! against its effective signal. Response bodies stay streams; the admitted
//! call hands them to the context so whatever the script leaves unread is
//! drained before the context is reused.

use crate::io_context::OutboundToken;
use crate::stream::{ByteStream, TrackedStream};
use bytes::Bytes;
use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::Method;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use vesper_common::{Result, VesperError};

/// User agent sent when the script does not set one.
pub const DEFAULT_USER_AGENT: &str = "vesper-runtime/fetcher";

#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Bytes>,
}

impl OutboundRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            url: url.into(),
            headers: Vec::new(),
            body: None,
        }
    }
}

#[derive(Debug)]
pub struct OutboundResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: ByteStream,
    /// Final URL of the response, after redirects
    pub url: String,
}

/// An [`OutboundResponse`] whose body is owned by the request's context.
#[derive(Debug)]
pub struct AdmittedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: TrackedStream,
    pub url: String,
}

pub type TransportFuture<'a> = Pin<Box<dyn Future<Output = Result<OutboundResponse>> + Send + 'a>>;

/// Performs outbound HTTP calls on behalf of scripts.
pub trait OutboundTransport: Send + Sync {
    fn send(&self, request: OutboundRequest) -> TransportFuture<'_>;
}

/// Sends an admitted request, giving up when the token's signal fires.
///
/// The response body is tracked by the token's context before the token is
/// dropped, so a concurrent `release` always sees it.
pub async fn send_admitted(
    transport: &dyn OutboundTransport,
    token: OutboundToken,
    request: OutboundRequest,
) -> Result<AdmittedResponse> {
    let signal = token.signal().clone();
    let response = tokio::select! {
        biased;
        _ = signal.cancelled() => Err(VesperError::Cancelled),
        response = transport.send(request) => response,
    }?;
    let body = token.track_stream(response.body);
    drop(token);
    Ok(AdmittedResponse {
        status: response.status,
        headers: response.headers,
        body,
        url: response.url,
    })
}

/// [`OutboundTransport`] backed by a pooled `reqwest` client.
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpTransport {
    /// Builds the client. `timeout` bounds each call, body included.
    ///
    /// # Errors
    ///
    /// Returns `VesperError::Transport` if the TLS backend fails to start.
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(DEFAULT_USER_AGENT)
            .pool_idle_timeout(Duration::from_secs(90))
            .timeout(timeout)
            .build()
            .map_err(|e| VesperError::Transport(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self { client, timeout })
    }

    fn build(&self, request: OutboundRequest) -> Result<reqwest::Request> {
        let mut headers = HeaderMap::with_capacity(request.headers.len());
        for (name, value) in &request.headers {
            let name = HeaderName::try_from(name.as_str())
                .map_err(|e| VesperError::Transport(format!("Invalid header name {name}: {e}")))?;
            let value = HeaderValue::try_from(value.as_str())
                .map_err(|e| VesperError::Transport(format!("Invalid header value: {e}")))?;
            headers.append(name, value);
        }

        let mut builder = self
            .client
            .request(request.method, request.url.as_str())
            .headers(headers);
        if let Some(body) = request.body {
            builder = builder.body(body);
        }
        builder
            .build()
            .map_err(|e| VesperError::Transport(format!("Failed to build request: {e}")))
    }

    fn error(&self, err: reqwest::Error) -> VesperError {
        if err.is_timeout() {
            VesperError::Timeout(self.timeout.as_millis() as u64)
        } else {
            VesperError::Transport(format!("HTTP request failed: {err}"))
        }
    }
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport")
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl OutboundTransport for HttpTransport {
    fn send(&self, request: OutboundRequest) -> TransportFuture<'_> {
        Box::pin(async move {
            let request = self.build(request)?;
            let response = self.client.execute(request).await.map_err(|e| self.error(e))?;

            let status = response.status().as_u16();
            let url = response.url().to_string();
            let headers = response
                .headers()
                .iter()
                .filter_map(|(name, value)| {
                    value
                        .to_str()
                        .ok()
                        .map(|v| (name.as_str().to_string(), v.to_string()))
                })
                .collect();

            Ok(OutboundResponse {
                status,
                headers,
                body: ByteStream::from_stream(response.bytes_stream()),
                url,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io_context::IoContext;
    use http::Request;
    use http::header::USER_AGENT;
    use http_body_util::Full;
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper_util::rt::TokioIo;
    use std::convert::Infallible;
    use std::net::SocketAddr;
    use std::sync::Arc;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;
    use tokio_util::sync::CancellationToken;

    /// Serves one connection that echoes the user agent and method.
    async fn start_echo_server() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let service = service_fn(|req: Request<hyper::body::Incoming>| async move {
                let agent = req
                    .headers()
                    .get(USER_AGENT)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("")
                    .to_string();
                let body = format!("{} {}", req.method(), agent);
                Ok::<_, Infallible>(
                    hyper::Response::builder()
                        .header("x-echo", "yes")
                        .body(Full::new(Bytes::from(body)))
                        .unwrap(),
                )
            });
            let _ = http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .await;
        });

        addr
    }

    struct Never;

    impl OutboundTransport for Never {
        fn send(&self, _request: OutboundRequest) -> TransportFuture<'_> {
            Box::pin(std::future::pending())
        }
    }

    struct Fixed;

    impl OutboundTransport for Fixed {
        fn send(&self, request: OutboundRequest) -> TransportFuture<'_> {
            Box::pin(async move {
                Ok(OutboundResponse {
                    status: 200,
                    headers: Vec::new(),
                    body: ByteStream::from_bytes(vec![b'x'; 64 * 1024]),
                    url: request.url,
                })
            })
        }
    }

    fn transport() -> HttpTransport {
        HttpTransport::new(Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn test_http_transport_sets_default_agent() {
        let addr = start_echo_server().await;

        let mut response = transport()
            .send(OutboundRequest::get(format!("http://{addr}/")))
            .await
            .unwrap();

        assert_eq!(response.status, 200);
        assert_eq!(response.url, format!("http://{addr}/"));
        assert_eq!(
            response.body.read_to_end(1024).await.unwrap(),
            Bytes::from("GET vesper-runtime/fetcher")
        );
        assert!(
            response
                .headers
                .iter()
                .any(|(name, value)| name == "x-echo" && value == "yes")
        );
    }

    #[tokio::test]
    async fn test_https_urls_start_a_tls_handshake() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let first_byte = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream.read_u8().await.unwrap()
        });

        let err = transport()
            .send(OutboundRequest::get(format!("https://{addr}/")))
            .await
            .unwrap_err();

        // 0x16 opens a TLS handshake record.
        assert_eq!(first_byte.await.unwrap(), 0x16);
        assert!(matches!(err, VesperError::Transport(_) | VesperError::Timeout(_)));
        assert!(!err.to_string().contains("scheme"));
    }

    #[tokio::test]
    async fn test_unsupported_scheme_is_transport_error() {
        let err = transport()
            .send(OutboundRequest::get("ftp://127.0.0.1/file"))
            .await
            .unwrap_err();
        assert!(matches!(err, VesperError::Transport(_)));
    }

    #[tokio::test]
    async fn test_invalid_header_is_transport_error() {
        let mut request = OutboundRequest::get("http://127.0.0.1:9/");
        request.headers.push(("bad header".into(), "x".into()));

        let err = transport().send(request).await.unwrap_err();
        assert!(matches!(err, VesperError::Transport(_)));
    }

    #[tokio::test]
    async fn test_send_admitted_stops_on_cancellation() {
        let ctx = Arc::new(IoContext::new(1));
        let inbound = CancellationToken::new();
        ctx.bind(inbound.clone());

        let token = ctx.acquire_outbound_token().await.unwrap();
        let call = tokio::spawn(async move {
            send_admitted(&Never, token, OutboundRequest::get("http://example.invalid/")).await
        });

        inbound.cancel();
        let result = call.await.unwrap();
        assert!(matches!(result, Err(VesperError::Cancelled)));
    }

    #[tokio::test]
    async fn test_unread_response_body_is_drained_on_release() {
        let ctx = Arc::new(IoContext::new(1));
        let inbound = CancellationToken::new();
        ctx.bind(inbound.clone());

        let token = ctx.acquire_outbound_token().await.unwrap();
        let response = send_admitted(&Fixed, token, OutboundRequest::get("http://upstream.test/"))
            .await
            .unwrap();
        assert!(!response.body.is_closed().await);

        inbound.cancel();
        ctx.release().await;
        assert!(response.body.is_closed().await);
    }
}
