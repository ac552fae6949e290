//! Request and response types at the dispatch boundary.
//!
//! The HTTP layer converts whatever it receives into a [`HostRequest`] and
//! hands it to [`Runtime::dispatch`](crate::Runtime::dispatch) together with
//! a [`Fallthrough`] collaborator. Everything the runtime answers is an
//! [`HttpResponse`] with a fully buffered body.

use crate::stream::ByteStream;
use bytes::Bytes;
use http::header::{CONTENT_TYPE, HeaderValue};
use http::{HeaderMap, Method, Request, Response, StatusCode, Uri, Version};
use http_body_util::Full;
use hyper::body::Body;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use tokio_util::sync::CancellationToken;

/// A response as produced by the runtime.
pub type HttpResponse = Response<Full<Bytes>>;

/// Method, target and headers of an inbound request.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Method,
    pub uri: Uri,
    pub version: Version,
    pub headers: HeaderMap,
}

impl RequestHead {
    pub fn new(method: Method, uri: Uri) -> Self {
        Self {
            method,
            uri,
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
        }
    }

    pub fn path(&self) -> &str {
        self.uri.path()
    }

    pub fn query(&self) -> &str {
        self.uri.query().unwrap_or("")
    }

    /// First value of `name`, if it is valid UTF-8.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// An inbound request as the runtime sees it.
pub struct HostRequest {
    pub head: RequestHead,
    pub body: ByteStream,
    pub remote: Option<SocketAddr>,
    pub secure: bool,
    /// Fires when the client goes away or the server shuts down.
    pub cancel: CancellationToken,
}

impl HostRequest {
    pub fn new(head: RequestHead, body: ByteStream) -> Self {
        Self {
            head,
            body,
            remote: None,
            secure: false,
            cancel: CancellationToken::new(),
        }
    }

    /// Adapts a hyper request, keeping the body as a stream.
    pub fn from_http<B>(request: Request<B>) -> Self
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let (parts, body) = request.into_parts();
        let head = RequestHead {
            method: parts.method,
            uri: parts.uri,
            version: parts.version,
            headers: parts.headers,
        };
        Self::new(head, ByteStream::from_body(body))
    }

    pub fn with_remote(mut self, remote: SocketAddr) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn with_secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

impl std::fmt::Debug for HostRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostRequest")
            .field("head", &self.head)
            .field("remote", &self.remote)
            .field("secure", &self.secure)
            .finish()
    }
}

/// What runs when a handler passes the request on instead of answering it.
pub trait Fallthrough: Send + Sync {
    fn call(&self, head: RequestHead) -> Pin<Box<dyn Future<Output = HttpResponse> + Send>>;
}

/// Answers every fallthrough with `204 No Content`.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoContent;

impl Fallthrough for NoContent {
    fn call(&self, _head: RequestHead) -> Pin<Box<dyn Future<Output = HttpResponse> + Send>> {
        Box::pin(async { empty_response(StatusCode::NO_CONTENT) })
    }
}

pub fn empty_response(status: StatusCode) -> HttpResponse {
    let mut response = Response::new(Full::new(Bytes::new()));
    *response.status_mut() = status;
    response
}

pub fn text_response(status: StatusCode, body: impl Into<Bytes>) -> HttpResponse {
    with_content_type(status, body.into(), "text/plain; charset=utf-8")
}

pub fn json_response(status: StatusCode, body: impl Into<Bytes>) -> HttpResponse {
    with_content_type(status, body.into(), "application/json")
}

fn with_content_type(status: StatusCode, body: Bytes, content_type: &'static str) -> HttpResponse {
    let mut response = Response::new(Full::new(body));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}
