//! Vesper Server
//!
//! This crate hosts JavaScript request handlers on a fleet of Boa
//! interpreters and serves them over HTTP.
//!
//! - [`Runtime`]: the shard fleet, with hot reload and round-robin dispatch
//! - [`IoContext`]: per-request cancellation, outbound admission and cleanup
//! - [`HttpServer`]: hyper front end with the admin endpoints
//! - [`OutboundTransport`] / [`KvStore`]: collaborators scripts reach through
//!   `fetch` and `kv`

pub mod config;
pub mod fetch;
pub mod fleet;
pub mod http_server;
pub mod io_context;
pub mod kv;
pub mod request;
pub mod runtime;
pub mod stream;

pub use config::{RuntimeConfig, ServerConfig};
pub use fetch::{
    AdmittedResponse, HttpTransport, OutboundRequest, OutboundResponse, OutboundTransport,
};
pub use fleet::{Runtime, RuntimeBuilder, SHARD_HEADER};
pub use http_server::HttpServer;
pub use io_context::{ContextState, IoContext, IoContextPool, IoLease, OutboundToken};
pub use kv::{KvRegistry, KvStore, MemoryKv};
pub use request::{Fallthrough, HostRequest, HttpResponse, NoContent, RequestHead};
pub use runtime::{HandlerInfo, Shard, StopMode};
pub use stream::{ByteStream, TrackedStream};
