//! Script execution on Boa.
//!
//! A [`Shard`] owns one Boa interpreter on a dedicated thread. Requests reach
//! it as tasks on an unbounded queue; the interpreter is never touched
//! anywhere else. The completion bridge in `resolver` turns the handler's
//! promise into a [`Reply`] sent back to the waiting caller over a oneshot
//! channel.

mod bindings;
mod conversions;
mod facade;
mod job_executor;
mod props;
mod resolver;
mod shard;
mod state;

pub use shard::{Shard, StopMode};
pub(crate) use shard::{ShardEnv, ShardSpec};

use crate::request::HttpResponse;
use boa_engine::{Context, Script, Source};
use tokio::sync::oneshot;
use vesper_common::{Result, VesperError};
use vesper_metrics::HandlerStyle;

/// Parses `source` in a scratch interpreter without running it.
///
/// # Errors
///
/// Returns `VesperError::Compile` carrying the parser message.
pub fn compile(script: &str, source: &str) -> Result<()> {
    let mut context = Context::default();
    match Script::parse(Source::from_bytes(source.as_bytes()), None, &mut context) {
        Ok(_) => Ok(()),
        Err(err) => Err(VesperError::Compile {
            script: script.to_string(),
            message: conversions::describe_error(&err, &mut context),
        }),
    }
}

/// What a script registered, as seen from outside the shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerInfo {
    pub style: HandlerStyle,
    /// Whether façades expose `fetch`
    pub enable_fetch: bool,
}

/// Outcome of one handler invocation, sent at most once per façade use.
pub(crate) enum Reply {
    /// The script produced a response.
    Respond(HttpResponse),
    /// The script failed; the response describes the error.
    Failed(HttpResponse),
    /// The request goes to the fallthrough collaborator.
    Fallthrough,
    /// `respondWith` was called; the response arrives on the inner channel.
    AwaitInner(oneshot::Receiver<Reply>),
}

impl std::fmt::Debug for Reply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Reply::Respond(response) => f.debug_tuple("Respond").field(&response.status()).finish(),
            Reply::Failed(response) => f.debug_tuple("Failed").field(&response.status()).finish(),
            Reply::Fallthrough => f.write_str("Fallthrough"),
            Reply::AwaitInner(_) => f.write_str("AwaitInner"),
        }
    }
}
