//! Shard fleet manager.
//!
//! [`Runtime`] owns a fixed number of shard slots. Requests are spread over
//! the slots round-robin; a reload builds a brand-new shard per slot, swaps
//! it in and stops the previous one.
//!
//! # Reload semantics
//!
//! The program is parsed once up front. A syntax error is returned before any
//! slot is touched. After that, slots are rebuilt one at a time and each swap
//! is independent: a slot whose shard fails to start keeps its previous
//! instance, slots swapped before it keep the new one, and the first error is
//! returned to the caller.

use crate::config::RuntimeConfig;
use crate::fetch::{HttpTransport, OutboundTransport};
use crate::kv::KvRegistry;
use crate::request::{Fallthrough, HostRequest, HttpResponse, text_response};
use crate::runtime::{self, Shard, ShardEnv, ShardSpec, StopMode};
use http::header::{HeaderName, HeaderValue};
use http::StatusCode;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;
use tokio::runtime::Handle;
use vesper_common::{Result, VesperError};
use vesper_metrics::{MetricsCollector, RequestOutcome, RuntimeMetricsCollector, ServerInfo};

/// Response header naming the shard that served a request.
pub const SHARD_HEADER: HeaderName = HeaderName::from_static("x-vesper-shard");

/// Pool names reported in metrics snapshots.
pub const IO_CONTEXT_POOL: &str = "io_context";
pub const FACADE_POOL: &str = "facade";

/// Builder for [`Runtime`].
///
/// # Example
///
/// ```no_run
/// use vesper_server::{RuntimeBuilder, RuntimeConfig};
///
/// # async fn run() -> vesper_common::Result<()> {
/// let runtime = RuntimeBuilder::new(RuntimeConfig::new().with_shards(2)).build()?;
/// runtime
///     .reload("hello.js", "registerMiddlewareHandler(() => 'hello');", false)
///     .await?;
/// # Ok(())
/// # }
/// ```
pub struct RuntimeBuilder {
    config: RuntimeConfig,
    kv: KvRegistry,
    transport: Option<Arc<dyn OutboundTransport>>,
    metrics: Option<Arc<dyn MetricsCollector>>,
}

impl RuntimeBuilder {
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            config,
            kv: KvRegistry::new(),
            transport: None,
            metrics: None,
        }
    }

    /// KV bindings visible to scripts as `kv.<name>`.
    pub fn with_kv(mut self, kv: KvRegistry) -> Self {
        self.kv = kv;
        self
    }

    /// Replaces the default `reqwest` transport used by `fetch`.
    pub fn with_transport(mut self, transport: Arc<dyn OutboundTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Builds an empty fleet. Dispatch answers 503 until the first reload.
    ///
    /// # Errors
    ///
    /// Returns `VesperError::InvalidConfig` if the configuration is invalid
    /// or if called outside a tokio runtime, and `VesperError::Transport` if
    /// the default HTTP client cannot be created.
    pub fn build(self) -> Result<Runtime> {
        self.config.validate()?;
        let io = Handle::try_current().map_err(|e| {
            VesperError::InvalidConfig(format!("the runtime must be built inside tokio: {e}"))
        })?;

        let metrics = self
            .metrics
            .unwrap_or_else(|| Arc::new(RuntimeMetricsCollector::new()));
        let transport: Arc<dyn OutboundTransport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HttpTransport::new(self.config.fetch_timeout)?),
        };
        let env = Arc::new(ShardEnv {
            io,
            transport,
            kv: self.kv,
            context_stats: metrics.pool_stats(IO_CONTEXT_POOL),
            facade_stats: metrics.pool_stats(FACADE_POOL),
            config: self.config,
        });
        let slots = (0..env.config.shards).map(|_| RwLock::new(None)).collect();

        Ok(Runtime {
            slots,
            cursor: AtomicUsize::new(0),
            program: Mutex::new(None),
            generation: AtomicU64::new(0),
            reload_lock: tokio::sync::Mutex::new(()),
            env,
            metrics,
            stopped: AtomicBool::new(false),
        })
    }
}

/// The last program installed by a reload.
#[derive(Debug, Clone)]
struct Program {
    name: Arc<str>,
    generation: u64,
}

/// A fleet of interpreter shards serving one program.
pub struct Runtime {
    slots: Vec<RwLock<Option<Arc<Shard>>>>,
    cursor: AtomicUsize,
    program: Mutex<Option<Program>>,
    generation: AtomicU64,
    reload_lock: tokio::sync::Mutex<()>,
    env: Arc<ShardEnv>,
    metrics: Arc<dyn MetricsCollector>,
    stopped: AtomicBool,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("shards", &self.slots.len())
            .field("program", &*self.program.lock())
            .field("stopped", &self.stopped.load(Ordering::SeqCst))
            .finish()
    }
}

impl Runtime {
    /// Builds a fleet with the default transport, no KV bindings and a
    /// private metrics registry.
    pub fn new(config: RuntimeConfig) -> Result<Self> {
        RuntimeBuilder::new(config).build()
    }

    pub fn shard_count(&self) -> usize {
        self.slots.len()
    }

    pub fn metrics(&self) -> &Arc<dyn MetricsCollector> {
        &self.metrics
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.env.config
    }

    /// Name of the program currently installed, if any.
    pub fn script(&self) -> Option<String> {
        self.program.lock().as_ref().map(|p| p.name.to_string())
    }

    /// Returns true once at least one slot holds a shard.
    pub fn is_ready(&self) -> bool {
        self.slots.iter().any(|slot| slot.read().is_some())
    }

    /// The shard currently installed in slot `index`.
    pub fn shard(&self, index: usize) -> Option<Arc<Shard>> {
        self.slots.get(index).and_then(|slot| slot.read().clone())
    }

    pub fn info(&self) -> ServerInfo {
        let program = self.program.lock().clone();
        ServerInfo::new(
            self.metrics.uptime_ms(),
            self.slots.len(),
            program.as_ref().map(|p| p.name.to_string()),
            program.map_or(0, |p| p.generation),
        )
    }

    /// Installs a new program into every slot.
    ///
    /// # Arguments
    ///
    /// * `name` - Name of the program, used in logs and errors
    /// * `source` - Program text
    /// * `interrupt` - Stop previous shards at once instead of letting them
    ///   finish their in-flight requests
    ///
    /// # Errors
    ///
    /// - `VesperError::Compile` if the program does not parse; nothing changed
    /// - `VesperError::Registration` if evaluating the program threw in at
    ///   least one slot; those slots keep their previous shard
    /// - `VesperError::ShardStopped` after [`Runtime::shutdown`]
    pub async fn reload(&self, name: &str, source: &str, interrupt: bool) -> Result<()> {
        let result = self.install(name, source, interrupt).await;
        self.metrics.record_reload(result.is_ok());
        if let Err(err) = &result {
            tracing::warn!(script = name, error = %err, "Reload failed");
        }
        result
    }

    async fn install(&self, name: &str, source: &str, interrupt: bool) -> Result<()> {
        let _reload = self.reload_lock.lock().await;
        if self.stopped.load(Ordering::SeqCst) {
            return Err(VesperError::ShardStopped);
        }
        runtime::compile(name, source)?;

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let script: Arc<str> = Arc::from(name);
        let source: Arc<str> = Arc::from(source);
        let mode = if interrupt {
            StopMode::Interrupt
        } else {
            StopMode::Graceful
        };
        tracing::info!(
            script = name,
            shards = self.slots.len(),
            interrupt,
            generation,
            "Reloading program"
        );

        let mut first_error = None;
        let mut swapped = 0;
        for (index, slot) in self.slots.iter().enumerate() {
            let spec = ShardSpec {
                index,
                generation,
                script: Arc::clone(&script),
                source: Arc::clone(&source),
                env: Arc::clone(&self.env),
            };
            match Shard::start(spec).await {
                Ok(shard) => {
                    let previous = slot.write().replace(shard);
                    if let Some(previous) = previous {
                        previous.stop(mode);
                    }
                    swapped += 1;
                }
                Err(err) => {
                    tracing::error!(
                        shard = index,
                        error = %err,
                        "Shard failed to start, keeping previous instance"
                    );
                    first_error.get_or_insert(err);
                }
            }
        }

        if swapped > 0 {
            *self.program.lock() = Some(Program {
                name: script,
                generation,
            });
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn next_shard(&self) -> Option<Arc<Shard>> {
        let count = self.slots.len();
        let start = self.cursor.fetch_add(1, Ordering::Relaxed);
        // Slots that never started are skipped.
        (0..count).find_map(|offset| self.slots[(start + offset) % count].read().clone())
    }

    /// Serves `request` on the next shard.
    ///
    /// Never fails: errors are turned into responses. `next` answers
    /// requests the handler passes on.
    pub async fn dispatch(&self, request: HostRequest, next: &dyn Fallthrough) -> HttpResponse {
        let start = Instant::now();
        self.metrics.begin_request();

        let shard = match self.next_shard() {
            Some(shard) if !self.stopped.load(Ordering::SeqCst) => shard,
            _ => {
                self.metrics
                    .record_request(None, RequestOutcome::NotReady, start);
                return text_response(StatusCode::SERVICE_UNAVAILABLE, "runtime not ready");
            }
        };

        let served = shard.serve(request, next).await;
        self.metrics
            .record_request(served.style, served.outcome, start);

        let mut response = served.response;
        response
            .headers_mut()
            .insert(SHARD_HEADER, HeaderValue::from(shard.index()));
        response
    }

    /// Stops every shard. Later calls do nothing.
    pub async fn shutdown(&self, mode: StopMode) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let _reload = self.reload_lock.lock().await;
        let shards: Vec<_> = self
            .slots
            .iter()
            .filter_map(|slot| slot.write().take())
            .collect();
        tracing::info!(shards = shards.len(), ?mode, "Shutting down runtime");
        for shard in &shards {
            shard.stop(mode);
        }
        for shard in &shards {
            shard.stopped().await;
        }
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        for slot in &self.slots {
            if let Some(shard) = slot.write().take() {
                shard.stop(StopMode::Interrupt);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{NoContent, RequestHead};
    use crate::stream::ByteStream;
    use http::{Method, Uri};
    use http_body_util::BodyExt;

    fn get() -> HostRequest {
        HostRequest::new(
            RequestHead::new(Method::GET, Uri::from_static("/")),
            ByteStream::from_bytes(""),
        )
    }

    async fn body(response: HttpResponse) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[test]
    fn test_build_outside_tokio_fails() {
        let err = Runtime::new(RuntimeConfig::new().with_shards(1)).unwrap_err();
        assert!(matches!(err, VesperError::InvalidConfig(_)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_dispatch_before_reload_is_not_ready() {
        let runtime = Runtime::new(RuntimeConfig::new().with_shards(2)).unwrap();
        assert!(!runtime.is_ready());

        let response = runtime.dispatch(get(), &NoContent).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body(response).await, "runtime not ready");
        assert_eq!(runtime.metrics().snapshot().outcomes["not_ready"], 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_round_robin_over_slots() {
        let runtime = Runtime::new(RuntimeConfig::new().with_shards(3)).unwrap();
        runtime
            .reload("rr.js", "registerMiddlewareHandler(() => 'ok');", false)
            .await
            .unwrap();

        let mut seen = Vec::new();
        for _ in 0..6 {
            let response = runtime.dispatch(get(), &NoContent).await;
            let shard = response.headers()[SHARD_HEADER].to_str().unwrap().to_string();
            seen.push(shard);
        }
        assert_eq!(seen, ["0", "1", "2", "0", "1", "2"]);
        runtime.shutdown(StopMode::Graceful).await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_compile_error_leaves_fleet_unchanged() {
        let runtime = Runtime::new(RuntimeConfig::new().with_shards(1)).unwrap();
        runtime
            .reload("v1.js", "registerMiddlewareHandler(() => 'v1');", false)
            .await
            .unwrap();

        let err = runtime
            .reload("v2.js", "registerMiddlewareHandler(() => {", false)
            .await
            .unwrap_err();
        assert!(matches!(err, VesperError::Compile { ref script, .. } if script == "v2.js"));
        assert_eq!(runtime.script().as_deref(), Some("v1.js"));

        let response = runtime.dispatch(get(), &NoContent).await;
        assert_eq!(body(response).await, "v1");

        let snapshot = runtime.metrics().snapshot();
        assert_eq!(snapshot.reloads.succeeded, 1);
        assert_eq!(snapshot.reloads.failed, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_shutdown_is_idempotent() {
        let runtime = Runtime::new(RuntimeConfig::new().with_shards(2)).unwrap();
        runtime
            .reload("s.js", "registerMiddlewareHandler(() => 'ok');", false)
            .await
            .unwrap();
        let shard = runtime.shard(0).unwrap();

        runtime.shutdown(StopMode::Graceful).await;
        runtime.shutdown(StopMode::Interrupt).await;
        assert!(shard.is_stopped());
        assert!(!runtime.is_ready());

        let response = runtime.dispatch(get(), &NoContent).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(matches!(
            runtime.reload("s.js", "", false).await,
            Err(VesperError::ShardStopped)
        ));
    }
}
