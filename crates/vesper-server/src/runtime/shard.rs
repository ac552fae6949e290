//! One interpreter shard.
//!
//! A shard is a dedicated OS thread running a current-thread tokio runtime
//! and a single Boa [`Context`]. The thread owns the interpreter for its
//! whole life; the rest of the process talks to it by sending [`Task`]s.
//!
//! # Event loop
//!
//! Each turn drains promise microtasks, moves new native async jobs (timers,
//! fetch, KV, body reads) into a local future set, and then waits for
//! whichever comes first: a control signal, a task, or an async job. The loop
//! exits once the shard was asked to stop and, for a graceful stop, every
//! request it accepted has released its I/O context.

use super::bindings;
use super::conversions::{callable, describe_error, object_of, type_error};
use super::facade::Facades;
use super::job_executor::ShardJobExecutor;
use super::resolver::{self, Invocation};
use super::state::{self, Factories, ShardState, Timers};
use super::{HandlerInfo, Reply};
use crate::config::RuntimeConfig;
use crate::fetch::OutboundTransport;
use crate::io_context::IoContextPool;
use crate::kv::KvRegistry;
use crate::request::{Fallthrough, HostRequest, HttpResponse, text_response};
use boa_engine::object::JsObject;
use boa_engine::{Context, JsError, JsResult, JsString, JsValue, Source};
use futures_util::StreamExt;
use futures_util::stream::FuturesUnordered;
use http::StatusCode;
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::runtime::Handle;
use tokio::sync::{Notify, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use vesper_common::{PoolStats, Result, VesperError};
use vesper_metrics::{HandlerStyle, RequestOutcome};

const PRELUDE: &str = include_str!("prelude.js");

/// Work executed on the shard thread with the interpreter.
pub(crate) type Task = Box<dyn FnOnce(&mut Context) + Send>;
pub(crate) type TaskSender = mpsc::UnboundedSender<Task>;

/// Process-wide collaborators shared by every shard.
pub(crate) struct ShardEnv {
    /// Runtime that runs I/O on behalf of scripts
    pub io: Handle,
    pub transport: Arc<dyn OutboundTransport>,
    pub kv: KvRegistry,
    pub config: RuntimeConfig,
    pub context_stats: Arc<PoolStats>,
    pub facade_stats: Arc<PoolStats>,
}

/// Everything needed to boot a shard.
pub(crate) struct ShardSpec {
    pub index: usize,
    pub generation: u64,
    /// Name of the program, for logs and errors
    pub script: Arc<str>,
    pub source: Arc<str>,
    pub env: Arc<ShardEnv>,
}

/// How a shard should stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMode {
    /// Finish every accepted request, including `waitUntil` work.
    Graceful,
    /// Stop at the next turn of the event loop. Pending requests are
    /// answered with 503.
    Interrupt,
}

/// State visible both to the shard thread and to callers.
pub(crate) struct ShardShared {
    pub index: usize,
    pub generation: u64,
    pub handler: parking_lot::Mutex<Option<HandlerInfo>>,
    pub io_pool: Arc<IoContextPool>,
    inflight: AtomicUsize,
    draining: AtomicBool,
    interrupted: AtomicBool,
    wake: Notify,
}

impl ShardShared {
    fn finish_request(&self) {
        if self.inflight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.wake.notify_one();
        }
    }
}

/// Result of serving one request on a shard.
#[derive(Debug)]
pub(crate) struct Served {
    pub style: Option<HandlerStyle>,
    pub outcome: RequestOutcome,
    pub response: HttpResponse,
}

/// Handle to a running shard.
pub struct Shard {
    shared: Arc<ShardShared>,
    tasks: TaskSender,
    exited: CancellationToken,
}

impl std::fmt::Debug for Shard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shard")
            .field("index", &self.shared.index)
            .field("generation", &self.shared.generation)
            .field("inflight", &self.inflight())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

impl Shard {
    /// Spawns the shard thread, evaluates the program and waits until the
    /// shard is ready to serve.
    ///
    /// # Errors
    ///
    /// Returns `VesperError::Registration` if evaluating the program threw,
    /// and `VesperError::Io` if the thread or its runtime could not be
    /// created.
    pub(crate) async fn start(spec: ShardSpec) -> Result<Arc<Self>> {
        let env = Arc::clone(&spec.env);
        let io_pool = Arc::new(IoContextPool::new(
            env.config.pool_capacity,
            env.config.outbound_limit,
            Arc::clone(&env.context_stats),
            env.io.clone(),
        ));
        let shared = Arc::new(ShardShared {
            index: spec.index,
            generation: spec.generation,
            handler: parking_lot::Mutex::new(None),
            io_pool,
            inflight: AtomicUsize::new(0),
            draining: AtomicBool::new(false),
            interrupted: AtomicBool::new(false),
            wake: Notify::new(),
        });

        let (tasks, rx) = mpsc::unbounded_channel();
        let (ready, booted) = oneshot::channel();
        let exited = CancellationToken::new();

        let worker = Worker {
            spec,
            shared: Arc::clone(&shared),
            tasks: tasks.clone(),
            rx,
        };
        let guard = exited.clone();
        std::thread::Builder::new()
            .name(format!("vesper-shard-{}", shared.index))
            .spawn(move || worker.run(ready, guard))?;

        match booted.await {
            Ok(Ok(())) => Ok(Arc::new(Self {
                shared,
                tasks,
                exited,
            })),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(VesperError::ShardStopped),
        }
    }

    pub fn index(&self) -> usize {
        self.shared.index
    }

    pub fn generation(&self) -> u64 {
        self.shared.generation
    }

    /// The handler the program registered, if any.
    pub fn handler(&self) -> Option<HandlerInfo> {
        *self.shared.handler.lock()
    }

    /// Requests accepted and not yet released.
    pub fn inflight(&self) -> usize {
        self.shared.inflight.load(Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        self.exited.is_cancelled()
    }

    pub(crate) fn submit(&self, task: Task) -> Result<()> {
        self.tasks.send(task).map_err(|_| VesperError::ShardStopped)
    }

    /// Asks the shard to stop. Returns immediately; see [`Shard::stopped`].
    pub fn stop(&self, mode: StopMode) {
        self.shared.draining.store(true, Ordering::SeqCst);
        if mode == StopMode::Interrupt {
            self.shared.interrupted.store(true, Ordering::SeqCst);
        }
        self.shared.wake.notify_one();
    }

    /// Completes once the shard thread has exited.
    pub async fn stopped(&self) {
        self.exited.cancelled().await
    }

    /// Runs the registered handler for `request`.
    ///
    /// The request gets its own I/O context for the whole exchange; the
    /// context is released when this returns, or later if the script
    /// extended it with `waitUntil`.
    pub(crate) async fn serve(&self, request: HostRequest, next: &dyn Fallthrough) -> Served {
        let Some(info) = self.handler() else {
            return Served {
                style: None,
                outcome: RequestOutcome::NoHandler,
                response: text_response(StatusCode::BAD_GATEWAY, "no handler registered"),
            };
        };
        let style = Some(info.style);
        let interrupted = move || Served {
            style,
            outcome: RequestOutcome::Interrupted,
            response: text_response(StatusCode::SERVICE_UNAVAILABLE, "interrupted"),
        };

        let HostRequest {
            head,
            body,
            remote,
            secure,
            cancel,
        } = request;

        self.shared.inflight.fetch_add(1, Ordering::SeqCst);
        let inbound = cancel.child_token();
        // Ends the request's inbound phase when the exchange is over.
        let _inbound_guard = inbound.clone().drop_guard();
        let lease = self.shared.io_pool.acquire(inbound.clone());
        let shared = Arc::clone(&self.shared);
        lease.register_cleanup(move || shared.finish_request());

        tracing::debug!(
            shard = self.shared.index,
            method = %head.method,
            path = head.path(),
            "Serving request"
        );

        let (done, reply) = oneshot::channel();
        let invocation = Invocation {
            io: Arc::clone(lease.context()),
            head: head.clone(),
            remote,
            secure,
            body: lease.track_stream(body),
            done,
        };
        let job = Box::new(move |context: &mut Context| resolver::invoke(context, invocation));
        if self.submit(job).is_err() {
            return interrupted();
        }

        let Ok(mut pending) = reply.await else {
            return interrupted();
        };
        let (outcome, response) = loop {
            match pending {
                Reply::Respond(response) => break (RequestOutcome::Responded, response),
                Reply::Failed(response) => break (RequestOutcome::ScriptError, response),
                Reply::Fallthrough => break (RequestOutcome::Fallthrough, next.call(head).await),
                Reply::AwaitInner(inner) => {
                    pending = tokio::select! {
                        biased;
                        reply = inner => match reply {
                            Ok(reply) => reply,
                            Err(_) => return interrupted(),
                        },
                        _ = inbound.cancelled() => break (
                            RequestOutcome::Cancelled,
                            text_response(StatusCode::SERVICE_UNAVAILABLE, "request cancelled"),
                        ),
                    };
                }
            }
        };

        Served {
            style,
            outcome,
            response,
        }
    }
}

impl Drop for Shard {
    fn drop(&mut self) {
        self.stop(StopMode::Graceful);
    }
}

/// The shard thread's side.
struct Worker {
    spec: ShardSpec,
    shared: Arc<ShardShared>,
    tasks: TaskSender,
    rx: mpsc::UnboundedReceiver<Task>,
}

impl Worker {
    fn run(mut self, ready: oneshot::Sender<Result<()>>, exited: CancellationToken) {
        let _exited = exited.drop_guard();
        let span = tracing::info_span!(
            "shard",
            shard = self.spec.index,
            generation = self.spec.generation
        );
        let _entered = span.enter();

        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime,
            Err(err) => {
                let _ = ready.send(Err(err.into()));
                return;
            }
        };

        let executor = Rc::new(ShardJobExecutor::new());
        let mut context = match Context::builder()
            .job_executor(Rc::clone(&executor))
            .build()
        {
            Ok(context) => context,
            Err(err) => {
                let _ = ready.send(Err(VesperError::Registration(err.to_string())));
                return;
            }
        };

        let booted = {
            let _guard = runtime.enter();
            self.boot(&mut context, &executor)
        };
        if let Err(err) = booted {
            teardown(context, &executor);
            let _ = ready.send(Err(err));
            return;
        }
        if ready.send(Ok(())).is_err() {
            // Nobody is waiting for this shard any more.
            teardown(context, &executor);
            return;
        }

        tracing::info!(script = %self.spec.script, "Shard ready");
        runtime.block_on(self.event_loop(&mut context, &executor));
        teardown(context, &executor);
        tracing::info!("Shard stopped");
    }

    fn boot(&self, context: &mut Context, executor: &ShardJobExecutor) -> Result<()> {
        if let Some(limit) = self.spec.env.config.max_loop_iterations {
            context.runtime_limits_mut().set_loop_iteration_limit(limit);
        }

        let setup = (|| -> JsResult<()> {
            let host = bindings::host_object(context)?;
            let factories = load_prelude(context, host)?;
            let trampoline = resolver::compile_trampoline(context)?;
            state::install(ShardState {
                index: self.spec.index,
                script: Arc::clone(&self.spec.script),
                env: Arc::clone(&self.spec.env),
                shared: Arc::clone(&self.shared),
                tasks: self.tasks.clone(),
                handler: None,
                trampoline,
                factories,
                facades: Facades::new(
                    self.spec.env.config.pool_capacity,
                    Arc::clone(&self.spec.env.facade_stats),
                ),
                timers: Timers::default(),
            });
            bindings::install_globals(context)
        })();
        setup.map_err(|err| registration(&err, context))?;

        context
            .eval(Source::from_bytes(self.spec.source.as_bytes()))
            .map_err(|err| registration(&err, context))?;
        while executor.has_microtasks() {
            executor.drain_microtasks(context);
        }

        match self.shared.handler.lock().as_ref() {
            Some(info) => tracing::debug!(style = info.style.as_str(), "Program evaluated"),
            None => tracing::warn!("Program evaluated without registering a handler"),
        }
        Ok(())
    }

    async fn event_loop(&mut self, context: &mut Context, executor: &ShardJobExecutor) {
        let context = RefCell::new(context);
        let mut jobs = FuturesUnordered::new();

        loop {
            if executor.has_microtasks() {
                executor.drain_microtasks(&mut context.borrow_mut());
            }
            for job in executor.take_async_jobs() {
                jobs.push(job.call(&context));
            }
            if executor.has_microtasks() {
                continue;
            }

            if self.shared.interrupted.load(Ordering::SeqCst) {
                tracing::warn!(
                    inflight = self.shared.inflight.load(Ordering::SeqCst),
                    "Shard interrupted"
                );
                break;
            }
            if self.shared.draining.load(Ordering::SeqCst)
                && self.shared.inflight.load(Ordering::SeqCst) == 0
                && self.rx.is_empty()
            {
                tracing::debug!(pending_jobs = jobs.len(), "Shard drained");
                break;
            }

            tokio::select! {
                biased;
                _ = self.shared.wake.notified() => {}
                task = self.rx.recv() => match task {
                    Some(task) => task(&mut context.borrow_mut()),
                    // The state holds a sender, so the queue only closes
                    // once the shard is torn down.
                    None => break,
                },
                Some(result) = jobs.next(), if !jobs.is_empty() => {
                    if let Err(err) = result {
                        tracing::warn!("Uncaught error in async job: {err}");
                    }
                }
            }
        }
    }
}

/// Drops interpreter-side objects before the interpreter itself.
fn teardown(context: Context, executor: &ShardJobExecutor) {
    executor.clear();
    drop(state::take());
    drop(context);
}

fn registration(err: &JsError, context: &mut Context) -> VesperError {
    VesperError::Registration(describe_error(err, context))
}

/// Evaluates the prelude and returns the façade factories it exports.
fn load_prelude(context: &mut Context, host: JsObject) -> JsResult<Factories> {
    let install = context.eval(Source::from_bytes(PRELUDE))?;
    let install = callable(&install).ok_or_else(|| type_error("prelude is not a function"))?;
    let exports = install.call(&JsValue::undefined(), &[host.into()], context)?;
    let exports = object_of(&exports).ok_or_else(|| type_error("prelude returned no exports"))?;

    let factory = |name: &str, context: &mut Context| -> JsResult<JsObject> {
        let value = exports.get(JsString::from(name), context)?;
        callable(&value).ok_or_else(|| type_error(format!("prelude does not export {name}")))
    };
    Ok(Factories {
        middleware: factory("middleware", context)?,
        event: factory("event", context)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::HttpTransport;
    use crate::request::{NoContent, RequestHead};
    use crate::stream::ByteStream;
    use http::{Method, Uri};
    use http_body_util::BodyExt;
    use std::time::Duration;

    fn env() -> Arc<ShardEnv> {
        let config = RuntimeConfig::new().with_shards(1);
        Arc::new(ShardEnv {
            io: Handle::current(),
            transport: Arc::new(HttpTransport::new(config.fetch_timeout).unwrap()),
            kv: KvRegistry::new(),
            config,
            context_stats: Arc::new(PoolStats::default()),
            facade_stats: Arc::new(PoolStats::default()),
        })
    }

    async fn shard(source: &str) -> Result<Arc<Shard>> {
        Shard::start(ShardSpec {
            index: 0,
            generation: 1,
            script: Arc::from("test.js"),
            source: Arc::from(source),
            env: env(),
        })
        .await
    }

    fn get(path: &'static str) -> HostRequest {
        HostRequest::new(
            RequestHead::new(Method::GET, Uri::from_static(path)),
            ByteStream::from_bytes(""),
        )
    }

    async fn text(response: HttpResponse) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_start_records_handler() {
        let shard = shard("registerEventHandler(() => {}, { enableFetch: true });")
            .await
            .unwrap();
        assert_eq!(
            shard.handler(),
            Some(HandlerInfo {
                style: HandlerStyle::Event,
                enable_fetch: true
            })
        );
        shard.stop(StopMode::Graceful);
        shard.stopped().await;
        assert!(shard.is_stopped());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_throwing_program_fails_start() {
        let err = shard("throw new Error('boom');").await.unwrap_err();
        assert!(matches!(err, VesperError::Registration(ref message) if message.contains("boom")));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_serve_without_handler() {
        let shard = shard("const x = 1;").await.unwrap();
        let served = shard.serve(get("/"), &NoContent).await;
        assert_eq!(served.outcome, RequestOutcome::NoHandler);
        assert_eq!(served.response.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_serve_middleware_string() {
        let shard = shard("registerMiddlewareHandler(async (ctx) => 'hello ' + ctx.req.path);")
            .await
            .unwrap();
        let served = shard.serve(get("/world"), &NoContent).await;
        assert_eq!(served.outcome, RequestOutcome::Responded);
        assert_eq!(served.response.status(), StatusCode::OK);
        assert_eq!(text(served.response).await, "hello /world");

        // Drained once the context is back in the pool.
        tokio::time::timeout(Duration::from_secs(5), async {
            while shard.inflight() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_serve_after_interrupt() {
        let shard = shard("registerMiddlewareHandler(() => 'late');").await.unwrap();
        shard.stop(StopMode::Interrupt);
        shard.stopped().await;

        let served = shard.serve(get("/"), &NoContent).await;
        assert_eq!(served.outcome, RequestOutcome::Interrupted);
        assert_eq!(served.response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
