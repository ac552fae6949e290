//! Per-request resource context.
//!
//! An [`IoContext`] owns everything a single request may leave behind once
//! its script has produced a response: outbound calls still in flight,
//! background work registered through `waitUntil`, request body streams the
//! script never read, and cleanup callbacks. Contexts are pooled; a context
//! only goes back to its pool after [`IoContext::release`] has run to
//! completion.
//!
//! # Lifecycle
//!
//! ```text
//! Idle --bind--> Bound --extend--> Extended
//!                  |                  |
//!                  +----release-------+--> Draining --> Idle
//! ```
//!
//! `release` decides when the extended signal is cancelled: after all
//! extension work concluded if `extend` was ever called, otherwise when the
//! inbound request signal fires. It then waits for outbound work, drains
//! tracked streams and runs cleanups in reverse registration order.

use crate::stream::{ByteStream, TrackedStream};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use vesper_common::{BoundedPool, PoolStats, Result, VesperError, WaitGroup};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    /// Sitting in the pool
    Idle,
    /// Checked out for a request
    Bound,
    /// Bound, and `extend` was called at least once
    Extended,
    /// `release` has begun
    Draining,
}

type Cleanup = Box<dyn FnOnce() + Send>;

struct Inner {
    state: ContextState,
    epoch: u64,
    extension_requested: bool,
    inbound: CancellationToken,
    extended: CancellationToken,
    cleanups: Vec<Cleanup>,
    streams: Vec<TrackedStream>,
}

pub struct IoContext {
    inner: Mutex<Inner>,
    extension: WaitGroup,
    outbound: WaitGroup,
    limiter: Arc<Semaphore>,
    limit: usize,
}

impl std::fmt::Debug for IoContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoContext")
            .field("state", &self.state())
            .field("limit", &self.limit)
            .field("outbound", &self.outbound.count())
            .field("extension", &self.extension.count())
            .finish()
    }
}

impl IoContext {
    /// Creates an idle context allowing `outbound_limit` concurrent outbound
    /// calls.
    pub fn new(outbound_limit: usize) -> Self {
        let limit = outbound_limit.max(1);
        Self {
            inner: Mutex::new(Inner {
                state: ContextState::Idle,
                epoch: 0,
                extension_requested: false,
                inbound: CancellationToken::new(),
                extended: CancellationToken::new(),
                cleanups: Vec::new(),
                streams: Vec::new(),
            }),
            extension: WaitGroup::new(),
            outbound: WaitGroup::new(),
            limiter: Arc::new(Semaphore::new(limit)),
            limit,
        }
    }

    /// Arms the context for a new request.
    pub fn bind(&self, inbound: CancellationToken) {
        let mut inner = self.inner.lock();
        debug_assert_eq!(inner.state, ContextState::Idle, "binding a context in use");
        inner.state = ContextState::Bound;
        inner.epoch = inner.epoch.wrapping_add(1);
        inner.extension_requested = false;
        inner.inbound = inbound;
        inner.extended = CancellationToken::new();
    }

    pub fn state(&self) -> ContextState {
        self.inner.lock().state
    }

    /// Changes on every `bind`, letting holders detect that the context was
    /// recycled for another request.
    pub fn epoch(&self) -> u64 {
        self.inner.lock().epoch
    }

    pub fn outbound_limit(&self) -> usize {
        self.limit
    }

    /// Keeps the context alive past the response until the matching
    /// [`conclude_extend`](Self::conclude_extend).
    ///
    /// # Errors
    ///
    /// Fails once `release` has begun, or when the context is not bound.
    pub fn extend(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        match inner.state {
            ContextState::Bound | ContextState::Extended => {
                inner.state = ContextState::Extended;
                inner.extension_requested = true;
                // Counted under the lock `release` reads the state with.
                self.extension.add(1);
                Ok(())
            }
            ContextState::Draining => Err(VesperError::ContextDraining),
            ContextState::Idle => Err(VesperError::ContextNotBound),
        }
    }

    pub fn conclude_extend(&self) {
        self.extension.done();
    }

    /// The signal outbound work started by the script must observe.
    ///
    /// Switches from the inbound signal to the extended one on the first
    /// `extend` and never switches back.
    pub fn effective_signal(&self) -> CancellationToken {
        let inner = self.inner.lock();
        if inner.extension_requested {
            inner.extended.clone()
        } else {
            inner.inbound.clone()
        }
    }

    pub fn inbound_signal(&self) -> CancellationToken {
        self.inner.lock().inbound.clone()
    }

    /// Reserves one outbound slot.
    ///
    /// The outstanding-work counter is raised before this returns, so a
    /// `release` that starts afterwards waits for the call. The returned
    /// future resolves once the limiter admits the call, or fails with
    /// [`VesperError::Cancelled`] if the effective signal fires first.
    pub fn acquire_outbound_token(
        self: &Arc<Self>,
    ) -> impl Future<Output = Result<OutboundToken>> + Send + use<> {
        let idle = self.state() == ContextState::Idle;
        let signal = self.effective_signal();
        let work = WorkGuard::new(Arc::clone(self));
        let limiter = Arc::clone(&self.limiter);

        async move {
            if idle {
                return Err(VesperError::ContextNotBound);
            }
            let permit = tokio::select! {
                biased;
                _ = signal.cancelled() => return Err(VesperError::Cancelled),
                permit = limiter.acquire_owned() => permit.map_err(|_| VesperError::Cancelled)?,
            };
            Ok(OutboundToken {
                work,
                _permit: permit,
                signal,
            })
        }
    }

    /// Counts work `release` must wait for without taking a limiter slot.
    pub fn track_work(self: &Arc<Self>) -> WorkGuard {
        WorkGuard::new(Arc::clone(self))
    }

    /// Registers a callback run at the end of `release`, newest first.
    pub fn register_cleanup(&self, cleanup: impl FnOnce() + Send + 'static) {
        self.inner.lock().cleanups.push(Box::new(cleanup));
    }

    /// Hands a stream to the context so unread bytes are drained on release.
    pub fn track_stream(&self, stream: ByteStream) -> TrackedStream {
        let tracked = TrackedStream::new(stream);
        self.inner.lock().streams.push(tracked.clone());
        tracked
    }

    /// Drains the context and returns it to the idle state.
    ///
    /// Calling it on a context that is not bound does nothing.
    pub async fn release(&self) {
        let (inbound, extended, was_extended) = {
            let mut inner = self.inner.lock();
            if matches!(inner.state, ContextState::Idle | ContextState::Draining) {
                return;
            }
            inner.state = ContextState::Draining;
            (
                inner.inbound.clone(),
                inner.extended.clone(),
                inner.extension_requested,
            )
        };

        if was_extended {
            self.extension.wait().await;
        } else {
            inbound.cancelled().await;
        }
        extended.cancel();

        self.outbound.wait().await;

        let streams = std::mem::take(&mut self.inner.lock().streams);
        for stream in streams {
            if let Err(e) = stream.discard().await {
                tracing::debug!(error = %e, "Failed to drain request stream");
            }
        }

        let cleanups = std::mem::take(&mut self.inner.lock().cleanups);
        for cleanup in cleanups.into_iter().rev() {
            cleanup();
        }

        let mut inner = self.inner.lock();
        inner.state = ContextState::Idle;
        inner.extension_requested = false;
        inner.inbound = CancellationToken::new();
        inner.extended = CancellationToken::new();
    }
}

/// One unit of outstanding work on an [`IoContext`].
pub struct WorkGuard {
    ctx: Arc<IoContext>,
}

impl WorkGuard {
    fn new(ctx: Arc<IoContext>) -> Self {
        ctx.outbound.add(1);
        Self { ctx }
    }
}

impl Drop for WorkGuard {
    fn drop(&mut self) {
        self.ctx.outbound.done();
    }
}

/// An admitted outbound call. Dropping it frees the limiter slot.
pub struct OutboundToken {
    work: WorkGuard,
    _permit: OwnedSemaphorePermit,
    signal: CancellationToken,
}

impl OutboundToken {
    /// The signal captured when the token was requested.
    pub fn signal(&self) -> &CancellationToken {
        &self.signal
    }

    /// Tracks a stream the call produced on the admitting context.
    pub fn track_stream(&self, stream: ByteStream) -> TrackedStream {
        self.work.ctx.track_stream(stream)
    }
}

/// Pool of idle contexts for one shard.
///
/// Releases run on `io`, so dropping a lease never blocks the caller.
pub struct IoContextPool {
    pool: BoundedPool<Arc<IoContext>>,
    outbound_limit: usize,
    io: Handle,
}

impl IoContextPool {
    pub fn new(capacity: usize, outbound_limit: usize, stats: Arc<PoolStats>, io: Handle) -> Self {
        Self {
            pool: BoundedPool::with_stats(capacity, Default::default(), stats),
            outbound_limit,
            io,
        }
    }

    /// Checks out a context bound to `inbound`.
    pub fn acquire(self: &Arc<Self>, inbound: CancellationToken) -> IoLease {
        let ctx = self
            .pool
            .get_with(|| Arc::new(IoContext::new(self.outbound_limit)));
        ctx.bind(inbound);
        IoLease {
            ctx: Some(ctx),
            pool: Arc::clone(self),
        }
    }

    pub fn idle(&self) -> usize {
        self.pool.len()
    }
}

/// A checked-out context. Dropping the lease releases it in the background.
pub struct IoLease {
    ctx: Option<Arc<IoContext>>,
    pool: Arc<IoContextPool>,
}

impl IoLease {
    pub fn context(&self) -> &Arc<IoContext> {
        // Only taken in Drop.
        self.ctx.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl std::ops::Deref for IoLease {
    type Target = IoContext;

    fn deref(&self) -> &IoContext {
        self.context()
    }
}

impl Drop for IoLease {
    fn drop(&mut self) {
        let Some(ctx) = self.ctx.take() else {
            return;
        };
        let pool = Arc::clone(&self.pool);
        self.pool.io.spawn(async move {
            ctx.release().await;
            pool.pool.put(ctx);
        });
    }
}
