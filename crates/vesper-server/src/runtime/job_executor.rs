//! Shard-local job executor for Boa's job queues
//!
//! Boa hands every promise reaction, generic job and native async job to a
//! [`JobExecutor`]. The shard event loop owns the scheduling: it drains
//! microtasks between tasks and polls native async jobs (timers, fetch, KV,
//! body reads) concurrently with the task queue, so this executor only stores
//! jobs and exposes the queues to the loop.
//!
//! # Job Types
//!
//! - **PromiseJob**: microtasks for promise reactions (then/catch handlers)
//! - **GenericJob**: macrotasks, one per drain
//! - **AsyncJob**: native async jobs, moved into the loop's future set

use boa_engine::{
    Context, JsResult,
    job::{GenericJob, Job, JobExecutor, NativeAsyncJob, PromiseJob},
};
use futures_util::StreamExt;
use futures_util::stream::FuturesUnordered;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

/// Job queues of one shard interpreter.
///
/// Uses `RefCell` because the executor never leaves the shard thread.
#[derive(Default)]
pub struct ShardJobExecutor {
    /// Promise microtasks
    promise_jobs: RefCell<VecDeque<PromiseJob>>,
    /// Native async jobs not yet picked up by the event loop
    async_jobs: RefCell<VecDeque<NativeAsyncJob>>,
    /// General-purpose jobs
    generic_jobs: RefCell<VecDeque<GenericJob>>,
}

impl std::fmt::Debug for ShardJobExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardJobExecutor")
            .field("promise_jobs", &self.promise_jobs.borrow().len())
            .field("async_jobs", &self.async_jobs.borrow().len())
            .field("generic_jobs", &self.generic_jobs.borrow().len())
            .finish()
    }
}

impl ShardJobExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if any queue holds a job.
    pub fn has_pending_jobs(&self) -> bool {
        self.has_microtasks() || !self.async_jobs.borrow().is_empty()
    }

    /// Returns true if promise or generic jobs are waiting.
    pub fn has_microtasks(&self) -> bool {
        !self.promise_jobs.borrow().is_empty() || !self.generic_jobs.borrow().is_empty()
    }

    /// Hands the queued native async jobs to the caller.
    pub fn take_async_jobs(&self) -> VecDeque<NativeAsyncJob> {
        std::mem::take(&mut *self.async_jobs.borrow_mut())
    }

    /// Runs promise jobs until the queue stays empty, plus one generic job.
    ///
    /// Errors are logged; a failing reaction never stops the shard.
    pub fn drain_microtasks(&self, context: &mut Context) {
        let generic = self.generic_jobs.borrow_mut().pop_front();
        if let Some(generic) = generic
            && let Err(err) = generic.call(context)
        {
            tracing::warn!("Uncaught error in generic job: {err}");
        }

        loop {
            let jobs = std::mem::take(&mut *self.promise_jobs.borrow_mut());
            if jobs.is_empty() {
                break;
            }
            for job in jobs {
                if let Err(err) = job.call(context) {
                    tracing::warn!("Uncaught error in promise job: {err}");
                }
            }
        }

        context.clear_kept_objects();
    }

    /// Drops every queued job. Called before the interpreter is torn down.
    pub fn clear(&self) {
        self.promise_jobs.borrow_mut().clear();
        self.async_jobs.borrow_mut().clear();
        self.generic_jobs.borrow_mut().clear();
    }
}

impl JobExecutor for ShardJobExecutor {
    fn enqueue_job(self: Rc<Self>, job: Job, _context: &mut Context) {
        match job {
            Job::PromiseJob(job) => self.promise_jobs.borrow_mut().push_back(job),
            Job::AsyncJob(job) => self.async_jobs.borrow_mut().push_back(job),
            Job::GenericJob(job) => self.generic_jobs.borrow_mut().push_back(job),
            _ => {
                // Timers are native async jobs here, Boa's timeout jobs are unused.
                tracing::warn!("Unsupported job type enqueued, ignoring");
            }
        }
    }

    /// Runs microtasks only; async jobs are left for the shard event loop.
    fn run_jobs(self: Rc<Self>, context: &mut Context) -> JsResult<()> {
        while self.has_microtasks() {
            self.drain_microtasks(context);
        }
        Ok(())
    }

    /// Runs every queue to completion, polling async jobs concurrently.
    async fn run_jobs_async(self: Rc<Self>, context: &RefCell<&mut Context>) -> JsResult<()>
    where
        Self: Sized,
    {
        let mut group = FuturesUnordered::new();

        loop {
            for job in self.take_async_jobs() {
                group.push(job.call(context));
            }

            self.drain_microtasks(&mut context.borrow_mut());

            if group.is_empty() && !self.has_pending_jobs() {
                return Ok(());
            }

            if !group.is_empty()
                && let Some(Err(err)) = group.next().await
            {
                tracing::warn!("Uncaught error in async job: {err}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use boa_engine::{JsValue, Source};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn context_with(executor: &Rc<ShardJobExecutor>) -> Context {
        Context::builder()
            .job_executor(executor.clone())
            .build()
            .unwrap()
    }

    #[test]
    fn test_new_executor_is_idle() {
        let executor = ShardJobExecutor::new();
        assert!(!executor.has_pending_jobs());
        assert!(!executor.has_microtasks());
    }

    #[test]
    fn test_drain_runs_promise_reactions() {
        let executor = Rc::new(ShardJobExecutor::new());
        let mut context = context_with(&executor);

        context
            .eval(Source::from_bytes(
                "globalThis.seen = 0; Promise.resolve(1).then(v => v + 1).then(v => { seen = v; });",
            ))
            .unwrap();
        assert!(executor.has_microtasks());

        executor.drain_microtasks(&mut context);
        assert!(!executor.has_microtasks());

        let seen = context.eval(Source::from_bytes("seen")).unwrap();
        assert_eq!(seen.as_number(), Some(2.0));
    }

    #[tokio::test]
    async fn test_run_jobs_async_runs_generic_jobs() {
        let executor = Rc::new(ShardJobExecutor::new());
        let mut context = context_with(&executor);
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let counter = Arc::clone(&counter);
            let realm = context.realm().clone();
            let job = Job::GenericJob(GenericJob::new(
                move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(JsValue::undefined())
                },
                realm,
            ));
            executor.clone().enqueue_job(job, &mut context);
        }

        executor
            .clone()
            .run_jobs_async(&RefCell::new(&mut context))
            .await
            .unwrap();

        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert!(!executor.has_pending_jobs());
    }

    #[test]
    fn test_clear_drops_queued_jobs() {
        let executor = Rc::new(ShardJobExecutor::new());
        let mut context = context_with(&executor);
        context
            .eval(Source::from_bytes("Promise.resolve().then(() => {});"))
            .unwrap();
        assert!(executor.has_pending_jobs());

        executor.clear();
        assert!(!executor.has_pending_jobs());
    }
}
