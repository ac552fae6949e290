//! Interpreter-side state of a shard.
//!
//! Host functions are plain function pointers, so everything they need is
//! kept in a thread-local [`ShardState`] owned by the shard thread. Access
//! goes through [`with_state`], which refuses re-entrant borrows instead of
//! panicking. Never call into the interpreter while the state is borrowed:
//! convert arguments first, then borrow.

use super::conversions::type_error;
use super::facade::Facades;
use super::shard::{ShardEnv, ShardShared, TaskSender};
use super::HandlerInfo;
use boa_engine::JsResult;
use boa_engine::object::JsObject;
use std::cell::RefCell;
use std::collections::HashSet;
use std::sync::Arc;

thread_local! {
    static STATE: RefCell<Option<ShardState>> = const { RefCell::new(None) };
}

/// The registered handler of a shard.
#[derive(Clone)]
pub(crate) struct Handler {
    pub function: JsObject,
    pub info: HandlerInfo,
}

/// Façade constructors returned by the prelude.
#[derive(Clone)]
pub(crate) struct Factories {
    pub middleware: JsObject,
    pub event: JsObject,
}

#[derive(Debug, Default)]
pub(crate) struct Timers {
    next_id: u32,
    pending: HashSet<u32>,
}

impl Timers {
    pub fn schedule(&mut self) -> u32 {
        self.next_id = self.next_id.wrapping_add(1).max(1);
        self.pending.insert(self.next_id);
        self.next_id
    }

    /// Returns true if the timer was still pending.
    pub fn fire(&mut self, id: u32) -> bool {
        self.pending.remove(&id)
    }

    pub fn cancel(&mut self, id: u32) {
        self.pending.remove(&id);
    }
}

pub(crate) struct ShardState {
    pub index: usize,
    pub script: Arc<str>,
    pub env: Arc<ShardEnv>,
    pub shared: Arc<ShardShared>,
    pub tasks: TaskSender,
    pub handler: Option<Handler>,
    pub trampoline: JsObject,
    pub factories: Factories,
    pub facades: Facades,
    pub timers: Timers,
}

/// Runs `f` against the state of the current shard.
pub(crate) fn with_state<R>(f: impl FnOnce(&mut ShardState) -> JsResult<R>) -> JsResult<R> {
    STATE.with(|cell| {
        let mut guard = cell
            .try_borrow_mut()
            .map_err(|_| type_error("shard state is already in use"))?;
        let state = guard
            .as_mut()
            .ok_or_else(|| type_error("no shard is running on this thread"))?;
        f(state)
    })
}

pub(crate) fn install(state: ShardState) {
    STATE.with(|cell| *cell.borrow_mut() = Some(state));
}

/// Removes the state so it can be dropped before the interpreter.
pub(crate) fn take() -> Option<ShardState> {
    STATE.with(|cell| cell.borrow_mut().take())
}
