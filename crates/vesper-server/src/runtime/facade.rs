//! Pooled request façades.
//!
//! A façade is the object a handler receives: `ctx` for middleware handlers,
//! `evt` for event handlers. The prelude builds the JS side of a façade once
//! per id and the id is pooled; what changes per use is the [`Binding`] that
//! ties it to one request, one [`IoContext`] and one completion channel.
//!
//! Every binding carries a generation number. Arming a façade returns a view
//! whose getters carry the generation of that use, so a view a script kept
//! from an earlier request is rejected instead of reading the new one.

use super::Reply;
use super::conversions::type_error;
use crate::io_context::IoContext;
use crate::request::{HttpResponse, RequestHead, empty_response, text_response};
use crate::stream::TrackedStream;
use boa_engine::JsResult;
use boa_engine::object::JsObject;
use bytes::Bytes;
use http::header::{CONTENT_TYPE, HeaderName, HeaderValue};
use http::{HeaderMap, Response, StatusCode};
use http_body_util::Full;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::oneshot;
use vesper_common::{BoundedPool, PoolStats};
use vesper_metrics::HandlerStyle;

/// One pooled façade and its current binding.
pub(crate) struct FacadeSlot {
    pub style: HandlerStyle,
    pub arm: JsObject,
    pub resolve: JsObject,
    pub reject: JsObject,
    generation: u32,
    binding: Option<Binding>,
}

impl FacadeSlot {
    pub fn new(
        style: HandlerStyle,
        arm: JsObject,
        resolve: JsObject,
        reject: JsObject,
    ) -> Self {
        Self {
            style,
            arm,
            resolve,
            reject,
            generation: 0,
            binding: None,
        }
    }
}

/// Objects handed to the trampoline for one invocation.
pub(crate) struct Armed {
    pub generation: u32,
    pub arm: JsObject,
    pub resolve: JsObject,
    pub reject: JsObject,
}

/// Result of taking a façade id from the pools.
pub(crate) enum Checkout {
    Pooled(u32),
    Fresh(u32),
}

/// All façades of one shard, indexed by id.
pub(crate) struct Facades {
    slots: HashMap<u32, FacadeSlot>,
    middleware: BoundedPool<u32>,
    event: BoundedPool<u32>,
    next_id: u32,
    next_generation: u32,
}

impl Facades {
    pub fn new(capacity: usize, stats: Arc<PoolStats>) -> Self {
        Self {
            slots: HashMap::new(),
            middleware: BoundedPool::with_stats(capacity, Default::default(), Arc::clone(&stats)),
            event: BoundedPool::with_stats(capacity, Default::default(), stats),
            next_id: 0,
            next_generation: 0,
        }
    }

    pub fn checkout(&mut self, style: HandlerStyle) -> Checkout {
        let pool = match style {
            HandlerStyle::Middleware => &self.middleware,
            HandlerStyle::Event => &self.event,
        };
        let next_id = &mut self.next_id;
        let mut fresh = false;
        let id = pool.get_with(|| {
            fresh = true;
            *next_id = next_id.wrapping_add(1);
            *next_id
        });
        if fresh { Checkout::Fresh(id) } else { Checkout::Pooled(id) }
    }

    pub fn insert(&mut self, id: u32, slot: FacadeSlot) {
        self.slots.insert(id, slot);
    }

    /// Attaches `binding` to façade `id` under a new generation.
    pub fn bind(&mut self, id: u32, binding: Binding) -> JsResult<Armed> {
        self.next_generation = self.next_generation.wrapping_add(1).max(1);
        let generation = self.next_generation;
        let slot = self
            .slots
            .get_mut(&id)
            .ok_or_else(|| type_error("unknown façade"))?;
        slot.generation = generation;
        slot.binding = Some(binding);
        Ok(Armed {
            generation,
            arm: slot.arm.clone(),
            resolve: slot.resolve.clone(),
            reject: slot.reject.clone(),
        })
    }

    fn slot(&self, id: u32, generation: u32) -> JsResult<&FacadeSlot> {
        match self.slots.get(&id) {
            Some(slot) if generation != 0 && slot.generation == generation => Ok(slot),
            _ => Err(type_error("request is no longer active")),
        }
    }

    pub fn style(&self, id: u32, generation: u32) -> JsResult<HandlerStyle> {
        self.slot(id, generation).map(|slot| slot.style)
    }

    pub fn binding(&mut self, id: u32, generation: u32) -> JsResult<&mut Binding> {
        self.slot(id, generation)?;
        self.slots
            .get_mut(&id)
            .and_then(|slot| slot.binding.as_mut())
            .ok_or_else(|| type_error("request is no longer active"))
    }

    /// Clears the binding of `id` if it is still at `generation`.
    pub fn reset(&mut self, id: u32, generation: u32) -> bool {
        match self.slots.get_mut(&id) {
            Some(slot) if slot.generation == generation => {
                slot.generation = 0;
                slot.binding = None;
                true
            }
            _ => false,
        }
    }

    /// Returns `id` to its pool, forgetting the façade if the pool is full.
    pub fn release(&mut self, id: u32) {
        let Some(style) = self.slots.get(&id).map(|slot| slot.style) else {
            return;
        };
        let pool = match style {
            HandlerStyle::Middleware => &self.middleware,
            HandlerStyle::Event => &self.event,
        };
        if !pool.put(id) {
            self.slots.remove(&id);
        }
    }
}

/// Per-use state of a façade.
pub(crate) struct Binding {
    io: Arc<IoContext>,
    epoch: u64,
    pub head: RequestHead,
    pub remote: Option<SocketAddr>,
    pub secure: bool,
    /// Streams the script can read; the request body is handle 0
    streams: Vec<TrackedStream>,
    pub fetch_enabled: bool,
    done: Option<oneshot::Sender<Reply>>,
    status: Option<StatusCode>,
    headers: HeaderMap,
    next_invoked: bool,
    responded_with: bool,
    inner: Option<oneshot::Sender<Reply>>,
    inner_rx: Option<oneshot::Receiver<Reply>>,
    extensions: usize,
}

impl Binding {
    pub fn new(
        io: Arc<IoContext>,
        head: RequestHead,
        remote: Option<SocketAddr>,
        secure: bool,
        body: TrackedStream,
        fetch_enabled: bool,
        done: oneshot::Sender<Reply>,
    ) -> Self {
        let epoch = io.epoch();
        Self {
            io,
            epoch,
            head,
            remote,
            secure,
            streams: vec![body],
            fetch_enabled,
            done: Some(done),
            status: None,
            headers: HeaderMap::new(),
            next_invoked: false,
            responded_with: false,
            inner: None,
            inner_rx: None,
            extensions: 0,
        }
    }

    /// The context this binding was created for, unless it was recycled.
    pub fn io(&self) -> JsResult<&Arc<IoContext>> {
        if self.io.epoch() != self.epoch {
            return Err(type_error("request context was recycled"));
        }
        Ok(&self.io)
    }

    pub fn sent(&self) -> bool {
        self.done.is_none()
    }

    /// The stream behind `handle`.
    pub fn stream(&self, handle: u32) -> JsResult<TrackedStream> {
        self.streams
            .get(handle as usize)
            .cloned()
            .ok_or_else(|| type_error(format!("unknown stream {handle}")))
    }

    /// Makes `stream` readable by the script and returns its handle.
    pub fn add_stream(&mut self, stream: TrackedStream) -> u32 {
        self.streams.push(stream);
        (self.streams.len() - 1) as u32
    }

    pub fn responded_with(&self) -> bool {
        self.responded_with
    }

    /// Sends the outer reply. Returns false if one was already sent.
    pub fn finish(&mut self, reply: Reply) -> bool {
        match self.done.take() {
            Some(done) => {
                // The caller may have given up already.
                let _ = done.send(reply);
                true
            }
            None => false,
        }
    }

    pub fn set_status(&mut self, code: u16) -> JsResult<()> {
        if self.sent() {
            return Err(type_error("response already sent"));
        }
        if !(100..=999).contains(&code) {
            return Err(type_error(format!("invalid status code {code}")));
        }
        let status = StatusCode::from_u16(code)
            .map_err(|e| type_error(format!("invalid status code: {e}")))?;
        self.status = Some(status);
        Ok(())
    }

    pub fn set_header(&mut self, name: &str, value: &str) -> JsResult<()> {
        if self.sent() {
            return Err(type_error("response already sent"));
        }
        let (name, value) = header_pair(name, value)?;
        self.headers.insert(name, value);
        Ok(())
    }

    pub fn header(&self, name: &str) -> Option<String> {
        self.headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    }

    /// Response built from the status and headers set so far.
    ///
    /// Without an explicit status, an empty body answers 204 and anything
    /// else 200.
    pub fn response(&self, body: Bytes, content_type: Option<&str>) -> JsResult<HttpResponse> {
        let status = self.status.unwrap_or(if body.is_empty() {
            StatusCode::NO_CONTENT
        } else {
            StatusCode::OK
        });
        let mut headers = self.headers.clone();
        if let Some(content_type) = content_type
            && !body.is_empty()
            && !headers.contains_key(CONTENT_TYPE)
        {
            let value = HeaderValue::from_str(content_type)
                .map_err(|e| type_error(format!("invalid content type: {e}")))?;
            headers.insert(CONTENT_TYPE, value);
        }
        Ok(assemble(status, headers, body))
    }

    /// Writes the response right away, as `res.send` does.
    pub fn write(&mut self, body: Bytes, content_type: Option<&str>) -> JsResult<()> {
        if self.sent() {
            return Err(type_error("response already sent"));
        }
        let response = self.response(body, content_type)?;
        self.finish(Reply::Respond(response));
        Ok(())
    }

    /// Hands the request to the fallthrough collaborator. Only the first
    /// call has an effect.
    pub fn invoke_next(&mut self) {
        if self.next_invoked {
            return;
        }
        self.next_invoked = true;
        self.finish(Reply::Fallthrough);
    }

    pub fn begin_respond(&mut self) -> JsResult<()> {
        if self.responded_with {
            return Err(type_error("respondWith has already been called"));
        }
        if self.sent() {
            return Err(type_error("response already sent"));
        }
        let (tx, rx) = oneshot::channel();
        self.responded_with = true;
        self.inner = Some(tx);
        self.inner_rx = Some(rx);
        Ok(())
    }

    /// The sender settling the `respondWith` response, at most once.
    pub fn take_inner(&mut self) -> Option<oneshot::Sender<Reply>> {
        self.inner.take()
    }

    /// Outer reply for an event handler that called `respondWith`.
    pub fn await_inner(&mut self) -> Reply {
        match self.inner_rx.take() {
            Some(rx) => Reply::AwaitInner(rx),
            None => Reply::Failed(exception_response(
                "Execution exception",
                Some("response already consumed".to_string()),
            )),
        }
    }

    pub fn extend(&mut self) -> JsResult<()> {
        self.io()?
            .extend()
            .map_err(|e| type_error(format!("waitUntil: {e}")))?;
        self.extensions += 1;
        Ok(())
    }

    pub fn conclude_extend(&mut self) {
        if self.extensions > 0 {
            self.extensions -= 1;
            self.io.conclude_extend();
        }
    }
}

impl Drop for Binding {
    fn drop(&mut self) {
        // A shard torn down mid-request never settles its waitUntil
        // promises; release would otherwise wait forever.
        for _ in 0..self.extensions {
            self.io.conclude_extend();
        }
    }
}

pub(crate) fn header_pair(name: &str, value: &str) -> JsResult<(HeaderName, HeaderValue)> {
    let name = HeaderName::from_bytes(name.as_bytes())
        .map_err(|_| type_error(format!("invalid header name: {name:?}")))?;
    let value = HeaderValue::from_str(value)
        .map_err(|_| type_error(format!("invalid value for header {name}")))?;
    Ok((name, value))
}

/// Builds a header map from `[name, value]` pairs, appending duplicates.
pub(crate) fn header_map(pairs: &[(String, String)]) -> JsResult<HeaderMap> {
    let mut headers = HeaderMap::with_capacity(pairs.len());
    for (name, value) in pairs {
        let (name, value) = header_pair(name, value)?;
        headers.append(name, value);
    }
    Ok(headers)
}

/// A 500 carrying `prefix: message`, or an empty 500 for `undefined`.
pub(crate) fn exception_response(prefix: &str, message: Option<String>) -> HttpResponse {
    match message {
        Some(message) => {
            text_response(StatusCode::INTERNAL_SERVER_ERROR, format!("{prefix}: {message}"))
        }
        None => empty_response(StatusCode::INTERNAL_SERVER_ERROR),
    }
}

pub(crate) fn assemble(status: StatusCode, headers: HeaderMap, body: Bytes) -> HttpResponse {
    let mut response = Response::new(Full::new(body));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

/// Every header of a request as `(name, value)` pairs, repeated headers
/// joined with `", "`.
pub(crate) fn request_header_pairs(head: &RequestHead) -> Vec<(String, String)> {
    head.headers
        .keys()
        .map(|name| {
            let joined = head
                .headers
                .get_all(name)
                .iter()
                .filter_map(|v| v.to_str().ok())
                .collect::<Vec<_>>()
                .join(", ");
            (name.as_str().to_string(), joined)
        })
        .collect()
}
