//! Host functions exposed to scripts.
//!
//! Two groups are installed into every shard:
//!
//! - the `host` object, handed to the prelude only. Its functions take the
//!   façade id and generation as their first two arguments and operate on
//!   the matching [`Binding`](super::facade::Binding).
//! - globals the script calls directly: `registerMiddlewareHandler`
//!   (alias `registerExpressHandler`), `registerEventHandler`, `setTimeout`
//!   and `clearTimeout`.
//!
//! Anything that waits on I/O runs on the server's tokio runtime and settles
//! a promise through a native async job, so the shard thread never blocks.
//!
//! Byte streams are addressed by handle within a binding: handle 0 is the
//! request body and every fetch response adds one.

use super::conversions::{
    arg, callable, describe, js_str, object_of, optional_string, pairs_to_js, rust_string,
    string_pairs, strings_to_js, type_error,
};
use super::facade::{Binding, assemble, exception_response, header_map, request_header_pairs};
use super::props::{FacadeProps, PropertyBag, RequestProps};
use super::state::{Handler, with_state};
use super::{HandlerInfo, Reply};
use crate::fetch::{OutboundRequest, send_admitted};
use crate::io_context::WorkGuard;
use crate::kv::{KvOp, KvOutput};
use crate::stream::TrackedStream;
use boa_engine::{
    Context, JsNativeError, JsResult, JsString, JsValue, js_string,
    job::{Job, NativeAsyncJob},
    native_function::{NativeFunction, NativeFunctionPointer},
    object::{
        FunctionObjectBuilder, JsObject,
        builtins::{JsArray, JsPromise, JsUint8Array},
    },
};
use bytes::Bytes;
use http::{Method, StatusCode};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use vesper_common::VesperError;
use vesper_metrics::HandlerStyle;

/// Body kinds passed to `host.settleRespond`.
const BODY_EMPTY: u32 = 0;
const BODY_TEXT: u32 = 1;
const BODY_STREAM: u32 = 2;

/// Largest chunk a single `host.streamRead` returns.
const MAX_READ_CHUNK: usize = 64 * 1024;

fn function(
    context: &mut Context,
    name: &str,
    length: usize,
    f: NativeFunctionPointer,
) -> JsObject {
    FunctionObjectBuilder::new(context.realm(), NativeFunction::from_fn_ptr(f))
        .name(JsString::from(name))
        .length(length)
        .build()
        .into()
}

/// Builds the `host` object the prelude closes over.
pub(crate) fn host_object(context: &mut Context) -> JsResult<JsObject> {
    let methods: [(&str, usize, NativeFunctionPointer); 23] = [
        ("reqKeys", 2, req_keys),
        ("reqProp", 3, req_prop),
        ("reqHeader", 3, req_header),
        ("reqHeaders", 2, req_headers),
        ("readText", 3, read_text),
        ("streamRead", 4, stream_read),
        ("streamClose", 3, stream_close),
        ("facadeHas", 3, facade_has),
        ("resStatus", 3, res_status),
        ("resSet", 4, res_set),
        ("resGet", 3, res_get),
        ("resWrite", 4, res_write),
        ("resHeadersSent", 2, res_headers_sent),
        ("next", 2, next),
        ("beginRespond", 2, begin_respond),
        ("settleRespond", 6, settle_respond),
        ("failRespond", 3, fail_respond),
        ("extend", 2, extend),
        ("concludeExtend", 2, conclude_extend),
        ("fetch", 6, fetch),
        ("kv", 6, kv),
        ("kvNames", 0, kv_names),
        ("log", 2, log),
    ];

    let host = JsObject::with_object_proto(context.intrinsics());
    for (name, length, f) in methods {
        let value = function(context, name, length, f);
        host.create_data_property_or_throw(JsString::from(name), value, context)?;
    }
    Ok(host)
}

/// Registers the script-facing globals.
pub(crate) fn install_globals(context: &mut Context) -> JsResult<()> {
    let globals: [(JsString, usize, NativeFunctionPointer); 5] = [
        (js_string!("registerMiddlewareHandler"), 2, register_middleware),
        (js_string!("registerExpressHandler"), 2, register_middleware),
        (js_string!("registerEventHandler"), 2, register_event),
        (js_string!("setTimeout"), 2, set_timeout),
        (js_string!("clearTimeout"), 1, clear_timeout),
    ];
    for (name, length, f) in globals {
        context.register_global_callable(name, length, NativeFunction::from_fn_ptr(f))?;
    }
    Ok(())
}

/// Settles a fresh promise with the output of a task running on the
/// server runtime.
///
/// `settle` converts the task's value on the shard thread; an `Err` from the
/// task rejects the promise with an `Error` carrying the message.
fn promise_from<T: 'static>(
    context: &mut Context,
    handle: JoinHandle<Result<T, String>>,
    settle: impl FnOnce(T, &mut Context) -> JsResult<JsValue> + 'static,
) -> JsValue {
    let (promise, resolvers) = JsPromise::new_pending(context);

    let job = NativeAsyncJob::new(async move |context| {
        let outcome = match handle.await {
            Ok(outcome) => outcome,
            Err(e) => Err(format!("host task failed: {e}")),
        };

        let mut context = context.borrow_mut();
        let settled = match outcome {
            Ok(value) => settle(value, &mut context),
            Err(message) => Err(JsNativeError::error().with_message(message).into()),
        };
        match settled {
            Ok(value) => resolvers
                .resolve
                .call(&JsValue::undefined(), &[value], &mut context),
            Err(err) => {
                let reason = err.to_opaque(&mut context);
                resolvers
                    .reject
                    .call(&JsValue::undefined(), &[reason], &mut context)
            }
        }
    });
    context.enqueue_job(Job::AsyncJob(job));

    promise.into()
}

fn facade_args(args: &[JsValue], context: &mut Context) -> JsResult<(u32, u32)> {
    let id = arg(args, 0).to_u32(context)?;
    let generation = arg(args, 1).to_u32(context)?;
    Ok((id, generation))
}

/// Runs `f` on the binding addressed by the first two arguments.
fn on_binding<R>(
    id: u32,
    generation: u32,
    f: impl FnOnce(&mut Binding) -> JsResult<R>,
) -> JsResult<R> {
    with_state(|state| f(state.facades.binding(id, generation)?))
}

fn request_props(binding: &Binding) -> RequestProps<'_> {
    RequestProps {
        head: &binding.head,
        remote: binding.remote,
        secure: binding.secure,
    }
}

fn req_keys(_: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let (id, generation) = facade_args(args, context)?;
    let keys = on_binding(id, generation, |binding| Ok(request_props(binding).keys()))?;
    Ok(strings_to_js(keys, context))
}

fn req_prop(_: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let (id, generation) = facade_args(args, context)?;
    let name = rust_string(&arg(args, 2), context)?;
    on_binding(id, generation, |binding| {
        Ok(request_props(binding).get(&name).unwrap_or_default())
    })
}

fn req_header(_: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let (id, generation) = facade_args(args, context)?;
    let name = rust_string(&arg(args, 2), context)?.to_ascii_lowercase();
    let value = on_binding(id, generation, |binding| {
        Ok(request_header_pairs(&binding.head)
            .into_iter()
            .find_map(|(header, value)| (header == name).then_some(value)))
    })?;
    Ok(value.map_or_else(JsValue::null, |v| js_str(&v)))
}

fn req_headers(_: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let (id, generation) = facade_args(args, context)?;
    let pairs = on_binding(id, generation, |binding| Ok(request_header_pairs(&binding.head)))?;
    Ok(pairs_to_js(&pairs, context))
}

/// Everything a task needs to read stream `handle` off the shard thread.
struct StreamAccess {
    stream: TrackedStream,
    work: WorkGuard,
    limit: usize,
    io: Handle,
}

fn stream_access(args: &[JsValue], context: &mut Context) -> JsResult<StreamAccess> {
    let (id, generation) = facade_args(args, context)?;
    let handle = arg(args, 2).to_u32(context)?;
    with_state(|state| {
        let limit = state.env.config.max_body_bytes;
        let io = state.env.io.clone();
        let binding = state.facades.binding(id, generation)?;
        Ok(StreamAccess {
            stream: binding.stream(handle)?,
            work: binding.io()?.track_work(),
            limit,
            io,
        })
    })
}

fn read_text(_: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let StreamAccess {
        stream,
        work,
        limit,
        io,
    } = stream_access(args, context)?;

    let handle = io.spawn(async move {
        let _work = work;
        stream.read_to_end(limit).await.map_err(|e| e.to_string())
    });
    Ok(promise_from(context, handle, |bytes, _| {
        Ok(js_str(&String::from_utf8_lossy(&bytes)))
    }))
}

/// Resolves to a `Uint8Array` of at most the requested size, or `null` at
/// end of stream.
fn stream_read(_: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let access = stream_access(args, context)?;
    let size = arg(args, 3).to_number(context)?;
    if !size.is_finite() || size < 1.0 {
        return Err(JsNativeError::range()
            .with_message(format!("invalid read size {size}"))
            .into());
    }
    let size = (size as usize).min(MAX_READ_CHUNK);

    let StreamAccess {
        stream, work, io, ..
    } = access;
    let handle = io.spawn(async move {
        let _work = work;
        stream.read_chunk(size).await.map_err(|e| e.to_string())
    });
    Ok(promise_from(context, handle, |chunk, context| match chunk {
        Some(bytes) => Ok(JsUint8Array::from_iter(bytes.iter().copied(), context)?.into()),
        None => Ok(JsValue::null()),
    }))
}

fn stream_close(_: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let StreamAccess {
        stream, work, io, ..
    } = stream_access(args, context)?;
    let handle = io.spawn(async move {
        let _work = work;
        stream.close().await;
        Ok(())
    });
    Ok(promise_from(context, handle, |(), _| Ok(JsValue::undefined())))
}

fn facade_has(_: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let (id, generation) = facade_args(args, context)?;
    let name = rust_string(&arg(args, 2), context)?;
    with_state(|state| {
        let style = state.facades.style(id, generation)?;
        let fetch_enabled = state.facades.binding(id, generation)?.fetch_enabled;
        Ok(JsValue::new(FacadeProps { style, fetch_enabled }.has(&name)))
    })
}

fn status_arg(value: &JsValue, context: &mut Context) -> JsResult<u16> {
    let code = value.to_number(context)?;
    if code.fract() != 0.0 || !(100.0..=999.0).contains(&code) {
        return Err(type_error(format!("invalid status code {code}")));
    }
    Ok(code as u16)
}

fn res_status(_: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let (id, generation) = facade_args(args, context)?;
    let code = status_arg(&arg(args, 2), context)?;
    on_binding(id, generation, |binding| binding.set_status(code))?;
    Ok(JsValue::undefined())
}

fn res_set(_: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let (id, generation) = facade_args(args, context)?;
    let name = rust_string(&arg(args, 2), context)?;
    let value = rust_string(&arg(args, 3), context)?;
    on_binding(id, generation, |binding| binding.set_header(&name, &value))?;
    Ok(JsValue::undefined())
}

fn res_get(_: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let (id, generation) = facade_args(args, context)?;
    let name = rust_string(&arg(args, 2), context)?;
    let value = on_binding(id, generation, |binding| Ok(binding.header(&name)))?;
    Ok(value.map_or_else(JsValue::null, |v| js_str(&v)))
}

fn res_write(_: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let (id, generation) = facade_args(args, context)?;
    let body = rust_string(&arg(args, 2), context)?;
    let content_type = optional_string(&arg(args, 3), context)?;
    on_binding(id, generation, |binding| {
        binding.write(Bytes::from(body), content_type.as_deref())
    })?;
    Ok(JsValue::undefined())
}

fn res_headers_sent(_: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let (id, generation) = facade_args(args, context)?;
    on_binding(id, generation, |binding| Ok(JsValue::new(binding.sent())))
}

fn next(_: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let (id, generation) = facade_args(args, context)?;
    on_binding(id, generation, |binding| {
        binding.invoke_next();
        Ok(JsValue::undefined())
    })
}

fn begin_respond(_: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let (id, generation) = facade_args(args, context)?;
    on_binding(id, generation, |binding| binding.begin_respond())?;
    Ok(JsValue::undefined())
}

/// Body of a settled `respondWith` as passed by the prelude.
enum Settled {
    Bytes(Bytes),
    Stream(u32),
}

/// Body of a settled `respondWith`, ready to be sent.
enum Outgoing {
    Bytes(Bytes),
    Stream(TrackedStream, WorkGuard, usize, Handle),
}

fn settle_respond(_: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let (id, generation) = facade_args(args, context)?;
    let status = status_arg(&arg(args, 2), context)?;
    let status = StatusCode::from_u16(status).map_err(|e| type_error(e.to_string()))?;
    let headers = header_map(&string_pairs(&arg(args, 3), context)?)?;
    let body = match arg(args, 4).to_u32(context)? {
        BODY_EMPTY => Settled::Bytes(Bytes::new()),
        BODY_TEXT => Settled::Bytes(Bytes::from(rust_string(&arg(args, 5), context)?)),
        BODY_STREAM => Settled::Stream(arg(args, 5).to_u32(context)?),
        other => return Err(type_error(format!("unknown body kind {other}"))),
    };

    let (inner, outgoing) = with_state(|state| {
        let limit = state.env.config.max_body_bytes;
        let io = state.env.io.clone();
        let binding = state.facades.binding(id, generation)?;
        let outgoing = match body {
            Settled::Bytes(bytes) => Outgoing::Bytes(bytes),
            Settled::Stream(handle) => {
                let work = binding.io()?.track_work();
                Outgoing::Stream(binding.stream(handle)?, work, limit, io)
            }
        };
        let inner = binding
            .take_inner()
            .ok_or_else(|| type_error("response already settled"))?;
        Ok((inner, outgoing))
    })?;

    match outgoing {
        Outgoing::Bytes(bytes) => {
            let _ = inner.send(Reply::Respond(assemble(status, headers, bytes)));
        }
        Outgoing::Stream(stream, work, limit, io) => {
            io.spawn(async move {
                let _work = work;
                let reply = match stream.read_to_end(limit).await {
                    Ok(bytes) => Reply::Respond(assemble(status, headers, bytes)),
                    Err(e) => Reply::Failed(exception_response(
                        "Execution exception",
                        Some(e.to_string()),
                    )),
                };
                let _ = inner.send(reply);
            });
        }
    }
    Ok(JsValue::undefined())
}

fn fail_respond(_: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let (id, generation) = facade_args(args, context)?;
    let message = describe(&arg(args, 2), context);
    let inner = on_binding(id, generation, |binding| Ok(binding.take_inner()))?;
    match inner {
        Some(inner) => {
            let _ = inner.send(Reply::Failed(exception_response("Execution exception", message)));
        }
        None => tracing::warn!(
            error = message.as_deref().unwrap_or("undefined"),
            "respondWith rejected after the response was settled"
        ),
    }
    Ok(JsValue::undefined())
}

fn extend(_: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let (id, generation) = facade_args(args, context)?;
    on_binding(id, generation, |binding| binding.extend())?;
    Ok(JsValue::undefined())
}

fn conclude_extend(_: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let (id, generation) = facade_args(args, context)?;
    on_binding(id, generation, |binding| {
        binding.conclude_extend();
        Ok(JsValue::undefined())
    })
}

fn fetch_error(err: VesperError) -> String {
    match err {
        VesperError::Cancelled => "fetch aborted".to_string(),
        other => other.to_string(),
    }
}

fn fetch(_: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let (id, generation) = facade_args(args, context)?;
    let url = rust_string(&arg(args, 2), context)?;
    let method = rust_string(&arg(args, 3), context)?;
    let method = Method::from_bytes(method.as_bytes())
        .map_err(|_| type_error(format!("invalid method {method:?}")))?;
    let headers = string_pairs(&arg(args, 4), context)?;
    let body = optional_string(&arg(args, 5), context)?;
    let request = OutboundRequest {
        method,
        url,
        headers,
        body: body.map(Bytes::from),
    };

    let (admit, transport, io) = with_state(|state| {
        let transport = Arc::clone(&state.env.transport);
        let io = state.env.io.clone();
        let binding = state.facades.binding(id, generation)?;
        if !binding.fetch_enabled {
            return Err(type_error("fetch is not enabled for this handler"));
        }
        Ok((binding.io()?.acquire_outbound_token(), transport, io))
    })?;

    let handle = io.spawn(async move {
        let token = admit.await.map_err(fetch_error)?;
        send_admitted(transport.as_ref(), token, request)
            .await
            .map_err(fetch_error)
    });

    Ok(promise_from(context, handle, move |response, context| {
        let body = on_binding(id, generation, |binding| Ok(binding.add_stream(response.body)))?;
        let headers = pairs_to_js(&response.headers, context);
        let values = [
            JsValue::new(i32::from(response.status)),
            headers,
            JsValue::new(body),
            js_str(&response.url),
        ];
        Ok(JsArray::from_iter(values, context).into())
    }))
}

fn kv(_: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let (id, generation) = facade_args(args, context)?;
    let name = rust_string(&arg(args, 2), context)?;
    let op = rust_string(&arg(args, 3), context)?;
    let key = rust_string(&arg(args, 4), context)?;
    let value = optional_string(&arg(args, 5), context)?;
    let op = match op.as_str() {
        "get" => KvOp::Get(key),
        "put" => KvOp::Put(key, Bytes::from(value.unwrap_or_default())),
        "del" => KvOp::Del(key),
        other => return Err(type_error(format!("unknown kv operation {other:?}"))),
    };

    let (store, admit, io) = with_state(|state| {
        let store = state
            .env
            .kv
            .get(&name)
            .ok_or_else(|| type_error(format!("unknown kv binding {name:?}")))?;
        let io = state.env.io.clone();
        let binding = state.facades.binding(id, generation)?;
        Ok((store, binding.io()?.acquire_outbound_token(), io))
    })?;

    let handle = io.spawn(async move {
        let token = admit.await.map_err(|e| e.to_string())?;
        let signal = token.signal().clone();
        let output = tokio::select! {
            biased;
            _ = signal.cancelled() => Err(VesperError::Cancelled),
            output = op.apply(store.as_ref()) => output,
        };
        drop(token);
        output.map_err(|e| e.to_string())
    });

    Ok(promise_from(context, handle, |output, _| {
        Ok(match output {
            KvOutput::Value(Some(bytes)) => js_str(&String::from_utf8_lossy(&bytes)),
            KvOutput::Value(None) => JsValue::null(),
            KvOutput::Stored => JsValue::undefined(),
            KvOutput::Deleted(existed) => JsValue::new(existed),
        })
    }))
}

fn kv_names(_: &JsValue, _args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let names = with_state(|state| Ok(state.env.kv.names()))?;
    Ok(strings_to_js(names.iter().map(String::as_str), context))
}

fn log(_: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let level = rust_string(&arg(args, 0), context)?;
    let message = rust_string(&arg(args, 1), context)?;
    let (shard, script) = with_state(|state| Ok((state.index, Arc::clone(&state.script))))?;
    let script = script.as_ref();

    match level.as_str() {
        "error" => tracing::error!(target: "vesper::script", shard, script, "{message}"),
        "warn" => tracing::warn!(target: "vesper::script", shard, script, "{message}"),
        "debug" => tracing::debug!(target: "vesper::script", shard, script, "{message}"),
        "trace" => tracing::trace!(target: "vesper::script", shard, script, "{message}"),
        _ => tracing::info!(target: "vesper::script", shard, script, "{message}"),
    }
    Ok(JsValue::undefined())
}

fn handler_options(value: &JsValue, context: &mut Context) -> JsResult<bool> {
    let Some(options) = object_of(value) else {
        return Ok(false);
    };
    let mut enable_fetch = options.get(js_string!("enableFetch"), context)?;
    if enable_fetch.is_undefined() {
        enable_fetch = options.get(js_string!("fetch"), context)?;
    }
    Ok(enable_fetch.to_boolean())
}

fn register_handler(
    style: HandlerStyle,
    args: &[JsValue],
    context: &mut Context,
) -> JsResult<JsValue> {
    let function = callable(&arg(args, 0))
        .ok_or_else(|| type_error("handler must be a function"))?;
    let enable_fetch = handler_options(&arg(args, 1), context)?;
    let info = HandlerInfo { style, enable_fetch };

    with_state(|state| {
        state.handler = Some(Handler { function, info });
        *state.shared.handler.lock() = Some(info);
        Ok(())
    })?;
    tracing::debug!(style = style.as_str(), enable_fetch, "Handler registered");
    Ok(JsValue::undefined())
}

fn register_middleware(_: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    register_handler(HandlerStyle::Middleware, args, context)
}

fn register_event(_: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    register_handler(HandlerStyle::Event, args, context)
}

fn set_timeout(_: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let callback = callable(&arg(args, 0))
        .ok_or_else(|| type_error("setTimeout requires a function"))?;
    let delay = arg(args, 1).to_number(context)?;
    let delay = if delay.is_finite() && delay > 0.0 {
        Duration::from_millis(delay as u64)
    } else {
        Duration::ZERO
    };
    let extra: Vec<JsValue> = args.iter().skip(2).cloned().collect();
    let timer = with_state(|state| Ok(state.timers.schedule()))?;

    let job = NativeAsyncJob::new(async move |context| {
        tokio::time::sleep(delay).await;
        if !with_state(|state| Ok(state.timers.fire(timer)))? {
            return Ok(JsValue::undefined());
        }
        let mut context = context.borrow_mut();
        callback.call(&JsValue::undefined(), &extra, &mut context)
    });
    context.enqueue_job(Job::AsyncJob(job));

    Ok(JsValue::new(timer))
}

fn clear_timeout(_: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let value = arg(args, 0);
    if value.is_null_or_undefined() {
        return Ok(JsValue::undefined());
    }
    let timer = value.to_u32(context)?;
    with_state(|state| {
        state.timers.cancel(timer);
        Ok(JsValue::undefined())
    })
}
