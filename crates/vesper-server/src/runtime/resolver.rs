//! Completion bridge between handler promises and waiting callers.
//!
//! Every shard compiles one trampoline at startup:
//!
//! ```js
//! (handler, ctx, resolve, reject, gen) =>
//!     Promise.resolve(handler(ctx)).then(v => resolve(v, gen), e => reject(e, gen))
//! ```
//!
//! `resolve` and `reject` are native functions bound to one façade id. They
//! perform the write for the handler style and send the façade's single
//! [`Reply`]. A handler that throws before returning makes the trampoline
//! itself throw; that is reported through the same channel as a manual
//! exception, so exactly one of the three paths answers the caller.

use super::conversions::{arg, callable, describe, describe_error, to_json_bytes, type_error};
use super::facade::{Binding, Checkout, FacadeSlot, exception_response};
use super::state::{Handler, with_state};
use super::Reply;
use crate::io_context::IoContext;
use crate::request::{RequestHead, text_response};
use crate::stream::TrackedStream;
use boa_engine::{
    Context, JsResult, JsValue, Source,
    native_function::NativeFunction,
    object::{FunctionObjectBuilder, JsObject},
};
use bytes::Bytes;
use http::StatusCode;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::oneshot;
use vesper_metrics::HandlerStyle;

const TRAMPOLINE: &str = "(function (handler, ctx, resolve, reject, gen) {
    Promise.resolve(handler(ctx)).then((v) => resolve(v, gen), (e) => reject(e, gen));
})";

const TEXT_PLAIN: &str = "text/plain; charset=utf-8";
const APPLICATION_JSON: &str = "application/json";

pub(crate) fn compile_trampoline(context: &mut Context) -> JsResult<JsObject> {
    let value = context.eval(Source::from_bytes(TRAMPOLINE))?;
    callable(&value).ok_or_else(|| type_error("trampoline is not a function"))
}

/// Everything the shard needs to run a handler for one request.
pub(crate) struct Invocation {
    pub io: Arc<IoContext>,
    pub head: RequestHead,
    pub remote: Option<SocketAddr>,
    pub secure: bool,
    pub body: TrackedStream,
    pub done: oneshot::Sender<Reply>,
}

/// Runs the registered handler for `invocation`. Called on the shard thread.
pub(crate) fn invoke(context: &mut Context, invocation: Invocation) {
    let Invocation {
        io,
        head,
        remote,
        secure,
        body,
        done,
    } = invocation;

    let prepared = with_state(|state| {
        let Some(handler) = state.handler.clone() else {
            return Ok(None);
        };
        let style = handler.info.style;
        let factory = match style {
            HandlerStyle::Middleware => state.factories.middleware.clone(),
            HandlerStyle::Event => state.factories.event.clone(),
        };
        let checkout = state.facades.checkout(style);
        Ok(Some((
            handler,
            checkout,
            factory,
            state.trampoline.clone(),
            state.tasks.clone(),
        )))
    });

    let (handler, checkout, factory, trampoline, tasks) = match prepared {
        Ok(Some(prepared)) => prepared,
        Ok(None) => {
            let _ = done.send(Reply::Failed(text_response(
                StatusCode::BAD_GATEWAY,
                "no handler registered",
            )));
            return;
        }
        Err(err) => {
            let message = describe_error(&err, context);
            let _ = done.send(Reply::Failed(exception_response(
                "Unexpected runtime exception",
                Some(message),
            )));
            return;
        }
    };
    let Handler { function, info } = handler;

    let id = match checkout {
        Checkout::Pooled(id) => id,
        Checkout::Fresh(id) => match build_facade(context, id, info.style, &factory) {
            Ok(slot) => {
                let _ = with_state(|state| {
                    state.facades.insert(id, slot);
                    Ok(())
                });
                id
            }
            Err(err) => {
                let message = describe_error(&err, context);
                tracing::error!(error = %message, "Failed to build request façade");
                let _ = done.send(Reply::Failed(exception_response(
                    "Unexpected runtime exception",
                    Some(message),
                )));
                return;
            }
        },
    };

    let binding = Binding::new(
        Arc::clone(&io),
        head,
        remote,
        secure,
        body,
        info.enable_fetch,
        done,
    );
    let armed = match with_state(|state| state.facades.bind(id, binding)) {
        Ok(armed) => armed,
        Err(err) => {
            // The completion sender went down with the binding; the caller
            // sees the shard as interrupted.
            let error = describe_error(&err, context);
            tracing::error!(%error, "Failed to bind request façade");
            return;
        }
    };
    let generation = armed.generation;

    // The façade goes back to its pool once the request context is released.
    io.register_cleanup(move || {
        let _ = tasks.send(Box::new(move |_: &mut Context| recycle(id, generation)));
    });

    let view = match armed
        .arm
        .call(&JsValue::undefined(), &[JsValue::new(generation)], context)
    {
        Ok(view) => view,
        Err(err) => {
            let message = describe_error(&err, context);
            exception(id, generation, message);
            return;
        }
    };

    let args = [
        JsValue::from(function),
        view,
        JsValue::from(armed.resolve),
        JsValue::from(armed.reject),
        JsValue::new(generation),
    ];
    if let Err(err) = trampoline.call(&JsValue::undefined(), &args, context) {
        let message = describe_error(&err, context);
        exception(id, generation, message);
    }
}

/// Builds a façade through the prelude factory and wraps its native
/// resolve/reject pair.
fn build_facade(
    context: &mut Context,
    id: u32,
    style: HandlerStyle,
    factory: &JsObject,
) -> JsResult<FacadeSlot> {
    let arm = factory.call(&JsValue::undefined(), &[JsValue::new(id)], context)?;
    let arm = callable(&arm).ok_or_else(|| type_error("façade factory returned no arm function"))?;

    let resolve = FunctionObjectBuilder::new(
        context.realm(),
        NativeFunction::from_copy_closure(move |_, args, context| on_resolve(id, args, context)),
    )
    .length(2)
    .build();
    let reject = FunctionObjectBuilder::new(
        context.realm(),
        NativeFunction::from_copy_closure(move |_, args, context| on_reject(id, args, context)),
    )
    .length(2)
    .build();

    Ok(FacadeSlot::new(style, arm, resolve.into(), reject.into()))
}

/// Encodes a middleware handler's return value.
fn encode_result(
    value: &JsValue,
    context: &mut Context,
) -> Result<(Bytes, Option<&'static str>), String> {
    if value.is_null_or_undefined() {
        return Ok((Bytes::new(), None));
    }
    if let Some(text) = value.as_string() {
        return Ok((Bytes::from(text.to_std_string_escaped()), Some(TEXT_PLAIN)));
    }
    match to_json_bytes(value, context) {
        Ok(json) => Ok((Bytes::from(json), Some(APPLICATION_JSON))),
        Err(err) => Err(describe_error(&err, context)),
    }
}

fn on_resolve(id: u32, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let value = arg(args, 0);
    let generation = arg(args, 1).to_u32(context)?;
    let style = with_state(|state| state.facades.style(id, generation))?;

    match style {
        HandlerStyle::Middleware => {
            let sent = with_state(|state| Ok(state.facades.binding(id, generation)?.sent()))?;
            if sent {
                return Ok(JsValue::undefined());
            }
            let encoded = encode_result(&value, context);
            with_state(|state| {
                let binding = state.facades.binding(id, generation)?;
                let reply = match encoded {
                    Ok((body, content_type)) => {
                        Reply::Respond(binding.response(body, content_type)?)
                    }
                    Err(message) => {
                        Reply::Failed(exception_response("Execution exception", Some(message)))
                    }
                };
                binding.finish(reply);
                Ok(())
            })?;
        }
        HandlerStyle::Event => {
            with_state(|state| {
                let binding = state.facades.binding(id, generation)?;
                let reply = if binding.responded_with() {
                    binding.await_inner()
                } else {
                    Reply::Fallthrough
                };
                binding.finish(reply);
                Ok(())
            })?;
        }
    }
    Ok(JsValue::undefined())
}

fn on_reject(id: u32, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let message = describe(&arg(args, 0), context);
    let generation = arg(args, 1).to_u32(context)?;

    let answered = with_state(|state| {
        let binding = state.facades.binding(id, generation)?;
        let reply = if binding.responded_with() {
            tracing::warn!(
                error = message.as_deref().unwrap_or("undefined"),
                "Handler rejected after respondWith"
            );
            binding.await_inner()
        } else {
            Reply::Failed(exception_response("Execution exception", message.clone()))
        };
        Ok(binding.finish(reply))
    })?;

    if !answered {
        tracing::warn!(
            error = message.as_deref().unwrap_or("undefined"),
            "Handler failed after the response was sent"
        );
    }
    Ok(JsValue::undefined())
}

/// Reports an exception thrown before the handler returned a promise.
fn exception(id: u32, generation: u32, message: String) {
    let answered = with_state(|state| {
        let binding = state.facades.binding(id, generation)?;
        let reply = if binding.responded_with() {
            binding.await_inner()
        } else {
            Reply::Failed(exception_response(
                "Unexpected runtime exception",
                Some(message.clone()),
            ))
        };
        Ok(binding.finish(reply))
    });

    match answered {
        Ok(true) => {}
        Ok(false) => tracing::warn!(error = %message, "Handler threw after the response was sent"),
        Err(_) => tracing::error!(error = %message, "Handler threw on a released façade"),
    }
}

/// Resets façade `id` after its request context was released and returns
/// it to the pool.
pub(crate) fn recycle(id: u32, generation: u32) {
    let _ = with_state(|state| {
        if state.facades.reset(id, generation) {
            state.facades.release(id);
        }
        Ok(())
    });
}
