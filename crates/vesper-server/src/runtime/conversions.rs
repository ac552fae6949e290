//! Conversions between Rust and JavaScript values
//!
//! Host functions receive loosely typed arguments from the prelude and hand
//! back plain values. This module keeps those conversions in one place:
//!
//! | Rust | JavaScript |
//! |------|------------|
//! | `serde_json::Value` | the equivalent JS value |
//! | `&str` / `String` | string |
//! | `Vec<(String, String)>` | array of `[name, value]` pairs |
//!
//! Symbol keys are skipped and symbols become `null` when converting to JSON.

use boa_engine::{
    Context, JsError, JsNativeError, JsNativeErrorKind, JsResult, JsString, JsValue,
    object::{JsObject, builtins::JsArray},
    property::PropertyKey,
};
use serde_json::Value as JsonValue;

/// Argument `index`, or `undefined` when missing.
pub(crate) fn arg(args: &[JsValue], index: usize) -> JsValue {
    args.get(index).cloned().unwrap_or_default()
}

pub(crate) fn type_error(message: impl Into<String>) -> JsError {
    JsNativeError::typ().with_message(message.into()).into()
}

pub(crate) fn js_str(value: &str) -> JsValue {
    JsValue::from(JsString::from(value))
}

/// The object behind `value`, if it is one.
pub(crate) fn object_of(value: &JsValue) -> Option<JsObject> {
    value.as_object().map(|object| object.clone())
}

/// The function behind `value`, if it is callable.
pub(crate) fn callable(value: &JsValue) -> Option<JsObject> {
    object_of(value).filter(|object| object.is_callable())
}

pub(crate) fn rust_string(value: &JsValue, context: &mut Context) -> JsResult<String> {
    Ok(value.to_string(context)?.to_std_string_escaped())
}

/// `null` and `undefined` map to `None`, anything else is stringified.
pub(crate) fn optional_string(value: &JsValue, context: &mut Context) -> JsResult<Option<String>> {
    if value.is_null_or_undefined() {
        return Ok(None);
    }
    rust_string(value, context).map(Some)
}

/// Human readable form of a thrown or rejected value.
///
/// Returns `None` for `undefined`, which callers render as an empty body.
pub(crate) fn describe(value: &JsValue, context: &mut Context) -> Option<String> {
    if value.is_undefined() {
        return None;
    }
    Some(
        value
            .to_string(context)
            .map(|s| s.to_std_string_escaped())
            .unwrap_or_else(|_| "[unprintable value]".to_string()),
    )
}

/// Message of an error raised while calling into the interpreter.
///
/// Runtime limit errors have no JS representation and are described by
/// their Rust message.
pub(crate) fn describe_error(err: &JsError, context: &mut Context) -> String {
    if let Some(native) = err.as_native()
        && matches!(native.kind, JsNativeErrorKind::RuntimeLimit)
    {
        return err.to_string();
    }
    let value = err.to_opaque(context);
    describe(&value, context).unwrap_or_else(|| err.to_string())
}

/// Reads an array of `[name, value]` pairs built by the prelude.
pub(crate) fn string_pairs(
    value: &JsValue,
    context: &mut Context,
) -> JsResult<Vec<(String, String)>> {
    let Some(object) = object_of(value) else {
        return Ok(Vec::new());
    };
    let array = JsArray::from_object(object)?;
    let length = array.length(context)? as usize;

    let mut pairs = Vec::with_capacity(length);
    for i in 0..length {
        let entry = array.get(i, context)?;
        let entry = object_of(&entry)
            .ok_or_else(|| type_error("expected a [name, value] pair"))?;
        let name = rust_string(&entry.get(0u32, context)?, context)?;
        let value = rust_string(&entry.get(1u32, context)?, context)?;
        pairs.push((name, value));
    }
    Ok(pairs)
}

pub(crate) fn pairs_to_js(pairs: &[(String, String)], context: &mut Context) -> JsValue {
    let entries = pairs.iter().map(|(name, value)| {
        JsArray::from_iter([js_str(name), js_str(value)], context).into()
    });
    let entries: Vec<JsValue> = entries.collect();
    JsArray::from_iter(entries, context).into()
}

pub(crate) fn strings_to_js<'a>(
    items: impl IntoIterator<Item = &'a str>,
    context: &mut Context,
) -> JsValue {
    let items: Vec<JsValue> = items.into_iter().map(js_str).collect();
    JsArray::from_iter(items, context).into()
}

/// Converts a JSON value into the equivalent JS value.
pub(crate) fn json_to_js_value(json: &JsonValue, context: &mut Context) -> JsResult<JsValue> {
    match json {
        JsonValue::Null => Ok(JsValue::null()),
        JsonValue::Bool(b) => Ok(JsValue::new(*b)),
        JsonValue::Number(n) => n
            .as_f64()
            .map(JsValue::new)
            .ok_or_else(|| type_error("number out of range")),
        JsonValue::String(s) => Ok(js_str(s)),
        JsonValue::Array(items) => {
            let mut values = Vec::with_capacity(items.len());
            for item in items {
                values.push(json_to_js_value(item, context)?);
            }
            Ok(JsArray::from_iter(values, context).into())
        }
        JsonValue::Object(map) => {
            let object = JsObject::with_object_proto(context.intrinsics());
            for (key, value) in map {
                let value = json_to_js_value(value, context)?;
                object.create_data_property_or_throw(JsString::from(key.as_str()), value, context)?;
            }
            Ok(object.into())
        }
    }
}

/// Deepest nesting [`js_value_to_json`] follows before giving up.
const MAX_JSON_DEPTH: usize = 128;

/// Converts a JS value into JSON.
///
/// `undefined` and symbols become `null`; non-finite numbers, cyclic
/// structures and nesting deeper than 128 levels are rejected with a
/// `TypeError`.
pub(crate) fn js_value_to_json(value: &JsValue, context: &mut Context) -> JsResult<JsonValue> {
    let mut ancestors = Vec::new();
    to_json(value, context, &mut ancestors)
}

fn to_json(
    value: &JsValue,
    context: &mut Context,
    ancestors: &mut Vec<JsObject>,
) -> JsResult<JsonValue> {
    if value.is_null_or_undefined() || value.is_symbol() {
        return Ok(JsonValue::Null);
    }

    if let Some(b) = value.as_boolean() {
        return Ok(JsonValue::Bool(b));
    }

    if let Some(i) = value.as_i32() {
        return Ok(JsonValue::Number(i.into()));
    }

    if let Some(n) = value.as_number() {
        return serde_json::Number::from_f64(n)
            .map(JsonValue::Number)
            .ok_or_else(|| type_error("cannot encode a non-finite number as JSON"));
    }

    if value.is_string() {
        return rust_string(value, context).map(JsonValue::String);
    }

    let Some(object) = object_of(value) else {
        return Ok(JsonValue::Null);
    };
    if object.is_callable() {
        return Ok(JsonValue::Null);
    }
    if ancestors.iter().any(|seen| JsObject::equals(seen, &object)) {
        return Err(type_error("cannot encode a cyclic structure as JSON"));
    }
    if ancestors.len() >= MAX_JSON_DEPTH {
        return Err(type_error(format!(
            "cannot encode JSON nested deeper than {MAX_JSON_DEPTH} levels"
        )));
    }

    ancestors.push(object.clone());
    let encoded = if object.is_array() {
        array_to_json(object, context, ancestors)
    } else {
        object_to_json(&object, context, ancestors)
    };
    ancestors.pop();
    encoded
}

fn array_to_json(
    object: JsObject,
    context: &mut Context,
    ancestors: &mut Vec<JsObject>,
) -> JsResult<JsonValue> {
    let array = JsArray::from_object(object)?;
    let length = array.length(context)? as usize;
    let mut items = Vec::with_capacity(length);
    for i in 0..length {
        let item = array.get(i, context)?;
        items.push(to_json(&item, context, ancestors)?);
    }
    Ok(JsonValue::Array(items))
}

fn object_to_json(
    object: &JsObject,
    context: &mut Context,
    ancestors: &mut Vec<JsObject>,
) -> JsResult<JsonValue> {
    let mut map = serde_json::Map::new();
    for key in object.own_property_keys(context)? {
        let name = match &key {
            PropertyKey::String(s) => s.to_std_string_escaped(),
            PropertyKey::Index(i) => i.get().to_string(),
            PropertyKey::Symbol(_) => continue,
        };
        let item = object.get(key, context)?;
        if item.is_undefined() {
            continue;
        }
        map.insert(name, to_json(&item, context, ancestors)?);
    }
    Ok(JsonValue::Object(map))
}

/// Serializes a script value as a JSON document.
pub(crate) fn to_json_bytes(value: &JsValue, context: &mut Context) -> JsResult<Vec<u8>> {
    let json = js_value_to_json(value, context)?;
    serde_json::to_vec(&json).map_err(|e| type_error(format!("failed to encode JSON: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use boa_engine::Source;
    use serde_json::json;

    #[test]
    fn test_json_round_trip_through_script() {
        let mut context = Context::default();
        let input = json!({"name": "vesper", "tags": ["a", "b"], "count": 3, "ok": true, "none": null});

        let value = json_to_js_value(&input, &mut context).unwrap();
        let back = js_value_to_json(&value, &mut context).unwrap();
        assert_eq!(back, input);
    }

    #[test]
    fn test_undefined_properties_are_skipped() {
        let mut context = Context::default();
        let value = context
            .eval(Source::from_bytes("({ a: 1, b: undefined, c: () => 1 })"))
            .unwrap();

        let json = js_value_to_json(&value, &mut context).unwrap();
        assert_eq!(json, json!({"a": 1, "c": null}));
    }

    #[test]
    fn test_cyclic_object_is_rejected() {
        let mut context = Context::default();
        let value = context
            .eval(Source::from_bytes("const o = { a: [1] }; o.a.push(o); o"))
            .unwrap();

        let err = js_value_to_json(&value, &mut context).unwrap_err();
        assert!(describe_error(&err, &mut context).contains("cyclic"));
    }

    #[test]
    fn test_shared_references_are_not_cycles() {
        let mut context = Context::default();
        let value = context
            .eval(Source::from_bytes("const s = { n: 1 }; ({ left: s, right: [s, s] })"))
            .unwrap();

        let json = js_value_to_json(&value, &mut context).unwrap();
        assert_eq!(json, json!({"left": {"n": 1}, "right": [{"n": 1}, {"n": 1}]}));
    }

    #[test]
    fn test_deep_nesting_is_rejected() {
        let mut context = Context::default();
        let value = context
            .eval(Source::from_bytes(
                "let v = 0; for (let i = 0; i < 10000; i++) { v = [v]; } v",
            ))
            .unwrap();

        let err = js_value_to_json(&value, &mut context).unwrap_err();
        assert!(describe_error(&err, &mut context).contains("nested deeper"));
    }

    #[test]
    fn test_string_pairs_reads_prelude_shape() {
        let mut context = Context::default();
        let value = context
            .eval(Source::from_bytes("[['content-type', 'text/plain'], ['x-n', 1]]"))
            .unwrap();

        let pairs = string_pairs(&value, &mut context).unwrap();
        assert_eq!(
            pairs,
            vec![
                ("content-type".to_string(), "text/plain".to_string()),
                ("x-n".to_string(), "1".to_string()),
            ]
        );
    }

    #[test]
    fn test_describe_formats_errors() {
        let mut context = Context::default();
        let error = context.eval(Source::from_bytes("new Error('boom')")).unwrap();

        assert_eq!(describe(&error, &mut context).as_deref(), Some("Error: boom"));
        assert_eq!(describe(&JsValue::undefined(), &mut context), None);
    }

    #[test]
    fn test_pairs_to_js_builds_nested_arrays() {
        let mut context = Context::default();
        let pairs = vec![("a".to_string(), "1".to_string())];
        let value = pairs_to_js(&pairs, &mut context);

        context
            .global_object()
            .set(JsString::from("pairs"), value, false, &mut context)
            .unwrap();
        let joined = context
            .eval(Source::from_bytes("pairs.map(([k, v]) => k + '=' + v).join('&')"))
            .unwrap();
        assert_eq!(rust_string(&joined, &mut context).unwrap(), "a=1");
    }
}
