//! Conversions between host values and QuickJS values.
//!
//! Configuration globals travel as `serde_json::Value`. Every install goes
//! through [`deep_copy`] and then [`json_to_js`], which allocates fresh objects
//! in the target context, so no two scopes ever share a mutable structure.

use crate::error::Error;
use rquickjs::{CaughtError, Coerced, Ctx, IntoJs, Object, Value};

/// Structural copy with no residual shared references to the input.
/// `serde_json::Value` owns its whole tree, so a clone already is one.
pub fn deep_copy(value: &serde_json::Value) -> serde_json::Value {
    value.clone()
}

/// Convert a serde_json::Value to a rquickjs Value.
pub fn json_to_js<'js>(ctx: &Ctx<'js>, value: &serde_json::Value) -> rquickjs::Result<Value<'js>> {
    match value {
        serde_json::Value::Null => Ok(Value::new_null(ctx.clone())),
        serde_json::Value::Bool(b) => Ok(Value::new_bool(ctx.clone(), *b)),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64().and_then(|i| i32::try_from(i).ok()) {
                Ok(Value::new_int(ctx.clone(), i))
            } else if let Some(f) = n.as_f64() {
                Ok(Value::new_float(ctx.clone(), f))
            } else {
                Ok(Value::new_null(ctx.clone()))
            }
        }
        serde_json::Value::String(s) => s.as_str().into_js(ctx),
        serde_json::Value::Array(arr) => {
            let js_arr = rquickjs::Array::new(ctx.clone())?;
            for (i, v) in arr.iter().enumerate() {
                js_arr.set(i, json_to_js(ctx, v)?)?;
            }
            Ok(js_arr.into_value())
        }
        serde_json::Value::Object(obj) => {
            let js_obj = Object::new(ctx.clone())?;
            for (k, v) in obj {
                js_obj.set(k.as_str(), json_to_js(ctx, v)?)?;
            }
            Ok(js_obj.into_value())
        }
    }
}

/// Convert a rquickjs Value to a serde_json::Value.
///
/// `undefined`, functions and symbols map to `null`.
pub fn js_to_json<'js>(ctx: &Ctx<'js>, value: Value<'js>) -> rquickjs::Result<serde_json::Value> {
    if value.is_null() || value.is_undefined() {
        return Ok(serde_json::Value::Null);
    }
    if let Some(b) = value.as_bool() {
        return Ok(serde_json::Value::Bool(b));
    }
    if let Some(i) = value.as_int() {
        return Ok(serde_json::json!(i));
    }
    if let Some(f) = value.as_float() {
        return Ok(serde_json::Number::from_f64(f).map_or(serde_json::Value::Null, Into::into));
    }
    if let Some(s) = value.as_string() {
        return Ok(serde_json::Value::String(s.to_string()?));
    }
    if let Some(arr) = value.as_array() {
        let mut result = Vec::with_capacity(arr.len());
        for i in 0..arr.len() {
            let item: Value<'js> = arr.get(i)?;
            result.push(js_to_json(ctx, item)?);
        }
        return Ok(serde_json::Value::Array(result));
    }
    if value.is_function() || value.is_symbol() {
        return Ok(serde_json::Value::Null);
    }
    if let Some(obj) = value.as_object() {
        let mut result = serde_json::Map::new();
        for item in obj.props::<String, Value<'js>>() {
            let (k, v) = item?;
            result.insert(k, js_to_json(ctx, v)?);
        }
        return Ok(serde_json::Value::Object(result));
    }
    Ok(serde_json::Value::Null)
}

/// Turn an engine error into our error, pulling the pending exception out of
/// the context when there is one.
pub fn caught_to_error(ctx: &Ctx<'_>, err: rquickjs::Error, file_name: &str) -> Error {
    match CaughtError::from_error(ctx, err) {
        CaughtError::Exception(exception) => {
            let message = exception.message().unwrap_or_default();
            let name: Option<String> = exception.as_object().get("name").ok();
            let message = match name {
                Some(name) if !name.is_empty() => format!("{name}: {message}"),
                _ => message,
            };
            Error::Evaluation {
                file_name: file_name.to_string(),
                message,
                stack: exception.stack(),
            }
        }
        CaughtError::Value(value) => {
            let message = value
                .get::<Coerced<String>>()
                .map_or_else(|_| format!("{value:?}"), |coerced| coerced.0);
            Error::evaluation(file_name, format!("Uncaught {message}"))
        }
        CaughtError::Error(err) => err.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rquickjs::{Context, Runtime};
    use serde_json::json;

    fn with_ctx<R>(f: impl FnOnce(Ctx<'_>) -> R) -> R {
        let runtime = Runtime::new().expect("runtime");
        let context = Context::full(&runtime).expect("context");
        context.with(f)
    }

    #[test]
    fn deep_copy_is_structurally_equal() {
        let value = json!({"foo": {"n": 1, "list": [1, {"x": true}]}, "s": "text"});
        assert_eq!(deep_copy(&value), value);
    }

    #[test]
    fn json_round_trips_through_js() {
        with_ctx(|ctx| {
            let value = json!({"n": 1, "f": 1.5, "s": "hi", "a": [null, false], "o": {}});
            let js = json_to_js(&ctx, &value).expect("to js");
            assert_eq!(js_to_json(&ctx, js).expect("to json"), value);
        });
    }

    #[test]
    fn large_integers_survive_as_numbers() {
        with_ctx(|ctx| {
            let value = json!(5_000_000_000_i64);
            let js = json_to_js(&ctx, &value).expect("to js");
            assert_eq!(js.as_number(), Some(5_000_000_000.0));
        });
    }

    #[test]
    fn each_conversion_allocates_a_new_object() {
        with_ctx(|ctx| {
            let value = json!({"n": 1});
            let a = json_to_js(&ctx, &value).expect("a");
            let b = json_to_js(&ctx, &value).expect("b");
            ctx.globals().set("a", a).expect("set a");
            ctx.globals().set("b", b).expect("set b");
            let same: bool = ctx.eval("a.n = 2; a === b || b.n === 2").expect("eval");
            assert!(!same);
        });
    }

    #[test]
    fn thrown_errors_keep_name_and_message() {
        with_ctx(|ctx| {
            let err = ctx
                .eval::<(), _>("throw new TypeError('bad thing')")
                .expect_err("throws");
            let err = caught_to_error(&ctx, err, "a.js");
            match err {
                Error::Evaluation {
                    file_name, message, ..
                } => {
                    assert_eq!(file_name, "a.js");
                    assert_eq!(message, "TypeError: bad thing");
                }
                other => unreachable!("unexpected error: {other}"),
            }
        });
    }

    #[test]
    fn thrown_primitives_are_stringified() {
        with_ctx(|ctx| {
            let err = ctx.eval::<(), _>("throw 42").expect_err("throws");
            let err = caught_to_error(&ctx, err, "b.js");
            assert_eq!(err.to_string(), "Evaluation error in b.js: Uncaught 42");
        });
    }
}
