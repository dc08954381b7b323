//! Conversion between native values and runtime values.
//!
//! [`IntoJs`] turns native values into runtime values and is what
//! `Env::value_of` and callback results go through. The other direction
//! produces an owned [`JSValue`] snapshot so results can leave the runtime
//! thread.

use crate::runtime::env::Env;
use crate::runtime::error::{Error, Result};
use crate::runtime::js_value::{JSValue, LimitTracker, MAX_JS_BYTES, MAX_JS_DEPTH};
use crate::runtime::sys::{RawValue, ValueType};
use crate::runtime::value::{Buffer, Function, JsError, Object, Promise, Value};
use indexmap::IndexMap;
use std::collections::{HashMap, HashSet};

/// Native value that can be converted into a runtime value.
pub trait IntoJs {
    fn into_js(self, env: &Env) -> Result<Value>;
}

impl IntoJs for Value {
    fn into_js(self, _env: &Env) -> Result<Value> {
        Ok(self)
    }
}

impl IntoJs for &Value {
    fn into_js(self, _env: &Env) -> Result<Value> {
        Ok(self.clone())
    }
}

macro_rules! into_js_view {
    ($($view:ty),*) => {
        $(
            impl IntoJs for $view {
                fn into_js(self, _env: &Env) -> Result<Value> {
                    Ok(self.into_value())
                }
            }
        )*
    };
}

into_js_view!(Object, Buffer, Function, Promise, JsError);

impl IntoJs for bool {
    fn into_js(self, env: &Env) -> Result<Value> {
        Ok(env.wrap_value(env.raw().get_boolean(self)?))
    }
}

macro_rules! into_js_number {
    ($($ty:ty),*) => {
        $(
            impl IntoJs for $ty {
                fn into_js(self, env: &Env) -> Result<Value> {
                    Ok(env.wrap_value(env.raw().create_double(self as f64)?))
                }
            }
        )*
    };
}

into_js_number!(i8, i16, i32, i64, isize, u8, u16, u32, u64, usize, f32, f64);

impl IntoJs for &str {
    fn into_js(self, env: &Env) -> Result<Value> {
        env.new_string(self)
    }
}

impl IntoJs for String {
    fn into_js(self, env: &Env) -> Result<Value> {
        env.new_string(&self)
    }
}

impl<T: IntoJs> IntoJs for Option<T> {
    fn into_js(self, env: &Env) -> Result<Value> {
        match self {
            Some(value) => value.into_js(env),
            None => env.null(),
        }
    }
}

impl<T: IntoJs> IntoJs for Vec<T> {
    fn into_js(self, env: &Env) -> Result<Value> {
        let array = env.new_array(self.len())?;
        for (index, item) in self.into_iter().enumerate() {
            let item = item.into_js(env)?;
            let index = u32::try_from(index)
                .map_err(|_| Error::InvalidValueType("array is too long".to_string()))?;
            env.raw().set_element(array.raw(), index, item.raw())?;
        }
        Ok(array)
    }
}

impl<T: IntoJs> IntoJs for IndexMap<String, T> {
    fn into_js(self, env: &Env) -> Result<Value> {
        let object = env.new_object()?;
        for (key, value) in self {
            object.set_named(&key, &value.into_js(env)?)?;
        }
        Ok(object.into_value())
    }
}

impl<T: IntoJs> IntoJs for HashMap<String, T> {
    fn into_js(self, env: &Env) -> Result<Value> {
        let object = env.new_object()?;
        for (key, value) in self {
            object.set_named(&key, &value.into_js(env)?)?;
        }
        Ok(object.into_value())
    }
}

impl IntoJs for serde_json::Value {
    fn into_js(self, env: &Env) -> Result<Value> {
        match self {
            serde_json::Value::Null => env.null(),
            serde_json::Value::Bool(b) => b.into_js(env),
            serde_json::Value::Number(n) => match n.as_f64() {
                Some(f) if f.is_finite() => f.into_js(env),
                _ => Err(Error::InvalidValueType(format!("number {n} is not representable"))),
            },
            serde_json::Value::String(s) => s.into_js(env),
            serde_json::Value::Array(items) => items.into_js(env),
            serde_json::Value::Object(map) => {
                let object = env.new_object()?;
                for (key, value) in map {
                    object.set_named(&key, &value.into_js(env)?)?;
                }
                Ok(object.into_value())
            }
        }
    }
}

impl IntoJs for JSValue {
    fn into_js(self, env: &Env) -> Result<Value> {
        match self {
            JSValue::Undefined => env.undefined(),
            JSValue::Null => env.null(),
            JSValue::Bool(b) => b.into_js(env),
            JSValue::Int(i) => i.into_js(env),
            JSValue::Float(f) => f.into_js(env),
            JSValue::String(s) => s.into_js(env),
            JSValue::Bytes(bytes) => Ok(env.new_buffer(&bytes)?.into_value()),
            JSValue::Array(items) => items.into_js(env),
            JSValue::Object(map) => map.into_js(env),
        }
    }
}

/// Native errors become runtime error objects carrying their message.
impl IntoJs for Error {
    fn into_js(self, env: &Env) -> Result<Value> {
        Ok(env.new_error(None, &self.to_string())?.into_value())
    }
}

impl Value {
    /// Owned snapshot with the default limits.
    pub fn to_snapshot(&self) -> Result<JSValue> {
        self.to_snapshot_with_limits(MAX_JS_DEPTH, MAX_JS_BYTES)
    }

    /// Owned snapshot of this value.
    ///
    /// Functions, symbols, externals and bigints have no snapshot form and
    /// fail with [`Error::InvalidValueType`]; so do circular structures.
    pub fn to_snapshot_with_limits(&self, max_depth: usize, max_bytes: usize) -> Result<JSValue> {
        let mut seen = HashSet::new();
        let mut tracker = LimitTracker::new(max_depth, max_bytes);
        snapshot(self, &mut seen, &mut tracker)
    }
}

fn snapshot(
    value: &Value,
    seen: &mut HashSet<RawValue>,
    tracker: &mut LimitTracker,
) -> Result<JSValue> {
    tracker.enter().map_err(Error::Limit)?;

    let add_bytes = |bytes: usize, tracker: &mut LimitTracker| {
        tracker.add_bytes(bytes).map_err(Error::Limit)
    };

    let result = match value.value_type()? {
        ValueType::Undefined => JSValue::Undefined,
        ValueType::Null => {
            add_bytes(4, tracker)?;
            JSValue::Null
        }
        ValueType::Boolean => {
            add_bytes(1, tracker)?;
            JSValue::Bool(value.as_bool()?)
        }
        ValueType::Number => {
            add_bytes(std::mem::size_of::<f64>(), tracker)?;
            number_snapshot(value.as_f64()?)
        }
        ValueType::String => {
            let s = value.as_string()?;
            add_bytes(s.len(), tracker)?;
            add_bytes(16, tracker)?;
            JSValue::String(s)
        }
        ValueType::Object if value.is_buffer()? => {
            let bytes = value.as_buffer()?.bytes()?;
            add_bytes(bytes.len(), tracker)?;
            JSValue::Bytes(bytes)
        }
        ValueType::Object => {
            if !seen.insert(value.raw()) {
                return Err(Error::InvalidValueType(
                    "circular reference detected while taking a snapshot".to_string(),
                ));
            }
            let snapshot = if value.is_array()? {
                array_snapshot(value, seen, tracker)?
            } else {
                object_snapshot(value, seen, tracker)?
            };
            seen.remove(&value.raw());
            snapshot
        }
        other => {
            return Err(Error::InvalidValueType(format!(
                "a {other} has no snapshot form"
            )))
        }
    };

    tracker.exit();
    Ok(result)
}

fn number_snapshot(f: f64) -> JSValue {
    if f.is_finite() && f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64 {
        JSValue::Int(f as i64)
    } else {
        JSValue::Float(f)
    }
}

fn array_snapshot(
    value: &Value,
    seen: &mut HashSet<RawValue>,
    tracker: &mut LimitTracker,
) -> Result<JSValue> {
    let env = value.env();
    let length = env.raw().get_array_length(value.raw())?;
    tracker
        .add_bytes(16 + (length as usize).saturating_mul(std::mem::size_of::<usize>()))
        .map_err(Error::Limit)?;

    let mut items = Vec::with_capacity(length as usize);
    for index in 0..length {
        let item = env.wrap_value(env.raw().get_element(value.raw(), index)?);
        items.push(snapshot(&item, seen, tracker)?);
    }
    Ok(JSValue::Array(items))
}

fn object_snapshot(
    value: &Value,
    seen: &mut HashSet<RawValue>,
    tracker: &mut LimitTracker,
) -> Result<JSValue> {
    let object = value.as_object()?;
    let names = object.property_names()?;
    tracker
        .add_bytes(24 + names.len().saturating_mul(std::mem::size_of::<usize>() * 2))
        .map_err(Error::Limit)?;

    let mut map = IndexMap::with_capacity(names.len());
    for name in names {
        tracker.add_bytes(name.len()).map_err(Error::Limit)?;
        let property = object.get_named(&name)?;
        let property = snapshot(&property, seen, tracker)?;
        map.insert(name, property);
    }
    Ok(JSValue::Object(map))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::local::LocalHost;
    use serde_json::json;

    #[test]
    fn test_json_round_trip_through_runtime() {
        let host = LocalHost::new();
        let env = host.env();

        let value = env
            .value_of(json!({"name": "widget", "tags": ["a", "b"], "count": 3, "ratio": 0.5, "none": null}))
            .unwrap();
        let snapshot = value.to_snapshot().unwrap();

        assert_eq!(serde_json::to_value(&snapshot).unwrap(), json!({"name": "widget", "tags": ["a", "b"], "count": 3, "ratio": 0.5, "none": null}));
        assert_eq!(snapshot.get("count"), Some(&JSValue::Int(3)));
    }

    #[test]
    fn test_special_numbers_survive() {
        let host = LocalHost::new();
        let env = host.env();

        let nan = env.value_of(f64::NAN).unwrap().to_snapshot().unwrap();
        assert!(matches!(nan, JSValue::Float(f) if f.is_nan()));
        assert_eq!(
            env.value_of(f64::NEG_INFINITY).unwrap().to_snapshot().unwrap(),
            JSValue::Float(f64::NEG_INFINITY)
        );
    }

    #[test]
    fn test_function_has_no_snapshot() {
        let host = LocalHost::new();
        let env = host.env();

        let function = env.new_function("noop", |_this: Value| ()).unwrap();
        assert!(matches!(
            function.to_snapshot(),
            Err(Error::InvalidValueType(_))
        ));
    }

    #[test]
    fn test_circular_object_rejected() {
        let host = LocalHost::new();
        let env = host.env();

        let object = env.new_object().unwrap();
        object.set_named("self", &object).unwrap();
        assert!(matches!(
            object.to_snapshot(),
            Err(Error::InvalidValueType(_))
        ));
    }

    #[test]
    fn test_depth_limit() {
        let host = LocalHost::new();
        let env = host.env();

        let nested = env.value_of(json!([[[1]]])).unwrap();
        assert!(nested.to_snapshot_with_limits(3, 1024).is_err());
        assert!(nested.to_snapshot_with_limits(4, 1024).is_ok());
    }

    #[test]
    fn test_buffer_and_error_conversion() {
        let host = LocalHost::new();
        let env = host.env();

        let bytes = env.value_of(JSValue::Bytes(vec![9, 8])).unwrap();
        assert!(bytes.is_buffer().unwrap());
        assert_eq!(bytes.to_snapshot().unwrap(), JSValue::Bytes(vec![9, 8]));

        let error = env.value_of(Error::application("broken")).unwrap();
        assert_eq!(error.as_error().unwrap().message().unwrap(), "broken");
    }
}
