//! Runtime values and the typed views over them.

use crate::runtime::env::Env;
use crate::runtime::error::{Error, Result};
use crate::runtime::sys::{RawRef, RawValue, ValueType};
use std::fmt;
use std::ops::Deref;

/// A value living in the runtime, tied to the [`Env`] it was created in.
#[derive(Clone)]
pub struct Value {
    env: Env,
    raw: RawValue,
}

impl Value {
    pub(crate) fn new(env: Env, raw: RawValue) -> Self {
        Self { env, raw }
    }

    pub fn env(&self) -> &Env {
        &self.env
    }

    pub fn raw(&self) -> RawValue {
        self.raw
    }

    pub fn value_type(&self) -> Result<ValueType> {
        Ok(self.env.raw().type_of(self.raw)?)
    }

    /// Name of the value's type, for messages.
    pub fn type_name(&self) -> &'static str {
        self.value_type().map(ValueType::name).unwrap_or("unknown")
    }

    fn has_type(&self, expected: ValueType) -> Result<bool> {
        Ok(self.value_type()? == expected)
    }

    fn require(&self, expected: ValueType, name: &'static str) -> Result<()> {
        let actual = self.value_type()?;
        if actual == expected {
            Ok(())
        } else {
            Err(Error::WrongType {
                expected: name,
                actual,
            })
        }
    }

    fn require_object(&self, name: &'static str, check: bool) -> Result<()> {
        if check {
            Ok(())
        } else {
            Err(Error::WrongType {
                expected: name,
                actual: self.value_type()?,
            })
        }
    }

    pub fn is_undefined(&self) -> Result<bool> {
        self.has_type(ValueType::Undefined)
    }

    pub fn is_null(&self) -> Result<bool> {
        self.has_type(ValueType::Null)
    }

    pub fn is_bool(&self) -> Result<bool> {
        self.has_type(ValueType::Boolean)
    }

    pub fn is_number(&self) -> Result<bool> {
        self.has_type(ValueType::Number)
    }

    pub fn is_string(&self) -> Result<bool> {
        self.has_type(ValueType::String)
    }

    pub fn is_object(&self) -> Result<bool> {
        self.has_type(ValueType::Object)
    }

    pub fn is_function(&self) -> Result<bool> {
        self.has_type(ValueType::Function)
    }

    pub fn is_array(&self) -> Result<bool> {
        Ok(self.env.raw().is_array(self.raw)?)
    }

    pub fn is_buffer(&self) -> Result<bool> {
        Ok(self.env.raw().is_buffer(self.raw)?)
    }

    pub fn is_error(&self) -> Result<bool> {
        Ok(self.env.raw().is_error(self.raw)?)
    }

    pub fn is_promise(&self) -> Result<bool> {
        Ok(self.env.raw().is_promise(self.raw)?)
    }

    pub fn as_bool(&self) -> Result<bool> {
        self.require(ValueType::Boolean, "boolean")?;
        Ok(self.env.raw().get_value_bool(self.raw)?)
    }

    pub fn as_f64(&self) -> Result<f64> {
        self.require(ValueType::Number, "number")?;
        Ok(self.env.raw().get_value_double(self.raw)?)
    }

    /// Number truncated towards zero; non-finite numbers read as 0.
    pub fn as_i64(&self) -> Result<i64> {
        self.require(ValueType::Number, "number")?;
        Ok(self.env.raw().get_value_int64(self.raw)?)
    }

    pub fn as_string(&self) -> Result<String> {
        self.require(ValueType::String, "string")?;
        Ok(self.env.raw().get_value_string_utf8(self.raw)?)
    }

    pub fn as_object(&self) -> Result<Object> {
        self.require(ValueType::Object, "object")?;
        Ok(self.clone().into_object_unchecked())
    }

    pub fn as_buffer(&self) -> Result<Buffer> {
        self.require_object("buffer", self.is_buffer()?)?;
        Ok(self.clone().into_buffer_unchecked())
    }

    pub fn as_function(&self) -> Result<Function> {
        self.require(ValueType::Function, "function")?;
        Ok(self.clone().into_function_unchecked())
    }

    pub fn as_promise(&self) -> Result<Promise> {
        self.require_object("promise", self.is_promise()?)?;
        Ok(self.clone().into_promise_unchecked())
    }

    pub fn as_error(&self) -> Result<JsError> {
        self.require_object("error", self.is_error()?)?;
        Ok(self.clone().into_error_unchecked())
    }

    pub(crate) fn into_object_unchecked(self) -> Object {
        Object(self)
    }

    pub(crate) fn into_buffer_unchecked(self) -> Buffer {
        Buffer(self)
    }

    pub(crate) fn into_function_unchecked(self) -> Function {
        Function(self)
    }

    pub(crate) fn into_promise_unchecked(self) -> Promise {
        Promise(self)
    }

    pub(crate) fn into_error_unchecked(self) -> JsError {
        JsError(self)
    }

    /// The runtime's `String(value)`.
    pub fn coerce_to_string(&self) -> Result<Value> {
        let raw = self.env.raw().coerce_to_string(self.raw)?;
        Ok(self.env.wrap_value(raw))
    }

    /// `String(value)` read back as a native string.
    pub fn to_display_string(&self) -> Result<String> {
        self.coerce_to_string()?.as_string()
    }

    pub fn strict_equals(&self, other: &Value) -> Result<bool> {
        Ok(self.env.raw().strict_equals(self.raw, other.raw)?)
    }

    /// Keep this value alive beyond the current call with one counted reference.
    pub fn new_ref(&self) -> Result<Ref> {
        let raw = self.env.raw().create_reference(self.raw, 1)?;
        Ok(Ref {
            env: self.env.clone(),
            raw,
        })
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Value").field("raw", &self.raw.0).finish()
    }
}

macro_rules! value_view {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug)]
        pub struct $name(Value);

        impl $name {
            pub fn as_value(&self) -> &Value {
                &self.0
            }

            pub fn into_value(self) -> Value {
                self.0
            }
        }

        impl Deref for $name {
            type Target = Value;

            fn deref(&self) -> &Value {
                &self.0
            }
        }

        impl From<$name> for Value {
            fn from(view: $name) -> Value {
                view.0
            }
        }
    };
}

value_view!(
    /// A value of type object.
    Object
);
value_view!(
    /// A byte buffer.
    Buffer
);
value_view!(
    /// A callable value.
    Function
);
value_view!(
    /// A promise object.
    Promise
);
value_view!(
    /// An error object.
    JsError
);

impl Object {
    pub fn get(&self, key: &Value) -> Result<Value> {
        let raw = self.env().raw().get_property(self.raw(), key.raw())?;
        Ok(self.env().wrap_value(raw))
    }

    pub fn get_named(&self, name: &str) -> Result<Value> {
        self.get(&self.env().new_string(name)?)
    }

    pub fn set(&self, key: &Value, value: &Value) -> Result<()> {
        Ok(self.env().raw().set_property(self.raw(), key.raw(), value.raw())?)
    }

    pub fn set_named(&self, name: &str, value: &Value) -> Result<()> {
        self.set(&self.env().new_string(name)?, value)
    }

    pub fn has_property(&self, key: &Value) -> Result<bool> {
        Ok(self.env().raw().has_property(self.raw(), key.raw())?)
    }

    pub fn has_own_property(&self, key: &Value) -> Result<bool> {
        Ok(self.env().raw().has_own_property(self.raw(), key.raw())?)
    }

    /// Own enumerable string keys, in insertion order.
    pub fn property_names(&self) -> Result<Vec<String>> {
        let env = self.env();
        let names = env.raw().get_property_names(self.raw())?;
        let length = env.raw().get_array_length(names)?;
        (0..length)
            .map(|index| {
                let raw = env.raw().get_element(names, index)?;
                env.wrap_value(raw).as_string()
            })
            .collect()
    }

    /// Look up the method `name` and call it with this object as receiver.
    pub fn call_named(&self, name: &str, args: &[Value]) -> Result<Value> {
        let method = self.get_named(name)?.as_function()?;
        method.call(self, args)
    }
}

impl Buffer {
    pub fn bytes(&self) -> Result<Vec<u8>> {
        Ok(self.env().raw().get_buffer_info(self.raw())?)
    }
}

impl Function {
    /// Call with an explicit receiver.
    ///
    /// If the callee throws, the exception stays pending and the call fails
    /// with the `PendingException` status.
    pub fn call(&self, this: &Value, args: &[Value]) -> Result<Value> {
        let raw_args: Vec<RawValue> = args.iter().map(Value::raw).collect();
        let raw = self
            .env()
            .raw()
            .call_function(this.raw(), self.raw(), &raw_args)?;
        Ok(self.env().wrap_value(raw))
    }

    /// Call with `undefined` as receiver.
    pub fn invoke(&self, args: &[Value]) -> Result<Value> {
        self.call(&self.env().undefined()?, args)
    }
}

impl JsError {
    pub fn message(&self) -> Result<String> {
        self.as_object_view().get_named("message")?.to_display_string()
    }

    /// The error's `code` property, when it is a string.
    pub fn code(&self) -> Result<Option<String>> {
        let code = self.as_object_view().get_named("code")?;
        if code.is_string()? {
            Ok(Some(code.as_string()?))
        } else {
            Ok(None)
        }
    }

    pub fn throw(&self) -> Result<()> {
        Ok(self.env().raw().throw(self.raw())?)
    }

    fn as_object_view(&self) -> Object {
        self.0.clone().into_object_unchecked()
    }
}

/// Counted reference keeping a value alive across calls.
///
/// The reference is deleted when [`Ref::dec`] brings the count to zero.
/// Dropping a `Ref` without that leaves the value reachable until teardown.
#[derive(Debug)]
pub struct Ref {
    env: Env,
    raw: RawRef,
}

impl Ref {
    pub fn raw(&self) -> RawRef {
        self.raw
    }

    pub fn value(&self) -> Result<Value> {
        let raw = self.env.raw().get_reference_value(self.raw)?;
        Ok(self.env.wrap_value(raw))
    }

    pub fn inc(&self) -> Result<u32> {
        Ok(self.env.raw().reference_ref(self.raw)?)
    }

    pub fn dec(self) -> Result<Option<Ref>> {
        let count = self.env.raw().reference_unref(self.raw)?;
        if count == 0 {
            self.env.raw().delete_reference(self.raw)?;
            return Ok(None);
        }
        Ok(Some(self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::local::LocalHost;

    #[test]
    fn test_type_checks() {
        let host = LocalHost::new();
        let env = host.env();

        let number = env.value_of(2.5).unwrap();
        assert!(number.is_number().unwrap());
        assert_eq!(number.as_f64().unwrap(), 2.5);
        assert_eq!(number.as_i64().unwrap(), 2);

        let err = number.as_string().unwrap_err();
        assert_eq!(
            err,
            Error::WrongType {
                expected: "string",
                actual: ValueType::Number
            }
        );
        assert_eq!(number.type_name(), "number");
    }

    #[test]
    fn test_object_properties() {
        let host = LocalHost::new();
        let env = host.env();

        let object = env.new_object().unwrap();
        object.set_named("b", &env.value_of(1).unwrap()).unwrap();
        object.set_named("a", &env.value_of("two").unwrap()).unwrap();

        assert_eq!(object.property_names().unwrap(), vec!["b", "a"]);
        assert_eq!(object.get_named("a").unwrap().as_string().unwrap(), "two");
        assert!(object.get_named("missing").unwrap().is_undefined().unwrap());
        assert!(object.has_own_property(&env.new_string("b").unwrap()).unwrap());
    }

    #[test]
    fn test_buffer_is_an_object() {
        let host = LocalHost::new();
        let env = host.env();

        let buffer = env.new_buffer(b"abc").unwrap();
        assert_eq!(buffer.bytes().unwrap(), b"abc");
        assert!(buffer.as_object().is_ok());
        assert!(env.new_object().unwrap().as_buffer().is_err());
    }

    #[test]
    fn test_coerce_to_string() {
        let host = LocalHost::new();
        let env = host.env();

        assert_eq!(env.value_of(42).unwrap().to_display_string().unwrap(), "42");
        assert_eq!(env.value_of(true).unwrap().to_display_string().unwrap(), "true");
        assert_eq!(env.null().unwrap().to_display_string().unwrap(), "null");
    }

    #[test]
    fn test_ref_counting() {
        let host = LocalHost::new();
        let env = host.env();

        let object = env.new_object().unwrap();
        let reference = object.new_ref().unwrap();
        assert_eq!(reference.inc().unwrap(), 2);
        assert!(reference.value().unwrap().strict_equals(&object).unwrap());

        let reference = reference.dec().unwrap().expect("still referenced");
        assert!(reference.dec().unwrap().is_none());
    }
}
