//! Raw boundary between the bridge and the host runtime.
//!
//! Everything in this module mirrors the shape of a C-style native API:
//! opaque value tokens, untyped data pointers, status codes and fixed
//! callback signatures. The [`NativeApi`] trait is the table of native entry
//! points the rest of the crate calls into. Implementations are thin
//! pass-throughs; [`crate::runtime::local::LocalHost`] is the in-process one.

use std::any::Any;
use std::ffi::c_void;
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

/// Untyped pointer crossing the native boundary.
pub type RawPtr = *mut c_void;

/// Runtime-scope token. Values created through one `RawEnv` must only be
/// used with that same env.
pub type RawEnv = Rc<dyn NativeApi>;

/// Opaque token for a value living in the runtime.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RawValue(pub u64);

/// Opaque token for the resolve/reject half of a promise pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RawDeferred(pub u64);

/// Opaque token for a counted runtime reference.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RawRef(pub u64);

/// Opaque token identifying one in-flight native call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RawCallbackInfo(pub u64);

/// Receiver, arguments and registration data of a native call.
#[derive(Clone, Debug)]
pub struct RawCallInfo {
    pub this: RawValue,
    pub args: Vec<RawValue>,
    pub data: RawPtr,
}

/// Entry point invoked by the runtime when a native function is called.
/// `None` is read as `undefined`.
pub type RawCallback = fn(env: &RawEnv, info: RawCallbackInfo) -> Option<RawValue>;

/// Entry point invoked by the runtime when a finalizable resource dies.
pub type RawFinalize = fn(env: &RawEnv, data: RawPtr, hint: RawPtr);

/// Entry point invoked on the runtime thread once per queued threadsafe call.
pub type RawCallJs = fn(env: &RawEnv, callback: Option<RawValue>, context: RawPtr, data: RawPtr);

/// Work scheduled onto the runtime thread.
pub type Job = Box<dyn FnOnce(&RawEnv) + Send>;

/// Cross-thread side of the runtime's event loop.
///
/// Jobs run on the runtime thread in the order they were scheduled.
pub trait LoopHandle: Send + Sync {
    fn schedule(&self, job: Job) -> Result<(), Status>;

    /// Run `job` once on the runtime thread when the loop closes, after the
    /// jobs still queued have been discarded. Fails with
    /// [`Status::Closing`] if the loop is already closed.
    fn on_close(&self, job: Job) -> Result<(), Status>;
}

/// Status codes returned by native entry points.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Status {
    Ok,
    InvalidArg,
    ObjectExpected,
    StringExpected,
    NameExpected,
    FunctionExpected,
    NumberExpected,
    BooleanExpected,
    ArrayExpected,
    GenericFailure,
    PendingException,
    Cancelled,
    EscapeCalledTwice,
    HandleScopeMismatch,
    CallbackScopeMismatch,
    QueueFull,
    Closing,
    BigintExpected,
    DateExpected,
    ArraybufferExpected,
    DetachableArraybufferExpected,
    WouldDeadlock,
}

impl Status {
    pub fn message(self) -> &'static str {
        match self {
            Status::Ok => "ok",
            Status::InvalidArg => "invalid argument",
            Status::ObjectExpected => "an object was expected",
            Status::StringExpected => "a string was expected",
            Status::NameExpected => "a string or symbol was expected",
            Status::FunctionExpected => "a function was expected",
            Status::NumberExpected => "a number was expected",
            Status::BooleanExpected => "a boolean was expected",
            Status::ArrayExpected => "an array was expected",
            Status::GenericFailure => "unknown failure",
            Status::PendingException => "an exception is pending",
            Status::Cancelled => "the async work item was cancelled",
            Status::EscapeCalledTwice => "escape called twice",
            Status::HandleScopeMismatch => "invalid handle scope usage",
            Status::CallbackScopeMismatch => "invalid callback scope usage",
            Status::QueueFull => "thread-safe function queue is full",
            Status::Closing => "thread-safe function handle is closing",
            Status::BigintExpected => "a bigint was expected",
            Status::DateExpected => "a date was expected",
            Status::ArraybufferExpected => "an arraybuffer was expected",
            Status::DetachableArraybufferExpected => "a detachable arraybuffer was expected",
            Status::WouldDeadlock => "main thread would deadlock",
        }
    }

    /// Turn a status into `Ok(())` or the matching error.
    pub fn into_result(self) -> crate::runtime::error::Result<()> {
        match self {
            Status::Ok => Ok(()),
            other => Err(other.into()),
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

/// Runtime type tag of a value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ValueType {
    Undefined,
    Null,
    Boolean,
    Number,
    String,
    Symbol,
    Object,
    Function,
    External,
    Bigint,
}

impl ValueType {
    pub fn name(self) -> &'static str {
        match self {
            ValueType::Undefined => "undefined",
            ValueType::Null => "null",
            ValueType::Boolean => "boolean",
            ValueType::Number => "number",
            ValueType::String => "string",
            ValueType::Symbol => "symbol",
            ValueType::Object => "object",
            ValueType::Function => "function",
            ValueType::External => "external",
            ValueType::Bigint => "bigint",
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Native entry points of the host runtime.
///
/// Every method may only be called on the runtime thread. Failures are
/// reported as a non-`Ok` [`Status`].
pub trait NativeApi: Any {
    fn as_any(&self) -> &dyn Any;

    // Singletons and primitives.
    fn get_undefined(&self) -> Result<RawValue, Status>;
    fn get_null(&self) -> Result<RawValue, Status>;
    fn get_global(&self) -> Result<RawValue, Status>;
    fn get_boolean(&self, value: bool) -> Result<RawValue, Status>;
    fn create_double(&self, value: f64) -> Result<RawValue, Status>;
    fn create_string_utf8(&self, value: &str) -> Result<RawValue, Status>;
    fn create_symbol(&self, description: Option<RawValue>) -> Result<RawValue, Status>;

    // Compound values.
    fn create_object(&self) -> Result<RawValue, Status>;
    fn create_array_with_length(&self, length: usize) -> Result<RawValue, Status>;
    fn create_buffer_copy(&self, data: &[u8]) -> Result<RawValue, Status>;
    fn create_error(&self, code: Option<RawValue>, message: RawValue) -> Result<RawValue, Status>;

    // Inspection.
    fn type_of(&self, value: RawValue) -> Result<ValueType, Status>;
    fn is_array(&self, value: RawValue) -> Result<bool, Status>;
    fn is_buffer(&self, value: RawValue) -> Result<bool, Status>;
    fn is_error(&self, value: RawValue) -> Result<bool, Status>;
    fn is_promise(&self, value: RawValue) -> Result<bool, Status>;
    fn get_value_bool(&self, value: RawValue) -> Result<bool, Status>;
    fn get_value_double(&self, value: RawValue) -> Result<f64, Status>;
    fn get_value_int64(&self, value: RawValue) -> Result<i64, Status>;
    fn get_value_string_utf8(&self, value: RawValue) -> Result<String, Status>;
    fn get_buffer_info(&self, value: RawValue) -> Result<Vec<u8>, Status>;
    fn get_array_length(&self, value: RawValue) -> Result<u32, Status>;
    fn coerce_to_string(&self, value: RawValue) -> Result<RawValue, Status>;
    fn strict_equals(&self, lhs: RawValue, rhs: RawValue) -> Result<bool, Status>;

    // Properties.
    fn get_property_names(&self, object: RawValue) -> Result<RawValue, Status>;
    fn set_property(&self, object: RawValue, key: RawValue, value: RawValue) -> Result<(), Status>;
    fn get_property(&self, object: RawValue, key: RawValue) -> Result<RawValue, Status>;
    fn has_property(&self, object: RawValue, key: RawValue) -> Result<bool, Status>;
    fn has_own_property(&self, object: RawValue, key: RawValue) -> Result<bool, Status>;
    fn set_element(&self, array: RawValue, index: u32, value: RawValue) -> Result<(), Status>;
    fn get_element(&self, array: RawValue, index: u32) -> Result<RawValue, Status>;

    // Exceptions.
    fn throw(&self, error: RawValue) -> Result<(), Status>;
    fn is_exception_pending(&self) -> Result<bool, Status>;
    fn get_and_clear_last_exception(&self) -> Result<RawValue, Status>;

    // Functions.
    fn create_function(&self, name: &str, callback: RawCallback, data: RawPtr) -> Result<RawValue, Status>;
    fn get_cb_info(&self, info: RawCallbackInfo) -> Result<RawCallInfo, Status>;
    fn call_function(&self, recv: RawValue, func: RawValue, args: &[RawValue]) -> Result<RawValue, Status>;

    // Lifetimes.
    fn add_finalizer(&self, object: RawValue, data: RawPtr, finalize: RawFinalize, hint: RawPtr) -> Result<(), Status>;
    fn create_reference(&self, value: RawValue, initial_refcount: u32) -> Result<RawRef, Status>;
    fn delete_reference(&self, reference: RawRef) -> Result<(), Status>;
    fn reference_ref(&self, reference: RawRef) -> Result<u32, Status>;
    fn reference_unref(&self, reference: RawRef) -> Result<u32, Status>;
    fn get_reference_value(&self, reference: RawRef) -> Result<RawValue, Status>;

    // Promises.
    fn create_promise(&self) -> Result<(RawDeferred, RawValue), Status>;
    fn resolve_deferred(&self, deferred: RawDeferred, value: RawValue) -> Result<(), Status>;
    fn reject_deferred(&self, deferred: RawDeferred, value: RawValue) -> Result<(), Status>;

    // Instance data.
    fn set_instance_data(&self, data: RawPtr, finalize: Option<RawFinalize>, hint: RawPtr) -> Result<(), Status>;
    fn get_instance_data(&self) -> Result<RawPtr, Status>;

    // Event loop.
    fn loop_handle(&self) -> Result<Arc<dyn LoopHandle>, Status>;
}
