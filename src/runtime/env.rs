//! Safe handle to one runtime scope.

use crate::runtime::arena::{handles, Entry, Handle};
use crate::runtime::conversion::IntoJs;
use crate::runtime::error::{Error, Result};
use crate::runtime::finalize;
use crate::runtime::sys::{RawEnv, RawValue};
use crate::runtime::value::{Buffer, JsError, Object, Value};
use std::any::Any;
use std::collections::HashSet;
use std::fmt;
use std::ptr;
use std::rc::Rc;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

/// Runtime scope every value, function and queue is created in.
///
/// Cheap to clone. Confined to the runtime thread.
#[derive(Clone)]
pub struct Env {
    raw: RawEnv,
}

impl Env {
    pub fn wrap(raw: RawEnv) -> Self {
        Self { raw }
    }

    pub fn raw(&self) -> &RawEnv {
        &self.raw
    }

    /// Whether both handles refer to the same runtime scope.
    pub fn same_as(&self, other: &Env) -> bool {
        Rc::ptr_eq(&self.raw, &other.raw)
    }

    pub fn wrap_value(&self, raw: RawValue) -> Value {
        Value::new(self.clone(), raw)
    }

    pub fn undefined(&self) -> Result<Value> {
        Ok(self.wrap_value(self.raw.get_undefined()?))
    }

    pub fn null(&self) -> Result<Value> {
        Ok(self.wrap_value(self.raw.get_null()?))
    }

    pub fn global(&self) -> Result<Object> {
        Ok(self.wrap_value(self.raw.get_global()?).into_object_unchecked())
    }

    /// Convert a native value into a runtime value.
    pub fn value_of<T: IntoJs>(&self, value: T) -> Result<Value> {
        value.into_js(self)
    }

    pub fn new_object(&self) -> Result<Object> {
        Ok(self.wrap_value(self.raw.create_object()?).into_object_unchecked())
    }

    pub fn new_array(&self, length: usize) -> Result<Value> {
        Ok(self.wrap_value(self.raw.create_array_with_length(length)?))
    }

    pub fn new_buffer(&self, data: &[u8]) -> Result<Buffer> {
        Ok(self.wrap_value(self.raw.create_buffer_copy(data)?).into_buffer_unchecked())
    }

    pub fn new_string(&self, value: &str) -> Result<Value> {
        Ok(self.wrap_value(self.raw.create_string_utf8(value)?))
    }

    pub fn new_error(&self, code: Option<&str>, message: &str) -> Result<JsError> {
        let code = match code {
            Some(code) => Some(self.raw.create_string_utf8(code)?),
            None => None,
        };
        let message = self.raw.create_string_utf8(message)?;
        let raw = self.raw.create_error(code, message)?;
        Ok(self.wrap_value(raw).into_error_unchecked())
    }

    /// Throw a new error object carrying `message`.
    pub fn throw_error(&self, code: Option<&str>, message: &str) -> Result<()> {
        self.new_error(code, message)?.throw()
    }

    pub fn is_exception_pending(&self) -> Result<bool> {
        Ok(self.raw.is_exception_pending()?)
    }

    /// Take the pending exception, if any, leaving none pending.
    pub fn take_exception(&self) -> Result<Option<Value>> {
        if !self.is_exception_pending()? {
            return Ok(None);
        }
        Ok(Some(self.wrap_value(self.raw.get_and_clear_last_exception()?)))
    }

    /// Turn the pending exception into [`Error::Exception`] with its message.
    /// `fallback` is returned when nothing is pending.
    pub fn catch_exception(&self, fallback: Error) -> Error {
        let exception = match self.take_exception() {
            Ok(Some(exception)) => exception,
            Ok(None) => return fallback,
            Err(err) => return err,
        };
        let message = exception
            .as_error()
            .and_then(|error| error.message())
            .or_else(|_| exception.to_display_string())
            .unwrap_or_else(|err| format!("<unprintable exception: {err}>"));
        Error::Exception(message)
    }

    /// Well-known symbol such as `iterator` or `asyncIterator`.
    pub fn well_known_symbol(&self, name: &str) -> Result<Value> {
        let symbol = self.global()?.get_named("Symbol")?.as_object()?;
        let value = symbol.get_named(name)?;
        match value.value_type()? {
            crate::runtime::sys::ValueType::Symbol => Ok(value),
            actual => Err(Error::WrongType {
                expected: "symbol",
                actual,
            }),
        }
    }

    /// Attach application data to this runtime scope, replacing any previous
    /// value. Dropped when the runtime tears down.
    pub fn set_instance_data<T: Any + Send + Sync>(&self, data: T) -> Result<()> {
        let state = self.instance_state()?;
        *state.user_data() = Some(Arc::new(data));
        Ok(())
    }

    pub fn instance_data<T: Any + Send + Sync>(&self) -> Result<Option<Arc<T>>> {
        let state = self.instance_state()?;
        let data = state.user_data().clone();
        Ok(data.and_then(|entry| entry.downcast::<T>().ok()))
    }

    /// Report an error raised on the runtime thread outside of any caller
    /// that could receive it. It is thrown into the runtime; if that fails as
    /// well both errors are logged.
    pub(crate) fn report_error(&self, origin: &str, err: &Error) {
        if matches!(self.is_exception_pending(), Ok(true)) {
            // An exception from the same failure is already on its way out.
            debug!(origin, error = %err, "exception already pending");
            return;
        }
        if let Err(secondary) = self.throw_error(None, &err.to_string()) {
            warn!(
                origin,
                error = %err,
                secondary = %secondary,
                "an error occurred while reporting another error"
            );
        }
    }

    /// Per-scope bookkeeping, created on first use.
    pub(crate) fn instance_state(&self) -> Result<Arc<InstanceState>> {
        let current = self.raw.get_instance_data()?;
        if let Some(handle) = Handle::from_raw(current) {
            return finalize::data_of::<InstanceState>(handle)
                .ok_or(Error::InvalidState("instance data is owned by another binding"));
        }

        let record = finalize::wrap(Arc::new(InstanceState::default()), |_env, state, _hint| {
            state.release_callbacks();
            Ok(())
        });
        if let Err(status) = self.raw.set_instance_data(
            record.into_raw(),
            Some(finalize::call_wrapped_finalizer),
            ptr::null_mut(),
        ) {
            handles().delete(record);
            return Err(status.into());
        }
        finalize::data_of::<InstanceState>(record)
            .ok_or(Error::InvalidState("instance data record vanished"))
    }
}

impl fmt::Debug for Env {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Env")
            .field("raw", &Rc::as_ptr(&self.raw).cast::<()>())
            .finish()
    }
}

/// Bookkeeping attached to a runtime scope as its instance data.
///
/// Every callback handle is deleted exactly once: by the function's finalizer
/// if it wins the race to untrack it, otherwise at teardown.
#[derive(Default)]
pub(crate) struct InstanceState {
    callbacks: Mutex<HashSet<Handle>>,
    user_data: Mutex<Option<Entry>>,
}

impl InstanceState {
    pub(crate) fn track_callback(&self, handle: Handle) {
        self.callbacks().insert(handle);
    }

    /// Stop tracking `handle`. Returns whether it was still tracked, in which
    /// case the caller now owns its deletion.
    pub(crate) fn forget_callback(&self, handle: Handle) -> bool {
        self.callbacks().remove(&handle)
    }

    pub(crate) fn live_callbacks(&self) -> usize {
        self.callbacks().len()
    }

    fn release_callbacks(&self) {
        let remaining: Vec<Handle> = self.callbacks().drain().collect();
        if !remaining.is_empty() {
            debug!(count = remaining.len(), "releasing callbacks at teardown");
        }
        for handle in remaining {
            handles().delete(handle);
        }
        self.user_data().take();
    }

    fn callbacks(&self) -> MutexGuard<'_, HashSet<Handle>> {
        self.callbacks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn user_data(&self) -> MutexGuard<'_, Option<Entry>> {
        self.user_data.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::local::LocalHost;

    #[test]
    fn test_singletons_and_errors() {
        let host = LocalHost::new();
        let env = host.env();

        assert!(env.undefined().unwrap().is_undefined().unwrap());
        assert!(env.null().unwrap().is_null().unwrap());

        let err = env.new_error(Some("E_CODE"), "bad input").unwrap();
        assert_eq!(err.message().unwrap(), "bad input");
        assert_eq!(err.code().unwrap().as_deref(), Some("E_CODE"));
    }

    #[test]
    fn test_take_exception_clears_it() {
        let host = LocalHost::new();
        let env = host.env();

        assert!(env.take_exception().unwrap().is_none());
        env.throw_error(None, "thrown").unwrap();
        assert!(env.is_exception_pending().unwrap());

        let thrown = env.take_exception().unwrap().unwrap();
        assert_eq!(thrown.as_error().unwrap().message().unwrap(), "thrown");
        assert!(!env.is_exception_pending().unwrap());
    }

    #[test]
    fn test_instance_data_round_trip() {
        let host = LocalHost::new();
        let env = host.env();

        assert!(env.instance_data::<String>().unwrap().is_none());
        env.set_instance_data(String::from("app state")).unwrap();
        assert_eq!(
            env.instance_data::<String>().unwrap().as_deref().map(String::as_str),
            Some("app state")
        );
        assert!(env.instance_data::<u32>().unwrap().is_none());
    }

    #[test]
    fn test_well_known_symbol() {
        let host = LocalHost::new();
        let env = host.env();

        let iterator = env.well_known_symbol("iterator").unwrap();
        assert_eq!(iterator.value_type().unwrap(), crate::runtime::sys::ValueType::Symbol);
        assert!(env.well_known_symbol("notASymbol").is_err());
    }
}
