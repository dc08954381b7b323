//! Native functions built from typed Rust closures.
//!
//! A closure is registered once through [`Env::new_function`]. Its parameter
//! types are validated into a [`Signature`], the closure is parked in the
//! handle arena, and the runtime gets a function whose native entry point is
//! the single fixed [`callback_trampoline`]. On every call the trampoline
//! recovers the closure, converts the receiver and arguments to the declared
//! kinds and calls it. Any conversion failure, or an error returned by the
//! closure, is thrown into the runtime; the closure is never invoked with a
//! partially converted argument list.

mod signature;
mod typed;

pub use signature::{ParamDesc, ParamKind, ParamShape, ResultShape, Signature};
pub use typed::{Arg, CallbackResult, FromArg, IntoCallback, Param, Rest};
pub(crate) use typed::{Returned, Slot};

use crate::runtime::arena::{handles, Handle};
use crate::runtime::env::Env;
use crate::runtime::error::{Error, Result};
use crate::runtime::finalize;
use crate::runtime::sys::{RawCallbackInfo, RawEnv, RawValue};
use crate::runtime::value::{Function, Value};
use std::fmt;
use std::ptr;
use std::sync::Arc;
use tracing::{trace, warn};

type Target = dyn Fn(&Env, Vec<Slot>) -> Option<Returned> + Send + Sync;

/// A registered-ready native function: its validated signature and the
/// type-erased body.
pub struct Callback {
    signature: Signature,
    target: Box<Target>,
}

impl Callback {
    /// Build a callback from a closure, validating its signature.
    pub fn new<M>(function: impl IntoCallback<M>) -> Result<Self> {
        function.into_callback()
    }

    pub(crate) fn from_parts<F>(signature: Signature, target: F) -> Self
    where
        F: Fn(&Env, Vec<Slot>) -> Option<Returned> + Send + Sync + 'static,
    {
        Self {
            signature,
            target: Box::new(target),
        }
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    /// Convert the receiver and arguments, then run the body.
    ///
    /// `Ok(None)` means the body produced no value. `Err` carries the message
    /// the caller is expected to throw.
    pub fn invoke(
        &self,
        env: &Env,
        this: &Value,
        args: &[Value],
    ) -> std::result::Result<Option<Value>, String> {
        let slots = self.marshal(env, this, args)?;
        match (self.target)(env, slots) {
            Some(returned) => returned,
            None => Err("marshalled arguments do not match the callback signature".to_string()),
        }
    }

    fn marshal(
        &self,
        env: &Env,
        this: &Value,
        args: &[Value],
    ) -> std::result::Result<Vec<Slot>, String> {
        let signature = &self.signature;
        let mut slots = Vec::with_capacity(signature.min_args() + 2);

        if signature.has_env() {
            slots.push(Slot::Env(env.clone()));
        }

        let receiver = signature.receiver();
        let this = receiver.convert(this).ok_or_else(|| {
            format!(
                "this: expected {receiver}, got incompatible type: {}",
                this.type_name()
            )
        })?;
        slots.push(Slot::One(this));

        match signature.params() {
            ParamShape::Fixed(kinds) => {
                if args.len() < kinds.len() {
                    return Err(format!(
                        "Expected {} argument(s), got {}",
                        kinds.len(),
                        args.len()
                    ));
                }
                // Surplus arguments are ignored.
                for (index, (kind, arg)) in kinds.iter().zip(args).enumerate() {
                    slots.push(Slot::One(convert_arg(*kind, index, arg)?));
                }
            }
            ParamShape::Collect(kind) => {
                let collected = args
                    .iter()
                    .enumerate()
                    .map(|(index, arg)| convert_arg(*kind, index, arg))
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                slots.push(Slot::Many(collected));
            }
            ParamShape::Variadic { prefix, tail } => {
                if args.len() < prefix.len() {
                    return Err(format!(
                        "Expected at least {} argument(s), got {}",
                        prefix.len(),
                        args.len()
                    ));
                }
                for (index, (kind, arg)) in prefix.iter().zip(args).enumerate() {
                    slots.push(Slot::One(convert_arg(*kind, index, arg)?));
                }
                let rest = args[prefix.len()..]
                    .iter()
                    .enumerate()
                    .map(|(offset, arg)| convert_arg(*tail, prefix.len() + offset, arg))
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                slots.push(Slot::Many(rest));
            }
        }

        Ok(slots)
    }
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callback")
            .field("signature", &self.signature)
            .finish_non_exhaustive()
    }
}

fn convert_arg(kind: ParamKind, index: usize, value: &Value) -> std::result::Result<Arg, String> {
    kind.convert(value).ok_or_else(|| {
        format!(
            "Argument {index}: expected {kind}, got incompatible type: {}",
            value.type_name()
        )
    })
}

/// The single native entry point behind every function made by
/// [`Env::new_function`].
pub fn callback_trampoline(raw_env: &RawEnv, info: RawCallbackInfo) -> Option<RawValue> {
    let env = Env::wrap(raw_env.clone());
    let call = match raw_env.get_cb_info(info) {
        Ok(call) => call,
        Err(status) => return throw_and_return_undefined(&env, &Error::from(status).to_string()),
    };
    let Some(handle) = Handle::from_raw(call.data) else {
        return throw_and_return_undefined(&env, "native function has no callback attached");
    };

    let Some(callback) = handles().try_resolve::<Callback>(handle) else {
        return throw_and_return_undefined(&env, "native function has been released");
    };
    let this = env.wrap_value(call.this);
    let args: Vec<Value> = call.args.iter().map(|raw| env.wrap_value(*raw)).collect();
    trace!(?handle, argc = args.len(), "dispatching native callback");

    match callback.invoke(&env, &this, &args) {
        Ok(Some(value)) => Some(value.raw()),
        Ok(None) => None,
        Err(message) => throw_and_return_undefined(&env, &message),
    }
}

fn throw_and_return_undefined(env: &Env, message: &str) -> Option<RawValue> {
    if let Err(err) = env.throw_error(None, message) {
        warn!(error = %err, message, "failed to throw callback error");
    }
    None
}

impl Env {
    /// Register `function` as a native function named `name`.
    ///
    /// The closure's first parameter (after an optional leading `Env`) is the
    /// call's receiver. Registration fails for shapes with no receiver or a
    /// misplaced `Env`, `Vec` or `Rest` parameter.
    pub fn new_function<M>(&self, name: &str, function: impl IntoCallback<M>) -> Result<Function> {
        let callback = function.into_callback()?;
        self.new_function_from(name, callback)
    }

    pub fn new_function_from(&self, name: &str, callback: Callback) -> Result<Function> {
        let instance = self.instance_state()?;
        let handle = handles().insert(callback);
        instance.track_callback(handle);

        let raw = match self.raw().create_function(name, callback_trampoline, handle.into_raw()) {
            Ok(raw) => raw,
            Err(status) => {
                if instance.forget_callback(handle) {
                    handles().delete(handle);
                }
                return Err(status.into());
            }
        };

        let owner = instance.clone();
        let record = finalize::wrap(Arc::new(handle), move |_env, handle: Arc<Handle>, _hint| {
            if owner.forget_callback(*handle) {
                handles().delete(*handle);
            }
            Ok(())
        });
        if let Err(status) =
            self.raw()
                .add_finalizer(raw, record.into_raw(), finalize::call_wrapped_finalizer, ptr::null_mut())
        {
            // The callback stays tracked and is released at teardown.
            handles().delete(record);
            return Err(status.into());
        }

        trace!(name, ?handle, live = instance.live_callbacks(), "registered native function");
        Ok(self.wrap_value(raw).into_function_unchecked())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::local::LocalHost;
    use crate::runtime::value::Object;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn thrown_message(env: &Env) -> String {
        let thrown = env.take_exception().unwrap().expect("an exception");
        thrown.as_error().unwrap().message().unwrap()
    }

    #[test]
    fn test_receiver_and_number_argument() {
        let host = LocalHost::new();
        let env = host.env();

        let concat = env
            .new_function("concat", |this: String, n: i64| -> Result<String> {
                Ok(format!("{this}{n}"))
            })
            .unwrap();

        let result = concat
            .call(&env.value_of("hi").unwrap(), &[env.value_of(5).unwrap()])
            .unwrap();
        assert_eq!(result.as_string().unwrap(), "hi5");
    }

    #[test]
    fn test_receiver_type_mismatch_throws_without_invoking() {
        let host = LocalHost::new();
        let env = host.env();
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = calls.clone();
        let function = env
            .new_function("f", move |_this: String, _n: i64| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        let err = function
            .call(&env.value_of(42).unwrap(), &[env.value_of(1).unwrap()])
            .unwrap_err();
        assert_eq!(err, Error::Status(crate::runtime::sys::Status::PendingException));
        assert_eq!(
            thrown_message(&env),
            "this: expected string, got incompatible type: number"
        );
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_missing_argument() {
        let host = LocalHost::new();
        let env = host.env();

        let function = env
            .new_function("f", |_this: Value, _a: String, _b: bool| ())
            .unwrap();
        assert!(function.invoke(&[env.value_of("only").unwrap()]).is_err());
        assert_eq!(thrown_message(&env), "Expected 2 argument(s), got 1");
    }

    #[test]
    fn test_argument_type_mismatch_reports_index() {
        let host = LocalHost::new();
        let env = host.env();

        let function = env
            .new_function("f", |_this: Value, _a: String, _b: Object| ())
            .unwrap();
        let args = [env.value_of("ok").unwrap(), env.value_of(3).unwrap()];
        assert!(function.invoke(&args).is_err());
        assert_eq!(
            thrown_message(&env),
            "Argument 1: expected Object, got incompatible type: number"
        );
    }

    #[test]
    fn test_extra_arguments_ignored() {
        let host = LocalHost::new();
        let env = host.env();

        let first = env
            .new_function("first", |_this: Value, a: f64| a * 2.0)
            .unwrap();
        let args = [env.value_of(2).unwrap(), env.value_of("extra").unwrap()];
        assert_eq!(first.invoke(&args).unwrap().as_f64().unwrap(), 4.0);
    }

    #[test]
    fn test_collect_all_arguments() {
        let host = LocalHost::new();
        let env = host.env();

        let join = env
            .new_function("join", |_this: Value, parts: Vec<String>| parts.join("-"))
            .unwrap();
        let args = [
            env.value_of("a").unwrap(),
            env.value_of("b").unwrap(),
            env.value_of("c").unwrap(),
        ];
        assert_eq!(join.invoke(&args).unwrap().as_string().unwrap(), "a-b-c");
        assert_eq!(join.invoke(&[]).unwrap().as_string().unwrap(), "");

        let mixed = [env.value_of("a").unwrap(), env.value_of(true).unwrap()];
        assert!(join.invoke(&mixed).is_err());
        assert_eq!(
            thrown_message(&env),
            "Argument 1: expected string, got incompatible type: boolean"
        );
    }

    #[test]
    fn test_variadic_tail() {
        let host = LocalHost::new();
        let env = host.env();

        let sum = env
            .new_function("sum", |env: Env, _this: Value, label: String, values: Rest<f64>| {
                let total: f64 = values.iter().sum();
                env.value_of(format!("{label}={total}"))
            })
            .unwrap();

        let args = [
            env.value_of("total").unwrap(),
            env.value_of(1).unwrap(),
            env.value_of(2.5).unwrap(),
        ];
        assert_eq!(sum.invoke(&args).unwrap().as_string().unwrap(), "total=3.5");

        assert!(sum.invoke(&[]).is_err());
        assert_eq!(thrown_message(&env), "Expected at least 1 argument(s), got 0");

        let bad_tail = [
            env.value_of("total").unwrap(),
            env.value_of(1).unwrap(),
            env.null().unwrap(),
        ];
        assert!(sum.invoke(&bad_tail).is_err());
        assert_eq!(
            thrown_message(&env),
            "Argument 2: expected number, got incompatible type: null"
        );
    }

    #[test]
    fn test_returned_error_is_thrown_verbatim() {
        let host = LocalHost::new();
        let env = host.env();

        let failing = env
            .new_function("failing", |_this: Value| -> std::result::Result<bool, String> {
                Err("validation failed".to_string())
            })
            .unwrap();
        assert!(failing.invoke(&[]).is_err());
        assert_eq!(thrown_message(&env), "validation failed");
    }

    #[test]
    fn test_unit_result_is_undefined() {
        let host = LocalHost::new();
        let env = host.env();

        let noop = env.new_function("noop", |_this: Value| ()).unwrap();
        assert!(noop.invoke(&[]).unwrap().is_undefined().unwrap());
    }

    #[test]
    fn test_registration_rejects_missing_receiver() {
        let host = LocalHost::new();
        let env = host.env();

        let err = env.new_function("bad", || ()).unwrap_err();
        assert!(matches!(err, Error::Signature(_)));

        let err = env.new_function("bad", |_env: Env| ()).unwrap_err();
        assert!(matches!(err, Error::Signature(_)));

        let err = env
            .new_function("bad", |_this: Value, _env: Env| ())
            .unwrap_err();
        assert!(matches!(err, Error::Signature(_)));
    }

    #[test]
    fn test_callback_released_by_finalizer_or_teardown() {
        let host = LocalHost::new();
        let env = host.env();
        let dropped = Arc::new(AtomicUsize::new(0));

        struct Tracker(Arc<AtomicUsize>);
        impl Drop for Tracker {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let tracker = Tracker(dropped.clone());
        env.new_function("held", move |_this: Value| {
            let _ = &tracker;
        })
        .unwrap();
        assert_eq!(dropped.load(Ordering::SeqCst), 0);

        host.teardown();
        assert_eq!(dropped.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_fallible_unit_result() {
        let host = LocalHost::new();
        let env = host.env();

        let check = env
            .new_function("check", |_this: Value, n: f64| -> std::result::Result<(), String> {
                if n < 0.0 {
                    return Err(format!("{n} is negative"));
                }
                Ok(())
            })
            .unwrap();

        let ok = check.invoke(&[env.value_of(1).unwrap()]).unwrap();
        assert!(ok.is_undefined().unwrap());

        assert!(check.invoke(&[env.value_of(-2).unwrap()]).is_err());
        assert_eq!(thrown_message(&env), "-2 is negative");
    }

    #[test]
    fn test_released_function_throws() {
        let host = LocalHost::new();
        let env = host.env();

        let held = env.new_function("held", |_this: Value| 1.0).unwrap();
        host.teardown();

        assert!(held.invoke(&[]).is_err());
        assert_eq!(thrown_message(&env), "native function has been released");
    }
}
