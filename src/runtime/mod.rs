//! Native bridge to a single-threaded embedded JavaScript runtime.
//!
//! Native code talks to the runtime through the [`sys::NativeApi`] surface.
//! On top of it this module provides a process-wide handle arena for native
//! data owned by runtime objects, typed native callbacks, threadsafe call
//! queues and promises settled from any thread. [`LocalHost`] implements the
//! surface in-process; [`RuntimeHandle`] hosts it on a dedicated OS thread
//! with a Tokio event loop.

pub mod arena;
pub mod callback;
pub mod config;
pub mod conversion;
pub mod env;
pub mod error;
pub mod finalize;
pub mod handle;
pub mod js_value;
pub mod local;
pub mod promise;
pub mod runner;
pub mod sys;
pub mod tsfn;
pub mod value;

// Re-export key types for convenience
pub use arena::{handles, Handle, HandleArena};
pub use callback::{Callback, IntoCallback, Rest, Signature};
pub use config::RuntimeConfig;
pub use conversion::IntoJs;
pub use env::Env;
pub use error::{Error, Result};
pub use handle::RuntimeHandle;
pub use js_value::JSValue;
pub use local::{LocalHost, PromiseState};
pub use promise::{Deferred, DeferredSettlement, Settler};
pub use tsfn::{CallMode, ThreadsafeFunction, ThreadsafeFunctionBuilder};
pub use value::{Buffer, Function, JsError, Object, Promise, Ref, Value};

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_runtime_lifecycle() {
        let config = RuntimeConfig::default();
        let mut handle = RuntimeHandle::spawn(config).unwrap();

        assert!(!handle.is_shutdown());

        let result = handle.run_sync(|env| env.value_of(40 + 2)?.to_snapshot());
        assert_eq!(result.unwrap().unwrap(), JSValue::Int(42));

        handle.close().unwrap();
        assert!(handle.is_shutdown());
    }

    #[test]
    fn test_concurrent_runtimes() {
        let mut threads = vec![];
        for i in 0..3 {
            let config = RuntimeConfig::new().with_thread_name(format!("runtime-{i}"));
            let mut handle = RuntimeHandle::spawn(config).unwrap();
            threads.push(thread::spawn(move || {
                let result = handle
                    .run_sync(move |env| env.value_of(i + 100)?.to_display_string())
                    .unwrap();
                assert_eq!(result.unwrap(), format!("{}", i + 100));
                handle.close().unwrap();
            }));
        }

        for t in threads {
            t.join().unwrap();
        }
    }

    #[test]
    fn test_runtime_state_persistence() {
        let mut handle = RuntimeHandle::spawn(RuntimeConfig::default()).unwrap();

        handle
            .run_sync(|env| {
                let counter = env.value_of(0)?;
                env.global()?.set_named("counter", &counter)
            })
            .unwrap()
            .unwrap();

        let counter = handle
            .run_sync(|env| env.global()?.get_named("counter")?.as_i64())
            .unwrap();
        assert_eq!(counter.unwrap(), 0);

        handle.close().unwrap();
    }
}
