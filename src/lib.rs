//! Typed native callbacks, a handle arena and threadsafe call queues for a
//! single-threaded embedded JavaScript runtime.
//!
//! See [`runtime`] for the building blocks. Most embedders start from
//! [`RuntimeHandle::spawn`] or, on the runtime thread, from an [`Env`].

pub mod runtime;

pub use runtime::{
    Callback, CallMode, Deferred, DeferredSettlement, Env, Error, IntoCallback, IntoJs, JSValue,
    LocalHost, Rest, Result, RuntimeConfig, RuntimeHandle, ThreadsafeFunction, Value,
};
