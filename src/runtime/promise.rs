//! Promises settled from any thread.
//!
//! [`Env::new_deferred`] creates a runtime promise and a
//! [`DeferredSettlement`]. The settlement can be moved to another thread;
//! settling it queues the data through a private threadsafe function whose
//! dispatcher hands the data and the promise's [`Deferred`] to the settler on
//! the runtime thread. A settlement settles at most once.

use crate::runtime::conversion::IntoJs;
use crate::runtime::env::Env;
use crate::runtime::error::{Error, Result};
use crate::runtime::sys::RawDeferred;
use crate::runtime::tsfn::ThreadsafeFunction;
use crate::runtime::value::Promise;
use std::fmt::{self, Display};
use std::sync::atomic::{AtomicBool, Ordering};

/// Resolve/reject half of a runtime promise. Only usable on the runtime
/// thread; consumed by settling.
#[derive(Debug)]
pub struct Deferred {
    env: Env,
    raw: RawDeferred,
}

impl Deferred {
    pub fn resolve(self, value: impl IntoJs) -> Result<()> {
        let value = self.env.value_of(value)?;
        Ok(self.env.raw().resolve_deferred(self.raw, value.raw())?)
    }

    pub fn reject(self, value: impl IntoJs) -> Result<()> {
        let value = self.env.value_of(value)?;
        Ok(self.env.raw().reject_deferred(self.raw, value.raw())?)
    }
}

/// Decides how settlement data resolves or rejects a promise.
pub trait Settler<T>: Send + Sync + 'static {
    fn settle(&self, env: &Env, deferred: Deferred, data: T) -> Result<()>;
}

impl<T, F> Settler<T> for F
where
    F: Fn(&Env, Deferred, T) -> Result<()> + Send + Sync + 'static,
{
    fn settle(&self, env: &Env, deferred: Deferred, data: T) -> Result<()> {
        self(env, deferred, data)
    }
}

struct PromiseContext<S> {
    deferred: RawDeferred,
    settler: S,
}

/// Cross-thread handle that settles one promise.
pub struct DeferredSettlement<T> {
    tsfn: ThreadsafeFunction<T>,
    settled: AtomicBool,
}

impl<T: Send + 'static> DeferredSettlement<T> {
    /// Queue `data` for the settler and give up the queue.
    ///
    /// Only the first call has any effect; later calls fail with
    /// [`Error::AlreadySettled`]. If queueing fails that error is returned,
    /// and the queue is released either way.
    pub fn settle(&self, data: T) -> Result<()> {
        if self
            .settled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::AlreadySettled);
        }

        let queued = self.tsfn.call(data);
        let released = self.tsfn.release();
        queued.and(released)
    }

    pub fn is_settled(&self) -> bool {
        self.settled.load(Ordering::Acquire)
    }
}

impl<T> fmt::Debug for DeferredSettlement<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeferredSettlement")
            .field("settled", &self.settled.load(Ordering::Acquire))
            .finish()
    }
}

impl Env {
    /// Create a pending promise settled through `settler`.
    pub fn new_deferred<T, S>(&self, settler: S) -> Result<(Promise, DeferredSettlement<T>)>
    where
        T: Send + 'static,
        S: Settler<T>,
    {
        let (deferred, promise) = self.raw().create_promise()?;
        let tsfn = ThreadsafeFunction::builder(self, "jsbridge/promise", PromiseContext { deferred, settler })
            .build(|env, _callback, context: &PromiseContext<S>, data: T| {
                let deferred = Deferred {
                    env: env.clone(),
                    raw: context.deferred,
                };
                context.settler.settle(env, deferred, data)
            })?;

        Ok((
            self.wrap_value(promise).into_promise_unchecked(),
            DeferredSettlement {
                tsfn,
                settled: AtomicBool::new(false),
            },
        ))
    }

    /// Promise settled by a `Result`: `Ok` resolves with the converted value,
    /// `Err` rejects with an error object carrying the error's message.
    pub fn new_result_promise<T, E>(
        &self,
    ) -> Result<(Promise, DeferredSettlement<std::result::Result<T, E>>)>
    where
        T: IntoJs + Send + 'static,
        E: Display + Send + 'static,
    {
        self.new_deferred(
            |env: &Env, deferred: Deferred, data: std::result::Result<T, E>| match data {
                Ok(value) => deferred.resolve(value),
                Err(err) => deferred.reject(env.new_error(None, &err.to_string())?),
            },
        )
    }
}
