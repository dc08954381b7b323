//! Threadsafe functions: queue work from any thread onto the runtime thread.
//!
//! A [`ThreadsafeFunction`] owns a FIFO of payloads. Producers on any thread
//! push a payload with [`ThreadsafeFunction::call`]; every push schedules one
//! dispatch job for that payload on the runtime loop, which hands it to the
//! dispatcher together with the bound callable and the shared context. A
//! payload that could not be scheduled is deleted and the call fails;
//! everything accepted is delivered exactly once.
//!
//! The function starts with one outstanding reference. [`acquire`] and
//! [`release`] adjust the count; when it reaches zero the function closes,
//! already queued payloads are still delivered, and then the finalizer runs
//! exactly once with the context. If the runtime loop closes first, the
//! function closes with it: waiting producers fail with [`Error::Closing`],
//! queued payloads are delivered from the loop's close hook and the
//! finalizer runs there.
//!
//! [`acquire`]: ThreadsafeFunction::acquire
//! [`release`]: ThreadsafeFunction::release

use crate::runtime::arena::{handles, Handle};
use crate::runtime::conversion::IntoJs;
use crate::runtime::env::Env;
use crate::runtime::error::{Error, Result};
use crate::runtime::finalize;
use crate::runtime::sys::{LoopHandle, RawCallJs, RawEnv, RawFinalize, RawPtr, RawRef, RawValue};
use crate::runtime::value::Value;
use std::collections::VecDeque;
use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};
use tracing::{debug, trace, warn};

/// Whether a call may wait for queue space.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CallMode {
    /// Wait until the queue has room. Fails with [`Error::WouldDeadlock`]
    /// instead of waiting when called on the runtime thread.
    #[default]
    Blocking,
    /// Fail with [`Error::QueueFull`] when the queue has no room.
    NonBlocking,
}

type CallJs = dyn Fn(&Env, Option<Value>, Handle) -> Result<()> + Send + Sync;
type Finalizer<C> = Box<dyn FnOnce(&Env, &C) -> Result<()> + Send>;

/// Arena record carrying the type-erased dispatcher. Its handle is the
/// native `context` of the function.
struct DispatchRecord {
    call_js: Box<CallJs>,
}

struct State {
    queue: VecDeque<Handle>,
    threads: usize,
    closing: bool,
    finalized: bool,
}

struct Shared {
    name: String,
    state: Mutex<State>,
    space: Condvar,
    max_queue_size: usize,
    loop_handle: Arc<dyn LoopHandle>,
    runtime_thread: ThreadId,
    callback: Option<RawRef>,
    call_js: RawCallJs,
    finalize: RawFinalize,
    dispatch: Handle,
    finalizer: Handle,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn has_room(&self, state: &State) -> bool {
        self.max_queue_size == 0 || state.queue.len() < self.max_queue_size
    }

    fn pop_front(&self) -> Option<Handle> {
        self.lock().queue.pop_front()
    }

    /// Deliver `item` unless it already went out with [`Shared::finish`].
    /// Runs on the runtime thread.
    fn dispatch_item(&self, env: &RawEnv, item: Handle) {
        {
            let mut state = self.lock();
            let Some(position) = state.queue.iter().position(|queued| *queued == item) else {
                return;
            };
            state.queue.remove(position);
        }
        self.space.notify_one();
        self.deliver(env, item);
    }

    fn deliver(&self, env: &RawEnv, item: Handle) {
        let callback = self.callback.and_then(|reference| {
            match env.get_reference_value(reference) {
                Ok(value) => Some(value),
                Err(status) => {
                    warn!(name = %self.name, %status, "bound callable is no longer reachable");
                    None
                }
            }
        });
        trace!(name = %self.name, ?item, "dispatching threadsafe call");
        (self.call_js)(env, callback, self.dispatch.into_raw(), item.into_raw());
    }

    /// Deliver anything still queued, then run the finalizer once.
    fn finish(&self, env: &RawEnv) {
        while let Some(item) = self.pop_front() {
            self.space.notify_one();
            self.deliver(env, item);
        }
        if std::mem::replace(&mut self.lock().finalized, true) {
            return;
        }
        debug!(name = %self.name, "finalizing threadsafe function");
        (self.finalize)(env, self.finalizer.into_raw(), self.dispatch.into_raw());
    }

    /// Close hook: the runtime loop is going away.
    fn loop_closed(&self, env: &RawEnv) {
        let was_closing = std::mem::replace(&mut self.lock().closing, true);
        self.space.notify_all();
        if !was_closing {
            debug!(name = %self.name, "runtime loop closed under threadsafe function");
        }
        self.finish(env);
    }
}

/// Native entry point for one queued call: `context` is the dispatch record
/// and `data` the payload, which is consumed here.
fn call_js_trampoline(raw_env: &RawEnv, callback: Option<RawValue>, context: RawPtr, data: RawPtr) {
    let (Some(context), Some(data)) = (Handle::from_raw(context), Handle::from_raw(data)) else {
        warn!("threadsafe call dispatched without context or payload");
        return;
    };
    let record = handles().resolve::<DispatchRecord>(context);
    let env = Env::wrap(raw_env.clone());
    let callback = callback.map(|raw| env.wrap_value(raw));
    if let Err(err) = (record.call_js)(&env, callback, data) {
        env.report_error("threadsafe function dispatcher", &err);
    }
}

/// Queue into the runtime thread, callable from any thread.
///
/// `T` is the payload type delivered to the dispatcher. Clones share the same
/// queue and reference count.
pub struct ThreadsafeFunction<T> {
    shared: Arc<Shared>,
    _payload: PhantomData<fn(T)>,
}

impl<T> Clone for ThreadsafeFunction<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            _payload: PhantomData,
        }
    }
}

impl<T> fmt::Debug for ThreadsafeFunction<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadsafeFunction")
            .field("name", &self.shared.name)
            .field("closing", &self.shared.lock().closing)
            .finish()
    }
}

impl ThreadsafeFunction<()> {
    /// Start building a threadsafe function owning `context`.
    pub fn builder<'env, C>(env: &'env Env, name: &str, context: C) -> ThreadsafeFunctionBuilder<'env, C>
    where
        C: Send + Sync + 'static,
    {
        ThreadsafeFunctionBuilder::new(env, name, context)
    }
}

impl<T: Send + 'static> ThreadsafeFunction<T> {
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Queue `data` for the runtime thread, waiting for room if needed.
    pub fn call(&self, data: T) -> Result<()> {
        self.call_with_mode(data, CallMode::Blocking)
    }

    /// Queue `data`, failing with [`Error::QueueFull`] instead of waiting.
    pub fn try_call(&self, data: T) -> Result<()> {
        self.call_with_mode(data, CallMode::NonBlocking)
    }

    pub fn call_with_mode(&self, data: T, mode: CallMode) -> Result<()> {
        let shared = &self.shared;
        let mut state = shared.lock();
        loop {
            if state.closing {
                return Err(Error::Closing);
            }
            if shared.has_room(&state) {
                break;
            }
            match mode {
                CallMode::NonBlocking => return Err(Error::QueueFull),
                CallMode::Blocking if thread::current().id() == shared.runtime_thread => {
                    return Err(Error::WouldDeadlock)
                }
                CallMode::Blocking => {
                    state = shared
                        .space
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner);
                }
            }
        }

        // Schedule and push under one lock: job order matches queue order and
        // a rejected payload is never queued.
        let item = handles().insert_owned(data);
        let job_shared = shared.clone();
        if let Err(status) = shared
            .loop_handle
            .schedule(Box::new(move |env| job_shared.dispatch_item(env, item)))
        {
            drop(state);
            debug!(name = %shared.name, %status, "runtime loop rejected threadsafe call");
            handles().delete(item);
            return Err(Error::Closing);
        }
        state.queue.push_back(item);
        Ok(())
    }

    /// Add an outstanding reference.
    pub fn acquire(&self) -> Result<()> {
        let mut state = self.shared.lock();
        if state.closing {
            return Err(Error::Closing);
        }
        state.threads += 1;
        Ok(())
    }

    /// Drop an outstanding reference. The last release closes the function.
    pub fn release(&self) -> Result<()> {
        let mut state = self.shared.lock();
        if state.threads == 0 {
            return Err(Error::InvalidState(
                "threadsafe function has no outstanding references",
            ));
        }
        state.threads -= 1;
        if state.threads > 0 || state.finalized {
            return Ok(());
        }
        state.closing = true;
        drop(state);
        self.shared.space.notify_all();

        debug!(name = %self.shared.name, "threadsafe function closing");
        let shared = self.shared.clone();
        if let Err(status) = self
            .shared
            .loop_handle
            .schedule(Box::new(move |env| shared.finish(env)))
        {
            warn!(
                name = %self.shared.name,
                %status,
                "runtime loop closed before the threadsafe function could be finalized"
            );
        }
        Ok(())
    }

    /// Whether calls are still accepted.
    pub fn is_valid(&self) -> bool {
        !self.shared.lock().closing
    }

    /// Payloads queued but not yet dispatched.
    pub fn pending(&self) -> usize {
        self.shared.lock().queue.len()
    }
}

/// Configuration for a new [`ThreadsafeFunction`].
pub struct ThreadsafeFunctionBuilder<'env, C> {
    env: &'env Env,
    name: String,
    context: C,
    callback: Option<Value>,
    max_queue_size: usize,
    finalizer: Option<Finalizer<C>>,
}

impl<'env, C: Send + Sync + 'static> ThreadsafeFunctionBuilder<'env, C> {
    pub fn new(env: &'env Env, name: &str, context: C) -> Self {
        Self {
            env,
            name: name.to_string(),
            context,
            callback: None,
            max_queue_size: 0,
            finalizer: None,
        }
    }

    /// Callable handed to the dispatcher on every call.
    pub fn callback(mut self, callback: &Value) -> Self {
        self.callback = Some(callback.clone());
        self
    }

    /// Queue capacity; 0 means unbounded.
    pub fn max_queue_size(mut self, size: usize) -> Self {
        self.max_queue_size = size;
        self
    }

    /// Runs once on the runtime thread after the last release.
    pub fn finalizer<F>(mut self, finalizer: F) -> Self
    where
        F: FnOnce(&Env, &C) -> Result<()> + Send + 'static,
    {
        self.finalizer = Some(Box::new(finalizer));
        self
    }

    /// Build with a dispatcher receiving the bound callable, the context and
    /// one payload per call.
    pub fn build<T, D>(self, dispatcher: D) -> Result<ThreadsafeFunction<T>>
    where
        T: Send + 'static,
        D: Fn(&Env, Option<Value>, &C, T) -> Result<()> + Send + Sync + 'static,
    {
        let env = self.env;
        let loop_handle = env.raw().loop_handle()?;
        let callback = match &self.callback {
            Some(value) => Some(env.raw().create_reference(value.raw(), 1)?),
            None => None,
        };

        let context = Arc::new(self.context);
        let dispatch_context = context.clone();
        let dispatch = handles().insert(DispatchRecord {
            call_js: Box::new(move |env, callback, item| {
                let data: T = handles().take_owned(item);
                dispatcher(env, callback, &dispatch_context, data)
            }),
        });

        let user_finalizer = self.finalizer;
        let finalizer = finalize::wrap(context, move |env, context: Arc<C>, _hint| {
            if let Some(reference) = callback {
                if let Err(status) = env.raw().delete_reference(reference) {
                    warn!(%status, "failed to drop the bound callable");
                }
            }
            match user_finalizer {
                Some(user_finalizer) => user_finalizer(env, &context),
                None => Ok(()),
            }
        });

        let shared = Arc::new(Shared {
            name: self.name,
            state: Mutex::new(State {
                queue: VecDeque::new(),
                threads: 1,
                closing: false,
                finalized: false,
            }),
            space: Condvar::new(),
            max_queue_size: self.max_queue_size,
            loop_handle,
            runtime_thread: thread::current().id(),
            callback,
            call_js: call_js_trampoline,
            finalize: finalize::call_wrapped_finalizer,
            dispatch,
            finalizer,
        });

        let hook_shared = Arc::downgrade(&shared);
        if let Err(status) = shared.loop_handle.on_close(Box::new(move |env| {
            if let Some(shared) = hook_shared.upgrade() {
                shared.loop_closed(env);
            }
        }))
        {
            handles().delete(dispatch);
            handles().delete(finalizer);
            if let Some(reference) = callback {
                env.raw().delete_reference(reference)?;
            }
            return Err(status.into());
        }

        debug!(name = %shared.name, max_queue_size = shared.max_queue_size, "threadsafe function created");
        Ok(ThreadsafeFunction {
            shared,
            _payload: PhantomData,
        })
    }

    /// Build with the default dispatcher: convert the payload and call the
    /// bound callable with it.
    pub fn build_default<T>(self) -> Result<ThreadsafeFunction<T>>
    where
        T: IntoJs + Send + 'static,
    {
        self.build(call_bound_callable::<T, C>)
    }
}

fn call_bound_callable<T: IntoJs, C>(env: &Env, callback: Option<Value>, _context: &C, data: T) -> Result<()> {
    let callback = callback.ok_or(Error::InvalidState(
        "threadsafe function has no callable bound",
    ))?;
    let function = callback.as_function()?;
    let argument = env.value_of(data)?;
    function.call(&env.null()?, &[argument])?;
    Ok(())
}
