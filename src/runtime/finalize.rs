//! One fixed native finalizer entry point for any number of typed finalizers.
//!
//! [`wrap`] parks a finalize callback together with its data in the handle
//! arena and returns the handle to pass as the native `finalize_data`.
//! When the runtime later calls [`call_wrapped_finalizer`] with
//! `(finalize_data, finalize_hint)`, both are resolved as handles, the typed
//! callback runs, and both handles are deleted whether or not it failed.
//!
//! If the runtime never calls the finalizer (for example because the loop is
//! torn down first) the entries leak. Nothing on this side can detect that.

use crate::runtime::arena::{handles, Entry, Handle};
use crate::runtime::env::Env;
use crate::runtime::error::Result;
use crate::runtime::sys::{RawEnv, RawPtr};
use std::any::Any;
use std::sync::{Arc, Mutex, PoisonError};

type FinalizeCallback = Box<dyn FnOnce(&Env, Option<Entry>) -> Result<()> + Send>;

/// Arena record behind a wrapped finalizer.
struct FinalizeRecord {
    data: Entry,
    callback: Mutex<Option<FinalizeCallback>>,
}

/// Package `callback` and `data` into one arena entry.
///
/// The returned handle is meant for the `data` slot of a native finalizer
/// registration whose entry point is [`call_wrapped_finalizer`]. The callback
/// receives the resolved hint entry, if a hint handle was registered.
pub fn wrap<D, F>(data: Arc<D>, callback: F) -> Handle
where
    D: Any + Send + Sync,
    F: FnOnce(&Env, Arc<D>, Option<Entry>) -> Result<()> + Send + 'static,
{
    let captured = data.clone();
    handles().insert(FinalizeRecord {
        data,
        callback: Mutex::new(Some(Box::new(move |env, hint| {
            callback(env, captured, hint)
        }))),
    })
}

/// Data attached to a wrapped finalizer, if `handle` is one and holds a `D`.
pub fn data_of<D: Any + Send + Sync>(handle: Handle) -> Option<Arc<D>> {
    let record = handles().try_resolve::<FinalizeRecord>(handle)?;
    record.data.clone().downcast::<D>().ok()
}

/// The fixed native finalizer entry point.
pub fn call_wrapped_finalizer(env: &RawEnv, data: RawPtr, hint: RawPtr) {
    let env = Env::wrap(env.clone());
    let data = Handle::from_raw(data);
    let hint = Handle::from_raw(hint);

    let record = data.map(|handle| handles().resolve::<FinalizeRecord>(handle));
    let hint_entry = hint.map(|handle| handles().resolve_entry(handle));

    if let Some(record) = record {
        let callback = record
            .callback
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(callback) = callback {
            if let Err(err) = callback(&env, hint_entry) {
                env.report_error("finalizer", &err);
            }
        }
    }

    if let Some(handle) = data {
        handles().delete(handle);
    }
    if let Some(handle) = hint {
        handles().delete(handle);
    }
}
