//! Process-wide handle arena.
//!
//! Native-side data that has to travel through an untyped pointer (callback
//! data, finalizer records, queued payloads) is parked here and referred to by
//! an opaque [`Handle`]. The arena keeps a strong reference for as long as the
//! handle lives, so a closure stays alive while only its token exists on the
//! other side of the boundary.
//!
//! A handle is valid from [`HandleArena::insert`] until exactly one
//! [`HandleArena::delete`] (or [`HandleArena::take_owned`]). Using a handle
//! after that is a programming error and panics. Token values are never
//! reused.

use crate::runtime::sys::RawPtr;
use once_cell::sync::Lazy;
use std::any::{type_name, Any};
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Shared value stored behind a handle.
pub type Entry = Arc<dyn Any + Send + Sync>;

static HANDLES: Lazy<HandleArena> = Lazy::new(HandleArena::new);

/// The arena every native entry point resolves its data from.
pub fn handles() -> &'static HandleArena {
    &HANDLES
}

/// Opaque token for one arena entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Handle(NonZeroUsize);

impl Handle {
    /// Pointer-sized form passed through the native boundary.
    pub fn into_raw(self) -> RawPtr {
        self.0.get() as RawPtr
    }

    /// Recover a handle from a pointer produced by [`Handle::into_raw`].
    /// A null pointer means "no handle".
    pub fn from_raw(ptr: RawPtr) -> Option<Handle> {
        NonZeroUsize::new(ptr as usize).map(Handle)
    }
}

/// Single-use payload slot; see [`HandleArena::insert_owned`].
struct Owned<T>(Mutex<Option<T>>);

pub struct HandleArena {
    slots: Mutex<HashMap<Handle, Entry>>,
    next: AtomicUsize,
}

impl HandleArena {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            next: AtomicUsize::new(1),
        }
    }

    pub fn insert<T: Any + Send + Sync>(&self, value: T) -> Handle {
        self.insert_entry(Arc::new(value))
    }

    pub fn insert_entry(&self, entry: Entry) -> Handle {
        let handle = loop {
            // Zero is skipped so that a handle never turns into a null pointer.
            if let Some(id) = NonZeroUsize::new(self.next.fetch_add(1, Ordering::Relaxed)) {
                break Handle(id);
            }
        };
        self.lock().insert(handle, entry);
        handle
    }

    /// Park a value that will be consumed exactly once by [`HandleArena::take_owned`].
    ///
    /// Unlike [`HandleArena::insert`] the value only has to be `Send`.
    pub fn insert_owned<T: Send + 'static>(&self, value: T) -> Handle {
        self.insert(Owned(Mutex::new(Some(value))))
    }

    /// Look up the value behind `handle`.
    ///
    /// # Panics
    ///
    /// If the handle was already deleted.
    pub fn resolve_entry(&self, handle: Handle) -> Entry {
        match self.lock().get(&handle) {
            Some(entry) => entry.clone(),
            None => panic!("handle arena: {handle:?} resolved after deletion"),
        }
    }

    /// Typed lookup.
    ///
    /// # Panics
    ///
    /// If the handle was already deleted or holds a different type.
    pub fn resolve<T: Any + Send + Sync>(&self, handle: Handle) -> Arc<T> {
        match self.resolve_entry(handle).downcast::<T>() {
            Ok(value) => value,
            Err(_) => panic!("handle arena: {handle:?} does not hold a {}", type_name::<T>()),
        }
    }

    /// Typed lookup that reports a missing or mistyped handle as `None`.
    pub fn try_resolve<T: Any + Send + Sync>(&self, handle: Handle) -> Option<Arc<T>> {
        let entry = self.lock().get(&handle).cloned()?;
        entry.downcast::<T>().ok()
    }

    /// Release the arena's reference.
    ///
    /// # Panics
    ///
    /// On a second delete of the same handle.
    pub fn delete(&self, handle: Handle) {
        if self.lock().remove(&handle).is_none() {
            panic!("handle arena: {handle:?} deleted twice");
        }
    }

    /// Resolve and delete a payload created by [`HandleArena::insert_owned`].
    ///
    /// # Panics
    ///
    /// If the handle was already deleted or holds a different type.
    pub fn take_owned<T: Send + 'static>(&self, handle: Handle) -> T {
        let entry = match self.lock().remove(&handle) {
            Some(entry) => entry,
            None => panic!("handle arena: {handle:?} taken after deletion"),
        };
        let owned = match entry.downcast::<Owned<T>>() {
            Ok(owned) => owned,
            Err(_) => panic!("handle arena: {handle:?} does not hold a {}", type_name::<T>()),
        };
        let value = owned.0.lock().unwrap_or_else(PoisonError::into_inner).take();
        match value {
            Some(value) => value,
            None => panic!("handle arena: {handle:?} payload already taken"),
        }
    }

    pub fn contains(&self, handle: Handle) -> bool {
        self.lock().contains_key(&handle)
    }

    /// Number of live handles.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Handle, Entry>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for HandleArena {
    fn default() -> Self {
        Self::new()
    }
}
