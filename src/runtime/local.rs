//! In-process runtime host.
//!
//! `LocalHost` implements [`NativeApi`] over a small value heap so the bridge
//! can run without an external engine: embedders use it as a scriptable
//! object model and the test suite uses it to drive every native entry point.
//! It is single-threaded like any runtime; the only cross-thread piece is its
//! job queue, reachable through [`NativeApi::loop_handle`].
//!
//! Values are never collected. Finalizers registered with `add_finalizer` and
//! the instance data finalizer run at [`LocalHost::teardown`].

use crate::runtime::env::Env;
use crate::runtime::error::Result;
use crate::runtime::js_value::JSValue;
use crate::runtime::sys::{
    Job, LoopHandle, NativeApi, RawCallInfo, RawCallback, RawCallbackInfo, RawDeferred, RawEnv,
    RawFinalize, RawPtr, RawRef, RawValue, Status, ValueType,
};
use crate::runtime::value::Promise;
use indexmap::IndexMap;
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::ptr;
use std::rc::{Rc, Weak};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, error};

const UNDEFINED: RawValue = RawValue(0);
const NULL: RawValue = RawValue(1);
const FALSE: RawValue = RawValue(2);
const TRUE: RawValue = RawValue(3);

/// Settlement state of a promise, with the settled value snapshotted.
#[derive(Clone, Debug, PartialEq)]
pub enum PromiseState {
    Pending,
    Fulfilled(JSValue),
    Rejected(JSValue),
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
enum PropKey {
    Name(Rc<str>),
    Symbol(u64),
}

impl PropKey {
    fn name(name: &str) -> Self {
        PropKey::Name(Rc::from(name))
    }
}

#[derive(Clone, Copy)]
enum PromiseSlot {
    Pending,
    Fulfilled(RawValue),
    Rejected(RawValue),
}

enum ObjectKind {
    Plain,
    Array(Vec<RawValue>),
    Buffer(Vec<u8>),
    Error,
    Promise(PromiseSlot),
    Function {
        name: String,
        callback: RawCallback,
        data: RawPtr,
    },
}

struct ObjectData {
    kind: ObjectKind,
    props: IndexMap<PropKey, RawValue>,
}

enum HeapValue {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Symbol(Option<String>),
    Object(ObjectData),
}

struct Finalizer {
    data: RawPtr,
    finalize: RawFinalize,
    hint: RawPtr,
}

struct InstanceData {
    data: RawPtr,
    finalize: Option<RawFinalize>,
    hint: RawPtr,
}

struct Reference {
    value: RawValue,
    count: u32,
}

struct QueueState {
    jobs: VecDeque<Job>,
    on_close: Vec<Job>,
    closed: bool,
}

type Notifier = Box<dyn Fn() + Send + Sync>;

/// FIFO of jobs scheduled onto the runtime thread.
pub struct JobQueue {
    state: Mutex<QueueState>,
    notifier: Mutex<Option<Notifier>>,
}

impl JobQueue {
    fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                jobs: VecDeque::new(),
                on_close: Vec::new(),
                closed: false,
            }),
            notifier: Mutex::new(None),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pop(&self) -> Option<Job> {
        self.lock().jobs.pop_front()
    }

    pub fn len(&self) -> usize {
        self.lock().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Refuse further jobs. Returns the jobs still queued, which will never
    /// run, and the close hooks.
    fn close(&self) -> (Vec<Job>, Vec<Job>) {
        let mut state = self.lock();
        state.closed = true;
        (state.jobs.drain(..).collect(), std::mem::take(&mut state.on_close))
    }

    fn set_notifier(&self, notifier: Notifier) {
        *self.notifier.lock().unwrap_or_else(PoisonError::into_inner) = Some(notifier);
    }
}

impl LoopHandle for JobQueue {
    fn schedule(&self, job: Job) -> std::result::Result<(), Status> {
        {
            let mut state = self.lock();
            if state.closed {
                return Err(Status::Closing);
            }
            state.jobs.push_back(job);
        }
        if let Some(notify) = self.notifier.lock().unwrap_or_else(PoisonError::into_inner).as_ref() {
            notify();
        }
        Ok(())
    }

    fn on_close(&self, job: Job) -> std::result::Result<(), Status> {
        let mut state = self.lock();
        if state.closed {
            return Err(Status::Closing);
        }
        state.on_close.push(job);
        Ok(())
    }
}

/// The heap and bookkeeping behind a [`LocalHost`].
pub struct HostCore {
    this: Weak<HostCore>,
    heap: RefCell<Vec<HeapValue>>,
    global: RawValue,
    exception: Cell<Option<RawValue>>,
    frames: RefCell<HashMap<u64, RawCallInfo>>,
    next_frame: Cell<u64>,
    references: RefCell<HashMap<u64, Reference>>,
    next_reference: Cell<u64>,
    deferreds: RefCell<HashMap<u64, RawValue>>,
    next_deferred: Cell<u64>,
    finalizers: RefCell<Vec<Finalizer>>,
    instance: RefCell<Option<InstanceData>>,
    jobs: Arc<JobQueue>,
}

type ApiResult<T> = std::result::Result<T, Status>;

impl HostCore {
    fn new(this: Weak<HostCore>) -> Self {
        let mut heap = vec![
            HeapValue::Undefined,
            HeapValue::Null,
            HeapValue::Bool(false),
            HeapValue::Bool(true),
        ];

        // globalThis.Symbol with the well-known symbols.
        let mut symbols = IndexMap::new();
        for name in ["iterator", "asyncIterator", "hasInstance", "toPrimitive", "toStringTag"] {
            let raw = RawValue(heap.len() as u64);
            heap.push(HeapValue::Symbol(Some(format!("Symbol.{name}"))));
            symbols.insert(PropKey::name(name), raw);
        }
        let symbol = RawValue(heap.len() as u64);
        heap.push(HeapValue::Object(ObjectData {
            kind: ObjectKind::Plain,
            props: symbols,
        }));
        let global = RawValue(heap.len() as u64);
        heap.push(HeapValue::Object(ObjectData {
            kind: ObjectKind::Plain,
            props: IndexMap::from([(PropKey::name("Symbol"), symbol)]),
        }));

        Self {
            this,
            heap: RefCell::new(heap),
            global,
            exception: Cell::new(None),
            frames: RefCell::new(HashMap::new()),
            next_frame: Cell::new(1),
            references: RefCell::new(HashMap::new()),
            next_reference: Cell::new(1),
            deferreds: RefCell::new(HashMap::new()),
            next_deferred: Cell::new(1),
            finalizers: RefCell::new(Vec::new()),
            instance: RefCell::new(None),
            jobs: Arc::new(JobQueue::new()),
        }
    }

    fn raw_env(&self) -> ApiResult<RawEnv> {
        let core: Rc<HostCore> = self.this.upgrade().ok_or(Status::GenericFailure)?;
        Ok(core)
    }

    fn alloc(&self, value: HeapValue) -> RawValue {
        let mut heap = self.heap.borrow_mut();
        heap.push(value);
        RawValue(heap.len() as u64 - 1)
    }

    fn alloc_object(&self, kind: ObjectKind) -> RawValue {
        self.alloc(HeapValue::Object(ObjectData {
            kind,
            props: IndexMap::new(),
        }))
    }

    fn next_id(counter: &Cell<u64>) -> u64 {
        let id = counter.get();
        counter.set(id + 1);
        id
    }

    fn read<R>(&self, value: RawValue, f: impl FnOnce(&HeapValue) -> ApiResult<R>) -> ApiResult<R> {
        let heap = self.heap.borrow();
        let slot = heap.get(value.0 as usize).ok_or(Status::InvalidArg)?;
        f(slot)
    }

    fn read_object<R>(&self, value: RawValue, f: impl FnOnce(&ObjectData) -> ApiResult<R>) -> ApiResult<R> {
        self.read(value, |slot| match slot {
            HeapValue::Object(data) => f(data),
            _ => Err(Status::ObjectExpected),
        })
    }

    fn write_object<R>(&self, value: RawValue, f: impl FnOnce(&mut ObjectData) -> ApiResult<R>) -> ApiResult<R> {
        let mut heap = self.heap.borrow_mut();
        match heap.get_mut(value.0 as usize) {
            Some(HeapValue::Object(data)) => f(data),
            Some(_) => Err(Status::ObjectExpected),
            None => Err(Status::InvalidArg),
        }
    }

    fn prop_key(&self, key: RawValue) -> ApiResult<PropKey> {
        self.read(key, |slot| match slot {
            HeapValue::String(name) => Ok(PropKey::name(name)),
            HeapValue::Symbol(_) => Ok(PropKey::Symbol(key.0)),
            HeapValue::Number(n) => Ok(PropKey::name(&number_to_string(*n))),
            _ => Err(Status::NameExpected),
        })
    }

    fn throw_message(&self, message: &str) -> Status {
        let message = self.alloc(HeapValue::String(message.to_string()));
        if let Ok(error) = self.create_error(None, message) {
            if self.exception.get().is_none() {
                self.exception.set(Some(error));
            }
        }
        Status::PendingException
    }

    /// `String(value)` as a native string.
    fn display(&self, value: RawValue) -> ApiResult<String> {
        enum Next {
            Done(String),
            Join(Vec<RawValue>),
            Error(Option<RawValue>),
        }
        let next = self.read(value, |slot| {
            Ok(match slot {
                HeapValue::Undefined => Next::Done("undefined".to_string()),
                HeapValue::Null => Next::Done("null".to_string()),
                HeapValue::Bool(b) => Next::Done(b.to_string()),
                HeapValue::Number(n) => Next::Done(number_to_string(*n)),
                HeapValue::String(s) => Next::Done(s.clone()),
                HeapValue::Symbol(_) => return Err(Status::StringExpected),
                HeapValue::Object(data) => match &data.kind {
                    ObjectKind::Plain => Next::Done("[object Object]".to_string()),
                    ObjectKind::Array(items) => Next::Join(items.clone()),
                    ObjectKind::Buffer(bytes) => {
                        Next::Done(String::from_utf8_lossy(bytes).into_owned())
                    }
                    ObjectKind::Error => Next::Error(data.props.get(&PropKey::name("message")).copied()),
                    ObjectKind::Promise(_) => Next::Done("[object Promise]".to_string()),
                    ObjectKind::Function { name, .. } => {
                        Next::Done(format!("function {name}() {{ [native code] }}"))
                    }
                },
            })
        })?;

        match next {
            Next::Done(s) => Ok(s),
            Next::Join(items) => {
                let parts = items
                    .into_iter()
                    .map(|item| match item {
                        UNDEFINED | NULL => Ok(String::new()),
                        item => self.display(item),
                    })
                    .collect::<ApiResult<Vec<_>>>()?;
                Ok(parts.join(","))
            }
            Next::Error(Some(message)) => Ok(format!("Error: {}", self.display(message)?)),
            Next::Error(None) => Ok("Error".to_string()),
        }
    }

    /// Message of an escaped exception, for logs.
    fn describe_exception(&self, exception: RawValue) -> String {
        let message = self
            .read_object(exception, |data| match data.kind {
                ObjectKind::Error => Ok(data.props.get(&PropKey::name("message")).copied()),
                _ => Ok(None),
            })
            .ok()
            .flatten();
        self.display(message.unwrap_or(exception))
            .unwrap_or_else(|status| format!("<unprintable exception: {status}>"))
    }

    /// Indexed access on arrays and buffers: `Some` when the key addresses an
    /// element or `length`.
    fn indexed(kind: &ObjectKind, key: &PropKey) -> Option<Indexed> {
        let PropKey::Name(name) = key else {
            return None;
        };
        let len = match kind {
            ObjectKind::Array(items) => items.len(),
            ObjectKind::Buffer(bytes) => bytes.len(),
            _ => return None,
        };
        if &**name == "length" {
            return Some(Indexed::Length(len));
        }
        let index = name.parse::<usize>().ok()?;
        Some(match kind {
            ObjectKind::Array(items) => items.get(index).map_or(Indexed::Missing, |v| Indexed::Value(*v)),
            ObjectKind::Buffer(bytes) => bytes.get(index).map_or(Indexed::Missing, |b| Indexed::Byte(*b)),
            _ => Indexed::Missing,
        })
    }
}

enum Indexed {
    Length(usize),
    Value(RawValue),
    Byte(u8),
    Missing,
}

fn number_to_string(n: f64) -> String {
    if n.is_nan() {
        "NaN".to_string()
    } else if n.is_infinite() {
        if n > 0.0 { "Infinity" } else { "-Infinity" }.to_string()
    } else if n == 0.0 {
        "0".to_string()
    } else {
        n.to_string()
    }
}

impl NativeApi for HostCore {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn get_undefined(&self) -> ApiResult<RawValue> {
        Ok(UNDEFINED)
    }

    fn get_null(&self) -> ApiResult<RawValue> {
        Ok(NULL)
    }

    fn get_global(&self) -> ApiResult<RawValue> {
        Ok(self.global)
    }

    fn get_boolean(&self, value: bool) -> ApiResult<RawValue> {
        Ok(if value { TRUE } else { FALSE })
    }

    fn create_double(&self, value: f64) -> ApiResult<RawValue> {
        Ok(self.alloc(HeapValue::Number(value)))
    }

    fn create_string_utf8(&self, value: &str) -> ApiResult<RawValue> {
        Ok(self.alloc(HeapValue::String(value.to_string())))
    }

    fn create_symbol(&self, description: Option<RawValue>) -> ApiResult<RawValue> {
        let description = match description {
            Some(description) => Some(self.get_value_string_utf8(description)?),
            None => None,
        };
        Ok(self.alloc(HeapValue::Symbol(description)))
    }

    fn create_object(&self) -> ApiResult<RawValue> {
        Ok(self.alloc_object(ObjectKind::Plain))
    }

    fn create_array_with_length(&self, length: usize) -> ApiResult<RawValue> {
        Ok(self.alloc_object(ObjectKind::Array(vec![UNDEFINED; length])))
    }

    fn create_buffer_copy(&self, data: &[u8]) -> ApiResult<RawValue> {
        Ok(self.alloc_object(ObjectKind::Buffer(data.to_vec())))
    }

    fn create_error(&self, code: Option<RawValue>, message: RawValue) -> ApiResult<RawValue> {
        self.read(message, |slot| match slot {
            HeapValue::String(_) => Ok(()),
            _ => Err(Status::StringExpected),
        })?;
        if let Some(code) = code {
            self.read(code, |slot| match slot {
                HeapValue::String(_) => Ok(()),
                _ => Err(Status::StringExpected),
            })?;
        }

        let mut props = IndexMap::new();
        props.insert(PropKey::name("message"), message);
        if let Some(code) = code {
            props.insert(PropKey::name("code"), code);
        }
        Ok(self.alloc(HeapValue::Object(ObjectData {
            kind: ObjectKind::Error,
            props,
        })))
    }

    fn type_of(&self, value: RawValue) -> ApiResult<ValueType> {
        self.read(value, |slot| {
            Ok(match slot {
                HeapValue::Undefined => ValueType::Undefined,
                HeapValue::Null => ValueType::Null,
                HeapValue::Bool(_) => ValueType::Boolean,
                HeapValue::Number(_) => ValueType::Number,
                HeapValue::String(_) => ValueType::String,
                HeapValue::Symbol(_) => ValueType::Symbol,
                HeapValue::Object(ObjectData {
                    kind: ObjectKind::Function { .. },
                    ..
                }) => ValueType::Function,
                HeapValue::Object(_) => ValueType::Object,
            })
        })
    }

    fn is_array(&self, value: RawValue) -> ApiResult<bool> {
        self.read(value, |slot| {
            Ok(matches!(slot, HeapValue::Object(ObjectData { kind: ObjectKind::Array(_), .. })))
        })
    }

    fn is_buffer(&self, value: RawValue) -> ApiResult<bool> {
        self.read(value, |slot| {
            Ok(matches!(slot, HeapValue::Object(ObjectData { kind: ObjectKind::Buffer(_), .. })))
        })
    }

    fn is_error(&self, value: RawValue) -> ApiResult<bool> {
        self.read(value, |slot| {
            Ok(matches!(slot, HeapValue::Object(ObjectData { kind: ObjectKind::Error, .. })))
        })
    }

    fn is_promise(&self, value: RawValue) -> ApiResult<bool> {
        self.read(value, |slot| {
            Ok(matches!(slot, HeapValue::Object(ObjectData { kind: ObjectKind::Promise(_), .. })))
        })
    }

    fn get_value_bool(&self, value: RawValue) -> ApiResult<bool> {
        self.read(value, |slot| match slot {
            HeapValue::Bool(b) => Ok(*b),
            _ => Err(Status::BooleanExpected),
        })
    }

    fn get_value_double(&self, value: RawValue) -> ApiResult<f64> {
        self.read(value, |slot| match slot {
            HeapValue::Number(n) => Ok(*n),
            _ => Err(Status::NumberExpected),
        })
    }

    fn get_value_int64(&self, value: RawValue) -> ApiResult<i64> {
        let n = self.get_value_double(value)?;
        Ok(if n.is_finite() { n as i64 } else { 0 })
    }

    fn get_value_string_utf8(&self, value: RawValue) -> ApiResult<String> {
        self.read(value, |slot| match slot {
            HeapValue::String(s) => Ok(s.clone()),
            _ => Err(Status::StringExpected),
        })
    }

    fn get_buffer_info(&self, value: RawValue) -> ApiResult<Vec<u8>> {
        self.read_object(value, |data| match &data.kind {
            ObjectKind::Buffer(bytes) => Ok(bytes.clone()),
            _ => Err(Status::InvalidArg),
        })
    }

    fn get_array_length(&self, value: RawValue) -> ApiResult<u32> {
        self.read(value, |slot| match slot {
            HeapValue::Object(ObjectData {
                kind: ObjectKind::Array(items),
                ..
            }) => u32::try_from(items.len()).map_err(|_| Status::GenericFailure),
            _ => Err(Status::ArrayExpected),
        })
    }

    fn coerce_to_string(&self, value: RawValue) -> ApiResult<RawValue> {
        match self.display(value) {
            Ok(s) => self.create_string_utf8(&s),
            Err(Status::StringExpected) => {
                Err(self.throw_message("Cannot convert a Symbol value to a string"))
            }
            Err(status) => Err(status),
        }
    }

    fn strict_equals(&self, lhs: RawValue, rhs: RawValue) -> ApiResult<bool> {
        if lhs == rhs {
            // NaN is the one value not equal to itself.
            return self.read(lhs, |slot| Ok(!matches!(slot, HeapValue::Number(n) if n.is_nan())));
        }
        let heap = self.heap.borrow();
        let left = heap.get(lhs.0 as usize).ok_or(Status::InvalidArg)?;
        let right = heap.get(rhs.0 as usize).ok_or(Status::InvalidArg)?;
        Ok(match (left, right) {
            (HeapValue::Undefined, HeapValue::Undefined) | (HeapValue::Null, HeapValue::Null) => true,
            (HeapValue::Bool(a), HeapValue::Bool(b)) => a == b,
            (HeapValue::Number(a), HeapValue::Number(b)) => a == b,
            (HeapValue::String(a), HeapValue::String(b)) => a == b,
            _ => false,
        })
    }

    fn get_property_names(&self, object: RawValue) -> ApiResult<RawValue> {
        let names: Vec<String> = self.read_object(object, |data| {
            let indices = match &data.kind {
                ObjectKind::Array(items) => items.len(),
                ObjectKind::Buffer(bytes) => bytes.len(),
                _ => 0,
            };
            let props = data.props.keys().filter_map(|key| match key {
                PropKey::Name(name) => Some(name.to_string()),
                PropKey::Symbol(_) => None,
            });
            Ok((0..indices).map(|i| i.to_string()).chain(props).collect())
        })?;

        let items = names
            .iter()
            .map(|name| self.create_string_utf8(name))
            .collect::<ApiResult<Vec<_>>>()?;
        Ok(self.alloc_object(ObjectKind::Array(items)))
    }

    fn set_property(&self, object: RawValue, key: RawValue, value: RawValue) -> ApiResult<()> {
        let key = self.prop_key(key)?;
        if let PropKey::Name(name) = &key {
            if let Ok(index) = name.parse::<u32>() {
                if self.is_array(object)? {
                    return self.set_element(object, index, value);
                }
            }
        }
        self.write_object(object, |data| {
            if Self::indexed(&data.kind, &key).is_some() {
                return Err(Status::InvalidArg);
            }
            data.props.insert(key, value);
            Ok(())
        })
    }

    fn get_property(&self, object: RawValue, key: RawValue) -> ApiResult<RawValue> {
        let key = self.prop_key(key)?;
        let found = self.read_object(object, |data| {
            Ok(match Self::indexed(&data.kind, &key) {
                Some(indexed) => indexed,
                None => data.props.get(&key).map_or(Indexed::Missing, |v| Indexed::Value(*v)),
            })
        })?;
        match found {
            Indexed::Value(value) => Ok(value),
            Indexed::Length(len) => self.create_double(len as f64),
            Indexed::Byte(byte) => self.create_double(f64::from(byte)),
            Indexed::Missing => Ok(UNDEFINED),
        }
    }

    fn has_property(&self, object: RawValue, key: RawValue) -> ApiResult<bool> {
        self.has_own_property(object, key)
    }

    fn has_own_property(&self, object: RawValue, key: RawValue) -> ApiResult<bool> {
        let key = self.prop_key(key)?;
        self.read_object(object, |data| {
            Ok(match Self::indexed(&data.kind, &key) {
                Some(Indexed::Missing) => false,
                Some(_) => true,
                None => data.props.contains_key(&key),
            })
        })
    }

    fn set_element(&self, array: RawValue, index: u32, value: RawValue) -> ApiResult<()> {
        self.write_object(array, |data| {
            match &mut data.kind {
                ObjectKind::Array(items) => {
                    let index = index as usize;
                    if index >= items.len() {
                        items.resize(index + 1, UNDEFINED);
                    }
                    items[index] = value;
                }
                ObjectKind::Buffer(_) => return Err(Status::InvalidArg),
                _ => {
                    data.props.insert(PropKey::name(&index.to_string()), value);
                }
            }
            Ok(())
        })
    }

    fn get_element(&self, array: RawValue, index: u32) -> ApiResult<RawValue> {
        let key = self.create_double(f64::from(index))?;
        self.get_property(array, key)
    }

    fn throw(&self, error: RawValue) -> ApiResult<()> {
        self.read(error, |_| Ok(()))?;
        if self.exception.get().is_some() {
            return Err(Status::PendingException);
        }
        self.exception.set(Some(error));
        Ok(())
    }

    fn is_exception_pending(&self) -> ApiResult<bool> {
        Ok(self.exception.get().is_some())
    }

    fn get_and_clear_last_exception(&self) -> ApiResult<RawValue> {
        Ok(self.exception.take().unwrap_or(UNDEFINED))
    }

    fn create_function(&self, name: &str, callback: RawCallback, data: RawPtr) -> ApiResult<RawValue> {
        let name_value = self.create_string_utf8(name)?;
        let function = self.alloc_object(ObjectKind::Function {
            name: name.to_string(),
            callback,
            data,
        });
        self.write_object(function, |object| {
            object.props.insert(PropKey::name("name"), name_value);
            Ok(())
        })?;
        Ok(function)
    }

    fn get_cb_info(&self, info: RawCallbackInfo) -> ApiResult<RawCallInfo> {
        self.frames
            .borrow()
            .get(&info.0)
            .cloned()
            .ok_or(Status::InvalidArg)
    }

    fn call_function(&self, recv: RawValue, func: RawValue, args: &[RawValue]) -> ApiResult<RawValue> {
        if self.exception.get().is_some() {
            return Err(Status::PendingException);
        }
        let (callback, data) = self.read(func, |slot| match slot {
            HeapValue::Object(ObjectData {
                kind: ObjectKind::Function { callback, data, .. },
                ..
            }) => Ok((*callback, *data)),
            _ => Err(Status::FunctionExpected),
        })?;

        let env = self.raw_env()?;
        let frame = Self::next_id(&self.next_frame);
        self.frames.borrow_mut().insert(
            frame,
            RawCallInfo {
                this: recv,
                args: args.to_vec(),
                data,
            },
        );
        let result = callback(&env, RawCallbackInfo(frame));
        self.frames.borrow_mut().remove(&frame);

        if self.exception.get().is_some() {
            return Err(Status::PendingException);
        }
        Ok(result.unwrap_or(UNDEFINED))
    }

    fn add_finalizer(&self, object: RawValue, data: RawPtr, finalize: RawFinalize, hint: RawPtr) -> ApiResult<()> {
        self.read_object(object, |_| Ok(()))?;
        self.finalizers.borrow_mut().push(Finalizer { data, finalize, hint });
        Ok(())
    }

    fn create_reference(&self, value: RawValue, initial_refcount: u32) -> ApiResult<RawRef> {
        self.read(value, |_| Ok(()))?;
        let id = Self::next_id(&self.next_reference);
        self.references.borrow_mut().insert(
            id,
            Reference {
                value,
                count: initial_refcount,
            },
        );
        Ok(RawRef(id))
    }

    fn delete_reference(&self, reference: RawRef) -> ApiResult<()> {
        self.references
            .borrow_mut()
            .remove(&reference.0)
            .map(|_| ())
            .ok_or(Status::InvalidArg)
    }

    fn reference_ref(&self, reference: RawRef) -> ApiResult<u32> {
        let mut references = self.references.borrow_mut();
        let entry = references.get_mut(&reference.0).ok_or(Status::InvalidArg)?;
        entry.count += 1;
        Ok(entry.count)
    }

    fn reference_unref(&self, reference: RawRef) -> ApiResult<u32> {
        let mut references = self.references.borrow_mut();
        let entry = references.get_mut(&reference.0).ok_or(Status::InvalidArg)?;
        if entry.count == 0 {
            return Err(Status::GenericFailure);
        }
        entry.count -= 1;
        Ok(entry.count)
    }

    fn get_reference_value(&self, reference: RawRef) -> ApiResult<RawValue> {
        self.references
            .borrow()
            .get(&reference.0)
            .map(|entry| entry.value)
            .ok_or(Status::InvalidArg)
    }

    fn create_promise(&self) -> ApiResult<(RawDeferred, RawValue)> {
        let promise = self.alloc_object(ObjectKind::Promise(PromiseSlot::Pending));
        let id = Self::next_id(&self.next_deferred);
        self.deferreds.borrow_mut().insert(id, promise);
        Ok((RawDeferred(id), promise))
    }

    fn resolve_deferred(&self, deferred: RawDeferred, value: RawValue) -> ApiResult<()> {
        self.settle(deferred, PromiseSlot::Fulfilled(value))
    }

    fn reject_deferred(&self, deferred: RawDeferred, value: RawValue) -> ApiResult<()> {
        self.settle(deferred, PromiseSlot::Rejected(value))
    }

    fn set_instance_data(&self, data: RawPtr, finalize: Option<RawFinalize>, hint: RawPtr) -> ApiResult<()> {
        *self.instance.borrow_mut() = Some(InstanceData { data, finalize, hint });
        Ok(())
    }

    fn get_instance_data(&self) -> ApiResult<RawPtr> {
        Ok(self
            .instance
            .borrow()
            .as_ref()
            .map_or(ptr::null_mut(), |instance| instance.data))
    }

    fn loop_handle(&self) -> ApiResult<Arc<dyn LoopHandle>> {
        Ok(self.jobs.clone())
    }
}

impl HostCore {
    fn settle(&self, deferred: RawDeferred, slot: PromiseSlot) -> ApiResult<()> {
        let promise = self
            .deferreds
            .borrow_mut()
            .remove(&deferred.0)
            .ok_or(Status::InvalidArg)?;
        self.write_object(promise, |data| {
            data.kind = ObjectKind::Promise(slot);
            Ok(())
        })
    }
}

/// Owner of an in-process runtime.
///
/// Dropping the host tears it down.
pub struct LocalHost {
    core: Rc<HostCore>,
    torn_down: Cell<bool>,
    uncaught: RefCell<Vec<String>>,
}

impl LocalHost {
    pub fn new() -> Self {
        Self {
            core: Rc::new_cyclic(|this| HostCore::new(this.clone())),
            torn_down: Cell::new(false),
            uncaught: RefCell::new(Vec::new()),
        }
    }

    pub fn env(&self) -> Env {
        let raw: RawEnv = self.core.clone();
        Env::wrap(raw)
    }

    /// Run scheduled jobs until the queue is empty, including jobs scheduled
    /// by the jobs themselves. Returns how many ran.
    ///
    /// An exception a job leaves pending is cleared and recorded; see
    /// [`LocalHost::take_uncaught_exceptions`].
    pub fn run_pending_jobs(&self) -> usize {
        let env: RawEnv = self.core.clone();
        let mut ran = 0;
        while let Some(job) = self.core.jobs.pop() {
            job(&env);
            ran += 1;
            self.collect_exception("job");
        }
        ran
    }

    pub fn pending_jobs(&self) -> usize {
        self.core.jobs.len()
    }

    /// Refuse any further scheduled work. Queued jobs are dropped, then the
    /// close hooks run.
    pub fn close_loop(&self) {
        let (dropped, hooks) = self.core.jobs.close();
        if !dropped.is_empty() {
            debug!(dropped = dropped.len(), "dropped queued jobs while closing the loop");
        }
        // Dropped jobs keep their captures alive until the hooks are done.
        let env: RawEnv = self.core.clone();
        for hook in hooks {
            hook(&env);
            self.collect_exception("close hook");
        }
        drop(dropped);
    }

    /// Run `notify` whenever a job is scheduled, from the scheduling thread.
    pub fn set_job_notifier(&self, notify: impl Fn() + Send + Sync + 'static) {
        self.core.jobs.set_notifier(Box::new(notify));
    }

    /// Messages of exceptions that escaped jobs or finalizers, oldest first.
    pub fn take_uncaught_exceptions(&self) -> Vec<String> {
        std::mem::take(&mut *self.uncaught.borrow_mut())
    }

    pub fn promise_state(&self, promise: &Promise) -> Result<PromiseState> {
        let slot = self.core.read_object(promise.raw(), |data| match data.kind {
            ObjectKind::Promise(slot) => Ok(slot),
            _ => Err(Status::InvalidArg),
        })?;
        let env = self.env();
        Ok(match slot {
            PromiseSlot::Pending => PromiseState::Pending,
            PromiseSlot::Fulfilled(value) => PromiseState::Fulfilled(env.wrap_value(value).to_snapshot()?),
            PromiseSlot::Rejected(value) => PromiseState::Rejected(env.wrap_value(value).to_snapshot()?),
        })
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down.get()
    }

    /// Close the loop, then run every registered finalizer and finally the
    /// instance data finalizer. Later calls do nothing.
    pub fn teardown(&self) {
        if self.torn_down.replace(true) {
            return;
        }
        self.close_loop();

        let env: RawEnv = self.core.clone();
        let mut ran = 0;
        loop {
            let batch = std::mem::take(&mut *self.core.finalizers.borrow_mut());
            if batch.is_empty() {
                break;
            }
            for finalizer in batch {
                (finalizer.finalize)(&env, finalizer.data, finalizer.hint);
                ran += 1;
                self.collect_exception("finalizer");
            }
        }

        let instance = self.core.instance.borrow_mut().take();
        if let Some(InstanceData {
            data,
            finalize: Some(finalize),
            hint,
        }) = instance
        {
            finalize(&env, data, hint);
            ran += 1;
            self.collect_exception("instance finalizer");
        }
        debug!(finalizers = ran, "local host torn down");
    }

    pub(crate) fn collect_exception(&self, origin: &str) {
        if let Some(exception) = self.core.exception.take() {
            let message = self.core.describe_exception(exception);
            error!(origin, %message, "uncaught exception");
            self.uncaught.borrow_mut().push(message);
        }
    }
}

impl Default for LocalHost {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for LocalHost {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl fmt::Debug for LocalHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalHost")
            .field("values", &self.core.heap.borrow().len())
            .field("pending_jobs", &self.pending_jobs())
            .field("torn_down", &self.torn_down.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::value::Value;

    #[test]
    fn test_arrays_and_elements() {
        let host = LocalHost::new();
        let env = host.env();

        let array = env.value_of(vec![1, 2, 3]).unwrap();
        assert!(array.is_array().unwrap());
        let object = array.as_object().unwrap();
        assert_eq!(object.get_named("length").unwrap().as_f64().unwrap(), 3.0);
        assert_eq!(object.get_named("1").unwrap().as_f64().unwrap(), 2.0);
        assert_eq!(object.property_names().unwrap(), vec!["0", "1", "2"]);
        assert_eq!(array.to_display_string().unwrap(), "1,2,3");
    }

    #[test]
    fn test_strict_equals() {
        let host = LocalHost::new();
        let env = host.env();

        let a = env.value_of("same").unwrap();
        let b = env.value_of("same").unwrap();
        assert!(a.strict_equals(&b).unwrap());

        let nan = env.value_of(f64::NAN).unwrap();
        assert!(!nan.strict_equals(&nan).unwrap());

        let first = env.new_object().unwrap();
        let second = env.new_object().unwrap();
        assert!(!first.strict_equals(&second).unwrap());
        assert!(first.strict_equals(&first).unwrap());
    }

    #[test]
    fn test_thrown_exception_fails_calls() {
        let host = LocalHost::new();
        let env = host.env();

        let thrower = env
            .new_function("thrower", |_this: Value| -> std::result::Result<(), String> {
                Err("nope".to_string())
            })
            .unwrap();
        let noop = env.new_function("noop", |_this: Value| ()).unwrap();

        assert_eq!(
            thrower.invoke(&[]).unwrap_err(),
            crate::runtime::error::Error::Status(Status::PendingException)
        );
        // Nothing else runs until the exception is handled.
        assert!(noop.invoke(&[]).is_err());
        env.take_exception().unwrap();
        assert!(noop.invoke(&[]).is_ok());
    }

    #[test]
    fn test_jobs_run_in_order_and_record_uncaught() {
        let host = LocalHost::new();
        let env = host.env();
        let loop_handle = env.raw().loop_handle().unwrap();

        let order = Arc::new(Mutex::new(Vec::new()));
        for n in 0..3 {
            let order = order.clone();
            loop_handle
                .schedule(Box::new(move |env: &RawEnv| {
                    order.lock().unwrap().push(n);
                    if n == 1 {
                        let message = env.create_string_utf8("job failed").unwrap();
                        let error = env.create_error(None, message).unwrap();
                        env.throw(error).unwrap();
                    }
                }))
                .unwrap();
        }

        assert_eq!(host.run_pending_jobs(), 3);
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
        assert_eq!(host.take_uncaught_exceptions(), vec!["job failed".to_string()]);
        assert!(!env.is_exception_pending().unwrap());
    }

    #[test]
    fn test_closed_loop_rejects_jobs() {
        let host = LocalHost::new();
        let loop_handle = host.env().raw().loop_handle().unwrap();

        host.close_loop();
        assert_eq!(
            loop_handle.schedule(Box::new(|_env: &RawEnv| {})).unwrap_err(),
            Status::Closing
        );
    }

    #[test]
    fn test_close_hooks_run_once_after_queued_jobs_are_dropped() {
        let host = LocalHost::new();
        let loop_handle = host.env().raw().loop_handle().unwrap();
        let events = Arc::new(Mutex::new(Vec::new()));

        let queued = events.clone();
        loop_handle
            .schedule(Box::new(move |_env: &RawEnv| queued.lock().unwrap().push("job")))
            .unwrap();
        let hook = events.clone();
        loop_handle
            .on_close(Box::new(move |_env: &RawEnv| hook.lock().unwrap().push("hook")))
            .unwrap();

        host.close_loop();
        host.close_loop();
        assert_eq!(*events.lock().unwrap(), vec!["hook"]);
        assert_eq!(
            loop_handle.on_close(Box::new(|_env: &RawEnv| {})).unwrap_err(),
            Status::Closing
        );
    }

    #[test]
    fn test_teardown_runs_instance_finalizer_once() {
        let host = LocalHost::new();
        let env = host.env();
        env.set_instance_data(7u8).unwrap();
        assert!(!env.raw().get_instance_data().unwrap().is_null());

        host.teardown();
        assert!(host.is_torn_down());
        assert!(env.raw().get_instance_data().unwrap().is_null());
        host.teardown();
    }
}
