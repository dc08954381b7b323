//! Typed parameters and results of native callbacks.
//!
//! A closure's parameter types describe its [`Signature`]; the same types
//! pull converted values back out of the marshalled argument slots. The set
//! of accepted parameter types is closed: anything else fails to compile.

use crate::runtime::callback::signature::{ParamDesc, ParamKind, ResultShape, Signature};
use crate::runtime::callback::Callback;
use crate::runtime::conversion::IntoJs;
use crate::runtime::env::Env;
use crate::runtime::error::Result;
use crate::runtime::value::{Buffer, Function, JsError, Object, Promise, Value};
use std::fmt::Display;
use std::ops::Deref;

/// One argument after conversion to its declared kind.
#[derive(Clone, Debug)]
pub enum Arg {
    Value(Value),
    String(String),
    Number(f64),
    Boolean(bool),
    Object(Object),
    Buffer(Buffer),
    Function(Function),
    Promise(Promise),
    Error(JsError),
}

/// Marshalled input for one declared parameter.
#[doc(hidden)]
pub enum Slot {
    Env(Env),
    One(Arg),
    Many(Vec<Arg>),
}

/// What a callback body produced: an optional value, or an error message to
/// throw.
#[doc(hidden)]
pub type Returned = std::result::Result<Option<Value>, String>;

mod sealed {
    pub trait Sealed {}
}

/// A single converted value a parameter can hold.
pub trait FromArg: sealed::Sealed + Sized + 'static {
    const KIND: ParamKind;

    fn from_arg(arg: Arg) -> Option<Self>;
}

macro_rules! from_arg {
    ($($ty:ty => $kind:ident),* $(,)?) => {
        $(
            impl sealed::Sealed for $ty {}

            impl FromArg for $ty {
                const KIND: ParamKind = ParamKind::$kind;

                fn from_arg(arg: Arg) -> Option<Self> {
                    match arg {
                        Arg::$kind(value) => Some(value),
                        _ => None,
                    }
                }
            }

            impl Param for $ty {
                fn describe() -> ParamDesc {
                    ParamDesc::Single(<$ty as FromArg>::KIND)
                }

                fn extract(slot: Slot) -> Option<Self> {
                    match slot {
                        Slot::One(arg) => <$ty as FromArg>::from_arg(arg),
                        _ => None,
                    }
                }
            }
        )*
    };
}

from_arg! {
    Value => Value,
    String => String,
    f64 => Number,
    bool => Boolean,
    Object => Object,
    Buffer => Buffer,
    Function => Function,
    Promise => Promise,
    JsError => Error,
}

impl sealed::Sealed for i64 {}

/// Numbers truncated towards zero.
impl FromArg for i64 {
    const KIND: ParamKind = ParamKind::Number;

    fn from_arg(arg: Arg) -> Option<Self> {
        match arg {
            Arg::Number(n) => Some(n as i64),
            _ => None,
        }
    }
}

impl Param for i64 {
    fn describe() -> ParamDesc {
        ParamDesc::Single(ParamKind::Number)
    }

    fn extract(slot: Slot) -> Option<Self> {
        match slot {
            Slot::One(arg) => i64::from_arg(arg),
            _ => None,
        }
    }
}

/// A type usable as a callback parameter.
pub trait Param: Sized + 'static {
    fn describe() -> ParamDesc;

    #[doc(hidden)]
    fn extract(slot: Slot) -> Option<Self>;
}

impl Param for Env {
    fn describe() -> ParamDesc {
        ParamDesc::Env
    }

    fn extract(slot: Slot) -> Option<Self> {
        match slot {
            Slot::Env(env) => Some(env),
            _ => None,
        }
    }
}

/// Collects every argument after the receiver.
impl<T: FromArg> Param for Vec<T> {
    fn describe() -> ParamDesc {
        ParamDesc::Collect(T::KIND)
    }

    fn extract(slot: Slot) -> Option<Self> {
        match slot {
            Slot::Many(args) => args.into_iter().map(T::from_arg).collect(),
            _ => None,
        }
    }
}

/// Variadic tail: the arguments left after the fixed parameters.
#[derive(Clone, Debug, Default)]
pub struct Rest<T>(pub Vec<T>);

impl<T> Rest<T> {
    pub fn into_inner(self) -> Vec<T> {
        self.0
    }
}

impl<T> Deref for Rest<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        &self.0
    }
}

impl<T: FromArg> Param for Rest<T> {
    fn describe() -> ParamDesc {
        ParamDesc::Rest(T::KIND)
    }

    fn extract(slot: Slot) -> Option<Self> {
        match slot {
            Slot::Many(args) => args.into_iter().map(T::from_arg).collect::<Option<_>>().map(Rest),
            _ => None,
        }
    }
}

/// A type usable as a callback's return type.
pub trait CallbackResult: 'static {
    const SHAPE: ResultShape;

    #[doc(hidden)]
    fn into_returned(self, env: &Env) -> Returned;
}

impl CallbackResult for () {
    const SHAPE: ResultShape = ResultShape::Unit;

    fn into_returned(self, _env: &Env) -> Returned {
        Ok(None)
    }
}

impl<T: IntoJs + 'static> CallbackResult for T {
    const SHAPE: ResultShape = ResultShape::Single;

    fn into_returned(self, env: &Env) -> Returned {
        self.into_js(env).map(Some).map_err(|err| err.to_string())
    }
}

impl<E: Display + 'static> CallbackResult for std::result::Result<(), E> {
    const SHAPE: ResultShape = ResultShape::Fallible;

    fn into_returned(self, _env: &Env) -> Returned {
        self.map(|()| None).map_err(|err| err.to_string())
    }
}

impl<T: IntoJs + 'static, E: Display + 'static> CallbackResult for std::result::Result<T, E> {
    const SHAPE: ResultShape = ResultShape::Fallible;

    fn into_returned(self, env: &Env) -> Returned {
        match self {
            Ok(value) => value.into_js(env).map(Some).map_err(|err| err.to_string()),
            Err(err) => Err(err.to_string()),
        }
    }
}

/// Anything that can be registered as a native function.
///
/// Implemented for [`Callback`] itself and for closures taking up to eight
/// [`Param`]s and returning a [`CallbackResult`]. `Marker` only
/// disambiguates the closure impls.
pub trait IntoCallback<Marker>: Sized {
    fn into_callback(self) -> Result<Callback>;
}

impl IntoCallback<Callback> for Callback {
    fn into_callback(self) -> Result<Callback> {
        Ok(self)
    }
}

/// A closure with no parameters has no receiver and is rejected.
impl<F, R> IntoCallback<fn() -> R> for F
where
    F: Fn() -> R + Send + Sync + 'static,
    R: CallbackResult,
{
    fn into_callback(self) -> Result<Callback> {
        let signature = Signature::from_params(&[], R::SHAPE)?;
        let target = self;
        Ok(Callback::from_parts(signature, move |env: &Env, _slots: Vec<Slot>| {
            Some(target().into_returned(env))
        }))
    }
}

macro_rules! impl_into_callback {
    ($($param:ident),+) => {
        impl<F, R, $($param,)+> IntoCallback<fn($($param,)+) -> R> for F
        where
            F: Fn($($param),+) -> R + Send + Sync + 'static,
            R: CallbackResult,
            $($param: Param,)+
        {
            #[allow(non_snake_case)]
            fn into_callback(self) -> Result<Callback> {
                let params = [$($param::describe()),+];
                let signature = Signature::from_params(&params, R::SHAPE)?;
                let target = self;
                Ok(Callback::from_parts(signature, move |env: &Env, slots: Vec<Slot>| {
                    let mut slots = slots.into_iter();
                    $(let $param = $param::extract(slots.next()?)?;)+
                    Some(target($($param),+).into_returned(env))
                }))
            }
        }
    };
}

impl_into_callback!(P1);
impl_into_callback!(P1, P2);
impl_into_callback!(P1, P2, P3);
impl_into_callback!(P1, P2, P3, P4);
impl_into_callback!(P1, P2, P3, P4, P5);
impl_into_callback!(P1, P2, P3, P4, P5, P6);
impl_into_callback!(P1, P2, P3, P4, P5, P6, P7);
impl_into_callback!(P1, P2, P3, P4, P5, P6, P7, P8);
