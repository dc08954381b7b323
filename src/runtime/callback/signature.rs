//! Parameter and result shapes of a native callback, and the registration
//! rules over them.

use crate::runtime::callback::typed::Arg;
use crate::runtime::error::{Error, Result};
use crate::runtime::value::Value;
use std::fmt;

/// Value kinds a callback parameter can ask for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ParamKind {
    Value,
    String,
    Number,
    Boolean,
    Object,
    Buffer,
    Function,
    Promise,
    Error,
}

impl ParamKind {
    pub fn name(self) -> &'static str {
        match self {
            ParamKind::Value => "Value",
            ParamKind::String => "string",
            ParamKind::Number => "number",
            ParamKind::Boolean => "boolean",
            ParamKind::Object => "Object",
            ParamKind::Buffer => "Buffer",
            ParamKind::Function => "Function",
            ParamKind::Promise => "Promise",
            ParamKind::Error => "Error",
        }
    }

    /// Convert `value` to this kind, or `None` if it is not compatible.
    pub(crate) fn convert(self, value: &Value) -> Option<Arg> {
        match self {
            ParamKind::Value => Some(Arg::Value(value.clone())),
            ParamKind::String => value.as_string().ok().map(Arg::String),
            ParamKind::Number => value.as_f64().ok().map(Arg::Number),
            ParamKind::Boolean => value.as_bool().ok().map(Arg::Boolean),
            ParamKind::Object => value.as_object().ok().map(Arg::Object),
            ParamKind::Buffer => value.as_buffer().ok().map(Arg::Buffer),
            ParamKind::Function => value.as_function().ok().map(Arg::Function),
            ParamKind::Promise => value.as_promise().ok().map(Arg::Promise),
            ParamKind::Error => value.as_error().ok().map(Arg::Error),
        }
    }
}

impl fmt::Display for ParamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// How one declared parameter consumes the call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParamDesc {
    /// The runtime scope itself; only valid first.
    Env,
    /// One value of the given kind.
    Single(ParamKind),
    /// Every argument, each converted to the kind.
    Collect(ParamKind),
    /// Whatever arguments remain, each converted to the kind.
    Rest(ParamKind),
}

impl fmt::Display for ParamDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamDesc::Env => f.write_str("Env"),
            ParamDesc::Single(kind) => write!(f, "{kind}"),
            ParamDesc::Collect(kind) => write!(f, "Vec<{kind}>"),
            ParamDesc::Rest(kind) => write!(f, "Rest<{kind}>"),
        }
    }
}

/// Argument shape after the receiver.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ParamShape {
    Fixed(Vec<ParamKind>),
    Collect(ParamKind),
    Variadic { prefix: Vec<ParamKind>, tail: ParamKind },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResultShape {
    Unit,
    Single,
    /// A value plus an error; a present error wins.
    Fallible,
}

/// Validated shape of a callback.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Signature {
    env: bool,
    receiver: ParamKind,
    params: ParamShape,
    results: ResultShape,
}

fn invalid(message: impl Into<String>) -> Error {
    Error::Signature(message.into())
}

impl Signature {
    /// Validate a declared parameter list.
    ///
    /// An optional `Env` comes first, then the receiver, then either a single
    /// collect-all parameter or fixed parameters optionally followed by one
    /// variadic tail.
    pub fn from_params(params: &[ParamDesc], results: ResultShape) -> Result<Self> {
        if params.is_empty() {
            return Err(invalid("function must have at least a 'this' parameter"));
        }

        let env = params[0] == ParamDesc::Env;
        let mut position = usize::from(env);

        let receiver = match params.get(position) {
            None => return Err(invalid("function must have a 'this' parameter after Env")),
            Some(ParamDesc::Single(kind)) => *kind,
            Some(ParamDesc::Env) => {
                return Err(invalid(format!(
                    "parameter {position}: Env may only appear as the first parameter"
                )))
            }
            Some(other) => {
                return Err(invalid(format!(
                    "'this' parameter must be a single value, got {other}"
                )))
            }
        };
        position += 1;

        let rest = &params[position..];
        let shape = match rest {
            [ParamDesc::Collect(kind)] => ParamShape::Collect(*kind),
            _ => {
                let mut prefix = Vec::with_capacity(rest.len());
                let mut tail = None;
                for (offset, desc) in rest.iter().enumerate() {
                    let index = position + offset;
                    match desc {
                        ParamDesc::Single(kind) => prefix.push(*kind),
                        ParamDesc::Rest(kind) if offset + 1 == rest.len() => tail = Some(*kind),
                        ParamDesc::Rest(_) => {
                            return Err(invalid(format!(
                                "parameter {index}: Rest may only appear as the last parameter"
                            )))
                        }
                        ParamDesc::Collect(_) => {
                            return Err(invalid(format!(
                                "parameter {index}: a Vec parameter must be the only parameter after 'this'"
                            )))
                        }
                        ParamDesc::Env => {
                            return Err(invalid(format!(
                                "parameter {index}: Env may only appear as the first parameter"
                            )))
                        }
                    }
                }
                match tail {
                    Some(tail) => ParamShape::Variadic { prefix, tail },
                    None => ParamShape::Fixed(prefix),
                }
            }
        };

        Ok(Self {
            env,
            receiver,
            params: shape,
            results,
        })
    }

    pub fn has_env(&self) -> bool {
        self.env
    }

    pub fn receiver(&self) -> ParamKind {
        self.receiver
    }

    pub fn params(&self) -> &ParamShape {
        &self.params
    }

    pub fn results(&self) -> ResultShape {
        self.results
    }

    /// Fewest arguments a call must supply.
    pub fn min_args(&self) -> usize {
        match &self.params {
            ParamShape::Fixed(kinds) => kinds.len(),
            ParamShape::Collect(_) => 0,
            ParamShape::Variadic { prefix, .. } => prefix.len(),
        }
    }
}
