//! Error type shared by every layer of the bridge.

use crate::runtime::sys::{Status, ValueType};
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// A native entry point returned a non-`Ok` status.
    #[error("native call failed: {0}")]
    Status(Status),

    #[error("wrong type: expected {expected}, got {actual}")]
    WrongType {
        expected: &'static str,
        actual: ValueType,
    },

    /// Callback registration rejected the function's shape.
    #[error("invalid callback signature: {0}")]
    Signature(String),

    #[error("value cannot be represented in the runtime: {0}")]
    InvalidValueType(String),

    #[error("threadsafe function is closing")]
    Closing,

    #[error("threadsafe function queue is full")]
    QueueFull,

    #[error("blocking call from the runtime thread would deadlock")]
    WouldDeadlock,

    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    #[error("promise is already settled")]
    AlreadySettled,

    #[error("snapshot limit exceeded: {0}")]
    Limit(String),

    /// Error raised by application code (dispatchers, settlers, finalizers).
    #[error("{0}")]
    Application(String),

    #[error("runtime error: {0}")]
    Runtime(String),

    /// An exception escaped into native code.
    #[error("uncaught exception: {0}")]
    Exception(String),
}

impl Error {
    pub fn application(message: impl std::fmt::Display) -> Self {
        Error::Application(message.to_string())
    }
}

impl From<Status> for Error {
    fn from(status: Status) -> Self {
        match status {
            Status::QueueFull => Error::QueueFull,
            Status::Closing => Error::Closing,
            Status::WouldDeadlock => Error::WouldDeadlock,
            other => Error::Status(other),
        }
    }
}
