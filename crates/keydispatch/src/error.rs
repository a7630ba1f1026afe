//! Error types for the dispatch core.
//!
//! None of these reach UI-level consumers through `dispatch`; they are logged
//! there. They surface from registration, index lookups and the transport.

use thiserror::Error;

/// Errors from reading or subscribing to a single keyword variable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyVarError {
    #[error("{keyword}: index {index} outside declared range {nval}")]
    IndexOutOfRange {
        keyword: String,
        index: usize,
        nval: String,
    },

    #[error("{keyword}: got {got} values, expected {nval}")]
    WrongCount {
        keyword: String,
        got: usize,
        nval: String,
    },
}

/// Registry and command submission errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("{actor}.{keyword} is already registered with a different shape")]
    ConflictingKeyVar { actor: String, keyword: String },

    #[error("Command {0:?} was already executed")]
    AlreadyExecuted(String),

    #[error("Empty command string for actor {0}")]
    EmptyCommand(String),
}

/// Failures writing to the hub.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Not connected to the hub")]
    NotConnected,

    #[error("Connection closed: {0}")]
    Closed(String),
}
