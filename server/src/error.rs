//! Error types for the coordination layer.
//!
//! None of these are fatal to an instance: the coordinator logs them and keeps
//! running, and the arbiter folds registry failures into its retry budget.

use thiserror::Error;

/// Failures reported by a shared registry backend.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("registry operation timed out")]
    Timeout,
}

/// Failures opening or driving a client transport.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to bind client listener on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("client transport already open")]
    AlreadyOpen,

    #[error("failed to encode packet: {0}")]
    Encode(#[from] bincode::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Failures of leader-only arbitration work.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ArbiterError {
    #[error("no unique name found after {attempts} attempts")]
    NamesExhausted { attempts: usize },

    #[error(transparent)]
    Registry(#[from] RegistryError),
}
