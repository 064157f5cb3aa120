//! Structured error types for the WAL listener core.
//!
//! Each component gets its own error enum; `CoreError` wraps them so
//! `main` has a single type to match on at the process boundary.

use thiserror::Error;

/// Errors raised while turning a raw `pgoutput` payload into a `Message`.
///
/// These never escape `decode()` itself, the decoder is total and folds
/// every one of these into a `Message::Malformed`, but the variants are
/// kept around to build useful `reason` strings and for unit testing the
/// individual parse helpers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("empty message buffer")]
    EmptyBuffer,

    #[error("unknown message tag: {0:?}")]
    UnknownTag(char),

    #[error("truncated message: needed at least {needed} bytes, got {got}")]
    Truncated { needed: usize, got: usize },

    #[error("string is not null-terminated")]
    UnterminatedString,

    #[error("invalid tuple column marker: {0:?}")]
    InvalidTupleMarker(char),

    #[error("unchanged-TOAST marker is not legal in this tuple position")]
    UnchangedNotAllowed,

    #[error("invalid UTF-8 in text column")]
    InvalidUtf8,

    #[error("expected marker {expected:?}, got {got:?}")]
    UnexpectedMarker { expected: char, got: char },
}

pub type DecodeResult<T> = std::result::Result<T, DecodeError>;

/// Errors raised while assembling decoded messages into `ChangeEvent`s.
/// None of these abort the worker; they are logged and the offending row
/// or message is skipped, per the error-handling taxonomy.
#[derive(Error, Debug)]
pub enum AssemblerError {
    #[error("relation schema not cached for oid {0}")]
    UnknownRelation(u32),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
}

/// Errors raised by a single Stream Worker.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("database connection error: {message}")]
    Connection { message: String },

    #[error("configuration error: {message}")]
    Configuration { message: String },

    #[error("replication protocol error: {message}")]
    Protocol { message: String },

    #[error("archive store write failed: {0}")]
    ArchiveWrite(String),

    #[error("network IO error")]
    NetworkIo(#[from] std::io::Error),

    #[error("C string conversion error")]
    CStringConversion(#[from] std::ffi::NulError),

    #[error("task join error")]
    TaskJoin(#[from] tokio::task::JoinError),
}

pub type WorkerResult<T> = std::result::Result<T, WorkerError>;

impl WorkerError {
    pub fn connection<S: Into<String>>(message: S) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }
}

/// Errors raised by the Supervisor while reconciling desired vs. running
/// workers. Per §4.4's fail-open policy, these are always logged and
/// swallowed by the caller; they exist as a type mainly so the
/// control-plane store trait has something concrete to return.
#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("control-plane store error: {0}")]
    ControlPlaneStore(String),
}

/// Top-level error type surfaced to `main`.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("configuration error: {message}")]
    Configuration { message: String },

    #[error(transparent)]
    Worker(#[from] WorkerError),

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type CoreResult<T> = std::result::Result<T, CoreError>;

impl CoreError {
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }
}
