//! Crate-wide error taxonomy.
//!
//! Mirrors the four classes from the error handling design: client errors
//! (surfaced, connection stays open), engine errors (surfaced, connection
//! may stay open), protocol errors (connection closed after a best-effort
//! ERROR response), and fatal errors (process exits). Each layer below
//! (storage, document, protocol) returns its own narrower error type and
//! converts into `NexaError` at the boundary, so no layer logs-and-swallows.

use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, NexaError>;

/// Stable wire/API error code. Codes are part of the external contract;
/// message text is not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    InvalidMessage,
    InvalidCollection,
    InvalidDatabase,
    InvalidQuery,
    NotFound,
    Duplicate,
    DimensionMismatch,
    Unauthorized,
    Timeout,
    PermissionDenied,
    StorageUnavailable,
    IndexUnavailable,
    Busy,
    BadMagic,
    UnsupportedVersion,
    PayloadTooLarge,
    DecodeFailed,
    CorruptLog,
    ManifestCorrupt,
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidMessage => "InvalidMessage",
            ErrorCode::InvalidCollection => "InvalidCollection",
            ErrorCode::InvalidDatabase => "InvalidDatabase",
            ErrorCode::InvalidQuery => "InvalidQuery",
            ErrorCode::NotFound => "NotFound",
            ErrorCode::Duplicate => "Duplicate",
            ErrorCode::DimensionMismatch => "DimensionMismatch",
            ErrorCode::Unauthorized => "Unauthorized",
            ErrorCode::Timeout => "Timeout",
            ErrorCode::PermissionDenied => "PermissionDenied",
            ErrorCode::StorageUnavailable => "StorageUnavailable",
            ErrorCode::IndexUnavailable => "IndexUnavailable",
            ErrorCode::Busy => "Busy",
            ErrorCode::BadMagic => "BadMagic",
            ErrorCode::UnsupportedVersion => "UnsupportedVersion",
            ErrorCode::PayloadTooLarge => "PayloadTooLarge",
            ErrorCode::DecodeFailed => "DecodeFailed",
            ErrorCode::CorruptLog => "CorruptLog",
            ErrorCode::ManifestCorrupt => "ManifestCorrupt",
            ErrorCode::Internal => "Internal",
        }
    }

    /// Whether this error class closes the connection (protocol + fatal).
    pub fn closes_connection(&self) -> bool {
        matches!(
            self,
            ErrorCode::BadMagic
                | ErrorCode::UnsupportedVersion
                | ErrorCode::PayloadTooLarge
                | ErrorCode::DecodeFailed
                | ErrorCode::CorruptLog
                | ErrorCode::ManifestCorrupt
        )
    }
}

#[derive(Error, Debug)]
pub enum NexaError {
    #[error("invalid message: {0}")]
    InvalidMessage(String),
    #[error("invalid collection name: {0}")]
    InvalidCollection(String),
    #[error("invalid database name: {0}")]
    InvalidDatabase(String),
    #[error("invalid query: {0}")]
    InvalidQuery(String),
    #[error("not found")]
    NotFound,
    #[error("duplicate key: {0}")]
    Duplicate(String),
    #[error("vector dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },
    #[error("unauthorized for database {0}")]
    Unauthorized(String),
    #[error("request timed out")]
    Timeout,
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),
    #[error("index unavailable, rebuild required: {0}")]
    IndexUnavailable(String),
    #[error("busy: {0}")]
    Busy(String),

    #[error("bad magic number")]
    BadMagic,
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),
    #[error("payload too large: {0} bytes")]
    PayloadTooLarge(u32),
    #[error("failed to decode payload: {0}")]
    DecodeFailed(String),

    #[error("write-ahead log is corrupt and repair mode was not requested")]
    CorruptLog,
    #[error("manifest is corrupt: {0}")]
    ManifestCorrupt(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("internal error: {0}")]
    Internal(String),
}

impl NexaError {
    pub fn code(&self) -> ErrorCode {
        match self {
            NexaError::InvalidMessage(_) => ErrorCode::InvalidMessage,
            NexaError::InvalidCollection(_) => ErrorCode::InvalidCollection,
            NexaError::InvalidDatabase(_) => ErrorCode::InvalidDatabase,
            NexaError::InvalidQuery(_) => ErrorCode::InvalidQuery,
            NexaError::NotFound => ErrorCode::NotFound,
            NexaError::Duplicate(_) => ErrorCode::Duplicate,
            NexaError::DimensionMismatch { .. } => ErrorCode::DimensionMismatch,
            NexaError::Unauthorized(_) => ErrorCode::Unauthorized,
            NexaError::Timeout => ErrorCode::Timeout,
            NexaError::PermissionDenied(_) => ErrorCode::PermissionDenied,
            NexaError::StorageUnavailable(_) => ErrorCode::StorageUnavailable,
            NexaError::IndexUnavailable(_) => ErrorCode::IndexUnavailable,
            NexaError::Busy(_) => ErrorCode::Busy,
            NexaError::BadMagic => ErrorCode::BadMagic,
            NexaError::UnsupportedVersion(_) => ErrorCode::UnsupportedVersion,
            NexaError::PayloadTooLarge(_) => ErrorCode::PayloadTooLarge,
            NexaError::DecodeFailed(_) => ErrorCode::DecodeFailed,
            NexaError::CorruptLog => ErrorCode::CorruptLog,
            NexaError::ManifestCorrupt(_) => ErrorCode::ManifestCorrupt,
            NexaError::Io(_) => ErrorCode::StorageUnavailable,
            NexaError::Internal(_) => ErrorCode::Internal,
        }
    }

    /// Fatal errors cause the process to refuse to start / to exit.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            NexaError::CorruptLog | NexaError::ManifestCorrupt(_)
        )
    }
}

impl From<rmp_serde::encode::Error> for NexaError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        NexaError::DecodeFailed(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for NexaError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        NexaError::DecodeFailed(e.to_string())
    }
}
