//! Stable error-code taxonomy shared by every component crate.
//!
//! Per-crate error enums carry their own variants (and `thiserror` messages)
//! but each implements [`HasErrorCode`] so that a caller several layers up —
//! ultimately the (external) HTTP shell — can map any failure to one of the
//! stable strings in spec section 7 without re-deriving the mapping.

use std::fmt;

/// One entry per taxonomy entry in spec section 7.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    BadRequest,
    MissingField,
    InvalidArgument,
    NotFound,
    Conflict,
    ResourceExhausted,
    PoolTimeout,
    ArtifactLoadFailed,
    ArtifactWriteFailed,
    NoData,
    DbQueryFailed,
    DbInsertFailed,
    IllegalTransition,
    DimensionMismatch,
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::BadRequest => "BAD_REQUEST",
            ErrorCode::MissingField => "MISSING_FIELD",
            ErrorCode::InvalidArgument => "INVALID_ARGUMENT",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::Conflict => "CONFLICT",
            ErrorCode::ResourceExhausted => "RESOURCE_EXHAUSTED",
            ErrorCode::PoolTimeout => "POOL_TIMEOUT",
            ErrorCode::ArtifactLoadFailed => "ARTIFACT_LOAD_FAILED",
            ErrorCode::ArtifactWriteFailed => "ARTIFACT_WRITE_FAILED",
            ErrorCode::NoData => "NO_DATA",
            ErrorCode::DbQueryFailed => "DB_QUERY_FAILED",
            ErrorCode::DbInsertFailed => "DB_INSERT_FAILED",
            ErrorCode::IllegalTransition => "ILLEGAL_TRANSITION",
            ErrorCode::DimensionMismatch => "DIMENSION_MISMATCH",
            ErrorCode::Internal => "INTERNAL",
        }
    }

    /// HTTP status an external transport shell would map this to (spec section 7).
    pub fn http_status(&self) -> u16 {
        match self {
            ErrorCode::BadRequest
            | ErrorCode::MissingField
            | ErrorCode::InvalidArgument
            | ErrorCode::DimensionMismatch => 400,
            ErrorCode::NotFound => 404,
            ErrorCode::Conflict | ErrorCode::IllegalTransition => 409,
            ErrorCode::ResourceExhausted | ErrorCode::PoolTimeout => 429,
            _ => 500,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Implemented by every per-crate error enum.
pub trait HasErrorCode {
    fn error_code(&self) -> ErrorCode;
}
