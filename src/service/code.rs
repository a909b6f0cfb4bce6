//! Service errors and their numeric codes.

use thiserror::Error;

use crate::storage::StorageError;

pub const INVALID_URI: i64 = 160014000000;
pub const INVALID_PARAMS: i64 = 160014000001;
pub const INVALID_TIMESTAMP: i64 = 160014000002;
pub const NAME_EXIST: i64 = 160014000003;
pub const TIME_OUT: i64 = 160014000004;
pub const ROLLBACK: i64 = 160014000005;
pub const LOCK_EXPIRE: i64 = 160014000006;

/// Code for failures without a dedicated entry.
pub const UNKNOWN: i64 = -1;

/// Human-readable message for a code.
pub fn message(code: i64) -> &'static str {
    match code {
        INVALID_URI => "Invalid URI.",
        INVALID_PARAMS => "Invalid parameters.",
        INVALID_TIMESTAMP => "Invalid time format.",
        NAME_EXIST => "Name is already in use, check and retry.",
        TIME_OUT => "Timed out.",
        ROLLBACK => "Rolled back.",
        LOCK_EXPIRE => "Lock expired.",
        _ => "Unknown error.",
    }
}

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Invalid params: {0}")]
    InvalidParams(String),

    #[error("Dataset not found: {0}")]
    DataSetNotFound(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl ServiceError {
    pub fn code(&self) -> i64 {
        match self {
            ServiceError::InvalidParams(_) | ServiceError::DataSetNotFound(_) => INVALID_PARAMS,
            ServiceError::Storage(StorageError::Validation(_)) => INVALID_PARAMS,
            ServiceError::Storage(StorageError::Cancelled)
            | ServiceError::Storage(StorageError::Unavailable(_)) => TIME_OUT,
            ServiceError::Storage(_) => UNKNOWN,
        }
    }
}

pub type ServiceResult<T> = Result<T, ServiceError>;
