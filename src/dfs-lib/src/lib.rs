mod config;
mod frame;
mod message;
mod types;
mod wire;

pub use config::*;
pub use frame::*;
pub use message::*;
pub use types::*;
pub use wire::*;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DfsError {
    #[error("invalid frame: {0}")]
    InvalidFrame(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("offset out of range: {0}")]
    OutOfRange(String),
    #[error("out of capacity: {0}")]
    OutOfCapacity(String),
    #[error("bad offset: {0}")]
    BadOffset(String),
    #[error("directory unreachable: {0}")]
    DirectoryUnreachable(String),
    #[error("all replicas failed: {0}")]
    AllReplicasFailed(String),
    #[error("closed handle: {0}")]
    ClosedHandle(String),
    #[error("decode error: {0}")]
    DecodeError(String),
    #[error("I/O error: {0}")]
    IoError(String),
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("invalid param: {0}")]
    InvalidParam(String),
    #[error("internal error: {0}")]
    Internal(String),
}

pub type DfsResult<T> = std::result::Result<T, DfsError>;

impl From<std::io::Error> for DfsError {
    fn from(err: std::io::Error) -> Self {
        DfsError::IoError(err.to_string())
    }
}

impl DfsError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, DfsError::NotFound(_))
    }
}

/// Stable error codes carried in failure-bearing responses, so a peer can
/// recover the error kind without parsing message strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    NotFound = 1,
    OutOfRange = 2,
    OutOfCapacity = 3,
    BadOffset = 4,
    InvalidParam = 5,
    Internal = 6,
}

impl ErrorCode {
    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            1 => Some(ErrorCode::NotFound),
            2 => Some(ErrorCode::OutOfRange),
            3 => Some(ErrorCode::OutOfCapacity),
            4 => Some(ErrorCode::BadOffset),
            5 => Some(ErrorCode::InvalidParam),
            6 => Some(ErrorCode::Internal),
            _ => None,
        }
    }
}

impl From<&DfsError> for ErrorCode {
    fn from(err: &DfsError) -> Self {
        match err {
            DfsError::NotFound(_) => ErrorCode::NotFound,
            DfsError::OutOfRange(_) => ErrorCode::OutOfRange,
            DfsError::OutOfCapacity(_) => ErrorCode::OutOfCapacity,
            DfsError::BadOffset(_) => ErrorCode::BadOffset,
            DfsError::InvalidParam(_) => ErrorCode::InvalidParam,
            _ => ErrorCode::Internal,
        }
    }
}

impl ErrorCode {
    pub fn into_error(self, message: String) -> DfsError {
        match self {
            ErrorCode::NotFound => DfsError::NotFound(message),
            ErrorCode::OutOfRange => DfsError::OutOfRange(message),
            ErrorCode::OutOfCapacity => DfsError::OutOfCapacity(message),
            ErrorCode::BadOffset => DfsError::BadOffset(message),
            ErrorCode::InvalidParam => DfsError::InvalidParam(message),
            ErrorCode::Internal => DfsError::Internal(message),
        }
    }
}

pub fn current_unix_ts() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
