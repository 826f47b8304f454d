//! Exit codes for CLI operations.
//!
//! - `0`: success, including a search with no results
//! - `1`: general error
//! - `2`: invalid arguments
//! - `3`: something the command needs does not exist (usually the index)

use crate::error::IndexError;

/// Process exit status of a `clindex` command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExitCode {
    Success = 0,

    /// Unspecified error occurred (code 1)
    GeneralError = 1,

    /// Bad flag value, empty query, invalid pattern (code 2)
    InvalidArgument = 2,

    /// Missing index or directory (code 3)
    NotFound = 3,
}

impl From<ExitCode> for i32 {
    fn from(code: ExitCode) -> i32 {
        code as i32
    }
}

impl From<ExitCode> for std::process::ExitCode {
    fn from(code: ExitCode) -> Self {
        std::process::ExitCode::from(code as u8)
    }
}

impl ExitCode {
    /// Map an `IndexError` to the code scripts can branch on.
    pub fn from_error(error: &IndexError) -> Self {
        match error {
            IndexError::InvalidArgument { .. } => ExitCode::InvalidArgument,
            IndexError::NotFound { .. } => ExitCode::NotFound,
            _ => ExitCode::GeneralError,
        }
    }

    /// Like [`from_error`](Self::from_error) for errors that crossed an
    /// `anyhow` boundary.
    pub fn from_anyhow(error: &anyhow::Error) -> Self {
        error
            .chain()
            .find_map(|cause| cause.downcast_ref::<IndexError>())
            .map_or(ExitCode::GeneralError, Self::from_error)
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, ExitCode::Success)
    }

    pub fn description(&self) -> &str {
        match self {
            ExitCode::Success => "Success",
            ExitCode::GeneralError => "General error",
            ExitCode::InvalidArgument => "Invalid arguments",
            ExitCode::NotFound => "Not found",
        }
    }
}
