//! Command-line output: exit codes and result formats.

pub mod exit_code;
pub mod format;

pub use exit_code::ExitCode;
pub use format::{JsonError, JsonResponse, OutputFormat, write_error, write_results};
