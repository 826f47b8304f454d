//! Terminal progress display for the CLI.

pub mod progress;

pub use progress::{create_progress_bar, create_spinner, with_spinner};
