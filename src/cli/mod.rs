//! CLI Module
//!
//! Provides command-line interface functionality including:
//! - Exit codes for automation
//! - Record rendering (text or JSON lines)
//! - Logging setup

pub mod exit_codes;
pub mod logging;
pub mod output;

pub use exit_codes::{exit_code_description, print_exit_codes, CliResult, ExitCodes};
pub use logging::init_logging;
pub use output::{describe_event, OutputFormat, Render};
