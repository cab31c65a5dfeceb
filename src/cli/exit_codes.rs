//! Process exit codes of `fieldlink-cli`
//!
//! Only codes the binary can actually return are listed here. Argument
//! errors exit with 2 from clap before any of this runs.

use crate::config::ConfigError;
use crate::core::session::ChannelError;
use crate::core::transport::TransportError;
use std::process::ExitCode;

/// Exit code constants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitCodes;

impl ExitCodes {
    pub const SUCCESS: u8 = 0;
    /// Anything without a more specific code
    pub const ERROR: u8 = 1;
    /// Rejected by clap
    pub const INVALID_ARGS: u8 = 2;
    /// The peripheral could not be reached or the link is down
    pub const CONNECTION_FAILED: u8 = 3;
    pub const TIMEOUT: u8 = 4;
    /// Config or log path missing
    pub const FILE_NOT_FOUND: u8 = 6;
    /// Serial port or Bluetooth adapter access denied
    pub const PERMISSION_DENIED: u8 = 7;
    pub const CONFIG_ERROR: u8 = 8;
    pub const DEVICE_NOT_FOUND: u8 = 12;
    /// No transport for this channel on this platform
    pub const UNSUPPORTED: u8 = 13;
    /// The channel task stopped answering
    pub const INTERNAL_ERROR: u8 = 127;
}

const DESCRIPTIONS: &[(u8, &str)] = &[
    (ExitCodes::SUCCESS, "Success"),
    (ExitCodes::ERROR, "General error"),
    (ExitCodes::INVALID_ARGS, "Invalid command line"),
    (ExitCodes::CONNECTION_FAILED, "Peripheral unreachable or link down"),
    (ExitCodes::TIMEOUT, "Peripheral did not answer in time"),
    (ExitCodes::FILE_NOT_FOUND, "Config or log path not found"),
    (ExitCodes::PERMISSION_DENIED, "Port or adapter access denied"),
    (ExitCodes::CONFIG_ERROR, "Invalid configuration"),
    (ExitCodes::DEVICE_NOT_FOUND, "Selected device not found"),
    (ExitCodes::UNSUPPORTED, "Channel has no transport on this platform"),
    (ExitCodes::INTERNAL_ERROR, "Channel task stopped"),
];

/// Failure mapped onto an exit code
#[derive(Debug)]
pub struct CliResult {
    code: u8,
    message: String,
}

impl CliResult {
    pub fn error(code: u8, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn code(&self) -> u8 {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn to_exit_code(&self) -> ExitCode {
        ExitCode::from(self.code)
    }

    /// Map an error chain to the most specific exit code found in it
    pub fn from_error(err: &anyhow::Error) -> Self {
        for cause in err.chain() {
            if let Some(e) = cause.downcast_ref::<ChannelError>() {
                return Self::from(e);
            }
            if let Some(e) = cause.downcast_ref::<TransportError>() {
                return Self::from(e);
            }
            if let Some(e) = cause.downcast_ref::<ConfigError>() {
                return Self::error(ExitCodes::CONFIG_ERROR, e.to_string());
            }
            if let Some(e) = cause.downcast_ref::<std::io::Error>() {
                return Self::from_io(e, err.to_string());
            }
        }
        Self::error(ExitCodes::ERROR, err.to_string())
    }

    fn from_io(err: &std::io::Error, message: String) -> Self {
        use std::io::ErrorKind;

        let code = match err.kind() {
            ErrorKind::NotFound => ExitCodes::FILE_NOT_FOUND,
            ErrorKind::PermissionDenied => ExitCodes::PERMISSION_DENIED,
            ErrorKind::ConnectionRefused => ExitCodes::CONNECTION_FAILED,
            ErrorKind::TimedOut => ExitCodes::TIMEOUT,
            _ => ExitCodes::ERROR,
        };
        Self::error(code, message)
    }
}

impl From<std::io::Error> for CliResult {
    fn from(err: std::io::Error) -> Self {
        let message = err.to_string();
        Self::from_io(&err, message)
    }
}

impl From<&TransportError> for CliResult {
    fn from(err: &TransportError) -> Self {
        let code = match err {
            TransportError::Timeout(_) => ExitCodes::TIMEOUT,
            TransportError::DeviceNotFound(_) => ExitCodes::DEVICE_NOT_FOUND,
            TransportError::PermissionDenied(_) => ExitCodes::PERMISSION_DENIED,
            TransportError::InvalidConfiguration(_) => ExitCodes::CONFIG_ERROR,
            TransportError::Unsupported(_) => ExitCodes::UNSUPPORTED,
            _ => ExitCodes::CONNECTION_FAILED,
        };
        Self::error(code, err.to_string())
    }
}

impl From<&ChannelError> for CliResult {
    fn from(err: &ChannelError) -> Self {
        let code = match err {
            ChannelError::Transport(e) => return Self::from(e),
            ChannelError::Unsupported => ExitCodes::UNSUPPORTED,
            ChannelError::NotConnected => ExitCodes::CONNECTION_FAILED,
            ChannelError::Closed => ExitCodes::INTERNAL_ERROR,
        };
        Self::error(code, err.to_string())
    }
}

pub fn exit_code_description(code: u8) -> &'static str {
    DESCRIPTIONS
        .iter()
        .find(|(c, _)| *c == code)
        .map_or("Unknown error", |&(_, text)| text)
}

/// Print the exit code table
pub fn print_exit_codes() {
    println!("Exit Codes:");
    for (code, text) in DESCRIPTIONS {
        println!("  {code:>3}  {text}");
    }
}
