/*!
 * Error types for Hearth
 */

use std::fmt;
use std::io;
use std::path::PathBuf;

use hearth_core_resilience::ResilienceError;

pub type Result<T> = std::result::Result<T, HearthError>;

/// Exit code constants for structured process exit
pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_PARTIAL: i32 = 1;
pub const EXIT_FATAL: i32 = 2;
pub const EXIT_DEGRADED: i32 = 3;

#[derive(Debug)]
pub enum HearthError {
    /// Configuration file missing
    ConfigNotFound(PathBuf),

    /// Configuration error (parse or validation)
    Config(String),

    /// Logging could not be initialized
    Logging(String),

    /// I/O error
    Io(io::Error),

    /// Error from the pool or recovery layer
    Resilience(ResilienceError),

    /// Generic error with message
    Other(String),
}

impl HearthError {
    /// Get the process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            HearthError::ConfigNotFound(_) | HearthError::Config(_) | HearthError::Logging(_) => {
                EXIT_FATAL
            }
            HearthError::Resilience(err) if err.root_cause().is_degraded() => EXIT_DEGRADED,
            HearthError::Resilience(ResilienceError::Validation(_)) => EXIT_FATAL,
            _ => EXIT_PARTIAL,
        }
    }

    /// Check if this error is fatal (should not retry)
    pub fn is_fatal(&self) -> bool {
        match self {
            HearthError::ConfigNotFound(_) => true,
            HearthError::Config(_) => true,
            HearthError::Logging(_) => true,
            HearthError::Resilience(err) => !err.is_recoverable(),

            HearthError::Io(_) => false,
            HearthError::Other(_) => false,
        }
    }

    /// Check if the service was shedding load when this error occurred
    pub fn is_degraded(&self) -> bool {
        matches!(self, HearthError::Resilience(err) if err.root_cause().is_degraded())
    }
}

impl fmt::Display for HearthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HearthError::ConfigNotFound(path) => {
                write!(f, "Configuration file not found: {}", path.display())
            }
            HearthError::Config(msg) => {
                write!(f, "Configuration error: {}", msg)
            }
            HearthError::Logging(msg) => {
                write!(f, "Logging setup failed: {}", msg)
            }
            HearthError::Io(err) => {
                write!(f, "I/O error: {}", err)
            }
            HearthError::Resilience(err) => {
                write!(f, "{}", err)
            }
            HearthError::Other(msg) => {
                write!(f, "{}", msg)
            }
        }
    }
}

impl std::error::Error for HearthError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            HearthError::Io(err) => Some(err),
            HearthError::Resilience(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for HearthError {
    fn from(err: io::Error) -> Self {
        HearthError::Io(err)
    }
}

impl From<ResilienceError> for HearthError {
    fn from(err: ResilienceError) -> Self {
        HearthError::Resilience(err)
    }
}

impl From<toml::de::Error> for HearthError {
    fn from(err: toml::de::Error) -> Self {
        HearthError::Config(format!("TOML parse error: {}", err))
    }
}

impl From<serde_json::Error> for HearthError {
    fn from(err: serde_json::Error) -> Self {
        HearthError::Other(format!("JSON error: {}", err))
    }
}
