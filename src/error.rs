//! Error handling module for groundwork
//!
//! Provides centralized error handling with proper error types using thiserror.
//! All errors in the installer core should use these types for consistency.

use thiserror::Error;

/// Main error type for groundwork
#[derive(Error, Debug)]
pub enum InstallError {
    /// IO errors (file operations, working directory setup, etc.)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Usage errors (no install sources, malformed source descriptor)
    #[error("Usage error: {0}")]
    Usage(String),

    /// Configuration errors (bad proxy/kexec/power_state shape, bad target dir)
    #[error("Configuration error: {0}")]
    Config(String),

    /// A stage command could not be started at all
    #[error("Failed to launch command {command:?}: {source}")]
    ProcessLaunch {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// A stage command started but exited non-zero
    #[error("Command {command:?} exited {exit_code}")]
    ProcessExecution {
        command: String,
        exit_code: i32,
        output: String,
    },

    /// YAML serialization/deserialization errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for installer operations
pub type Result<T> = std::result::Result<T, InstallError>;

// Convenient error constructors
impl InstallError {
    /// Create a usage error
    pub fn usage(msg: impl Into<String>) -> Self {
        Self::Usage(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = InstallError::usage("no sources provided to install");
        assert_eq!(
            err.to_string(),
            "Usage error: no sources provided to install"
        );

        let err = InstallError::config("provided target dir was not empty");
        assert_eq!(
            err.to_string(),
            "Configuration error: provided target dir was not empty"
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: InstallError = io_err.into();
        assert!(matches!(err, InstallError::Io(_)));
    }

    #[test]
    fn test_process_execution_carries_diagnostics() {
        let err = InstallError::ProcessExecution {
            command: "mkfs.ext4 /dev/sda1".to_string(),
            exit_code: 1,
            output: "mkfs.ext4: no such device".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("mkfs.ext4"));
        assert!(msg.contains('1'));
    }
}
