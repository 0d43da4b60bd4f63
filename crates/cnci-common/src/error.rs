//! Error types for concentrator operations.
//!
//! Validation errors and kernel errors are deliberately distinct variants:
//! the former mean the request itself is bad and must not be retried, the
//! latter mean the host refused an operation that may succeed later.

use std::io;
use thiserror::Error;

/// Result type alias for concentrator operations.
pub type CnciResult<T> = Result<T, CnciError>;

/// Errors that can occur while managing the tenant overlay topology.
#[derive(Debug, Error)]
pub enum CnciError {
    /// A request carried a malformed or missing field.
    #[error("Invalid {field}: {message}")]
    InvalidInput {
        /// The offending field (e.g. "subnet", "subnet_key", "peer_ip").
        field: String,
        /// What was wrong with it.
        message: String,
    },

    /// Startup configuration could not be resolved against the host.
    #[error("Configuration error: {message}")]
    Config {
        /// Error message.
        message: String,
    },

    /// A device, address, neighbor or route operation was rejected by the
    /// kernel adapter.
    #[error("Kernel operation {operation} failed for {alias}: {message}")]
    Kernel {
        /// The operation that failed (e.g. "create", "attach", "neigh add").
        operation: String,
        /// The logical alias (or kernel name) of the device involved.
        alias: String,
        /// Error message.
        message: String,
    },

    /// The unique device-name generator ran out of attempts.
    #[error("No free kernel device name derivable from '{base}'")]
    NameExhausted {
        /// The base name the generator started from.
        base: String,
    },

    /// Live kernel state contradicts itself (e.g. a subnet tunnel whose
    /// bridge is missing during rebuild).
    #[error("Inconsistent topology at {alias}: {message}")]
    Inconsistent {
        /// The alias where the inconsistency was detected.
        alias: String,
        /// Error message.
        message: String,
    },

    /// Waiting for a device reservation to become ready exceeded the API
    /// timeout, or the creator released the gate after failing.
    #[error("Timed out waiting for device {alias}")]
    Timeout {
        /// The alias that never became ready.
        alias: String,
    },

    /// The DHCP supervisor could not start, attach to, or stop an instance.
    #[error("DHCP failure on bridge {bridge}: {message}")]
    Dhcp {
        /// The bridge alias the instance is bound to.
        bridge: String,
        /// Error message.
        message: String,
    },

    /// A shell command could not be spawned at all.
    #[error("Failed to execute shell command '{command}': {source}")]
    ShellExec {
        /// The command that failed to execute.
        command: String,
        /// The underlying IO error.
        #[source]
        source: io::Error,
    },

    /// A shell command ran but returned a non-zero exit code.
    #[error("Shell command failed: '{command}' (exit code {exit_code}): {output}")]
    ShellCommandFailed {
        /// The command that failed.
        command: String,
        /// The exit code.
        exit_code: i32,
        /// Combined stdout/stderr output.
        output: String,
    },
}

impl CnciError {
    /// Creates an invalid-input error.
    pub fn invalid_input(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidInput {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Creates a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates a kernel adapter error.
    pub fn kernel(
        operation: impl Into<String>,
        alias: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Kernel {
            operation: operation.into(),
            alias: alias.into(),
            message: message.into(),
        }
    }

    /// Creates an inconsistent-topology error.
    pub fn inconsistent(alias: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Inconsistent {
            alias: alias.into(),
            message: message.into(),
        }
    }

    /// Creates a readiness timeout error.
    pub fn timeout(alias: impl Into<String>) -> Self {
        Self::Timeout {
            alias: alias.into(),
        }
    }

    /// Creates a DHCP supervision error.
    pub fn dhcp(bridge: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Dhcp {
            bridge: bridge.into(),
            message: message.into(),
        }
    }

    /// Returns true if this error indicates a transient condition that may
    /// succeed on retry. Validation and configuration errors never do.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CnciError::Kernel { .. }
                | CnciError::Timeout { .. }
                | CnciError::Dhcp { .. }
                | CnciError::ShellCommandFailed { .. }
        )
    }
}
