//! Startup error taxonomy and process exit codes
//!
//! Runtime errors never reach this module: they are counted and logged.
//! Only failures that prevent the engine from starting carry an exit code.

use std::path::PathBuf;

use thiserror::Error;

/// Fatal startup failures, mapped to process exit codes.
#[derive(Debug, Error)]
pub enum StartupError {
    /// Configuration file missing, unparseable, or invalid
    #[error("configuration error: {0}")]
    Config(String),

    /// Model artifact missing, unparseable, or shape mismatch
    #[error("model artifact error in {path}: {reason}")]
    ModelArtifact { path: PathBuf, reason: String },

    /// The OS denied raw capture on the interface
    #[error("insufficient privilege to capture on {interface}")]
    CapturePrivilege { interface: String },

    /// Named capture interface does not exist
    #[error("capture interface not found: {interface}")]
    InterfaceNotFound { interface: String },

    /// Storage could not be opened or written at startup
    #[error("storage unwritable: {0}")]
    Storage(String),
}

impl StartupError {
    /// Exit code for a CLI wrapper (sysexits-compatible)
    pub fn exit_code(&self) -> i32 {
        match self {
            StartupError::Config(_) => 64,
            StartupError::ModelArtifact { .. } => 65,
            StartupError::CapturePrivilege { .. } => 77,
            StartupError::InterfaceNotFound { .. } => 77,
            StartupError::Storage(_) => 74,
        }
    }
}

/// Resolve the exit code for an error chain, defaulting to 1.
pub fn exit_code_for(err: &anyhow::Error) -> i32 {
    err.downcast_ref::<StartupError>()
        .map(|e| e.exit_code())
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(StartupError::Config("x".into()).exit_code(), 64);
        assert_eq!(
            StartupError::ModelArtifact {
                path: PathBuf::from("m.json"),
                reason: "bad".into()
            }
            .exit_code(),
            65
        );
        assert_eq!(
            StartupError::CapturePrivilege {
                interface: "eth0".into()
            }
            .exit_code(),
            77
        );
        assert_eq!(StartupError::Storage("disk".into()).exit_code(), 74);
    }

    #[test]
    fn test_exit_code_for_anyhow() {
        let err = anyhow::Error::new(StartupError::Config("missing interface".into()));
        assert_eq!(exit_code_for(&err), 64);

        let plain = anyhow::anyhow!("something else");
        assert_eq!(exit_code_for(&plain), 1);
    }
}
