//! Failure taxonomy and exit-code mapping.
//!
//! Every stage failure is classified into one of these variants before it
//! propagates out of a pipeline; raw I/O or parse errors never escape a
//! stage unwrapped. Each variant maps to a stable process exit code so
//! schedulers and wrapper scripts can distinguish failure categories.

use thiserror::Error;

pub const EXIT_OK: i32 = 0;
pub const EXIT_FAILURE: i32 = 1;
pub const EXIT_CONFIG_MISSING: i32 = 2;
pub const EXIT_IDENTITY_MISSING: i32 = 3;
pub const EXIT_MEMORY: i32 = 4;
pub const EXIT_LOCK: i32 = 5;
pub const EXIT_PORT: i32 = 10;

/// Classified stage failure.
#[derive(Debug, Error)]
pub enum StageError {
    /// The external process could not be launched at all.
    #[error("could not start '{command}': {source}")]
    Start {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// The external process ran but returned a nonzero status.
    #[error("'{command}' exited with status {status}")]
    Exit { command: String, status: i32 },

    #[error("insufficient memory: {0}")]
    MemoryInsufficient(String),

    #[error("insufficient disk space: {0}")]
    DiskInsufficient(String),

    #[error("validation port unreachable: {0}")]
    PortUnreachable(String),

    /// A remote registration/enrollment call kept failing.
    #[error("{operation} failed after {attempts} attempt(s): {detail}")]
    NetworkTransient {
        operation: String,
        attempts: u32,
        detail: String,
    },

    /// Explicit "no"/"quit" at a confirmation. Never downgraded.
    #[error("operator declined: {0}")]
    OperatorDeclined(String),

    #[error("another instance is already running{}", holder.map(|p| format!(" (pid {p})")).unwrap_or_default())]
    LockContention { holder: Option<u32> },

    #[error("configuration missing: {0}")]
    ConfigMissing(String),

    #[error("identity key material missing: {0}")]
    IdentityMissing(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StageError {
    /// Process exit code for this failure category.
    pub fn exit_code(&self) -> i32 {
        match self {
            StageError::ConfigMissing(_) => EXIT_CONFIG_MISSING,
            StageError::IdentityMissing(_) => EXIT_IDENTITY_MISSING,
            StageError::MemoryInsufficient(_) | StageError::DiskInsufficient(_) => EXIT_MEMORY,
            StageError::LockContention { .. } => EXIT_LOCK,
            StageError::PortUnreachable(_) => EXIT_PORT,
            _ => EXIT_FAILURE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_are_distinct_per_category() {
        let cases = [
            (StageError::ConfigMissing("x".into()), EXIT_CONFIG_MISSING),
            (StageError::IdentityMissing("x".into()), EXIT_IDENTITY_MISSING),
            (StageError::MemoryInsufficient("x".into()), EXIT_MEMORY),
            (StageError::LockContention { holder: None }, EXIT_LOCK),
            (StageError::PortUnreachable("x".into()), EXIT_PORT),
            (
                StageError::Exit {
                    command: "ant".into(),
                    status: 2,
                },
                EXIT_FAILURE,
            ),
        ];
        for (err, code) in cases {
            assert_eq!(err.exit_code(), code);
        }
    }

    #[test]
    fn operator_declined_is_generic_failure() {
        let err = StageError::OperatorDeclined("overwrite?".into());
        assert_eq!(err.exit_code(), EXIT_FAILURE);
    }
}
