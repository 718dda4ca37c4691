//! Error handling for the group scheduler
//!
//! This module defines the error taxonomy shared by the carrier pool, the
//! group lifecycle and the shot scheduler, plus a Result alias.
//!
//! Errors fall into a few families:
//!
//! - **Topology**: rejected at configuration time, before any shot runs
//! - **Resource**: pool exhausted or carrier lost; fatal for one shot only
//! - **Interrupted**: a blocking wait was torn down; the shot unwinds cleanly
//! - **State**: an operation was issued in the wrong lifecycle phase

use thiserror::Error;

/// Main error type for group scheduler operations
#[derive(Error, Debug)]
pub enum GroupError {
    /// Chain could not be wired (missing junction, bad stage id)
    #[error("Topology error: {0}")]
    Topology(String),

    /// Operation issued in the wrong lifecycle state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Caller supplied an invalid argument
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The group is already open
    #[error("Group {0} is already open")]
    Busy(u32),

    /// Free carrier list was empty
    #[error("Carrier pool exhausted on stream {stream}")]
    PoolExhausted { stream: usize },

    /// A carrier for a frame tag could not be located or recovered
    #[error("Carrier for fcount {fcount} not found on group {group}")]
    CarrierNotFound { group: u32, fcount: u32 },

    /// A blocking wait was interrupted by teardown
    #[error("Wait interrupted")]
    Interrupted,

    /// The shot was abandoned and its frame completed with an error
    #[error("Shot cancelled: {0}")]
    Cancelled(String),

    /// The hardware-submission collaborator rejected a request
    #[error("Hardware error: {0}")]
    Hardware(String),

    /// Errors related to configuration loading/saving
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Generic errors with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<GroupError>,
    },
}

impl GroupError {
    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        GroupError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Negative errno as reported to the device layer
    pub fn errno(&self) -> i32 {
        match self {
            GroupError::Topology(_)
            | GroupError::InvalidArgument(_)
            | GroupError::InvalidState(_)
            | GroupError::Config(_)
            | GroupError::Serialization(_) => -libc::EINVAL,
            GroupError::Busy(_) => -libc::EMFILE,
            GroupError::PoolExhausted { .. } => -libc::ENOMEM,
            GroupError::CarrierNotFound { .. } => -libc::EFAULT,
            GroupError::Interrupted => -libc::EINTR,
            GroupError::Cancelled(_) => -libc::ECANCELED,
            GroupError::Hardware(_) | GroupError::Io(_) => -libc::EIO,
            GroupError::WithContext { source, .. } => source.errno(),
        }
    }

    /// True when the error only aborted a single shot
    pub fn is_shot_local(&self) -> bool {
        match self {
            GroupError::PoolExhausted { .. }
            | GroupError::CarrierNotFound { .. }
            | GroupError::Interrupted
            | GroupError::Cancelled(_)
            | GroupError::Hardware(_) => true,
            GroupError::WithContext { source, .. } => source.is_shot_local(),
            _ => false,
        }
    }
}

impl From<toml::de::Error> for GroupError {
    fn from(err: toml::de::Error) -> Self {
        GroupError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for GroupError {
    fn from(err: serde_json::Error) -> Self {
        GroupError::Serialization(err.to_string())
    }
}

/// Result type alias for group scheduler operations
pub type Result<T> = std::result::Result<T, GroupError>;

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error result
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context lazily to an error result
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| e.with_context(f()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = GroupError::Topology("junction subdev can not be found".to_string());
        assert_eq!(
            err.to_string(),
            "Topology error: junction subdev can not be found"
        );

        let err = GroupError::CarrierNotFound {
            group: 3,
            fcount: 42,
        };
        assert_eq!(err.to_string(), "Carrier for fcount 42 not found on group 3");
    }

    #[test]
    fn test_error_with_context() {
        let err = GroupError::Interrupted.with_context("Acquiring resource");
        assert_eq!(err.to_string(), "Acquiring resource: Wait interrupted");
        assert_eq!(err.errno(), -libc::EINTR);
    }

    #[test]
    fn test_result_ext() {
        let result: Result<()> = Err(GroupError::Busy(2));
        let with_ctx = result.context("Opening group");
        assert!(with_ctx.is_err());
        assert_eq!(
            with_ctx.unwrap_err().to_string(),
            "Opening group: Group 2 is already open"
        );
    }

    #[test]
    fn test_errno_mapping() {
        assert_eq!(GroupError::Busy(0).errno(), -libc::EMFILE);
        assert_eq!(
            GroupError::PoolExhausted { stream: 0 }.errno(),
            -libc::ENOMEM
        );
        assert_eq!(
            GroupError::InvalidState("x".into()).errno(),
            -libc::EINVAL
        );
    }

    #[test]
    fn test_shot_local() {
        assert!(GroupError::Interrupted.is_shot_local());
        assert!(GroupError::Cancelled("force stop".into())
            .with_context("shot")
            .is_shot_local());
        assert!(!GroupError::Topology("x".into()).is_shot_local());
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: GroupError = io_err.into();
        assert!(matches!(err, GroupError::Io(_)));
    }
}
