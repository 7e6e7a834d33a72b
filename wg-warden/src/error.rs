// Error taxonomy for the warden core

//! Error types
//!
//! Every failure the core can report to the operator-facing layer. Ledger
//! corruption is the one kind that never escapes: loaders recover it to an
//! empty store and only log it.

use std::time::Duration;
use thiserror::Error;

/// Result type alias for warden operations
pub type Result<T> = std::result::Result<T, Error>;

/// Warden error types
#[derive(Error, Debug)]
pub enum Error {
    /// Peer (or its delimited config block) does not exist
    #[error("Peer not found: {0}")]
    NotFound(String),

    /// An external daemon command exited non-zero, could not be spawned, or timed out
    #[error("Daemon call `{command}` failed: {reason}")]
    DaemonCallFailed { command: String, reason: String },

    /// Codec payload failed length or container validation
    #[error("Corrupt payload: {0}")]
    CorruptPayload(String),

    /// Endpoint host could not be resolved to an address
    #[error("Could not resolve DNS name '{0}'")]
    ResolutionFailed(String),

    /// Ledger file unreadable; callers recover this to an empty store
    #[error("Ledger {path} is corrupt: {reason}")]
    StoreCorrupt { path: String, reason: String },

    /// Another operation held the peer longer than the configured bound
    #[error("Timed out after {waited:?} waiting for peer {peer}")]
    LockTimeout { peer: String, waited: Duration },

    /// Name is not safe to embed in config markers or command arguments
    #[error("Invalid name: '{0}'. Only alphanumeric, hyphens, and underscores are allowed")]
    InvalidName(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Build a `DaemonCallFailed` from a command line and any displayable reason
    pub fn daemon(command: impl Into<String>, reason: impl ToString) -> Self {
        Error::DaemonCallFailed {
            command: command.into(),
            reason: reason.to_string(),
        }
    }
}

/// Validates that a name (peer or interface) is safe to use in config markers
/// and as a command argument.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty()
        || !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(Error::InvalidName(name.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_name_valid() {
        assert!(validate_name("wg0").is_ok());
        assert!(validate_name("awg0").is_ok());
        assert!(validate_name("alice-phone").is_ok());
        assert!(validate_name("bob_laptop_2").is_ok());
    }

    #[test]
    fn test_validate_name_invalid() {
        assert!(validate_name("").is_err());
        assert!(validate_name("alice bob").is_err());
        assert!(validate_name("wg0; rm -rf /").is_err());
        assert!(validate_name("$(whoami)").is_err());
        assert!(validate_name("alice\n# END_PEER bob").is_err());
        assert!(validate_name("../etc").is_err());
    }

    #[test]
    fn test_error_messages() {
        let err = Error::daemon("awg syncconf awg0", "exit status 1");
        assert_eq!(
            err.to_string(),
            "Daemon call `awg syncconf awg0` failed: exit status 1"
        );
        assert_eq!(
            Error::NotFound("alice".into()).to_string(),
            "Peer not found: alice"
        );
    }
}
