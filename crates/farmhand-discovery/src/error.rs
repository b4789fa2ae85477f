//! Error types for printer discovery.

use thiserror::Error;

/// Errors from discovery sessions.
#[derive(Error, Debug)]
pub enum DiscoveryError {
    /// The discovery socket could not be created or bound.
    #[error("socket setup failed: {0}")]
    SocketSetup(String),

    /// IO error.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Result type for discovery operations.
pub type Result<T> = std::result::Result<T, DiscoveryError>;
