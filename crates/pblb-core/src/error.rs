//! Error types for pblb

use thiserror::Error;

/// Main error type for pblb
#[derive(Error, Debug)]
pub enum PblbError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Not enough nodes configured for the selected method
    #[error("At least {required} nodes are required for {method}, {found} found")]
    InsufficientNodes {
        /// Load balancing method that rejected the node list
        method: String,
        /// Minimum number of nodes the method needs
        required: usize,
        /// Number of nodes actually configured
        found: usize,
    },

    /// Network error
    #[error("Network error: {0}")]
    Network(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for pblb operations
pub type PblbResult<T> = Result<T, PblbError>;

impl From<toml::de::Error> for PblbError {
    fn from(err: toml::de::Error) -> Self {
        PblbError::Config(err.to_string())
    }
}
