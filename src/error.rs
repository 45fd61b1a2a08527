//! Error types for the sequence coordinator

use thiserror::Error;

/// Boxed error produced by an authoritative sequence source
pub type FetchError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Coordinator error type
#[derive(Error, Debug)]
pub enum Error {
    /// Accepting a reservation would exceed the per-account pending cap
    #[error("Too many pending transactions for account {account_id}: limit {limit}")]
    ResourceExhausted {
        /// Account at its cap
        account_id: String,
        /// Configured cap
        limit: usize,
    },

    /// The authoritative sequence source failed
    #[error("Failed to fetch authoritative sequence for account {account_id}")]
    UpstreamFetch {
        /// Account being fetched
        account_id: String,
        /// Error returned by the source, unmodified
        #[source]
        source: FetchError,
    },

    /// Value is not a decimal unsigned integer
    #[error("Invalid sequence number: {0:?}")]
    InvalidSequence(String),

    /// Configuration rejected at construction
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Coordinator was destroyed
    #[error("Sequence coordinator has been shut down")]
    Shutdown,
}

impl Error {
    /// True when the caller should wait for outstanding transactions to resolve
    pub fn is_resource_exhausted(&self) -> bool {
        matches!(self, Error::ResourceExhausted { .. })
    }

    /// True when the failure came from the authoritative source
    pub fn is_upstream(&self) -> bool {
        matches!(self, Error::UpstreamFetch { .. })
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
