//! Authoritative sequence source
//!
//! The coordinator never talks to the network. Callers inject the lookup that
//! returns an account's current sequence number as a decimal string, and the
//! auto-refresh scheduler keeps a handle to it for periodic use.

use crate::error::FetchError;
use async_trait::async_trait;
use std::future::Future;

/// Source of truth for an account's current sequence number
#[async_trait]
pub trait SequenceSource: Send + Sync + 'static {
    /// Fetch the current sequence number as a decimal string
    async fn fetch_sequence(&self) -> Result<String, FetchError>;
}

#[async_trait]
impl<F, Fut, E> SequenceSource for F
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<String, E>> + Send + 'static,
    E: Into<FetchError> + 'static,
{
    async fn fetch_sequence(&self) -> Result<String, FetchError> {
        (self)().await.map_err(Into::into)
    }
}
