//! # Sequence Coordinator
//!
//! Account-scoped sequence number and pending transaction coordinator for
//! ledgers where every account owns a single mutable sequence counter.
//!
//! This crate provides:
//! - Per-account exclusive gates so concurrent callers never share a number
//! - A TTL-bounded sequence cache fed by an injected authoritative source
//! - Pending transaction tracking (pending, submitted, confirmed, failed)
//! - Periodic background refresh of tracked accounts
//! - Point-in-time statistics
//!
//! The coordinator keeps everything in memory and never talks to the network
//! itself.

#![warn(missing_docs, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod cache;
mod coordinator;
mod error;
mod gate;
mod pending;
mod refresh;
mod sequence;
mod source;

pub use cache::SequenceInfo;
pub use coordinator::{AccountStats, CoordinatorConfig, CoordinatorStats, SequenceCoordinator};
pub use error::{Error, FetchError, Result};
pub use gate::{AccountGates, AccountGuard};
pub use pending::{LedgerStatistics, Metadata, PendingStatus, PendingTransaction};
pub use sequence::SequenceNumber;
pub use source::SequenceSource;
