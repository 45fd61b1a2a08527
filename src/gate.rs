//! Per-account exclusion gate
//!
//! One async mutex per account, created on first use. Holding an account's
//! guard suspends every other acquirer for that account until the guard is
//! dropped, on every exit path. Different accounts never share a gate.

use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

/// Exclusive hold on one account's gate, released on drop
#[derive(Debug)]
pub struct AccountGuard {
    account_id: String,
    _guard: OwnedMutexGuard<()>,
}

impl AccountGuard {
    /// Account this guard holds
    pub fn account_id(&self) -> &str {
        &self.account_id
    }
}

/// Lazily created per-account gates
#[derive(Debug, Default)]
pub struct AccountGates {
    gates: DashMap<String, Arc<Mutex<()>>>,
}

impl AccountGates {
    /// Create an empty gate set
    pub fn new() -> Self {
        Self::default()
    }

    fn gate_for(&self, account_id: &str) -> Arc<Mutex<()>> {
        self.gates
            .entry(account_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Wait for exclusive access to the account
    pub async fn acquire(&self, account_id: &str) -> AccountGuard {
        self.acquire_detached(account_id).await
    }

    /// Like `acquire`, but the returned future does not borrow the gates
    ///
    /// The account's gate is resolved up front, so the map can be dropped
    /// while the caller is still waiting.
    pub fn acquire_detached(
        &self,
        account_id: &str,
    ) -> impl Future<Output = AccountGuard> + Send + 'static {
        // The map shard lock is released before awaiting the gate
        let gate = self.gate_for(account_id);
        let account_id = account_id.to_string();
        async move {
            AccountGuard {
                account_id,
                _guard: gate.lock_owned().await,
            }
        }
    }

    /// Run `f` while holding the account's gate
    pub async fn with_account_lock<F, Fut, T>(&self, account_id: &str, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _guard = self.acquire(account_id).await;
        f().await
    }

    /// Drop the account's gate if nobody holds or awaits it
    pub fn release_idle(&self, account_id: &str) -> bool {
        // Cloning a gate goes through the shard lock, so the count is stable here
        let removed = self
            .gates
            .remove_if(account_id, |_, gate| Arc::strong_count(gate) == 1)
            .is_some();
        if removed {
            debug!("Released idle gate for {}", account_id);
        }
        removed
    }

    /// Drop every gate nobody holds or awaits
    pub fn release_all_idle(&self) {
        self.gates.retain(|_, gate| Arc::strong_count(gate) > 1);
    }

    /// Number of gates currently allocated
    pub fn len(&self) -> usize {
        self.gates.len()
    }

    /// Whether no gate is allocated
    pub fn is_empty(&self) -> bool {
        self.gates.is_empty()
    }
}
