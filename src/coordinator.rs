//! Sequence coordinator
//!
//! Composes the sequence cache, the pending ledger, the per-account gates and
//! the auto-refresh scheduler behind one handle. Every mutation of an
//! account's state happens while holding that account's gate; reads return
//! copies and never take the gate.

use crate::cache::{SequenceCache, SequenceInfo};
use crate::gate::AccountGates;
use crate::pending::{Metadata, PendingLedger, PendingStatus, PendingTransaction};
use crate::refresh::RefreshScheduler;
use crate::{Error, Result, SequenceNumber, SequenceSource};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Coordinator configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// How long a fetched sequence may be served from cache (milliseconds)
    pub cache_ttl_ms: u64,

    /// Maximum live reservations per account
    pub max_pending_transactions: usize,

    /// Re-fetch tracked accounts in the background
    pub auto_refresh: bool,

    /// Interval between background refreshes (milliseconds)
    pub refresh_interval_ms: u64,

    /// Fail reservations older than this (milliseconds); disabled when unset
    pub pending_timeout_ms: Option<u64>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            cache_ttl_ms: 30_000,            // 30 seconds
            max_pending_transactions: 100,
            auto_refresh: true,
            refresh_interval_ms: 10_000,     // 10 seconds
            pending_timeout_ms: None,
        }
    }
}

impl CoordinatorConfig {
    /// Check the configuration for values the coordinator cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.cache_ttl_ms == 0 {
            return Err(Error::InvalidConfig("cache_ttl_ms must be positive".into()));
        }
        if self.max_pending_transactions == 0 {
            return Err(Error::InvalidConfig(
                "max_pending_transactions must be positive".into(),
            ));
        }
        if self.auto_refresh && self.refresh_interval_ms == 0 {
            return Err(Error::InvalidConfig(
                "refresh_interval_ms must be positive when auto_refresh is enabled".into(),
            ));
        }
        if self.pending_timeout_ms == Some(0) {
            return Err(Error::InvalidConfig("pending_timeout_ms must be positive".into()));
        }
        Ok(())
    }
}

/// Per-account entry of [`CoordinatorStats`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccountStats {
    /// Tracked account
    pub account_id: String,

    /// Issued sequence numbers not yet confirmed or failed
    pub pending_count: usize,

    /// Most recently issued sequence number
    pub next: SequenceNumber,

    /// Whether the last issuance came from cache
    pub cached: bool,

    /// Unix milliseconds
    pub last_fetched_at: u64,

    /// Time since the last authoritative fetch (milliseconds)
    pub cache_age_ms: u64,
}

/// Point-in-time coordinator statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CoordinatorStats {
    /// Accounts with cached sequence state
    pub tracked_accounts: usize,

    /// Live pending transactions across all accounts
    pub total_pending: usize,

    /// Live transactions already submitted
    pub submitted_transactions: usize,

    /// Tracked accounts, ordered by account id
    pub accounts: Vec<AccountStats>,
}

/// Current time provider (Unix milliseconds)
type Clock = Box<dyn Fn() -> u64 + Send + Sync>;

fn system_clock() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

struct Shared {
    config: CoordinatorConfig,
    cache: SequenceCache,
    ledger: PendingLedger,
    gates: AccountGates,
    scheduler: RefreshScheduler,
    clock: Clock,
    destroyed: AtomicBool,
}

/// Account sequence coordinator
///
/// Hands out unique, increasing sequence numbers per account and tracks the
/// transactions using them until their outcome is known:
/// 1. `get_next_sequence` yields a candidate (from cache or a fresh fetch)
/// 2. `reserve_sequence` claims it
/// 3. `mark_submitted` records the broadcast
/// 4. `mark_confirmed` / `mark_failed` release it
///
/// Cloning is cheap; clones share state. Background refresh tasks hold a
/// weak handle, upgraded only while a tick touches state, so dropping the
/// last clone stops them even while a refresh fetch is pending.
#[derive(Clone)]
pub struct SequenceCoordinator {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for SequenceCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SequenceCoordinator")
            .field("config", &self.shared.config)
            .field("tracked_accounts", &self.shared.cache.len())
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

impl SequenceCoordinator {
    /// Create a coordinator using the system clock
    pub fn new(config: CoordinatorConfig) -> Result<Self> {
        Self::with_clock(config, system_clock)
    }

    /// Create a coordinator reading time from `clock` (Unix milliseconds)
    pub fn with_clock<C>(config: CoordinatorConfig, clock: C) -> Result<Self>
    where
        C: Fn() -> u64 + Send + Sync + 'static,
    {
        config.validate()?;

        let shared = Shared {
            cache: SequenceCache::new(),
            ledger: PendingLedger::new(config.max_pending_transactions),
            gates: AccountGates::new(),
            scheduler: RefreshScheduler::new(Duration::from_millis(config.refresh_interval_ms)),
            clock: Box::new(clock),
            destroyed: AtomicBool::new(false),
            config,
        };

        Ok(Self {
            shared: Arc::new(shared),
        })
    }

    /// Coordinator configuration
    pub fn config(&self) -> &CoordinatorConfig {
        &self.shared.config
    }

    fn now(&self) -> u64 {
        (self.shared.clock)()
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_destroyed() {
            return Err(Error::Shutdown);
        }
        Ok(())
    }

    fn from_weak(weak: &Weak<Shared>) -> Option<Self> {
        weak.upgrade().map(|shared| Self { shared })
    }

    /// Undo state stored by a call that raced with `destroy`
    ///
    /// `destroy` raises the flag before it looks up the accounts to clear, so
    /// a store that lands after that lookup is caught here.
    fn discard_if_destroyed(&self, account_id: &str) -> Result<()> {
        if !self.is_destroyed() {
            return Ok(());
        }
        self.shared.scheduler.cancel(account_id);
        self.shared.cache.remove(account_id);
        self.shared.ledger.remove_account(account_id);
        debug!("Discarded state for {} stored during shutdown", account_id);
        Err(Error::Shutdown)
    }

    /// Get the next sequence number for the account
    ///
    /// Served from cache while the last fetch is younger than the TTL;
    /// otherwise `source` is called exactly once. A failed fetch leaves the
    /// account's state untouched.
    pub async fn get_next_sequence<S: SequenceSource>(
        &self,
        account_id: &str,
        source: S,
    ) -> Result<SequenceInfo> {
        self.ensure_running()?;
        let _guard = self.shared.gates.acquire(account_id).await;
        self.ensure_running()?;

        let ttl_ms = self.shared.config.cache_ttl_ms;
        if let Some(info) = self.shared.cache.issue_cached(account_id, self.now(), ttl_ms) {
            return Ok(info);
        }

        let fetched = fetch_authoritative(account_id, &source).await?;
        // destroy may have run while the fetch was in flight
        self.ensure_running()?;

        let info = self.shared.cache.store_fetched(account_id, fetched, self.now());
        info!(
            "Fetched sequence {} for {}, issuing {}",
            info.current, account_id, info.next
        );

        if self.shared.config.auto_refresh {
            self.arm_auto_refresh(account_id, Arc::new(source));
        }

        self.discard_if_destroyed(account_id)?;
        Ok(info)
    }

    /// Re-fetch the account's sequence and reconcile it with live reservations
    pub async fn refresh_sequence<S: SequenceSource>(
        &self,
        account_id: &str,
        source: S,
    ) -> Result<SequenceInfo> {
        self.refresh_with(account_id, &source).await
    }

    async fn refresh_with(
        &self,
        account_id: &str,
        source: &dyn SequenceSource,
    ) -> Result<SequenceInfo> {
        self.ensure_running()?;
        let _guard = self.shared.gates.acquire(account_id).await;
        self.ensure_running()?;

        let fetched = fetch_authoritative(account_id, source).await?;
        self.store_refresh(account_id, fetched)
    }

    /// Apply a refresh result; the caller holds the account's gate
    fn store_refresh(&self, account_id: &str, fetched: SequenceNumber) -> Result<SequenceInfo> {
        self.ensure_running()?;

        let live_pending = self.shared.ledger.count(account_id);
        let info = self
            .shared
            .cache
            .store_reconciled(account_id, fetched, live_pending, self.now());
        info!(
            "Refreshed sequence {} for {} ({} pending, next {})",
            info.current, account_id, live_pending, info.next
        );

        self.discard_if_destroyed(account_id)?;
        Ok(info)
    }

    fn arm_auto_refresh(&self, account_id: &str, source: Arc<dyn SequenceSource>) {
        let weak = Arc::downgrade(&self.shared);
        let account = account_id.to_string();

        self.shared.scheduler.schedule(account_id, move || {
            auto_refresh_tick(weak.clone(), account.clone(), source.clone())
        });
    }

    /// Reserve a sequence number for a transaction
    ///
    /// Returns `Ok(None)` when the sequence is already reserved for the
    /// account, and `Error::ResourceExhausted` when the account is at its
    /// pending cap.
    pub async fn reserve_sequence(
        &self,
        account_id: &str,
        sequence: SequenceNumber,
        metadata: Option<Metadata>,
    ) -> Result<Option<PendingTransaction>> {
        self.ensure_running()?;
        self.shared
            .gates
            .with_account_lock(account_id, || async {
                self.ensure_running()?;
                let reserved = self
                    .shared
                    .ledger
                    .reserve(account_id, sequence, metadata, self.now())?;
                self.discard_if_destroyed(account_id)?;
                Ok(reserved)
            })
            .await
    }

    /// Record that the reserved transaction was broadcast as `hash`
    pub async fn mark_submitted(
        &self,
        account_id: &str,
        sequence: &SequenceNumber,
        hash: impl Into<String>,
    ) {
        let hash = hash.into();
        self.shared
            .gates
            .with_account_lock(account_id, || async {
                if !self
                    .shared
                    .ledger
                    .mark_submitted(account_id, sequence, hash, self.now())
                {
                    debug!("No live reservation {} for {} to submit", sequence, account_id);
                }
            })
            .await
    }

    /// Record that the transaction was included in the ledger
    pub async fn mark_confirmed(&self, account_id: &str, sequence: &SequenceNumber) {
        self.finalize(account_id, sequence, PendingStatus::Confirmed)
            .await
    }

    /// Record that the transaction failed or was abandoned
    pub async fn mark_failed(&self, account_id: &str, sequence: &SequenceNumber) {
        self.finalize(account_id, sequence, PendingStatus::Failed)
            .await
    }

    async fn finalize(&self, account_id: &str, sequence: &SequenceNumber, status: PendingStatus) {
        self.shared
            .gates
            .with_account_lock(account_id, || async {
                if self
                    .shared
                    .ledger
                    .finalize(account_id, sequence, status)
                    .is_some()
                {
                    self.shared.cache.release(account_id);
                }
            })
            .await
    }

    /// Fail reservations older than `pending_timeout_ms`
    ///
    /// Returns how many were expired. Does nothing when no timeout is
    /// configured.
    pub async fn expire_stale_pending(&self, account_id: &str) -> usize {
        if self.shared.config.pending_timeout_ms.is_none() {
            return 0;
        }

        self.shared
            .gates
            .with_account_lock(account_id, || async { self.expire_stale_locked(account_id) })
            .await
    }

    /// Expire stale reservations; the caller holds the account's gate
    fn expire_stale_locked(&self, account_id: &str) -> usize {
        let Some(timeout_ms) = self.shared.config.pending_timeout_ms else {
            return 0;
        };

        let cutoff = self.now().saturating_sub(timeout_ms);
        let expired = self.shared.ledger.expire_before(account_id, cutoff);
        for _ in &expired {
            self.shared.cache.release(account_id);
        }
        if !expired.is_empty() {
            warn!(
                "Expired {} stale pending transactions for {}",
                expired.len(),
                account_id
            );
        }
        expired.len()
    }

    /// Fail stale reservations of every account
    pub async fn expire_all_stale_pending(&self) -> usize {
        let mut count = 0;
        for account_id in self.shared.ledger.accounts() {
            count += self.expire_stale_pending(&account_id).await;
        }
        count
    }

    /// Copies of the account's live reservations, in reservation order
    pub fn get_pending_transactions(&self, account_id: &str) -> Vec<PendingTransaction> {
        self.shared.ledger.list(account_id)
    }

    /// Copy of one live reservation
    pub fn get_pending_transaction(
        &self,
        account_id: &str,
        sequence: &SequenceNumber,
    ) -> Option<PendingTransaction> {
        self.shared.ledger.get(account_id, sequence)
    }

    /// Copy of the account's cached sequence state
    pub fn get_sequence_info(&self, account_id: &str) -> Option<SequenceInfo> {
        self.shared.cache.get(account_id)
    }

    /// Whether a background refresh task is running for the account
    pub fn is_auto_refreshing(&self, account_id: &str) -> bool {
        self.shared.scheduler.is_scheduled(account_id)
    }

    /// Get coordinator statistics
    pub fn get_stats(&self) -> CoordinatorStats {
        let now = self.now();
        let ledger_stats = self.shared.ledger.get_statistics();

        let mut accounts: Vec<AccountStats> = self
            .shared
            .cache
            .snapshot_all(now)
            .into_iter()
            .map(|(info, cache_age_ms)| AccountStats {
                account_id: info.account_id,
                pending_count: info.pending_count,
                next: info.next,
                cached: info.cached,
                last_fetched_at: info.last_fetched_at,
                cache_age_ms,
            })
            .collect();
        accounts.sort_by(|a, b| a.account_id.cmp(&b.account_id));

        CoordinatorStats {
            tracked_accounts: accounts.len(),
            total_pending: ledger_stats.total_count,
            submitted_transactions: ledger_stats.submitted_count,
            accounts,
        }
    }

    /// Forget the account: cached state, reservations and its refresh task
    pub async fn clear_account(&self, account_id: &str) {
        let guard = self.shared.gates.acquire(account_id).await;

        self.shared.scheduler.cancel(account_id);
        let had_state = self.shared.cache.remove(account_id);
        let dropped = self.shared.ledger.remove_account(account_id);

        drop(guard);
        self.shared.gates.release_idle(account_id);

        if had_state || dropped > 0 {
            info!(
                "Cleared account {} ({} pending transactions dropped)",
                account_id, dropped
            );
        }
    }

    /// Forget every tracked account
    ///
    /// Works from a snapshot of the tracked accounts. An account whose first
    /// fetch is still in flight is not tracked yet, so it is not cleared and
    /// that call still stores its result; only `destroy` rejects it.
    pub async fn clear_all(&self) {
        self.shared.scheduler.cancel_all();

        let accounts: BTreeSet<String> = self
            .shared
            .cache
            .accounts()
            .into_iter()
            .chain(self.shared.ledger.accounts())
            .collect();
        for account_id in &accounts {
            self.clear_account(account_id).await;
        }

        self.shared.gates.release_all_idle();
        info!("Cleared {} accounts", accounts.len());
    }

    /// Clear everything and stop all background work
    ///
    /// Later calls to `get_next_sequence`, `refresh_sequence` and
    /// `reserve_sequence` fail with `Error::Shutdown`. Calls already in
    /// flight fail the same way when their fetch returns and store nothing.
    /// Waits for in-flight operations on tracked accounts to leave their gate.
    pub async fn destroy(&self) {
        if self.shared.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.clear_all().await;
        self.shared.scheduler.cancel_all();
        info!("Sequence coordinator destroyed");
    }

    /// Whether `destroy` has been called
    pub fn is_destroyed(&self) -> bool {
        self.shared.destroyed.load(Ordering::SeqCst)
    }
}

async fn fetch_authoritative(
    account_id: &str,
    source: &dyn SequenceSource,
) -> Result<SequenceNumber> {
    let raw = source
        .fetch_sequence()
        .await
        .map_err(|source| Error::UpstreamFetch {
            account_id: account_id.to_string(),
            source,
        })?;
    raw.parse()
}

/// One background refresh of the account
///
/// A strong handle to the coordinator is held only while state is touched,
/// never while waiting on the gate or the source, so dropping the last
/// handle mid-tick frees the coordinator and aborts the task.
async fn auto_refresh_tick(
    weak: Weak<Shared>,
    account_id: String,
    source: Arc<dyn SequenceSource>,
) -> ControlFlow<()> {
    let acquiring = match SequenceCoordinator::from_weak(&weak) {
        Some(coordinator) if !coordinator.is_destroyed() => {
            coordinator.shared.gates.acquire_detached(&account_id)
        }
        _ => return ControlFlow::Break(()),
    };
    let _guard = acquiring.await;

    match SequenceCoordinator::from_weak(&weak) {
        Some(coordinator) if !coordinator.is_destroyed() => {
            coordinator.expire_stale_locked(&account_id);
        }
        _ => return ControlFlow::Break(()),
    }

    let fetched = fetch_authoritative(&account_id, source.as_ref()).await;

    let Some(coordinator) = SequenceCoordinator::from_weak(&weak) else {
        return ControlFlow::Break(());
    };
    match fetched.and_then(|fetched| coordinator.store_refresh(&account_id, fetched)) {
        Ok(info) => {
            debug!("Auto-refresh for {} now at {}", account_id, info.current);
            ControlFlow::Continue(())
        }
        Err(Error::Shutdown) => ControlFlow::Break(()),
        Err(e) => {
            warn!("Auto-refresh for {} failed: {}", account_id, e);
            ControlFlow::Continue(())
        }
    }
}
