//! Sequence cache
//!
//! Per-account record of the last authoritative sequence number, the value
//! handed to the next caller, and how many numbers are outstanding. All
//! mutation happens while the caller holds the account's gate; reads hand out
//! copies.

use crate::SequenceNumber;
use dashmap::DashMap;
use serde::Serialize;
use tracing::debug;

/// Point-in-time copy of an account's sequence state
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SequenceInfo {
    /// Account the state belongs to
    pub account_id: String,

    /// Last value fetched from the authoritative source
    pub current: SequenceNumber,

    /// Most recently issued value
    ///
    /// Right after a refresh this is the next value to hand out, not yet
    /// issued: the first issuance after the refresh returns this same value,
    /// and later ones advance it by one.
    pub next: SequenceNumber,

    /// Sequence numbers issued but not yet confirmed or failed
    pub pending_count: usize,

    /// Time of the last authoritative fetch (Unix milliseconds)
    pub last_fetched_at: u64,

    /// Whether this value was served from cache
    pub cached: bool,
}

/// Cached sequence state for one account
#[derive(Debug, Clone)]
pub(crate) struct AccountSequenceState {
    account_id: String,
    current: SequenceNumber,
    next: SequenceNumber,
    pending_count: usize,
    last_fetched_at: u64,
    cached: bool,
    /// False only between a refresh and the first issuance after it
    next_issued: bool,
}

impl AccountSequenceState {
    /// State after a fetch that immediately issues `fetched + 1`
    fn issued_from_fetch(account_id: &str, fetched: SequenceNumber, now: u64) -> Self {
        Self {
            account_id: account_id.to_string(),
            next: fetched.successor(),
            current: fetched,
            pending_count: 1,
            last_fetched_at: now,
            cached: false,
            next_issued: true,
        }
    }

    /// State after a refresh that reconciles against live reservations
    fn reconciled(account_id: &str, fetched: SequenceNumber, live_pending: usize, now: u64) -> Self {
        Self {
            account_id: account_id.to_string(),
            next: fetched.advance(live_pending + 1),
            current: fetched,
            pending_count: live_pending,
            last_fetched_at: now,
            cached: false,
            next_issued: false,
        }
    }

    /// Check whether the cached value is still inside the TTL window
    pub fn is_fresh(&self, now: u64, ttl_ms: u64) -> bool {
        now.saturating_sub(self.last_fetched_at) < ttl_ms
    }

    /// Hand out the next sequence number from cache
    fn issue_cached(&mut self) {
        if self.next_issued {
            self.next = self.next.successor();
        }
        self.next_issued = true;
        self.pending_count += 1;
        self.cached = true;
    }

    fn release_one(&mut self) {
        self.pending_count = self.pending_count.saturating_sub(1);
    }

    /// Age of the cached value (milliseconds)
    pub fn age_ms(&self, now: u64) -> u64 {
        now.saturating_sub(self.last_fetched_at)
    }

    pub fn info(&self) -> SequenceInfo {
        SequenceInfo {
            account_id: self.account_id.clone(),
            current: self.current.clone(),
            next: self.next.clone(),
            pending_count: self.pending_count,
            last_fetched_at: self.last_fetched_at,
            cached: self.cached,
        }
    }
}

/// Sequence states of all tracked accounts
#[derive(Debug, Default)]
pub(crate) struct SequenceCache {
    states: DashMap<String, AccountSequenceState>,
}

impl SequenceCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue from cache if the account's state is within `ttl_ms`
    pub fn issue_cached(&self, account_id: &str, now: u64, ttl_ms: u64) -> Option<SequenceInfo> {
        let mut state = self.states.get_mut(account_id)?;
        if !state.is_fresh(now, ttl_ms) {
            debug!(
                "Cached sequence for {} is stale ({} ms old)",
                account_id,
                state.age_ms(now)
            );
            return None;
        }

        state.issue_cached();
        debug!("Issued cached sequence {} for {}", state.next, account_id);
        Some(state.info())
    }

    /// Replace the account's state with a fresh fetch and issue `fetched + 1`
    pub fn store_fetched(&self, account_id: &str, fetched: SequenceNumber, now: u64) -> SequenceInfo {
        let state = AccountSequenceState::issued_from_fetch(account_id, fetched, now);
        let info = state.info();
        self.states.insert(account_id.to_string(), state);
        info
    }

    /// Replace the account's state with a fetch reconciled against live reservations
    pub fn store_reconciled(
        &self,
        account_id: &str,
        fetched: SequenceNumber,
        live_pending: usize,
        now: u64,
    ) -> SequenceInfo {
        let state = AccountSequenceState::reconciled(account_id, fetched, live_pending, now);
        let info = state.info();
        self.states.insert(account_id.to_string(), state);
        info
    }

    /// Decrement the outstanding count, floored at zero
    pub fn release(&self, account_id: &str) {
        if let Some(mut state) = self.states.get_mut(account_id) {
            state.release_one();
        }
    }

    pub fn get(&self, account_id: &str) -> Option<SequenceInfo> {
        self.states.get(account_id).map(|state| state.info())
    }

    /// Copies of every state, with each state's cache age at `now`
    pub fn snapshot_all(&self, now: u64) -> Vec<(SequenceInfo, u64)> {
        self.states
            .iter()
            .map(|entry| (entry.value().info(), entry.value().age_ms(now)))
            .collect()
    }

    pub fn remove(&self, account_id: &str) -> bool {
        self.states.remove(account_id).is_some()
    }

    pub fn accounts(&self) -> Vec<String> {
        self.states.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: u64 = 30_000;

    fn seq(value: u64) -> SequenceNumber {
        SequenceNumber::from(value)
    }

    #[test]
    fn test_fetch_then_cached_issuance() {
        let cache = SequenceCache::new();

        let first = cache.store_fetched("GABC", seq(100), 1_000);
        assert_eq!(first.current, seq(100));
        assert_eq!(first.next, seq(101));
        assert_eq!(first.pending_count, 1);
        assert!(!first.cached);

        let second = cache.issue_cached("GABC", 2_000, TTL).unwrap();
        assert_eq!(second.next, seq(102));
        assert_eq!(second.pending_count, 2);
        assert!(second.cached);
        assert_eq!(second.last_fetched_at, 1_000);
    }

    #[test]
    fn test_stale_state_is_not_issued() {
        let cache = SequenceCache::new();
        cache.store_fetched("GABC", seq(100), 1_000);

        assert!(cache.issue_cached("GABC", 1_000 + TTL, TTL).is_none());
        // Stale check leaves the state untouched
        let info = cache.get("GABC").unwrap();
        assert_eq!(info.next, seq(101));
        assert_eq!(info.pending_count, 1);
    }

    #[test]
    fn test_unknown_account_is_not_issued() {
        let cache = SequenceCache::new();
        assert!(cache.issue_cached("GABC", 0, TTL).is_none());
    }

    #[test]
    fn test_reconciled_state_issues_without_gap() {
        let cache = SequenceCache::new();

        let refreshed = cache.store_reconciled("GABC", seq(100), 2, 5_000);
        assert_eq!(refreshed.next, seq(103));
        assert_eq!(refreshed.pending_count, 2);
        assert!(!refreshed.cached);

        let issued = cache.issue_cached("GABC", 5_001, TTL).unwrap();
        assert_eq!(issued.next, seq(103));
        assert_eq!(issued.pending_count, 3);

        let issued = cache.issue_cached("GABC", 5_002, TTL).unwrap();
        assert_eq!(issued.next, seq(104));
        assert_eq!(issued.pending_count, 4);
    }

    #[test]
    fn test_release_floors_at_zero() {
        let cache = SequenceCache::new();
        cache.store_fetched("GABC", seq(7), 0);

        cache.release("GABC");
        cache.release("GABC");
        assert_eq!(cache.get("GABC").unwrap().pending_count, 0);

        // Unknown account is ignored
        cache.release("GXYZ");
        assert!(cache.get("GXYZ").is_none());
    }

    #[test]
    fn test_snapshot_is_a_copy() {
        let cache = SequenceCache::new();
        cache.store_fetched("GABC", seq(1), 0);

        let before = cache.get("GABC").unwrap();
        cache.issue_cached("GABC", 1, TTL);
        assert_eq!(before.next, seq(2));
        assert_eq!(cache.get("GABC").unwrap().next, seq(3));

        let all = cache.snapshot_all(250);
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].1, 250);
    }
}
