//! Pending transaction ledger
//!
//! Tracks reserved sequence numbers from reservation through submission until
//! the network outcome is known. Confirmed and failed entries are removed on
//! the spot; the ledger keeps no history.

use crate::{Error, Result, SequenceNumber};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info, warn};

/// Opaque caller-supplied data attached to a reservation
pub type Metadata = serde_json::Value;

/// Status of a reserved sequence number
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingStatus {
    /// Reserved, not yet broadcast
    Pending,

    /// Broadcast to the network, outcome unknown
    Submitted,

    /// Included in the ledger
    Confirmed,

    /// Rejected or abandoned
    Failed,
}

impl PendingStatus {
    /// Check if this is a terminal status
    pub fn is_terminal(&self) -> bool {
        matches!(self, PendingStatus::Confirmed | PendingStatus::Failed)
    }
}

impl std::fmt::Display for PendingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PendingStatus::Pending => write!(f, "pending"),
            PendingStatus::Submitted => write!(f, "submitted"),
            PendingStatus::Confirmed => write!(f, "confirmed"),
            PendingStatus::Failed => write!(f, "failed"),
        }
    }
}

/// A reserved sequence number and its lifecycle
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingTransaction {
    /// Reserved sequence number
    pub sequence: SequenceNumber,

    /// Transaction hash, once submitted
    pub hash: Option<String>,

    /// Reservation timestamp (Unix milliseconds)
    pub created_at: u64,

    /// Submission timestamp (Unix milliseconds, if submitted)
    pub submitted_at: Option<u64>,

    /// Current status
    pub status: PendingStatus,

    /// Caller metadata, never interpreted here
    pub metadata: Option<Metadata>,
}

impl PendingTransaction {
    /// Create a new pending reservation
    pub fn new_pending(sequence: SequenceNumber, created_at: u64, metadata: Option<Metadata>) -> Self {
        Self {
            sequence,
            hash: None,
            created_at,
            submitted_at: None,
            status: PendingStatus::Pending,
            metadata,
        }
    }

    fn mark_submitted(&mut self, timestamp: u64, hash: String) {
        self.status = PendingStatus::Submitted;
        self.submitted_at = Some(timestamp);
        self.hash = Some(hash);
    }

    /// Time since reservation (milliseconds)
    pub fn age_ms(&self, now: u64) -> u64 {
        now.saturating_sub(self.created_at)
    }
}

/// Live reservations of one account, kept in reservation order
#[derive(Debug, Default)]
struct AccountLedger {
    entries: BTreeMap<u64, PendingTransaction>,
    slots: HashMap<SequenceNumber, u64>,
    next_slot: u64,
}

impl AccountLedger {
    fn insert(&mut self, tx: PendingTransaction) {
        let slot = self.next_slot;
        self.next_slot += 1;
        self.slots.insert(tx.sequence.clone(), slot);
        self.entries.insert(slot, tx);
    }

    fn entry_mut(&mut self, sequence: &SequenceNumber) -> Option<&mut PendingTransaction> {
        let slot = self.slots.get(sequence)?;
        self.entries.get_mut(slot)
    }

    fn remove(&mut self, sequence: &SequenceNumber) -> Option<PendingTransaction> {
        let slot = self.slots.remove(sequence)?;
        self.entries.remove(&slot)
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Pending ledger statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LedgerStatistics {
    /// Live entries across all accounts
    pub total_count: usize,

    /// Entries not yet submitted
    pub pending_count: usize,

    /// Entries broadcast and awaiting an outcome
    pub submitted_count: usize,

    /// Accounts with at least one live entry
    pub account_count: usize,
}

/// Reservations of all accounts
///
/// Mutating calls must be made while holding the account's gate.
#[derive(Debug)]
pub(crate) struct PendingLedger {
    accounts: DashMap<String, AccountLedger>,
    max_pending: usize,
}

impl PendingLedger {
    /// Create a ledger capped at `max_pending` live entries per account
    pub fn new(max_pending: usize) -> Self {
        Self {
            accounts: DashMap::new(),
            max_pending,
        }
    }

    /// Reserve `sequence` for the account
    ///
    /// Returns `Ok(None)` if the sequence is already reserved.
    pub fn reserve(
        &self,
        account_id: &str,
        sequence: SequenceNumber,
        metadata: Option<Metadata>,
        now: u64,
    ) -> Result<Option<PendingTransaction>> {
        let mut ledger = self.accounts.entry(account_id.to_string()).or_default();

        if ledger.slots.contains_key(&sequence) {
            warn!("Sequence {} already reserved for {}", sequence, account_id);
            return Ok(None);
        }

        if ledger.len() >= self.max_pending {
            warn!(
                "Rejecting reservation of {} for {}: {} pending transactions",
                sequence,
                account_id,
                ledger.len()
            );
            return Err(Error::ResourceExhausted {
                account_id: account_id.to_string(),
                limit: self.max_pending,
            });
        }

        let tx = PendingTransaction::new_pending(sequence, now, metadata);
        ledger.insert(tx.clone());
        debug!("Reserved sequence {} for {}", tx.sequence, account_id);

        Ok(Some(tx))
    }

    /// Attach a hash and move the entry to `Submitted`
    ///
    /// Returns false when no live entry exists.
    pub fn mark_submitted(
        &self,
        account_id: &str,
        sequence: &SequenceNumber,
        hash: String,
        now: u64,
    ) -> bool {
        let Some(mut ledger) = self.accounts.get_mut(account_id) else {
            return false;
        };
        let Some(tx) = ledger.entry_mut(sequence) else {
            return false;
        };

        tx.mark_submitted(now, hash);
        debug!(
            "Sequence {} for {} submitted as {}",
            sequence,
            account_id,
            tx.hash.as_deref().unwrap_or_default()
        );
        true
    }

    /// Move a live entry to a terminal status and drop it
    ///
    /// Returns the final record, or `None` when no live entry exists.
    pub fn finalize(
        &self,
        account_id: &str,
        sequence: &SequenceNumber,
        status: PendingStatus,
    ) -> Option<PendingTransaction> {
        debug_assert!(status.is_terminal());

        let mut tx = {
            let mut ledger = self.accounts.get_mut(account_id)?;
            ledger.remove(sequence)?
        };
        self.accounts.remove_if(account_id, |_, ledger| ledger.len() == 0);

        tx.status = status;
        match status {
            PendingStatus::Failed => warn!("Sequence {} for {} failed", sequence, account_id),
            _ => info!("Sequence {} for {} {}", sequence, account_id, status),
        }
        Some(tx)
    }

    /// Fail and drop every entry reserved before `cutoff`
    pub fn expire_before(&self, account_id: &str, cutoff: u64) -> Vec<PendingTransaction> {
        let stale: Vec<SequenceNumber> = match self.accounts.get(account_id) {
            Some(ledger) => ledger
                .entries
                .values()
                .filter(|tx| tx.created_at < cutoff)
                .map(|tx| tx.sequence.clone())
                .collect(),
            None => return Vec::new(),
        };

        stale
            .iter()
            .filter_map(|sequence| self.finalize(account_id, sequence, PendingStatus::Failed))
            .collect()
    }

    /// Copy of one live entry
    pub fn get(&self, account_id: &str, sequence: &SequenceNumber) -> Option<PendingTransaction> {
        let ledger = self.accounts.get(account_id)?;
        let slot = ledger.slots.get(sequence)?;
        ledger.entries.get(slot).cloned()
    }

    /// Copies of the account's live entries in reservation order
    pub fn list(&self, account_id: &str) -> Vec<PendingTransaction> {
        self.accounts
            .get(account_id)
            .map(|ledger| ledger.entries.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn count(&self, account_id: &str) -> usize {
        self.accounts
            .get(account_id)
            .map(|ledger| ledger.len())
            .unwrap_or(0)
    }

    pub fn accounts(&self) -> Vec<String> {
        self.accounts.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Drop every entry of the account, returning how many were live
    pub fn remove_account(&self, account_id: &str) -> usize {
        self.accounts
            .remove(account_id)
            .map(|(_, ledger)| ledger.len())
            .unwrap_or(0)
    }

    /// Get statistics about live entries
    pub fn get_statistics(&self) -> LedgerStatistics {
        let mut stats = LedgerStatistics::default();

        for entry in self.accounts.iter() {
            let ledger = entry.value();
            if ledger.len() > 0 {
                stats.account_count += 1;
            }

            for tx in ledger.entries.values() {
                match tx.status {
                    PendingStatus::Pending => stats.pending_count += 1,
                    PendingStatus::Submitted => stats.submitted_count += 1,
                    PendingStatus::Confirmed | PendingStatus::Failed => {}
                }
                stats.total_count += 1;
            }
        }

        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn seq(value: u64) -> SequenceNumber {
        SequenceNumber::from(value)
    }

    #[test]
    fn test_lifecycle_transitions() {
        let ledger = PendingLedger::new(100);

        let tx = ledger
            .reserve("GABC", seq(101), Some(json!({"memo": "payout"})), 1_000)
            .unwrap()
            .unwrap();
        assert_eq!(tx.status, PendingStatus::Pending);
        assert_eq!(tx.created_at, 1_000);
        assert_eq!(tx.metadata, Some(json!({"memo": "payout"})));

        assert!(ledger.mark_submitted("GABC", &seq(101), "abcd".to_string(), 1_500));
        let tx = ledger.get("GABC", &seq(101)).unwrap();
        assert_eq!(tx.status, PendingStatus::Submitted);
        assert_eq!(tx.hash.as_deref(), Some("abcd"));
        assert_eq!(tx.submitted_at, Some(1_500));

        let done = ledger
            .finalize("GABC", &seq(101), PendingStatus::Confirmed)
            .unwrap();
        assert_eq!(done.status, PendingStatus::Confirmed);
        assert!(ledger.get("GABC", &seq(101)).is_none());
        assert_eq!(ledger.count("GABC"), 0);
        assert!(ledger.accounts().is_empty());
    }

    #[test]
    fn test_duplicate_reservation_returns_none() {
        let ledger = PendingLedger::new(100);

        assert!(ledger.reserve("GABC", seq(101), None, 0).unwrap().is_some());
        assert!(ledger.reserve("GABC", seq(101), None, 0).unwrap().is_none());
        // Same sequence on another account is independent
        assert!(ledger.reserve("GXYZ", seq(101), None, 0).unwrap().is_some());
        assert_eq!(ledger.count("GABC"), 1);
    }

    #[test]
    fn test_max_capacity() {
        let ledger = PendingLedger::new(10);

        for i in 0..10 {
            assert!(ledger.reserve("GABC", seq(100 + i), None, 0).unwrap().is_some());
        }

        let result = ledger.reserve("GABC", seq(110), None, 0);
        assert!(matches!(
            result,
            Err(Error::ResourceExhausted { limit: 10, .. })
        ));

        // A duplicate at capacity is still reported as a duplicate
        assert!(ledger.reserve("GABC", seq(100), None, 0).unwrap().is_none());

        ledger.finalize("GABC", &seq(100), PendingStatus::Failed);
        assert!(ledger.reserve("GABC", seq(110), None, 0).unwrap().is_some());
    }

    #[test]
    fn test_unknown_entries_are_ignored() {
        let ledger = PendingLedger::new(10);

        assert!(!ledger.mark_submitted("GABC", &seq(1), "h".to_string(), 0));
        assert!(ledger.finalize("GABC", &seq(1), PendingStatus::Confirmed).is_none());

        ledger.reserve("GABC", seq(1), None, 0).unwrap();
        ledger.finalize("GABC", &seq(1), PendingStatus::Failed);
        // Already terminal
        assert!(!ledger.mark_submitted("GABC", &seq(1), "h".to_string(), 0));
        assert!(ledger.finalize("GABC", &seq(1), PendingStatus::Confirmed).is_none());
    }

    #[test]
    fn test_list_preserves_reservation_order() {
        let ledger = PendingLedger::new(10);
        for value in [105, 101, 103] {
            ledger.reserve("GABC", seq(value), None, value).unwrap();
        }

        let mut listed = ledger.list("GABC");
        let order: Vec<_> = listed.iter().map(|tx| tx.sequence.clone()).collect();
        assert_eq!(order, vec![seq(105), seq(101), seq(103)]);

        // Copies never alias internal storage
        listed[0].status = PendingStatus::Failed;
        assert_eq!(ledger.get("GABC", &seq(105)).unwrap().status, PendingStatus::Pending);
    }

    #[test]
    fn test_expire_before() {
        let ledger = PendingLedger::new(10);
        ledger.reserve("GABC", seq(1), None, 1_000).unwrap();
        ledger.reserve("GABC", seq(2), None, 5_000).unwrap();
        ledger.mark_submitted("GABC", &seq(1), "h1".to_string(), 1_100);

        let expired = ledger.expire_before("GABC", 2_000);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].sequence, seq(1));
        assert_eq!(expired[0].status, PendingStatus::Failed);
        assert_eq!(ledger.count("GABC"), 1);

        assert!(ledger.expire_before("GXYZ", u64::MAX).is_empty());
    }

    #[test]
    fn test_statistics() {
        let ledger = PendingLedger::new(10);
        for i in 0..5 {
            ledger.reserve("GABC", seq(i), None, 0).unwrap();
            if i < 3 {
                ledger.mark_submitted("GABC", &seq(i), format!("hash-{i}"), 0);
            }
        }
        ledger.reserve("GXYZ", seq(9), None, 0).unwrap();

        let stats = ledger.get_statistics();
        assert_eq!(stats.total_count, 6);
        assert_eq!(stats.pending_count, 3);
        assert_eq!(stats.submitted_count, 3);
        assert_eq!(stats.account_count, 2);

        assert_eq!(ledger.remove_account("GABC"), 5);
        assert_eq!(ledger.get_statistics().total_count, 1);
    }
}
