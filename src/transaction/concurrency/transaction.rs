use std::collections::{HashMap, HashSet};
use std::fmt;
use parking_lot::Mutex;
use thiserror::Error;

use crate::common::types::{PageId, Rid, TableOid, TxnId};
use crate::transaction::concurrency::lock_manager::LockMode;

/// Transaction isolation levels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
}

/// Two-phase locking states plus the terminal outcomes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Growing,
    Shrinking,
    Committed,
    Aborted,
}

/// Why the lock manager aborted a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    LockOnShrinking,
    LockSharedOnReadUncommitted,
    UpgradeConflict,
    IncompatibleUpgrade,
    TableLockNotPresent,
    TableUnlockedBeforeUnlockingRows,
    AttemptedUnlockButNoLockHeld,
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::LockOnShrinking => "lock requested while shrinking",
            Self::LockSharedOnReadUncommitted => "shared lock requested under READ_UNCOMMITTED",
            Self::UpgradeConflict => "another transaction is already upgrading",
            Self::IncompatibleUpgrade => "requested upgrade is incompatible",
            Self::TableLockNotPresent => "row lock without a fitting table lock",
            Self::TableUnlockedBeforeUnlockingRows => "table unlocked before its row locks",
            Self::AttemptedUnlockButNoLockHeld => "unlock of a lock that is not held",
        };
        f.write_str(text)
    }
}

/// Errors surfaced by the lock manager; protocol violations also move the
/// transaction to ABORTED
#[derive(Error, Debug)]
pub enum TransactionError {
    #[error("transaction {txn_id} aborted: {reason}")]
    TransactionAbort { txn_id: TxnId, reason: AbortReason },

    #[error("transaction {0} was aborted while waiting for a lock")]
    AbortedWhileWaiting(TxnId),

    #[error("transaction {0} requested an intention lock on a row")]
    IntentionLockOnRow(TxnId),

    #[error("transaction {0} is already committed or aborted")]
    InvalidState(TxnId),

    #[error("transaction {0} is not registered")]
    UnknownTransaction(TxnId),
}

/// An active transaction: 2PL state, isolation level, and the bookkeeping the
/// lock manager and index maintain on its behalf.
///
/// Shared across threads as `Arc<Transaction>`; every mutable piece sits
/// behind its own small mutex so the deadlock detector can flip the state of
/// a blocked victim.
pub struct Transaction {
    id: TxnId,
    isolation_level: IsolationLevel,
    state: Mutex<TransactionState>,

    shared_table_locks: Mutex<HashSet<TableOid>>,
    exclusive_table_locks: Mutex<HashSet<TableOid>>,
    intention_shared_table_locks: Mutex<HashSet<TableOid>>,
    intention_exclusive_table_locks: Mutex<HashSet<TableOid>>,
    shared_intention_exclusive_table_locks: Mutex<HashSet<TableOid>>,

    shared_row_locks: Mutex<HashMap<TableOid, HashSet<Rid>>>,
    exclusive_row_locks: Mutex<HashMap<TableOid, HashSet<Rid>>>,

    deleted_pages: Mutex<Vec<PageId>>,
}

impl Transaction {
    pub fn new(id: TxnId, isolation_level: IsolationLevel) -> Self {
        Self {
            id,
            isolation_level,
            state: Mutex::new(TransactionState::Growing),
            shared_table_locks: Mutex::new(HashSet::new()),
            exclusive_table_locks: Mutex::new(HashSet::new()),
            intention_shared_table_locks: Mutex::new(HashSet::new()),
            intention_exclusive_table_locks: Mutex::new(HashSet::new()),
            shared_intention_exclusive_table_locks: Mutex::new(HashSet::new()),
            shared_row_locks: Mutex::new(HashMap::new()),
            exclusive_row_locks: Mutex::new(HashMap::new()),
            deleted_pages: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn isolation_level(&self) -> IsolationLevel {
        self.isolation_level
    }

    pub fn state(&self) -> TransactionState {
        *self.state.lock()
    }

    pub fn set_state(&self, state: TransactionState) {
        *self.state.lock() = state;
    }

    fn table_lock_set(&self, mode: LockMode) -> &Mutex<HashSet<TableOid>> {
        match mode {
            LockMode::Shared => &self.shared_table_locks,
            LockMode::Exclusive => &self.exclusive_table_locks,
            LockMode::IntentionShared => &self.intention_shared_table_locks,
            LockMode::IntentionExclusive => &self.intention_exclusive_table_locks,
            LockMode::SharedIntentionExclusive => &self.shared_intention_exclusive_table_locks,
        }
    }

    pub fn is_table_locked(&self, oid: TableOid, mode: LockMode) -> bool {
        self.table_lock_set(mode).lock().contains(&oid)
    }

    pub(crate) fn record_table_lock(&self, mode: LockMode, oid: TableOid) {
        self.table_lock_set(mode).lock().insert(oid);
    }

    pub(crate) fn erase_table_lock(&self, mode: LockMode, oid: TableOid) {
        self.table_lock_set(mode).lock().remove(&oid);
    }

    fn row_lock_map(&self, mode: LockMode) -> &Mutex<HashMap<TableOid, HashSet<Rid>>> {
        match mode {
            LockMode::Shared => &self.shared_row_locks,
            LockMode::Exclusive => &self.exclusive_row_locks,
            _ => unreachable!("row locks are never intention locks"),
        }
    }

    pub fn is_row_locked(&self, oid: TableOid, rid: Rid, mode: LockMode) -> bool {
        self.row_lock_map(mode)
            .lock()
            .get(&oid)
            .is_some_and(|rows| rows.contains(&rid))
    }

    /// Number of row locks of either mode still held on a table
    pub fn row_lock_count(&self, oid: TableOid) -> usize {
        let shared = self
            .shared_row_locks
            .lock()
            .get(&oid)
            .map_or(0, |rows| rows.len());
        let exclusive = self
            .exclusive_row_locks
            .lock()
            .get(&oid)
            .map_or(0, |rows| rows.len());
        shared + exclusive
    }

    pub(crate) fn record_row_lock(&self, mode: LockMode, oid: TableOid, rid: Rid) {
        self.row_lock_map(mode).lock().entry(oid).or_default().insert(rid);
    }

    pub(crate) fn erase_row_lock(&self, mode: LockMode, oid: TableOid, rid: Rid) {
        if let Some(rows) = self.row_lock_map(mode).lock().get_mut(&oid) {
            rows.remove(&rid);
        }
    }

    /// Every lock currently held, rows first, for release on commit/abort
    pub(crate) fn held_locks(&self) -> (Vec<(LockMode, TableOid, Rid)>, Vec<(LockMode, TableOid)>) {
        let mut rows = Vec::new();
        for (mode, map) in [
            (LockMode::Shared, &self.shared_row_locks),
            (LockMode::Exclusive, &self.exclusive_row_locks),
        ] {
            for (oid, rids) in map.lock().iter() {
                for rid in rids {
                    rows.push((mode, *oid, *rid));
                }
            }
        }

        let mut tables = Vec::new();
        for mode in [
            LockMode::Shared,
            LockMode::Exclusive,
            LockMode::IntentionShared,
            LockMode::IntentionExclusive,
            LockMode::SharedIntentionExclusive,
        ] {
            for oid in self.table_lock_set(mode).lock().iter() {
                tables.push((mode, *oid));
            }
        }
        (rows, tables)
    }

    /// Queue pages freed by index coalescing for deallocation after latch
    /// release
    pub fn add_deleted_pages(&self, pages: &[PageId]) {
        self.deleted_pages.lock().extend_from_slice(pages);
    }

    pub fn take_deleted_pages(&self) -> Vec<PageId> {
        std::mem::take(&mut self.deleted_pages.lock())
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("isolation_level", &self.isolation_level)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_transaction_is_growing() {
        let txn = Transaction::new(1, IsolationLevel::RepeatableRead);
        assert_eq!(txn.id(), 1);
        assert_eq!(txn.state(), TransactionState::Growing);
        assert_eq!(txn.isolation_level(), IsolationLevel::RepeatableRead);
    }

    #[test]
    fn test_table_lock_bookkeeping() {
        let txn = Transaction::new(2, IsolationLevel::ReadCommitted);
        txn.record_table_lock(LockMode::IntentionExclusive, 7);
        assert!(txn.is_table_locked(7, LockMode::IntentionExclusive));
        assert!(!txn.is_table_locked(7, LockMode::Exclusive));

        txn.erase_table_lock(LockMode::IntentionExclusive, 7);
        assert!(!txn.is_table_locked(7, LockMode::IntentionExclusive));
    }

    #[test]
    fn test_row_lock_bookkeeping() {
        let txn = Transaction::new(3, IsolationLevel::RepeatableRead);
        let rid = Rid::new(4, 2);
        txn.record_row_lock(LockMode::Exclusive, 7, rid);
        assert!(txn.is_row_locked(7, rid, LockMode::Exclusive));
        assert_eq!(txn.row_lock_count(7), 1);

        txn.erase_row_lock(LockMode::Exclusive, 7, rid);
        assert_eq!(txn.row_lock_count(7), 0);
    }

    #[test]
    fn test_deleted_pages_drain() {
        let txn = Transaction::new(4, IsolationLevel::RepeatableRead);
        txn.add_deleted_pages(&[5, 6]);
        assert_eq!(txn.take_deleted_pages(), vec![5, 6]);
        assert!(txn.take_deleted_pages().is_empty());
    }
}
