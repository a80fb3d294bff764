use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use parking_lot::Mutex;

use crate::common::types::TxnId;
use crate::transaction::concurrency::lock_manager::LockManager;
use crate::transaction::concurrency::transaction::{
    IsolationLevel, Transaction, TransactionError, TransactionState,
};

/// Transaction manager: creates and tracks transactions and drives lock
/// release at commit and abort. The deadlock detector resolves victim ids to
/// live transactions through this registry.
pub struct TransactionManager {
    next_txn_id: AtomicU32,
    lock_manager: Arc<LockManager>,
    active_transactions: Mutex<HashMap<TxnId, Arc<Transaction>>>,
}

impl TransactionManager {
    pub fn new(lock_manager: Arc<LockManager>) -> Self {
        Self {
            next_txn_id: AtomicU32::new(1),
            lock_manager,
            active_transactions: Mutex::new(HashMap::new()),
        }
    }

    pub fn lock_manager(&self) -> &Arc<LockManager> {
        &self.lock_manager
    }

    /// Begin a new transaction in the GROWING phase
    pub fn begin(&self, isolation_level: IsolationLevel) -> Arc<Transaction> {
        let txn_id = self.next_txn_id.fetch_add(1, Ordering::SeqCst);
        let txn = Arc::new(Transaction::new(txn_id, isolation_level));
        self.active_transactions.lock().insert(txn_id, txn.clone());
        txn
    }

    pub fn get(&self, txn_id: TxnId) -> Option<Arc<Transaction>> {
        self.active_transactions.lock().get(&txn_id).cloned()
    }

    /// Commit: release every held lock (rows before tables), then finalize
    pub fn commit(&self, txn_id: TxnId) -> Result<(), TransactionError> {
        let txn = self
            .active_transactions
            .lock()
            .remove(&txn_id)
            .ok_or(TransactionError::UnknownTransaction(txn_id))?;

        if matches!(
            txn.state(),
            TransactionState::Committed | TransactionState::Aborted
        ) {
            return Err(TransactionError::InvalidState(txn_id));
        }

        self.release_all_locks(&txn);
        txn.set_state(TransactionState::Committed);
        Ok(())
    }

    /// Abort: release every held lock and mark the transaction dead.
    /// Also the cleanup path for deadlock victims, whose state is already
    /// ABORTED when they arrive here.
    pub fn abort(&self, txn_id: TxnId) -> Result<(), TransactionError> {
        let txn = self
            .active_transactions
            .lock()
            .remove(&txn_id)
            .ok_or(TransactionError::UnknownTransaction(txn_id))?;

        if txn.state() == TransactionState::Committed {
            return Err(TransactionError::InvalidState(txn_id));
        }

        self.release_all_locks(&txn);
        txn.set_state(TransactionState::Aborted);
        Ok(())
    }

    fn release_all_locks(&self, txn: &Arc<Transaction>) {
        let (rows, tables) = txn.held_locks();
        for (_, oid, rid) in rows {
            if let Err(e) = self.lock_manager.unlock_row(txn, oid, rid) {
                log::debug!("releasing row lock for txn {}: {}", txn.id(), e);
            }
        }
        for (_, oid) in tables {
            if let Err(e) = self.lock_manager.unlock_table(txn, oid) {
                log::debug!("releasing table lock for txn {}: {}", txn.id(), e);
            }
        }
    }
}
