use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use parking_lot::{Condvar, Mutex};

use crate::common::types::{Rid, TableOid, TxnId};
use crate::transaction::concurrency::transaction::{
    AbortReason, IsolationLevel, Transaction, TransactionError, TransactionState,
};
use crate::transaction::concurrency::transaction_manager::TransactionManager;

/// Multi-granularity lock modes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    Shared,
    Exclusive,
    IntentionShared,
    IntentionExclusive,
    SharedIntentionExclusive,
}

impl LockMode {
    fn is_intention(self) -> bool {
        matches!(
            self,
            Self::IntentionShared | Self::IntentionExclusive | Self::SharedIntentionExclusive
        )
    }
}

#[derive(Debug, Clone)]
struct LockRequest {
    txn_id: TxnId,
    mode: LockMode,
    granted: bool,
}

#[derive(Default)]
struct QueueState {
    requests: VecDeque<LockRequest>,
    /// At most one in-flight upgrade per queue
    upgrading: Option<TxnId>,
}

struct LockRequestQueue {
    state: Mutex<QueueState>,
    cv: Condvar,
}

impl LockRequestQueue {
    fn new() -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            cv: Condvar::new(),
        }
    }
}

struct WaitsFor {
    /// waiter -> holders it is blocked on; ordered maps keep detection
    /// deterministic
    edges: BTreeMap<TxnId, BTreeSet<TxnId>>,
    /// Transactions still participating in the current detection round
    active: BTreeMap<TxnId, bool>,
}

/// Lock manager: per-resource FIFO request queues for table and row locks
/// under strict two-phase locking, with a background waits-for-graph deadlock
/// detector.
pub struct LockManager {
    table_lock_map: Mutex<BTreeMap<TableOid, Arc<LockRequestQueue>>>,
    row_lock_map: Mutex<BTreeMap<Rid, Arc<LockRequestQueue>>>,
    waits_for: Mutex<WaitsFor>,
    cycle_detection_enabled: AtomicBool,
    cycle_detection_interval: Duration,
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new(Duration::from_millis(50))
    }
}

impl LockManager {
    pub fn new(cycle_detection_interval: Duration) -> Self {
        Self {
            table_lock_map: Mutex::new(BTreeMap::new()),
            row_lock_map: Mutex::new(BTreeMap::new()),
            waits_for: Mutex::new(WaitsFor {
                edges: BTreeMap::new(),
                active: BTreeMap::new(),
            }),
            cycle_detection_enabled: AtomicBool::new(false),
            cycle_detection_interval,
        }
    }

    /// Compatibility matrix: can a `requested` lock be granted alongside a
    /// `held` one
    fn compatible(held: LockMode, requested: LockMode) -> bool {
        use LockMode::*;
        if held == Exclusive || requested == Exclusive {
            return false;
        }
        if (held == Shared && requested == IntentionExclusive)
            || (held == IntentionExclusive && requested == Shared)
        {
            return false;
        }
        if (held == SharedIntentionExclusive && requested != IntentionShared)
            || (held != IntentionShared && requested == SharedIntentionExclusive)
        {
            return false;
        }
        true
    }

    /// Allowed upgrade paths: IS -> {S, X, IX, SIX}, S -> {X, SIX},
    /// IX -> {X, SIX}, SIX -> X
    fn can_upgrade(held: LockMode, requested: LockMode) -> bool {
        use LockMode::*;
        match held {
            IntentionShared => matches!(
                requested,
                Shared | Exclusive | IntentionExclusive | SharedIntentionExclusive
            ),
            Shared | IntentionExclusive => {
                matches!(requested, Exclusive | SharedIntentionExclusive)
            }
            SharedIntentionExclusive => requested == Exclusive,
            Exclusive => false,
        }
    }

    fn abort(txn: &Transaction, reason: AbortReason) -> TransactionError {
        txn.set_state(TransactionState::Aborted);
        TransactionError::TransactionAbort {
            txn_id: txn.id(),
            reason,
        }
    }

    /// Reject a request that the transaction's state and isolation level make
    /// illegal before it touches a queue
    fn admission_check(
        txn: &Transaction,
        mode: LockMode,
        is_row: bool,
    ) -> Result<(), TransactionError> {
        use IsolationLevel::*;
        use LockMode::*;

        match txn.state() {
            TransactionState::Committed | TransactionState::Aborted => {
                Err(TransactionError::InvalidState(txn.id()))
            }
            TransactionState::Growing => {
                if txn.isolation_level() == ReadUncommitted {
                    let shared_flavored = if is_row {
                        mode != Exclusive
                    } else {
                        matches!(mode, Shared | IntentionShared | SharedIntentionExclusive)
                    };
                    if shared_flavored {
                        return Err(Self::abort(txn, AbortReason::LockSharedOnReadUncommitted));
                    }
                }
                Ok(())
            }
            TransactionState::Shrinking => match txn.isolation_level() {
                RepeatableRead => Err(Self::abort(txn, AbortReason::LockOnShrinking)),
                ReadUncommitted => {
                    // Nothing is grantable while shrinking under RU; the
                    // write-flavored modes surface as 2PL violations, the
                    // rest as the isolation violation they already were
                    let write_flavored = if is_row {
                        mode == Exclusive
                    } else {
                        matches!(mode, Exclusive | IntentionExclusive)
                    };
                    if write_flavored {
                        Err(Self::abort(txn, AbortReason::LockOnShrinking))
                    } else {
                        Err(Self::abort(txn, AbortReason::LockSharedOnReadUncommitted))
                    }
                }
                ReadCommitted => {
                    let read_only = if is_row {
                        mode == Shared
                    } else {
                        matches!(mode, Shared | IntentionShared)
                    };
                    if read_only {
                        Ok(())
                    } else {
                        Err(Self::abort(txn, AbortReason::LockOnShrinking))
                    }
                }
            },
        }
    }

    fn table_queue(&self, oid: TableOid) -> Arc<LockRequestQueue> {
        self.table_lock_map
            .lock()
            .entry(oid)
            .or_insert_with(|| Arc::new(LockRequestQueue::new()))
            .clone()
    }

    fn row_queue(&self, rid: Rid) -> Arc<LockRequestQueue> {
        self.row_lock_map
            .lock()
            .entry(rid)
            .or_insert_with(|| Arc::new(LockRequestQueue::new()))
            .clone()
    }

    /// Add the request to the queue, or stage an upgrade of the
    /// transaction's existing request. A same-mode request is left alone.
    fn upsert_request(
        &self,
        txn: &Transaction,
        mode: LockMode,
        queue: &LockRequestQueue,
        bookkeeping: impl FnOnce(LockMode),
    ) -> Result<(), TransactionError> {
        let mut state = queue.state.lock();

        if let Some(pos) = state
            .requests
            .iter()
            .position(|r| r.txn_id == txn.id())
        {
            let held = state.requests[pos].mode;
            if held == mode {
                return Ok(());
            }

            if state.upgrading.is_some() {
                drop(state);
                return Err(Self::abort(txn, AbortReason::UpgradeConflict));
            }
            if !Self::can_upgrade(held, mode) {
                drop(state);
                return Err(Self::abort(txn, AbortReason::IncompatibleUpgrade));
            }

            // The old (granted) request leaves the queue; the upgrade waits
            // at the tail but is granted with priority
            state.upgrading = Some(txn.id());
            bookkeeping(held);
            state.requests.remove(pos);
            state.requests.push_back(LockRequest {
                txn_id: txn.id(),
                mode,
                granted: false,
            });
            log::debug!("txn {} staged upgrade to {:?}", txn.id(), mode);
            return Ok(());
        }

        state.requests.push_back(LockRequest {
            txn_id: txn.id(),
            mode,
            granted: false,
        });
        Ok(())
    }

    /// Grant whatever the queue's compatibility frontier allows and report
    /// whether this transaction's request is now granted. An in-flight
    /// upgrade belonging to the caller is granted before queue order.
    fn try_grant(state: &mut QueueState, txn_id: TxnId) -> bool {
        let our_mode = match state.requests.iter().find(|r| r.txn_id == txn_id) {
            Some(request) => {
                if request.granted {
                    return true;
                }
                request.mode
            }
            None => return false,
        };

        let mut granted_modes: Vec<LockMode> = state
            .requests
            .iter()
            .filter(|r| r.granted)
            .map(|r| r.mode)
            .collect();

        if granted_modes
            .iter()
            .any(|&held| !Self::compatible(held, our_mode))
        {
            return false;
        }

        if state.upgrading == Some(txn_id) {
            if let Some(request) = state
                .requests
                .iter_mut()
                .find(|r| r.txn_id == txn_id)
            {
                state.upgrading = None;
                request.granted = true;
                log::debug!("txn {} upgrade granted", txn_id);
                return true;
            }
        }

        // Non-strict FIFO: every waiting request compatible with the growing
        // granted set is granted, so compatible readers are not stuck behind
        // a later writer
        let mut ours_granted = false;
        for request in state.requests.iter_mut() {
            if request.granted {
                if request.txn_id == txn_id {
                    ours_granted = true;
                }
                continue;
            }
            let fits = granted_modes
                .iter()
                .all(|&held| Self::compatible(held, request.mode));
            if fits {
                request.granted = true;
                granted_modes.push(request.mode);
                if request.txn_id == txn_id {
                    ours_granted = true;
                }
            }
        }
        ours_granted
    }

    /// Block until this transaction's request in `queue` is granted, or until
    /// a deadlock abort unwinds it
    fn wait_for_grant(
        &self,
        txn: &Transaction,
        queue: &LockRequestQueue,
    ) -> Result<(), TransactionError> {
        let mut state = queue.state.lock();
        loop {
            if Self::try_grant(&mut state, txn.id()) {
                break;
            }
            queue.cv.wait(&mut state);

            if txn.state() == TransactionState::Aborted {
                // A deadlock victim removes its own request and fails the
                // operation
                if state.upgrading == Some(txn.id()) {
                    state.upgrading = None;
                }
                state.requests.retain(|r| r.txn_id != txn.id());
                queue.cv.notify_all();
                return Err(TransactionError::AbortedWhileWaiting(txn.id()));
            }
        }
        queue.cv.notify_all();
        Ok(())
    }

    /// Acquire a table lock, blocking until grantable
    pub fn lock_table(
        &self,
        txn: &Transaction,
        mode: LockMode,
        oid: TableOid,
    ) -> Result<(), TransactionError> {
        Self::admission_check(txn, mode, false)?;

        let queue = self.table_queue(oid);
        self.upsert_request(txn, mode, &queue, |held| txn.erase_table_lock(held, oid))?;
        self.wait_for_grant(txn, &queue)?;

        txn.record_table_lock(mode, oid);
        log::debug!("txn {} holds {:?} on table {}", txn.id(), mode, oid);
        Ok(())
    }

    /// Release a table lock; every row lock on the table must be gone first
    pub fn unlock_table(&self, txn: &Transaction, oid: TableOid) -> Result<(), TransactionError> {
        if txn.row_lock_count(oid) > 0 {
            return Err(Self::abort(
                txn,
                AbortReason::TableUnlockedBeforeUnlockingRows,
            ));
        }

        let queue = self.table_queue(oid);
        let mut state = queue.state.lock();
        if let Some(pos) = state
            .requests
            .iter()
            .position(|r| r.txn_id == txn.id() && r.granted)
        {
            let mode = state.requests[pos].mode;
            Self::transition_on_unlock(txn, mode);
            txn.erase_table_lock(mode, oid);
            state.requests.remove(pos);
            queue.cv.notify_all();
            return Ok(());
        }
        drop(state);

        Err(Self::abort(txn, AbortReason::AttemptedUnlockButNoLockHeld))
    }

    /// Acquire a row lock; the transaction must already hold a fitting
    /// intention lock on the table
    pub fn lock_row(
        &self,
        txn: &Transaction,
        mode: LockMode,
        oid: TableOid,
        rid: Rid,
    ) -> Result<(), TransactionError> {
        if mode.is_intention() {
            return Err(TransactionError::IntentionLockOnRow(txn.id()));
        }
        self.check_table_fit(txn, mode, oid)?;
        Self::admission_check(txn, mode, true)?;

        let queue = self.row_queue(rid);
        self.upsert_request(txn, mode, &queue, |held| txn.erase_row_lock(held, oid, rid))?;
        self.wait_for_grant(txn, &queue)?;

        txn.record_row_lock(mode, oid, rid);
        log::debug!("txn {} holds {:?} on row {}", txn.id(), mode, rid);
        Ok(())
    }

    /// Release a row lock
    pub fn unlock_row(
        &self,
        txn: &Transaction,
        oid: TableOid,
        rid: Rid,
    ) -> Result<(), TransactionError> {
        let queue = self.row_queue(rid);
        let mut state = queue.state.lock();
        if let Some(pos) = state
            .requests
            .iter()
            .position(|r| r.txn_id == txn.id() && r.granted)
        {
            let mode = state.requests[pos].mode;
            Self::transition_on_unlock(txn, mode);
            txn.erase_row_lock(mode, oid, rid);
            state.requests.remove(pos);
            queue.cv.notify_all();
            return Ok(());
        }
        drop(state);

        Err(Self::abort(txn, AbortReason::AttemptedUnlockButNoLockHeld))
    }

    /// An exclusive row lock needs IX/X/SIX on the table, a shared one any
    /// table lock at all
    fn check_table_fit(
        &self,
        txn: &Transaction,
        mode: LockMode,
        oid: TableOid,
    ) -> Result<(), TransactionError> {
        use LockMode::*;
        let fits = match mode {
            Exclusive => {
                txn.is_table_locked(oid, IntentionExclusive)
                    || txn.is_table_locked(oid, Exclusive)
                    || txn.is_table_locked(oid, SharedIntentionExclusive)
            }
            Shared => {
                txn.is_table_locked(oid, IntentionShared)
                    || txn.is_table_locked(oid, Shared)
                    || txn.is_table_locked(oid, IntentionExclusive)
                    || txn.is_table_locked(oid, SharedIntentionExclusive)
                    || txn.is_table_locked(oid, Exclusive)
            }
            _ => false,
        };
        if fits {
            Ok(())
        } else {
            Err(Self::abort(txn, AbortReason::TableLockNotPresent))
        }
    }

    /// Unlocking moves GROWING to SHRINKING when the isolation level says the
    /// released mode ends the growing phase
    fn transition_on_unlock(txn: &Transaction, mode: LockMode) {
        if txn.state() != TransactionState::Growing {
            return;
        }
        let shrink = match txn.isolation_level() {
            IsolationLevel::RepeatableRead => {
                matches!(mode, LockMode::Shared | LockMode::Exclusive)
            }
            IsolationLevel::ReadCommitted | IsolationLevel::ReadUncommitted => {
                mode == LockMode::Exclusive
            }
        };
        if shrink {
            txn.set_state(TransactionState::Shrinking);
            log::debug!("txn {} entered shrinking phase", txn.id());
        }
    }

    //
    // Deadlock detection
    //

    /// Record that `waiter` is blocked on `holder`
    pub fn add_edge(&self, waiter: TxnId, holder: TxnId) {
        let mut wf = self.waits_for.lock();
        wf.edges.entry(waiter).or_default().insert(holder);
        wf.active.insert(waiter, true);
        wf.active.insert(holder, true);
    }

    pub fn remove_edge(&self, waiter: TxnId, holder: TxnId) {
        let mut wf = self.waits_for.lock();
        if let Some(holders) = wf.edges.get_mut(&waiter) {
            holders.remove(&holder);
        }
    }

    /// Every edge as `(waiter, holder)`, in ascending order
    pub fn edge_list(&self) -> Vec<(TxnId, TxnId)> {
        let wf = self.waits_for.lock();
        wf.edges
            .iter()
            .flat_map(|(waiter, holders)| holders.iter().map(|holder| (*waiter, *holder)))
            .collect()
    }

    /// Search the waits-for graph for a cycle, always starting from the
    /// smallest unvisited transaction and exploring neighbours in ascending
    /// order. The victim is the largest id on the cycle path, and it is
    /// retired from the graph's active set.
    pub fn has_cycle(&self) -> Option<TxnId> {
        let mut wf = self.waits_for.lock();
        let mut visited = BTreeSet::new();

        loop {
            let start = wf
                .active
                .iter()
                .filter(|entry| *entry.1 && !visited.contains(entry.0))
                .map(|entry| *entry.0)
                .next()?;

            let mut path = Vec::new();
            let mut on_path = BTreeSet::new();
            if Self::dfs(&wf.edges, start, &mut path, &mut on_path, &mut visited) {
                let victim = *path.iter().max().expect("cycle path cannot be empty");
                wf.active.insert(victim, false);
                return Some(victim);
            }
        }
    }

    fn dfs(
        edges: &BTreeMap<TxnId, BTreeSet<TxnId>>,
        txn_id: TxnId,
        path: &mut Vec<TxnId>,
        on_path: &mut BTreeSet<TxnId>,
        visited: &mut BTreeSet<TxnId>,
    ) -> bool {
        path.push(txn_id);
        on_path.insert(txn_id);
        visited.insert(txn_id);

        if let Some(holders) = edges.get(&txn_id) {
            for &next in holders {
                if on_path.contains(&next) {
                    return true;
                }
                if !visited.contains(&next)
                    && Self::dfs(edges, next, path, on_path, visited)
                {
                    return true;
                }
            }
        }

        path.pop();
        on_path.remove(&txn_id);
        false
    }

    /// Rebuild the waits-for graph from every queue: an edge waiter ->
    /// holder for each mode-incompatible (ungranted, granted) pair. Table
    /// queues are walked before row queues, each map in key order.
    fn rebuild_waits_for(&self) {
        let mut wf = self.waits_for.lock();
        wf.edges.clear();
        wf.active.clear();

        let table_queues: Vec<Arc<LockRequestQueue>> =
            self.table_lock_map.lock().values().cloned().collect();
        let row_queues: Vec<Arc<LockRequestQueue>> =
            self.row_lock_map.lock().values().cloned().collect();

        for queue in table_queues.iter().chain(row_queues.iter()) {
            let state = queue.state.lock();
            for waiter in state.requests.iter().filter(|r| !r.granted) {
                for holder in state.requests.iter().filter(|r| r.granted) {
                    if waiter.txn_id != holder.txn_id
                        && !Self::compatible(holder.mode, waiter.mode)
                    {
                        wf.edges.entry(waiter.txn_id).or_default().insert(holder.txn_id);
                        wf.active.insert(waiter.txn_id, true);
                        wf.active.insert(holder.txn_id, true);
                    }
                }
            }
        }
    }

    /// Drop every edge touching an aborted victim
    fn remove_transaction_edges(&self, txn_id: TxnId) {
        let mut wf = self.waits_for.lock();
        wf.edges.remove(&txn_id);
        for holders in wf.edges.values_mut() {
            holders.remove(&txn_id);
        }
    }

    /// Wake every queue where the victim has a request so it can unwind
    fn notify_queues_for(&self, txn_id: TxnId) {
        let table_queues: Vec<Arc<LockRequestQueue>> =
            self.table_lock_map.lock().values().cloned().collect();
        let row_queues: Vec<Arc<LockRequestQueue>> =
            self.row_lock_map.lock().values().cloned().collect();

        for queue in table_queues.iter().chain(row_queues.iter()) {
            let state = queue.state.lock();
            if state.requests.iter().any(|r| r.txn_id == txn_id) {
                queue.cv.notify_all();
            }
        }
    }

    /// Background deadlock detection loop: rebuild the graph each interval
    /// and abort victims until it is acyclic. Victim aborts are advisory —
    /// the victim unwinds itself on wake-up.
    pub fn run_cycle_detection(&self, txn_manager: &TransactionManager) {
        while self.cycle_detection_enabled.load(Ordering::SeqCst) {
            thread::sleep(self.cycle_detection_interval);

            self.rebuild_waits_for();
            while let Some(victim) = self.has_cycle() {
                log::warn!("deadlock detected, aborting transaction {}", victim);
                if let Some(txn) = txn_manager.get(victim) {
                    txn.set_state(TransactionState::Aborted);
                }
                self.remove_transaction_edges(victim);
                self.notify_queues_for(victim);
            }
        }
    }

    /// Spawn the detector thread; stop it with `stop_cycle_detection`
    pub fn start_cycle_detection(
        self: &Arc<Self>,
        txn_manager: Arc<TransactionManager>,
    ) -> JoinHandle<()> {
        self.cycle_detection_enabled.store(true, Ordering::SeqCst);
        let lock_manager = Arc::clone(self);
        thread::Builder::new()
            .name("deadlock-detector".into())
            .spawn(move || lock_manager.run_cycle_detection(&txn_manager))
            .expect("failed to spawn deadlock detector thread")
    }

    pub fn stop_cycle_detection(&self) {
        self.cycle_detection_enabled.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compatibility_matrix() {
        use LockMode::*;
        let modes = [IntentionShared, IntentionExclusive, Shared, SharedIntentionExclusive, Exclusive];
        // Rows = requested, columns = held, per the standard matrix
        let expected = [
            [true, true, true, true, false],
            [true, true, false, false, false],
            [true, false, true, false, false],
            [true, false, false, false, false],
            [false, false, false, false, false],
        ];
        for (i, requested) in modes.iter().enumerate() {
            for (j, held) in modes.iter().enumerate() {
                assert_eq!(
                    LockManager::compatible(*held, *requested),
                    expected[i][j],
                    "held {:?} requested {:?}",
                    held,
                    requested
                );
            }
        }
    }

    #[test]
    fn test_upgrade_paths() {
        use LockMode::*;
        assert!(LockManager::can_upgrade(IntentionShared, Shared));
        assert!(LockManager::can_upgrade(IntentionShared, Exclusive));
        assert!(LockManager::can_upgrade(IntentionShared, IntentionExclusive));
        assert!(LockManager::can_upgrade(IntentionShared, SharedIntentionExclusive));
        assert!(LockManager::can_upgrade(Shared, Exclusive));
        assert!(LockManager::can_upgrade(Shared, SharedIntentionExclusive));
        assert!(LockManager::can_upgrade(IntentionExclusive, Exclusive));
        assert!(LockManager::can_upgrade(SharedIntentionExclusive, Exclusive));

        assert!(!LockManager::can_upgrade(Shared, IntentionShared));
        assert!(!LockManager::can_upgrade(Exclusive, Shared));
        assert!(!LockManager::can_upgrade(SharedIntentionExclusive, IntentionExclusive));
    }

    #[test]
    fn test_graph_edges_and_cycle() {
        let lm = LockManager::default();
        lm.add_edge(5, 6);
        lm.add_edge(6, 5);
        assert_eq!(lm.edge_list(), vec![(5, 6), (6, 5)]);

        // The victim is the largest id on the cycle
        assert_eq!(lm.has_cycle(), Some(6));
        lm.remove_transaction_edges(6);
        assert_eq!(lm.has_cycle(), None);
    }

    #[test]
    fn test_dfs_explores_smallest_first() {
        let lm = LockManager::default();
        // Two disjoint cycles; detection must find the one reachable from
        // the smallest id first
        lm.add_edge(1, 2);
        lm.add_edge(2, 1);
        lm.add_edge(10, 11);
        lm.add_edge(11, 10);

        assert_eq!(lm.has_cycle(), Some(2));
        lm.remove_transaction_edges(2);
        assert_eq!(lm.has_cycle(), Some(11));
        lm.remove_transaction_edges(11);
        assert_eq!(lm.has_cycle(), None);
    }

    #[test]
    fn test_remove_edge() {
        let lm = LockManager::default();
        lm.add_edge(1, 2);
        lm.add_edge(2, 1);
        lm.remove_edge(2, 1);
        assert_eq!(lm.edge_list(), vec![(1, 2)]);
        assert_eq!(lm.has_cycle(), None);
    }
}
