use std::{
    collections::{HashMap, HashSet},
    sync::{Condvar, Mutex},
    time::{Duration, Instant},
};

use anyhow::{anyhow, Result};
use thiserror::Error;

use crate::common::{Block, TransactionID};

/// How long a transaction may wait for a lock or a buffer frame before the
/// attempt is aborted. One authoritative value for both kinds of wait.
pub const MAX_WAIT_TIME: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("transaction aborted: deadlock detected or lock wait timed out")]
pub struct LockAbortError;

struct WaitEdge {
    holder: TransactionID,
    block: Block,
}

/// Per-block lock holders plus the waits-for graph. The graph is keyed by
/// transaction id so cycle detection is a traversal over ids, never over live
/// lock objects. It also tracks transactions stalled waiting for a buffer
/// frame: frame contention folds into the same graph.
#[derive(Default)]
struct LockState {
    x_locks: HashMap<Block, TransactionID>,
    s_locks: HashMap<Block, Vec<TransactionID>>,
    waits_for: HashMap<TransactionID, Vec<WaitEdge>>,
    buffer_waits: HashSet<TransactionID>,
}

impl LockState {
    fn x_holder_other_than(&self, block: &Block, txn_id: TransactionID) -> Option<TransactionID> {
        self.x_locks.get(block).copied().filter(|h| *h != txn_id)
    }

    fn conflicting_holders(&self, block: &Block, txn_id: TransactionID) -> Vec<TransactionID> {
        let mut holders = vec![];
        if let Some(holder) = self.x_holder_other_than(block, txn_id) {
            holders.push(holder);
        }
        if let Some(shared) = self.s_locks.get(block) {
            for &holder in shared {
                if holder != txn_id && !holders.contains(&holder) {
                    holders.push(holder);
                }
            }
        }
        holders
    }

    fn add_edges(&mut self, waiter: TransactionID, holders: &[TransactionID], block: &Block) {
        let row = self.waits_for.entry(waiter).or_default();
        for &holder in holders {
            if holder != waiter && !row.iter().any(|e| e.holder == holder && e.block == *block) {
                row.push(WaitEdge {
                    holder,
                    block: block.clone(),
                });
            }
        }
    }

    // A new shared holder becomes a dependency of every transaction already
    // waiting for an exclusive lock on the same block.
    fn grant_shared(&mut self, txn_id: TransactionID, block: &Block) {
        for (&waiter, row) in self.waits_for.iter_mut() {
            if waiter != txn_id && row.iter().any(|e| e.block == *block) {
                row.push(WaitEdge {
                    holder: txn_id,
                    block: block.clone(),
                });
            }
        }
        let holders = self.s_locks.entry(block.clone()).or_default();
        if !holders.contains(&txn_id) {
            holders.push(txn_id);
        }
    }

    fn remove_hold_edges(&mut self, txn_id: TransactionID, block: &Block) {
        for row in self.waits_for.values_mut() {
            row.retain(|e| !(e.holder == txn_id && e.block == *block));
        }
    }

    fn wait_causes_deadlock(&self, txn_id: TransactionID) -> bool {
        let mut visited = HashSet::new();
        self.reaches(txn_id, txn_id, &mut visited, false)
    }

    /// DFS from `current` looking for `target`. With `via_buffer` set the
    /// search only follows lock edges (a buffer-waiting dead end is treated
    /// as "no path"); otherwise a node stalled on a frame is expanded through
    /// the buffer-wait rule.
    fn reaches(
        &self,
        current: TransactionID,
        target: TransactionID,
        visited: &mut HashSet<TransactionID>,
        via_buffer: bool,
    ) -> bool {
        let row = match self.waits_for.get(&current) {
            Some(row) => row,
            None => {
                if !via_buffer && self.buffer_waits.contains(&current) {
                    return !self.buffer_wait_safe(current);
                }
                return false;
            }
        };
        for edge in row {
            if edge.holder == target {
                return true;
            }
            if visited.insert(edge.holder) && self.reaches(edge.holder, target, visited, via_buffer)
            {
                return true;
            }
        }
        false
    }

    fn path_to(&self, from: TransactionID, to: TransactionID) -> bool {
        let mut visited = HashSet::new();
        self.reaches(from, to, &mut visited, true)
    }

    fn buffer_wait_safe(&self, txn_id: TransactionID) -> bool {
        let others: Vec<TransactionID> = self
            .buffer_waits
            .iter()
            .copied()
            .filter(|t| *t != txn_id)
            .collect();
        if others.is_empty() {
            // Every frame is pinned by transactions that are not themselves
            // stalled on a frame; waiting is safe unless one of them is
            // (transitively) waiting on us.
            return !self.waits_for.keys().any(|&w| self.path_to(w, txn_id));
        }
        // Some other frame waiter with no path back to us is not trapped: it
        // will get a frame and eventually release it.
        others.iter().any(|&other| !self.path_to(other, txn_id))
    }
}

/// Block-granularity shared/exclusive locking with deadlock detection. One
/// mutual-exclusion domain for the whole table; waiters sit on a single
/// condvar and every release broadcasts, so each waiter re-validates its own
/// condition with no ordering guarantee.
pub struct LockTable {
    state: Mutex<LockState>,
    released: Condvar,
    max_wait: Duration,
}

impl Default for LockTable {
    fn default() -> Self {
        Self::with_wait_timeout(MAX_WAIT_TIME)
    }
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_wait_timeout(max_wait: Duration) -> Self {
        Self {
            state: Mutex::new(LockState::default()),
            released: Condvar::new(),
            max_wait,
        }
    }

    pub fn wait_timeout(&self) -> Duration {
        self.max_wait
    }

    /// Grants a shared lock on `block`. Conflicts only with another
    /// transaction's exclusive lock; on conflict the requester gets a
    /// tentative waits-for edge, is aborted immediately if that edge closes a
    /// cycle, and otherwise waits until the lock is released or the timeout
    /// elapses.
    pub fn s_lock(&self, block: &Block, txn_id: TransactionID) -> Result<()> {
        let deadline = Instant::now() + self.max_wait;
        let mut state = self.state.lock().map_err(|_| anyhow!("lock error"))?;
        if state.x_locks.get(block) == Some(&txn_id) {
            return Ok(());
        }
        if let Some(holder) = state.x_holder_other_than(block, txn_id) {
            state.add_edges(txn_id, &[holder], block);
            if state.wait_causes_deadlock(txn_id) {
                state.waits_for.remove(&txn_id);
                return Err(LockAbortError.into());
            }
            while state.x_holder_other_than(block, txn_id).is_some() {
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                let (guard, _) = self
                    .released
                    .wait_timeout(state, deadline - now)
                    .map_err(|_| anyhow!("lock error"))?;
                state = guard;
            }
            state.waits_for.remove(&txn_id);
            if state.x_holder_other_than(block, txn_id).is_some() {
                return Err(LockAbortError.into());
            }
        }
        state.grant_shared(txn_id, block);
        Ok(())
    }

    /// Grants an exclusive lock on `block`, escalating from shared if the
    /// requester is the only shared holder. Conflicts with any lock held by
    /// another transaction; same tentative-edge / cycle-check / wait protocol
    /// as `s_lock`, against the full conflicting holder set.
    pub fn x_lock(&self, block: &Block, txn_id: TransactionID) -> Result<()> {
        let deadline = Instant::now() + self.max_wait;
        let mut state = self.state.lock().map_err(|_| anyhow!("lock error"))?;
        if state.x_locks.get(block) == Some(&txn_id) {
            return Ok(());
        }
        let holders = state.conflicting_holders(block, txn_id);
        if !holders.is_empty() {
            state.add_edges(txn_id, &holders, block);
            if state.wait_causes_deadlock(txn_id) {
                state.waits_for.remove(&txn_id);
                return Err(LockAbortError.into());
            }
            while !state.conflicting_holders(block, txn_id).is_empty() {
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                let (guard, _) = self
                    .released
                    .wait_timeout(state, deadline - now)
                    .map_err(|_| anyhow!("lock error"))?;
                state = guard;
            }
            state.waits_for.remove(&txn_id);
            if !state.conflicting_holders(block, txn_id).is_empty() {
                return Err(LockAbortError.into());
            }
        }
        // The requester's own shared hold (if any) escalates in place.
        state.s_locks.remove(block);
        state.x_locks.insert(block.clone(), txn_id);
        Ok(())
    }

    /// Releases whichever lock `txn_id` holds on `block` and wakes every
    /// waiter on the table.
    pub fn unlock(&self, block: &Block, txn_id: TransactionID) -> Result<()> {
        let mut state = self.state.lock().map_err(|_| anyhow!("lock error"))?;
        state.remove_hold_edges(txn_id, block);
        if state.x_locks.get(block) == Some(&txn_id) {
            state.x_locks.remove(block);
        }
        let emptied = if let Some(holders) = state.s_locks.get_mut(block) {
            holders.retain(|t| *t != txn_id);
            holders.is_empty()
        } else {
            false
        };
        if emptied {
            state.s_locks.remove(block);
        }
        self.released.notify_all();
        Ok(())
    }

    pub fn enter_buffer_wait(&self, txn_id: TransactionID) -> Result<()> {
        let mut state = self.state.lock().map_err(|_| anyhow!("lock error"))?;
        state.buffer_waits.insert(txn_id);
        Ok(())
    }

    pub fn leave_buffer_wait(&self, txn_id: TransactionID) -> Result<()> {
        let mut state = self.state.lock().map_err(|_| anyhow!("lock error"))?;
        state.buffer_waits.remove(&txn_id);
        Ok(())
    }

    /// Whether letting `txn_id` keep waiting for a frame can deadlock. The
    /// caller must already have registered it with `enter_buffer_wait`.
    pub fn buffer_wait_deadlocks(&self, txn_id: TransactionID) -> Result<bool> {
        let state = self.state.lock().map_err(|_| anyhow!("lock error"))?;
        Ok(!state.buffer_wait_safe(txn_id))
    }

    #[cfg(test)]
    pub(crate) fn holders(&self, block: &Block) -> (Option<TransactionID>, Vec<TransactionID>) {
        let state = self.state.lock().expect("lock table poisoned");
        (
            state.x_locks.get(block).copied(),
            state.s_locks.get(block).cloned().unwrap_or_default(),
        )
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread};

    use super::*;

    fn block(num: u64) -> Block {
        Block::new("student.tbl", num)
    }

    #[test]
    fn test_many_shared_holders() -> Result<()> {
        let table = LockTable::new();
        table.s_lock(&block(1), TransactionID(1))?;
        table.s_lock(&block(1), TransactionID(2))?;
        table.s_lock(&block(1), TransactionID(3))?;
        let (x, s) = table.holders(&block(1));
        assert_eq!(x, None);
        assert_eq!(s, vec![TransactionID(1), TransactionID(2), TransactionID(3)]);
        Ok(())
    }

    #[test]
    fn test_exclusive_iff_no_shared() -> Result<()> {
        let table = LockTable::new();
        table.s_lock(&block(1), TransactionID(1))?;
        table.x_lock(&block(1), TransactionID(1))?;
        let (x, s) = table.holders(&block(1));
        assert_eq!(x, Some(TransactionID(1)));
        assert!(s.is_empty());

        table.unlock(&block(1), TransactionID(1))?;
        let (x, s) = table.holders(&block(1));
        assert_eq!(x, None);
        assert!(s.is_empty());
        Ok(())
    }

    #[test]
    fn test_shared_lock_is_reentrant() -> Result<()> {
        let table = LockTable::new();
        table.s_lock(&block(1), TransactionID(1))?;
        table.s_lock(&block(1), TransactionID(1))?;
        let (_, s) = table.holders(&block(1));
        assert_eq!(s, vec![TransactionID(1)]);
        Ok(())
    }

    #[test]
    fn test_exclusive_against_shared_holders_times_out() -> Result<()> {
        let table = LockTable::with_wait_timeout(Duration::from_millis(200));
        table.s_lock(&block(1), TransactionID(1))?;
        table.s_lock(&block(1), TransactionID(2))?;

        let started = Instant::now();
        let result = table.x_lock(&block(1), TransactionID(3));
        assert!(started.elapsed() >= Duration::from_millis(200));
        let err = result.expect_err("exclusive lock against two shared holders must abort");
        assert!(err.downcast_ref::<LockAbortError>().is_some());
        Ok(())
    }

    #[test]
    fn test_shared_against_exclusive_times_out() -> Result<()> {
        let table = LockTable::with_wait_timeout(Duration::from_millis(200));
        table.x_lock(&block(1), TransactionID(1))?;
        let err = table
            .s_lock(&block(1), TransactionID(2))
            .expect_err("shared lock against an exclusive holder must abort");
        assert!(err.downcast_ref::<LockAbortError>().is_some());
        Ok(())
    }

    #[test]
    fn test_waiter_proceeds_after_release() -> Result<()> {
        let table = Arc::new(LockTable::with_wait_timeout(Duration::from_secs(2)));
        table.x_lock(&block(1), TransactionID(1))?;

        let table_clone = table.clone();
        let waiter = thread::spawn(move || -> Result<()> {
            table_clone.s_lock(&block(1), TransactionID(2))?;
            table_clone.unlock(&block(1), TransactionID(2))?;
            Ok(())
        });
        thread::sleep(Duration::from_millis(100));
        table.unlock(&block(1), TransactionID(1))?;
        waiter.join().map_err(|_| anyhow!("thread error"))??;
        Ok(())
    }

    #[test]
    fn test_release_broadcasts_to_all_waiters() -> Result<()> {
        let table = Arc::new(LockTable::with_wait_timeout(Duration::from_secs(2)));
        table.x_lock(&block(1), TransactionID(1))?;

        let mut handles = vec![];
        for i in 2..5 {
            let table = table.clone();
            handles.push(thread::spawn(move || -> Result<()> {
                table.s_lock(&block(1), TransactionID(i))
            }));
        }
        thread::sleep(Duration::from_millis(100));
        table.unlock(&block(1), TransactionID(1))?;
        for handle in handles {
            handle.join().map_err(|_| anyhow!("thread error"))??;
        }
        let (x, s) = table.holders(&block(1));
        assert_eq!(x, None);
        assert_eq!(s.len(), 3);
        Ok(())
    }

    #[test]
    fn test_deadlock_detected_without_waiting_out_the_timeout() -> Result<()> {
        let table = Arc::new(LockTable::with_wait_timeout(Duration::from_secs(5)));
        table.x_lock(&block(1), TransactionID(1))?;
        table.x_lock(&block(2), TransactionID(2))?;

        // Transaction 1 waits for block 2 on another thread.
        let table_clone = table.clone();
        let waiter = thread::spawn(move || table_clone.x_lock(&block(2), TransactionID(1)));
        thread::sleep(Duration::from_millis(100));

        // Closing the cycle must fail immediately, not after the timeout.
        let started = Instant::now();
        let err = table
            .x_lock(&block(1), TransactionID(2))
            .expect_err("closing the cycle must abort");
        assert!(err.downcast_ref::<LockAbortError>().is_some());
        assert!(started.elapsed() < Duration::from_secs(1));

        // The victim backs off; the other transaction gets its lock.
        table.unlock(&block(2), TransactionID(2))?;
        waiter.join().map_err(|_| anyhow!("thread error"))??;
        table.unlock(&block(1), TransactionID(1))?;
        table.unlock(&block(2), TransactionID(1))?;
        Ok(())
    }

    #[test]
    fn test_mixed_mode_cycle_detected() -> Result<()> {
        let table = Arc::new(LockTable::with_wait_timeout(Duration::from_secs(5)));
        table.s_lock(&block(1), TransactionID(1))?;
        table.x_lock(&block(2), TransactionID(2))?;

        // Transaction 1 wants X on block 2, held by transaction 2.
        let table_clone = table.clone();
        let waiter = thread::spawn(move || table_clone.x_lock(&block(2), TransactionID(1)));
        thread::sleep(Duration::from_millis(100));

        // Transaction 2 asking for X on block 1 (shared-held by 1) closes the
        // cycle through a shared holder.
        let err = table
            .x_lock(&block(1), TransactionID(2))
            .expect_err("cycle through a shared holder must abort");
        assert!(err.downcast_ref::<LockAbortError>().is_some());

        table.unlock(&block(2), TransactionID(2))?;
        waiter.join().map_err(|_| anyhow!("thread error"))??;
        Ok(())
    }

    #[test]
    fn test_buffer_wait_folded_into_graph() -> Result<()> {
        let table = Arc::new(LockTable::with_wait_timeout(Duration::from_secs(2)));
        table.x_lock(&block(1), TransactionID(1))?;

        // Transaction 2 blocks on transaction 1's lock.
        let table_clone = table.clone();
        let waiter = thread::spawn(move || table_clone.x_lock(&block(1), TransactionID(2)));
        thread::sleep(Duration::from_millis(100));

        // Transaction 1 stalling on a frame would deadlock: its only way to a
        // frame runs through transaction 2, which waits on it.
        table.enter_buffer_wait(TransactionID(1))?;
        assert!(table.buffer_wait_deadlocks(TransactionID(1))?);

        // A second frame waiter with no path back to transaction 1 makes the
        // wait safe again.
        table.enter_buffer_wait(TransactionID(3))?;
        assert!(!table.buffer_wait_deadlocks(TransactionID(1))?);

        table.leave_buffer_wait(TransactionID(1))?;
        table.leave_buffer_wait(TransactionID(3))?;
        table.unlock(&block(1), TransactionID(1))?;
        waiter.join().map_err(|_| anyhow!("thread error"))??;
        table.unlock(&block(1), TransactionID(2))?;
        Ok(())
    }

    #[test]
    fn test_lone_buffer_wait_with_no_dependents_is_safe() -> Result<()> {
        let table = LockTable::new();
        table.enter_buffer_wait(TransactionID(1))?;
        assert!(!table.buffer_wait_deadlocks(TransactionID(1))?);
        table.leave_buffer_wait(TransactionID(1))?;
        Ok(())
    }
}
