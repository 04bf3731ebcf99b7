use std::{collections::HashMap, sync::Arc};

use anyhow::{anyhow, Result};

use crate::{
    buffer::{BufferPoolManager, BufferRef},
    common::{Block, TransactionID},
    lock::LockTable,
    page::PageFormatter,
    recovery::RecoveryManager,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LockMode {
    Shared,
    Exclusive,
}

/// Coordinates one transaction's access to the buffer pool and the lock
/// table: pin before touching a block, S lock before a read, X lock before a
/// write, pre-image logged before the bytes change. Strict two-phase locking:
/// every lock is held until `commit` or `rollback`, which consume the
/// transaction.
pub struct Transaction {
    txn_id: TransactionID,
    buffer_pool: Arc<BufferPoolManager>,
    lock_table: Arc<LockTable>,
    recovery: RecoveryManager,
    locks: HashMap<Block, LockMode>,
    buffers: HashMap<Block, BufferRef>,
    pins: Vec<Block>,
}

impl Transaction {
    pub(crate) fn new(
        txn_id: TransactionID,
        buffer_pool: Arc<BufferPoolManager>,
        lock_table: Arc<LockTable>,
        recovery: RecoveryManager,
    ) -> Self {
        Self {
            txn_id,
            buffer_pool,
            lock_table,
            recovery,
            locks: HashMap::new(),
            buffers: HashMap::new(),
            pins: Vec::new(),
        }
    }

    pub fn txn_id(&self) -> TransactionID {
        self.txn_id
    }

    pub fn pin(&mut self, block: &Block) -> Result<()> {
        let buffer = self.buffer_pool.pin(block, self.txn_id)?;
        self.buffers.insert(block.clone(), buffer);
        self.pins.push(block.clone());
        Ok(())
    }

    pub fn unpin(&mut self, block: &Block) -> Result<()> {
        let position = self
            .pins
            .iter()
            .position(|b| b == block)
            .ok_or_else(|| anyhow!("block not pinned: {}", block))?;
        self.pins.remove(position);
        if let Some(buffer) = self.buffers.get(block) {
            self.buffer_pool.unpin(buffer)?;
        }
        if !self.pins.contains(block) {
            self.buffers.remove(block);
        }
        Ok(())
    }

    /// Appends a fresh block to `filename` and pins it.
    pub fn append(&mut self, filename: &str, formatter: &dyn PageFormatter) -> Result<Block> {
        let buffer = self
            .buffer_pool
            .pin_new(filename, formatter, self.txn_id)?;
        let block = buffer
            .read()
            .map_err(|_| anyhow!("lock error"))?
            .block()
            .cloned()
            .ok_or_else(|| anyhow!("fresh buffer has no block"))?;
        self.buffers.insert(block.clone(), buffer);
        self.pins.push(block.clone());
        Ok(block)
    }

    pub fn get_i32(&mut self, block: &Block, offset: usize) -> Result<i32> {
        self.ensure_shared(block)?;
        let buffer = self.pinned(block)?;
        let value = buffer
            .read()
            .map_err(|_| anyhow!("lock error"))?
            .get_i32(offset);
        Ok(value)
    }

    pub fn get_string(&mut self, block: &Block, offset: usize) -> Result<String> {
        self.ensure_shared(block)?;
        let buffer = self.pinned(block)?;
        let value = buffer
            .read()
            .map_err(|_| anyhow!("lock error"))?
            .get_string(offset);
        Ok(value)
    }

    pub fn set_i32(&mut self, block: &Block, offset: usize, value: i32) -> Result<()> {
        self.ensure_exclusive(block)?;
        let buffer = self.pinned(block)?;
        let old_value = buffer
            .read()
            .map_err(|_| anyhow!("lock error"))?
            .get_i32(offset);
        let lsn = self.recovery.log_set_i32(block, offset, old_value)?;
        buffer
            .write()
            .map_err(|_| anyhow!("lock error"))?
            .set_i32(offset, value, self.txn_id, lsn);
        Ok(())
    }

    pub fn set_string(&mut self, block: &Block, offset: usize, value: &str) -> Result<()> {
        self.ensure_exclusive(block)?;
        let buffer = self.pinned(block)?;
        let old_value = buffer
            .read()
            .map_err(|_| anyhow!("lock error"))?
            .get_string(offset);
        let lsn = self.recovery.log_set_string(block, offset, &old_value)?;
        buffer
            .write()
            .map_err(|_| anyhow!("lock error"))?
            .set_string(offset, value, self.txn_id, lsn);
        Ok(())
    }

    pub fn commit(mut self) -> Result<()> {
        self.recovery.commit()?;
        self.release_all()
    }

    pub fn rollback(mut self) -> Result<()> {
        // Undo runs while the locks are still held.
        self.recovery.rollback()?;
        self.release_all()
    }

    fn pinned(&self, block: &Block) -> Result<BufferRef> {
        self.buffers
            .get(block)
            .cloned()
            .ok_or_else(|| anyhow!("block not pinned: {}", block))
    }

    fn ensure_shared(&mut self, block: &Block) -> Result<()> {
        if self.locks.contains_key(block) {
            return Ok(());
        }
        self.lock_table.s_lock(block, self.txn_id)?;
        self.locks.insert(block.clone(), LockMode::Shared);
        Ok(())
    }

    fn ensure_exclusive(&mut self, block: &Block) -> Result<()> {
        if self.locks.get(block) == Some(&LockMode::Exclusive) {
            return Ok(());
        }
        if !self.locks.contains_key(block) {
            self.lock_table.s_lock(block, self.txn_id)?;
            self.locks.insert(block.clone(), LockMode::Shared);
        }
        self.lock_table.x_lock(block, self.txn_id)?;
        self.locks.insert(block.clone(), LockMode::Exclusive);
        Ok(())
    }

    fn release_all(&mut self) -> Result<()> {
        for block in std::mem::take(&mut self.pins) {
            if let Some(buffer) = self.buffers.get(&block) {
                self.buffer_pool.unpin(buffer)?;
            }
        }
        self.buffers.clear();
        for (block, _) in std::mem::take(&mut self.locks) {
            self.lock_table.unlock(&block, self.txn_id)?;
        }
        Ok(())
    }
}
