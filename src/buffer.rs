use std::{
    collections::HashMap,
    sync::{Arc, Condvar, Mutex, RwLock},
    time::Instant,
};

use anyhow::{anyhow, Result};
use thiserror::Error;

use crate::{
    common::{Block, TransactionID, INVALID_LSN, LSN},
    disk::DiskManager,
    lock::LockTable,
    log::LogManager,
    page::{Page, PageFormatter},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("no buffer frame became available: wait timed out or would deadlock")]
pub struct BufferUnavailableError;

/// One frame of the pool: a page plus pin and modification bookkeeping.
/// Contents are never cleared except by reassignment, and a frame may only be
/// reassigned while its pin count is zero.
#[derive(Debug)]
pub struct Buffer {
    page: Page,
    block: Option<Block>,
    pin_count: u32,
    last_unpin_at: u64,
    modified_by: Option<TransactionID>,
    lsn: LSN,
}

impl Buffer {
    fn new() -> Self {
        Self {
            page: Page::new(),
            block: None,
            pin_count: 0,
            last_unpin_at: 0,
            modified_by: None,
            lsn: INVALID_LSN,
        }
    }
    pub fn block(&self) -> Option<&Block> {
        self.block.as_ref()
    }
    pub fn pin_count(&self) -> u32 {
        self.pin_count
    }
    pub fn is_pinned(&self) -> bool {
        self.pin_count > 0
    }
    pub fn modifying_txn(&self) -> Option<TransactionID> {
        self.modified_by
    }
    pub fn get_i32(&self, offset: usize) -> i32 {
        self.page.get_i32(offset)
    }
    pub fn get_string(&self, offset: usize) -> String {
        self.page.get_string(offset)
    }
    /// Writes require the owning transaction id and the LSN of the log record
    /// describing the change; the pool flushes the log that far before the
    /// page can reach disk.
    pub fn set_i32(&mut self, offset: usize, value: i32, txn_id: TransactionID, lsn: LSN) {
        self.page.set_i32(offset, value);
        self.mark_modified(txn_id, lsn);
    }
    pub fn set_string(&mut self, offset: usize, value: &str, txn_id: TransactionID, lsn: LSN) {
        self.page.set_string(offset, value);
        self.mark_modified(txn_id, lsn);
    }
    fn mark_modified(&mut self, txn_id: TransactionID, lsn: LSN) {
        self.modified_by = Some(txn_id);
        if lsn != INVALID_LSN {
            self.lsn = lsn;
        }
    }
    fn pin(&mut self) {
        self.pin_count += 1;
    }
    fn unpin(&mut self, at: u64) -> Result<()> {
        if self.pin_count == 0 {
            return Err(anyhow!("buffer is not pinned"));
        }
        self.pin_count -= 1;
        if self.pin_count == 0 {
            self.last_unpin_at = at;
        }
        Ok(())
    }
}

pub type BufferRef = Arc<RwLock<Buffer>>;

struct PoolState {
    resident: HashMap<Block, usize>,
    // Logical clock stamped into frames as they reach pin count zero; the
    // replacement policy evicts the smallest stamp, not a strict LRU queue.
    clock: u64,
}

/// Fixed-size pool of page frames. One mutex guards the residency map and the
/// replacement clock; the mutex is released while a caller waits for a frame.
/// A transaction stalled here is registered with the lock table so frame
/// contention participates in deadlock detection.
///
/// Lock order: pool state, then a frame's RwLock, then the lock table or the
/// disk/log managers. Never the reverse.
pub struct BufferPoolManager {
    frames: Vec<BufferRef>,
    disk: Mutex<DiskManager>,
    log: Arc<Mutex<LogManager>>,
    lock_table: Arc<LockTable>,
    state: Mutex<PoolState>,
    freed: Condvar,
}

impl BufferPoolManager {
    pub fn new(
        disk_manager: DiskManager,
        log_manager: Arc<Mutex<LogManager>>,
        lock_table: Arc<LockTable>,
        size: usize,
    ) -> Self {
        Self {
            frames: (0..size).map(|_| Arc::new(RwLock::new(Buffer::new()))).collect(),
            disk: Mutex::new(disk_manager),
            log: log_manager,
            lock_table,
            state: Mutex::new(PoolState {
                resident: HashMap::new(),
                clock: 1,
            }),
            freed: Condvar::new(),
        }
    }

    /// Pins the frame holding `block`, reading it from disk on a miss. With
    /// every frame pinned the caller blocks, bounded by the shared wait
    /// timeout, and its stall is visible to deadlock detection.
    pub fn pin(&self, block: &Block, txn_id: TransactionID) -> Result<BufferRef> {
        let deadline = Instant::now() + self.lock_table.wait_timeout();
        let mut state = self.state.lock().map_err(|_| anyhow!("lock error"))?;
        let mut waiting = false;
        loop {
            if let Some(&idx) = state.resident.get(block) {
                let buffer = self.frames[idx].clone();
                buffer.write().map_err(|_| anyhow!("lock error"))?.pin();
                if waiting {
                    self.lock_table.leave_buffer_wait(txn_id)?;
                }
                return Ok(buffer);
            }
            if let Some(idx) = self.choose_victim()? {
                {
                    let mut frame = self.frames[idx]
                        .write()
                        .map_err(|_| anyhow!("lock error"))?;
                    self.evict(&mut state, &mut frame)?;
                    self.disk
                        .lock()
                        .map_err(|_| anyhow!("lock error"))?
                        .read_block(block, &mut frame.page)?;
                    frame.block = Some(block.clone());
                    frame.pin();
                }
                state.resident.insert(block.clone(), idx);
                if waiting {
                    self.lock_table.leave_buffer_wait(txn_id)?;
                }
                return Ok(self.frames[idx].clone());
            }
            state = self.wait_for_frame(state, txn_id, &mut waiting, deadline)?;
        }
    }

    /// Appends a fresh block to `filename`, formats a victim frame for it and
    /// returns the frame pinned once. Nothing else can reach the block until
    /// the pin is released.
    pub fn pin_new(
        &self,
        filename: &str,
        formatter: &dyn PageFormatter,
        txn_id: TransactionID,
    ) -> Result<BufferRef> {
        let deadline = Instant::now() + self.lock_table.wait_timeout();
        let mut state = self.state.lock().map_err(|_| anyhow!("lock error"))?;
        let mut waiting = false;
        loop {
            if let Some(idx) = self.choose_victim()? {
                let block;
                {
                    let mut frame = self.frames[idx]
                        .write()
                        .map_err(|_| anyhow!("lock error"))?;
                    self.evict(&mut state, &mut frame)?;
                    block = self
                        .disk
                        .lock()
                        .map_err(|_| anyhow!("lock error"))?
                        .append_block(filename)?;
                    formatter.format(&mut frame.page);
                    frame.block = Some(block.clone());
                    frame.mark_modified(txn_id, INVALID_LSN);
                    frame.pin();
                }
                state.resident.insert(block, idx);
                if waiting {
                    self.lock_table.leave_buffer_wait(txn_id)?;
                }
                return Ok(self.frames[idx].clone());
            }
            state = self.wait_for_frame(state, txn_id, &mut waiting, deadline)?;
        }
    }

    pub fn unpin(&self, buffer: &BufferRef) -> Result<()> {
        let mut state = self.state.lock().map_err(|_| anyhow!("lock error"))?;
        let mut frame = buffer.write().map_err(|_| anyhow!("lock error"))?;
        let at = state.clock;
        state.clock += 1;
        frame.unpin(at)?;
        if !frame.is_pinned() {
            self.freed.notify_all();
        }
        Ok(())
    }

    pub fn num_pins(&self, buffer: &BufferRef) -> Result<u32> {
        Ok(buffer
            .read()
            .map_err(|_| anyhow!("lock error"))?
            .pin_count())
    }

    pub fn is_pinned(&self, buffer: &BufferRef) -> Result<bool> {
        Ok(buffer.read().map_err(|_| anyhow!("lock error"))?.is_pinned())
    }

    pub fn flush_all(&self) -> Result<()> {
        let _state = self.state.lock().map_err(|_| anyhow!("lock error"))?;
        for buffer in &self.frames {
            let mut frame = buffer.write().map_err(|_| anyhow!("lock error"))?;
            self.flush_frame(&mut frame)?;
        }
        Ok(())
    }

    fn wait_for_frame<'a>(
        &'a self,
        state: std::sync::MutexGuard<'a, PoolState>,
        txn_id: TransactionID,
        waiting: &mut bool,
        deadline: Instant,
    ) -> Result<std::sync::MutexGuard<'a, PoolState>> {
        if !*waiting {
            *waiting = true;
            self.lock_table.enter_buffer_wait(txn_id)?;
        }
        if self.lock_table.buffer_wait_deadlocks(txn_id)? {
            self.lock_table.leave_buffer_wait(txn_id)?;
            return Err(BufferUnavailableError.into());
        }
        let now = Instant::now();
        if now >= deadline {
            self.lock_table.leave_buffer_wait(txn_id)?;
            return Err(BufferUnavailableError.into());
        }
        let (guard, _) = self
            .freed
            .wait_timeout(state, deadline - now)
            .map_err(|_| anyhow!("lock error"))?;
        Ok(guard)
    }

    /// Smallest last-unpin stamp among unpinned frames; ties break by frame
    /// index, so eviction order is deterministic for a fixed history.
    fn choose_victim(&self) -> Result<Option<usize>> {
        let mut victim: Option<(usize, u64)> = None;
        for (idx, buffer) in self.frames.iter().enumerate() {
            let frame = buffer.read().map_err(|_| anyhow!("lock error"))?;
            if frame.is_pinned() {
                continue;
            }
            match victim {
                Some((_, at)) if frame.last_unpin_at >= at => {}
                _ => victim = Some((idx, frame.last_unpin_at)),
            }
        }
        Ok(victim.map(|(idx, _)| idx))
    }

    fn evict(&self, state: &mut PoolState, frame: &mut Buffer) -> Result<()> {
        self.flush_frame(frame)?;
        if let Some(old) = frame.block.take() {
            state.resident.remove(&old);
        }
        Ok(())
    }

    fn flush_frame(&self, frame: &mut Buffer) -> Result<()> {
        if frame.modified_by.is_none() {
            return Ok(());
        }
        if let Some(block) = frame.block.clone() {
            // Write-ahead: the log records for this page go down first.
            self.log
                .lock()
                .map_err(|_| anyhow!("lock error"))?
                .flush()?;
            self.disk
                .lock()
                .map_err(|_| anyhow!("lock error"))?
                .write_block(&block, &frame.page)?;
        }
        frame.modified_by = None;
        Ok(())
    }
}
