use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};

use crate::{
    buffer::BufferPoolManager,
    common::{Block, TransactionID, INVALID_LSN, LSN},
    log::{LogManager, LogRecordBody, SetI32, SetString},
};

/// Per-transaction undo manager. Writes the `Start` record on creation, logs
/// pre-images ahead of every mutation and rolls a transaction back by
/// restoring those pre-images in reverse order.
pub struct RecoveryManager {
    txn_id: TransactionID,
    log: Arc<Mutex<LogManager>>,
    buffer_pool: Arc<BufferPoolManager>,
}

impl RecoveryManager {
    pub fn new(
        txn_id: TransactionID,
        log: Arc<Mutex<LogManager>>,
        buffer_pool: Arc<BufferPoolManager>,
    ) -> Result<Self> {
        log.lock()
            .map_err(|_| anyhow!("lock error"))?
            .append(txn_id, LogRecordBody::Start)?;
        Ok(Self {
            txn_id,
            log,
            buffer_pool,
        })
    }

    /// Records the value about to be overwritten; the returned LSN tags the
    /// page write so the pool can honor the write-ahead rule.
    pub fn log_set_i32(&self, block: &Block, offset: usize, old_value: i32) -> Result<LSN> {
        self.log.lock().map_err(|_| anyhow!("lock error"))?.append(
            self.txn_id,
            LogRecordBody::SetI32(SetI32 {
                block: block.clone(),
                offset: offset as u32,
                old_value,
            }),
        )
    }

    pub fn log_set_string(&self, block: &Block, offset: usize, old_value: &str) -> Result<LSN> {
        self.log.lock().map_err(|_| anyhow!("lock error"))?.append(
            self.txn_id,
            LogRecordBody::SetString(SetString {
                block: block.clone(),
                offset: offset as u32,
                old_value: old_value.to_string(),
            }),
        )
    }

    /// No commit completes before its log records are durable.
    pub fn commit(&self) -> Result<()> {
        let mut log = self.log.lock().map_err(|_| anyhow!("lock error"))?;
        log.append(self.txn_id, LogRecordBody::Commit)?;
        log.flush()?;
        Ok(())
    }

    pub fn rollback(&self) -> Result<()> {
        self.undo()?;
        let mut log = self.log.lock().map_err(|_| anyhow!("lock error"))?;
        log.append(self.txn_id, LogRecordBody::Rollback)?;
        log.flush()?;
        Ok(())
    }

    fn undo(&self) -> Result<()> {
        let records = {
            let mut log = self.log.lock().map_err(|_| anyhow!("lock error"))?;
            log.flush()?;
            log.read()?
        };
        for record in records.iter().rev() {
            if record.txn_id != self.txn_id {
                continue;
            }
            match &record.body {
                LogRecordBody::Start => break,
                LogRecordBody::SetI32(body) => {
                    let buffer = self.buffer_pool.pin(&body.block, self.txn_id)?;
                    buffer
                        .write()
                        .map_err(|_| anyhow!("lock error"))?
                        .set_i32(body.offset as usize, body.old_value, self.txn_id, INVALID_LSN);
                    self.buffer_pool.unpin(&buffer)?;
                }
                LogRecordBody::SetString(body) => {
                    let buffer = self.buffer_pool.pin(&body.block, self.txn_id)?;
                    buffer
                        .write()
                        .map_err(|_| anyhow!("lock error"))?
                        .set_string(body.offset as usize, &body.old_value, self.txn_id, INVALID_LSN);
                    self.buffer_pool.unpin(&buffer)?;
                }
                _ => {}
            }
        }
        Ok(())
    }
}
