use std::{
    fs,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use anyhow::{anyhow, Result};

use crate::{
    buffer::BufferPoolManager,
    common::TransactionID,
    disk::DiskManager,
    lock::{LockTable, MAX_WAIT_TIME},
    log::LogManager,
    recovery::RecoveryManager,
    transaction::Transaction,
};

/// Wires the core together over a data directory and hands out transactions.
pub struct Instance {
    buffer_pool: Arc<BufferPoolManager>,
    lock_table: Arc<LockTable>,
    log_manager: Arc<Mutex<LogManager>>,
    next_txn_id: AtomicU32,
}

impl Instance {
    pub fn new(dir: &str, pool_size: usize) -> Result<Self> {
        Self::with_wait_timeout(dir, pool_size, MAX_WAIT_TIME)
    }

    pub fn with_wait_timeout(dir: &str, pool_size: usize, max_wait: Duration) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let data_dir = format!("{}/data", dir);
        let log_file = format!("{}/wal.log", dir);

        let disk_manager = DiskManager::new(&data_dir)?;
        let log_manager = Arc::new(Mutex::new(LogManager::new(&log_file)?));
        let lock_table = Arc::new(LockTable::with_wait_timeout(max_wait));
        let buffer_pool = Arc::new(BufferPoolManager::new(
            disk_manager,
            log_manager.clone(),
            lock_table.clone(),
            pool_size,
        ));
        Ok(Self {
            buffer_pool,
            lock_table,
            log_manager,
            next_txn_id: AtomicU32::new(1),
        })
    }

    pub fn begin(&self) -> Result<Transaction> {
        let txn_id = TransactionID(self.next_txn_id.fetch_add(1, Ordering::SeqCst));
        let recovery =
            RecoveryManager::new(txn_id, self.log_manager.clone(), self.buffer_pool.clone())?;
        Ok(Transaction::new(
            txn_id,
            self.buffer_pool.clone(),
            self.lock_table.clone(),
            recovery,
        ))
    }

    pub fn shutdown(&self) -> Result<()> {
        self.log_manager
            .lock()
            .map_err(|_| anyhow!("lock error"))?
            .flush()?;
        self.buffer_pool.flush_all()?;
        Ok(())
    }
}
