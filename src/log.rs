use std::{
    fs::{File, OpenOptions},
    io::{Read, Seek, Write},
};

use anyhow::Result;

use crate::common::{Block, TransactionID, LSN};

const LOG_BUFFER_SIZE: usize = 4096;

/// Append-only write-ahead log. Records buffer in memory until `flush`;
/// no data page may reach disk before the records describing it do.
pub struct LogManager {
    log_file: File,
    buffer: Vec<u8>,
    next_lsn: LSN,
}

impl LogManager {
    pub fn new(log_file_path: &str) -> Result<Self> {
        let log_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(log_file_path)?;
        let mut log_manager = Self {
            log_file,
            buffer: vec![],
            next_lsn: LSN(1),
        };
        let records = log_manager.read()?;
        let next_lsn = records
            .last()
            .map_or(LSN(1), |record| LSN(record.lsn.0 + 1));
        log_manager.next_lsn = next_lsn;
        Ok(log_manager)
    }

    pub fn append(&mut self, txn_id: TransactionID, body: LogRecordBody) -> Result<LSN> {
        let lsn = self.next_lsn;
        let log_record = LogRecord { lsn, txn_id, body };
        self.next_lsn.0 += 1;

        let bytes = log_record.serialize();
        if bytes.len() > LOG_BUFFER_SIZE {
            Err(anyhow::anyhow!("log record too large"))?;
        }
        if self.buffer.len() + bytes.len() > LOG_BUFFER_SIZE {
            self.flush()?;
        }
        self.buffer.extend_from_slice(&bytes);
        Ok(lsn)
    }

    pub fn read(&mut self) -> Result<Vec<LogRecord>> {
        let mut buffer = vec![];
        self.log_file.seek(std::io::SeekFrom::Start(0))?;
        self.log_file.read_to_end(&mut buffer)?;
        self.log_file.seek(std::io::SeekFrom::End(0))?;
        let mut records = vec![];
        let mut offset = 0;
        while offset < buffer.len() {
            let record = LogRecord::from(&buffer[offset..]);
            offset += record.size();
            records.push(record);
        }
        Ok(records)
    }

    pub fn flush(&mut self) -> Result<()> {
        self.log_file.write_all(&self.buffer)?;
        self.log_file.sync_all()?;
        self.buffer.clear();
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub lsn: LSN,
    pub txn_id: TransactionID,
    pub body: LogRecordBody,
}

impl From<&[u8]> for LogRecord {
    fn from(bytes: &[u8]) -> Self {
        let mut buffer = [0u8; 8];
        buffer.copy_from_slice(&bytes[0..8]);
        let lsn = LSN(u64::from_be_bytes(buffer));
        let mut buffer = [0u8; 4];
        buffer.copy_from_slice(&bytes[8..12]);
        let txn_id = TransactionID(u32::from_be_bytes(buffer));
        let body = LogRecordBody::from(&bytes[12..]);
        Self { lsn, txn_id, body }
    }
}
impl LogRecord {
    fn serialize(&self) -> Vec<u8> {
        let mut buffer = Vec::new();
        buffer.extend_from_slice(&self.lsn.0.to_be_bytes());
        buffer.extend_from_slice(&self.txn_id.0.to_be_bytes());
        buffer.extend_from_slice(&self.body.serialize());
        buffer
    }
    fn size(&self) -> usize {
        12 + self.body.size()
    }
}

/// Undo-only record set: mutation records carry the pre-image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogRecordBody {
    Start,
    Commit,
    Rollback,
    SetI32(SetI32),
    SetString(SetString),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetI32 {
    pub block: Block,
    pub offset: u32,
    pub old_value: i32,
}
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetString {
    pub block: Block,
    pub offset: u32,
    pub old_value: String,
}

impl From<&[u8]> for LogRecordBody {
    fn from(bytes: &[u8]) -> Self {
        let mut buffer = [0u8; 4];
        buffer.copy_from_slice(&bytes[0..4]);
        let type_id = u32::from_be_bytes(buffer);
        match type_id {
            0 => LogRecordBody::Start,
            1 => LogRecordBody::Commit,
            2 => LogRecordBody::Rollback,
            3 => LogRecordBody::SetI32(SetI32::from(&bytes[4..])),
            4 => LogRecordBody::SetString(SetString::from(&bytes[4..])),
            _ => panic!("invalid log record type id"),
        }
    }
}
impl LogRecordBody {
    pub fn serialize(&self) -> Vec<u8> {
        let mut buffer = Vec::new();
        match &self {
            LogRecordBody::Start => {
                buffer.extend_from_slice(&(0u32).to_be_bytes());
            }
            LogRecordBody::Commit => {
                buffer.extend_from_slice(&(1u32).to_be_bytes());
            }
            LogRecordBody::Rollback => {
                buffer.extend_from_slice(&(2u32).to_be_bytes());
            }
            LogRecordBody::SetI32(body) => {
                buffer.extend_from_slice(&(3u32).to_be_bytes());
                buffer.extend_from_slice(&body.serialize());
            }
            LogRecordBody::SetString(body) => {
                buffer.extend_from_slice(&(4u32).to_be_bytes());
                buffer.extend_from_slice(&body.serialize());
            }
        }
        buffer
    }
    fn size(&self) -> usize {
        match &self {
            LogRecordBody::Start => 4,
            LogRecordBody::Commit => 4,
            LogRecordBody::Rollback => 4,
            LogRecordBody::SetI32(body) => 4 + body.size(),
            LogRecordBody::SetString(body) => 4 + body.size(),
        }
    }
}

fn serialize_block(block: &Block, buffer: &mut Vec<u8>) {
    let name = block.filename().as_bytes();
    buffer.extend_from_slice(&(name.len() as u32).to_be_bytes());
    buffer.extend_from_slice(name);
    buffer.extend_from_slice(&block.num().to_be_bytes());
}
fn deserialize_block(bytes: &[u8]) -> (Block, usize) {
    let mut buffer = [0u8; 4];
    buffer.copy_from_slice(&bytes[0..4]);
    let name_len = u32::from_be_bytes(buffer) as usize;
    let filename = String::from_utf8_lossy(&bytes[4..(4 + name_len)]).into_owned();
    let mut buffer = [0u8; 8];
    buffer.copy_from_slice(&bytes[(4 + name_len)..(12 + name_len)]);
    let num = u64::from_be_bytes(buffer);
    (Block::new(&filename, num), 12 + name_len)
}

impl From<&[u8]> for SetI32 {
    fn from(bytes: &[u8]) -> Self {
        let (block, block_size) = deserialize_block(bytes);
        let mut buffer = [0u8; 4];
        buffer.copy_from_slice(&bytes[block_size..(block_size + 4)]);
        let offset = u32::from_be_bytes(buffer);
        buffer.copy_from_slice(&bytes[(block_size + 4)..(block_size + 8)]);
        let old_value = i32::from_be_bytes(buffer);
        SetI32 {
            block,
            offset,
            old_value,
        }
    }
}
impl SetI32 {
    fn serialize(&self) -> Vec<u8> {
        let mut buffer = Vec::new();
        serialize_block(&self.block, &mut buffer);
        buffer.extend_from_slice(&self.offset.to_be_bytes());
        buffer.extend_from_slice(&self.old_value.to_be_bytes());
        buffer
    }
    fn size(&self) -> usize {
        12 + self.block.filename().len() + 8
    }
}

impl From<&[u8]> for SetString {
    fn from(bytes: &[u8]) -> Self {
        let (block, block_size) = deserialize_block(bytes);
        let mut buffer = [0u8; 4];
        buffer.copy_from_slice(&bytes[block_size..(block_size + 4)]);
        let offset = u32::from_be_bytes(buffer);
        buffer.copy_from_slice(&bytes[(block_size + 4)..(block_size + 8)]);
        let len = u32::from_be_bytes(buffer) as usize;
        let old_value =
            String::from_utf8_lossy(&bytes[(block_size + 8)..(block_size + 8 + len)]).into_owned();
        SetString {
            block,
            offset,
            old_value,
        }
    }
}
impl SetString {
    fn serialize(&self) -> Vec<u8> {
        let mut buffer = Vec::new();
        serialize_block(&self.block, &mut buffer);
        buffer.extend_from_slice(&self.offset.to_be_bytes());
        buffer.extend_from_slice(&(self.old_value.len() as u32).to_be_bytes());
        buffer.extend_from_slice(self.old_value.as_bytes());
        buffer
    }
    fn size(&self) -> usize {
        12 + self.block.filename().len() + 8 + self.old_value.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_log_manager() -> Result<()> {
        let dir = tempdir()?;
        let log_file_path = dir.path().join("log");
        let mut log_manager = LogManager::new(log_file_path.to_str().unwrap())?;

        let block = Block::new("student.tbl", 0);
        log_manager.append(TransactionID(1), LogRecordBody::Start)?;
        log_manager.append(
            TransactionID(1),
            LogRecordBody::SetI32(SetI32 {
                block: block.clone(),
                offset: 0,
                old_value: 0,
            }),
        )?;
        log_manager.append(
            TransactionID(1),
            LogRecordBody::SetString(SetString {
                block: block.clone(),
                offset: 4,
                old_value: "Test".to_string(),
            }),
        )?;
        log_manager.append(TransactionID(1), LogRecordBody::Commit)?;
        log_manager.append(TransactionID(2), LogRecordBody::Start)?;
        log_manager.append(TransactionID(2), LogRecordBody::Rollback)?;
        log_manager.flush()?;

        let mut log_manager = LogManager::new(log_file_path.to_str().unwrap())?;
        let records = log_manager.read()?;
        assert_eq!(records.len(), 6);
        assert_eq!(records[0].lsn, LSN(1));
        assert_eq!(records[0].txn_id, TransactionID(1));
        assert_eq!(records[0].body, LogRecordBody::Start);
        assert_eq!(
            records[1].body,
            LogRecordBody::SetI32(SetI32 {
                block: block.clone(),
                offset: 0,
                old_value: 0,
            })
        );
        assert_eq!(
            records[2].body,
            LogRecordBody::SetString(SetString {
                block: block.clone(),
                offset: 4,
                old_value: "Test".to_string(),
            })
        );
        assert_eq!(records[3].body, LogRecordBody::Commit);
        assert_eq!(records[4].txn_id, TransactionID(2));
        assert_eq!(records[5].body, LogRecordBody::Rollback);
        Ok(())
    }

    #[test]
    fn test_lsn_continues_after_restart() -> Result<()> {
        let dir = tempdir()?;
        let log_file_path = dir.path().join("log");
        let mut log_manager = LogManager::new(log_file_path.to_str().unwrap())?;
        let lsn1 = log_manager.append(TransactionID(1), LogRecordBody::Start)?;
        let lsn2 = log_manager.append(TransactionID(1), LogRecordBody::Commit)?;
        assert_eq!(lsn1, LSN(1));
        assert_eq!(lsn2, LSN(2));
        log_manager.flush()?;

        let mut log_manager = LogManager::new(log_file_path.to_str().unwrap())?;
        let lsn3 = log_manager.append(TransactionID(2), LogRecordBody::Start)?;
        assert_eq!(lsn3, LSN(3));
        Ok(())
    }
}
