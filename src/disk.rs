use std::{
    collections::HashMap,
    fs::{self, File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    path::PathBuf,
};

use anyhow::Result;

use crate::{
    common::{Block, PAGE_SIZE},
    page::Page,
};

/// Raw block I/O over a data directory, one file per filename. Block numbers
/// are allocated by appending to the end of the owning file.
pub struct DiskManager {
    dir: PathBuf,
    files: HashMap<String, File>,
}

impl DiskManager {
    pub fn new(dir: &str) -> Result<Self> {
        fs::create_dir_all(dir)?;
        Ok(Self {
            dir: PathBuf::from(dir),
            files: HashMap::new(),
        })
    }

    pub fn read_block(&mut self, block: &Block, page: &mut Page) -> Result<()> {
        let offset = block.num() * PAGE_SIZE as u64;
        let file = self.file(block.filename())?;
        let size = file.metadata()?.len();
        // Blocks past the end of the file read as all zeroes.
        if offset + PAGE_SIZE as u64 > size {
            page.reset();
            return Ok(());
        }
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(page.data_mut())?;
        Ok(())
    }

    pub fn write_block(&mut self, block: &Block, page: &Page) -> Result<()> {
        let offset = block.num() * PAGE_SIZE as u64;
        let file = self.file(block.filename())?;
        let size = file.metadata()?.len();
        if size < offset {
            file.set_len(offset)?;
        }
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(page.data())?;
        file.sync_all()?;
        Ok(())
    }

    /// Extends the file by one zeroed block and returns its reference.
    pub fn append_block(&mut self, filename: &str) -> Result<Block> {
        let file = self.file(filename)?;
        let num = file.metadata()?.len() / PAGE_SIZE as u64;
        file.seek(SeekFrom::End(0))?;
        file.write_all(&[0u8; PAGE_SIZE])?;
        file.sync_all()?;
        Ok(Block::new(filename, num))
    }

    pub fn num_blocks(&mut self, filename: &str) -> Result<u64> {
        let file = self.file(filename)?;
        Ok(file.metadata()?.len() / PAGE_SIZE as u64)
    }

    fn file(&mut self, filename: &str) -> Result<&mut File> {
        if !self.files.contains_key(filename) {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(self.dir.join(filename))?;
            self.files.insert(filename.to_string(), file);
        }
        Ok(self
            .files
            .get_mut(filename)
            .expect("file opened just above"))
    }
}
