use std::fmt;

pub const PAGE_SIZE: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TransactionID(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LSN(pub u64);
pub const INVALID_LSN: LSN = LSN(0);

/// Identifies one fixed-size page of a named file. Compared and hashed by value.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Block {
    filename: String,
    num: u64,
}

impl Block {
    pub fn new(filename: &str, num: u64) -> Self {
        Self {
            filename: filename.to_string(),
            num,
        }
    }
    pub fn filename(&self) -> &str {
        &self.filename
    }
    pub fn num(&self) -> u64 {
        self.num
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[file {}, block {}]", self.filename, self.num)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_block_equality_by_value() {
        let a = Block::new("student.tbl", 2);
        let b = Block::new("student.tbl", 2);
        let c = Block::new("student.tbl", 3);
        let d = Block::new("course.tbl", 2);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);

        let mut map = HashMap::new();
        map.insert(a, 1);
        assert_eq!(map.get(&b), Some(&1));
    }

    #[test]
    fn test_block_display() {
        let block = Block::new("student.tbl", 2);
        assert_eq!(block.to_string(), "[file student.tbl, block 2]");
    }
}
