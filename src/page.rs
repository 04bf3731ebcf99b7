use crate::common::PAGE_SIZE;

const I32_SIZE: usize = 4;
const STR_LEN_SIZE: usize = 4;

/// One page-sized byte region. Integers are stored big-endian, strings as a
/// big-endian length prefix followed by UTF-8 bytes.
#[derive(Debug)]
pub struct Page {
    data: Box<[u8]>,
}

impl Page {
    pub fn new() -> Self {
        Self {
            data: vec![0u8; PAGE_SIZE].into(),
        }
    }
    pub fn data(&self) -> &[u8] {
        &self.data
    }
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
    pub fn reset(&mut self) {
        self.data.fill(0);
    }
    pub fn get_i32(&self, offset: usize) -> i32 {
        assert!(offset + I32_SIZE <= PAGE_SIZE);
        let mut bytes = [0u8; I32_SIZE];
        bytes.copy_from_slice(&self.data[offset..(offset + I32_SIZE)]);
        i32::from_be_bytes(bytes)
    }
    pub fn set_i32(&mut self, offset: usize, value: i32) {
        assert!(offset + I32_SIZE <= PAGE_SIZE);
        self.data[offset..(offset + I32_SIZE)].copy_from_slice(&value.to_be_bytes());
    }
    pub fn get_string(&self, offset: usize) -> String {
        assert!(offset + STR_LEN_SIZE <= PAGE_SIZE);
        let mut bytes = [0u8; STR_LEN_SIZE];
        bytes.copy_from_slice(&self.data[offset..(offset + STR_LEN_SIZE)]);
        let len = u32::from_be_bytes(bytes) as usize;
        assert!(offset + STR_LEN_SIZE + len <= PAGE_SIZE);
        String::from_utf8_lossy(&self.data[(offset + STR_LEN_SIZE)..(offset + STR_LEN_SIZE + len)])
            .into_owned()
    }
    pub fn set_string(&mut self, offset: usize, value: &str) {
        let bytes = value.as_bytes();
        assert!(offset + STR_LEN_SIZE + bytes.len() <= PAGE_SIZE);
        self.data[offset..(offset + STR_LEN_SIZE)]
            .copy_from_slice(&(bytes.len() as u32).to_be_bytes());
        self.data[(offset + STR_LEN_SIZE)..(offset + STR_LEN_SIZE + bytes.len())]
            .copy_from_slice(bytes);
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new()
    }
}

/// Fills a freshly appended page with its initial layout. Invoked once per
/// `pin_new`; the record manager supplies the real formatter.
pub trait PageFormatter {
    fn format(&self, page: &mut Page);
}

/// Formatter for layouts whose initial state is all zeroes.
pub struct ZeroFormatter;
impl PageFormatter for ZeroFormatter {
    fn format(&self, page: &mut Page) {
        page.reset();
    }
}
