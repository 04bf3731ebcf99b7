pub mod buffer;
pub mod common;
pub mod disk;
pub mod instance;
pub mod lock;
pub mod log;
pub mod page;
pub mod recovery;
pub mod transaction;

#[cfg(test)]
pub mod test_helpers;
