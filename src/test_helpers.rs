use std::time::Duration;

use anyhow::Result;
use tempfile::{tempdir, TempDir};

use crate::instance::Instance;

pub fn setup_instance(pool_size: usize, max_wait: Duration) -> Result<(Instance, TempDir)> {
    let dir = tempdir()?;
    let instance = Instance::with_wait_timeout(dir.path().to_str().unwrap(), pool_size, max_wait)?;
    Ok((instance, dir))
}
