//! Showing and validating configuration

use crate::common::cli::TEST_CONFIG;
use crate::snap;
use anyhow::Result;
use std::fs;
use tempfile::TempDir;

#[test]
fn test_config_prints_toml() -> Result<()> {
    let work = TempDir::new()?;
    let result = snap!(work.path(), "config").assert_success()?;
    assert!(result.contains_stdout("[mirror]"));
    assert!(result.contains_stdout("mirror_write_limit"));
    assert!(result.contains_stdout(TEST_CONFIG));
    Ok(())
}

#[test]
fn test_invalid_config_fails() -> Result<()> {
    let work = TempDir::new()?;
    fs::write(work.path().join(TEST_CONFIG), "[mirror]\nwrite_window_secs = 0\n")?;
    snap!(work.path(), "config").assert_failure()?;
    Ok(())
}
