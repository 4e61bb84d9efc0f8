//! Snapshotting and copying directories

use crate::common::write_file;
use crate::snap;
use anyhow::Result;
use std::fs;
use tempfile::TempDir;

#[test]
fn test_snapshot_prints_content_id() -> Result<()> {
    let work = TempDir::new()?;
    let src = work.path().join("src");
    write_file(&src, "a.txt", "alpha");
    write_file(&src, "nested/b.txt", "beta");

    let result = snap!(work.path(), "snapshot", "src").assert_success()?;
    let id = result.snapshot_id().expect("snapshot should print its ID");
    assert!(id.contains("$sha256-"), "unexpected id: {}", id);
    assert!(result.contains_stdout("files"));

    // Same contents, same ID
    let again = snap!(work.path(), "snapshot", "src").assert_success()?;
    assert_eq!(again.snapshot_id(), Some(id));
    Ok(())
}

#[test]
fn test_snapshot_missing_dir_fails() -> Result<()> {
    let work = TempDir::new()?;
    let result = snap!(work.path(), "snapshot", "does-not-exist").assert_failure()?;
    assert!(result.contains_stderr("does-not-exist"));
    Ok(())
}

#[test]
fn test_copy_copies_files() -> Result<()> {
    let work = TempDir::new()?;
    let src = work.path().join("src");
    write_file(&src, "a.txt", "alpha");
    write_file(&src, "nested/deeper/b.txt", "beta");

    snap!(work.path(), "copy", "src", "out").assert_success()?;

    let out = work.path().join("out");
    assert_eq!(fs::read_to_string(out.join("a.txt"))?, "alpha");
    assert_eq!(fs::read_to_string(out.join("nested/deeper/b.txt"))?, "beta");
    Ok(())
}

#[test]
fn test_copy_respects_include() -> Result<()> {
    let work = TempDir::new()?;
    let src = work.path().join("src");
    write_file(&src, "keep/a.txt", "a");
    write_file(&src, "skip/b.txt", "b");

    snap!(work.path(), "copy", "src", "out", "--include", "keep/**").assert_success()?;

    let out = work.path().join("out");
    assert!(out.join("keep/a.txt").exists());
    assert!(!out.join("skip").exists());
    Ok(())
}

#[test]
fn test_copy_into_non_empty_dir_fails() -> Result<()> {
    let work = TempDir::new()?;
    write_file(&work.path().join("src"), "a.txt", "alpha");
    write_file(&work.path().join("out"), "existing.txt", "x");

    let result = snap!(work.path(), "copy", "src", "out").assert_failure()?;
    assert!(result.contains_stderr("error"));
    assert!(!work.path().join("out/a.txt").exists());
    Ok(())
}
