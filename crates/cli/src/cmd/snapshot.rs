//! Snapshot a directory and report its content ID

use crate::util::{existing_dir, matcher_from, CLI_OWNER};
use anyhow::{Context, Result};
use owo_colors::OwoColorize;
use snap_core::{Config, SnapshotId};
use snap_mirror::{Db, Service, SnapshotDirRequest};
use std::path::Path;
use tokio_util::sync::CancellationToken;

pub async fn run(config: Config, dir: &Path, include: &[String]) -> Result<()> {
    let db = Db::new(CLI_OWNER, config);
    let (id, files) = snapshot(&db, dir, include).await?;

    println!("{}", id);
    println!("{} {}", files.to_string().bold(), "files".dimmed());
    Ok(())
}

/// Snapshot `dir` into `db`, returning the ID and its file count
pub(crate) async fn snapshot(db: &Db, dir: &Path, include: &[String]) -> Result<(SnapshotId, usize)> {
    let root = existing_dir(dir)?;
    let matcher = matcher_from(include)?;
    let service = Service::new(db.clone());

    let id = service
        .snapshot_dir(SnapshotDirRequest {
            path: root.clone(),
            matcher,
        })
        .await
        .with_context(|| format!("Failed to snapshot {}", root.display()))?;

    let tree = db
        .materializer()
        .materialize_all(&id, &CancellationToken::new())
        .await
        .context("Failed to evaluate snapshot")?;
    Ok((id, tree.len()))
}
