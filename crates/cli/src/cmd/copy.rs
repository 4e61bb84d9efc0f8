//! Copy a directory through a snapshot and checkout

use crate::util::{ensure_dir, short_id, CLI_OWNER};
use anyhow::{Context, Result};
use owo_colors::OwoColorize;
use snap_core::Config;
use snap_mirror::{CheckoutRequest, Db, Service};
use std::path::Path;

pub async fn run(config: Config, src: &Path, dest: &Path, include: &[String]) -> Result<()> {
    let db = Db::new(CLI_OWNER, config);
    let (id, _) = super::snapshot::snapshot(&db, src, include).await?;

    let dest = ensure_dir(dest)?;
    let service = Service::new(db);
    let status = service
        .checkout(CheckoutRequest {
            snapshot: id.clone(),
            path: dest.clone(),
        })
        .await
        .with_context(|| format!("Failed to check out into {}", dest.display()))?;

    println!(
        "{} {} files into {} {}",
        "Copied".green().bold(),
        status.files,
        dest.display(),
        format!("({})", short_id(&id)).dimmed()
    );
    Ok(())
}
