//! Mirror a directory into a pointer, optionally following it elsewhere
//!
//! Runs in the foreground until interrupted.

use crate::util::{ensure_dir, existing_dir, matcher_from, short_id, CLI_OWNER};
use anyhow::{Context, Result};
use owo_colors::OwoColorize;
use snap_core::{Config, PointerId, PointerKind};
use snap_mirror::{Db, FollowRequest, MirrorStartRequest, Service};
use std::path::Path;
use std::time::Duration;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::info;

const FAILURE_POLL: Duration = Duration::from_secs(1);

pub async fn run(
    config: Config,
    dir: &Path,
    pointer: &str,
    to: Option<&Path>,
    include: &[String],
) -> Result<()> {
    let root = existing_dir(dir)?;
    let pointer = PointerId::new(CLI_OWNER, PointerId::normalize_name(pointer), PointerKind::Workspace)
        .context("Invalid pointer name")?;
    let service = Service::new(Db::new(CLI_OWNER, config));

    let status = service
        .fs2wm_start(MirrorStartRequest {
            pointer: pointer.clone(),
            path: root.clone(),
            matcher: matcher_from(include)?,
        })
        .await
        .with_context(|| format!("Failed to mirror {}", root.display()))?;
    println!(
        "{} {} {} {}",
        "Mirroring".green().bold(),
        root.display(),
        "->".dimmed(),
        pointer.cyan()
    );
    info!(head = status.head.rev, "mirror started");

    if let Some(to) = to {
        let dest = ensure_dir(to)?;
        service
            .wm2fs_start(FollowRequest {
                pointer: pointer.clone(),
                path: dest.clone(),
            })
            .await
            .with_context(|| format!("Failed to follow into {}", dest.display()))?;
        println!(
            "{} {} {} {}",
            "Following".green().bold(),
            pointer.cyan(),
            "->".dimmed(),
            dest.display()
        );
    }

    let result = watch(&service, &pointer).await;
    service.shutdown().await;
    result
}

/// Print every new revision until interrupted or the mirror fails
async fn watch(service: &Service, pointer: &PointerId) -> Result<()> {
    let cancel = CancellationToken::new();
    let interrupt = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        })
    };

    let pointers = service.db().pointers().clone();
    let mut rev = service
        .fs2wm_pointer_status(pointer)
        .await
        .map(|s| s.head.rev)
        .unwrap_or(0);
    println!("{} {}", format!("r{}", rev).bold(), "(start)".dimmed());

    let result = loop {
        // Wake periodically so a mirror failing without a new revision is noticed
        match timeout(FAILURE_POLL, pointers.wait(pointer, rev, &cancel)).await {
            Ok(Ok(head)) => {
                rev = head.rev;
                println!("{} {}", format!("r{}", rev).bold(), short_id(&head.snapshot));
            }
            Ok(Err(e)) if e.is_canceled() => break Ok(()),
            Ok(Err(e)) => break Err(e).context("Failed waiting for pointer updates"),
            Err(_) => {}
        }
        if let Some(failure) = service.mirrors().get(pointer).ok().and_then(|m| m.failure()) {
            break Err(failure).context("Mirror stopped");
        }
    };
    interrupt.abort();
    result
}
