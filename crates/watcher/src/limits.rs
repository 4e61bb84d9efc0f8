//! OS watch limits checked before a watcher starts

use snap_core::{Error, Result};
use tracing::debug;

/// Minimum `fs.inotify.max_user_watches`
pub const LINUX_MIN_WATCHES: u64 = 8192;

/// Minimum `kern.maxfiles` and `kern.maxfilesperproc`
pub const DARWIN_MIN_FILES: u64 = 49152;

/// Fail with `ResourceExhausted` when the OS limits are too low to watch a
/// large tree
pub fn check_limits() -> Result<()> {
    #[cfg(target_os = "linux")]
    {
        let raw = std::fs::read_to_string("/proc/sys/fs/inotify/max_user_watches")
            .map_err(|e| Error::io("/proc/sys/fs/inotify/max_user_watches", e))?;
        check_value("fs.inotify.max_user_watches", &raw, LINUX_MIN_WATCHES)?;
    }

    #[cfg(target_os = "macos")]
    {
        for name in ["kern.maxfiles", "kern.maxfilesperproc"] {
            let output = std::process::Command::new("sysctl")
                .args(["-n", name])
                .output()
                .map_err(|e| Error::io("sysctl", e))?;
            check_value(name, &String::from_utf8_lossy(&output.stdout), DARWIN_MIN_FILES)?;
        }
    }

    Ok(())
}

fn check_value(name: &str, raw: &str, min: u64) -> Result<()> {
    let value: u64 = raw
        .trim()
        .parse()
        .map_err(|_| Error::Internal(format!("unreadable {} value {:?}", name, raw.trim())))?;
    debug!(name, value, min, "checked watch limit");
    if value < min {
        return Err(Error::ResourceExhausted(format!(
            "{} is {}, needs at least {}",
            name, value, min
        )));
    }
    Ok(())
}
