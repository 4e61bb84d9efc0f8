//! Helpers for running the `snap` binary with timing

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{Duration, Instant};

/// Config file written next to every test run
pub const TEST_CONFIG: &str = "snap-test.toml";

/// CLI command builder
///
/// Runs with `--config snap-test.toml`; the file is created with OS limit
/// checks disabled unless the test already wrote one.
pub struct SnapCommand {
    working_dir: PathBuf,
    args: Vec<String>,
    env: HashMap<String, String>,
}

impl SnapCommand {
    pub fn new(working_dir: impl AsRef<Path>) -> Self {
        Self {
            working_dir: working_dir.as_ref().to_path_buf(),
            args: Vec::new(),
            env: HashMap::new(),
        }
    }

    pub fn args(&mut self, args: &[&str]) -> &mut Self {
        self.args.extend(args.iter().map(|s| s.to_string()));
        self
    }

    pub fn env(&mut self, key: &str, value: &str) -> &mut Self {
        self.env.insert(key.to_string(), value.to_string());
        self
    }

    /// Run the command and collect its output
    pub fn execute(&self) -> Result<CommandResult> {
        let config = self.working_dir.join(TEST_CONFIG);
        if !config.exists() {
            fs::write(&config, "[watcher]\nlimit_checks_enabled = false\n")
                .context("Failed to write test config")?;
        }

        let start = Instant::now();
        let output = Command::new(env!("CARGO_BIN_EXE_snap"))
            .arg("--config")
            .arg(&config)
            .args(&self.args)
            .current_dir(&self.working_dir)
            .env_remove("SNAP_DEBUG")
            .envs(&self.env)
            .output()
            .context("Failed to execute snap")?;

        Ok(CommandResult {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code().unwrap_or(-1),
            duration: start.elapsed(),
        })
    }

    pub fn assert_success(&self) -> Result<CommandResult> {
        let result = self.execute()?;
        if !result.success() {
            anyhow::bail!(
                "Command failed (exit code: {}):\nArgs: {:?}\nStdout: {}\nStderr: {}",
                result.exit_code,
                self.args,
                result.stdout,
                result.stderr
            );
        }
        Ok(result)
    }

    pub fn assert_failure(&self) -> Result<CommandResult> {
        let result = self.execute()?;
        if result.success() {
            anyhow::bail!(
                "Command should have failed but succeeded:\nArgs: {:?}\nStdout: {}",
                self.args,
                result.stdout
            );
        }
        Ok(result)
    }
}

/// Output of one run
#[derive(Debug, Clone)]
pub struct CommandResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub duration: Duration,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn contains_stdout(&self, text: &str) -> bool {
        self.stdout.contains(text)
    }

    pub fn contains_stderr(&self, text: &str) -> bool {
        self.stderr.contains(text)
    }

    /// First snapshot ID printed on stdout
    pub fn snapshot_id(&self) -> Option<String> {
        self.stdout.lines().find_map(extract_snapshot_id)
    }
}

/// Pull a `<owner>$<body>` snapshot ID out of a line
pub fn extract_snapshot_id(line: &str) -> Option<String> {
    line.split_whitespace()
        .find(|word| {
            word.split_once('$').map_or(false, |(owner, body)| {
                owner.len() == 16 && owner.chars().all(|c| c.is_ascii_hexdigit()) && !body.is_empty()
            })
        })
        .map(str::to_string)
}

/// Build a [`SnapCommand`] from a directory and arguments
///
/// Usage:
/// ```ignore
/// snap!(dir, "copy", "src", "out").assert_success()?;
/// ```
#[macro_export]
macro_rules! snap {
    ($dir:expr, $($arg:expr),*) => {{
        let mut cmd = $crate::common::cli::SnapCommand::new($dir);
        cmd.args(&[$($arg),*]);
        cmd
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_id_extraction() {
        let line = format!("0000000000000001$sha256-{}", "ab".repeat(32));
        assert_eq!(extract_snapshot_id(&line), Some(line.clone()));
        assert_eq!(extract_snapshot_id("id: 0000000000000000$empty (0 files)").as_deref(), Some("0000000000000000$empty"));
        assert_eq!(extract_snapshot_id("cost: $5"), None);
    }
}
