//! Retention cleanup for rolling log files.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use std::path::Path;
use tracing::{info, warn};

/// File name prefix shared by every rolled log file.
pub const LOG_FILE_PREFIX: &str = "statetrait.log";

/// Delete rolled log files in `log_dir` last modified more than
/// `retention_days` ago. Returns the number of files deleted.
pub fn prune_old_logs(log_dir: impl AsRef<Path>, retention_days: u32) -> Result<usize> {
    let log_dir = log_dir.as_ref();

    if !log_dir.exists() {
        warn!(path = %log_dir.display(), "log directory does not exist");
        return Ok(0);
    }

    let cutoff = Utc::now() - Duration::days(i64::from(retention_days));
    let mut deleted_count = 0;

    for entry in std::fs::read_dir(log_dir).context("failed to read log directory")? {
        let path = entry.context("failed to read directory entry")?.path();

        let is_log = path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.starts_with(LOG_FILE_PREFIX));
        if !is_log {
            continue;
        }

        let modified: DateTime<Utc> = std::fs::metadata(&path)
            .and_then(|meta| meta.modified())
            .context("failed to get file modification time")?
            .into();

        if modified < cutoff {
            std::fs::remove_file(&path).context("failed to delete old log file")?;
            deleted_count += 1;
        }
    }

    if deleted_count > 0 {
        info!(count = deleted_count, "cleaned up old log files");
    }

    Ok(deleted_count)
}
