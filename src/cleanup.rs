//! Retention sweep over materialized code files.

use crate::state::Config;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::time::interval;
use tracing::{info, warn};

const SWEEP_INTERVAL_SECS: u64 = 3600;

/// Sweep at startup and then on a fixed interval.
pub async fn run_periodic(config: Arc<Config>) {
    let mut interval = interval(Duration::from_secs(SWEEP_INTERVAL_SECS));
    loop {
        interval.tick().await;
        let config = config.clone();
        let result = tokio::task::spawn_blocking(move || {
            sweep_old_files(&config.code_dir(), config.retention_days)
        })
        .await;
        match result {
            Ok(removed) if removed > 0 => info!(removed, "retention sweep removed files"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "retention sweep task failed"),
        }
    }
}

/// Remove materialized files older than the retention window and drop
/// identity directories left empty. Returns the number of files removed.
pub fn sweep_old_files(code_dir: &Path, retention_days: u64) -> usize {
    let cutoff = SystemTime::now() - Duration::from_secs(retention_days * 24 * 3600);
    let mut removed = 0;

    let Ok(entries) = fs::read_dir(code_dir) else {
        return 0;
    };
    for entry in entries.flatten() {
        let dir = entry.path();
        if !dir.is_dir() {
            continue;
        }
        if let Ok(files) = fs::read_dir(&dir) {
            for file in files.flatten() {
                let stale = file
                    .metadata()
                    .and_then(|meta| meta.modified())
                    .map(|modified| modified < cutoff)
                    .unwrap_or(false);
                if stale && fs::remove_file(file.path()).is_ok() {
                    removed += 1;
                }
            }
        }
        let empty = fs::read_dir(&dir)
            .map(|mut it| it.next().is_none())
            .unwrap_or(false);
        if empty {
            let _ = fs::remove_dir(&dir);
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_code_dir_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(sweep_old_files(&dir.path().join("code_files"), 7), 0);
    }

    #[test]
    fn fresh_files_survive_the_sweep() {
        let dir = tempfile::tempdir().unwrap();
        let user_dir = dir.path().join("42");
        fs::create_dir_all(&user_dir).unwrap();
        fs::write(user_dir.join("main.py"), "print(1)").unwrap();

        assert_eq!(sweep_old_files(dir.path(), 7), 0);
        assert!(user_dir.join("main.py").exists());
    }

    #[test]
    fn empty_identity_dirs_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let user_dir = dir.path().join("7");
        fs::create_dir_all(&user_dir).unwrap();

        sweep_old_files(dir.path(), 7);
        assert!(!user_dir.exists());
    }
}
