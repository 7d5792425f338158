//! Saved-file materialization: upsert the row, mirror onto the filesystem.

use crate::live;
use crate::state::AppState;
use crate::store;
use tracing::{error, info};

/// Validate a user-supplied filename before any database or filesystem
/// work. Rejects path separators and traversal components so the join onto
/// the per-identity directory cannot escape it.
pub fn validate_filename(filename: &str) -> Result<&str, &'static str> {
    let filename = filename.trim();
    if filename.is_empty() {
        return Err("empty filename");
    }
    if filename == "." || filename == ".." {
        return Err("traversal component");
    }
    if filename.contains('/') || filename.contains('\\') {
        return Err("path separator");
    }
    if filename.contains('\0') {
        return Err("NUL byte");
    }
    Ok(filename)
}

/// Save one file for an identity: upsert the database row, then overwrite
/// the materialized copy under the identity's code directory. Failures are
/// surfaced as one error-tagged live event.
pub async fn save_file(state: &AppState, user_id: i64, filename: &str, content: &str) {
    let filename = match validate_filename(filename) {
        Ok(filename) => filename.to_string(),
        Err(reason) => {
            live::emit(state, user_id, &format!("[ERROR] Invalid filename: {reason}")).await;
            return;
        }
    };

    let store = state.store.clone();
    let (db_filename, db_content) = (filename.clone(), content.to_string());
    let saved = tokio::task::spawn_blocking(move || {
        store.save_code_file(user_id, &db_filename, &db_content, store::now_ms())
    })
    .await;
    match saved {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            error!(user_id, %filename, error = %e, "failed to save file");
            live::emit(state, user_id, "[ERROR] Could not save file").await;
            return;
        }
        Err(e) => {
            error!(user_id, %filename, error = %e, "save task failed");
            live::emit(state, user_id, "[ERROR] Could not save file").await;
            return;
        }
    }

    let dir = state.config.user_code_dir(user_id);
    let write = async {
        tokio::fs::create_dir_all(&dir).await?;
        tokio::fs::write(dir.join(&filename), content).await
    };
    if let Err(e) = write.await {
        error!(user_id, %filename, error = %e, "failed to materialize file");
        live::emit(state, user_id, "[ERROR] Could not save file").await;
        return;
    }
    info!(user_id, %filename, "file saved");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_filenames_and_trims() {
        assert_eq!(validate_filename("main.py"), Ok("main.py"));
        assert_eq!(validate_filename("  util.py  "), Ok("util.py"));
        assert_eq!(validate_filename("notes..txt"), Ok("notes..txt"));
    }

    #[test]
    fn rejects_traversal_and_separators() {
        assert!(validate_filename("").is_err());
        assert!(validate_filename("   ").is_err());
        assert!(validate_filename(".").is_err());
        assert!(validate_filename("..").is_err());
        assert!(validate_filename("../etc/passwd").is_err());
        assert!(validate_filename("a/b.py").is_err());
        assert!(validate_filename("a\\b.py").is_err());
        assert!(validate_filename("a\0b.py").is_err());
    }
}
