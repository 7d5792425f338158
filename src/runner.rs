//! Command execution: spawn a child process, stream its output line by
//! line to the identity's live channel, persist the full transcript.

use crate::files;
use crate::live;
use crate::pkgspec;
use crate::state::AppState;
use crate::store::{self, Store, StoreError, TerminalKind};
use std::io;
use std::path::Path;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tracing::{error, info};

/// Run an arbitrary shell command for an identity. Empty commands are
/// ignored silently.
pub async fn run_shell_command(state: &AppState, user_id: i64, command: &str) {
    let command = command.trim();
    if command.is_empty() {
        return;
    }

    let kind = if pkgspec::is_install_command(command) {
        TerminalKind::Lib
    } else {
        TerminalKind::Cmd
    };
    let invocation = match state.config.venv_activate_prefix() {
        Some(prefix) => format!("{prefix}{command}"),
        None => command.to_string(),
    };
    execute(state, user_id, &invocation, command, kind).await;
}

/// Run a previously saved file for an identity. A missing file yields
/// exactly one error-tagged event and nothing is spawned or persisted.
pub async fn run_saved_file(state: &AppState, user_id: i64, filename: &str) {
    let filename = match files::validate_filename(filename) {
        Ok(filename) => filename.to_string(),
        Err(reason) => {
            live::emit(state, user_id, &format!("[ERROR] Invalid filename: {reason}")).await;
            return;
        }
    };

    let path = state.config.user_code_dir(user_id).join(&filename);
    if !path.exists() {
        live::emit(state, user_id, &format!("[ERROR] File {filename} not found!")).await;
        return;
    }

    live::emit(state, user_id, &format!("[SYSTEM] Executing {filename}...")).await;
    let invocation = format!("{} \"{}\"", state.config.interpreter(), path.display());
    let logged = format!("python {filename}");
    execute(state, user_id, &invocation, &logged, TerminalKind::Exec).await;
}

/// Shared execution path for both invocation modes. Any spawn or read
/// failure is recovered here: one error-tagged event plus one error
/// transcript row, never a propagated failure.
async fn execute(
    state: &AppState,
    user_id: i64,
    invocation: &str,
    logged_command: &str,
    kind: TerminalKind,
) {
    let semaphore = state.run_permit(user_id).await;
    let Ok(_permit) = semaphore.acquire_owned().await else {
        return;
    };

    let cwd = state.config.user_code_dir(user_id);
    let run = async {
        tokio::fs::create_dir_all(&cwd).await?;
        stream_invocation(state, user_id, invocation, &cwd).await
    };

    match run.await {
        Ok(lines) => {
            let transcript = lines.join("\n");
            info!(user_id, command = logged_command, lines = lines.len(), "command finished");
            persist(state, user_id, kind, logged_command, transcript).await;
        }
        Err(e) => {
            let message = format!("Command execution error: {e}");
            live::emit(state, user_id, &message).await;
            persist(state, user_id, TerminalKind::Error, logged_command, message).await;
        }
    }
}

/// Spawn `bash -c <invocation>` and forward stdout line by line, in
/// production order, to the identity's live channel. stderr is drained
/// concurrently and forwarded as one trailing error event after exit.
async fn stream_invocation(
    state: &AppState,
    user_id: i64,
    invocation: &str,
    cwd: &Path,
) -> io::Result<Vec<String>> {
    let mut child = Command::new("bash")
        .arg("-c")
        .arg(invocation)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| io::Error::other("child stdout not captured"))?;
    let mut stderr = child
        .stderr
        .take()
        .ok_or_else(|| io::Error::other("child stderr not captured"))?;

    let stderr_task = tokio::spawn(async move {
        let mut buf = String::new();
        let _ = stderr.read_to_string(&mut buf).await;
        buf
    });

    let mut lines = Vec::new();
    let mut reader = BufReader::new(stdout).lines();
    while let Some(line) = reader.next_line().await? {
        let line = line.trim().to_string();
        live::emit(state, user_id, &line).await;
        lines.push(line);
    }

    let status = child.wait().await?;
    let stderr_text = stderr_task.await.unwrap_or_default();
    if !stderr_text.trim().is_empty() {
        let message = format!("ERROR: {}", stderr_text.trim());
        live::emit(state, user_id, &message).await;
        lines.push(message);
    }
    info!(user_id, exit = ?status.code(), "child exited");

    Ok(lines)
}

async fn persist(
    state: &AppState,
    user_id: i64,
    kind: TerminalKind,
    logged_command: &str,
    transcript: String,
) {
    let store = state.store.clone();
    let command = logged_command.to_string();
    let result = tokio::task::spawn_blocking(move || {
        persist_invocation(&store, user_id, kind, &command, &transcript)
    })
    .await;
    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(user_id, error = %e, "failed to persist transcript"),
        Err(e) => error!(user_id, error = %e, "transcript persist task failed"),
    }
}

/// Persist one transcript row and, for install commands, one install
/// record per parsed package spec.
pub(crate) fn persist_invocation(
    store: &Store,
    user_id: i64,
    kind: TerminalKind,
    command: &str,
    transcript: &str,
) -> Result<(), StoreError> {
    let now_ms = store::now_ms();
    store.append_terminal_log(user_id, kind, command, transcript, now_ms)?;

    if kind == TerminalKind::Lib {
        for spec in pkgspec::parse_install_command(command) {
            let version = pkgspec::version_from_output(transcript, &spec.name)
                .or(spec.version)
                .unwrap_or_else(|| "unknown".to_string());
            store.record_library_install(user_id, &spec.name, &version, command, now_ms)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_store() -> (Store, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Store::open(dir.path().join("webpad.db")).expect("open");
        (store, dir)
    }

    #[test]
    fn install_transcript_writes_library_records() {
        let (store, _dir) = open_store();
        let user = store.resolve_anonymous("10.1.0.1", store::now_ms()).unwrap();
        let transcript = "Collecting requests\nRequirement already satisfied: requests==2.31.0";
        persist_invocation(
            &store,
            user.id,
            TerminalKind::Lib,
            "pip install requests==2.31.0",
            transcript,
        )
        .unwrap();

        let libs = store.libraries(user.id).unwrap();
        assert_eq!(libs.len(), 1);
        assert_eq!(libs[0].name, "requests");
        assert_eq!(libs[0].version, "2.31.0");

        let logs = store.terminal_logs(user.id, 10).unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].terminal_type, "lib");
    }

    #[test]
    fn pinned_version_is_used_when_output_says_nothing() {
        let (store, _dir) = open_store();
        let user = store.resolve_anonymous("10.1.0.2", store::now_ms()).unwrap();
        persist_invocation(
            &store,
            user.id,
            TerminalKind::Lib,
            "pip install flask==3.0.0",
            "Successfully installed flask-3.0.0",
        )
        .unwrap();

        let libs = store.libraries(user.id).unwrap();
        assert_eq!(libs[0].version, "3.0.0");
    }

    #[test]
    fn plain_command_writes_no_library_records() {
        let (store, _dir) = open_store();
        let user = store.resolve_anonymous("10.1.0.3", store::now_ms()).unwrap();
        persist_invocation(&store, user.id, TerminalKind::Cmd, "ls -la", "main.py").unwrap();

        assert!(store.libraries(user.id).unwrap().is_empty());
        assert_eq!(store.terminal_logs(user.id, 10).unwrap().len(), 1);
    }
}
