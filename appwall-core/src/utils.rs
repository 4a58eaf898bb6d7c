//! Process and thread helpers, plus log rotation.

use std::path::Path;
use std::process::{Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Timeout for thread join operations during stop()
pub const THREAD_JOIN_TIMEOUT: Duration = Duration::from_secs(3);

/// Log files above this size are rotated on startup
const MAX_LOG_SIZE: u64 = 1024 * 1024;

/// Build a command with stdin closed so helper tools never wait on a terminal.
pub fn hidden_command(program: &str) -> Command {
    let mut cmd = Command::new(program);
    cmd.stdin(Stdio::null());
    cmd
}

/// Check if the current process has root privileges
pub fn is_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}

/// Run a command and turn a non-zero exit status into an error string
/// containing the tool's stderr.
pub fn run_checked(program: &str, args: &[&str]) -> Result<(), String> {
    let output = hidden_command(program)
        .args(args)
        .output()
        .map_err(|e| format!("failed to run {}: {}", program, e))?;

    if output.status.success() {
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    Err(format!(
        "{} {} exited with {}: {}",
        program,
        args.join(" "),
        output.status,
        stderr.trim()
    ))
}

/// Join a thread with a timeout using a polling approach
///
/// `JoinHandle` has no native timeout, so poll `is_finished()` every 100ms.
/// On timeout the handle is forgotten to detach the thread instead of
/// blocking on it; it dies with the process.
pub fn join_with_timeout(handle: JoinHandle<()>, name: &str) -> bool {
    join_with_deadline(handle, name, THREAD_JOIN_TIMEOUT)
}

pub fn join_with_deadline(handle: JoinHandle<()>, name: &str, timeout: Duration) -> bool {
    let start = Instant::now();
    let poll_interval = Duration::from_millis(100);

    if handle.is_finished() {
        let _ = handle.join();
        return true;
    }

    while start.elapsed() < timeout {
        if handle.is_finished() {
            let _ = handle.join();
            log::debug!("{} thread joined successfully", name);
            return true;
        }
        thread::sleep(poll_interval);
    }

    log::error!(
        "{} thread did not stop within {:?} - detaching it",
        name,
        timeout
    );
    std::mem::forget(handle);

    false
}

/// Rotate `log_path` to `<name>.log.old` if it exceeds 1MB
///
/// Returns true if the file was rotated.
pub fn rotate_log_if_needed(log_path: &Path) -> std::io::Result<bool> {
    if !log_path.exists() {
        return Ok(false);
    }

    let metadata = std::fs::metadata(log_path)?;
    if metadata.len() <= MAX_LOG_SIZE {
        return Ok(false);
    }

    let old_path = log_path.with_extension("log.old");
    if old_path.exists() {
        let _ = std::fs::remove_file(&old_path);
    }
    std::fs::rename(log_path, &old_path)?;

    log::info!("Rotated log file: {} -> {}", log_path.display(), old_path.display());
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rotate_log_only_when_large() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("appwall.log");

        assert!(!rotate_log_if_needed(&path).unwrap());

        std::fs::write(&path, b"small").unwrap();
        assert!(!rotate_log_if_needed(&path).unwrap());

        std::fs::write(&path, vec![b'x'; (MAX_LOG_SIZE + 1) as usize]).unwrap();
        assert!(rotate_log_if_needed(&path).unwrap());
        assert!(!path.exists());
        assert!(dir.path().join("appwall.log.old").exists());
    }

    #[test]
    fn test_run_checked_reports_missing_program() {
        let err = run_checked("appwall-definitely-missing-tool", &["--help"]).unwrap_err();
        assert!(err.contains("failed to run"));
    }

    #[test]
    fn test_join_with_timeout_finished_thread() {
        let handle = thread::spawn(|| {});
        assert!(join_with_timeout(handle, "Quick"));
    }

    #[test]
    fn test_join_with_deadline_detaches_stuck_thread() {
        let handle = thread::spawn(|| thread::sleep(Duration::from_secs(2)));
        assert!(!join_with_deadline(handle, "Stuck", Duration::from_millis(150)));
    }
}
