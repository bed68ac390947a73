//! `forge start-task`: truncate this task's log file fresh, then announce
//! the task's start via RPC.

use std::fs::File;
use std::path::Path;

use anyhow::{Context, Result};

/// Truncate (or create) `log` and send `msg` to the RPC server in
/// `sockdir`.
///
/// # Errors
///
/// Returns an error if `log` cannot be created or the message cannot be
/// delivered.
pub fn start_task(log: &Path, sockdir: &Path, msg: u32) -> Result<()> {
    if let Some(parent) = log.parent() {
        std::fs::create_dir_all(parent)?;
    }
    File::create(log).with_context(|| format!("creating log {}", log.display()))?;
    forge_core::rpc::send_message(sockdir, msg)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn truncates_existing_log() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("logs").join("task.log");
        std::fs::create_dir_all(log.parent().unwrap()).unwrap();
        std::fs::File::create(&log).unwrap().write_all(b"stale output").unwrap();
        let sockdir = dir.path().join("sock");
        std::fs::create_dir_all(&sockdir).unwrap();

        // msg 0 is the "stop" sentinel: send_message returns without
        // waiting for a reply, so this exercises the log truncation without
        // needing a live RPC server.
        start_task(&log, &sockdir, 0).unwrap();

        assert_eq!(std::fs::read_to_string(&log).unwrap(), "");
    }

    #[test]
    fn creates_log_directory_if_missing() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("nested").join("task.log");
        let sockdir = dir.path().join("sock");
        std::fs::create_dir_all(&sockdir).unwrap();

        start_task(&log, &sockdir, 0).unwrap();

        assert!(log.exists());
    }
}
