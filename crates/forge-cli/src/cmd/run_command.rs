//! `forge run-command`: run one wrapped command, appending its output to a
//! per-task log, writing the `build-failed` sentinel and notifying the
//! coordinator via RPC on non-zero exit.
//!
//! Ground truth: `original_source/sourcery/build.py`'s `run_command`, which
//! this keeps as a re-exec of the running binary rather than a Python
//! function called in-process, so it still runs under `make`'s own process
//! tree even though the command it wraps may itself be `make -C ...`.

use std::fs::OpenOptions;
use std::path::Path;
use std::process::{Command, Stdio};

use anyhow::{Context, Result};

/// Run `command` in `cwd`, appending its output to `log`. On non-zero exit,
/// writes the `build-failed` sentinel under `objdir` and sends `fail_msg`
/// to the RPC server in `sockdir`.
///
/// Returns the command's exit code (`0` on success), for the caller to
/// propagate via [`std::process::exit`].
///
/// # Errors
///
/// Returns an error if the log cannot be opened or the command cannot be
/// spawned.
pub fn run_command(objdir: &Path, log: &Path, sockdir: &Path, fail_msg: u32, cwd: &str, command: &[String]) -> Result<i32> {
    if let Some(parent) = log.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let log_out = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log)
        .with_context(|| format!("opening log {}", log.display()))?;
    let log_err = log_out.try_clone()?;

    let (prog, args) = command.split_first().context("empty command")?;
    let status = Command::new(prog)
        .args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(log_out)
        .stderr(log_err)
        .status()
        .with_context(|| format!("running {}", command.join(" ")))?;

    if status.success() {
        return Ok(0);
    }

    std::fs::write(objdir.join("build-failed"), b"")?;
    let _ = forge_core::rpc::send_message(sockdir, fail_msg);
    Ok(status.code().unwrap_or(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn successful_command_appends_output_and_writes_no_sentinel() {
        let dir = tempfile::tempdir().unwrap();
        let objdir = dir.path().join("obj");
        std::fs::create_dir_all(&objdir).unwrap();
        let log = dir.path().join("logs").join("task.log");
        let sockdir = dir.path().join("sock");
        std::fs::create_dir_all(&sockdir).unwrap();

        let code = run_command(
            &objdir,
            &log,
            &sockdir,
            1,
            dir.path().to_str().unwrap(),
            &["echo".to_string(), "hi".to_string()],
        )
        .unwrap();

        assert_eq!(code, 0);
        let contents = std::fs::read_to_string(&log).unwrap();
        assert!(contents.contains("hi"));
        assert!(!objdir.join("build-failed").exists());
    }

    #[test]
    fn failing_command_writes_sentinel_and_nonzero_code() {
        let dir = tempfile::tempdir().unwrap();
        let objdir = dir.path().join("obj");
        std::fs::create_dir_all(&objdir).unwrap();
        let log = dir.path().join("task.log");
        let sockdir = dir.path().join("sock");

        let code = run_command(
            &objdir,
            &log,
            &sockdir,
            1,
            dir.path().to_str().unwrap(),
            &["false".to_string()],
        )
        .unwrap();

        assert_ne!(code, 0);
        assert!(objdir.join("build-failed").exists());
    }

    #[test]
    fn appends_rather_than_truncates_across_calls() {
        let dir = tempfile::tempdir().unwrap();
        let objdir = dir.path().join("obj");
        std::fs::create_dir_all(&objdir).unwrap();
        let log = dir.path().join("task.log");
        let sockdir = dir.path().join("sock");

        for _ in 0..2 {
            run_command(
                &objdir,
                &log,
                &sockdir,
                1,
                dir.path().to_str().unwrap(),
                &["echo".to_string(), "line".to_string()],
            )
            .unwrap();
        }

        let contents = std::fs::read_to_string(&log).unwrap();
        assert_eq!(contents.matches("line").count(), 2);
    }
}
