//! `forge end-task`: announce a task's end via RPC.

use std::path::Path;

use anyhow::Result;

/// Send `msg` to the RPC server in `sockdir`.
///
/// # Errors
///
/// Returns an error if the message cannot be delivered.
pub fn end_task(sockdir: &Path, msg: u32) -> Result<()> {
    forge_core::rpc::send_message(sockdir, msg)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_sentinel_returns_without_a_live_server() {
        let dir = tempfile::tempdir().unwrap();
        let sockdir = dir.path().join("sock");
        std::fs::create_dir_all(&sockdir).unwrap();

        end_task(&sockdir, 0).unwrap();
    }

    #[test]
    fn missing_sockdir_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let sockdir = dir.path().join("does-not-exist");

        assert!(end_task(&sockdir, 0).is_err());
    }
}
