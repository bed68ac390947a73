//! `forge rpc-client`: send one RPC message and exit with its reply status.
//! Used for `BuildStep::Python` steps, whose actual work runs server-side
//! in the forked callback; this subcommand is just the client half of that
//! handshake.

use std::path::Path;

use anyhow::Result;

/// Send `msg` to the RPC server in `sockdir` and return its reply status.
///
/// # Errors
///
/// Returns an error if the message cannot be delivered or no reply is
/// received.
pub fn rpc_client(sockdir: &Path, msg: u32) -> Result<i32> {
    Ok(forge_core::rpc::send_message(sockdir, msg)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_sentinel_replies_zero_without_a_live_server() {
        let dir = tempfile::tempdir().unwrap();
        let sockdir = dir.path().join("sock");
        std::fs::create_dir_all(&sockdir).unwrap();

        assert_eq!(rpc_client(&sockdir, 0).unwrap(), 0);
    }
}
