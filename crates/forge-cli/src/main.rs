//! forge - reproducible cross-toolchain build driver

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use forge_cli::cmd;
use forge_cli::{Cli, Commands};

fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let cli = Cli::parse();

    let exit_code = match cli.command {
        Commands::Build { config, objdir, srcdir, pkgdir, logdir, jobs } => {
            cmd::build::build(&config, &objdir, &srcdir, &pkgdir, logdir.as_deref(), jobs)?;
            0
        }
        Commands::RunCommand {
            exe: _,
            marker: _,
            objdir,
            log,
            sockdir,
            fail_msg,
            cwd,
            command,
        } => cmd::run_command::run_command(&objdir, &log, &sockdir, fail_msg, &cwd, &command)?,
        Commands::StartTask {
            exe: _,
            marker: _,
            objdir: _,
            log,
            sockdir,
            msg,
        } => {
            cmd::start_task::start_task(&log, &sockdir, msg)?;
            0
        }
        Commands::EndTask {
            exe: _,
            marker: _,
            objdir: _,
            log: _,
            sockdir,
            msg,
        } => {
            cmd::end_task::end_task(&sockdir, msg)?;
            0
        }
        Commands::RpcClient { sockdir, msg } => cmd::rpc_client::rpc_client(&sockdir, msg)?,
    };

    std::process::exit(exit_code);
}
