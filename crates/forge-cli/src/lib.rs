//! forge - driver and CLI front-end for the build-graph engine.
//!
//! This crate is the thin layer spec.md leaves external to the engine
//! itself (component plugins, argument parsing): it loads a release
//! config, wires up the generic autoconf task group for each declared
//! component, renders the makefile, and drives one build. It also
//! implements the wrapper subcommands ([`cmd::run_command`],
//! [`cmd::start_task`], [`cmd::end_task`], [`cmd::rpc_client`]) that
//! [`forge_core::context::BuildContext`] re-invokes this same binary as,
//! in place of the original's `<python-interp> <script-path>` pair.

pub mod cmd;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "forge")]
#[command(author, version, about = "Reproducible cross-toolchain build driver")]
pub struct Cli {
    /// The subcommand to run.
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Load a release config and drive one build.
    Build {
        /// Path to a TOML release-config overlay.
        config: PathBuf,
        /// Object directory root (build scratch space).
        #[arg(long, default_value = "obj")]
        objdir: PathBuf,
        /// Source directory root (where component sources are checked out).
        #[arg(long, default_value = "src")]
        srcdir: PathBuf,
        /// Package output directory.
        #[arg(long, default_value = "pkg")]
        pkgdir: PathBuf,
        /// Per-task log directory; defaults to `<objdir>/logs`.
        #[arg(long)]
        logdir: Option<PathBuf>,
        /// Parallel job count passed to `make -j`; defaults to the number of
        /// available CPUs.
        #[arg(short = 'j', long)]
        jobs: Option<usize>,
    },

    /// Run a wrapped command, logging its output and reporting failure via
    /// RPC. Invoked by the generated makefile, never directly.
    #[command(name = "run-command")]
    RunCommand {
        /// Path to the forge binary (carried through for uniformity with
        /// the start-task/end-task wrappers; unused by this subcommand).
        exe: String,
        /// Literal marker carried through from the wrapper argv.
        marker: String,
        /// Build object directory root, for the `build-failed` sentinel.
        objdir: PathBuf,
        /// Per-task log file to append output to.
        log: PathBuf,
        /// RPC server socket directory.
        sockdir: PathBuf,
        /// Message id to send on failure.
        fail_msg: u32,
        /// Working directory to run the command in.
        cwd: String,
        /// The wrapped command and its arguments.
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        command: Vec<String>,
    },

    /// Announce that a task has started. Invoked by the generated makefile.
    #[command(name = "start-task")]
    StartTask {
        /// Path to the forge binary (unused; see [`Commands::RunCommand`]).
        exe: String,
        /// Literal marker carried through from the wrapper argv.
        marker: String,
        /// Build object directory root (unused by this subcommand).
        objdir: PathBuf,
        /// Per-task log file, truncated fresh for this task.
        log: PathBuf,
        /// RPC server socket directory.
        sockdir: PathBuf,
        /// Message id to send.
        msg: u32,
    },

    /// Announce that a task has finished. Invoked by the generated makefile.
    #[command(name = "end-task")]
    EndTask {
        /// Path to the forge binary (unused; see [`Commands::RunCommand`]).
        exe: String,
        /// Literal marker carried through from the wrapper argv.
        marker: String,
        /// Build object directory root (unused by this subcommand).
        objdir: PathBuf,
        /// Per-task log file (unused by this subcommand).
        log: PathBuf,
        /// RPC server socket directory.
        sockdir: PathBuf,
        /// Message id to send.
        msg: u32,
    },

    /// Send a single RPC message and exit with its reply status. Used for
    /// `BuildStep::Python` steps, whose work happens server-side.
    #[command(name = "rpc-client")]
    RpcClient {
        /// RPC server socket directory.
        sockdir: PathBuf,
        /// Message id to send.
        msg: u32,
    },
}
