//! The build-graph engine: the filesystem-tree algebra, the packaging
//! pipeline, the in-process RPC server, the build-task graph, the autoconf
//! helper task groups, the release-config object model, the multilib model,
//! and the build context/driver that ties them together.
//!
//! Everything in this crate is synchronous and single-threaded except for
//! the `fork(2)`-based RPC server in [`rpc`], which is deliberately kept
//! that way (see [`rpc`]'s module docs).

pub mod autoconf;
pub mod buildtask;
pub mod context;
pub mod fstree;
pub mod makefile;
pub mod multilib;
pub mod package;
pub mod relcfg;
pub mod rpc;
pub mod tsort;

use forge_schema::{ConfigError, ExecError, GraphError, RpcError, TreeError};

/// The union of every error kind this crate's modules raise, for callers
/// (principally `forge-cli`) that propagate across module boundaries with a
/// single `?`-friendly type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Tree(#[from] TreeError),

    #[error(transparent)]
    Exec(#[from] ExecError),

    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
