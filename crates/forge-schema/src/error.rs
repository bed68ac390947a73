//! The five error kinds raised throughout the build-graph engine.
//!
//! Each enum is a distinct failure class, not merely a type name: config,
//! graph and tree errors are always synchronous and always abort the run;
//! exec and RPC errors are handled at the coordinator/server boundary and
//! are documented on [`ExecError`] and [`RpcError`] respectively.

use thiserror::Error;

/// Bad release-config input: wrong type, wrong value, a variable touched
/// after finalization, or one of the cross-variable invariants in
/// `relcfg`/`buildcfg`/`multilib` being violated.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("bad type for value of release config variable {name}")]
    BadType { name: String },

    #[error("bad value for release config variable {name}")]
    BadValue { name: String },

    #[error("required release config variable {name} was not set")]
    MissingRequired { name: String },

    #[error("duplicate variable {name}")]
    DuplicateVar { name: String },

    #[error("duplicate variable group {name}")]
    DuplicateGroup { name: String },

    #[error("variable {name} duplicates group")]
    VarDuplicatesGroup { name: String },

    #[error("variable group {name} duplicates variable")]
    GroupDuplicatesVar { name: String },

    #[error("release config variable {name} modified after finalization")]
    ModifiedAfterFinalization { name: String },

    #[error("variable {name} defined after finalization")]
    DefinedAfterFinalization { name: String },

    #[error("unknown component {name}")]
    UnknownComponent { name: String },

    #[error("component {name} not in config")]
    ComponentNotInConfig { name: String },

    #[error("first host not the same as build system")]
    FirstHostNotBuild,

    #[error("inconsistent set of bootstrap components")]
    InconsistentBootstrap,

    #[error("{component} {field} is {actual}, expected {expected}")]
    BootstrapMismatch {
        component: String,
        field: String,
        actual: String,
        expected: String,
    },

    #[error("sysroot suffix for non-sysrooted libc")]
    SysrootSuffixOnNonSysrootLibc,

    #[error("headers suffix for non-sysrooted libc")]
    HeadersSuffixOnNonSysrootLibc,

    #[error("sysroot osdir for non-sysrooted libc")]
    SysrootOsdirOnNonSysrootLibc,

    #[error("{var} contains non-shell-safe value: {value}")]
    NotShellSafe { var: String, value: String },

    #[error("multilib already finalized")]
    MultilibAlreadyFinalized,

    #[error("move_sysroot_executables called for non-sysroot multilib")]
    MoveSysrootExecutablesNonSysroot,
}

/// Malformed or inconsistent build-task graph.
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("duplicate task name {name}")]
    DuplicateTaskName { name: String },

    #[error("empty task name below root")]
    EmptyTaskName,

    #[error("task {name} has both commands and subtasks")]
    CommandsAndSubtasks { name: String },

    #[error("command added to parallel task {name}")]
    CommandOnParallelTask { name: String },

    #[error("install tree ({host}, {name}) already provided/declared/defined/contributed")]
    InstallTreeConflict { host: String, name: String },

    #[error("operation on {name} after finalization")]
    OperationAfterFinalization { name: String },

    #[error("unknown dependency {name}")]
    UnknownDependency { name: String },

    #[error("circular dependency for {name}")]
    CircularDependency { name: String },

    #[error("finalize called on non-top-level task {name}")]
    FinalizeOnNonTopLevel { name: String },

    #[error("a key may be set or prepended in one task, not both: {key}")]
    SetAndPrependConflict { key: String },

    #[error("invalid character in environment value for {key}")]
    InvalidEnvValue { key: String },

    #[error("get_full_env called before finalization")]
    EnvBeforeFinalization,
}

/// Errors from the filesystem-tree algebra.
#[derive(Debug, Error)]
pub enum TreeError {
    #[error("invalid path: {path}")]
    InvalidPath { path: String },

    #[error("path outside root: {path}")]
    OutsideRoot { path: String },

    #[error("absolute symbolic link: {path}")]
    AbsoluteSymlink { path: String },

    #[error("symbolic link cycle: {path}")]
    SymlinkCycle { path: String },

    #[error("non-directory in union: {path}")]
    NonDirectoryInUnion { path: String },

    #[error("inconsistent union contents at {path}")]
    InconsistentUnion { path: String },

    #[error("extract from non-directory: {path}")]
    ExtractFromNonDirectory { path: String },

    #[error("not a directory: {path}")]
    NotADirectory { path: String },

    #[error("symbolic link goes outside {root}: {path}")]
    SymlinkOutsideRoot { root: String, path: String },

    #[error("hash collision: {first} and {second}")]
    HashCollision { first: String, second: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A wrapped command (`make`, a wrapper binary, or the toolchain) exited
/// non-zero, or the coordinator observed the `build-failed` sentinel after
/// the external job runner returned.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("command failed: {command}")]
    CommandFailed { command: String },

    #[error("build failed")]
    BuildFailed,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Non-zero reply status from the coordinator: an exception (panic or
/// propagated error) escaped a registered RPC callback.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("registered callback {id} failed")]
    CallbackFailed { id: u32 },

    #[error("no reply received for message {id}")]
    NoReply { id: u32 },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
