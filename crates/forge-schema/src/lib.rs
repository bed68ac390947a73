//! Shared value types for the build-graph engine.
//!
//! Nothing in this crate touches a filesystem or spawns a process; it holds
//! only the value types that both the engine (`forge-core`) and the driver
//! (`forge-cli`) need to agree on: build configurations, package hosts, and
//! the error taxonomy raised throughout the rest of the workspace.

pub mod buildcfg;
pub mod error;
pub mod pkghost;

pub use buildcfg::BuildCfg;
pub use error::{ConfigError, ExecError, GraphError, RpcError, TreeError};
pub use pkghost::PkgHost;

/// Either a [`PkgHost`] (packaging trees, keyed by host name) or a
/// [`BuildCfg`] (build-time trees, keyed by build-cfg name).
///
/// The install-tree namespace in the original design partitions trees by
/// `(host, name)` where `host` may be either kind of object; both carry a
/// `name` field used for directory naming, which is all this enum needs to
/// expose to the path-derivation logic in `forge-core::relcfg`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum InstallHost {
    /// A packaging host: trees destined for a shipped package.
    Pkg(PkgHost),
    /// A build-time configuration: trees used only while building.
    Build(BuildCfg),
}

impl InstallHost {
    /// The name used to derive directory paths for this host.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            InstallHost::Pkg(h) => &h.name,
            InstallHost::Build(b) => &b.name,
        }
    }
}

/// Key identifying a named install tree: `(host, name)`.
pub type InstallKey = (InstallHost, String);
