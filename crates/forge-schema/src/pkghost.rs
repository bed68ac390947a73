//! `PkgHost`: a host for which packages are built.

use crate::buildcfg::BuildCfg;

/// A `PkgHost` represents a host for which packages are built.
///
/// Host code in such packages is typically built with the tools for the
/// corresponding [`BuildCfg`]. Each host in a configuration must have a
/// distinct name — usually the GNU triplet, though not always (for example,
/// two hosts may share a triplet but differ in hard-float vs. soft-float
/// tool configuration).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PkgHost {
    /// The unique name of this host within a release config.
    pub name: String,
    /// The build configuration used for host-side code in this package.
    pub build_cfg: BuildCfg,
}

impl PkgHost {
    /// Construct a `PkgHost` from a name used directly as a GNU triplet.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let build_cfg = BuildCfg::new(name.clone());
        Self { name, build_cfg }
    }

    /// Construct a `PkgHost` with an explicit build configuration.
    #[must_use]
    pub fn with_build_cfg(name: impl Into<String>, build_cfg: BuildCfg) -> Self {
        Self {
            name: name.into(),
            build_cfg,
        }
    }

    /// Whether packages for this host can use symlinks (false on Windows,
    /// where the packaging pipeline rewrites symlinks to hard links).
    #[must_use]
    pub fn have_symlinks(&self) -> bool {
        !self.build_cfg.is_windows()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn native_host_has_symlinks() {
        let host = PkgHost::new("x86_64-linux-gnu");
        assert!(host.have_symlinks());
    }

    #[test]
    fn mingw_host_has_no_symlinks() {
        let host = PkgHost::new("x86_64-w64-mingw32");
        assert!(!host.have_symlinks());
    }
}
