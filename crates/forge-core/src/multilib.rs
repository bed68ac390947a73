//! Multilib model: per-target-variant build configuration, derived
//! sysroot/headers/osdir layout, and the `move_sysroot_executables` packaging
//! helper.
//!
//! Grounded on `original_source/sourcery/multilib.py`. A `Multilib` has two
//! lives: the pre-finalization "save" fields recorded at construction (so a
//! release config can declare multilibs before it has finished setting up
//! the variables they default from), and the finalized fields computed once
//! against a [`crate::relcfg::ReleaseConfig`].
//!
//! Component classes (`libc.cls.sysrooted_libc`) are out of scope (spec §1),
//! so [`Multilib::finalize`] takes that bit as an explicit parameter instead
//! of dispatching through a component class — see DESIGN.md.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::rc::Rc;

use forge_schema::{BuildCfg, ConfigError};

use crate::fstree::Lazy;
use crate::relcfg::ReleaseConfig;

fn normpath(path: &str) -> String {
    let mut out: Vec<&str> = Vec::new();
    for component in path.split('/') {
        match component {
            "" | "." => {}
            ".." if out.last().is_some_and(|p| *p != "..") => {
                out.pop();
            }
            _ => out.push(component),
        }
    }
    if out.is_empty() {
        ".".to_string()
    } else {
        out.join("/")
    }
}

/// Describes how target code is built and packaged for one multilib
/// variant.
///
/// A `Multilib` has a corresponding [`BuildCfg`], synthesized at
/// finalization time, but using that `BuildCfg` depends on an install tree
/// containing the relevant compiler being available — there is more than
/// one build of a compiler in general when bootstrapping a cross-compiler,
/// so this type cannot resolve that on its own.
pub struct Multilib {
    compiler: String,
    libc: Option<String>,
    ccopts: Vec<String>,
    tool_opts: BTreeMap<String, Vec<String>>,
    save_sysroot_suffix: Option<String>,
    save_headers_suffix: Option<String>,
    save_sysroot_osdir: Option<String>,
    save_osdir: Option<String>,
    save_target: Option<String>,
    finalized: bool,

    sysroot_suffix: Option<String>,
    headers_suffix: Option<String>,
    sysroot_rel: Option<String>,
    headers_rel: Option<String>,
    sysroot_osdir: Option<String>,
    osdir: Option<String>,
    target: Option<String>,
    build_cfg: Option<BuildCfg>,
}

impl Multilib {
    /// Construct an unfinalized multilib. `compiler` and (optionally)
    /// `libc` are component copy names; `libc` is `None` for multilibs that
    /// use externally built libraries (for example a native compiler using
    /// the host's system libraries).
    #[must_use]
    pub fn new(
        compiler: impl Into<String>,
        libc: Option<String>,
        ccopts: Vec<String>,
        tool_opts: BTreeMap<String, Vec<String>>,
        sysroot_suffix: Option<String>,
        headers_suffix: Option<String>,
        sysroot_osdir: Option<String>,
        osdir: Option<String>,
        target: Option<String>,
    ) -> Self {
        Self {
            compiler: compiler.into(),
            libc,
            ccopts,
            tool_opts,
            save_sysroot_suffix: sysroot_suffix,
            save_headers_suffix: headers_suffix,
            save_sysroot_osdir: sysroot_osdir,
            save_osdir: osdir,
            save_target: target,
            finalized: false,
            sysroot_suffix: None,
            headers_suffix: None,
            sysroot_rel: None,
            headers_rel: None,
            sysroot_osdir: None,
            osdir: None,
            target: None,
            build_cfg: None,
        }
    }

    fn default_osdir(sysroot_osdir: Option<&str>, sysroot_suffix: Option<&str>) -> String {
        match (sysroot_osdir, sysroot_suffix) {
            (Some(osdir), Some(suffix)) => normpath(&format!("{osdir}/{suffix}")),
            _ => ".".to_string(),
        }
    }

    /// Resolve defaults against `relcfg`, synthesizing this multilib's
    /// [`BuildCfg`].
    ///
    /// `libc_is_sysrooted` stands in for `libc.cls.sysrooted_libc` (a
    /// component-class attribute, out of scope here) and is ignored when
    /// this multilib has no libc component, in which case sysroot-ness is
    /// instead determined by whether a `sysroot_suffix` was given at
    /// construction.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MultilibAlreadyFinalized`] if already
    /// finalized, [`ConfigError::ComponentNotInConfig`] if `compiler` or
    /// `libc` do not name registered components, or one of
    /// `ConfigError::{Sysroot,Headers}SuffixOnNonSysrootLibc`/
    /// `SysrootOsdirOnNonSysrootLibc` if a sysroot-related field was given
    /// for a non-sysrooted libc.
    pub fn finalize(&mut self, relcfg: &ReleaseConfig, libc_is_sysrooted: bool) -> Result<(), ConfigError> {
        if self.finalized {
            return Err(ConfigError::MultilibAlreadyFinalized);
        }
        self.finalized = true;
        relcfg.get_component(&self.compiler)?;
        let sysrooted = if let Some(libc) = &self.libc {
            relcfg.get_component(libc)?;
            libc_is_sysrooted
        } else {
            self.save_sysroot_suffix.is_some()
        };

        if sysrooted {
            let sysroot_suffix = self.save_sysroot_suffix.clone().unwrap_or_else(|| ".".to_string());
            let headers_suffix = self.save_headers_suffix.clone().unwrap_or_else(|| ".".to_string());
            let sysroot_osdir = self.save_sysroot_osdir.clone().unwrap_or_else(|| ".".to_string());
            let relcfg_sysroot_rel = relcfg.var("sysroot_rel")?.get()?.as_str().unwrap_or_default().to_string();
            self.sysroot_rel = Some(normpath(&format!("{relcfg_sysroot_rel}/{sysroot_suffix}")));
            self.headers_rel = Some(normpath(&format!("{relcfg_sysroot_rel}/{headers_suffix}")));
            self.sysroot_suffix = Some(sysroot_suffix);
            self.headers_suffix = Some(headers_suffix);
            self.sysroot_osdir = Some(sysroot_osdir);
        } else {
            if self.save_sysroot_suffix.is_some() {
                return Err(ConfigError::SysrootSuffixOnNonSysrootLibc);
            }
            if self.save_headers_suffix.is_some() {
                return Err(ConfigError::HeadersSuffixOnNonSysrootLibc);
            }
            if self.save_sysroot_osdir.is_some() {
                return Err(ConfigError::SysrootOsdirOnNonSysrootLibc);
            }
        }

        self.osdir = Some(self.save_osdir.clone().unwrap_or_else(|| {
            Self::default_osdir(self.sysroot_osdir.as_deref(), self.sysroot_suffix.as_deref())
        }));
        let target = self.save_target.clone().unwrap_or_else(|| {
            relcfg
                .var("target")
                .ok()
                .and_then(|v| v.get().ok())
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_default()
        });
        let relcfg_target = relcfg
            .var("target")?
            .get()?
            .as_str()
            .unwrap_or_default()
            .to_string();
        let tool_prefix = format!("{relcfg_target}-");
        self.build_cfg = Some(BuildCfg::with_options(target.clone(), None, Some(tool_prefix), self.ccopts.clone(), self.tool_opts.clone()));
        self.target = Some(target);
        Ok(())
    }

    /// The synthesized build configuration for code built for this
    /// multilib. `None` before finalization.
    #[must_use]
    pub fn build_cfg(&self) -> Option<&BuildCfg> {
        self.build_cfg.as_ref()
    }

    /// The sysroot-relative suffix for this multilib, or `None` if it is
    /// not sysrooted.
    #[must_use]
    pub fn sysroot_suffix(&self) -> Option<&str> {
        self.sysroot_suffix.as_deref()
    }

    /// The library directory name relative to `lib`, used both inside and
    /// (via [`Multilib::default_osdir`]-style derivation) outside a
    /// sysroot.
    #[must_use]
    pub fn sysroot_osdir(&self) -> Option<&str> {
        self.sysroot_osdir.as_deref()
    }

    /// Move (or, when other multilibs share this sysroot suffix, copy and
    /// leave an empty placeholder behind) executables under each of `dirs`
    /// in `tree` into a per-multilib directory `usr/lib/<sysroot_osdir>/bin`.
    ///
    /// `other_multilibs_share_suffix` stands in for counting sibling
    /// multilibs in the release config's multilib list (out of scope here:
    /// this crate does not maintain that list) sharing this multilib's
    /// `sysroot_suffix`; pass `true` when more than one multilib in the
    /// config shares it.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MoveSysrootExecutablesNonSysroot`] if this
    /// multilib is not sysrooted.
    pub fn move_sysroot_executables(
        &self,
        tree: Rc<Lazy>,
        dirs: &[String],
        other_multilibs_share_suffix: bool,
    ) -> Result<Rc<Lazy>, ConfigError> {
        let Some(sysroot_osdir) = &self.sysroot_osdir else {
            return Err(ConfigError::MoveSysrootExecutablesNonSysroot);
        };
        let dir_dst = normpath(&format!("usr/lib/{sysroot_osdir}/bin"));
        let mut tree = tree;
        for dir_src in dirs {
            let moved = Rc::new(Rc::clone(&tree).move_to(dir_src.clone(), dir_dst.clone()));
            if other_multilibs_share_suffix {
                tree = Rc::new(Rc::clone(&tree).remove(vec![dir_src.clone()]));
            }
            tree = Rc::new(Rc::clone(&tree).union(moved, false));
            if other_multilibs_share_suffix {
                let empty = Rc::new(Rc::new(Lazy::empty()).wrap(dir_src.clone()));
                tree = Rc::new(Rc::clone(&tree).union(empty, false));
            }
        }
        Ok(tree)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relcfg::{ConfigValue, RelcfgBuilder};

    fn base_relcfg() -> ReleaseConfig {
        let mut builder = RelcfgBuilder::new(["gcc".to_string(), "glibc".to_string()]).unwrap();
        builder.group().var_mut("build").unwrap().set(ConfigValue::Str("x86_64-linux-gnu".to_string())).unwrap();
        builder.group().var_mut("target").unwrap().set(ConfigValue::Str("arm-none-eabi".to_string())).unwrap();
        builder.finalize("/obj", "/src", "/pkg").unwrap()
    }

    #[test]
    fn sysrooted_multilib_defaults_suffixes_to_dot() {
        let relcfg = base_relcfg();
        let mut ml = Multilib::new("gcc", Some("glibc".to_string()), vec!["-mthumb".to_string()], BTreeMap::new(), None, None, None, None, None);
        ml.finalize(&relcfg, true).unwrap();
        assert_eq!(ml.sysroot_suffix(), Some("."));
        assert_eq!(ml.build_cfg().unwrap().triplet, "arm-none-eabi");
    }

    #[test]
    fn non_sysrooted_multilib_rejects_sysroot_suffix() {
        let relcfg = base_relcfg();
        let mut ml = Multilib::new("gcc", None, vec![], BTreeMap::new(), Some("thumb".to_string()), None, None, None, None);
        let err = ml.finalize(&relcfg, false).unwrap_err();
        assert!(matches!(err, ConfigError::SysrootSuffixOnNonSysrootLibc));
    }

    #[test]
    fn finalize_twice_errors() {
        let relcfg = base_relcfg();
        let mut ml = Multilib::new("gcc", None, vec![], BTreeMap::new(), None, None, None, None, None);
        ml.finalize(&relcfg, false).unwrap();
        let err = ml.finalize(&relcfg, false).unwrap_err();
        assert!(matches!(err, ConfigError::MultilibAlreadyFinalized));
    }

    #[test]
    fn move_sysroot_executables_with_single_multilib_leaves_original() {
        let relcfg = base_relcfg();
        let mut ml = Multilib::new("gcc", Some("glibc".to_string()), vec![], BTreeMap::new(), None, None, None, None, None);
        ml.finalize(&relcfg, true).unwrap();
        let tree = Rc::new(Lazy::copy(PathBuf::from("/fake/sysroot")));
        let result = ml.move_sysroot_executables(tree, &["usr/bin".to_string()], false).unwrap();
        assert!(result.install_trees().is_empty());
    }
}
