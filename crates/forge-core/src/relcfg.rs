//! Release-configuration object model: typed, finalizable variables grouped
//! per-component, plus the derived paths (`objdir_path`, `install_tree_path`,
//! `install_tree_fstree`, `pkgdir_path`) the rest of the engine is built
//! against.
//!
//! This is a direct translation of `ConfigVarGroup`/`ConfigVar`/
//! `ComponentInConfig` from `original_source/sourcery/relcfg.py`, scoped down
//! per this port's design: the Python `exec`-based config language becomes a
//! programmatic builder ([`RelcfgBuilder`]) plus an optional TOML overlay
//! ([`RelcfgDocument`]) applied through a [`ReleaseConfigLoader`]. The VC
//! checkout subsystem is out of scope (spec §1), so values that reference a
//! version-control location are carried as opaque strings rather than typed
//! `VC` objects.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use forge_schema::{BuildCfg, ConfigError, InstallHost, InstallKey, PkgHost};

use crate::fstree::Lazy;

/// The closed set of shapes a [`ConfigVar`] may hold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigVarType {
    /// A string.
    Str,
    /// A signed integer.
    Int,
    /// A `PkgHost`, or a string promoted to one.
    PkgHost,
    /// A `BuildCfg`, or a string promoted to one.
    BuildCfg,
    /// A homogeneous list.
    List(Box<ConfigVarType>),
    /// A homogeneous-key, homogeneous-value mapping.
    Dict(Box<ConfigVarType>, Box<ConfigVarType>),
    /// One of a fixed set of strings.
    StrEnum(BTreeSet<String>),
}

impl ConfigVarType {
    /// Type-check (and, for scalar promotions, convert) `value` against this
    /// descriptor.
    fn check(&self, name: &str, value: ConfigValue) -> Result<ConfigValue, ConfigError> {
        match (self, value) {
            (ConfigVarType::Str, v @ ConfigValue::Str(_)) => Ok(v),
            (ConfigVarType::Int, v @ ConfigValue::Int(_)) => Ok(v),
            (ConfigVarType::PkgHost, v @ ConfigValue::PkgHost(_)) => Ok(v),
            (ConfigVarType::PkgHost, ConfigValue::Str(s)) => Ok(ConfigValue::PkgHost(PkgHost::new(s))),
            (ConfigVarType::BuildCfg, v @ ConfigValue::BuildCfg(_)) => Ok(v),
            (ConfigVarType::BuildCfg, ConfigValue::Str(s)) => Ok(ConfigValue::BuildCfg(BuildCfg::new(s))),
            (ConfigVarType::StrEnum(allowed), ConfigValue::Str(s)) => {
                if allowed.contains(&s) {
                    Ok(ConfigValue::Str(s))
                } else {
                    Err(ConfigError::BadValue { name: name.to_string() })
                }
            }
            (ConfigVarType::List(elt), ConfigValue::List(items)) => {
                let checked = items
                    .into_iter()
                    .map(|item| elt.check(name, item))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(ConfigValue::List(checked))
            }
            (ConfigVarType::Dict(kt, vt), ConfigValue::Dict(map)) => {
                let mut out = BTreeMap::new();
                for (k, v) in map {
                    kt.check(name, ConfigValue::Str(k.clone()))?;
                    out.insert(k, vt.check(name, v)?);
                }
                Ok(ConfigValue::Dict(out))
            }
            _ => Err(ConfigError::BadType { name: name.to_string() }),
        }
    }
}

/// A runtime value held by a [`ConfigVar`].
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigValue {
    Str(String),
    Int(i64),
    PkgHost(PkgHost),
    BuildCfg(BuildCfg),
    List(Vec<ConfigValue>),
    Dict(BTreeMap<String, ConfigValue>),
}

impl ConfigValue {
    /// Borrow the value as a string, if it is one.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ConfigValue::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Borrow the value as an integer, if it is one.
    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            ConfigValue::Int(n) => Some(*n),
            _ => None,
        }
    }

    /// Borrow the value as a `PkgHost`, if it is one.
    #[must_use]
    pub fn as_pkg_host(&self) -> Option<&PkgHost> {
        match self {
            ConfigValue::PkgHost(h) => Some(h),
            _ => None,
        }
    }

    /// Borrow the value as a list, if it is one.
    #[must_use]
    pub fn as_list(&self) -> Option<&[ConfigValue]> {
        match self {
            ConfigValue::List(items) => Some(items),
            _ => None,
        }
    }

    /// Borrow the value as a dict, if it is one.
    #[must_use]
    pub fn as_dict(&self) -> Option<&BTreeMap<String, ConfigValue>> {
        match self {
            ConfigValue::Dict(map) => Some(map),
            _ => None,
        }
    }
}

/// A single typed, finalizable configuration variable.
#[derive(Debug, Clone)]
pub struct ConfigVar {
    name: String,
    var_type: ConfigVarType,
    value: Option<ConfigValue>,
    /// Whether `value` was set by an explicit `set` call, as opposed to a
    /// computed default installed via `set_implicit`.
    explicit: bool,
    internal: bool,
    finalized: bool,
}

impl ConfigVar {
    fn new(name: impl Into<String>, var_type: ConfigVarType, value: Option<ConfigValue>, internal: bool) -> Self {
        Self {
            name: name.into(),
            var_type,
            value,
            explicit: false,
            internal,
            finalized: false,
        }
    }

    fn require_not_finalized(&self) -> Result<(), ConfigError> {
        if self.finalized {
            Err(ConfigError::ModifiedAfterFinalization { name: self.name.clone() })
        } else {
            Ok(())
        }
    }

    /// Set this variable's value explicitly; fails after finalization.
    pub fn set(&mut self, value: ConfigValue) -> Result<(), ConfigError> {
        self.require_not_finalized()?;
        self.value = Some(self.var_type.check(&self.name, value)?);
        self.explicit = true;
        Ok(())
    }

    /// Set a computed default; does not flip the explicit bit, so a later
    /// explicit `set` still counts as the user's own choice.
    pub fn set_implicit(&mut self, value: ConfigValue) -> Result<(), ConfigError> {
        self.require_not_finalized()?;
        self.value = Some(self.var_type.check(&self.name, value)?);
        Ok(())
    }

    /// The current value, or [`ConfigError::MissingRequired`] if unset.
    pub fn get(&self) -> Result<&ConfigValue, ConfigError> {
        self.value.as_ref().ok_or_else(|| ConfigError::MissingRequired { name: self.name.clone() })
    }

    /// Whether the value was set via an explicit `set` call.
    #[must_use]
    pub fn get_explicit(&self) -> bool {
        self.explicit
    }

    /// Whether this variable is internal (derived, not user-settable
    /// directly through a config overlay).
    #[must_use]
    pub fn is_internal(&self) -> bool {
        self.internal
    }

    fn finalize(&mut self) {
        self.finalized = true;
    }
}

/// A namespace of named [`ConfigVar`]s and nested groups, with hierarchical
/// dotted names.
#[derive(Debug, Clone)]
pub struct ConfigVarGroup {
    name_prefix: String,
    vars: BTreeMap<String, ConfigVar>,
    groups: BTreeMap<String, ConfigVarGroup>,
    finalized: bool,
}

impl ConfigVarGroup {
    /// Create an empty group. `name_prefix` is prepended (with no separator
    /// assumptions beyond what the caller supplies) to the dotted names of
    /// variables and groups added here, for diagnostics.
    #[must_use]
    pub fn new(name_prefix: impl Into<String>) -> Self {
        Self {
            name_prefix: name_prefix.into(),
            vars: BTreeMap::new(),
            groups: BTreeMap::new(),
            finalized: false,
        }
    }

    fn dotted(&self, name: &str) -> String {
        format!("{}{name}", self.name_prefix)
    }

    /// Add a variable to this group.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if the group is already finalized, or if
    /// `name` duplicates an existing variable or group.
    pub fn add_var(
        &mut self,
        name: impl Into<String>,
        var_type: ConfigVarType,
        value: Option<ConfigValue>,
        internal: bool,
    ) -> Result<(), ConfigError> {
        let name = name.into();
        if self.finalized {
            return Err(ConfigError::DefinedAfterFinalization { name: self.dotted(&name) });
        }
        if self.vars.contains_key(&name) {
            return Err(ConfigError::DuplicateVar { name: self.dotted(&name) });
        }
        if self.groups.contains_key(&name) {
            return Err(ConfigError::VarDuplicatesGroup { name: self.dotted(&name) });
        }
        let dotted = self.dotted(&name);
        let mut var = ConfigVar::new(dotted, var_type, None, internal);
        if let Some(value) = value {
            var.set_implicit(value)?;
        }
        self.vars.insert(name, var);
        Ok(())
    }

    /// Add and return a nested group.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if the group is already finalized, or if
    /// `name` duplicates an existing variable or group.
    pub fn add_group(&mut self, name: impl Into<String>) -> Result<&mut ConfigVarGroup, ConfigError> {
        let name = name.into();
        if self.finalized {
            return Err(ConfigError::DefinedAfterFinalization { name: self.dotted(&name) });
        }
        if self.groups.contains_key(&name) {
            return Err(ConfigError::DuplicateGroup { name: self.dotted(&name) });
        }
        if self.vars.contains_key(&name) {
            return Err(ConfigError::GroupDuplicatesVar { name: self.dotted(&name) });
        }
        let dotted = format!("{}.", self.dotted(&name));
        self.groups.insert(name.clone(), ConfigVarGroup::new(dotted));
        Ok(self.groups.get_mut(&name).expect("just inserted"))
    }

    /// Borrow a variable by its local (un-dotted) name.
    #[must_use]
    pub fn var(&self, name: &str) -> Option<&ConfigVar> {
        self.vars.get(name)
    }

    /// Mutably borrow a variable by its local name.
    pub fn var_mut(&mut self, name: &str) -> Option<&mut ConfigVar> {
        self.vars.get_mut(name)
    }

    /// Borrow a nested group by its local name.
    #[must_use]
    pub fn group(&self, name: &str) -> Option<&ConfigVarGroup> {
        self.groups.get(name)
    }

    /// Mutably borrow a nested group by its local name.
    pub fn group_mut(&mut self, name: &str) -> Option<&mut ConfigVarGroup> {
        self.groups.get_mut(name)
    }

    /// The local names of the variables directly in this group, sorted.
    #[must_use]
    pub fn list_vars(&self) -> Vec<&str> {
        self.vars.keys().map(String::as_str).collect()
    }

    /// The local names of the nested groups directly in this group, sorted.
    #[must_use]
    pub fn list_groups(&self) -> Vec<&str> {
        self.groups.keys().map(String::as_str).collect()
    }

    /// Finalize this group and, recursively, everything inside it.
    ///
    /// Idempotent: finalizing twice is a no-op, matching
    /// [`crate::buildtask::BuildTaskGraph::finalize`].
    pub fn finalize(&mut self) {
        self.finalized = true;
        for var in self.vars.values_mut() {
            var.finalize();
        }
        for group in self.groups.values_mut() {
            group.finalize();
        }
    }
}

/// Pairs a component's name and copy-name (distinct when the same component
/// class is instantiated more than once under a release config) with its
/// per-instance variable group.
///
/// The component *class* dispatch table (`add_release_config_vars`,
/// `configure_opts`, the task-emitting hooks, …) is out of scope here (spec
/// §1: "the individual component plugins … specified only by the hook
/// surface"); this is only the registration record the graph engine reads.
#[derive(Debug, Clone)]
pub struct ComponentInConfig {
    /// The component class name (e.g. `"gcc"`).
    pub name: String,
    /// The name this instance is registered under, which may differ from
    /// `name` when a component is instantiated more than once.
    pub copy_name: String,
    /// This component instance's variable group.
    pub vars: ConfigVarGroup,
}

fn release_config_vars(group: &mut ConfigVarGroup, components: &BTreeSet<String>) -> Result<(), ConfigError> {
    group.add_var("build", ConfigVarType::PkgHost, None, false)?;
    group.add_var("hosts", ConfigVarType::List(Box::new(ConfigVarType::PkgHost)), None, false)?;
    group.add_var("target", ConfigVarType::Str, None, false)?;
    group.add_var(
        "installdir",
        ConfigVarType::Str,
        Some(ConfigValue::Str("/opt/toolchain".to_string())),
        false,
    )?;
    group.add_var(
        "pkg_prefix",
        ConfigVarType::Str,
        Some(ConfigValue::Str("toolchain".to_string())),
        false,
    )?;
    group.add_var("pkg_version", ConfigVarType::Str, Some(ConfigValue::Str("1.0".to_string())), false)?;
    group.add_var("pkg_build", ConfigVarType::Int, Some(ConfigValue::Int(1)), false)?;
    group.add_var("script_full", ConfigVarType::Str, Some(ConfigValue::Str(String::new())), false)?;
    group.add_var("interp", ConfigVarType::Str, Some(ConfigValue::Str(String::new())), false)?;
    group.add_var(
        "bootstrap_components_vc",
        ConfigVarType::Dict(Box::new(ConfigVarType::Str), Box::new(ConfigVarType::Str)),
        Some(ConfigValue::Dict(BTreeMap::new())),
        false,
    )?;
    group.add_var(
        "bootstrap_components_version",
        ConfigVarType::Dict(Box::new(ConfigVarType::Str), Box::new(ConfigVarType::Str)),
        Some(ConfigValue::Dict(BTreeMap::new())),
        false,
    )?;
    group.add_var(
        "env_set",
        ConfigVarType::Dict(Box::new(ConfigVarType::Str), Box::new(ConfigVarType::Str)),
        Some(ConfigValue::Dict(BTreeMap::new())),
        false,
    )?;
    group.add_var("source_date_epoch", ConfigVarType::Int, Some(ConfigValue::Int(0)), false)?;

    for component in components {
        let cgroup = group.add_group(component.clone())?;
        cgroup.add_var(
            "configure_opts",
            ConfigVarType::List(Box::new(ConfigVarType::Str)),
            Some(ConfigValue::List(Vec::new())),
            false,
        )?;
        cgroup.add_var("vc", ConfigVarType::Str, None, false)?;
        cgroup.add_var("version", ConfigVarType::Str, None, false)?;
        cgroup.add_var(
            "source_type",
            ConfigVarType::StrEnum(["open", "closed", "none"].iter().map(|s| (*s).to_string()).collect()),
            None,
            false,
        )?;
        cgroup.add_var("srcdirname", ConfigVarType::Str, Some(ConfigValue::Str(component.replace('_', "-"))), false)?;
    }
    Ok(())
}

/// The programmatic builder API for assembling a [`ReleaseConfig`]: the
/// direct Rust translation of `ConfigVarGroup`/`ConfigVar`/component
/// registration from spec §3/§4.8.
///
/// Component crates (out of scope per spec §1) call [`RelcfgBuilder::group`]
/// from their own `add_release_config_vars` hook to populate their
/// per-component group before [`RelcfgBuilder::finalize`] is called.
pub struct RelcfgBuilder {
    group: ConfigVarGroup,
    components: BTreeSet<String>,
}

impl RelcfgBuilder {
    /// Start a builder with the standard top-level release-config variables
    /// (`build`, `hosts`, `target`, …) and one per-component group per name
    /// in `components`, plus the implicit `package` component.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if `components` contains a duplicate name
    /// (it never does when called with a `BTreeSet`, but the check is
    /// shared with `add_var`'s general path).
    pub fn new(components: impl IntoIterator<Item = String>) -> Result<Self, ConfigError> {
        let mut components: BTreeSet<String> = components.into_iter().collect();
        components.insert("package".to_string());
        let mut group = ConfigVarGroup::new(String::new());
        release_config_vars(&mut group, &components)?;
        Ok(Self { group, components })
    }

    /// The top-level variable group, for setting values before finalization.
    pub fn group(&mut self) -> &mut ConfigVarGroup {
        &mut self.group
    }

    /// Apply a textual overlay's scalar/list/dict overrides as `set` calls.
    ///
    /// # Errors
    ///
    /// Propagates any [`ConfigError`] from a failing `set` call, including
    /// references to variables the overlay names but which do not exist.
    pub fn apply_document(&mut self, doc: &RelcfgDocument) -> Result<(), ConfigError> {
        for (dotted_name, value) in &doc.overrides {
            self.set_dotted(dotted_name, value.clone())?;
        }
        Ok(())
    }

    fn set_dotted(&mut self, dotted_name: &str, value: ConfigValue) -> Result<(), ConfigError> {
        let parts: Vec<&str> = dotted_name.split('.').collect();
        let (leaf, path) = parts.split_last().expect("split always yields at least one element");
        let mut group = &mut self.group;
        for component in path {
            group = group
                .group_mut(component)
                .ok_or_else(|| ConfigError::UnknownComponent { name: (*component).to_string() })?;
        }
        group
            .var_mut(leaf)
            .ok_or_else(|| ConfigError::BadValue { name: dotted_name.to_string() })?
            .set(value)
    }

    /// Finalize the builder into a [`ReleaseConfig`], applying the
    /// cross-variable invariants and derived-variable computation documented
    /// in spec §4.8 / `original_source/sourcery/relcfg.py`'s
    /// `ReleaseConfig.__init__`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::FirstHostNotBuild`] if `hosts[0] != build`, or
    /// any other [`ConfigError`] raised while computing derived variables.
    pub fn finalize(mut self, objdir: impl Into<PathBuf>, srcdir: impl Into<PathBuf>, pkgdir: impl Into<PathBuf>) -> Result<ReleaseConfig, ConfigError> {
        let srcdir = srcdir.into();
        let pkgdir = pkgdir.into();

        // Promote an explicitly-set build host, and default `hosts` to it.
        let build_value = self.group.var("build").expect("build registered").get()?.clone();
        if !self.group.var("hosts").expect("hosts registered").get_explicit() {
            self.group
                .var_mut("hosts")
                .expect("hosts registered")
                .set_implicit(ConfigValue::List(vec![build_value.clone()]))?;
        }
        let hosts = self.group.var("hosts").expect("hosts registered").get()?.clone();
        let first_host = hosts
            .as_list()
            .and_then(|l| l.first())
            .ok_or(ConfigError::MissingRequired { name: "hosts".to_string() })?;
        if first_host != &build_value {
            return Err(ConfigError::FirstHostNotBuild);
        }

        // Inject SOURCE_DATE_EPOCH into env_set.
        let source_date_epoch = self.group.var("source_date_epoch").expect("registered").get()?.as_int().unwrap_or(0);
        let env_set_var = self.group.var_mut("env_set").expect("env_set registered");
        let mut env_set = env_set_var.get()?.as_dict().cloned().unwrap_or_default();
        env_set.insert("SOURCE_DATE_EPOCH".to_string(), ConfigValue::Str(source_date_epoch.to_string()));
        env_set_var.set_implicit(ConfigValue::Dict(env_set))?;

        let installdir = self
            .group
            .var("installdir")
            .expect("installdir registered")
            .get()?
            .as_str()
            .expect("installdir is a string")
            .to_string();
        let installdir_rel = installdir.trim_start_matches('/').to_string();
        let target = self.group.var("target").expect("target registered").get()?.as_str().unwrap_or_default().to_string();
        let pkg_prefix = self.group.var("pkg_prefix").expect("registered").get()?.as_str().unwrap_or_default().to_string();
        let pkg_version = self.group.var("pkg_version").expect("registered").get()?.as_str().unwrap_or_default().to_string();
        let pkg_build = self.group.var("pkg_build").expect("registered").get()?.as_int().unwrap_or(1);
        let version = format!("{pkg_version}-{pkg_build}");
        let pkg_name_no_target_build = format!("{pkg_prefix}-{pkg_version}");
        let pkg_name_full = format!("{pkg_prefix}-{version}-{target}");
        let pkg_name_no_version = format!("{pkg_prefix}-{target}");
        let bindir = format!("{installdir}/bin");
        let bindir_rel = format!("{installdir_rel}/bin");
        let sysroot = format!("{installdir}/{target}/libc");
        let sysroot_rel = format!("{installdir_rel}/{target}/libc");
        let info_dir_rel = format!("{installdir_rel}/share/info/dir");

        self.group.add_var("installdir_rel", ConfigVarType::Str, Some(ConfigValue::Str(installdir_rel)), true)?;
        self.group.add_var("bindir", ConfigVarType::Str, Some(ConfigValue::Str(bindir)), true)?;
        self.group.add_var("bindir_rel", ConfigVarType::Str, Some(ConfigValue::Str(bindir_rel)), true)?;
        self.group.add_var("sysroot", ConfigVarType::Str, Some(ConfigValue::Str(sysroot)), true)?;
        self.group.add_var("sysroot_rel", ConfigVarType::Str, Some(ConfigValue::Str(sysroot_rel)), true)?;
        self.group.add_var("info_dir_rel", ConfigVarType::Str, Some(ConfigValue::Str(info_dir_rel)), true)?;
        self.group.add_var("version", ConfigVarType::Str, Some(ConfigValue::Str(version)), true)?;
        self.group.add_var(
            "pkg_name_no_target_build",
            ConfigVarType::Str,
            Some(ConfigValue::Str(pkg_name_no_target_build)),
            true,
        )?;
        self.group
            .add_var("pkg_name_full", ConfigVarType::Str, Some(ConfigValue::Str(pkg_name_full.clone())), true)?;
        self.group.add_var(
            "pkg_name_no_version",
            ConfigVarType::Str,
            Some(ConfigValue::Str(pkg_name_no_version)),
            true,
        )?;

        let mut components = BTreeMap::new();
        for name in &self.components {
            let group = self.group.group_mut(name).expect("registered above").clone();
            let source_type = group.var("source_type").and_then(|v| v.get().ok()).and_then(ConfigValue::as_str).map(str::to_string);
            let mut group = group;
            if source_type.as_deref() != Some("none") {
                let srcdirname = group.var("srcdirname").expect("registered").get()?.as_str().unwrap_or_default().to_string();
                let c_version = group.var("version").and_then(|v| v.get().ok()).and_then(ConfigValue::as_str).unwrap_or_default().to_string();
                let c_srcdir = srcdir.join(format!("{srcdirname}-{c_version}"));
                group.add_var("srcdir", ConfigVarType::Str, Some(ConfigValue::Str(c_srcdir.display().to_string())), true)?;
            }
            components.insert(
                name.clone(),
                ComponentInConfig {
                    name: name.clone(),
                    copy_name: name.clone(),
                    vars: group,
                },
            );
        }

        self.group.finalize();

        let objdir_root = objdir.into().join(&pkg_name_full);
        Ok(ReleaseConfig {
            group: self.group,
            components,
            objdir_root,
            pkgdir,
        })
    }
}

/// A finalized release configuration: the single source of truth the rest
/// of the engine (build context, autoconf helpers, multilib finalization)
/// reads from.
pub struct ReleaseConfig {
    group: ConfigVarGroup,
    components: BTreeMap<String, ComponentInConfig>,
    objdir_root: PathBuf,
    pkgdir: PathBuf,
}

impl ReleaseConfig {
    /// The top-level variable group.
    #[must_use]
    pub fn vars(&self) -> &ConfigVarGroup {
        &self.group
    }

    /// Look up a top-level variable by name.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingRequired`] if `name` is not a
    /// registered top-level variable.
    pub fn var(&self, name: &str) -> Result<&ConfigVar, ConfigError> {
        self.group.var(name).ok_or_else(|| ConfigError::MissingRequired { name: name.to_string() })
    }

    /// All registered components, in name order.
    #[must_use]
    pub fn list_components(&self) -> Vec<&ComponentInConfig> {
        self.components.values().collect()
    }

    /// Look up a component's registration by name.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ComponentNotInConfig`] if `component` was not
    /// registered with the builder.
    pub fn get_component(&self, component: &str) -> Result<&ComponentInConfig, ConfigError> {
        self.components
            .get(component)
            .ok_or_else(|| ConfigError::ComponentNotInConfig { name: component.to_string() })
    }

    /// The on-disk path for an object directory for `name`, optionally
    /// scoped to a host.
    ///
    /// `objdir_path(None, name) = <objdir>/<name>`,
    /// `objdir_path(Pkg(h), name) = <objdir>/pkg-<name>-<h.name>`,
    /// `objdir_path(Build(b), name) = <objdir>/<name>-<b.name>`.
    #[must_use]
    pub fn objdir_path(&self, host: Option<&InstallHost>, name: &str) -> PathBuf {
        match host {
            None => self.objdir_root.join(name),
            Some(InstallHost::Pkg(h)) => self.objdir_root.join(format!("pkg-{name}-{}", h.name)),
            Some(InstallHost::Build(b)) => self.objdir_root.join(format!("{name}-{}", b.name)),
        }
    }

    /// The on-disk path for a named install tree.
    #[must_use]
    pub fn install_tree_path(&self, key: &InstallKey) -> PathBuf {
        self.objdir_path(Some(&key.0), "install-trees").join(&key.1)
    }

    /// A lazy tree recipe for a named install tree, carrying the
    /// `(host, name)` dependency the graph engine needs.
    #[must_use]
    pub fn install_tree_fstree(&self, key: InstallKey) -> Rc<Lazy> {
        Lazy::install_tree(key)
    }

    /// The output path for a package, optionally scoped to a host.
    #[must_use]
    pub fn pkgdir_path(&self, host: Option<&PkgHost>, suffix: &str) -> PathBuf {
        let pkg_name_full = self.var("pkg_name_full").ok().and_then(|v| v.get().ok()).and_then(ConfigValue::as_str).unwrap_or_default();
        let host_text = host.map_or_else(String::new, |h| format!("-{}", h.name));
        self.pkgdir.join(format!("{pkg_name_full}{host_text}{suffix}"))
    }
}

/// A textual overlay applied on top of a [`RelcfgBuilder`]: a flat table of
/// dotted variable names to scalar/list/dict overrides, loaded from TOML.
///
/// This stands in for the Python loader's `exec`-based sandbox and
/// `branch:path` resolution (spec §4.8), scoped to what a typed loader
/// needs: resolving a path, parsing it, and applying overrides.
#[derive(Debug, Clone, Default)]
pub struct RelcfgDocument {
    overrides: BTreeMap<String, ConfigValue>,
}

impl RelcfgDocument {
    fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let raw: toml::Table = toml::from_str(text).map_err(|_| ConfigError::BadValue { name: "<overlay>".to_string() })?;
        let overrides = raw.into_iter().map(|(k, v)| (k, toml_to_config_value(&v))).collect();
        Ok(Self { overrides })
    }
}

fn toml_to_config_value(value: &toml::Value) -> ConfigValue {
    match value {
        toml::Value::String(s) => ConfigValue::Str(s.clone()),
        toml::Value::Integer(n) => ConfigValue::Int(*n),
        toml::Value::Array(items) => ConfigValue::List(items.iter().map(toml_to_config_value).collect()),
        toml::Value::Table(map) => ConfigValue::Dict(map.iter().map(|(k, v)| (k.clone(), toml_to_config_value(v))).collect()),
        toml::Value::Boolean(b) => ConfigValue::Str(b.to_string()),
        toml::Value::Float(f) => ConfigValue::Str(f.to_string()),
        toml::Value::Datetime(d) => ConfigValue::Str(d.to_string()),
    }
}

/// Resolves and loads a named release config overlay.
///
/// This is the load-bearing subset of `ReleaseConfigPathLoader` from
/// `original_source/sourcery/relcfg.py` (`branch:config-path` resolution, a
/// containment check) minus the VC-checkout bootstrap re-exec dance, which
/// depends on the out-of-scope VC/CLI layers.
pub trait ReleaseConfigLoader {
    /// Load and parse the overlay named `release_config`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::BadValue`] if the name cannot be resolved to a
    /// readable, well-formed TOML document within the loader's root.
    fn load_config(&self, release_config: &str) -> Result<RelcfgDocument, ConfigError>;
}

/// Loads overlays from files relative to a configured release-configs
/// directory, accepting a `branch:config-path` form that resolves to
/// `<root>/release-configs-<dashed-branch>/<config-path>` and is rejected if
/// the resolved path would escape `root`.
pub struct PathLoader {
    root: PathBuf,
}

impl PathLoader {
    /// Create a loader rooted at `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, release_config: &str) -> Result<PathBuf, ConfigError> {
        let candidate = if let Some((branch, config_path)) = release_config.split_once(':') {
            let dashed = branch.replace('_', "-");
            self.root.join(format!("release-configs-{dashed}")).join(config_path)
        } else {
            self.root.join(release_config)
        };
        let resolved = std::path::absolute(&candidate).map_err(|_| ConfigError::BadValue { name: release_config.to_string() })?;
        let root_abs = std::path::absolute(&self.root).map_err(|_| ConfigError::BadValue { name: release_config.to_string() })?;
        if !resolved.starts_with(&root_abs) {
            return Err(ConfigError::BadValue { name: release_config.to_string() });
        }
        Ok(candidate)
    }
}

impl ReleaseConfigLoader for PathLoader {
    fn load_config(&self, release_config: &str) -> Result<RelcfgDocument, ConfigError> {
        let path = self.resolve(release_config)?;
        load_document(&path)
    }
}

fn load_document(path: &Path) -> Result<RelcfgDocument, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|_| ConfigError::BadValue { name: path.display().to_string() })?;
    RelcfgDocument::from_toml_str(&text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_var_promotes_string_to_pkg_host() {
        let mut builder = RelcfgBuilder::new(["gcc".to_string()]).unwrap();
        builder.group().var_mut("build").unwrap().set(ConfigValue::Str("x86_64-linux-gnu".to_string())).unwrap();
        builder.group().var_mut("target").unwrap().set(ConfigValue::Str("arm-none-eabi".to_string())).unwrap();
        let cfg = builder.finalize("/obj", "/src", "/pkg").unwrap();
        assert_eq!(cfg.var("build").unwrap().get().unwrap().as_pkg_host().unwrap().name, "x86_64-linux-gnu");
    }

    #[test]
    fn first_host_mismatch_is_rejected() {
        let mut builder = RelcfgBuilder::new(["gcc".to_string()]).unwrap();
        builder.group().var_mut("build").unwrap().set(ConfigValue::Str("x86_64-linux-gnu".to_string())).unwrap();
        builder.group().var_mut("target").unwrap().set(ConfigValue::Str("arm-none-eabi".to_string())).unwrap();
        builder
            .group()
            .var_mut("hosts")
            .unwrap()
            .set(ConfigValue::List(vec![ConfigValue::Str("x86_64-w64-mingw32".to_string())]))
            .unwrap();
        let err = builder.finalize("/obj", "/src", "/pkg").unwrap_err();
        assert!(matches!(err, ConfigError::FirstHostNotBuild));
    }

    #[test]
    fn derived_paths_match_naming_scheme() {
        let mut builder = RelcfgBuilder::new(["gcc".to_string()]).unwrap();
        builder.group().var_mut("build").unwrap().set(ConfigValue::Str("x86_64-linux-gnu".to_string())).unwrap();
        builder.group().var_mut("target").unwrap().set(ConfigValue::Str("arm-none-eabi".to_string())).unwrap();
        builder.group().var_mut("pkg_prefix").unwrap().set(ConfigValue::Str("acme".to_string())).unwrap();
        builder.group().var_mut("pkg_version").unwrap().set(ConfigValue::Str("2024.05".to_string())).unwrap();
        let cfg = builder.finalize("/obj", "/src", "/pkg").unwrap();
        let pkg_name_full = cfg.var("pkg_name_full").unwrap().get().unwrap().as_str().unwrap().to_string();
        assert_eq!(pkg_name_full, "acme-2024.05-1-arm-none-eabi");

        let host = InstallHost::Build(BuildCfg::new("arm-none-eabi"));
        let path = cfg.objdir_path(Some(&host), "binutils");
        assert!(path.ends_with(format!("{pkg_name_full}/binutils-arm-none-eabi")));

        let key: InstallKey = (host, "headers".to_string());
        let tree_path = cfg.install_tree_path(&key);
        assert!(tree_path.ends_with(format!("{pkg_name_full}/install-trees-arm-none-eabi/headers")));
    }

    #[test]
    fn source_date_epoch_is_injected_into_env_set() {
        let mut builder = RelcfgBuilder::new(["gcc".to_string()]).unwrap();
        builder.group().var_mut("build").unwrap().set(ConfigValue::Str("x86_64-linux-gnu".to_string())).unwrap();
        builder.group().var_mut("target").unwrap().set(ConfigValue::Str("arm-none-eabi".to_string())).unwrap();
        builder.group().var_mut("source_date_epoch").unwrap().set(ConfigValue::Int(1111199990)).unwrap();
        let cfg = builder.finalize("/obj", "/src", "/pkg").unwrap();
        let env_set = cfg.var("env_set").unwrap().get().unwrap().as_dict().unwrap();
        assert_eq!(env_set.get("SOURCE_DATE_EPOCH").unwrap().as_str().unwrap(), "1111199990");
    }

    #[test]
    fn component_vars_get_srcdir_unless_sourceless() {
        let mut builder = RelcfgBuilder::new(["gcc".to_string()]).unwrap();
        builder.group().var_mut("build").unwrap().set(ConfigValue::Str("x86_64-linux-gnu".to_string())).unwrap();
        builder.group().var_mut("target").unwrap().set(ConfigValue::Str("arm-none-eabi".to_string())).unwrap();
        builder.group().group_mut("gcc").unwrap().var_mut("source_type").unwrap().set(ConfigValue::Str("open".to_string())).unwrap();
        builder.group().group_mut("gcc").unwrap().var_mut("version").unwrap().set(ConfigValue::Str("14.1".to_string())).unwrap();
        let cfg = builder.finalize("/obj", "/src", "/pkg").unwrap();
        let gcc = cfg.get_component("gcc").unwrap();
        let srcdir = gcc.vars.var("srcdir").unwrap().get().unwrap().as_str().unwrap();
        assert!(srcdir.ends_with("gcc-14.1"));
    }

    #[test]
    fn path_loader_rejects_escaping_path() {
        let dir = tempfile::tempdir().unwrap();
        let loader = PathLoader::new(dir.path());
        let err = loader.load_config("../../etc/passwd").unwrap_err();
        assert!(matches!(err, ConfigError::BadValue { .. }));
    }

    #[test]
    fn path_loader_applies_toml_overlay() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("default.toml"), "target = \"arm-none-eabi\"\npkg_prefix = \"acme\"\n").unwrap();
        let loader = PathLoader::new(dir.path());
        let doc = loader.load_config("default.toml").unwrap();
        let mut builder = RelcfgBuilder::new(["gcc".to_string()]).unwrap();
        builder.group().var_mut("build").unwrap().set(ConfigValue::Str("x86_64-linux-gnu".to_string())).unwrap();
        builder.apply_document(&doc).unwrap();
        assert_eq!(builder.group().var("target").unwrap().get().unwrap().as_str().unwrap(), "arm-none-eabi");
    }
}
