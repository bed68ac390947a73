//! `forge build`: load a release config, wire up the generic autoconf task
//! group for each declared component, render the makefile, and drive one
//! build.
//!
//! Component-specific task emission (spec §1: component plugins are
//! external collaborators) is out of scope; this stands in with the one
//! task-emitting helper this crate does own,
//! [`forge_core::autoconf::add_host_cfg_build_tasks`], applied uniformly to
//! every declared component building for the release config's own `build`
//! host. A real driver would dispatch to per-component hooks instead; see
//! `DESIGN.md`.

use std::path::{Path, PathBuf};
use std::rc::Rc;

use anyhow::{bail, Context, Result};

use forge_core::autoconf::add_host_cfg_build_tasks;
use forge_core::buildtask::BuildTaskGraph;
use forge_core::context::{BuildContext, MessageSink};
use forge_core::relcfg::{ConfigValue, RelcfgBuilder};

struct ConsoleSink;

impl MessageSink for ConsoleSink {
    fn inform(&mut self, text: &str) {
        println!("{text}");
    }

    fn warning(&mut self, text: &str) {
        eprintln!("{text}");
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

/// Load `config`, finalize a release config against the given directory
/// layout, populate a build-task graph, render it to a makefile, and run
/// the build.
///
/// # Errors
///
/// Returns an error if `config` cannot be read or parsed, if any release
/// config variable is missing or ill-typed, or if the build itself fails.
#[allow(clippy::too_many_arguments)]
pub fn build(
    config: &Path,
    objdir: &Path,
    srcdir: &Path,
    pkgdir: &Path,
    logdir: Option<&Path>,
    jobs: Option<usize>,
) -> Result<()> {
    let text = std::fs::read_to_string(config).with_context(|| format!("reading {}", config.display()))?;
    let mut table: toml::Table = toml::from_str(&text).with_context(|| format!("parsing {}", config.display()))?;

    let components: Vec<String> = match table.remove("components") {
        Some(toml::Value::Array(items)) => items
            .into_iter()
            .map(|v| match v {
                toml::Value::String(s) => Ok(s),
                other => bail!("components entries must be strings, found {other:?}"),
            })
            .collect::<Result<Vec<_>>>()?,
        Some(other) => bail!("`components` must be an array of strings, found {other:?}"),
        None => bail!("release config {} has no `components` list", config.display()),
    };
    if components.is_empty() {
        bail!("release config {} declares no components", config.display());
    }

    let mut builder = RelcfgBuilder::new(components.clone())?;
    for (key, value) in &table {
        builder
            .group()
            .var_mut(key)
            .with_context(|| format!("unknown top-level release config variable `{key}`"))?
            .set(toml_to_config_value(value))?;
    }

    let relcfg = builder.finalize(objdir, srcdir, pkgdir)?;

    let logdir = logdir.map_or_else(|| relcfg.objdir_path(None, "logs"), PathBuf::from);
    std::fs::create_dir_all(&logdir)?;

    let relcfg = Rc::new(relcfg);
    let install_tree_path: Rc<dyn Fn(&forge_schema::InstallKey) -> PathBuf> = {
        let relcfg = Rc::clone(&relcfg);
        Rc::new(move |key: &forge_schema::InstallKey| relcfg.install_tree_path(key))
    };

    let mut graph = BuildTaskGraph::new(install_tree_path);

    let build_host = relcfg
        .var("build")?
        .get()?
        .as_pkg_host()
        .context("`build` is not a host")?
        .build_cfg
        .clone();

    for name in &components {
        if name == "package" {
            continue;
        }
        let component = relcfg.get_component(name)?;
        add_host_cfg_build_tasks(
            &mut graph,
            &relcfg,
            &build_host,
            component,
            "",
            None,
            None,
            None,
            &[],
            None,
            None,
            "install",
            true,
        )
        .with_context(|| format!("adding build tasks for component `{name}`"))?;
    }

    let forge_exe = std::env::current_exe().context("locating the running forge binary")?;
    let jobs = jobs.unwrap_or_else(num_cpus::get);

    let mut ctx = BuildContext::new(Rc::clone(&relcfg), logdir, jobs, forge_exe, ConsoleSink)?;
    let makefile_text = graph.makefile_text(&mut ctx)?;

    let build_objdir = relcfg.objdir_path(None, "build");
    std::fs::create_dir_all(&build_objdir)?;
    std::fs::write(build_objdir.join("Makefile"), makefile_text)?;

    ctx.run_build()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toml_value_conversion_covers_every_variant() {
        assert_eq!(toml_to_config_value(&toml::Value::String("x".into())), ConfigValue::Str("x".into()));
        assert_eq!(toml_to_config_value(&toml::Value::Integer(7)), ConfigValue::Int(7));
        assert_eq!(
            toml_to_config_value(&toml::Value::Array(vec![toml::Value::String("a".into())])),
            ConfigValue::List(vec![ConfigValue::Str("a".into())])
        );
        assert_eq!(toml_to_config_value(&toml::Value::Boolean(true)), ConfigValue::Str("true".into()));

        let mut table = toml::Table::new();
        table.insert("k".into(), toml::Value::Integer(1));
        match toml_to_config_value(&toml::Value::Table(table)) {
            ConfigValue::Dict(map) => assert_eq!(map.get("k"), Some(&ConfigValue::Int(1))),
            other => panic!("expected Dict, got {other:?}"),
        }
    }

    #[test]
    fn missing_config_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        let err = build(&missing, dir.path(), dir.path(), dir.path(), None, None).unwrap_err();
        assert!(err.to_string().contains("reading"));
    }

    #[test]
    fn config_without_components_list_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("release.toml");
        std::fs::write(&config, "target = \"x86_64-linux-gnu\"\n").unwrap();

        let err = build(&config, dir.path(), dir.path(), dir.path(), None, None).unwrap_err();
        assert!(err.to_string().contains("no `components` list"));
    }

    #[test]
    fn non_string_components_entry_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("release.toml");
        std::fs::write(&config, "components = [1, 2]\n").unwrap();

        let err = build(&config, dir.path(), dir.path(), dir.path(), None, None).unwrap_err();
        assert!(err.to_string().contains("components entries must be strings"));
    }

    #[test]
    fn empty_components_list_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("release.toml");
        std::fs::write(&config, "components = []\n").unwrap();

        let err = build(&config, dir.path(), dir.path(), dir.path(), None, None).unwrap_err();
        assert!(err.to_string().contains("declares no components"));
    }
}
