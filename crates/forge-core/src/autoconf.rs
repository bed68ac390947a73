//! Task-group constructors for autoconf-based components: `configure` /
//! `make` / `make install`, wired up the way most compiler and library
//! components in a cross toolchain are built.
//!
//! Ported from `original_source/sourcery/autoconf.py`. The component-class
//! hook (`component.cls.configure_opts`) that contributes extra configure
//! options per component is out of scope (spec §1: component plugins are
//! external collaborators, specified only by the hook surface); callers
//! fold any such options into `pkg_cfg_opts` themselves.

use std::path::Path;

use forge_schema::{BuildCfg, InstallHost};

use crate::buildtask::BuildTaskGraph;
use crate::relcfg::{ComponentInConfig, ReleaseConfig};
use crate::Error;

/// Add and return the fullname of a group of tasks using
/// `configure`/`make`/`make install`.
///
/// `parent` is the fullname of the task group this one is nested under.
/// `host` is the build configuration code built by this group targets.
/// `name` defaults to the component's copy name; `srcdir` defaults to the
/// component's own source directory; `prefix` of `None` configures straight
/// into the install tree (appropriate only for host libraries that don't
/// reference their configured prefix at runtime) rather than through
/// `DESTDIR`. A `--target` option is passed unless `target` is `None`.
///
/// Additional steps after installation are the caller's job: add further
/// tasks under the returned group.
///
/// # Errors
///
/// Propagates any [`forge_schema::GraphError`] from building the task group,
/// or [`forge_schema::ConfigError`] from resolving configure variables or a
/// missing release-config value.
#[allow(clippy::too_many_arguments)]
pub fn add_host_cfg_build_tasks(
    graph: &mut BuildTaskGraph,
    relcfg: &ReleaseConfig,
    host: &BuildCfg,
    component: &ComponentInConfig,
    parent: &str,
    name: Option<&str>,
    srcdir: Option<&str>,
    prefix: Option<&str>,
    pkg_cfg_opts: &[String],
    target: Option<&str>,
    make_target: Option<&str>,
    install_target: &str,
    parallel: bool,
) -> Result<String, Error> {
    let build_host = relcfg
        .var("build")?
        .get()?
        .as_pkg_host()
        .ok_or_else(|| forge_schema::ConfigError::BadValue {
            name: "build".to_string(),
        })?
        .build_cfg
        .clone();

    let name = name.map_or_else(|| component.copy_name.clone(), str::to_string);
    let srcdir = match srcdir {
        Some(s) => s.to_string(),
        None => component.vars.var("srcdir").expect("srcdir installed at finalization unless sourceless").get()?.as_str().unwrap_or_default().to_string(),
    };

    let install_host = InstallHost::Build(host.clone());
    let objdir = relcfg.objdir_path(Some(&install_host), &name);
    let instdir = relcfg.install_tree_path(&(install_host.clone(), name.clone()));

    let (cfg_prefix, destdir) = match prefix {
        None => (instdir.to_string_lossy().into_owned(), None),
        Some(p) => (p.to_string(), Some(instdir.to_string_lossy().into_owned())),
    };

    let task_group = graph.new_task(parent, &name, false)?;
    graph.provide_install(&task_group, (install_host, name))?;

    let init_task = graph.new_task(&task_group, "init", false)?;
    graph.add_empty_dir(&init_task, &objdir.to_string_lossy())?;
    graph.add_empty_dir(&init_task, &instdir.to_string_lossy())?;

    let cfg_task = graph.new_task(&task_group, "configure", false)?;
    let mut cfg_cmd = vec![
        Path::new(&srcdir).join("configure").to_string_lossy().into_owned(),
        format!("--build={}", build_host.triplet),
        format!("--host={}", host.triplet),
        format!("--prefix={cfg_prefix}"),
    ];
    if let Some(target) = target {
        cfg_cmd.push(format!("--target={target}"));
    }
    cfg_cmd.extend(pkg_cfg_opts.iter().cloned());
    if let Some(opts) = component.vars.var("configure_opts") {
        if let Ok(value) = opts.get() {
            if let Some(list) = value.as_list() {
                cfg_cmd.extend(list.iter().filter_map(|v| v.as_str()).map(str::to_string));
            }
        }
    }
    cfg_cmd.extend(host.configure_vars(None)?);
    cfg_cmd.extend([
        format!("CC_FOR_BUILD={}", build_host.tool("c-compiler").join(" ")),
        format!("CXX_FOR_BUILD={}", build_host.tool("c++-compiler").join(" ")),
    ]);
    graph.add_command(&cfg_task, cfg_cmd, Some(objdir.to_string_lossy().into_owned()))?;

    let build_task = graph.new_task(&task_group, "build", false)?;
    let mut build_cmd = if parallel { Vec::new() } else { vec!["-j1".to_string()] };
    if let Some(make_target) = make_target {
        build_cmd.push(make_target.to_string());
    }
    graph.add_make(&build_task, build_cmd, objdir.to_string_lossy().into_owned())?;

    let install_task = graph.new_task(&task_group, "install", false)?;
    let mut install_cmd = vec!["-j1".to_string(), install_target.to_string()];
    if let Some(destdir) = destdir {
        install_cmd.push(format!("DESTDIR={destdir}"));
    }
    graph.add_make(&install_task, install_cmd, objdir.to_string_lossy().into_owned())?;

    Ok(task_group)
}

/// Like [`add_host_cfg_build_tasks`], for a host library: always
/// `--disable-shared`, never a `--target`.
///
/// # Errors
///
/// See [`add_host_cfg_build_tasks`].
#[allow(clippy::too_many_arguments)]
pub fn add_host_lib_cfg_build_tasks(
    graph: &mut BuildTaskGraph,
    relcfg: &ReleaseConfig,
    host: &BuildCfg,
    component: &ComponentInConfig,
    parent: &str,
    name: Option<&str>,
    srcdir: Option<&str>,
    prefix: Option<&str>,
    pkg_cfg_opts: &[String],
    make_target: Option<&str>,
    install_target: &str,
    parallel: bool,
) -> Result<String, Error> {
    let mut cfg_opts = vec!["--disable-shared".to_string()];
    cfg_opts.extend(pkg_cfg_opts.iter().cloned());
    add_host_cfg_build_tasks(
        graph,
        relcfg,
        host,
        component,
        parent,
        name,
        srcdir,
        prefix,
        &cfg_opts,
        None,
        make_target,
        install_target,
        parallel,
    )
}

/// Like [`add_host_cfg_build_tasks`], for a host tool that is installed and
/// distributed: the configured prefix is always the release config's
/// `installdir`. Pass `target: None` to build without a `--target` option;
/// pass `Some(t)` to override it; any other caller convention for "use the
/// release config's own target" should resolve it and pass it explicitly.
///
/// # Errors
///
/// See [`add_host_cfg_build_tasks`].
#[allow(clippy::too_many_arguments)]
pub fn add_host_tool_cfg_build_tasks(
    graph: &mut BuildTaskGraph,
    relcfg: &ReleaseConfig,
    host: &BuildCfg,
    component: &ComponentInConfig,
    parent: &str,
    name: Option<&str>,
    srcdir: Option<&str>,
    pkg_cfg_opts: &[String],
    target: Option<&str>,
    make_target: Option<&str>,
    install_target: &str,
    parallel: bool,
) -> Result<String, Error> {
    let relcfg_target = relcfg.var("target")?.get()?.as_str().unwrap_or_default().to_string();
    let target = target.unwrap_or(&relcfg_target).to_string();
    let installdir = relcfg.var("installdir")?.get()?.as_str().unwrap_or_default().to_string();
    add_host_cfg_build_tasks(
        graph,
        relcfg,
        host,
        component,
        parent,
        name,
        srcdir,
        Some(&installdir),
        pkg_cfg_opts,
        Some(&target),
        make_target,
        install_target,
        parallel,
    )
}
