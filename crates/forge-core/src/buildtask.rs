//! The build-task graph: hierarchical tasks with parallel or serial subtask
//! containers, dependencies on other tasks and on install trees, and
//! lowering of the whole graph to a generated makefile.
//!
//! Unlike the object graph this is ported from, tasks here are not
//! separate heap-allocated objects referencing a shared parent — the whole
//! graph lives in one [`BuildTaskGraph`], and a task is addressed by its
//! full path-style name. That avoids the interior mutability a faithful
//! object-per-task port would otherwise need purely to let a child task
//! register itself with shared dictionaries its parent already owns.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use forge_schema::{GraphError, InstallHost, InstallKey};

use crate::fstree::{Lazy, Materialized};
use crate::makefile::{command_to_make, Makefile};
use crate::tsort::tsort;

const TASK_START: &str = "task-start";
const TASK_END: &str = "task-end";

fn start_name_s(task_name: &str) -> String {
    format!("{TASK_START}{task_name}")
}

fn end_name_s(task_name: &str) -> String {
    format!("{TASK_END}{task_name}")
}

fn install_tree_key(key: &InstallKey) -> (String, String) {
    (key.0.name().to_string(), key.1.clone())
}

/// A registered callback: takes no arguments (any data it needs is baked in
/// via closure capture), matching the shape [`crate::rpc::RpcServer`] wants.
pub type PyCall = Rc<dyn Fn() -> Result<(), Box<dyn std::fmt::Debug>>>;

/// One command within a task: an ordinary argv, a `make` invocation (run
/// through `$(MAKE)` so parallelism flows through), or a Python-side
/// callback run via the RPC server.
#[derive(Clone)]
pub enum BuildStep {
    /// A plain command.
    Command {
        command: Vec<String>,
        cwd: Option<String>,
    },
    /// A `make` invocation, prefixed with `$(MAKE)` in the generated recipe.
    Make { command: Vec<String>, cwd: String },
    /// A callback run in this process via the RPC server, forking so its
    /// side effects (and any panic) stay isolated from the coordinator.
    Python { label: String, func: PyCall },
}

impl BuildStep {
    fn cwd(&self) -> Option<&str> {
        match self {
            BuildStep::Command { cwd, .. } => cwd.as_deref(),
            BuildStep::Make { cwd, .. } => Some(cwd.as_str()),
            BuildStep::Python { .. } => None,
        }
    }

    fn display(&self) -> String {
        match self {
            BuildStep::Command { command, .. } => command.join(" "),
            BuildStep::Make { command, .. } => format!("$(MAKE) {}", command.join(" ")),
            BuildStep::Python { label, .. } => format!("python: {label}"),
        }
    }

    fn command_main(&self, log: &Path, build_context: &mut dyn BuildContext) -> Vec<String> {
        match self {
            BuildStep::Command { command, .. } => command.clone(),
            BuildStep::Make { command, .. } => {
                let mut full = vec!["$(MAKE)".to_string()];
                full.extend(command.iter().cloned());
                full
            }
            BuildStep::Python { func, .. } => {
                let msg = build_context.register_call(Rc::clone(func), log.to_path_buf(), true);
                build_context.rpc_client_command(msg)
            }
        }
    }

    fn make_string(
        &self,
        build_context: &mut dyn BuildContext,
        log: &Path,
        fail_msg: u32,
        env: &BTreeMap<String, String>,
    ) -> Result<String, GraphError> {
        let cmd = self.command_main(log, build_context);
        let prefix = match self {
            BuildStep::Make { .. } => "$(MAKE) ",
            _ => "",
        };
        let mut cmd_str = format!("{prefix}{}", command_to_make(&cmd)?);
        if !env.is_empty() {
            let mut env_cmd = vec!["env".to_string()];
            env_cmd.extend(env.iter().map(|(k, v)| format!("{k}={v}")));
            cmd_str = format!("{} {}", command_to_make(&env_cmd)?, cmd_str);
        }
        let cwd = self.cwd().unwrap_or("");
        let wrapper = build_context.wrapper_run_command(log, fail_msg, cwd);
        Ok(format!("{} {}", command_to_make(&wrapper)?, cmd_str))
    }
}

/// Hooks a driver supplies so the task graph can lower itself to a
/// makefile without knowing how wrapper binaries or the RPC server work.
pub trait BuildContext {
    /// Directory where per-task log files live.
    fn logdir(&self) -> &Path;
    /// Argv for the wrapper that runs one command, logging to `log` and
    /// invoking the `fail_msg` RPC callback on non-zero exit.
    fn wrapper_run_command(&mut self, log: &Path, fail_msg: u32, cwd: &str) -> Vec<String>;
    /// Argv for the wrapper that announces a task has started.
    fn wrapper_start_task(&mut self, log: &Path, msg: u32) -> Vec<String>;
    /// Argv for the wrapper that announces a task has finished.
    fn wrapper_end_task(&mut self, log: &Path, msg: u32) -> Vec<String>;
    /// Argv that sends RPC message `msg` to the running server.
    fn rpc_client_command(&mut self, msg: u32) -> Vec<String>;
    /// Register a callback with the RPC server, returning its message id.
    /// Used only for `BuildStep::Python` steps, whose callback is the
    /// actual work of the step (forking, since it runs the step itself).
    fn register_call(&mut self, func: PyCall, log: PathBuf, forking: bool) -> u32;
    /// Register the "task started" announcement for `task_desc` logged to
    /// `log`; returns its message id.
    fn register_task_start(&mut self, task_desc: String, log: PathBuf) -> u32;
    /// Register the "command within a task failed" announcement; returns
    /// its message id.
    fn register_task_fail_command(&mut self, task_desc: String, command: String, log: PathBuf) -> u32;
    /// Register the "task finished" announcement; returns its message id.
    fn register_task_end(&mut self, task_desc: String, log: PathBuf) -> u32;
}

struct TaskNode {
    fullname: String,
    parent: Option<String>,
    parallel: bool,
    subtasks: Vec<String>,
    commands: Vec<BuildStep>,
    env: BTreeMap<String, String>,
    env_prepend: BTreeMap<String, Vec<String>>,
    depends: BTreeSet<String>,
    depends_install: BTreeSet<InstallKey>,
    provides_install: BTreeSet<InstallKey>,
    number: i64,
    num_tasks: i64,
}

impl TaskNode {
    fn top() -> Self {
        Self {
            fullname: String::new(),
            parent: None,
            parallel: true,
            subtasks: Vec::new(),
            commands: Vec::new(),
            env: BTreeMap::new(),
            env_prepend: BTreeMap::new(),
            depends: BTreeSet::new(),
            depends_install: BTreeSet::new(),
            provides_install: BTreeSet::new(),
            number: -1,
            num_tasks: -1,
        }
    }
}

/// The full graph of build tasks for one build.
pub struct BuildTaskGraph {
    tasks: BTreeMap<String, TaskNode>,
    implicit_declare: BTreeSet<InstallKey>,
    implicit_contribute: BTreeMap<InstallKey, Rc<Lazy>>,
    implicit_define: BTreeMap<InstallKey, Rc<Lazy>>,
    install_provided: BTreeSet<InstallKey>,
    finalized: bool,
    top_deps: BTreeMap<String, Vec<String>>,
    top_deps_list: Vec<String>,
    install_tree_path: Rc<dyn Fn(&InstallKey) -> PathBuf>,
}

impl BuildTaskGraph {
    /// Create a new graph with just the top-level task (fullname `""`).
    /// `install_tree_path` derives the on-disk path for a given install
    /// tree, as the release-config model would.
    #[must_use]
    pub fn new(install_tree_path: Rc<dyn Fn(&InstallKey) -> PathBuf>) -> Self {
        let mut tasks = BTreeMap::new();
        tasks.insert(String::new(), TaskNode::top());
        Self {
            tasks,
            implicit_declare: BTreeSet::new(),
            implicit_contribute: BTreeMap::new(),
            implicit_define: BTreeMap::new(),
            install_provided: BTreeSet::new(),
            finalized: false,
            top_deps: BTreeMap::new(),
            top_deps_list: Vec::new(),
            install_tree_path,
        }
    }

    fn require_not_finalized(&self, func: &str) -> Result<(), GraphError> {
        if self.finalized {
            return Err(GraphError::OperationAfterFinalization {
                name: func.to_string(),
            });
        }
        Ok(())
    }

    fn require_finalized(&self, func: &str) -> Result<(), GraphError> {
        if !self.finalized {
            return Err(GraphError::OperationAfterFinalization {
                name: func.to_string(),
            });
        }
        Ok(())
    }

    fn node(&self, name: &str) -> Result<&TaskNode, GraphError> {
        self.tasks.get(name).ok_or_else(|| GraphError::UnknownDependency {
            name: name.to_string(),
        })
    }

    fn node_mut(&mut self, name: &str) -> Result<&mut TaskNode, GraphError> {
        self.tasks
            .get_mut(name)
            .ok_or_else(|| GraphError::UnknownDependency {
                name: name.to_string(),
            })
    }

    /// Create a new task named `name` under `parent` (a fullname, `""` for
    /// the top-level task). Returns the new task's fullname.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::EmptyTaskName`] if `name` is empty,
    /// [`GraphError::DuplicateTaskName`] if the resulting fullname is
    /// already in use, or [`GraphError::OperationAfterFinalization`] if the
    /// graph is finalized.
    pub fn new_task(&mut self, parent: &str, name: &str, parallel: bool) -> Result<String, GraphError> {
        self.require_not_finalized("new_task")?;
        if name.is_empty() || name.contains('/') {
            return Err(GraphError::EmptyTaskName);
        }
        let fullname = format!("{parent}/{name}");
        if self.tasks.contains_key(&fullname) {
            return Err(GraphError::DuplicateTaskName { name: fullname });
        }
        {
            let parent_node = self.node(parent)?;
            if !parent_node.commands.is_empty() {
                return Err(GraphError::CommandsAndSubtasks {
                    name: parent.to_string(),
                });
            }
        }
        self.tasks.insert(
            fullname.clone(),
            TaskNode {
                fullname: fullname.clone(),
                parent: Some(parent.to_string()),
                parallel,
                subtasks: Vec::new(),
                commands: Vec::new(),
                env: BTreeMap::new(),
                env_prepend: BTreeMap::new(),
                depends: BTreeSet::new(),
                depends_install: BTreeSet::new(),
                provides_install: BTreeSet::new(),
                number: -1,
                num_tasks: -1,
            },
        );
        let dep = {
            let parent_node = self.node(parent)?;
            if parent_node.subtasks.is_empty() || parent_node.parallel {
                None
            } else {
                parent_node.subtasks.last().cloned()
            }
        };
        self.node_mut(parent)?.subtasks.push(fullname.clone());
        if let Some(dep) = dep {
            self.depend(&fullname, &dep)?;
        }
        Ok(fullname)
    }

    /// Add a plain command to task `name`.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::CommandsAndSubtasks`] if `name` already has
    /// subtasks, [`GraphError::CommandOnParallelTask`] if `name` is
    /// parallel, or [`GraphError::OperationAfterFinalization`].
    pub fn add_command(&mut self, name: &str, command: Vec<String>, cwd: Option<String>) -> Result<(), GraphError> {
        self.require_not_finalized("add_command")?;
        self.push_step(name, BuildStep::Command { command, cwd })
    }

    /// Add a `make` command to task `name`.
    ///
    /// # Errors
    ///
    /// See [`BuildTaskGraph::add_command`].
    pub fn add_make(&mut self, name: &str, command: Vec<String>, cwd: String) -> Result<(), GraphError> {
        self.require_not_finalized("add_make")?;
        self.push_step(name, BuildStep::Make { command, cwd })
    }

    /// Add a Python-side callback to task `name`, run via the RPC server.
    ///
    /// # Errors
    ///
    /// See [`BuildTaskGraph::add_command`].
    pub fn add_python(&mut self, name: &str, label: impl Into<String>, func: PyCall) -> Result<(), GraphError> {
        self.require_not_finalized("add_python")?;
        self.push_step(
            name,
            BuildStep::Python {
                label: label.into(),
                func,
            },
        )
    }

    fn push_step(&mut self, name: &str, step: BuildStep) -> Result<(), GraphError> {
        let node = self.node(name)?;
        if !node.subtasks.is_empty() {
            return Err(GraphError::CommandsAndSubtasks {
                name: name.to_string(),
            });
        }
        if node.parallel {
            return Err(GraphError::CommandOnParallelTask {
                name: name.to_string(),
            });
        }
        self.node_mut(name)?.commands.push(step);
        Ok(())
    }

    /// Add commands to create `directory`, leaving it alone if present.
    ///
    /// # Errors
    ///
    /// See [`BuildTaskGraph::add_command`].
    pub fn add_create_dir(&mut self, name: &str, directory: &str) -> Result<(), GraphError> {
        self.add_command(
            name,
            vec!["mkdir".to_string(), "-p".to_string(), directory.to_string()],
            None,
        )
    }

    /// Add commands to remove and recreate `directory`.
    ///
    /// # Errors
    ///
    /// See [`BuildTaskGraph::add_command`].
    pub fn add_empty_dir(&mut self, name: &str, directory: &str) -> Result<(), GraphError> {
        self.add_command(name, vec!["rm".to_string(), "-rf".to_string(), directory.to_string()], None)?;
        self.add_create_dir(name, directory)
    }

    /// Add commands to remove `directory` and create its parent.
    ///
    /// # Errors
    ///
    /// See [`BuildTaskGraph::add_command`].
    pub fn add_empty_dir_parent(&mut self, name: &str, directory: &str) -> Result<(), GraphError> {
        self.add_command(name, vec!["rm".to_string(), "-rf".to_string(), directory.to_string()], None)?;
        let parent_dir = Path::new(directory)
            .parent()
            .map_or_else(String::new, |p| p.to_string_lossy().into_owned());
        self.add_create_dir(name, &parent_dir)
    }

    /// Set environment variable `var` for task `name`, overriding any
    /// parent setting.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::InvalidEnvValue`] if `var`/`value` contain a
    /// disallowed character, or [`GraphError::SetAndPrependConflict`] if
    /// `var` was already prepended to in this task.
    pub fn env_set(&mut self, name: &str, var: &str, value: &str) -> Result<(), GraphError> {
        self.require_not_finalized("env_set")?;
        if var.contains('=') || var.contains('\n') || value.contains('\n') {
            return Err(GraphError::InvalidEnvValue { key: var.to_string() });
        }
        let node = self.node_mut(name)?;
        if node.env_prepend.contains_key(var) {
            return Err(GraphError::SetAndPrependConflict { key: var.to_string() });
        }
        node.env.insert(var.to_string(), value.to_string());
        Ok(())
    }

    /// Prepend `value` to colon-separated variable `var` for task `name`.
    ///
    /// # Errors
    ///
    /// See [`BuildTaskGraph::env_set`]; `value` must not itself contain a
    /// colon.
    pub fn env_prepend(&mut self, name: &str, var: &str, value: &str) -> Result<(), GraphError> {
        self.require_not_finalized("env_prepend")?;
        if var.contains('=') || var.contains('\n') || value.contains('\n') || value.contains(':') {
            return Err(GraphError::InvalidEnvValue { key: var.to_string() });
        }
        let node = self.node_mut(name)?;
        if node.env.contains_key(var) {
            return Err(GraphError::SetAndPrependConflict { key: var.to_string() });
        }
        node.env_prepend.entry(var.to_string()).or_default().push(value.to_string());
        Ok(())
    }

    /// Compute the full environment-variable overlay for task `name`:
    /// parent overlay, then this task's own `env_set`s, then each
    /// `env_prepend`ed variable joined with (and inheriting from) the
    /// process environment if not otherwise set.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::EnvBeforeFinalization`] if the graph is not
    /// yet finalized.
    pub fn get_full_env(&self, name: &str) -> Result<BTreeMap<String, String>, GraphError> {
        if !self.finalized {
            return Err(GraphError::EnvBeforeFinalization);
        }
        self.full_env_rec(name)
    }

    fn full_env_rec(&self, name: &str) -> Result<BTreeMap<String, String>, GraphError> {
        let node = self.node(name)?;
        let mut full_env = match &node.parent {
            Some(parent) => self.full_env_rec(parent)?,
            None => BTreeMap::new(),
        };
        full_env.extend(node.env.clone());
        for (key, vals) in &node.env_prepend {
            if !full_env.contains_key(key) {
                if let Ok(existing) = std::env::var(key) {
                    full_env.insert(key.clone(), existing);
                }
            }
            let val_txt = vals.iter().rev().cloned().collect::<Vec<_>>().join(":");
            let merged = match full_env.get(key) {
                Some(existing) => format!("{val_txt}:{existing}"),
                None => val_txt,
            };
            full_env.insert(key.clone(), merged);
        }
        Ok(full_env)
    }

    /// Add a dependency of task `name` on task `dep_name`.
    ///
    /// # Errors
    ///
    /// See [`BuildTaskGraph::env_set`].
    pub fn depend(&mut self, name: &str, dep_name: &str) -> Result<(), GraphError> {
        self.require_not_finalized("depend")?;
        self.node_mut(name)?.depends.insert(dep_name.to_string());
        Ok(())
    }

    /// Add a dependency of task `name` on the install tree `key`.
    ///
    /// # Errors
    ///
    /// See [`BuildTaskGraph::env_set`].
    pub fn depend_install(&mut self, name: &str, key: InstallKey) -> Result<(), GraphError> {
        self.require_not_finalized("depend_install")?;
        self.node_mut(name)?.depends_install.insert(key);
        Ok(())
    }

    fn provide_install_main(&mut self, name: &str, key: InstallKey) -> Result<(), GraphError> {
        self.require_not_finalized("provide_install")?;
        if self.install_provided.contains(&key) {
            return Err(GraphError::InstallTreeConflict {
                host: key.0.name().to_string(),
                name: key.1,
            });
        }
        self.install_provided.insert(key.clone());
        self.node_mut(name)?.provides_install.insert(key);
        Ok(())
    }

    /// Mark task `name` as providing install tree `key`.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::InstallTreeConflict`] if `key` was already
    /// declared, defined, contributed to, or provided.
    pub fn provide_install(&mut self, name: &str, key: InstallKey) -> Result<(), GraphError> {
        self.require_not_finalized("provide_install")?;
        if self.implicit_declare.contains(&key)
            || self.implicit_define.contains_key(&key)
            || self.implicit_contribute.contains_key(&key)
        {
            return Err(GraphError::InstallTreeConflict {
                host: key.0.name().to_string(),
                name: key.1,
            });
        }
        self.provide_install_main(name, key)
    }

    /// Declare the existence of an implicitly created install tree, which
    /// starts out empty and may be contributed to any number of times.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::InstallTreeConflict`] if `key` was already
    /// declared, defined, or provided.
    pub fn declare_implicit_install(&mut self, key: InstallKey) -> Result<(), GraphError> {
        self.require_not_finalized("declare_implicit_install")?;
        if self.implicit_declare.contains(&key)
            || self.implicit_define.contains_key(&key)
            || self.install_provided.contains(&key)
        {
            return Err(GraphError::InstallTreeConflict {
                host: key.0.name().to_string(),
                name: key.1,
            });
        }
        self.implicit_declare.insert(key);
        Ok(())
    }

    /// Add `tree` to an implicitly created install tree, unioning with
    /// anything already contributed.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::InstallTreeConflict`] if `key` was already
    /// defined or provided.
    pub fn contribute_implicit_install(&mut self, key: InstallKey, tree: Rc<Lazy>) -> Result<(), GraphError> {
        self.require_not_finalized("contribute_implicit_install")?;
        if self.implicit_define.contains_key(&key) || self.install_provided.contains(&key) {
            return Err(GraphError::InstallTreeConflict {
                host: key.0.name().to_string(),
                name: key.1,
            });
        }
        match self.implicit_contribute.remove(&key) {
            Some(existing) => {
                self.implicit_contribute
                    .insert(key, Rc::new(existing.union(tree, false)));
            }
            None => {
                self.implicit_contribute.insert(key, tree);
            }
        }
        Ok(())
    }

    /// Add `tree` to the package-input install tree for `host`.
    ///
    /// # Errors
    ///
    /// See [`BuildTaskGraph::contribute_implicit_install`].
    pub fn contribute_package(&mut self, host: InstallHost, tree: Rc<Lazy>) -> Result<(), GraphError> {
        self.contribute_implicit_install((host, "package-input".to_string()), tree)
    }

    /// Define an implicitly created install tree as exactly `tree`; it must
    /// not also be declared or contributed to.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::InstallTreeConflict`] if `key` was already
    /// declared, defined, contributed to, or provided.
    pub fn define_implicit_install(&mut self, key: InstallKey, tree: Rc<Lazy>) -> Result<(), GraphError> {
        self.require_not_finalized("define_implicit_install")?;
        if self.implicit_declare.contains(&key)
            || self.implicit_define.contains_key(&key)
            || self.implicit_contribute.contains_key(&key)
            || self.install_provided.contains(&key)
        {
            return Err(GraphError::InstallTreeConflict {
                host: key.0.name().to_string(),
                name: key.1,
            });
        }
        self.implicit_define.insert(key, tree);
        Ok(())
    }

    /// The makefile target name for the start of task `name`.
    #[must_use]
    pub fn start_name(name: &str) -> String {
        start_name_s(name)
    }

    /// The makefile target name for the end of task `name`.
    #[must_use]
    pub fn end_name(name: &str) -> String {
        end_name_s(name)
    }

    /// The log file name for task `name`.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::OperationAfterFinalization`] if called before
    /// finalization, or [`GraphError::EmptyTaskName`] if `name` has no
    /// commands (and so was never assigned a task number).
    pub fn log_name(&self, name: &str) -> Result<String, GraphError> {
        self.require_finalized("log_name")?;
        let node = self.node(name)?;
        if node.number == -1 {
            return Err(GraphError::EmptyTaskName);
        }
        Ok(format!("{:04}{}-log.txt", node.number, name.replace('/', "-")))
    }

    fn record_deps(&self, name: &str, deps: &mut BTreeMap<String, Vec<String>>) -> Result<(), GraphError> {
        let node = self.node(name)?;
        let start_name = start_name_s(name);
        let end_name = end_name_s(name);
        let mut inst_prov: Vec<&InstallKey> = node.provides_install.iter().collect();
        inst_prov.sort_by_key(|k| install_tree_key(k));
        let inst_prov_names: Vec<String> = inst_prov
            .iter()
            .map(|k| format!("install-trees/{}/{}", k.0.name(), k.1))
            .collect();
        let mut inst_dep: Vec<&InstallKey> = node.depends_install.iter().collect();
        inst_dep.sort_by_key(|k| install_tree_key(k));
        let inst_dep_names: Vec<String> = inst_dep
            .iter()
            .map(|k| format!("install-trees/{}/{}", k.0.name(), k.1))
            .collect();

        for name in inst_prov_names
            .iter()
            .cloned()
            .chain([start_name.clone(), end_name.clone()])
        {
            deps.entry(name).or_default();
        }

        let mut start_deps: Vec<String> = node.depends.iter().map(|d| end_name_s(d)).collect();
        start_deps.sort();
        if let Some(parent) = &node.parent {
            start_deps.push(start_name_s(parent));
        }
        start_deps.extend(inst_dep_names);
        deps.get_mut(&start_name).expect("just inserted").extend(start_deps);

        let mut end_deps: Vec<String> = node.subtasks.iter().map(|s| end_name_s(s)).collect();
        end_deps.push(start_name.clone());
        deps.get_mut(&end_name).expect("just inserted").extend(end_deps);

        for prov in &inst_prov_names {
            deps.get_mut(prov).expect("just inserted").push(end_name.clone());
        }

        let subtasks = node.subtasks.clone();
        for sub in subtasks {
            self.record_deps(&sub, deps)?;
        }
        Ok(())
    }

    fn create_implicit_install_tasks(&mut self) -> Result<(), GraphError> {
        for key in self.implicit_contribute.keys() {
            if !self.implicit_declare.contains(key) {
                return Err(GraphError::InstallTreeConflict {
                    host: key.0.name().to_string(),
                    name: key.1.clone(),
                });
            }
        }
        let mut all_trees: BTreeMap<InstallKey, Rc<Lazy>> = self.implicit_define.clone();
        for (key, tree) in &self.implicit_contribute {
            all_trees.insert(key.clone(), Rc::clone(tree));
        }
        for key in &self.implicit_declare {
            all_trees.entry(key.clone()).or_insert_with(|| Rc::new(Lazy::empty()));
        }

        let mut sorted_keys: Vec<InstallKey> = all_trees.keys().cloned().collect();
        sorted_keys.sort_by_key(|k| install_tree_key(k));

        for key in sorted_keys {
            let tree = Rc::clone(&all_trees[&key]);
            let (host, name) = key.clone();
            let host_task_name = format!("install-trees-{}", host.name());
            let host_task_full = format!("/{host_task_name}");
            if !self.tasks.contains_key(&host_task_full) {
                self.new_task("", &host_task_name, true)?;
            }
            let task_name = self.new_task(&host_task_full, &name, false)?;
            self.provide_install_main(&task_name, key)?;
            for dep in tree.install_trees() {
                self.depend_install(&task_name, dep)?;
            }
            let path = (self.install_tree_path)(&(host, name));
            let path_str = path.to_string_lossy().into_owned();
            self.add_empty_dir_parent(&task_name, &path_str)?;
            let export_tree = Rc::clone(&tree);
            let install_tree_path = Rc::clone(&self.install_tree_path);
            self.add_python(&task_name, format!("export install tree to {path_str}"), Rc::new(move || {
                let lookup = |key: &InstallKey| Materialized::copy(install_tree_path(key)).ok();
                export_tree
                    .resolve(&lookup)
                    .and_then(|m| m.export(&path))
                    .map_err(|e| Box::new(e) as Box<dyn std::fmt::Debug>)
            }))?;
        }
        Ok(())
    }

    /// Finalize the graph: synthesizes implicit-install-tree tasks, locks
    /// out further task/dependency/environment edits, and assigns
    /// topological task numbers. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::CircularDependency`] if the dependency graph
    /// is cyclic, or propagates any error from creating implicit install
    /// tasks.
    pub fn finalize(&mut self) -> Result<(), GraphError> {
        if self.finalized {
            return Ok(());
        }
        self.create_implicit_install_tasks()?;
        let mut top_deps = BTreeMap::new();
        self.record_deps("", &mut top_deps)?;
        let top_deps_list = tsort(&top_deps)?;

        let mut task_number: i64 = 1;
        for target in &top_deps_list {
            if let Some(t_name) = target.strip_prefix(TASK_END) {
                let has_commands = !self.node(t_name)?.commands.is_empty();
                if has_commands {
                    self.node_mut(t_name)?.number = task_number;
                    task_number += 1;
                }
            }
        }
        let num_tasks = task_number - 1;
        for node in self.tasks.values_mut() {
            node.num_tasks = num_tasks;
        }
        self.top_deps = top_deps;
        self.top_deps_list = top_deps_list;
        self.finalized = true;
        Ok(())
    }

    fn add_makefile_commands(
        &self,
        name: &str,
        makefile: &mut Makefile,
        build_context: &mut dyn BuildContext,
    ) -> Result<(), GraphError> {
        let node = self.node(name)?;
        if !node.commands.is_empty() {
            let task_desc_text = format!("[{:04}/{:04}] {}", node.number, node.num_tasks, name);
            let log = build_context.logdir().join(self.log_name(name)?);
            let target = end_name_s(name);

            let msg_start = build_context.register_task_start(task_desc_text.clone(), log.clone());
            let start_cmd = build_context.wrapper_start_task(&log, msg_start);
            makefile.add_command(&target, command_to_make(&start_cmd)?)?;

            let env = self.full_env_rec(name)?;
            for cmd in &node.commands {
                let msg_fail = build_context.register_task_fail_command(
                    task_desc_text.clone(),
                    cmd.display(),
                    log.clone(),
                );
                let line = cmd.make_string(build_context, &log, msg_fail, &env)?;
                makefile.add_command(&target, line)?;
            }

            let msg_end = build_context.register_task_end(task_desc_text.clone(), log.clone());
            let end_cmd = build_context.wrapper_end_task(&log, msg_end);
            makefile.add_command(&target, command_to_make(&end_cmd)?)?;
        }
        let subtasks = node.subtasks.clone();
        for sub in subtasks {
            self.add_makefile_commands(&sub, makefile, build_context)?;
        }
        Ok(())
    }

    /// Finalize the graph and render it as complete makefile text.
    ///
    /// # Errors
    ///
    /// Propagates any [`GraphError`] from [`BuildTaskGraph::finalize`] or
    /// from building the [`Makefile`].
    pub fn makefile_text(&mut self, build_context: &mut dyn BuildContext) -> Result<String, GraphError> {
        self.finalize()?;
        let mut makefile = Makefile::new("all");
        for target in &self.top_deps_list {
            makefile.add_target(target)?;
        }
        makefile.add_deps("all", &[end_name_s("")])?;
        for target in self.top_deps_list.clone() {
            let deps = self.top_deps[&target].clone();
            makefile.add_deps(&target, &deps)?;
        }
        self.add_makefile_commands("", &mut makefile, build_context)?;
        makefile.makefile_text()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forge_schema::PkgHost;

    struct FakeContext {
        logdir: PathBuf,
        next_id: u32,
    }

    impl FakeContext {
        fn new(logdir: PathBuf) -> Self {
            Self { logdir, next_id: 0 }
        }
    }

    impl BuildContext for FakeContext {
        fn logdir(&self) -> &Path {
            &self.logdir
        }
        fn wrapper_run_command(&mut self, log: &Path, fail_msg: u32, cwd: &str) -> Vec<String> {
            vec![
                "wrapper".to_string(),
                "run".to_string(),
                log.display().to_string(),
                fail_msg.to_string(),
                cwd.to_string(),
            ]
        }
        fn wrapper_start_task(&mut self, log: &Path, msg: u32) -> Vec<String> {
            vec!["wrapper".to_string(), "start".to_string(), log.display().to_string(), msg.to_string()]
        }
        fn wrapper_end_task(&mut self, log: &Path, msg: u32) -> Vec<String> {
            vec!["wrapper".to_string(), "end".to_string(), log.display().to_string(), msg.to_string()]
        }
        fn rpc_client_command(&mut self, msg: u32) -> Vec<String> {
            vec!["wrapper".to_string(), "rpc-client".to_string(), msg.to_string()]
        }
        fn register_call(&mut self, _func: PyCall, _log: PathBuf, _forking: bool) -> u32 {
            self.next_id += 1;
            self.next_id
        }
        fn register_task_start(&mut self, _task_desc: String, _log: PathBuf) -> u32 {
            self.next_id += 1;
            self.next_id
        }
        fn register_task_fail_command(&mut self, _task_desc: String, _command: String, _log: PathBuf) -> u32 {
            self.next_id += 1;
            self.next_id
        }
        fn register_task_end(&mut self, _task_desc: String, _log: PathBuf) -> u32 {
            self.next_id += 1;
            self.next_id
        }
    }

    fn test_graph() -> BuildTaskGraph {
        BuildTaskGraph::new(Rc::new(|key: &InstallKey| PathBuf::from(format!("/tmp/install-trees/{}/{}", key.0.name(), key.1))))
    }

    #[test]
    fn new_task_establishes_serial_auto_dependency() {
        let mut graph = test_graph();
        let a = graph.new_task("", "a", false).unwrap();
        let b = graph.new_task("", "b", false).unwrap();
        assert_eq!(a, "/a");
        assert_eq!(b, "/b");
        graph.finalize().unwrap();
        assert!(graph.top_deps[&start_name_s("/b")].contains(&end_name_s("/a")));
    }

    #[test]
    fn parallel_task_has_no_auto_dependency_between_children() {
        let mut graph = test_graph();
        graph.new_task("", "par", true).unwrap();
        let a = graph.new_task("/par", "a", false).unwrap();
        let b = graph.new_task("/par", "b", false).unwrap();
        graph.finalize().unwrap();
        assert!(!graph.top_deps[&start_name_s(&b)].contains(&end_name_s(&a)));
    }

    #[test]
    fn env_set_and_prepend_conflict_rejected() {
        let mut graph = test_graph();
        graph.new_task("", "a", false).unwrap();
        graph.env_set("/a", "PATH", "/x").unwrap();
        assert!(graph.env_prepend("/a", "PATH", "/y").is_err());
    }

    #[test]
    fn get_full_env_inherits_and_overlays_parent() {
        let mut graph = test_graph();
        graph.new_task("", "par", false).unwrap();
        graph.env_set("/par", "FOO", "1").unwrap();
        let child = graph.new_task("/par", "child", false).unwrap();
        graph.env_set(&child, "BAR", "2").unwrap();
        graph.finalize().unwrap();
        let env = graph.get_full_env(&child).unwrap();
        assert_eq!(env.get("FOO").map(String::as_str), Some("1"));
        assert_eq!(env.get("BAR").map(String::as_str), Some("2"));
    }

    #[test]
    fn env_prepend_joins_reversed_and_colon_separated() {
        let mut graph = test_graph();
        graph.new_task("", "a", false).unwrap();
        graph.env_prepend("/a", "PATH", "/first").unwrap();
        graph.env_prepend("/a", "PATH", "/second").unwrap();
        graph.finalize().unwrap();
        let env = graph.get_full_env("/a").unwrap();
        assert_eq!(env.get("PATH").map(String::as_str), Some("/second:/first"));
    }

    #[test]
    fn finalize_assigns_topological_task_numbers() {
        let mut graph = test_graph();
        graph.new_task("", "a", false).unwrap();
        graph.add_command("/a", vec!["true".to_string()], None).unwrap();
        graph.new_task("", "b", false).unwrap();
        graph.add_command("/b", vec!["true".to_string()], None).unwrap();
        graph.finalize().unwrap();
        assert_eq!(graph.node("/a").unwrap().number, 1);
        assert_eq!(graph.node("/b").unwrap().number, 2);
    }

    #[test]
    fn implicit_install_tree_tasks_are_synthesized() {
        let mut graph = test_graph();
        let host = InstallHost::Pkg(PkgHost::new("x86_64-linux-gnu"));
        graph
            .declare_implicit_install((host.clone(), "foo".to_string()))
            .unwrap();
        graph
            .contribute_implicit_install((host.clone(), "foo".to_string()), Rc::new(Lazy::empty()))
            .unwrap();
        graph.finalize().unwrap();
        assert!(graph.tasks.contains_key("/install-trees-x86_64-linux-gnu/foo"));
    }

    #[test]
    fn makefile_text_renders_without_error() {
        let mut graph = test_graph();
        graph.new_task("", "a", false).unwrap();
        graph.add_command("/a", vec!["true".to_string()], None).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = FakeContext::new(dir.path().to_path_buf());
        let text = graph.makefile_text(&mut ctx).unwrap();
        assert!(text.contains("all:"));
    }

    #[test]
    fn double_finalize_is_a_no_op() {
        let mut graph = test_graph();
        graph.new_task("", "a", false).unwrap();
        graph.finalize().unwrap();
        graph.finalize().unwrap();
    }
}
