//! End-to-end coverage of `BuildTaskGraph` lowering straight through to
//! rendered makefile text, exercising several modules (`buildtask`,
//! `makefile`, `tsort`) together the way a real driver invokes them.

use std::path::{Path, PathBuf};
use std::rc::Rc;

use forge_core::buildtask::{BuildContext, BuildTaskGraph, PyCall};
use forge_schema::InstallKey;

struct RecordingContext {
    logdir: PathBuf,
    next_id: u32,
    registered_starts: Vec<String>,
    registered_ends: Vec<String>,
}

impl RecordingContext {
    fn new(logdir: PathBuf) -> Self {
        Self {
            logdir,
            next_id: 0,
            registered_starts: Vec::new(),
            registered_ends: Vec::new(),
        }
    }

    fn alloc(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }
}

impl BuildContext for RecordingContext {
    fn logdir(&self) -> &Path {
        &self.logdir
    }

    fn wrapper_run_command(&mut self, log: &Path, fail_msg: u32, cwd: &str) -> Vec<String> {
        vec!["forge".into(), "run-command".into(), log.display().to_string(), fail_msg.to_string(), cwd.into()]
    }

    fn wrapper_start_task(&mut self, log: &Path, msg: u32) -> Vec<String> {
        vec!["forge".into(), "start-task".into(), log.display().to_string(), msg.to_string()]
    }

    fn wrapper_end_task(&mut self, log: &Path, msg: u32) -> Vec<String> {
        vec!["forge".into(), "end-task".into(), log.display().to_string(), msg.to_string()]
    }

    fn rpc_client_command(&mut self, msg: u32) -> Vec<String> {
        vec!["forge".into(), "rpc-client".into(), msg.to_string()]
    }

    fn register_call(&mut self, _func: PyCall, _log: PathBuf, _forking: bool) -> u32 {
        self.alloc()
    }

    fn register_task_start(&mut self, task_desc: String, _log: PathBuf) -> u32 {
        self.registered_starts.push(task_desc);
        self.alloc()
    }

    fn register_task_fail_command(&mut self, _task_desc: String, _command: String, _log: PathBuf) -> u32 {
        self.alloc()
    }

    fn register_task_end(&mut self, task_desc: String, _log: PathBuf) -> u32 {
        self.registered_ends.push(task_desc);
        self.alloc()
    }
}

fn graph_with_install_tree() -> BuildTaskGraph {
    BuildTaskGraph::new(Rc::new(|key: &InstallKey| PathBuf::from(format!("/tmp/install-trees/{}/{}", key.0.name(), key.1))))
}

#[test]
fn two_dependent_tasks_lower_to_a_makefile_with_all_first() {
    let mut graph = graph_with_install_tree();

    let fetch = graph.new_task("", "fetch", false).unwrap();
    graph.add_command(&fetch, vec!["curl".into(), "-O".into(), "src.tar".into()], None).unwrap();

    let compile = graph.new_task("", "compile", false).unwrap();
    graph.add_make(&compile, vec!["make".into()], "build".into()).unwrap();
    graph.depend(&compile, &fetch).unwrap();

    graph.finalize().unwrap();

    let dir = tempfile::tempdir().unwrap();
    let mut ctx = RecordingContext::new(dir.path().to_path_buf());
    let text = graph.makefile_text(&mut ctx).unwrap();

    let all_line = text.lines().find(|l| l.starts_with("all:")).expect("an all target");
    assert!(all_line.contains(&BuildTaskGraph::end_name(&compile)));

    let compile_target = format!("{}:", BuildTaskGraph::end_name(&compile));
    let compile_pos = text.find(&compile_target).unwrap();
    let fetch_dep = BuildTaskGraph::end_name(&fetch);
    assert!(text[compile_pos..].lines().next().unwrap().contains(&fetch_dep));

    assert!(ctx.registered_starts.iter().any(|d| d.contains("fetch")));
    assert!(ctx.registered_ends.iter().any(|d| d.contains("compile")));
}

#[test]
fn parallel_subtasks_all_depend_on_their_parent_start() {
    let mut graph = graph_with_install_tree();

    let build_all = graph.new_task("", "build-all", true).unwrap();
    let build_a = graph.new_task(&build_all, "build-a", false).unwrap();
    graph.add_command(&build_a, vec!["make".into(), "a".into()], None).unwrap();
    let build_b = graph.new_task(&build_all, "build-b", false).unwrap();
    graph.add_command(&build_b, vec!["make".into(), "b".into()], None).unwrap();

    graph.finalize().unwrap();

    let dir = tempfile::tempdir().unwrap();
    let mut ctx = RecordingContext::new(dir.path().to_path_buf());
    let text = graph.makefile_text(&mut ctx).unwrap();

    let start_a = format!("{}:", BuildTaskGraph::start_name(&build_a));
    let pos = text.find(&start_a).unwrap();
    let parent_start = BuildTaskGraph::start_name(&build_all);
    assert!(text[pos..].lines().next().unwrap().contains(&parent_start));
}
