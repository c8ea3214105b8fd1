//! Derived lookup maps over the task table.
//!
//! [`TaskIndex`] is rebuilt from the table on open and kept in step with it by every
//! mutation. It is never persisted. The store keeps it behind the same lock as the
//! table so readers never see one map updated without the others.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use rustc_hash::FxHashMap;
use tracing::error;

use crate::model::{Task, TaskStatus};
use crate::storage::graph::{find_cycle_from, DependencyGraph};
use crate::types::{Result, TaskError};

/// One reversible change to a single map.
#[derive(Debug)]
enum Step {
    Path(String),
    Status(TaskStatus, String),
    Parent(String, String),
    Project(String, String),
    Dependency(String, String),
}

/// Path, status, parent, project and reverse-dependency maps.
#[derive(Default, Debug)]
pub struct TaskIndex {
    by_path: FxHashMap<String, Arc<Task>>,
    by_status: FxHashMap<TaskStatus, BTreeSet<String>>,
    by_parent: FxHashMap<String, BTreeSet<String>>,
    by_project: FxHashMap<String, BTreeSet<String>>,
    /// Project root of each indexed path.
    project_of: FxHashMap<String, String>,
    by_dependency: FxHashMap<String, BTreeSet<String>>,
}

impl TaskIndex {
    /// Creates an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds an index from a table. Parents are indexed before their children.
    pub fn build(tasks: &BTreeMap<String, Task>) -> Result<Self> {
        let mut index = Self::new();
        index.rebuild(tasks)?;
        Ok(index)
    }

    /// Number of indexed tasks.
    pub fn len(&self) -> usize {
        self.by_path.len()
    }

    /// True when nothing is indexed.
    pub fn is_empty(&self) -> bool {
        self.by_path.is_empty()
    }

    /// Adds `task` to all five maps. If any map rejects it, the maps already touched are
    /// restored and the error returned.
    pub fn index_task(&mut self, task: &Task) -> Result<()> {
        let mut journal = Vec::with_capacity(4 + task.dependencies.len());
        match self.index_steps(task, &mut journal) {
            Ok(()) => Ok(()),
            Err(err) => {
                self.undo(journal);
                Err(err)
            }
        }
    }

    fn index_steps(&mut self, task: &Task, journal: &mut Vec<Step>) -> Result<()> {
        let path = task.path.clone();
        if self.by_path.contains_key(&path) {
            return Err(TaskError::validation(path, "index", "path already indexed"));
        }
        self.by_path.insert(path.clone(), Arc::new(task.clone()));
        journal.push(Step::Path(path.clone()));

        self.by_status
            .entry(task.status)
            .or_default()
            .insert(path.clone());
        journal.push(Step::Status(task.status, path.clone()));

        let project = match &task.parent_path {
            Some(parent) => {
                self.by_parent
                    .entry(parent.clone())
                    .or_default()
                    .insert(path.clone());
                journal.push(Step::Parent(parent.clone(), path.clone()));
                self.project_of.get(parent).cloned().ok_or_else(|| {
                    TaskError::validation(
                        path.clone(),
                        "index",
                        format!("parent {parent} is not indexed"),
                    )
                })?
            }
            None => path.clone(),
        };
        self.by_project
            .entry(project.clone())
            .or_default()
            .insert(path.clone());
        self.project_of.insert(path.clone(), project.clone());
        journal.push(Step::Project(project, path.clone()));

        self.index_dependencies_journaled(&path, &task.dependencies, journal);
        Ok(())
    }

    /// Removes `path` from all five maps and returns the indexed task.
    ///
    /// Fails with `NotFound` if the path is not indexed, or with a system error if the
    /// maps disagree; in the latter case the maps are restored first.
    pub fn unindex_task(&mut self, path: &str) -> Result<Arc<Task>> {
        let task = self
            .by_path
            .get(path)
            .cloned()
            .ok_or_else(|| TaskError::not_found(path))?;
        let mut journal = Vec::with_capacity(4 + task.dependencies.len());
        match self.unindex_steps(&task, &mut journal) {
            Ok(()) => Ok(task),
            Err(err) => {
                error!(path, error = %err, "index.unindex.inconsistent");
                self.redo(journal, &task);
                Err(err)
            }
        }
    }

    fn unindex_steps(&mut self, task: &Arc<Task>, journal: &mut Vec<Step>) -> Result<()> {
        let path = task.path.as_str();
        let missing = |map: &str| TaskError::System(format!("{path} missing from {map} index"));

        self.by_path.remove(path);
        journal.push(Step::Path(path.to_string()));

        if !remove_member(&mut self.by_status, &task.status, path) {
            return Err(missing("status"));
        }
        journal.push(Step::Status(task.status, path.to_string()));

        if let Some(parent) = &task.parent_path {
            if !remove_member(&mut self.by_parent, parent, path) {
                return Err(missing("parent"));
            }
            journal.push(Step::Parent(parent.clone(), path.to_string()));
        }

        let project = self.project_of.remove(path).ok_or_else(|| missing("project"))?;
        if !remove_member(&mut self.by_project, &project, path) {
            self.project_of.insert(path.to_string(), project);
            return Err(missing("project"));
        }
        journal.push(Step::Project(project, path.to_string()));

        for dep in &task.dependencies {
            if !remove_member(&mut self.by_dependency, dep, path) {
                return Err(missing("dependency"));
            }
            journal.push(Step::Dependency(dep.clone(), path.to_string()));
        }
        Ok(())
    }

    /// Records `path` as a dependent of every entry in `deps`.
    pub fn index_dependencies(&mut self, path: &str, deps: &[String]) {
        let mut journal = Vec::new();
        self.index_dependencies_journaled(path, deps, &mut journal);
    }

    fn index_dependencies_journaled(&mut self, path: &str, deps: &[String], journal: &mut Vec<Step>) {
        for dep in deps {
            if self
                .by_dependency
                .entry(dep.clone())
                .or_default()
                .insert(path.to_string())
            {
                journal.push(Step::Dependency(dep.clone(), path.to_string()));
            }
        }
    }

    /// Removes `path` as a dependent of every entry in `deps`.
    pub fn unindex_dependencies(&mut self, path: &str, deps: &[String]) {
        for dep in deps {
            remove_member(&mut self.by_dependency, dep, path);
        }
    }

    /// Task at `path`.
    pub fn get(&self, path: &str) -> Option<&Arc<Task>> {
        self.by_path.get(path)
    }

    /// Tasks with `status`, ordered by path.
    pub fn tasks_by_status(&self, status: TaskStatus) -> Vec<Arc<Task>> {
        self.resolve(self.by_status.get(&status))
    }

    /// Direct children of `parent`, ordered by path.
    pub fn tasks_by_parent(&self, parent: &str) -> Vec<Arc<Task>> {
        self.resolve(self.by_parent.get(parent))
    }

    /// Every task in the project containing `path`, the root included.
    pub fn project_tasks(&self, path: &str) -> Vec<Arc<Task>> {
        match self.project_of.get(path) {
            Some(root) => self.resolve(self.by_project.get(root)),
            None => Vec::new(),
        }
    }

    /// Project root of `path`.
    pub fn project_of(&self, path: &str) -> Option<&str> {
        self.project_of.get(path).map(String::as_str)
    }

    /// Tasks that list `path` as a dependency.
    pub fn dependent_tasks(&self, path: &str) -> Vec<Arc<Task>> {
        self.resolve(self.by_dependency.get(path))
    }

    /// Cycle that giving `path` the dependency list `deps` would create, if any.
    pub fn has_cycle_with(&self, path: &str, deps: &[String]) -> Option<Vec<String>> {
        find_cycle_from(self, path, deps)
    }

    /// Tasks without a parent.
    pub fn project_root_tasks(&self) -> Vec<Arc<Task>> {
        let mut roots: Vec<Arc<Task>> = self
            .by_project
            .keys()
            .filter_map(|root| self.by_path.get(root).cloned())
            .collect();
        roots.sort_by(|a, b| a.path.cmp(&b.path));
        roots
    }

    /// Paths of `path` and all its descendants, deepest first.
    pub fn subtree_post_order(&self, path: &str) -> Vec<String> {
        let mut out = Vec::new();
        let mut stack = vec![(path.to_string(), false)];
        while let Some((node, expanded)) = stack.pop() {
            if expanded {
                out.push(node);
                continue;
            }
            stack.push((node.clone(), true));
            if let Some(children) = self.by_parent.get(&node) {
                for child in children.iter().rev() {
                    stack.push((child.clone(), false));
                }
            }
        }
        out
    }

    /// Counts per status.
    pub fn status_counts(&self) -> BTreeMap<TaskStatus, usize> {
        TaskStatus::ALL
            .iter()
            .map(|status| (*status, self.by_status.get(status).map_or(0, BTreeSet::len)))
            .collect()
    }

    /// Drops every entry in all maps.
    pub fn clear(&mut self) {
        self.by_path.clear();
        self.by_status.clear();
        self.by_parent.clear();
        self.by_project.clear();
        self.project_of.clear();
        self.by_dependency.clear();
    }

    /// Replaces the contents with an index of `tasks`.
    pub fn rebuild(&mut self, tasks: &BTreeMap<String, Task>) -> Result<()> {
        self.clear();
        let mut ordered: Vec<&Task> = tasks.values().collect();
        ordered.sort_by_key(|task| task.path.matches('/').count());
        for task in ordered {
            if let Err(err) = self.index_task(task) {
                self.clear();
                return Err(TaskError::Corruption(format!(
                    "cannot index {}: {err}",
                    task.path
                )));
            }
        }
        Ok(())
    }

    /// Compares the index against a fresh build from `tasks` and describes every
    /// difference. An empty result means the index is consistent.
    pub fn check_consistency(&self, tasks: &BTreeMap<String, Task>) -> Vec<String> {
        let expected = match TaskIndex::build(tasks) {
            Ok(index) => index,
            Err(err) => return vec![err.to_string()],
        };
        let mut issues = Vec::new();
        for (path, task) in tasks {
            match self.by_path.get(path) {
                Some(indexed) if indexed.as_ref() == task => {}
                Some(_) => issues.push(format!("path index holds a stale copy of {path}")),
                None => issues.push(format!("path index is missing {path}")),
            }
        }
        for path in self.by_path.keys() {
            if !tasks.contains_key(path) {
                issues.push(format!("path index references deleted task {path}"));
            }
        }
        diff_sets("status", &self.by_status, &expected.by_status, &mut issues);
        diff_sets("parent", &self.by_parent, &expected.by_parent, &mut issues);
        diff_sets("project", &self.by_project, &expected.by_project, &mut issues);
        diff_sets(
            "dependency",
            &self.by_dependency,
            &expected.by_dependency,
            &mut issues,
        );
        issues
    }

    fn resolve(&self, paths: Option<&BTreeSet<String>>) -> Vec<Arc<Task>> {
        paths
            .into_iter()
            .flatten()
            .filter_map(|path| self.by_path.get(path).cloned())
            .collect()
    }

    /// Reverts index steps, newest first.
    fn undo(&mut self, journal: Vec<Step>) {
        for step in journal.into_iter().rev() {
            match step {
                Step::Path(path) => {
                    self.by_path.remove(&path);
                }
                Step::Status(status, path) => {
                    remove_member(&mut self.by_status, &status, &path);
                }
                Step::Parent(parent, path) => {
                    remove_member(&mut self.by_parent, &parent, &path);
                }
                Step::Project(project, path) => {
                    remove_member(&mut self.by_project, &project, &path);
                    self.project_of.remove(&path);
                }
                Step::Dependency(dep, path) => {
                    remove_member(&mut self.by_dependency, &dep, &path);
                }
            }
        }
    }

    /// Reverts unindex steps, newest first.
    fn redo(&mut self, journal: Vec<Step>, task: &Arc<Task>) {
        for step in journal.into_iter().rev() {
            match step {
                Step::Path(path) => {
                    self.by_path.insert(path, Arc::clone(task));
                }
                Step::Status(status, path) => {
                    self.by_status.entry(status).or_default().insert(path);
                }
                Step::Parent(parent, path) => {
                    self.by_parent.entry(parent).or_default().insert(path);
                }
                Step::Project(project, path) => {
                    self.by_project
                        .entry(project.clone())
                        .or_default()
                        .insert(path.clone());
                    self.project_of.insert(path, project);
                }
                Step::Dependency(dep, path) => {
                    self.by_dependency.entry(dep).or_default().insert(path);
                }
            }
        }
    }
}

impl DependencyGraph for TaskIndex {
    fn dependencies_of(&self, path: &str) -> Option<&[String]> {
        self.by_path.get(path).map(|task| task.dependencies.as_slice())
    }
}

fn remove_member<K>(map: &mut FxHashMap<K, BTreeSet<String>>, key: &K, member: &str) -> bool
where
    K: std::hash::Hash + Eq,
{
    let Some(set) = map.get_mut(key) else {
        return false;
    };
    let removed = set.remove(member);
    if set.is_empty() {
        map.remove(key);
    }
    removed
}

fn diff_sets<K>(
    name: &str,
    actual: &FxHashMap<K, BTreeSet<String>>,
    expected: &FxHashMap<K, BTreeSet<String>>,
    issues: &mut Vec<String>,
) where
    K: std::hash::Hash + Eq + std::fmt::Debug,
{
    for (key, want) in expected {
        match actual.get(key) {
            Some(have) if have == want => {}
            Some(have) => issues.push(format!(
                "{name} index for {key:?} has {have:?}, expected {want:?}"
            )),
            None => issues.push(format!("{name} index is missing key {key:?}")),
        }
    }
    for key in actual.keys() {
        if !expected.contains_key(key) {
            issues.push(format!("{name} index has unexpected key {key:?}"));
        }
    }
}
