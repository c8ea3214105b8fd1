use serde::Serialize;

use super::store::StoreState;
use crate::storage::graph::find_cycles;
use crate::validation::is_path_ancestor;

/// Findings of [`TaskStore::verify`](super::TaskStore::verify).
#[derive(Debug, Clone, Default, Serialize)]
pub struct VerifyReport {
    /// Tasks in the in-memory table.
    pub tasks_checked: usize,
    /// Whether the primary file decoded with valid checksums.
    pub primary_ok: bool,
    /// Tasks stored in the primary file itself.
    pub primary_tasks: usize,
    /// Live WAL segments.
    pub wal_segments: usize,
    /// One line per problem found.
    pub issues: Vec<String>,
}

impl VerifyReport {
    /// True when nothing was found.
    pub fn is_ok(&self) -> bool {
        self.issues.is_empty()
    }
}

/// Referential checks over the table plus index consistency.
pub(crate) fn check_table(state: &StoreState) -> Vec<String> {
    let mut issues = state.index.check_consistency(&state.table);
    for (path, task) in &state.table {
        if let Some(parent) = &task.parent_path {
            if !state.table.contains_key(parent) {
                issues.push(format!("{path} has missing parent {parent}"));
            } else if !is_path_ancestor(parent, path) {
                issues.push(format!("{path} has parent {parent} outside its path"));
            }
        }
        for dep in &task.dependencies {
            if !state.table.contains_key(dep) {
                issues.push(format!("{path} depends on missing task {dep}"));
            }
        }
    }
    for cycle in find_cycles(&state.table, state.table.keys().map(String::as_str)) {
        issues.push(format!("dependency cycle {}", cycle.join(" -> ")));
    }
    issues
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NewTask;
    use crate::storage::TaskIndex;
    use std::collections::BTreeMap;

    #[test]
    fn dangling_references_and_cycles_are_reported() {
        let mut table = BTreeMap::new();
        for task in [
            NewTask::new("a").depends_on("b").into_task(0),
            NewTask::new("b").depends_on("a").into_task(0),
            NewTask::new("c").depends_on("gone").into_task(0),
        ] {
            table.insert(task.path.clone(), task);
        }
        let index = TaskIndex::build(&table).unwrap();
        let issues = check_table(&StoreState { table, index });
        assert!(issues.iter().any(|i| i == "c depends on missing task gone"));
        assert!(issues.iter().any(|i| i == "dependency cycle a -> b -> a"));
    }
}
