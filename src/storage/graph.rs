//! Cycle detection over task dependency edges.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::model::Task;

/// Read access to dependency edges keyed by task path.
pub trait DependencyGraph {
    /// Dependencies of `path`, or `None` if the task does not exist.
    fn dependencies_of(&self, path: &str) -> Option<&[String]>;
}

impl DependencyGraph for BTreeMap<String, Task> {
    fn dependencies_of(&self, path: &str) -> Option<&[String]> {
        self.get(path).map(|task| task.dependencies.as_slice())
    }
}

/// Checks whether giving `path` the dependency list `deps` would close a cycle.
///
/// Returns the cycle as `[path, .., path]`. The current edges of `path` itself are
/// never followed, so replacing a task's dependency list is checked against the new
/// list only.
pub fn find_cycle_from<G>(graph: &G, path: &str, deps: &[String]) -> Option<Vec<String>>
where
    G: DependencyGraph + ?Sized,
{
    if deps.iter().any(|dep| dep == path) {
        return Some(vec![path.to_string(), path.to_string()]);
    }
    let mut finished: HashSet<&str> = HashSet::new();
    for dep in deps {
        if finished.contains(dep.as_str()) {
            continue;
        }
        // (node, index of the next child to visit)
        let mut stack: Vec<(&str, usize)> = vec![(dep.as_str(), 0)];
        let mut on_stack: HashSet<&str> = HashSet::from([dep.as_str()]);
        while let Some(&(node, next)) = stack.last() {
            let children = graph.dependencies_of(node).unwrap_or(&[]);
            if next >= children.len() {
                stack.pop();
                on_stack.remove(node);
                finished.insert(node);
                continue;
            }
            if let Some(top) = stack.last_mut() {
                top.1 += 1;
            }
            let child = children[next].as_str();
            if child == path {
                let mut cycle = Vec::with_capacity(stack.len() + 2);
                cycle.push(path.to_string());
                cycle.extend(stack.iter().map(|(n, _)| n.to_string()));
                cycle.push(path.to_string());
                return Some(cycle);
            }
            if finished.contains(child) || on_stack.contains(child) {
                continue;
            }
            on_stack.insert(child);
            stack.push((child, 0));
        }
    }
    None
}

/// Finds every cycle reachable in the graph, one per strongly connected entry point.
///
/// Used by integrity checks; normal writes never let a cycle in.
pub fn find_cycles<'a, G, I>(graph: &'a G, nodes: I) -> Vec<Vec<String>>
where
    G: DependencyGraph + ?Sized,
    I: IntoIterator<Item = &'a str>,
{
    #[derive(Clone, Copy, PartialEq, Eq)]
    enum Mark {
        Active,
        Done,
    }

    let mut marks: HashMap<&'a str, Mark> = HashMap::new();
    let mut cycles = Vec::new();
    for root in nodes {
        if marks.contains_key(root) {
            continue;
        }
        let mut stack: Vec<(&'a str, usize)> = vec![(root, 0)];
        marks.insert(root, Mark::Active);
        while let Some(&(node, next)) = stack.last() {
            let children = graph.dependencies_of(node).unwrap_or(&[]);
            if next >= children.len() {
                stack.pop();
                marks.insert(node, Mark::Done);
                continue;
            }
            if let Some(top) = stack.last_mut() {
                top.1 += 1;
            }
            let child = children[next].as_str();
            match marks.get(child) {
                Some(Mark::Done) => {}
                Some(Mark::Active) => {
                    let start = stack.iter().position(|(n, _)| *n == child).unwrap_or(0);
                    let mut cycle: Vec<String> =
                        stack[start..].iter().map(|(n, _)| n.to_string()).collect();
                    cycle.push(child.to_string());
                    cycles.push(cycle);
                }
                None => {
                    marks.insert(child, Mark::Active);
                    stack.push((child, 0));
                }
            }
        }
    }
    cycles
}
