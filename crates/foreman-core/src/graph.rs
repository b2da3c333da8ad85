//! Dependency graph over task IDs.
//!
//! Both edge directions are maintained on every insertion: forward edges
//! (task -> its dependencies) and reverse edges (task -> its dependents).
//! For every forward edge A -> B there is exactly one reverse edge B -> A.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

/// Forward and reverse dependency edges, keyed by task ID.
#[derive(Debug, Default)]
pub struct DependencyGraph {
    forward: HashMap<String, Vec<String>>,
    reverse: HashMap<String, Vec<String>>,
}

impl DependencyGraph {
    /// Creates an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a task and its dependency edges. Dependencies that have not
    /// been inserted yet still get edge entries; plan validation guarantees
    /// they arrive before execution.
    pub fn insert(&mut self, id: &str, deps: &[String]) {
        self.forward
            .entry(id.to_string())
            .or_default()
            .extend(deps.iter().cloned());
        self.reverse.entry(id.to_string()).or_default();

        for dep in deps {
            self.reverse
                .entry(dep.clone())
                .or_default()
                .push(id.to_string());
            self.forward.entry(dep.clone()).or_default();
        }
    }

    /// Whether the task is present.
    pub fn contains(&self, id: &str) -> bool {
        self.forward.contains_key(id)
    }

    /// Number of tasks in the graph.
    pub fn len(&self) -> usize {
        self.forward.len()
    }

    /// Whether the graph has no tasks.
    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }

    /// Direct dependencies of a task.
    pub fn dependencies_of(&self, id: &str) -> &[String] {
        self.forward.get(id).map_or(&[], Vec::as_slice)
    }

    /// Direct dependents of a task.
    pub fn dependents_of(&self, id: &str) -> &[String] {
        self.reverse.get(id).map_or(&[], Vec::as_slice)
    }

    /// Finds the first dependency cycle, if any.
    ///
    /// Depth-first search with an explicit recursion-stack set and a single
    /// mutable path vector (push/pop, no per-call path copies). The returned
    /// path is ordered and ends where it started.
    pub fn detect_cycle(&self) -> Option<Vec<String>> {
        let mut visited = HashSet::new();
        let mut on_stack = HashSet::new();
        let mut path = Vec::new();

        // Deterministic traversal order so the same graph reports the same
        // cycle every time.
        let mut roots: Vec<&String> = self.forward.keys().collect();
        roots.sort();

        for root in roots {
            if let Some(cycle) = self.visit(root, &mut visited, &mut on_stack, &mut path) {
                return Some(cycle);
            }
        }
        None
    }

    fn visit(
        &self,
        node: &str,
        visited: &mut HashSet<String>,
        on_stack: &mut HashSet<String>,
        path: &mut Vec<String>,
    ) -> Option<Vec<String>> {
        if on_stack.contains(node) {
            let start = path.iter().position(|p| p.as_str() == node).unwrap_or(0);
            let mut cycle = path[start..].to_vec();
            cycle.push(node.to_string());
            return Some(cycle);
        }
        if visited.contains(node) {
            return None;
        }

        visited.insert(node.to_string());
        on_stack.insert(node.to_string());
        path.push(node.to_string());

        for dep in self.dependencies_of(node) {
            if let Some(cycle) = self.visit(dep, visited, on_stack, path) {
                return Some(cycle);
            }
        }

        on_stack.remove(node);
        path.pop();
        None
    }

    /// Every task reachable from `id` via reverse edges: the set that can
    /// never run once `id` has failed.
    pub fn transitive_dependents(&self, id: &str) -> BTreeSet<String> {
        let mut result = BTreeSet::new();
        let mut queue: VecDeque<&str> = VecDeque::new();
        queue.push_back(id);

        while let Some(current) = queue.pop_front() {
            for dependent in self.dependents_of(current) {
                if result.insert(dependent.clone()) {
                    queue.push_back(dependent);
                }
            }
        }
        result
    }
}
