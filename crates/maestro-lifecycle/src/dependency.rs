//! Dependency graph over agents.
//!
//! Tracks which agents must outlive which, answers termination-safety
//! queries, and produces deterministic creation orders that respect
//! dependency constraints.

use std::collections::{HashMap, HashSet};

/// Forward and reverse dependency edges between agents.
///
/// An edge `a → b` means `a` depends on `b`: `b` must reach READY before `a`
/// initializes and must not terminate while `a` is active.
#[derive(Debug, Default)]
pub struct DependencyGraph<Id>
where
    Id: Copy + Eq + std::hash::Hash + Ord,
{
    forward: HashMap<Id, HashSet<Id>>,
    reverse: HashMap<Id, HashSet<Id>>,
}

impl<Id> DependencyGraph<Id>
where
    Id: Copy + Eq + std::hash::Hash + Ord,
{
    /// Create an empty graph.
    pub fn new() -> Self {
        Self {
            forward: HashMap::new(),
            reverse: HashMap::new(),
        }
    }

    /// Ensure a node exists.
    pub fn add_agent(&mut self, agent: Id) {
        self.forward.entry(agent).or_default();
        self.reverse.entry(agent).or_default();
    }

    /// Record that `agent` depends on `depends_on`.
    pub fn add_dependency(&mut self, agent: Id, depends_on: Id) {
        self.add_agent(agent);
        self.add_agent(depends_on);
        self.forward.get_mut(&agent).map(|deps| deps.insert(depends_on));
        self.reverse
            .get_mut(&depends_on)
            .map(|dependents| dependents.insert(agent));
    }

    /// Remove a node and all its edges.
    pub fn remove_agent(&mut self, agent: Id) {
        if let Some(deps) = self.forward.remove(&agent) {
            for dep in deps {
                if let Some(dependents) = self.reverse.get_mut(&dep) {
                    dependents.remove(&agent);
                }
            }
        }
        if let Some(dependents) = self.reverse.remove(&agent) {
            for dependent in dependents {
                if let Some(deps) = self.forward.get_mut(&dependent) {
                    deps.remove(&agent);
                }
            }
        }
    }

    /// Direct dependencies of `agent`.
    pub fn dependencies_of(&self, agent: Id) -> Vec<Id> {
        let mut deps: Vec<Id> = self
            .forward
            .get(&agent)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default();
        deps.sort();
        deps
    }

    /// Active agents that directly depend on `agent`.
    ///
    /// `Ok(())` when none remain; `Err` carries the sorted blockers.
    pub fn can_terminate(&self, agent: Id, active: &HashSet<Id>) -> Result<(), Vec<Id>> {
        let mut blockers: Vec<Id> = self
            .reverse
            .get(&agent)
            .map(|dependents| dependents.intersection(active).copied().collect())
            .unwrap_or_default();
        if blockers.is_empty() {
            Ok(())
        } else {
            blockers.sort();
            Err(blockers)
        }
    }

    /// Deterministic order in which `agents` can be created: every agent
    /// appears after all of its dependencies within the set.
    ///
    /// Fails when the subset contains a cycle.
    pub fn resolve_order(&self, agents: &[Id]) -> Result<Vec<Id>, Vec<Id>> {
        let in_set: HashSet<Id> = agents.iter().copied().collect();
        let cycles = self.detect_cycles(&in_set);
        if !cycles.is_empty() {
            return Err(cycles);
        }

        let mut order = Vec::with_capacity(agents.len());
        let mut visited = HashSet::new();

        // Sorted roots keep the order stable across runs.
        let mut sorted = agents.to_vec();
        sorted.sort();

        fn visit<Id>(
            agent: Id,
            forward: &HashMap<Id, HashSet<Id>>,
            in_set: &HashSet<Id>,
            visited: &mut HashSet<Id>,
            order: &mut Vec<Id>,
        ) where
            Id: Copy + Eq + std::hash::Hash + Ord,
        {
            if !visited.insert(agent) {
                return;
            }
            if let Some(deps) = forward.get(&agent) {
                let mut deps: Vec<Id> = deps.intersection(in_set).copied().collect();
                deps.sort();
                for dep in deps {
                    visit(dep, forward, in_set, visited, order);
                }
            }
            order.push(agent);
        }

        for agent in sorted {
            visit(agent, &self.forward, &in_set, &mut visited, &mut order);
        }
        Ok(order)
    }

    /// Agents within `in_set` that participate in a dependency cycle, sorted.
    pub fn detect_cycles(&self, in_set: &HashSet<Id>) -> Vec<Id> {
        let mut visiting = HashSet::new();
        let mut visited = HashSet::new();
        let mut cyclic = Vec::new();

        fn dfs<Id>(
            agent: Id,
            forward: &HashMap<Id, HashSet<Id>>,
            in_set: &HashSet<Id>,
            visiting: &mut HashSet<Id>,
            visited: &mut HashSet<Id>,
            cyclic: &mut Vec<Id>,
        ) where
            Id: Copy + Eq + std::hash::Hash + Ord,
        {
            if visited.contains(&agent) {
                return;
            }
            if !visiting.insert(agent) {
                cyclic.push(agent);
                return;
            }
            if let Some(deps) = forward.get(&agent) {
                for dep in deps {
                    if in_set.contains(dep) {
                        dfs(*dep, forward, in_set, visiting, visited, cyclic);
                    }
                }
            }
            visiting.remove(&agent);
            visited.insert(agent);
        }

        for agent in in_set {
            dfs(
                *agent,
                &self.forward,
                in_set,
                &mut visiting,
                &mut visited,
                &mut cyclic,
            );
        }
        cyclic.sort();
        cyclic.dedup();
        cyclic
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_order_respects_dependencies() {
        let mut graph: DependencyGraph<u32> = DependencyGraph::new();
        graph.add_dependency(3, 2);
        graph.add_dependency(2, 1);

        let order = graph.resolve_order(&[3, 2, 1]).unwrap();
        assert_eq!(order, vec![1, 2, 3]);
    }

    #[test]
    fn resolve_order_is_deterministic_for_independent_agents() {
        let mut graph: DependencyGraph<u32> = DependencyGraph::new();
        for id in [5, 3, 9, 1] {
            graph.add_agent(id);
        }
        let order = graph.resolve_order(&[5, 3, 9, 1]).unwrap();
        assert_eq!(order, vec![1, 3, 5, 9]);
    }

    #[test]
    fn cycles_are_reported() {
        let mut graph: DependencyGraph<u32> = DependencyGraph::new();
        graph.add_dependency(1, 2);
        graph.add_dependency(2, 1);
        assert!(graph.resolve_order(&[1, 2]).is_err());
        let set: HashSet<u32> = [1, 2].into_iter().collect();
        assert!(!graph.detect_cycles(&set).is_empty());
    }

    #[test]
    fn termination_blocked_by_active_dependents() {
        let mut graph: DependencyGraph<u32> = DependencyGraph::new();
        graph.add_dependency(2, 1);

        let active: HashSet<u32> = [1, 2].into_iter().collect();
        assert_eq!(graph.can_terminate(1, &active), Err(vec![2]));
        // Once the dependent is no longer active, termination is fine.
        let active: HashSet<u32> = [1].into_iter().collect();
        assert_eq!(graph.can_terminate(1, &active), Ok(()));
        // Agents with no dependents are always terminable.
        assert_eq!(graph.can_terminate(2, &active), Ok(()));
    }

    #[test]
    fn remove_agent_clears_edges() {
        let mut graph: DependencyGraph<u32> = DependencyGraph::new();
        graph.add_dependency(2, 1);
        graph.remove_agent(2);

        let active: HashSet<u32> = [1].into_iter().collect();
        assert_eq!(graph.can_terminate(1, &active), Ok(()));
        assert!(graph.dependencies_of(2).is_empty());
    }
}
