//! Placement policies: where each node goes in `node_modules`.

use anyhow::Result;
use clap::ValueEnum;
use std::collections::{BTreeMap, HashSet, VecDeque};

use super::{DependencyGraph, NodeId};
use crate::error::InstallError;

// a chain this deep means nesting is not converging
const MAX_NESTING: usize = 64;

/// A directory level of `node_modules`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlacementTree {
    pub entries: BTreeMap<String, PlacedEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlacedEntry {
    pub node: NodeId,
    /// The entry's own `node_modules`.
    pub nested: PlacementTree,
}

impl PlacementTree {
    fn level(&self, location: &[String]) -> Option<&PlacementTree> {
        let mut tree = self;
        for key in location {
            tree = &tree.entries.get(key)?.nested;
        }
        Some(tree)
    }

    fn level_mut(&mut self, location: &[String]) -> Option<&mut PlacementTree> {
        let mut tree = self;
        for key in location {
            tree = &mut tree.entries.get_mut(key)?.nested;
        }
        Some(tree)
    }

    /// Installed packages, counting nested ones.
    pub fn count(&self) -> usize {
        self.entries
            .values()
            .map(|entry| 1 + entry.nested.count())
            .sum()
    }
}

pub trait Placement: Send + Sync {
    fn place(&self, graph: &DependencyGraph) -> Result<PlacementTree>;
}

fn conflict(graph: &DependencyGraph, key: &str, existing: NodeId, incoming: NodeId) -> anyhow::Error {
    InstallError::VersionConflict {
        name: key.to_string(),
        chain: vec![graph.node(existing).describe(), graph.node(incoming).describe()],
    }
    .into()
}

/// Everything at the top level; a second package under one key is a conflict.
#[derive(Debug, Clone, Copy, Default)]
pub struct Flatten;

impl Placement for Flatten {
    fn place(&self, graph: &DependencyGraph) -> Result<PlacementTree> {
        let mut tree = PlacementTree::default();
        let mut visited = HashSet::from([DependencyGraph::ROOT]);
        let mut queue = VecDeque::from([DependencyGraph::ROOT]);

        while let Some(id) = queue.pop_front() {
            for (key, &child) in &graph.node(id).children {
                match tree.entries.get(key) {
                    Some(entry) if entry.node == child => {}
                    Some(entry) => return Err(conflict(graph, key, entry.node, child)),
                    None => {
                        tree.entries.insert(
                            key.clone(),
                            PlacedEntry {
                                node: child,
                                nested: PlacementTree::default(),
                            },
                        );
                    }
                }
                if visited.insert(child) {
                    queue.push_back(child);
                }
            }
        }

        Ok(tree)
    }
}

/// Hoists packages to the top level when the key is free there, and nests
/// them under their dependent otherwise.
///
/// A dependency is looked up from the dependent's own directory upwards, the
/// way node resolves `require`. If the first level holding the key holds the
/// same node it is reused; if it holds a different one, the dependency is
/// nested in the dependent's `node_modules`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Hoist;

impl Placement for Hoist {
    fn place(&self, graph: &DependencyGraph) -> Result<PlacementTree> {
        let mut tree = PlacementTree::default();
        let mut queue: VecDeque<(NodeId, Vec<String>)> =
            VecDeque::from([(DependencyGraph::ROOT, Vec::new())]);

        while let Some((id, location)) = queue.pop_front() {
            for (key, &child) in &graph.node(id).children {
                let target = match lookup(&tree, &location, key) {
                    Some((_, found)) if found == child => continue,
                    Some((depth, found)) if depth == location.len() => {
                        return Err(conflict(graph, key, found, child));
                    }
                    Some(_) => location.clone(),
                    None => Vec::new(),
                };

                if target.len() >= MAX_NESTING {
                    return Err(conflict(graph, key, id, child));
                }

                let Some(level) = tree.level_mut(&target) else {
                    continue;
                };
                level.entries.insert(
                    key.clone(),
                    PlacedEntry {
                        node: child,
                        nested: PlacementTree::default(),
                    },
                );

                let mut child_location = target;
                child_location.push(key.clone());
                queue.push_back((child, child_location));
            }
        }

        Ok(tree)
    }
}

/// Nearest level at or above `location` holding `key`, as (depth, node).
fn lookup(tree: &PlacementTree, location: &[String], key: &str) -> Option<(usize, NodeId)> {
    (0..=location.len()).rev().find_map(|depth| {
        tree.level(&location[..depth])?
            .entries
            .get(key)
            .map(|entry| (depth, entry.node))
    })
}

/// Selects a placement strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum PlacementPolicy {
    /// One copy per name at the top level
    Flatten,
    /// Hoist where possible, nest on conflict
    #[default]
    Nest,
}

impl PlacementPolicy {
    pub fn strategy(&self) -> Box<dyn Placement> {
        match self {
            PlacementPolicy::Flatten => Box::new(Flatten),
            PlacementPolicy::Nest => Box::new(Hoist),
        }
    }
}
