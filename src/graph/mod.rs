//! Resolved dependency graph.
//!
//! Nodes live in an arena and refer to each other by index, so cycles in
//! the package graph never become ownership cycles.
//!
//! # Structure
//!
//! - `integrate` - Builds the graph from the root manifest
//! - `placement` - Decides where each node lands in `node_modules`

mod integrate;
mod placement;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::registry::RegistryPackage;
use crate::resolve::ResolvedRevision;
use crate::specifier::Specifier;
use crate::store::FetchedTree;

pub use integrate::GraphIntegrator;
pub use placement::{Flatten, Hoist, Placement, PlacementPolicy, PlacementTree, PlacedEntry};

pub type NodeId = usize;

const ROOT_SOURCE: &str = "root";
const REGISTRY_SOURCE: &str = "registry";

/// Node identity: two specifiers reaching the same key share one node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeKey {
    pub name: String,
    pub version: String,
    /// `root`, `registry` or `git:<remote>#<commit>`.
    pub source_id: String,
}

/// Where a node's contents come from.
#[derive(Debug, Clone)]
pub enum PackageSource {
    Root,
    Git {
        revision: ResolvedRevision,
        tree: Arc<FetchedTree>,
    },
    Registry(RegistryPackage),
}

impl PackageSource {
    pub fn source_id(&self) -> String {
        match self {
            PackageSource::Root => ROOT_SOURCE.to_string(),
            PackageSource::Git { revision, .. } => revision.source_id(),
            PackageSource::Registry(_) => REGISTRY_SOURCE.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DependencyNode {
    pub key: NodeKey,
    /// Specifier that first introduced the node; `None` for the root.
    pub origin: Option<Specifier>,
    pub source: PackageSource,
    /// Dependencies as declared by the package's manifest.
    pub declared: BTreeMap<String, Specifier>,
    /// Dependency key to resolved node.
    pub children: BTreeMap<String, NodeId>,
}

impl DependencyNode {
    pub fn name(&self) -> &str {
        &self.key.name
    }

    pub fn version(&self) -> &str {
        &self.key.version
    }

    /// Human readable origin for error chains.
    pub fn describe(&self) -> String {
        match &self.origin {
            Some(origin) => format!("{}@{} ({})", self.key.name, self.key.version, origin),
            None => format!("{}@{}", self.key.name, self.key.version),
        }
    }
}

/// Arena of nodes; node 0 is the root package.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    nodes: Vec<DependencyNode>,
    index: HashMap<NodeKey, NodeId>,
}

impl DependencyGraph {
    pub const ROOT: NodeId = 0;

    pub fn new(name: &str, version: &str, declared: BTreeMap<String, Specifier>) -> Self {
        let root = DependencyNode {
            key: NodeKey {
                name: name.to_string(),
                version: version.to_string(),
                source_id: ROOT_SOURCE.to_string(),
            },
            origin: None,
            source: PackageSource::Root,
            declared,
            children: BTreeMap::new(),
        };
        let mut graph = Self {
            nodes: Vec::new(),
            index: HashMap::new(),
        };
        graph.insert(root);
        graph
    }

    pub fn node(&self, id: NodeId) -> &DependencyNode {
        &self.nodes[id]
    }

    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &DependencyNode)> {
        self.nodes.iter().enumerate()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn find(&self, key: &NodeKey) -> Option<NodeId> {
        self.index.get(key).copied()
    }

    /// Adds `node`, or returns the id of the node already holding its key.
    pub fn insert(&mut self, node: DependencyNode) -> NodeId {
        if let Some(id) = self.find(&node.key) {
            return id;
        }
        let id = self.nodes.len();
        self.index.insert(node.key.clone(), id);
        self.nodes.push(node);
        id
    }

    pub fn add_edge(&mut self, parent: NodeId, dependency: &str, child: NodeId) {
        self.nodes[parent]
            .children
            .insert(dependency.to_string(), child);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Registry-sourced node for graph fixtures.
    pub(crate) fn registry_node(name: &str, version: &str) -> DependencyNode {
        DependencyNode {
            key: NodeKey {
                name: name.into(),
                version: version.into(),
                source_id: REGISTRY_SOURCE.into(),
            },
            origin: Some(Specifier::Registry {
                range: version.into(),
            }),
            source: PackageSource::Registry(RegistryPackage {
                name: name.into(),
                version: version.into(),
                tarball: format!("https://registry.test/{}-{}.tgz", name, version),
                dependencies: BTreeMap::new(),
            }),
            declared: BTreeMap::new(),
            children: BTreeMap::new(),
        }
    }

    #[test]
    fn test_insert_dedupes_by_key() {
        let mut graph = DependencyGraph::new("root", "0.0.0", BTreeMap::new());
        let a = graph.insert(registry_node("lodash", "4.24.0"));
        let b = graph.insert(registry_node("lodash", "4.24.0"));
        let c = graph.insert(registry_node("lodash", "4.17.21"));

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(graph.len(), 3);
        assert_eq!(graph.node(DependencyGraph::ROOT).name(), "root");
    }

    #[test]
    fn test_edges_and_describe() {
        let mut graph = DependencyGraph::new("root", "0.0.0", BTreeMap::new());
        let lodash = graph.insert(registry_node("lodash", "4.24.0"));
        graph.add_edge(DependencyGraph::ROOT, "lodash", lodash);

        assert_eq!(graph.node(DependencyGraph::ROOT).children["lodash"], lodash);
        assert_eq!(graph.node(lodash).describe(), "lodash@4.24.0 (4.24.0)");
        assert_eq!(graph.node(DependencyGraph::ROOT).describe(), "root@0.0.0");
    }
}
