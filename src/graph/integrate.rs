use anyhow::{Context, Result};
use futures_util::stream::{self, StreamExt, TryStreamExt};
use log::{debug, info, warn};
use std::collections::BTreeMap;
use std::sync::Arc;

use super::{DependencyGraph, DependencyNode, NodeId, NodeKey, PackageSource};
use crate::error::InstallError;
use crate::fetch::SourceFetcher;
use crate::http::RetryPolicy;
use crate::manifest::PackageManifest;
use crate::registry::RegistryResolver;
use crate::remote::RemoteRepository;
use crate::resolve::RefResolver;
use crate::specifier::Specifier;
use crate::store::TreeStore;

/// One declared dependency waiting to be resolved.
struct Edge {
    parent: NodeId,
    /// Nodes from the root down to `parent`.
    path: Arc<Vec<NodeId>>,
    key: String,
    specifier: Specifier,
}

/// Builds the dependency graph from a root manifest.
///
/// The traversal is breadth first. Every edge of a level is resolved through a
/// bounded pool whose output keeps input order, and results are applied in
/// that order, so the graph is the same for any concurrency.
pub struct GraphIntegrator<R, S, G>
where
    R: RemoteRepository + ?Sized,
    S: TreeStore + ?Sized,
    G: RegistryResolver + ?Sized,
{
    resolver: RefResolver<R>,
    fetcher: SourceFetcher<R, S>,
    registry: Arc<G>,
    concurrency: usize,
}

impl<R, S, G> GraphIntegrator<R, S, G>
where
    R: RemoteRepository + ?Sized,
    S: TreeStore + ?Sized,
    G: RegistryResolver + ?Sized,
{
    pub fn new(
        remotes: Arc<R>,
        store: Arc<S>,
        registry: Arc<G>,
        policy: RetryPolicy,
        concurrency: usize,
    ) -> Self {
        Self {
            resolver: RefResolver::new(Arc::clone(&remotes)),
            fetcher: SourceFetcher::new(remotes, store, policy),
            registry,
            concurrency: concurrency.max(1),
        }
    }

    #[tracing::instrument(skip(self, root), fields(root = %root.name))]
    pub async fn integrate(&self, root: &PackageManifest) -> Result<DependencyGraph> {
        let mut graph = DependencyGraph::new(&root.name, &root.version, root.dependencies.clone());
        let mut frontier = vec![(DependencyGraph::ROOT, Arc::new(vec![DependencyGraph::ROOT]))];
        let mut level = 0;

        while !frontier.is_empty() {
            let edges: Vec<Edge> = frontier
                .iter()
                .flat_map(|(id, path)| {
                    graph.node(*id).declared.iter().map(move |(key, specifier)| Edge {
                        parent: *id,
                        path: Arc::clone(path),
                        key: key.clone(),
                        specifier: specifier.clone(),
                    })
                })
                .collect();
            debug!("Level {}: resolving {} dependencies", level, edges.len());

            let resolved: Vec<DependencyNode> = stream::iter(
                edges
                    .iter()
                    .map(|edge| self.resolve_dependency(&edge.key, &edge.specifier)),
            )
            .buffered(self.concurrency)
            .try_collect()
            .await?;

            let mut next = Vec::new();
            for (edge, node) in edges.iter().zip(resolved) {
                if let Some(child) = self.link(&mut graph, edge, node)? {
                    let mut path = edge.path.as_ref().clone();
                    path.push(child);
                    next.push((child, Arc::new(path)));
                }
            }

            frontier = next;
            level += 1;
        }

        info!("Resolved {} packages", graph.len() - 1);
        Ok(graph)
    }

    /// Attaches a resolved dependency. Returns the node id when it is new and
    /// still needs its own dependencies expanded.
    fn link(
        &self,
        graph: &mut DependencyGraph,
        edge: &Edge,
        node: DependencyNode,
    ) -> Result<Option<NodeId>> {
        // revisiting an ancestor with the same identity closes a benign cycle
        if let Some(&ancestor) = edge.path.iter().find(|id| graph.node(**id).key == node.key) {
            graph.add_edge(edge.parent, &edge.key, ancestor);
            return Ok(None);
        }

        if edge
            .path
            .iter()
            .any(|id| graph.node(*id).key.name == node.key.name)
        {
            let mut chain: Vec<String> = edge.path.iter().map(|id| graph.node(*id).describe()).collect();
            chain.push(node.describe());
            return Err(InstallError::DependencyCycle { chain }.into());
        }

        if let Some(existing) = graph.find(&node.key) {
            graph.add_edge(edge.parent, &edge.key, existing);
            return Ok(None);
        }

        let id = graph.insert(node);
        graph.add_edge(edge.parent, &edge.key, id);
        Ok(Some(id))
    }

    async fn resolve_dependency(&self, key: &str, specifier: &Specifier) -> Result<DependencyNode> {
        let mut node = match specifier {
            Specifier::Registry { range } => {
                let package = self
                    .registry
                    .resolve(key, range)
                    .await
                    .with_context(|| format!("Failed to resolve {}@{}", key, range))?;
                DependencyNode {
                    key: NodeKey {
                        name: package.name.clone(),
                        version: package.version.clone(),
                        source_id: String::new(),
                    },
                    origin: Some(specifier.clone()),
                    declared: package.dependencies.clone(),
                    source: PackageSource::Registry(package),
                    children: BTreeMap::new(),
                }
            }
            Specifier::GitHub { .. } | Specifier::GitUrl { .. } => {
                let revision = self.resolver.resolve(specifier).await?;
                let tree = self.fetcher.fetch(&revision).await?;
                let manifest = PackageManifest::load(&tree, &specifier.to_string())?;
                if manifest.name != key {
                    warn!(
                        "{} is installed as '{}' but its manifest names it '{}'",
                        specifier, key, manifest.name
                    );
                }
                DependencyNode {
                    key: NodeKey {
                        name: manifest.name,
                        version: manifest.version,
                        source_id: String::new(),
                    },
                    origin: Some(specifier.clone()),
                    declared: manifest.dependencies,
                    source: PackageSource::Git { revision, tree },
                    children: BTreeMap::new(),
                }
            }
        };
        node.key.source_id = node.source.source_id();
        Ok(node)
    }
}
