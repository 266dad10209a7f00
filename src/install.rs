use anyhow::{Context, Result};
use futures_util::stream::{self, StreamExt, TryStreamExt};
use log::info;
use std::path::Path;
use std::sync::Arc;

use crate::archive::unpack_tar_gz;
use crate::config::InstallConfig;
use crate::graph::{GraphIntegrator, PackageSource, Placement};
use crate::layout::{InstalledLayout, LayoutWriter, RegistryContents};
use crate::manifest::PackageManifest;
use crate::registry::{NpmRegistry, RegistryResolver};
use crate::remote::{GitCliRemote, GitHubRemote, RemoteRepository, RemoteRouter};
use crate::runtime::Runtime;
use crate::store::{DiskStore, TreeStore};

/// Installs a project's dependencies.
#[tracing::instrument(skip(runtime, config))]
pub async fn install<R: Runtime + Clone + 'static>(
    runtime: R,
    config: InstallConfig,
    project: &Path,
) -> Result<InstalledLayout> {
    let root = PackageManifest::load_root(&runtime, project)?;

    let remotes = Arc::new(RemoteRouter::new(
        GitHubRemote::new(config.github_client()?, &config.api_url),
        GitCliRemote::new(runtime.clone(), config.mirrors_dir()),
    ));
    let store = Arc::new(DiskStore::new(runtime.clone(), config.trees_dir()));
    let registry = Arc::new(NpmRegistry::new(
        config.registry_client()?,
        &config.registry_url,
    ));

    let installer = Installer::new(
        GraphIntegrator::new(
            remotes,
            store,
            Arc::clone(&registry),
            config.retry,
            config.concurrency,
        ),
        registry,
        config.placement.strategy(),
        LayoutWriter::new(runtime),
        config.concurrency,
    );
    installer.install(&root, project).await
}

/// Reads back what is installed in `project`.
#[tracing::instrument(skip(runtime))]
pub fn layout<R: Runtime>(runtime: R, project: &Path) -> Result<InstalledLayout> {
    LayoutWriter::new(runtime).crawl(project)
}

pub struct Installer<R, S, G, W>
where
    R: RemoteRepository + ?Sized,
    S: TreeStore + ?Sized,
    G: RegistryResolver + ?Sized,
    W: Runtime,
{
    integrator: GraphIntegrator<R, S, G>,
    registry: Arc<G>,
    placement: Box<dyn Placement>,
    writer: LayoutWriter<W>,
    concurrency: usize,
}

impl<R, S, G, W> Installer<R, S, G, W>
where
    R: RemoteRepository + ?Sized,
    S: TreeStore + ?Sized,
    G: RegistryResolver + ?Sized,
    W: Runtime,
{
    pub fn new(
        integrator: GraphIntegrator<R, S, G>,
        registry: Arc<G>,
        placement: Box<dyn Placement>,
        writer: LayoutWriter<W>,
        concurrency: usize,
    ) -> Self {
        Self {
            integrator,
            registry,
            placement,
            writer,
            concurrency: concurrency.max(1),
        }
    }

    /// Resolves the whole graph and downloads everything before touching
    /// `destination`, so a failed run leaves the previous install in place.
    #[tracing::instrument(skip(self, root), fields(root = %root.name))]
    pub async fn install(
        &self,
        root: &PackageManifest,
        destination: &Path,
    ) -> Result<InstalledLayout> {
        let graph = self.integrator.integrate(root).await?;
        let tree = self.placement.place(&graph)?;

        let downloads = graph.nodes().filter_map(|(id, node)| match &node.source {
            PackageSource::Registry(package) => Some((id, package)),
            _ => None,
        });
        let contents: Vec<_> = stream::iter(downloads.map(|(id, package)| async move {
            let bytes = self.registry.fetch_tarball(package).await?;
            let files = unpack_tar_gz(&bytes).with_context(|| {
                format!("Failed to unpack {}@{}", package.name, package.version)
            })?;
            Ok::<_, anyhow::Error>((id, files))
        }))
        .buffered(self.concurrency)
        .try_collect()
        .await?;
        let contents: RegistryContents = contents.into_iter().collect();

        info!("Writing layout for {} packages...", tree.count());
        self.writer.write(&graph, &tree, &contents, destination)
    }
}
