//! Writes the placement tree to `node_modules` and reads it back.

use anyhow::{Context, Result, anyhow};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Component, Path, PathBuf};
use uuid::Uuid;

use crate::archive::FileMap;
use crate::cleanup::StagingGuard;
use crate::graph::{DependencyGraph, NodeId, PackageSource, PlacementTree};
use crate::manifest::MANIFEST_FILE;
use crate::runtime::Runtime;

pub const MODULES_DIR: &str = "node_modules";
pub const LAYOUT_FILE: &str = ".gitdeps-layout.json";

/// What ended up where, keyed by install name.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct InstalledLayout {
    pub dependencies: BTreeMap<String, InstalledPackage>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct InstalledPackage {
    pub name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub dependencies: BTreeMap<String, InstalledPackage>,
}

impl InstalledLayout {
    pub fn from_placement(graph: &DependencyGraph, tree: &PlacementTree) -> Self {
        Self {
            dependencies: packages(graph, tree),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        let mut json = serde_json::to_string_pretty(self).context("Failed to serialize layout")?;
        json.push('\n');
        Ok(json)
    }
}

fn packages(graph: &DependencyGraph, tree: &PlacementTree) -> BTreeMap<String, InstalledPackage> {
    tree.entries
        .iter()
        .map(|(key, entry)| {
            let node = graph.node(entry.node);
            let package = InstalledPackage {
                name: node.name().to_string(),
                version: node.version().to_string(),
                dependencies: packages(graph, &entry.nested),
            };
            (key.clone(), package)
        })
        .collect()
}

/// Package contents that are not part of the graph itself.
pub type RegistryContents = HashMap<NodeId, FileMap>;

pub struct LayoutWriter<R: Runtime> {
    runtime: R,
}

impl<R: Runtime> LayoutWriter<R> {
    pub fn new(runtime: R) -> Self {
        Self { runtime }
    }

    /// Installs every placed package under `<project>/node_modules`.
    ///
    /// Every top-level entry is built in a staging directory first. The
    /// entries are then swapped in by rename, replacing earlier content under
    /// their keys only. If any swap or the layout file fails, the entries
    /// already swapped are put back the way they were.
    #[tracing::instrument(skip(self, graph, tree, registry))]
    pub fn write(
        &self,
        graph: &DependencyGraph,
        tree: &PlacementTree,
        registry: &RegistryContents,
        project: &Path,
    ) -> Result<InstalledLayout> {
        let modules = project.join(MODULES_DIR);
        self.runtime.create_dir_all(&modules)?;

        let mut staged = Vec::with_capacity(tree.entries.len());
        for (key, entry) in &tree.entries {
            let target = entry_path(&modules, key)?;
            let staging = StagingGuard::new(
                &self.runtime,
                modules.join(format!(".staging-{}", Uuid::new_v4())),
            );
            self.write_package(graph, entry.node, &entry.nested, registry, staging.path())
                .with_context(|| format!("Failed to stage {}", key))?;
            staged.push((key, staging, target));
        }

        let mut swapped = Vec::with_capacity(staged.len());
        for (key, staging, target) in staged {
            match self.swap_in(staging, &target) {
                Ok(retired) => {
                    debug!("Installed {}", key);
                    swapped.push((target, retired));
                }
                Err(e) => {
                    self.roll_back(&swapped);
                    return Err(e.context(format!("Failed to install {}", key)));
                }
            }
        }

        let layout = InstalledLayout::from_placement(graph, tree);
        if let Err(e) = self.write_layout_file(&modules, &layout) {
            self.roll_back(&swapped);
            return Err(e);
        }

        for retired in swapped.iter().filter_map(|(_, retired)| retired.as_ref()) {
            if let Err(e) = self.runtime.remove_dir_all(retired) {
                warn!("Failed to remove {:?}: {}", retired, e);
            }
        }
        info!("Installed {} packages into {:?}", tree.count(), modules);
        Ok(layout)
    }

    fn write_package(
        &self,
        graph: &DependencyGraph,
        id: NodeId,
        nested: &PlacementTree,
        registry: &RegistryContents,
        dir: &Path,
    ) -> Result<()> {
        let node = graph.node(id);
        let files = match &node.source {
            PackageSource::Git { tree, .. } => &tree.files,
            PackageSource::Registry(_) => registry
                .get(&id)
                .ok_or_else(|| anyhow!("No contents downloaded for {}", node.describe()))?,
            PackageSource::Root => return Err(anyhow!("The root package cannot be installed")),
        };

        self.runtime.create_dir_all(dir)?;
        for (relative, contents) in files {
            let target = dir.join(relative);
            if let Some(parent) = target.parent() {
                self.runtime.create_dir_all(parent)?;
            }
            self.runtime.write(&target, contents)?;
        }

        for (key, entry) in &nested.entries {
            let target = entry_path(&dir.join(MODULES_DIR), key)?;
            self.write_package(graph, entry.node, &entry.nested, registry, &target)?;
        }
        Ok(())
    }

    /// Renames the staged entry onto `target`. Returns where the previous
    /// content was moved, which the caller removes once the whole write
    /// has succeeded.
    fn swap_in(&self, staging: StagingGuard<'_, R>, target: &Path) -> Result<Option<PathBuf>> {
        if let Some(parent) = target.parent() {
            self.runtime.create_dir_all(parent)?;
        }

        let retired = if self.runtime.exists(target) {
            let retired = staging.path().with_file_name(format!(".retired-{}", Uuid::new_v4()));
            self.runtime.rename(target, &retired)?;
            Some(retired)
        } else {
            None
        };

        if let Err(e) = self.runtime.rename(staging.path(), target) {
            if let Some(retired) = &retired {
                if let Err(restore) = self.runtime.rename(retired, target) {
                    warn!("Failed to restore {:?}: {}", target, restore);
                }
            }
            return Err(e);
        }
        staging.success();
        Ok(retired)
    }

    /// Undoes completed swaps, newest first.
    fn roll_back(&self, swapped: &[(PathBuf, Option<PathBuf>)]) {
        for (target, retired) in swapped.iter().rev() {
            if let Err(e) = self.runtime.remove_dir_all(target) {
                warn!("Failed to remove {:?} during rollback: {}", target, e);
                continue;
            }
            if let Some(retired) = retired {
                if let Err(e) = self.runtime.rename(retired, target) {
                    warn!("Failed to restore {:?} from {:?}: {}", target, retired, e);
                }
            }
        }
    }

    fn write_layout_file(&self, modules: &Path, layout: &InstalledLayout) -> Result<()> {
        let path = modules.join(LAYOUT_FILE);
        let staging = StagingGuard::new(
            &self.runtime,
            modules.join(format!("{}.{}.tmp", LAYOUT_FILE, Uuid::new_v4())),
        );
        self.runtime
            .write(staging.path(), layout.to_json()?.as_bytes())?;
        self.runtime.rename(staging.path(), &path)?;
        staging.success();
        Ok(())
    }

    /// Rebuilds the layout from the `package.json` files on disk.
    #[tracing::instrument(skip(self))]
    pub fn crawl(&self, project: &Path) -> Result<InstalledLayout> {
        Ok(InstalledLayout {
            dependencies: self.crawl_modules(&project.join(MODULES_DIR))?,
        })
    }

    fn crawl_modules(&self, modules: &Path) -> Result<BTreeMap<String, InstalledPackage>> {
        let mut packages = BTreeMap::new();
        if !self.runtime.is_dir(modules) {
            return Ok(packages);
        }

        for dir in self.package_dirs(modules)? {
            let Some(key) = install_key(modules, &dir) else {
                continue;
            };
            if let Some(package) = self.crawl_package(&dir)? {
                packages.insert(key, package);
            }
        }
        Ok(packages)
    }

    /// Package directories directly under `modules`, looking inside `@scope` dirs.
    fn package_dirs(&self, modules: &Path) -> Result<Vec<PathBuf>> {
        let mut dirs = Vec::new();
        for entry in self.runtime.read_dir(modules)? {
            let name = file_name(&entry);
            if name.starts_with('.') || !self.runtime.is_dir(&entry) {
                continue;
            }
            if name.starts_with('@') {
                dirs.extend(
                    self.runtime
                        .read_dir(&entry)?
                        .into_iter()
                        .filter(|p| self.runtime.is_dir(p)),
                );
            } else {
                dirs.push(entry);
            }
        }
        Ok(dirs)
    }

    fn crawl_package(&self, dir: &Path) -> Result<Option<InstalledPackage>> {
        let manifest = dir.join(MANIFEST_FILE);
        if !self.runtime.exists(&manifest) {
            return Ok(None);
        }

        #[derive(Deserialize)]
        struct NameVersion {
            name: Option<String>,
            version: Option<String>,
        }

        let contents = self.runtime.read(&manifest)?;
        let parsed: NameVersion = serde_json::from_slice(&contents)
            .with_context(|| format!("Failed to parse {:?}", manifest))?;
        Ok(Some(InstalledPackage {
            name: parsed.name.unwrap_or_default(),
            version: parsed.version.unwrap_or_default(),
            dependencies: self.crawl_modules(&dir.join(MODULES_DIR))?,
        }))
    }
}

/// Joins an install key below `modules`, refusing keys that would leave it.
fn entry_path(modules: &Path, key: &str) -> Result<PathBuf> {
    let relative = Path::new(key);
    let plain = relative.components().count() > 0
        && relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
    if !plain || key.contains('\\') {
        return Err(anyhow!("Refusing to install under unsafe name '{}'", key));
    }
    Ok(modules.join(relative))
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn install_key(modules: &Path, dir: &Path) -> Option<String> {
    let relative = dir.strip_prefix(modules).ok()?;
    let parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Some(parts.join("/"))
}
