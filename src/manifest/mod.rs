//! `package.json` reading.

use anyhow::{Context, Result};
use log::debug;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

use crate::error::InstallError;
use crate::runtime::Runtime;
use crate::specifier::{Specifier, parse};
use crate::store::FetchedTree;

pub const MANIFEST_FILE: &str = "package.json";

const ROOT_NAME: &str = "root";
const ROOT_VERSION: &str = "0.0.0";

/// The parts of `package.json` the installer needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageManifest {
    pub name: String,
    pub version: String,
    /// Dependency key to parsed specifier, in key order.
    pub dependencies: BTreeMap<String, Specifier>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
struct RawManifest {
    name: Option<String>,
    version: Option<String>,
    #[serde(default)]
    dependencies: BTreeMap<String, String>,
    #[serde(default)]
    dev_dependencies: BTreeMap<String, String>,
}

impl PackageManifest {
    /// Parses a dependency's manifest. `name` and `version` are required.
    pub fn parse(contents: &[u8], origin: &str) -> Result<Self> {
        let raw = read_raw(contents, origin)?;
        let name = required(raw.name, "name", origin)?;
        let version = required(raw.version, "version", origin)?;
        let dependencies = parse_dependencies(&raw.dependencies, origin)?;
        Ok(Self {
            name,
            version,
            dependencies,
        })
    }

    /// Reads the manifest at the root of a fetched tree.
    #[tracing::instrument(skip(tree), fields(commit = %tree.commit))]
    pub fn load(tree: &FetchedTree, origin: &str) -> Result<Self> {
        let contents = tree
            .file(MANIFEST_FILE)
            .ok_or_else(|| InstallError::invalid_manifest(origin, "no package.json in tree"))?;
        let manifest = Self::parse(contents, origin)?;
        debug!(
            "Loaded {}@{} with {} dependencies",
            manifest.name,
            manifest.version,
            manifest.dependencies.len()
        );
        Ok(manifest)
    }

    /// Reads the project's own manifest.
    ///
    /// The root also installs `devDependencies` (`dependencies` wins on a
    /// clash), and a missing name or version gets a placeholder.
    #[tracing::instrument(skip(runtime))]
    pub fn load_root<R: Runtime>(runtime: &R, project: &Path) -> Result<Self> {
        let path = project.join(MANIFEST_FILE);
        let origin = path.display().to_string();
        let contents = runtime
            .read(&path)
            .with_context(|| format!("Failed to read {}", origin))?;
        let raw = read_raw(&contents, &origin)?;

        let mut declared = raw.dev_dependencies;
        declared.extend(raw.dependencies);

        Ok(Self {
            name: raw.name.unwrap_or_else(|| ROOT_NAME.to_string()),
            version: raw.version.unwrap_or_else(|| ROOT_VERSION.to_string()),
            dependencies: parse_dependencies(&declared, &origin)?,
        })
    }
}

fn read_raw(contents: &[u8], origin: &str) -> Result<RawManifest> {
    serde_json::from_slice(contents)
        .map_err(|e| InstallError::invalid_manifest(origin, e.to_string()).into())
}

fn required(value: Option<String>, field: &str, origin: &str) -> Result<String> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(InstallError::invalid_manifest(origin, format!("missing '{}'", field)).into()),
    }
}

/// True for `name` or `@scope/name`. Dependency keys become directory names
/// under `node_modules`, so each part must be a single plain path segment.
pub fn is_valid_package_name(key: &str) -> bool {
    let (scope, name) = match key.strip_prefix('@') {
        Some(scoped) => match scoped.split_once('/') {
            Some((scope, name)) => (Some(scope), name),
            None => return false,
        },
        None => (None, key),
    };
    let valid = |segment: &str| {
        !segment.is_empty()
            && !segment.starts_with('.')
            && segment
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '~'))
    };
    scope.is_none_or(valid) && valid(name)
}

fn parse_dependencies(
    raw: &BTreeMap<String, String>,
    origin: &str,
) -> Result<BTreeMap<String, Specifier>> {
    raw.iter()
        .map(|(key, value)| {
            if !is_valid_package_name(key) {
                return Err(InstallError::invalid_manifest(
                    origin,
                    format!("invalid dependency name '{}'", key),
                )
                .into());
            }
            let specifier = parse(value)
                .with_context(|| format!("Invalid dependency '{}' in {}", key, origin))?;
            Ok((key.clone(), specifier))
        })
        .collect()
}
