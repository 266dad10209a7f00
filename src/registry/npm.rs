//! npm registry client.

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use log::debug;
use semver::{Version, VersionReq};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use tokio::sync::OnceCell;

use super::{RegistryPackage, RegistryResolver};
use crate::error::InstallError;
use crate::http::{HttpClient, with_retry};
use crate::manifest::is_valid_package_name;
use crate::specifier::parse;

pub const DEFAULT_REGISTRY_URL: &str = "https://registry.npmjs.org";

/// Registry document types (internal).
mod api {
    use serde::Deserialize;
    use std::collections::BTreeMap;

    #[derive(Deserialize, Debug)]
    pub struct Packument {
        #[serde(rename = "dist-tags", default)]
        pub dist_tags: BTreeMap<String, String>,
        #[serde(default)]
        pub versions: BTreeMap<String, VersionDoc>,
    }

    #[derive(Deserialize, Debug, Clone)]
    pub struct VersionDoc {
        pub version: String,
        pub dist: Dist,
        #[serde(default)]
        pub dependencies: BTreeMap<String, String>,
    }

    #[derive(Deserialize, Debug, Clone)]
    pub struct Dist {
        pub tarball: String,
    }
}

pub struct NpmRegistry {
    http_client: HttpClient,
    registry_url: String,
    packuments: Mutex<HashMap<String, Arc<OnceCell<Arc<api::Packument>>>>>,
}

impl NpmRegistry {
    pub fn new(http_client: HttpClient, registry_url: &str) -> Self {
        Self {
            http_client,
            registry_url: registry_url.trim_end_matches('/').to_string(),
            packuments: Mutex::new(HashMap::new()),
        }
    }

    fn packument_url(&self, name: &str) -> String {
        // scoped names keep their `@` but escape the separator
        format!("{}/{}", self.registry_url, name.replace('/', "%2f"))
    }

    async fn packument(&self, name: &str) -> Result<Arc<api::Packument>> {
        let cell = {
            let mut packuments = self
                .packuments
                .lock()
                .map_err(|_| anyhow!("packument cache poisoned"))?;
            Arc::clone(packuments.entry(name.to_string()).or_default())
        };
        let packument = cell
            .get_or_try_init(|| async {
                let url = self.packument_url(name);
                let packument: api::Packument = self
                    .http_client
                    .get_json(&url)
                    .await
                    .with_context(|| format!("Failed to fetch registry metadata for {}", name))?;
                Ok::<_, anyhow::Error>(Arc::new(packument))
            })
            .await?;
        Ok(Arc::clone(packument))
    }
}

/// Picks the highest version matching `range`, or the version a dist-tag names.
fn select_version<'a>(packument: &'a api::Packument, range: &str) -> Result<Option<&'a api::VersionDoc>> {
    let range = range.trim();
    if let Some(tagged) = packument.dist_tags.get(range) {
        return Ok(packument.versions.get(tagged));
    }

    let reqs = npm_range_to_req(range)?;
    let best = packument
        .versions
        .values()
        .filter_map(|doc| Version::parse(&doc.version).ok().map(|v| (v, doc)))
        .filter(|(v, _)| reqs.iter().any(|req| req.matches(v)))
        .max_by(|(a, _), (b, _)| a.cmp(b))
        .map(|(_, doc)| doc);
    Ok(best)
}

#[async_trait]
impl RegistryResolver for NpmRegistry {
    #[tracing::instrument(skip(self))]
    async fn resolve(&self, name: &str, range: &str) -> Result<RegistryPackage> {
        let packument = self.packument(name).await?;
        let doc = select_version(&packument, range)?
            .ok_or_else(|| anyhow!("No version of {} matches '{}'", name, range))?;
        debug!("{}@{} selected {}", name, range, doc.version);

        let dependencies = doc
            .dependencies
            .iter()
            .map(|(key, value)| {
                if !is_valid_package_name(key) {
                    return Err(InstallError::invalid_manifest(
                        &format!("{}@{}", name, doc.version),
                        format!("invalid dependency name '{}'", key),
                    )
                    .into());
                }
                let specifier = parse(value).with_context(|| {
                    format!("Invalid dependency '{}' of {}@{}", key, name, doc.version)
                })?;
                Ok((key.clone(), specifier))
            })
            .collect::<Result<BTreeMap<_, _>>>()?;

        Ok(RegistryPackage {
            name: name.to_string(),
            version: doc.version.clone(),
            tarball: doc.dist.tarball.clone(),
            dependencies,
        })
    }

    #[tracing::instrument(skip(self), fields(package = %package.name, version = %package.version))]
    async fn fetch_tarball(&self, package: &RegistryPackage) -> Result<Vec<u8>> {
        let operation = format!("download {}@{}", package.name, package.version);
        with_retry(&operation, self.http_client.policy(), || {
            self.http_client.get_bytes(&package.tarball)
        })
        .await
        .map_err(|e| e.into_inner())
    }
}

/// Converts an npm range into `semver` requirements, one per `||` alternative.
pub fn npm_range_to_req(range: &str) -> Result<Vec<VersionReq>> {
    range
        .split("||")
        .map(|alternative| {
            let converted = convert_alternative(alternative.trim());
            VersionReq::parse(&converted)
                .with_context(|| format!("Unsupported version range '{}'", range))
        })
        .collect()
}

fn convert_alternative(alternative: &str) -> String {
    if alternative.is_empty() {
        return "*".to_string();
    }

    // `1.2.3 - 2.3.4` is inclusive on both ends
    if let Some((low, high)) = alternative.split_once(" - ") {
        return format!(">={}, <={}", convert_version(low.trim()), convert_version(high.trim()));
    }

    let mut comparators = Vec::new();
    let mut pending_op = String::new();
    for token in alternative.split_whitespace() {
        // `>= 1.0.0` splits the operator from its version
        if token.chars().all(|c| matches!(c, '<' | '>' | '=' | '^' | '~')) {
            pending_op.push_str(token);
            continue;
        }
        let token = format!("{}{}", std::mem::take(&mut pending_op), token);
        comparators.push(convert_comparator(&token));
    }

    if comparators.is_empty() {
        "*".to_string()
    } else {
        comparators.join(", ")
    }
}

fn convert_comparator(token: &str) -> String {
    let split = token
        .find(|c: char| !matches!(c, '<' | '>' | '=' | '^' | '~'))
        .unwrap_or(token.len());
    let (op, version) = token.split_at(split);
    let version = convert_version(version);

    if version == "*" {
        return version;
    }
    if op.is_empty() {
        // npm reads a bare version as exact, a partial one as a wildcard
        if version.contains('*') {
            version
        } else {
            format!("={}", version)
        }
    } else {
        format!("{}{}", op, version)
    }
}

fn convert_version(version: &str) -> String {
    let version = version.strip_prefix('v').unwrap_or(version);
    version
        .split('.')
        .map(|part| if matches!(part, "x" | "X" | "*") { "*" } else { part })
        .collect::<Vec<_>>()
        .join(".")
}
