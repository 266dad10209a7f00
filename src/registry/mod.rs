//! Registry resolution for ordinary version-range dependencies.

mod npm;

use anyhow::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;

use crate::specifier::Specifier;

pub use npm::{DEFAULT_REGISTRY_URL, NpmRegistry, npm_range_to_req};

/// One concrete version picked from the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryPackage {
    pub name: String,
    pub version: String,
    pub tarball: String,
    pub dependencies: BTreeMap<String, Specifier>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RegistryResolver: Send + Sync {
    /// Picks the version of `name` that `range` selects.
    async fn resolve(&self, name: &str, range: &str) -> Result<RegistryPackage>;

    /// Downloads the package's gzip tarball.
    async fn fetch_tarball(&self, package: &RegistryPackage) -> Result<Vec<u8>>;
}
