//! Failure taxonomy for an install run.
//!
//! Every variant aborts the whole run. Only transport failures are retried,
//! and by the time a [`InstallError::Fetch`] is raised the retry budget is spent.

/// Errors surfaced by the resolution and fetch engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallError {
    /// The dependency value matches none of the recognised grammars.
    MalformedSpecifier { input: String, reason: String },
    /// A branch name or commit id matches nothing on the remote.
    RefNotFound { specifier: String, reference: String },
    /// A commit id prefix matches more than one commit.
    AmbiguousRef {
        specifier: String,
        prefix: String,
        candidates: Vec<String>,
    },
    /// Transport failure after the retry budget was exhausted.
    Fetch {
        specifier: String,
        attempts: usize,
        message: String,
    },
    /// The fetched tree has no usable `package.json`.
    InvalidManifest { origin: String, reason: String },
    /// A dependency points back at an ancestor with an incompatible version.
    DependencyCycle { chain: Vec<String> },
    /// Two packages claim the same install slot and the placement policy cannot nest them.
    VersionConflict { name: String, chain: Vec<String> },
}

impl InstallError {
    pub fn malformed(input: &str, reason: impl Into<String>) -> Self {
        InstallError::MalformedSpecifier {
            input: input.to_string(),
            reason: reason.into(),
        }
    }

    pub fn invalid_manifest(origin: &str, reason: impl Into<String>) -> Self {
        InstallError::InvalidManifest {
            origin: origin.to_string(),
            reason: reason.into(),
        }
    }
}

impl std::fmt::Display for InstallError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstallError::MalformedSpecifier { input, reason } => {
                write!(f, "Malformed dependency specifier '{}': {}", input, reason)
            }
            InstallError::RefNotFound {
                specifier,
                reference,
            } => {
                write!(f, "Ref '{}' not found for {}", reference, specifier)
            }
            InstallError::AmbiguousRef {
                specifier,
                prefix,
                candidates,
            } => {
                write!(
                    f,
                    "Commit prefix '{}' is ambiguous for {}: matches {}",
                    prefix,
                    specifier,
                    candidates.join(", ")
                )
            }
            InstallError::Fetch {
                specifier,
                attempts,
                message,
            } => {
                write!(
                    f,
                    "Failed to fetch {} after {} attempt(s): {}",
                    specifier, attempts, message
                )
            }
            InstallError::InvalidManifest { origin, reason } => {
                write!(f, "Invalid manifest in {}: {}", origin, reason)
            }
            InstallError::DependencyCycle { chain } => {
                write!(f, "Dependency cycle: {}", chain.join(" -> "))
            }
            InstallError::VersionConflict { name, chain } => {
                write!(
                    f,
                    "Version conflict for '{}': {}",
                    name,
                    chain.join(" vs ")
                )
            }
        }
    }
}

impl std::error::Error for InstallError {}
