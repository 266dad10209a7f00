//! Dependency specifier grammar.
//!
//! A dependency value in `package.json` is one of:
//!
//! - `owner/repo` or `owner/repo#ref` (GitHub shorthand)
//! - `git://host/path.git[#ref]` or `git+{http,https,ssh}://host/path.git[#ref]`
//! - anything else that reads as an npm version range or dist-tag
//!
//! Grammars are tried in that order and the first match wins.

use anyhow::Result;
use std::fmt;
use std::str::FromStr;

use crate::error::InstallError;

/// Pointer to a revision on a remote.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RefToken {
    /// Use the remote's default branch.
    Unspecified,
    Branch(String),
    /// Lowercase hex, 6, 9 or 40 characters long.
    CommitId(String),
}

impl RefToken {
    /// Classifies the text after `#`.
    pub fn classify(raw: &str) -> Self {
        if is_commit_id(raw) {
            RefToken::CommitId(raw.to_string())
        } else {
            RefToken::Branch(raw.to_string())
        }
    }

    /// True for a full 40 character commit id.
    pub fn is_full_commit(&self) -> bool {
        matches!(self, RefToken::CommitId(id) if id.len() == FULL_COMMIT_LEN)
    }
}

impl fmt::Display for RefToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RefToken::Unspecified => write!(f, "HEAD"),
            RefToken::Branch(name) => write!(f, "{}", name),
            RefToken::CommitId(id) => write!(f, "{}", id),
        }
    }
}

pub const FULL_COMMIT_LEN: usize = 40;
const PREFIX_LENS: [usize; 2] = [6, 9];

/// True when `s` is a lowercase hex commit id of an accepted length.
pub fn is_commit_id(s: &str) -> bool {
    (s.len() == FULL_COMMIT_LEN || PREFIX_LENS.contains(&s.len()))
        && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Transport prefix of an explicit git URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum GitScheme {
    Git,
    GitHttp,
    GitHttps,
    GitSsh,
}

impl GitScheme {
    const ALL: [GitScheme; 4] = [
        GitScheme::Git,
        GitScheme::GitHttp,
        GitScheme::GitHttps,
        GitScheme::GitSsh,
    ];

    /// Prefix as written in a dependency value.
    pub fn prefix(&self) -> &'static str {
        match self {
            GitScheme::Git => "git://",
            GitScheme::GitHttp => "git+http://",
            GitScheme::GitHttps => "git+https://",
            GitScheme::GitSsh => "git+ssh://",
        }
    }

    /// Scheme the git transport actually speaks.
    pub fn transport(&self) -> &'static str {
        match self {
            GitScheme::Git => "git",
            GitScheme::GitHttp => "http",
            GitScheme::GitHttps => "https",
            GitScheme::GitSsh => "ssh",
        }
    }
}

/// A parsed dependency value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Specifier {
    Registry {
        range: String,
    },
    GitHub {
        owner: String,
        repo: String,
        reference: RefToken,
    },
    GitUrl {
        scheme: GitScheme,
        host: String,
        /// Repository path without the trailing `.git`.
        path: String,
        reference: RefToken,
    },
}

impl Specifier {
    pub fn is_git(&self) -> bool {
        !matches!(self, Specifier::Registry { .. })
    }

    /// The ref token of a git specifier.
    pub fn reference(&self) -> Option<&RefToken> {
        match self {
            Specifier::Registry { .. } => None,
            Specifier::GitHub { reference, .. } | Specifier::GitUrl { reference, .. } => {
                Some(reference)
            }
        }
    }
}

impl fmt::Display for Specifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Specifier::Registry { range } => write!(f, "{}", range)?,
            Specifier::GitHub { owner, repo, .. } => write!(f, "{}/{}", owner, repo)?,
            Specifier::GitUrl {
                scheme, host, path, ..
            } => write!(f, "{}{}/{}.git", scheme.prefix(), host, path)?,
        }
        match self.reference() {
            Some(RefToken::Unspecified) | None => Ok(()),
            Some(reference) => write!(f, "#{}", reference),
        }
    }
}

impl FromStr for Specifier {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse(s)
    }
}

/// Parses a raw dependency value.
pub fn parse(raw: &str) -> Result<Specifier> {
    let (body, fragment) = match raw.split_once('#') {
        Some((body, fragment)) => {
            if fragment.is_empty() {
                return Err(InstallError::malformed(raw, "ref after '#' cannot be empty").into());
            }
            (body, Some(fragment))
        }
        None => (raw, None),
    };
    let reference = fragment.map_or(RefToken::Unspecified, RefToken::classify);

    if let Some((owner, repo)) = parse_shorthand(body) {
        return Ok(Specifier::GitHub {
            owner: owner.to_string(),
            repo: repo.to_string(),
            reference,
        });
    }

    if let Some(scheme) = GitScheme::ALL.iter().find(|s| body.starts_with(s.prefix())) {
        let rest = &body[scheme.prefix().len()..];
        let (host, path) = rest
            .split_once('/')
            .filter(|(host, _)| !host.is_empty())
            .ok_or_else(|| InstallError::malformed(raw, "git URL has no host"))?;
        let path = path
            .strip_suffix(".git")
            .filter(|p| !p.is_empty())
            .ok_or_else(|| InstallError::malformed(raw, "git URL path must end with '.git'"))?;
        return Ok(Specifier::GitUrl {
            scheme: *scheme,
            host: host.to_string(),
            path: path.to_string(),
            reference,
        });
    }

    if body.contains("://") {
        return Err(InstallError::malformed(raw, "unsupported URL scheme").into());
    }
    if fragment.is_some() {
        return Err(InstallError::malformed(raw, "only git sources accept a '#ref'").into());
    }
    if !looks_like_range(body) {
        return Err(InstallError::malformed(raw, "not a version range, tag or git source").into());
    }
    Ok(Specifier::Registry {
        range: body.to_string(),
    })
}

fn parse_shorthand(body: &str) -> Option<(&str, &str)> {
    if body.contains(':') {
        return None;
    }
    let (owner, repo) = body.split_once('/')?;
    let valid = |part: &str| {
        !part.is_empty()
            && !part.starts_with('.')
            && part
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    };
    (valid(owner) && valid(repo)).then_some((owner, repo))
}

fn looks_like_range(s: &str) -> bool {
    s.chars().all(|c| {
        c.is_ascii_alphanumeric()
            || matches!(c, '.' | '*' | '^' | '~' | '<' | '>' | '=' | '|' | '-' | '+' | ' ' | '_')
    })
}
