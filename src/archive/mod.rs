//! Tarball unpacking for fetched trees and registry packages.
//!
//! GitHub tarballs wrap everything in `owner-repo-<sha>/`, npm tarballs in
//! `package/`, and `git archive` output is produced with a `package/` prefix.
//! The single leading component is stripped in all cases.

use anyhow::{Context, Result, anyhow};
use flate2::read::GzDecoder;
use log::debug;
use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Component, Path};
use tar::{Archive, EntryType};

/// Relative file path (with `/` separators) to file contents.
pub type FileMap = BTreeMap<String, Vec<u8>>;

/// Unpacks a gzip tarball into memory, dropping the leading directory.
#[tracing::instrument(skip(bytes), fields(len = bytes.len()))]
pub fn unpack_tar_gz(bytes: &[u8]) -> Result<FileMap> {
    let mut archive = Archive::new(GzDecoder::new(bytes));
    let mut files = FileMap::new();

    for entry in archive.entries().context("Failed to read tar archive")? {
        let mut entry = entry.context("Failed to read tar entry")?;
        let kind = entry.header().entry_type();
        if kind != EntryType::Regular && kind != EntryType::Continuous {
            // directories are implied by file paths; links and pax headers are skipped
            continue;
        }

        let path = entry.path().context("Tar entry has an invalid path")?.into_owned();
        let Some(relative) = strip_leading_component(&path)? else {
            continue;
        };

        let mut contents = Vec::new();
        entry
            .read_to_end(&mut contents)
            .with_context(|| format!("Failed to read {} from archive", relative))?;
        files.insert(relative, contents);
    }

    debug!("Unpacked {} files", files.len());
    Ok(files)
}

/// Returns the path below its first component, or `None` for top-level files.
fn strip_leading_component(path: &Path) -> Result<Option<String>> {
    let mut parts = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::CurDir => {}
            _ => return Err(anyhow!("Refusing unsafe archive path {:?}", path)),
        }
    }
    if parts.len() < 2 {
        return Ok(None);
    }
    Ok(Some(parts[1..].join("/")))
}

/// Builds a gzip tarball with every file under `prefix/`.
pub fn pack_tar_gz(prefix: &str, files: &FileMap) -> Result<Vec<u8>> {
    use flate2::Compression;
    use flate2::write::GzEncoder;

    let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
    for (path, contents) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(0o644);
        header.set_entry_type(EntryType::Regular);
        builder
            .append_data(&mut header, format!("{}/{}", prefix, path), contents.as_slice())
            .with_context(|| format!("Failed to add {} to archive", path))?;
    }
    let encoder = builder.into_inner().context("Failed to finish tar archive")?;
    encoder.finish().context("Failed to finish gzip stream")
}
