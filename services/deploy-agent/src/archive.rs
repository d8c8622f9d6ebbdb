//! Image archive extraction.
//!
//! Unpacks a gzipped tar into a staging directory next to the artifact
//! directory, checks that every required member is present, and only then
//! swaps the staging directory into place. A failed extraction leaves the
//! previous artifacts untouched.

use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{self, BufReader};
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use tar::Archive;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::artifacts::{ArtifactLayout, REQUIRED_MEMBERS};

/// Errors from archive extraction.
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to read archive stream: {0}")]
    Corrupt(#[source] io::Error),

    #[error("archive misses required file '{0}'")]
    MissingMember(String),
}

/// Extract `archive` into `layout`, replacing the previous contents.
///
/// Returns the relative paths of all extracted files.
pub fn install_image_archive(
    archive: &Path,
    layout: &ArtifactLayout,
) -> Result<BTreeSet<PathBuf>, ArchiveError> {
    let staging = sibling(layout.root(), "staging");
    if staging.exists() {
        fs::remove_dir_all(&staging)?;
    }
    fs::create_dir_all(&staging)?;

    let result = extract(archive, &staging).and_then(|files| {
        for need in REQUIRED_MEMBERS {
            if !files.contains(Path::new(need)) {
                return Err(ArchiveError::MissingMember(need.to_string()));
            }
        }
        Ok(files)
    });

    let files = match result {
        Ok(files) => files,
        Err(e) => {
            fs::remove_dir_all(&staging).ok();
            return Err(e);
        }
    };

    swap_into_place(&staging, layout.root())?;

    info!(
        dir = %layout.root().display(),
        files = files.len(),
        "Image archive installed"
    );
    Ok(files)
}

/// Unpack a gzipped tar into `dest`, skipping entries that would escape it.
fn extract(archive: &Path, dest: &Path) -> Result<BTreeSet<PathBuf>, ArchiveError> {
    let reader = BufReader::new(File::open(archive)?);
    let mut archive = Archive::new(GzDecoder::new(reader));
    let mut files = BTreeSet::new();

    for entry in archive.entries().map_err(ArchiveError::Corrupt)? {
        let mut entry = entry.map_err(ArchiveError::Corrupt)?;
        let raw_path = entry.path().map_err(ArchiveError::Corrupt)?.into_owned();

        if entry.header().entry_type().is_dir() {
            continue;
        }

        let Some(path) = normalize(&raw_path) else {
            warn!(path = %raw_path.display(), "Skipping archive entry outside destination");
            continue;
        };

        debug!(
            path = %path.display(),
            size = entry.header().size().unwrap_or(0),
            "Extracting file"
        );

        let full_path = dest.join(&path);
        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent)?;
        }
        entry.unpack(&full_path).map_err(ArchiveError::Corrupt)?;
        files.insert(path);
    }

    Ok(files)
}

/// Strip `.` components; reject absolute paths and `..`.
fn normalize(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    (!out.as_os_str().is_empty()).then_some(out)
}

fn swap_into_place(staging: &Path, target: &Path) -> io::Result<()> {
    let previous = sibling(target, "old");
    if previous.exists() {
        fs::remove_dir_all(&previous)?;
    }
    let had_previous = target.exists();
    if had_previous {
        fs::rename(target, &previous)?;
    }
    if let Err(e) = fs::rename(staging, target) {
        if had_previous {
            fs::rename(&previous, target).ok();
        }
        return Err(e);
    }
    if had_previous {
        fs::remove_dir_all(&previous).ok();
    }
    Ok(())
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".to_string());
    path.with_file_name(format!("{name}.{suffix}"))
}
