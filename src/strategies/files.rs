//! File backup archiver
//!
//! Produces one gzip tar per service from its configured data paths.
//! Relative data paths resolve beneath the service data root, absolute ones
//! are stored under their final component. Exclusion patterns are matched
//! against the path relative to the data root.

use crate::utils::archive::{finish_gzip, gzip_file};
use glob::Pattern;
use std::collections::HashSet;
use std::fs::{self, File};
use std::io;
use std::path::{Component as PathComponent, Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("None of the data paths could be read")]
    NothingReadable,

    #[error("Failed to write archive {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// A finished file archive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveArtifact {
    pub path: PathBuf,
    pub entries: usize,
    pub skipped: usize,
    pub size: u64,
}

pub struct FileArchiver {
    exclusions: Vec<Pattern>,
}

impl FileArchiver {
    /// Invalid patterns are logged and ignored
    pub fn new(exclusions: &[String]) -> Self {
        let exclusions = exclusions
            .iter()
            .filter_map(|raw| match Pattern::new(raw) {
                Ok(pattern) => Some(pattern),
                Err(e) => {
                    warn!("Ignoring invalid exclusion '{}': {}", raw, e);
                    None
                }
            })
            .collect();
        Self { exclusions }
    }

    /// Directories are also tested with a trailing `/` so that `dir/*`
    /// prunes `dir` itself
    fn is_excluded(&self, relative: &str, is_dir: bool) -> bool {
        let with_slash = format!("{}/", relative);
        self.exclusions
            .iter()
            .any(|p| p.matches(relative) || (is_dir && p.matches(&with_slash)))
    }

    /// Archive `data_paths` into `output`.
    ///
    /// `Ok(None)` when there is nothing configured.
    pub fn archive(
        &self,
        data_root: &Path,
        data_paths: &[String],
        output: &Path,
    ) -> Result<Option<ArchiveArtifact>, ArchiveError> {
        if data_paths.is_empty() {
            return Ok(None);
        }
        let io_err = |source: io::Error| ArchiveError::Io {
            path: output.to_path_buf(),
            source,
        };

        let mut builder = tar::Builder::new(gzip_file(output).map_err(io_err)?);
        builder.follow_symlinks(false);

        let mut entries = 0;
        let mut skipped = 0;
        let mut prefixes = HashSet::new();

        for data_path in data_paths {
            let Some((source, prefix)) = resolve_data_path(data_root, data_path) else {
                warn!("Ignoring data path '{}'", data_path);
                continue;
            };
            if fs::symlink_metadata(&source).is_err() {
                warn!("Data path {} does not exist, skipping", source.display());
                continue;
            }
            let prefix = unique_prefix(&mut prefixes, prefix);
            debug!("Archiving {} as {}", source.display(), prefix);

            let walker = WalkDir::new(&source).follow_links(false).into_iter();
            let walker = walker.filter_entry(|entry| {
                let name = entry_name(&prefix, &source, entry.path());
                let excluded = self.is_excluded(&name, entry.file_type().is_dir());
                if excluded {
                    debug!("Excluded {}", name);
                }
                !excluded
            });

            for entry in walker {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(e) => {
                        warn!("Skipping unreadable entry: {}", e);
                        skipped += 1;
                        continue;
                    }
                };
                let name = entry_name(&prefix, &source, entry.path());
                let file_type = entry.file_type();

                if file_type.is_dir() {
                    builder.append_dir(&name, entry.path()).map_err(io_err)?;
                } else if file_type.is_file() {
                    let mut file = match File::open(entry.path()) {
                        Ok(file) => file,
                        Err(e) => {
                            warn!("Skipping unreadable file {}: {}", entry.path().display(), e);
                            skipped += 1;
                            continue;
                        }
                    };
                    builder.append_file(&name, &mut file).map_err(io_err)?;
                } else {
                    builder.append_path_with_name(entry.path(), &name).map_err(io_err)?;
                }
                entries += 1;
            }
        }

        if entries == 0 {
            return Err(ArchiveError::NothingReadable);
        }

        let path = finish_gzip(builder.into_inner().map_err(io_err)?).map_err(io_err)?;
        let size = fs::metadata(&path).map_err(io_err)?.len();
        info!(
            "Archived {} entries ({} skipped, {} bytes) to {}",
            entries,
            skipped,
            size,
            path.display()
        );

        Ok(Some(ArchiveArtifact {
            path,
            entries,
            skipped,
            size,
        }))
    }
}

/// Host location of a data path and its name inside the archive
fn resolve_data_path(data_root: &Path, data_path: &str) -> Option<(PathBuf, String)> {
    let path = Path::new(data_path);
    if path.is_absolute() {
        let name = path.file_name()?.to_string_lossy().into_owned();
        return Some((path.to_path_buf(), name));
    }

    // Relative paths must stay beneath the data root
    let mut parts = Vec::new();
    for component in path.components() {
        match component {
            PathComponent::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            PathComponent::CurDir => {}
            _ => return None,
        }
    }
    if parts.is_empty() {
        return None;
    }
    let name = parts.join("/");
    Some((data_root.join(&name), name))
}

/// Absolute paths sharing a final component get a numeric suffix
fn unique_prefix(used: &mut HashSet<String>, prefix: String) -> String {
    let mut candidate = prefix.clone();
    let mut n = 1;
    while !used.insert(candidate.clone()) {
        n += 1;
        candidate = format!("{}_{}", prefix, n);
    }
    candidate
}

fn entry_name(prefix: &str, source: &Path, path: &Path) -> String {
    match path.strip_prefix(source) {
        Ok(rest) if !rest.as_os_str().is_empty() => {
            let rest: Vec<_> = rest.components().map(|c| c.as_os_str().to_string_lossy()).collect();
            format!("{}/{}", prefix, rest.join("/"))
        }
        _ => prefix.to_string(),
    }
}
