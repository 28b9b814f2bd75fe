use std::fmt;
use std::fs;
use std::io::Write;
use std::path::Path;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tempfile::Builder;

use crate::domain::{FormId, FormVersion};
use crate::error::CatalogError;

const FORMS_DIR: &str = "forms";
const INDEX_FILE: &str = "index.json";
const MEDIA_SUFFIX: &str = "-media";
const TEMP_PREFIX: &str = ".formcat-";

/// Content digest of an artifact, rendered as `sha256:<hex>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn of(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        Self(format!("sha256:{:x}", hasher.finalize()))
    }

    /// Accepts a server-declared digest, with or without the `sha256:` prefix.
    pub fn parse(value: &str) -> Option<Self> {
        let trimmed = value.trim().to_ascii_lowercase();
        let hex = trimmed.strip_prefix("sha256:").unwrap_or(&trimmed);
        let is_valid = hex.len() == 64 && hex.chars().all(|ch| ch.is_ascii_hexdigit());
        is_valid.then(|| Self(format!("sha256:{hex}")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub struct ScannedArtifact {
    pub path: Utf8PathBuf,
    pub bytes: Vec<u8>,
    pub fingerprint: Fingerprint,
    pub modified: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum ScanItem {
    Artifact(ScannedArtifact),
    /// Present on disk but not readable as a settled artifact right now.
    Skipped { path: Utf8PathBuf, reason: String },
}

impl ScanItem {
    pub fn path(&self) -> &Utf8Path {
        match self {
            ScanItem::Artifact(artifact) => &artifact.path,
            ScanItem::Skipped { path, .. } => path,
        }
    }
}

/// Lazy pass over the artifacts found by [`FormStore::scan`].
///
/// Candidate paths are listed up front; bytes are only read as the iterator
/// advances. Call `scan` again to restart.
pub struct ArtifactScan {
    pending: std::vec::IntoIter<Utf8PathBuf>,
}

impl Iterator for ArtifactScan {
    type Item = ScanItem;

    fn next(&mut self) -> Option<Self::Item> {
        let path = self.pending.next()?;
        Some(read_settled(path))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.pending.size_hint()
    }
}

#[derive(Debug, Clone)]
pub struct FormStore {
    root: Utf8PathBuf,
}

impl FormStore {
    pub fn new(root: Utf8PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn forms_dir(&self) -> Utf8PathBuf {
        self.root.join(FORMS_DIR)
    }

    pub fn index_path(&self) -> Utf8PathBuf {
        self.root.join(INDEX_FILE)
    }

    pub fn artifact_path(&self, form_id: &FormId, version: &FormVersion) -> Utf8PathBuf {
        let file = match version.as_deref() {
            Some(version) => format!("v{}.json", sanitize_segment(version)),
            None => "unversioned.json".to_string(),
        };
        self.forms_dir().join(form_id.as_str()).join(file)
    }

    pub fn media_dir(artifact: &Utf8Path) -> Utf8PathBuf {
        let stem = artifact.file_stem().unwrap_or("form");
        artifact.with_file_name(format!("{stem}{MEDIA_SUFFIX}"))
    }

    pub fn ensure_root(&self) -> Result<(), CatalogError> {
        fs::create_dir_all(self.forms_dir().as_std_path())
            .map_err(|err| CatalogError::Storage(format!("create {}: {err}", self.forms_dir())))
    }

    pub fn exists(&self, path: &Utf8Path) -> bool {
        path.as_std_path().is_file()
    }

    /// True when `path` lives in the part of the root this store scans.
    pub fn is_managed(&self, path: &Utf8Path) -> bool {
        path.starts_with(self.forms_dir())
    }

    pub fn write(
        &self,
        form_id: &FormId,
        version: &FormVersion,
        bytes: &[u8],
    ) -> Result<Utf8PathBuf, CatalogError> {
        let path = self.artifact_path(form_id, version);
        write_bytes_atomic(&path, bytes)?;
        Ok(path)
    }

    /// Installs `files` as the complete media set of `artifact`.
    ///
    /// The set is staged in a hidden directory beside the artifact and swapped
    /// in with renames. The previous set is moved aside first and put back if
    /// the swap fails, so the media directory never mixes old and new files.
    pub fn replace_media(
        &self,
        artifact: &Utf8Path,
        files: &[(String, Vec<u8>)],
    ) -> Result<Utf8PathBuf, CatalogError> {
        if let Some((name, _)) = files.iter().find(|(name, _)| !is_plain_file_name(name)) {
            return Err(CatalogError::Parse(format!(
                "refusing media file name: {name}"
            )));
        }
        let target = Self::media_dir(artifact);
        let parent = target
            .parent()
            .ok_or_else(|| CatalogError::Storage(format!("invalid media path: {target}")))?;
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| CatalogError::Storage(format!("create {parent}: {err}")))?;

        let staging = Builder::new()
            .prefix(TEMP_PREFIX)
            .tempdir_in(parent.as_std_path())
            .map_err(|err| CatalogError::Storage(err.to_string()))?;
        for (name, bytes) in files {
            fs::write(staging.path().join(name), bytes)
                .map_err(|err| CatalogError::Storage(format!("stage media {name}: {err}")))?;
        }
        let staged = staging.keep();

        let retired = parent.join(format!(
            "{TEMP_PREFIX}{}-retired",
            target.file_name().unwrap_or("media")
        ));
        let had_previous = target.as_std_path().exists();
        if had_previous {
            let moved_aside = remove_stale_dir(&retired)
                .and_then(|()| fs::rename(target.as_std_path(), retired.as_std_path()));
            if let Err(err) = moved_aside {
                let _ = fs::remove_dir_all(&staged);
                return Err(CatalogError::Storage(format!("retire {target}: {err}")));
            }
        }

        if let Err(err) = fs::rename(&staged, target.as_std_path()) {
            let _ = fs::remove_dir_all(&staged);
            if had_previous {
                let _ = fs::rename(retired.as_std_path(), target.as_std_path());
            }
            return Err(CatalogError::Storage(format!("install {target}: {err}")));
        }
        if had_previous {
            if let Err(err) = fs::remove_dir_all(retired.as_std_path()) {
                tracing::warn!(path = %retired, error = %err, "could not remove replaced media");
            }
        }
        Ok(target)
    }

    pub fn fingerprint(bytes: &[u8]) -> Fingerprint {
        Fingerprint::of(bytes)
    }

    pub fn scan(&self) -> Result<ArtifactScan, CatalogError> {
        let forms_dir = self.forms_dir();
        if !forms_dir.as_std_path().exists() {
            return Ok(ArtifactScan {
                pending: Vec::new().into_iter(),
            });
        }
        let mut candidates = walk_artifacts(forms_dir.as_std_path())?;
        candidates.sort();
        Ok(ArtifactScan {
            pending: candidates.into_iter(),
        })
    }
}

/// Writes `content` next to `path` under a hidden temp name and renames it
/// into place, so a reader sees either the old file or the complete new one.
pub fn write_bytes_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), CatalogError> {
    let parent = path
        .parent()
        .ok_or_else(|| CatalogError::Storage(format!("invalid destination path: {path}")))?;
    fs::create_dir_all(parent.as_std_path())
        .map_err(|err| CatalogError::Storage(format!("create {parent}: {err}")))?;
    let mut temp = Builder::new()
        .prefix(TEMP_PREFIX)
        .suffix(".tmp")
        .tempfile_in(parent.as_std_path())
        .map_err(|err| CatalogError::Storage(err.to_string()))?;
    temp.write_all(content)
        .map_err(|err| CatalogError::Storage(err.to_string()))?;
    temp.as_file()
        .sync_all()
        .map_err(|err| CatalogError::Storage(err.to_string()))?;
    temp.persist(path.as_std_path())
        .map_err(|err| CatalogError::Storage(format!("persist {path}: {}", err.error)))?;
    Ok(())
}

fn walk_artifacts(root: &Path) -> Result<Vec<Utf8PathBuf>, CatalogError> {
    let mut items = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let entries = fs::read_dir(&dir)
            .map_err(|err| CatalogError::Storage(format!("read {}: {err}", dir.display())))?;
        for entry in entries {
            let entry = entry.map_err(|err| CatalogError::Storage(err.to_string()))?;
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
                tracing::warn!(path = %path.display(), "skipping non-utf8 path");
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            if path.is_dir() {
                if !name.ends_with(MEDIA_SUFFIX) {
                    stack.push(path);
                }
                continue;
            }
            if path.extension().map(|ext| ext == "json").unwrap_or(false) {
                if let Ok(path) = Utf8PathBuf::from_path_buf(path) {
                    items.push(path);
                }
            }
        }
    }
    Ok(items)
}

fn read_settled(path: Utf8PathBuf) -> ScanItem {
    let skipped = |path: Utf8PathBuf, reason: String| ScanItem::Skipped { path, reason };

    if lock_marker(&path).as_std_path().exists() {
        return skipped(path, "lock marker present".to_string());
    }
    let before = match fs::metadata(path.as_std_path()) {
        Ok(meta) => meta,
        Err(err) => return skipped(path, format!("stat failed: {err}")),
    };
    let bytes = match fs::read(path.as_std_path()) {
        Ok(bytes) => bytes,
        Err(err) => return skipped(path, format!("read failed: {err}")),
    };
    let after = match fs::metadata(path.as_std_path()) {
        Ok(meta) => meta,
        Err(err) => return skipped(path, format!("stat failed: {err}")),
    };
    if before.len() != after.len() || bytes.len() as u64 != after.len() {
        return skipped(path, "file is still being written".to_string());
    }

    let modified = after
        .modified()
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now());
    let fingerprint = Fingerprint::of(&bytes);
    ScanItem::Artifact(ScannedArtifact {
        path,
        bytes,
        fingerprint,
        modified,
    })
}

fn lock_marker(path: &Utf8Path) -> Utf8PathBuf {
    let name = path.file_name().unwrap_or_default();
    path.with_file_name(format!("{name}.lock"))
}

fn sanitize_segment(value: &str) -> String {
    value
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-') {
                ch
            } else {
                '_'
            }
        })
        .collect()
}

fn remove_stale_dir(path: &Utf8Path) -> std::io::Result<()> {
    match fs::remove_dir_all(path.as_std_path()) {
        Err(err) if err.kind() != std::io::ErrorKind::NotFound => Err(err),
        _ => Ok(()),
    }
}

fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.starts_with('.')
        && !name.contains(['/', '\\'])
}
