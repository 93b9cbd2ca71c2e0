//! Local content-addressed artifact store.
//!
//! Artifacts live at `root/<fingerprint>/<file-name>`. Placement is atomic:
//! incoming payloads are assembled in a staging area under the same root and
//! the fully populated artifact directory is renamed into place in one step,
//! so a fingerprint directory is either absent or complete. That makes the
//! presence of a non-empty readable file definitive proof of a finished
//! download — `lookup` never re-verifies content.
//!
//! The inverse also holds: a fingerprint directory with no usable file can
//! only mean the store was damaged out-of-band, which is surfaced as
//! corruption rather than treated as "not downloaded".

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::reference::Fingerprint;

mod error;

pub use error::StoreError;

/// Directory under the store root where in-flight payloads are assembled.
/// Kept inside the root so the final rename never crosses a filesystem.
const STAGING_DIR: &str = ".staging";

/// The local artifact store.
///
/// Cheap to clone conceptually (holds only the root path); shared behind an
/// `Arc` by the download engine.
#[derive(Debug)]
pub struct ArtifactStore {
    root: PathBuf,
    staging_root: PathBuf,
}

impl ArtifactStore {
    /// Open (and create if needed) a store rooted at `root`.
    ///
    /// Leftover staging data from a previous crashed process is discarded;
    /// anything in staging was by definition never committed.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        let staging_root = root.join(STAGING_DIR);

        fs::create_dir_all(&root).map_err(|source| StoreError::CreateDirFailed {
            path: root.clone(),
            source,
        })?;
        if staging_root.exists() {
            if let Err(source) = fs::remove_dir_all(&staging_root) {
                warn!(path = %staging_root.display(), %source, "could not clear stale staging data");
            }
        }
        fs::create_dir_all(&staging_root).map_err(|source| StoreError::CreateDirFailed {
            path: staging_root.clone(),
            source,
        })?;

        Ok(Self { root, staging_root })
    }

    /// The store root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The directory a given artifact is (or would be) stored under.
    pub fn artifact_dir(&self, fingerprint: &Fingerprint) -> PathBuf {
        self.root.join(fingerprint.as_str())
    }

    /// Look up an artifact by fingerprint.
    ///
    /// Returns `Ok(None)` when the artifact has not been downloaded,
    /// `Ok(Some(path))` when a readable non-empty file is present, and a
    /// corruption error when the fingerprint directory exists but holds no
    /// usable file.
    pub fn lookup(&self, fingerprint: &Fingerprint) -> Result<Option<PathBuf>, StoreError> {
        let dir = self.artifact_dir(fingerprint);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(source) if source.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(StoreError::Io { path: dir, source }),
        };

        let mut files = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| StoreError::Io {
                path: dir.clone(),
                source,
            })?;
            let path = entry.path();
            if path.is_file() {
                files.push(path);
            }
        }
        files.sort();

        let path = files
            .into_iter()
            .next()
            .ok_or(StoreError::EmptyArtifactDir { path: dir })?;

        // Readability is checked by opening; atomic placement guarantees a
        // present file is complete, so content is not re-verified.
        let file = File::open(&path).map_err(|source| StoreError::Unreadable {
            path: path.clone(),
            source,
        })?;
        let len = file
            .metadata()
            .map_err(|source| StoreError::Unreadable {
                path: path.clone(),
                source,
            })?
            .len();
        if len == 0 {
            return Err(StoreError::EmptyFile { path });
        }

        debug!(%fingerprint, path = %path.display(), "artifact found in local store");
        Ok(Some(path))
    }

    /// List the fingerprints of all artifacts present under the root.
    ///
    /// Includes fingerprints whose directories are corrupt; use [`lookup`]
    /// per fingerprint to distinguish. Internal bookkeeping directories are
    /// skipped.
    ///
    /// [`lookup`]: ArtifactStore::lookup
    pub fn fingerprints(&self) -> Result<Vec<Fingerprint>, StoreError> {
        let entries = fs::read_dir(&self.root).map_err(|source| StoreError::Io {
            path: self.root.clone(),
            source,
        })?;

        let mut fingerprints = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| StoreError::Io {
                path: self.root.clone(),
                source,
            })?;
            if !entry.path().is_dir() {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name == STAGING_DIR {
                continue;
            }
            if let Ok(fingerprint) = Fingerprint::new(name) {
                fingerprints.push(fingerprint);
            }
        }
        fingerprints.sort();
        Ok(fingerprints)
    }

    /// Start staging an incoming artifact payload.
    ///
    /// Any stale staging data for the same fingerprint is replaced.
    pub fn begin_staging(
        &self,
        fingerprint: &Fingerprint,
        file_name: &str,
    ) -> Result<StagedArtifact, StoreError> {
        validate_file_name(file_name)?;

        let dir = self.staging_root.join(fingerprint.as_str());
        if dir.exists() {
            debug!(%fingerprint, "replacing stale staging data");
            fs::remove_dir_all(&dir).map_err(|source| StoreError::Io {
                path: dir.clone(),
                source,
            })?;
        }
        fs::create_dir_all(&dir).map_err(|source| StoreError::CreateDirFailed {
            path: dir.clone(),
            source,
        })?;

        Ok(StagedArtifact {
            fingerprint: fingerprint.clone(),
            dir,
            file_name: file_name.to_string(),
        })
    }

    /// Commit a fully staged artifact with a single atomic rename.
    ///
    /// The staged directory must contain the final file (see
    /// [`StagedArtifact::file_path`]). If another writer committed the same
    /// fingerprint first, the staging copy is discarded and the existing
    /// artifact is returned.
    pub fn commit(&self, staged: StagedArtifact) -> Result<PathBuf, StoreError> {
        let final_dir = self.artifact_dir(&staged.fingerprint);
        let final_path = final_dir.join(&staged.file_name);

        if !staged.file_path().is_file() {
            let path = staged.file_path();
            staged.discard();
            return Err(StoreError::Io {
                path,
                source: io::Error::new(io::ErrorKind::NotFound, "staged payload missing"),
            });
        }

        match fs::rename(&staged.dir, &final_dir) {
            Ok(()) => Ok(final_path),
            Err(_) if final_dir.exists() => match self.lookup(&staged.fingerprint) {
                // Lost the race to a concurrent commit: serve the winner.
                Ok(Some(existing)) => {
                    debug!(fingerprint = %staged.fingerprint, "artifact committed concurrently");
                    staged.discard();
                    Ok(existing)
                }
                // The directory is there but holds nothing usable: replace
                // the damaged artifact with the staged one.
                _ => {
                    warn!(path = %final_dir.display(), "replacing corrupt artifact directory");
                    if let Err(source) = fs::remove_dir_all(&final_dir) {
                        staged.discard();
                        return Err(StoreError::Io {
                            path: final_dir,
                            source,
                        });
                    }
                    match fs::rename(&staged.dir, &final_dir) {
                        Ok(()) => Ok(final_path),
                        Err(source) => {
                            staged.discard();
                            Err(StoreError::Io {
                                path: final_dir,
                                source,
                            })
                        }
                    }
                }
            },
            Err(source) => {
                staged.discard();
                Err(StoreError::Io {
                    path: final_dir,
                    source,
                })
            }
        }
    }
}

/// An artifact payload being assembled in the staging area.
///
/// The receive path writes raw payload bytes to [`payload_path`], then
/// materializes the final file at [`file_path`] (a rename for plain
/// payloads, a decompression for gzip ones) before handing the whole
/// directory to [`ArtifactStore::commit`].
///
/// [`payload_path`]: StagedArtifact::payload_path
/// [`file_path`]: StagedArtifact::file_path
#[derive(Debug)]
pub struct StagedArtifact {
    fingerprint: Fingerprint,
    dir: PathBuf,
    file_name: String,
}

impl StagedArtifact {
    /// The fingerprint this staging belongs to.
    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    /// Where raw incoming payload bytes are written.
    pub fn payload_path(&self) -> PathBuf {
        self.dir.join("payload.part")
    }

    /// Where the final, named artifact file must exist before commit.
    pub fn file_path(&self) -> PathBuf {
        self.dir.join(&self.file_name)
    }

    /// The artifact's file name.
    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    /// Drop the staging data. Failures are logged, not surfaced; the
    /// staging area is cleared again on the next store open.
    pub fn discard(self) {
        if let Err(source) = fs::remove_dir_all(&self.dir) {
            if source.kind() != io::ErrorKind::NotFound {
                debug!(path = %self.dir.display(), %source, "failed to discard staging data");
            }
        }
    }
}

/// Artifact file names come from the network; confine them to a single
/// path component.
fn validate_file_name(name: &str) -> Result<(), StoreError> {
    let legal = !name.is_empty()
        && name != "."
        && name != ".."
        && !name
            .chars()
            .any(|c| matches!(c, '/' | '\\') || c.is_control());
    if legal {
        Ok(())
    } else {
        Err(StoreError::InvalidFileName {
            name: name.to_string(),
        })
    }
}
