//! Inbound push handler.
//!
//! Servers deliver artifacts in three phases: `receive_meta` announces the
//! file (name, size, payload encoding, optional checksum), `receive_part`
//! appends payload chunks, and `receive_eof` verifies, materializes, and
//! commits the artifact atomically into the store, resolving the pending
//! download. Each method returns `Ok` for ack and a [`ReceiveError`] for
//! nack.
//!
//! Pushes with no matching pending download are rejected up front and do
//! not disturb any other in-flight transfer. A transfer that was solicited
//! but whose waiter has since been abandoned is still committed — the
//! artifact serves future requests — it just has nobody left to notify.
//!
//! Methods are synchronous; payload writes go straight to the staging file.
//! Network dispatchers calling from async context should use their blocking
//! facility for large parts.

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::sync::Arc;

use dashmap::DashMap;
use flate2::read::GzDecoder;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use super::error::ReceiveError;
use super::registry::DownloadRegistry;
use crate::reference::Fingerprint;
use crate::store::{ArtifactStore, StagedArtifact};

/// Encoding of the pushed payload bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    /// Payload bytes are the artifact content.
    Raw,
    /// Payload bytes are gzip-compressed artifact content.
    Gzip,
}

/// Announcement of one artifact push.
///
/// The checksum, when present, is the hex SHA-256 of the payload bytes as
/// transferred (i.e. of the compressed stream for [`PayloadKind::Gzip`]).
#[derive(Debug, Clone)]
pub struct FileMetadata {
    file_name: String,
    declared_size: u64,
    kind: PayloadKind,
    checksum: Option<String>,
}

impl FileMetadata {
    /// Metadata for a raw payload of the given size.
    pub fn new(file_name: impl Into<String>, declared_size: u64) -> Self {
        Self {
            file_name: file_name.into(),
            declared_size,
            kind: PayloadKind::Raw,
            checksum: None,
        }
    }

    /// Set the payload encoding.
    pub fn with_kind(mut self, kind: PayloadKind) -> Self {
        self.kind = kind;
        self
    }

    /// Declare the expected payload checksum (hex SHA-256).
    pub fn with_checksum(mut self, checksum: impl Into<String>) -> Self {
        self.checksum = Some(checksum.into());
        self
    }

    /// The artifact's file name.
    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    /// Declared payload size in bytes; 0 when the server does not know.
    pub fn declared_size(&self) -> u64 {
        self.declared_size
    }
}

/// One in-progress inbound transfer.
struct TransferSession {
    staged: StagedArtifact,
    writer: BufWriter<File>,
    hasher: Sha256,
    declared_size: u64,
    received: u64,
    kind: PayloadKind,
    checksum: Option<String>,
}

impl TransferSession {
    fn write_chunk(&mut self, chunk: &[u8]) -> io::Result<(u64, u64)> {
        self.writer.write_all(chunk)?;
        self.hasher.update(chunk);
        self.received += chunk.len() as u64;
        Ok((self.received, self.declared_size))
    }
}

/// Handler for server-initiated artifact deliveries.
pub struct PushReceiver {
    registry: Arc<DownloadRegistry>,
    store: Arc<ArtifactStore>,
    sessions: DashMap<Fingerprint, TransferSession>,
}

impl PushReceiver {
    pub(crate) fn new(registry: Arc<DownloadRegistry>, store: Arc<ArtifactStore>) -> Self {
        Self {
            registry,
            store,
            sessions: DashMap::new(),
        }
    }

    /// The store this receiver commits into.
    pub fn store(&self) -> &Arc<ArtifactStore> {
        &self.store
    }

    /// Begin one artifact transfer.
    ///
    /// Rejected when no download is pending for the fingerprint or when a
    /// transfer is already running.
    pub fn receive_meta(
        &self,
        fingerprint: &Fingerprint,
        meta: FileMetadata,
    ) -> Result<(), ReceiveError> {
        if self.registry.get(fingerprint).is_none() {
            // A stale session can only exist if its waiter was abandoned;
            // clear it together with the rejection.
            if let Some((_, session)) = self.sessions.remove(fingerprint) {
                session.staged.discard();
            }
            warn!(%fingerprint, "rejecting unsolicited file push");
            return Err(ReceiveError::Unsolicited(fingerprint.clone()));
        }
        if self.sessions.contains_key(fingerprint) {
            return Err(ReceiveError::TransferInProgress(fingerprint.clone()));
        }

        let session = self
            .open_session(fingerprint, &meta)
            .map_err(|error| self.fail_transfer(fingerprint, error))?;
        debug!(
            %fingerprint,
            file_name = %meta.file_name,
            declared_size = meta.declared_size,
            "file transfer started"
        );
        self.sessions.insert(fingerprint.clone(), session);
        self.registry.set_progress(fingerprint, 0.0);
        Ok(())
    }

    /// Append one payload chunk to the running transfer.
    pub fn receive_part(&self, fingerprint: &Fingerprint, chunk: &[u8]) -> Result<(), ReceiveError> {
        let written = {
            let mut session = self
                .sessions
                .get_mut(fingerprint)
                .ok_or_else(|| ReceiveError::NoTransfer(fingerprint.clone()))?;
            session.write_chunk(chunk)
        };
        match written {
            Ok((received, declared)) => {
                if declared > 0 {
                    self.registry
                        .set_progress(fingerprint, received as f64 / declared as f64);
                }
                Ok(())
            }
            Err(source) => {
                let error = ReceiveError::Storage {
                    fingerprint: fingerprint.clone(),
                    reason: source.to_string(),
                };
                self.discard_session(fingerprint);
                Err(self.fail_transfer(fingerprint, error))
            }
        }
    }

    /// Finish the transfer: verify, materialize, commit atomically, and
    /// resolve the pending download with the final path.
    pub fn receive_eof(&self, fingerprint: &Fingerprint) -> Result<(), ReceiveError> {
        let (_, session) = self
            .sessions
            .remove(fingerprint)
            .ok_or_else(|| ReceiveError::NoTransfer(fingerprint.clone()))?;

        let path = match self.finish_session(fingerprint, session) {
            Ok(path) => path,
            Err(error) => return Err(self.fail_transfer(fingerprint, error)),
        };

        self.registry.set_progress(fingerprint, 1.0);
        match self.registry.remove(fingerprint) {
            Some(pending) => {
                info!(%fingerprint, path = %path.display(), "file received");
                pending.complete(Ok(path));
            }
            None => {
                debug!(
                    %fingerprint,
                    "download no longer pending; artifact stored for future requests"
                );
            }
        }
        Ok(())
    }

    /// Deliver a complete artifact in one call (inline responses).
    pub fn receive_complete(
        &self,
        fingerprint: &Fingerprint,
        meta: FileMetadata,
        payload: &[u8],
    ) -> Result<(), ReceiveError> {
        self.receive_meta(fingerprint, meta)?;
        self.receive_part(fingerprint, payload)?;
        self.receive_eof(fingerprint)
    }

    /// Drop an in-progress transfer without failing the pending download.
    ///
    /// For transports that notice mid-body failures themselves: the
    /// half-written staging data is discarded and the pending entry stays
    /// available for a retry against another connection.
    pub fn abort_transfer(&self, fingerprint: &Fingerprint) {
        if self.sessions.contains_key(fingerprint) {
            debug!(%fingerprint, "aborting file transfer");
            self.discard_session(fingerprint);
        }
    }

    /// Discard every in-progress transfer. Used on shutdown.
    pub(crate) fn shutdown(&self) {
        let fingerprints: Vec<Fingerprint> =
            self.sessions.iter().map(|entry| entry.key().clone()).collect();
        for fingerprint in fingerprints {
            self.discard_session(&fingerprint);
        }
    }

    fn open_session(
        &self,
        fingerprint: &Fingerprint,
        meta: &FileMetadata,
    ) -> Result<TransferSession, ReceiveError> {
        let storage = |reason: String| ReceiveError::Storage {
            fingerprint: fingerprint.clone(),
            reason,
        };
        let staged = self
            .store
            .begin_staging(fingerprint, &meta.file_name)
            .map_err(|e| storage(e.to_string()))?;
        let file = match File::create(staged.payload_path()) {
            Ok(file) => file,
            Err(e) => {
                let error = storage(e.to_string());
                staged.discard();
                return Err(error);
            }
        };
        Ok(TransferSession {
            staged,
            writer: BufWriter::new(file),
            hasher: Sha256::new(),
            declared_size: meta.declared_size,
            received: 0,
            kind: meta.kind,
            checksum: meta.checksum.clone(),
        })
    }

    fn finish_session(
        &self,
        fingerprint: &Fingerprint,
        mut session: TransferSession,
    ) -> Result<std::path::PathBuf, ReceiveError> {
        let storage = |reason: String| ReceiveError::Storage {
            fingerprint: fingerprint.clone(),
            reason,
        };

        if let Err(e) = session.writer.flush() {
            let error = storage(e.to_string());
            session.staged.discard();
            return Err(error);
        }
        let TransferSession {
            staged,
            writer,
            hasher,
            declared_size,
            received,
            kind,
            checksum,
        } = session;
        drop(writer);

        if declared_size > 0 && received != declared_size {
            let error = ReceiveError::SizeMismatch {
                fingerprint: fingerprint.clone(),
                declared: declared_size,
                received,
            };
            staged.discard();
            return Err(error);
        }
        if let Some(expected) = checksum {
            let actual = hex::encode(hasher.finalize());
            if !actual.eq_ignore_ascii_case(&expected) {
                let error = ReceiveError::ChecksumMismatch {
                    fingerprint: fingerprint.clone(),
                    expected,
                    actual,
                };
                staged.discard();
                return Err(error);
            }
        }

        if let Err(source) = materialize(&staged, kind) {
            let error = storage(source.to_string());
            staged.discard();
            return Err(error);
        }

        self.store.commit(staged).map_err(|e| storage(e.to_string()))
    }

    /// Convert a mid-transfer failure into the pending download's terminal
    /// error, removing the registry entry. Returns the error for the nack.
    fn fail_transfer(&self, fingerprint: &Fingerprint, error: ReceiveError) -> ReceiveError {
        warn!(%fingerprint, %error, "file transfer failed");
        if let Some(pending) = self.registry.remove(fingerprint) {
            pending.complete(Err(error.to_download_error()));
        }
        error
    }

    fn discard_session(&self, fingerprint: &Fingerprint) {
        if let Some((_, session)) = self.sessions.remove(fingerprint) {
            session.staged.discard();
        }
    }
}

/// Turn the raw payload file into the final named artifact file inside the
/// staging directory.
fn materialize(staged: &StagedArtifact, kind: PayloadKind) -> io::Result<()> {
    match kind {
        PayloadKind::Raw => fs::rename(staged.payload_path(), staged.file_path()),
        PayloadKind::Gzip => {
            let compressed = File::open(staged.payload_path())?;
            let mut decoder = GzDecoder::new(compressed);
            let mut output = File::create(staged.file_path())?;
            io::copy(&mut decoder, &mut output)?;
            fs::remove_file(staged.payload_path())
        }
    }
}
