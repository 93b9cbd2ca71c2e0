//! Artifact identity types.
//!
//! A [`Fingerprint`] is the content-derived key for one immutable artifact.
//! It is the sole deduplication key for downloads and doubles as the
//! directory name the artifact is stored under, so construction validates
//! that the value is safe to use as a single path component.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error returned when a fingerprint value cannot be used as an artifact key.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidFingerprint {
    /// The fingerprint was an empty string.
    #[error("fingerprint is empty")]
    Empty,

    /// The fingerprint contained a character that is not allowed in a
    /// single path component.
    #[error("fingerprint {value:?} contains illegal character {character:?}")]
    IllegalCharacter { value: String, character: char },

    /// The fingerprint was a reserved directory name.
    #[error("fingerprint {0:?} is a reserved name")]
    Reserved(String),
}

/// Opaque, content-derived identifier for one immutable artifact.
///
/// Equality and hashing are by value. The string is used verbatim as the
/// artifact's directory name under the store root, so values are restricted
/// to a single, non-reserved path component.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Create a fingerprint, validating it is usable as a directory name.
    ///
    /// Rejects the empty string, dot-prefixed values (`.`, `..`, and hidden
    /// names, which are reserved for store bookkeeping), and any value
    /// containing path separators, NUL, or other control characters.
    pub fn new(value: impl Into<String>) -> Result<Self, InvalidFingerprint> {
        let value = value.into();
        if value.is_empty() {
            return Err(InvalidFingerprint::Empty);
        }
        if value.starts_with('.') {
            return Err(InvalidFingerprint::Reserved(value));
        }
        if let Some(character) = value
            .chars()
            .find(|c| matches!(c, '/' | '\\') || c.is_control())
        {
            return Err(InvalidFingerprint::IllegalCharacter { value, character });
        }
        Ok(Self(value))
    }

    /// The raw fingerprint value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Fingerprint {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// One request to make an artifact locally available.
///
/// Multiple requests for the same fingerprint are equivalent: the engine
/// performs at most one network operation per fingerprint at a time, and
/// every concurrent requester observes the same outcome. The optional
/// client tag identifies the node the request originated from and is
/// forwarded to servers for bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRequest {
    fingerprint: Fingerprint,
    client: Option<String>,
}

impl DownloadRequest {
    /// Create a request for the given fingerprint.
    pub fn new(fingerprint: Fingerprint) -> Self {
        Self {
            fingerprint,
            client: None,
        }
    }

    /// Tag the request with the originating client's identity.
    pub fn with_client(mut self, client: impl Into<String>) -> Self {
        self.client = Some(client.into());
        self
    }

    /// The artifact this request is for.
    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    /// The originating client tag, if any.
    pub fn client(&self) -> Option<&str> {
        self.client.as_deref()
    }
}

impl fmt::Display for DownloadRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.client {
            Some(client) => write!(f, "{} (client {})", self.fingerprint, client),
            None => self.fingerprint.fmt(f),
        }
    }
}

impl From<Fingerprint> for DownloadRequest {
    fn from(fingerprint: Fingerprint) -> Self {
        Self::new(fingerprint)
    }
}
