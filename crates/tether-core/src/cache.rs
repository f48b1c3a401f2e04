//! Session identity cache
//!
//! Persists the session membership handed out by the traffic manager so a
//! restarted daemon can resume instead of arriving anew. One file per daemon
//! id: concurrent sessions for distinct daemon ids never contend.

use std::io;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::types::{DaemonIdentifier, SessionRef};

/// Cached identity for one daemon id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Encoded daemon id the record belongs to.
    pub daemon_id: String,
    /// Session membership returned by the manager.
    pub session: SessionRef,
    /// Client id the manager knows this session as.
    pub client_id: String,
}

/// File-backed store under the invoking user's cache directory.
#[derive(Debug, Clone)]
pub struct SessionCache {
    dir: PathBuf,
}

impl SessionCache {
    /// Cache rooted at `<user cache dir>/tether/sessions`.
    pub fn new() -> Self {
        let dir = dirs::cache_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("tether")
            .join("sessions");
        Self { dir }
    }

    /// Cache rooted at an explicit directory.
    pub fn with_dir(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, id: &DaemonIdentifier) -> PathBuf {
        self.dir.join(format!("{}.json", id.encoded()))
    }

    /// Load the record for a daemon id. A missing file and an undecodable
    /// file both yield `None`: a corrupt cache must never fail a connect.
    pub async fn load(&self, id: &DaemonIdentifier) -> io::Result<Option<SessionRecord>> {
        let path = self.path_for(id);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        match serde_json::from_slice::<SessionRecord>(&bytes) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                tracing::warn!(path = %path.display(), "discarding undecodable session record: {e}");
                Ok(None)
            }
        }
    }

    /// Persist a record, atomically: write a temp file in the same
    /// directory, then rename over the destination.
    pub async fn save(&self, id: &DaemonIdentifier, record: &SessionRecord) -> io::Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(id);
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(record).map_err(io::Error::other)?;
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &path).await
    }

    /// Remove the record for a daemon id. Absence is not an error.
    pub async fn delete(&self, id: &DaemonIdentifier) -> io::Result<()> {
        match tokio::fs::remove_file(self.path_for(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl Default for SessionCache {
    fn default() -> Self {
        Self::new()
    }
}
