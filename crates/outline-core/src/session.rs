//! Authenticated remote access, passed explicitly to whatever needs it.

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::{error::RemoteApiError, remote::RemoteRepo};

/// A validated credential: the remote client plus who it belongs to.
pub struct Session {
    login: String,
    remote: Arc<dyn RemoteRepo>,
    started_at: DateTime<Utc>,
}

impl Session {
    /// Validate `remote`'s credential by resolving the authenticated user.
    pub async fn establish(remote: Arc<dyn RemoteRepo>) -> Result<Self, RemoteApiError> {
        let login = remote.current_user().await?;
        info!(login = %login, "session established");
        Ok(Self {
            login,
            remote,
            started_at: Utc::now(),
        })
    }

    pub fn login(&self) -> &str {
        &self.login
    }

    pub fn remote(&self) -> &Arc<dyn RemoteRepo> {
        &self.remote
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }
}

/// Shared slot holding the current session, if any.
#[derive(Clone, Default)]
pub struct SessionHandle {
    inner: Arc<RwLock<Option<Arc<Session>>>>,
}

impl SessionHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<Arc<Session>> {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Replace any existing session.
    pub fn install(&self, session: Session) -> Arc<Session> {
        let session = Arc::new(session);
        *self.inner.write().unwrap_or_else(|e| e.into_inner()) = Some(Arc::clone(&session));
        session
    }

    /// Drop the current session. Returns whether one was installed.
    pub fn invalidate(&self) -> bool {
        let previous = self.inner.write().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(s) = &previous {
            info!(login = %s.login, "session invalidated");
        }
        previous.is_some()
    }
}

/// Bearer token persisted between restarts.
pub struct TokenFile {
    path: PathBuf,
}

impl TokenFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<Option<String>> {
        match std::fs::read_to_string(&self.path) {
            Ok(s) => {
                let token = s.trim();
                Ok((!token.is_empty()).then(|| token.to_string()))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("reading {}", self.path.display())),
        }
    }

    pub fn save(&self, token: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        std::fs::write(&self.path, token.trim())
            .with_context(|| format!("writing {}", self.path.display()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Err(e) =
                std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o600))
            {
                warn!("could not restrict permissions on {}: {e}", self.path.display());
            }
        }
        Ok(())
    }

    pub fn remove(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("removing {}", self.path.display())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let file = TokenFile::new(dir.path().join("nested").join("token.txt"));
        assert_eq!(file.load().unwrap(), None);

        file.save("ghp_abc\n").unwrap();
        assert_eq!(file.load().unwrap().as_deref(), Some("ghp_abc"));

        file.remove().unwrap();
        assert_eq!(file.load().unwrap(), None);
        file.remove().unwrap();
    }

    #[test]
    fn blank_token_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token.txt");
        std::fs::write(&path, "  \n").unwrap();
        assert_eq!(TokenFile::new(path).load().unwrap(), None);
    }

    #[cfg(unix)]
    #[test]
    fn saved_token_is_private() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let file = TokenFile::new(dir.path().join("token.txt"));
        file.save("secret").unwrap();
        let mode = std::fs::metadata(file.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn empty_handle_has_no_session() {
        let handle = SessionHandle::new();
        assert!(handle.current().is_none());
        assert!(!handle.invalidate());
    }
}
