use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::error::AppResult;
use crate::models::Session;

/// JSON file holding the last session so a restart stays signed in.
#[derive(Debug, Clone)]
pub struct SessionFile {
    path: PathBuf,
}

impl SessionFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A missing file means "no session"; a corrupt one is logged and ignored.
    pub async fn load(&self) -> AppResult<Option<Session>> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_str(&raw) {
            Ok(session) => Ok(Some(session)),
            Err(e) => {
                tracing::warn!("Ignoring corrupt session file {}: {}", self.path.display(), e);
                Ok(None)
            }
        }
    }

    pub async fn save(&self, session: &Session) -> AppResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let json = serde_json::to_vec_pretty(session)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    pub async fn clear(&self) -> AppResult<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{SessionIdentity, UserId, UserMetadata};

    fn session() -> Session {
        Session {
            access_token: "access".to_string(),
            refresh_token: "refresh".to_string(),
            expires_at: Some(chrono::Utc::now()),
            user: SessionIdentity {
                id: UserId::new("u1"),
                email: "a@x.com".to_string(),
                metadata: UserMetadata {
                    full_name: Some("Kim".to_string()),
                    ..UserMetadata::default()
                },
            },
        }
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let file = SessionFile::new(dir.path().join("nested/session.json"));

        let saved = session();
        assert!(file.load().await.unwrap().is_none());
        file.save(&saved).await.unwrap();
        assert_eq!(file.load().await.unwrap(), Some(saved));

        file.clear().await.unwrap();
        assert!(file.load().await.unwrap().is_none());
        file.clear().await.unwrap();
    }

    #[tokio::test]
    async fn test_corrupt_file_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        tokio::fs::write(&path, b"{not json").await.unwrap();

        let file = SessionFile::new(&path);
        assert!(file.load().await.unwrap().is_none());
    }
}
