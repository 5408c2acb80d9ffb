use std::path::{Path, PathBuf};

use async_trait::async_trait;
use log::{debug, trace};

use super::{ChallengeStore, ChallengeStoreError, validate_token};

/// Challenge tokens stored as files under `<webroot>/.well-known/acme-challenge/`
pub struct FileChallengeStore {
    path: PathBuf,
}

impl FileChallengeStore {
    /// Creates the challenge directory under `webroot` if it does not exist yet
    pub fn new(webroot: &Path) -> Result<Self, ChallengeStoreError> {
        let path = webroot.join(".well-known").join("acme-challenge");

        if !path.exists() {
            std::fs::create_dir_all(&path).map_err(|e| {
                ChallengeStoreError::GenericError(format!(
                    "Failed to create challenge directory `{}`: {e}",
                    path.display()
                ))
            })?;
        }

        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn token_path(&self, token: &str) -> Result<PathBuf, ChallengeStoreError> {
        validate_token(token)?;
        Ok(self.path.join(token))
    }
}

#[async_trait]
impl ChallengeStore for FileChallengeStore {
    async fn write(&self, token: &str, value: &str) -> Result<(), ChallengeStoreError> {
        let path = self.token_path(token)?;
        debug!("Writing challenge token to {}", path.display());

        tokio::fs::write(&path, value)
            .await
            .map_err(|e| ChallengeStoreError::WriteError {
                token: token.to_string(),
                message: e.to_string(),
            })
    }

    async fn remove(&self, token: &str) -> Result<(), ChallengeStoreError> {
        let path = self.token_path(token)?;

        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                debug!("Removed challenge token {}", path.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                trace!("Challenge token {token} was already absent");
                Ok(())
            }
            Err(e) => Err(ChallengeStoreError::RemoveError {
                token: token.to_string(),
                message: e.to_string(),
            }),
        }
    }

    async fn read(&self, token: &str) -> Result<Option<String>, ChallengeStoreError> {
        let path = self.token_path(token)?;

        match tokio::fs::read_to_string(&path).await {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ChallengeStoreError::ReadError {
                token: token.to_string(),
                message: e.to_string(),
            }),
        }
    }
}
