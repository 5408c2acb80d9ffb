// Credential persistence under `<config_directory>/live/<primary hostname>/`

use std::{
    fs,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use log::{debug, trace};
use serde::{Deserialize, Serialize};

use crate::error::ServerError;

use super::{Credential, Fingerprint, Identity, Origin};

const CERTIFICATE_FILE: &str = "cert.pem";
const KEY_FILE: &str = "key.pem";
const METADATA_FILE: &str = "meta.json";

/// Everything recorded next to the PEM files
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMetadata {
    pub issued_at: DateTime<Utc>,
    pub origin: Origin,
    pub fingerprint: Fingerprint,
}

/// A credential read back from disk, not yet checked for age or drift
#[derive(Debug, Clone)]
pub struct StoredCredential {
    pub private_key_pem: Vec<u8>,
    pub certificate_chain_pem: Vec<u8>,
    pub metadata: StoredMetadata,
}

/// Reads and writes credentials on disk, one directory per identity
#[derive(Debug, Clone)]
pub struct CredentialStorage {
    root: PathBuf,
}

/// Validate that a hostname is safe to use as a directory name
pub fn validate_directory_name(name: &str) -> Result<(), ServerError> {
    if name.contains("..") || name.contains('/') || name.contains('\\') {
        return Err(ServerError::TlsInitializationFailed(format!(
            "Invalid certificate directory name `{name}`: contains path traversal characters"
        )));
    }

    if name.trim().is_empty() {
        return Err(ServerError::TlsInitializationFailed(
            "Invalid certificate directory name: empty or whitespace-only".to_string(),
        ));
    }

    Ok(())
}

/// Helper to get a safe display path for error messages (doesn't leak full absolute paths)
fn safe_display_path(full_path: &Path) -> String {
    if let Ok(cwd) = std::env::current_dir() {
        if let Ok(relative) = full_path.strip_prefix(&cwd) {
            return relative.display().to_string();
        }
    }

    full_path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| full_path.display().to_string())
}

/// Write `contents` next to `path` and move it into place
fn write_atomic(path: &Path, contents: &[u8], private: bool) -> Result<(), ServerError> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let temp_path = path.with_file_name(format!(".{file_name}.tmp"));

    let persist_error = |message: String| ServerError::FailedToPersistCredential {
        path: safe_display_path(path),
        message,
    };

    fs::write(&temp_path, contents).map_err(|e| persist_error(format!("write failed: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;

        if private {
            let mut perms = fs::metadata(&temp_path)
                .map_err(|e| persist_error(format!("failed to read permissions: {e}")))?
                .permissions();
            perms.set_mode(0o600); // Owner read/write only
            fs::set_permissions(&temp_path, perms)
                .map_err(|e| persist_error(format!("failed to set permissions: {e}")))?;
        }
    }

    #[cfg(not(unix))]
    {
        if private {
            log::warn!(
                "Private key permissions are not restricted on this platform, please restrict access to {}",
                safe_display_path(path)
            );
        }
    }

    fs::rename(&temp_path, path).map_err(|e| {
        let _ = fs::remove_file(&temp_path);
        persist_error(format!("rename failed: {e}"))
    })
}

impl CredentialStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        CredentialStorage { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The directory holding the credential of `identity`
    pub fn directory(&self, identity: &Identity) -> Result<PathBuf, ServerError> {
        validate_directory_name(identity.primary())?;
        Ok(self.root.join(identity.primary()))
    }

    fn create_directory(&self, identity: &Identity) -> Result<PathBuf, ServerError> {
        let directory = self.directory(identity)?;

        fs::create_dir_all(&directory).map_err(|e| {
            ServerError::CertificateDirectoryCreationFailed {
                path: safe_display_path(&directory),
                message: e.to_string(),
            }
        })?;

        Ok(directory)
    }

    /// Persist a credential, the metadata file is written last so a partial save reads as absent
    pub fn save(&self, credential: &Credential) -> Result<(), ServerError> {
        let directory = self.create_directory(credential.identity())?;

        let metadata = StoredMetadata {
            issued_at: credential.issued_at(),
            origin: credential.origin(),
            fingerprint: credential.fingerprint().clone(),
        };
        let metadata_json = serde_json::to_vec_pretty(&metadata).map_err(|e| {
            ServerError::FailedToPersistCredential {
                path: safe_display_path(&directory.join(METADATA_FILE)),
                message: e.to_string(),
            }
        })?;

        // Drop the old metadata first so a crash mid-save never pairs new PEMs with old metadata
        let metadata_path = directory.join(METADATA_FILE);
        if metadata_path.exists() {
            let _ = fs::remove_file(&metadata_path);
        }

        write_atomic(
            &directory.join(CERTIFICATE_FILE),
            credential.certificate_chain_pem(),
            false,
        )?;
        write_atomic(&directory.join(KEY_FILE), credential.private_key_pem(), true)?;
        write_atomic(&metadata_path, &metadata_json, false)?;

        debug!(
            "Persisted {} credential for `{}` to {}",
            credential.origin(),
            credential.identity(),
            safe_display_path(&directory)
        );

        Ok(())
    }

    /// Load the persisted credential of `identity`, `None` when any of its files is missing
    pub fn load(&self, identity: &Identity) -> Result<Option<StoredCredential>, ServerError> {
        let directory = self.directory(identity)?;
        let certificate_path = directory.join(CERTIFICATE_FILE);
        let key_path = directory.join(KEY_FILE);
        let metadata_path = directory.join(METADATA_FILE);

        if !certificate_path.exists() || !key_path.exists() || !metadata_path.exists() {
            trace!("No persisted credential for `{identity}`");
            return Ok(None);
        }

        let read = |path: &Path| {
            fs::read(path).map_err(|e| ServerError::InvalidStoredCredential {
                path: safe_display_path(path),
                message: e.to_string(),
            })
        };

        let certificate_chain_pem = read(&certificate_path)?;
        let private_key_pem = read(&key_path)?;
        let metadata: StoredMetadata = serde_json::from_slice(&read(&metadata_path)?)
            .map_err(|e| ServerError::InvalidStoredCredential {
                path: safe_display_path(&metadata_path),
                message: e.to_string(),
            })?;

        Ok(Some(StoredCredential {
            private_key_pem,
            certificate_chain_pem,
            metadata,
        }))
    }

    /// Delete the persisted credential of `identity`, a missing directory is not an error
    pub fn remove(&self, identity: &Identity) -> Result<(), ServerError> {
        let directory = self.directory(identity)?;

        match fs::remove_dir_all(&directory) {
            Ok(()) => {
                debug!("Removed persisted credential at {}", safe_display_path(&directory));
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ServerError::IOError(e)),
        }
    }
}
