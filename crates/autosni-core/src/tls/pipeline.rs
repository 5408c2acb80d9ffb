// Restore, issue or generate a credential for one identity

use std::{
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::Utc;
use log::{debug, error, info, warn};

use crate::{
    challenge::{ChallengeStore, ChallengeStoreError},
    config::{Config, Environment},
    error::ServerError,
};

use super::{
    CertificateAuthority, Credential, CredentialStorage, Fingerprint, Identity, IssuanceError,
    IssuanceRequest, Origin, ProvisionError, Provisioner, SelfSignedGenerator,
};

/// The subset of the configuration the pipeline runs on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineSettings {
    pub contact_email: String,
    pub agreed_to_terms: bool,
    pub environment: Environment,
    pub issuance_timeout: Duration,
    pub automated_expiry: Duration,
    pub self_signed_expiry: Duration,
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Self {
        PipelineSettings {
            contact_email: config.email.clone().unwrap_or_default(),
            agreed_to_terms: config.agree_to_terms,
            environment: config.environment(),
            issuance_timeout: config.issuance_timeout(),
            automated_expiry: config.automated_expiry(),
            self_signed_expiry: config.self_signed_expiry(),
        }
    }

    pub fn expiry(&self, origin: Origin) -> Duration {
        match origin {
            Origin::Automated => self.automated_expiry,
            Origin::SelfSigned => self.self_signed_expiry,
        }
    }
}

/// How many provisioning runs ended in each branch
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ProvisionOutcome {
    pub restored: u64,
    pub automated: u64,
    pub self_signed: u64,
    pub failed: u64,
}

#[derive(Debug, Default)]
struct OutcomeCounters {
    restored: AtomicU64,
    automated: AtomicU64,
    self_signed: AtomicU64,
    failed: AtomicU64,
}

/// Produces a credential for an identity: a persisted one if still usable, otherwise one from
/// the certificate authority, otherwise a self-signed one
pub struct ProvisioningPipeline {
    authority: Arc<dyn CertificateAuthority>,
    generator: Arc<dyn SelfSignedGenerator>,
    challenges: Arc<dyn ChallengeStore>,
    storage: Option<CredentialStorage>,
    settings: PipelineSettings,
    counters: OutcomeCounters,
}

impl ProvisioningPipeline {
    pub fn new(
        authority: Arc<dyn CertificateAuthority>,
        generator: Arc<dyn SelfSignedGenerator>,
        challenges: Arc<dyn ChallengeStore>,
        settings: PipelineSettings,
    ) -> Self {
        ProvisioningPipeline {
            authority,
            generator,
            challenges,
            storage: None,
            settings,
            counters: OutcomeCounters::default(),
        }
    }

    /// Persist issued credentials and reuse them across restarts
    pub fn with_storage(mut self, storage: CredentialStorage) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub fn outcomes(&self) -> ProvisionOutcome {
        ProvisionOutcome {
            restored: self.counters.restored.load(Ordering::Relaxed),
            automated: self.counters.automated.load(Ordering::Relaxed),
            self_signed: self.counters.self_signed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }

    /// Run the pipeline once for `identity`
    ///
    /// Only fails when even the self-signed generator fails. Issuance failures are logged and
    /// absorbed by the fallback.
    pub async fn run(&self, identity: &Identity) -> Result<Credential, ProvisionError> {
        let fingerprint = identity.fingerprint(self.settings.environment);

        if let Some(credential) = self.restore(identity, &fingerprint).await {
            self.counters.restored.fetch_add(1, Ordering::Relaxed);
            info!("Restored persisted certificate for `{identity}`");
            return Ok(credential);
        }

        if let Some(credential) = self.issue(identity, &fingerprint).await {
            self.counters.automated.fetch_add(1, Ordering::Relaxed);
            info!("Obtained certificate for `{identity}` from the certificate authority");
            self.persist(&credential).await;
            return Ok(credential);
        }

        match self.generate(identity, fingerprint) {
            Ok(credential) => {
                self.counters.self_signed.fetch_add(1, Ordering::Relaxed);
                info!("Serving a self-signed certificate for `{identity}`");
                Ok(credential)
            }
            Err(e) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                error!("No certificate could be produced for `{identity}`: {e}");
                Err(e)
            }
        }
    }

    /// Load a persisted automated credential that is neither expired nor outdated
    async fn restore(&self, identity: &Identity, fingerprint: &Fingerprint) -> Option<Credential> {
        let storage = self.storage.as_ref()?;

        let owned = identity.clone();
        let stored = match on_disk(storage, move |storage| storage.load(&owned)).await {
            Ok(Some(stored)) => stored,
            Ok(None) => return None,
            Err(e) => {
                warn!("Ignoring persisted certificate for `{identity}`: {e}");
                return None;
            }
        };

        let metadata = &stored.metadata;
        let discard_reason = if metadata.origin != Origin::Automated {
            Some("it is not from the certificate authority".to_string())
        } else if &metadata.fingerprint != fingerprint {
            Some("the domain configuration or environment changed".to_string())
        } else {
            let expires_at = chrono::Duration::from_std(self.settings.expiry(metadata.origin))
                .ok()
                .and_then(|ttl| metadata.issued_at.checked_add_signed(ttl));

            match expires_at {
                Some(expires_at) if expires_at > Utc::now() => None,
                _ => Some(format!("it was issued at {} and has expired", metadata.issued_at)),
            }
        };

        if let Some(reason) = discard_reason {
            info!("Discarding persisted certificate for `{identity}` because {reason}");
            if let Err(e) = remove_stored(storage, identity).await {
                warn!("Failed to remove persisted certificate for `{identity}`: {e}");
            }
            return None;
        }

        match Credential::new(
            identity.clone(),
            stored.private_key_pem,
            stored.certificate_chain_pem,
            metadata.issued_at,
            metadata.origin,
            fingerprint.clone(),
        ) {
            Ok(credential) => Some(credential),
            Err(e) => {
                warn!("Discarding unreadable persisted certificate for `{identity}`: {e}");
                let _ = remove_stored(storage, identity).await;
                None
            }
        }
    }

    /// Ask the certificate authority for a credential, logging why when none comes back
    async fn issue(&self, identity: &Identity, fingerprint: &Fingerprint) -> Option<Credential> {
        let challenges = Arc::new(TrackedChallenges::new(Arc::clone(&self.challenges)));
        let request = IssuanceRequest {
            hostnames: identity.hostnames().map(str::to_string).collect(),
            contact_email: self.settings.contact_email.clone(),
            agreed_to_terms: self.settings.agreed_to_terms,
            environment: self.settings.environment,
            challenges: Arc::clone(&challenges) as Arc<dyn ChallengeStore>,
        };

        debug!("Requesting automated issuance for `{identity}`");
        let timeout = self.settings.issuance_timeout;
        let result = match tokio::time::timeout(timeout, self.authority.issue(&request)).await {
            Ok(result) => result,
            Err(_) => Err(IssuanceError::Timeout(timeout)),
        };

        challenges.remove_leftovers().await;

        let issued = match result {
            Ok(issued) => issued,
            Err(e) => {
                warn!("Automated issuance failed for `{identity}`, falling back to self-signed: {e}");
                return None;
            }
        };

        match Credential::new(
            identity.clone(),
            issued.private_key_pem,
            issued.certificate_chain_pem,
            Utc::now(),
            Origin::Automated,
            fingerprint.clone(),
        ) {
            Ok(credential) => Some(credential),
            Err(e) => {
                warn!("Certificate authority returned an unusable certificate for `{identity}`: {e}");
                None
            }
        }
    }

    fn generate(
        &self,
        identity: &Identity,
        fingerprint: Fingerprint,
    ) -> Result<Credential, ProvisionError> {
        let generated = self.generator.generate(identity.primary()).map_err(|e| {
            ProvisionError::SelfSigned {
                host: identity.primary().to_string(),
                message: e.to_string(),
            }
        })?;

        Credential::new(
            identity.clone(),
            generated.private_key_pem,
            generated.certificate_chain_pem,
            Utc::now(),
            Origin::SelfSigned,
            fingerprint,
        )
    }

    async fn persist(&self, credential: &Credential) {
        let Some(storage) = self.storage.as_ref() else {
            return;
        };

        let owned = credential.clone();
        if let Err(e) = on_disk(storage, move |storage| storage.save(&owned)).await {
            warn!(
                "Failed to persist certificate for `{}`: {e}",
                credential.identity()
            );
        }
    }
}

/// Run a blocking storage call on the blocking thread pool
async fn on_disk<T, F>(storage: &CredentialStorage, call: F) -> Result<T, ServerError>
where
    T: Send + 'static,
    F: FnOnce(&CredentialStorage) -> Result<T, ServerError> + Send + 'static,
{
    let storage = storage.clone();
    tokio::task::spawn_blocking(move || call(&storage))
        .await
        .map_err(|e| ServerError::IOError(std::io::Error::other(e)))?
}

async fn remove_stored(storage: &CredentialStorage, identity: &Identity) -> Result<(), ServerError> {
    let identity = identity.clone();
    on_disk(storage, move |storage| storage.remove(&identity)).await
}

#[async_trait]
impl Provisioner for ProvisioningPipeline {
    async fn provision(&self, identity: &Identity) -> Result<Credential, ProvisionError> {
        self.run(identity).await
    }

    fn fingerprint(&self, identity: &Identity) -> Fingerprint {
        identity.fingerprint(self.settings.environment)
    }

    fn expiry(&self, origin: Origin) -> Duration {
        self.settings.expiry(origin)
    }
}

/// Records every token written during one issuance so none outlives it
struct TrackedChallenges {
    store: Arc<dyn ChallengeStore>,
    written: Mutex<Vec<String>>,
}

impl TrackedChallenges {
    fn new(store: Arc<dyn ChallengeStore>) -> Self {
        TrackedChallenges {
            store,
            written: Mutex::new(Vec::new()),
        }
    }

    fn written(&self) -> std::sync::MutexGuard<'_, Vec<String>> {
        self.written.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn remove_leftovers(&self) {
        let leftovers = std::mem::take(&mut *self.written());

        for token in leftovers {
            if let Err(e) = self.store.remove(&token).await {
                warn!("Failed to remove challenge token {token}: {e}");
            }
        }
    }
}

#[async_trait]
impl ChallengeStore for TrackedChallenges {
    async fn write(&self, token: &str, value: &str) -> Result<(), ChallengeStoreError> {
        self.written().push(token.to_string());
        self.store.write(token, value).await
    }

    async fn remove(&self, token: &str) -> Result<(), ChallengeStoreError> {
        self.store.remove(token).await?;
        self.written().retain(|written| written != token);
        Ok(())
    }

    async fn read(&self, token: &str) -> Result<Option<String>, ChallengeStoreError> {
        self.store.read(token).await
    }
}
