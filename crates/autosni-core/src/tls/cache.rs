// Per-identity credential cache with single-flight provisioning and expiry timers

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError, Weak,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::future::{BoxFuture, FutureExt, Shared};
use log::{debug, trace, warn};
use tokio::task::JoinHandle;

use super::{Credential, Fingerprint, Identity, Origin, ProvisionError};

/// Produces credentials for the cache on a miss
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Produce a credential for `identity`; only an error when nothing at all could be produced
    async fn provision(&self, identity: &Identity) -> Result<Credential, ProvisionError>;

    /// The fingerprint a credential for `identity` must carry to be served
    fn fingerprint(&self, identity: &Identity) -> Fingerprint;

    /// How long a credential of the given origin may be served after its issue time
    fn expiry(&self, origin: Origin) -> Duration;
}

type PendingCredential = Shared<BoxFuture<'static, Result<Arc<Credential>, ProvisionError>>>;

struct Cached {
    credential: Arc<Credential>,
    generation: u64,
    expires_at: DateTime<Utc>,
    expiry: JoinHandle<()>,
}

impl Cached {
    fn is_servable(&self, fingerprint: &Fingerprint, now: DateTime<Utc>) -> bool {
        now < self.expires_at && self.credential.fingerprint() == fingerprint
    }
}

struct Slot {
    id: u64,
    pending: PendingCredential,
}

#[derive(Default)]
struct Entry {
    cached: Option<Cached>,
    slot: Option<Slot>,
}

impl Entry {
    fn is_empty(&self) -> bool {
        self.cached.is_none() && self.slot.is_none()
    }
}

struct Inner {
    provisioner: Arc<dyn Provisioner>,
    entries: Mutex<HashMap<Identity, Entry>>,
    generation: AtomicU64,
}

/// Caches one credential per identity and makes sure at most one provisioning run per identity
/// is in flight
///
/// Concurrent callers for the same identity all await the same run. The run itself happens in a
/// spawned task, so it completes (and populates the cache) even if every caller goes away.
/// A failed run is never cached: the next caller starts a fresh one.
#[derive(Clone)]
pub struct CertificateCache {
    inner: Arc<Inner>,
}

impl CertificateCache {
    pub fn new(provisioner: Arc<dyn Provisioner>) -> Self {
        CertificateCache {
            inner: Arc::new(Inner {
                provisioner,
                entries: Mutex::new(HashMap::new()),
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Return the cached credential for `identity`, provisioning one if none can be served
    pub async fn get_or_provision(
        &self,
        identity: &Identity,
    ) -> Result<Arc<Credential>, ProvisionError> {
        let pending = {
            let fingerprint = self.inner.provisioner.fingerprint(identity);
            let now = Utc::now();

            let mut entries = self.inner.lock();
            let entry = entries.entry(identity.clone()).or_default();

            if let Some(cached) = entry
                .cached
                .as_ref()
                .filter(|cached| cached.is_servable(&fingerprint, now))
            {
                trace!("Serving cached credential for `{identity}`");
                return Ok(Arc::clone(&cached.credential));
            }

            if let Some(stale) = entry.cached.take() {
                debug!("Discarding expired or outdated credential for `{identity}`");
                stale.expiry.abort();
            }

            match &entry.slot {
                Some(slot) => {
                    trace!("Joining in-flight provisioning for `{identity}`");
                    slot.pending.clone()
                }
                None => {
                    let id = self.inner.next_generation();
                    let pending = self.inner.spawn_pipeline(identity.clone(), id);
                    entry.slot = Some(Slot {
                        id,
                        pending: pending.clone(),
                    });
                    pending
                }
            }
        };

        pending.await
    }

    /// Evict the credential of `identity` and cancel its expiry timer
    ///
    /// Returns whether a credential was cached. An in-flight provisioning run is left alone.
    pub fn invalidate(&self, identity: &Identity) -> bool {
        let mut entries = self.inner.lock();

        let Some(entry) = entries.get_mut(identity) else {
            return false;
        };

        let evicted = match entry.cached.take() {
            Some(cached) => {
                cached.expiry.abort();
                debug!("Invalidated credential for `{identity}`");
                true
            }
            None => false,
        };

        if entry.is_empty() {
            entries.remove(identity);
        }

        evicted
    }

    /// Number of cached credentials
    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .values()
            .filter(|entry| entry.cached.is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, identity: &Identity) -> bool {
        self.inner
            .lock()
            .get(identity)
            .is_some_and(|entry| entry.cached.is_some())
    }

    /// Whether a provisioning run for `identity` is currently in flight
    pub fn is_provisioning(&self, identity: &Identity) -> bool {
        self.inner
            .lock()
            .get(identity)
            .is_some_and(|entry| entry.slot.is_some())
    }
}

impl Inner {
    // The map is only ever touched synchronously, a panic elsewhere cannot leave it half-updated
    fn lock(&self) -> MutexGuard<'_, HashMap<Identity, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn spawn_pipeline(self: &Arc<Self>, identity: Identity, slot_id: u64) -> PendingCredential {
        let inner = Arc::clone(self);
        let host = identity.primary().to_string();

        let task = tokio::spawn(async move {
            let _slot = SlotGuard {
                inner: Arc::clone(&inner),
                identity: identity.clone(),
                slot_id,
            };

            match inner.provisioner.provision(&identity).await {
                Ok(credential) => Ok(inner.settle(&identity, credential)),
                Err(e) => {
                    warn!("Provisioning failed for `{identity}`: {e}");
                    Err(e)
                }
            }
        });

        async move {
            task.await.unwrap_or_else(|e| {
                Err(ProvisionError::Aborted {
                    host,
                    message: e.to_string(),
                })
            })
        }
        .boxed()
        .shared()
    }

    /// Insert a freshly provisioned credential
    ///
    /// Runs while the slot of `identity` is still open. A slot only opens once the cached entry
    /// is gone, so nothing newer can be cached here.
    fn settle(self: &Arc<Self>, identity: &Identity, credential: Credential) -> Arc<Credential> {
        let credential = Arc::new(credential);
        let expires_at = credential.expires_at(self.provisioner.expiry(credential.origin()));

        let mut entries = self.lock();
        let entry = entries.entry(identity.clone()).or_default();

        let generation = self.next_generation();
        let expiry = self.schedule_expiry(identity.clone(), generation, expires_at);

        debug!(
            "Caching {} credential for `{identity}` until {expires_at}",
            credential.origin()
        );

        let replaced = entry.cached.replace(Cached {
            credential: Arc::clone(&credential),
            generation,
            expires_at,
            expiry,
        });
        if let Some(previous) = replaced {
            previous.expiry.abort();
        }

        credential
    }

    fn schedule_expiry(
        self: &Arc<Self>,
        identity: Identity,
        generation: u64,
        expires_at: DateTime<Utc>,
    ) -> JoinHandle<()> {
        let inner: Weak<Inner> = Arc::downgrade(self);
        let delay = (expires_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            if let Some(inner) = inner.upgrade() {
                inner.evict(&identity, generation);
            }
        })
    }

    /// Remove the cached credential of `identity` if it is still the given generation
    fn evict(&self, identity: &Identity, generation: u64) {
        let mut entries = self.lock();

        let Some(entry) = entries.get_mut(identity) else {
            return;
        };

        if entry
            .cached
            .as_ref()
            .is_some_and(|cached| cached.generation == generation)
        {
            debug!("Credential for `{identity}` expired");
            entry.cached = None;
        }

        if entry.is_empty() {
            entries.remove(identity);
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let entries = self.entries.get_mut().unwrap_or_else(PoisonError::into_inner);
        for entry in entries.values() {
            if let Some(cached) = &entry.cached {
                cached.expiry.abort();
            }
        }
    }
}

/// Clears the provisioning slot once its run ends, however it ended
struct SlotGuard {
    inner: Arc<Inner>,
    identity: Identity,
    slot_id: u64,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        let mut entries = self.inner.lock();

        let Some(entry) = entries.get_mut(&self.identity) else {
            return;
        };

        if entry.slot.as_ref().is_some_and(|slot| slot.id == self.slot_id) {
            entry.slot = None;
        }

        if entry.is_empty() {
            entries.remove(&self.identity);
        }
    }
}
