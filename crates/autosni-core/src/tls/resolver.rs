// Hostname → certificate identity lookup

use std::{collections::HashMap, sync::Arc};

use log::{debug, trace};

use crate::{
    config::{Config, DomainEntry, normalize_hostname},
    error::ServerError,
};

use super::Identity;

/// Maps a requested hostname to the identity whose certificate it should receive
#[derive(Debug, Clone)]
pub enum DomainResolver {
    /// Every hostname is its own identity
    Open,

    /// Only configured hostnames resolve, bundle members share their bundle's identity
    Allowlist(HashMap<String, Arc<Identity>>),
}

impl DomainResolver {
    pub fn open() -> Self {
        DomainResolver::Open
    }

    /// Builds an allowlist resolver, rejecting hostnames that appear in more than one entry
    pub fn from_entries(entries: &[DomainEntry]) -> Result<Self, ServerError> {
        let mut index: HashMap<String, Arc<Identity>> = HashMap::new();

        for entry in entries {
            let identity = Arc::new(entry.to_identity()?);

            for host in identity.hostnames() {
                if index.contains_key(host) {
                    return Err(ServerError::config(
                        "domains",
                        format!("`{host}` is listed more than once"),
                    ));
                }

                trace!("Indexing `{host}` under identity `{identity}`");
                index.insert(host.to_string(), Arc::clone(&identity));
            }
        }

        Ok(DomainResolver::Allowlist(index))
    }

    pub fn from_config(config: &Config) -> Result<Self, ServerError> {
        if config.domains.is_empty() {
            if config.allow_any_domain {
                debug!("No domains configured, accepting any hostname");
                return Ok(DomainResolver::Open);
            }

            return Err(ServerError::config(
                "domains",
                "At least one domain is required unless `allow_any_domain` is enabled",
            ));
        }

        Self::from_entries(&config.domains)
    }

    /// Resolves `hostname` (from SNI or a Host header) to its identity
    pub fn resolve(&self, hostname: &str) -> Result<Arc<Identity>, ServerError> {
        let host = normalize_hostname(hostname);

        match self {
            DomainResolver::Open if !host.is_empty() => Ok(Arc::new(Identity::single(host))),
            DomainResolver::Open => Err(ServerError::DomainNotAllowed { host }),
            DomainResolver::Allowlist(index) => index
                .get(&host)
                .cloned()
                .ok_or(ServerError::DomainNotAllowed { host }),
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, DomainResolver::Open)
    }

    /// Every configured identity, once each
    pub fn identities(&self) -> Vec<Arc<Identity>> {
        match self {
            DomainResolver::Open => Vec::new(),
            DomainResolver::Allowlist(index) => {
                let mut identities: Vec<Arc<Identity>> = Vec::new();
                for identity in index.values() {
                    if !identities.iter().any(|known| known == identity) {
                        identities.push(Arc::clone(identity));
                    }
                }
                identities.sort_by(|a, b| a.primary().cmp(b.primary()));
                identities
            }
        }
    }
}
