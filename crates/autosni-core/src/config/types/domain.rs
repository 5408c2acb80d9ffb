use serde::{Deserialize, Serialize};

use crate::{error::ServerError, tls::Identity};

/// A single entry of the `domains` list
///
/// A plain string is a hostname that gets its own certificate. A list of strings is a bundle:
/// every member is issued on the same certificate and the first member is the primary name.
///
/// ```toml
/// domains = ["example.com", ["shop.example.com", "www.shop.example.com"]]
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DomainEntry {
    Host(String),
    Bundle(Vec<String>),
}

impl DomainEntry {
    /// Builds the certificate identity described by this entry
    pub fn to_identity(&self) -> Result<Identity, ServerError> {
        match self {
            DomainEntry::Host(host) => Ok(Identity::single(validate_hostname(host)?)),
            DomainEntry::Bundle(members) => {
                let mut hosts = members
                    .iter()
                    .map(|host| validate_hostname(host))
                    .collect::<Result<Vec<_>, _>>()?;

                if hosts.is_empty() {
                    return Err(ServerError::config(
                        "domains",
                        "A domain bundle must contain at least one hostname",
                    ));
                }

                let primary = hosts.remove(0);
                Ok(Identity::bundle(primary, hosts))
            }
        }
    }
}

impl From<&str> for DomainEntry {
    fn from(host: &str) -> Self {
        DomainEntry::Host(host.to_string())
    }
}

impl From<Vec<&str>> for DomainEntry {
    fn from(members: Vec<&str>) -> Self {
        DomainEntry::Bundle(members.into_iter().map(str::to_string).collect())
    }
}

const MAX_HOSTNAME_LENGTH: usize = 253;
const MAX_LABEL_LENGTH: usize = 63;

/// Lowercases a hostname and strips a trailing root dot
pub fn normalize_hostname(host: &str) -> String {
    host.trim().trim_end_matches('.').to_ascii_lowercase()
}

/// Normalizes a configured hostname and rejects values that can never match an SNI name
pub fn validate_hostname(host: &str) -> Result<String, ServerError> {
    let normalized = normalize_hostname(host);

    if normalized.is_empty() {
        return Err(ServerError::config("domains", "Hostnames cannot be empty"));
    }

    // Labels of letters, digits and inner hyphens. Ports, empty labels and IP literals never
    // arrive as SNI names.
    let is_valid = normalized.len() <= MAX_HOSTNAME_LENGTH
        && normalized.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= MAX_LABEL_LENGTH
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        });

    if !is_valid {
        return Err(ServerError::config(
            "domains",
            format!("`{host}` is not a valid hostname"),
        ));
    }

    Ok(normalized)
}
