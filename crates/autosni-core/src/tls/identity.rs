use std::fmt::Display;

use serde::{Deserialize, Serialize};

use crate::config::Environment;

/// The set of hostnames a single certificate is issued for
///
/// Identities are built once from the configuration and never change afterwards, which makes
/// them usable as cache keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity {
    primary: String,
    aliases: Vec<String>,
}

impl Identity {
    /// An identity covering exactly one hostname
    pub fn single(host: impl Into<String>) -> Self {
        Identity {
            primary: host.into(),
            aliases: Vec::new(),
        }
    }

    /// An identity covering a primary hostname and the aliases co-issued with it
    pub fn bundle(primary: impl Into<String>, aliases: Vec<String>) -> Self {
        let primary = primary.into();
        let mut deduped: Vec<String> = Vec::with_capacity(aliases.len());
        for alias in aliases {
            if alias != primary && !deduped.contains(&alias) {
                deduped.push(alias);
            }
        }

        Identity {
            primary,
            aliases: deduped,
        }
    }

    pub fn primary(&self) -> &str {
        &self.primary
    }

    pub fn aliases(&self) -> &[String] {
        &self.aliases
    }

    /// The primary hostname followed by every alias
    pub fn hostnames(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.primary.as_str()).chain(self.aliases.iter().map(String::as_str))
    }

    /// What a credential issued for this identity in `environment` must have been issued for
    pub fn fingerprint(&self, environment: Environment) -> Fingerprint {
        let mut hostnames: Vec<String> = self.hostnames().map(str::to_string).collect();
        hostnames.sort();

        Fingerprint {
            hostnames,
            environment,
        }
    }
}

impl Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.aliases.is_empty() {
            write!(f, "{}", self.primary)
        } else {
            write!(f, "{} (+{})", self.primary, self.aliases.join(", "))
        }
    }
}

/// The issuing conditions recorded alongside a credential
///
/// A cached or persisted credential whose fingerprint differs from the identity's current one
/// (bundle membership changed, or the CA environment was switched) is discarded.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint {
    pub hostnames: Vec<String>,
    pub environment: Environment,
}
