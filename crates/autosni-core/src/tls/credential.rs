// Issued key material and its conversion into something rustls can serve

use std::{fmt::Display, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::sign::CertifiedKey;
use rustls_pemfile::{certs, private_key};
use serde::{Deserialize, Serialize};

use super::{Fingerprint, Identity, ProvisionError};

/// Where a credential came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Origin {
    /// Issued by the certificate authority
    Automated,
    /// Generated locally after automated issuance failed
    SelfSigned,
}

impl Display for Origin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Origin::Automated => write!(f, "automated"),
            Origin::SelfSigned => write!(f, "self-signed"),
        }
    }
}

/// A complete private key and certificate chain for one identity
///
/// A `Credential` can only be built from a non-empty key and chain that rustls accepts, so a
/// partially written or corrupt credential never reaches the cache.
#[derive(Debug, Clone)]
pub struct Credential {
    identity: Identity,
    private_key_pem: Vec<u8>,
    certificate_chain_pem: Vec<u8>,
    issued_at: DateTime<Utc>,
    origin: Origin,
    fingerprint: Fingerprint,
    certified_key: Arc<CertifiedKey>,
}

impl Credential {
    pub fn new(
        identity: Identity,
        private_key_pem: Vec<u8>,
        certificate_chain_pem: Vec<u8>,
        issued_at: DateTime<Utc>,
        origin: Origin,
        fingerprint: Fingerprint,
    ) -> Result<Self, ProvisionError> {
        let certified_key =
            load_certified_key(identity.primary(), &certificate_chain_pem, &private_key_pem)?;

        Ok(Credential {
            identity,
            private_key_pem,
            certificate_chain_pem,
            issued_at,
            origin,
            fingerprint,
            certified_key,
        })
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn private_key_pem(&self) -> &[u8] {
        &self.private_key_pem
    }

    pub fn certificate_chain_pem(&self) -> &[u8] {
        &self.certificate_chain_pem
    }

    pub fn issued_at(&self) -> DateTime<Utc> {
        self.issued_at
    }

    pub fn origin(&self) -> Origin {
        self.origin
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    /// The parsed chain and signing key handed to rustls during the handshake
    pub fn certified_key(&self) -> Arc<CertifiedKey> {
        Arc::clone(&self.certified_key)
    }

    /// The instant after which this credential must not be served
    pub fn expires_at(&self, ttl: Duration) -> DateTime<Utc> {
        chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| self.issued_at.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

/// Parse a PEM certificate chain and private key into a rustls `CertifiedKey`
pub fn load_certified_key(
    host: &str,
    chain_pem: &[u8],
    key_pem: &[u8],
) -> Result<Arc<CertifiedKey>, ProvisionError> {
    let invalid = |message: String| ProvisionError::InvalidCredential {
        host: host.to_string(),
        message,
    };

    if chain_pem.is_empty() || key_pem.is_empty() {
        return Err(invalid("private key and certificate chain must both be present".to_string()));
    }

    let mut chain_reader = chain_pem;
    let chain: Vec<CertificateDer<'static>> = certs(&mut chain_reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| invalid(format!("Failed to parse certificate chain: {e}")))?;

    if chain.is_empty() {
        return Err(invalid("No certificate found in chain".to_string()));
    }

    let mut key_reader = key_pem;
    let key: PrivateKeyDer<'static> = private_key(&mut key_reader)
        .map_err(|e| invalid(format!("Failed to parse private key: {e}")))?
        .ok_or_else(|| invalid("No private key found".to_string()))?;

    let signing_key = rustls::crypto::aws_lc_rs::sign::any_supported_type(&key)
        .map_err(|e| invalid(format!("Unsupported private key: {e}")))?;

    Ok(Arc::new(CertifiedKey::new(chain, signing_key)))
}
