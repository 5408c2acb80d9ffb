// Locally generated fallback certificates

use std::time::Duration;

use log::debug;
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use thiserror::Error;
use time::OffsetDateTime;

const DEFAULT_VALIDITY: Duration = Duration::from_secs(90 * 24 * 60 * 60);

/// A PEM encoded key and single-certificate chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedKeyPair {
    pub private_key_pem: Vec<u8>,
    pub certificate_chain_pem: Vec<u8>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct GeneratorError(pub String);

impl From<rcgen::Error> for GeneratorError {
    fn from(error: rcgen::Error) -> Self {
        GeneratorError(error.to_string())
    }
}

/// Produces a self-signed certificate when automated issuance is not available
pub trait SelfSignedGenerator: Send + Sync {
    fn generate(&self, common_name: &str) -> Result<GeneratedKeyPair, GeneratorError>;
}

/// ECDSA P-256 self-signed certificates built with rcgen
#[derive(Debug, Clone)]
pub struct RcgenGenerator {
    validity: Duration,
}

impl Default for RcgenGenerator {
    fn default() -> Self {
        RcgenGenerator {
            validity: DEFAULT_VALIDITY,
        }
    }
}

impl RcgenGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_validity(validity: Duration) -> Self {
        RcgenGenerator { validity }
    }

    pub fn validity(&self) -> Duration {
        self.validity
    }
}

impl SelfSignedGenerator for RcgenGenerator {
    fn generate(&self, common_name: &str) -> Result<GeneratedKeyPair, GeneratorError> {
        if common_name.is_empty() {
            return Err(GeneratorError("common name cannot be empty".to_string()));
        }

        let mut params = CertificateParams::new(vec![common_name.to_string()])?;
        params.distinguished_name = DistinguishedName::new();
        params
            .distinguished_name
            .push(DnType::CommonName, common_name.to_string());

        let validity = time::Duration::try_from(self.validity)
            .map_err(|e| GeneratorError(format!("invalid validity period: {e}")))?;
        let now = OffsetDateTime::now_utc();
        // Backdated a day to tolerate client clock skew
        params.not_before = now - time::Duration::days(1);
        params.not_after = now + validity;

        let key_pair = KeyPair::generate()?;
        let certificate = params.self_signed(&key_pair)?;

        debug!("Generated self-signed certificate for `{common_name}`");

        Ok(GeneratedKeyPair {
            private_key_pem: key_pair.serialize_pem().into_bytes(),
            certificate_chain_pem: certificate.pem().into_bytes(),
        })
    }
}
