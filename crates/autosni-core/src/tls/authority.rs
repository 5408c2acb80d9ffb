use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use thiserror::Error;

use crate::{challenge::ChallengeStore, config::Environment};

/// Everything a certificate authority needs to issue one certificate
#[derive(Clone)]
pub struct IssuanceRequest {
    /// Every hostname the certificate must cover, primary first
    pub hostnames: Vec<String>,
    pub contact_email: String,
    pub agreed_to_terms: bool,
    pub environment: Environment,
    /// Where HTTP-01 key authorizations are published for the plaintext listener to serve
    pub challenges: Arc<dyn ChallengeStore>,
}

impl std::fmt::Debug for IssuanceRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuanceRequest")
            .field("hostnames", &self.hostnames)
            .field("contact_email", &self.contact_email)
            .field("agreed_to_terms", &self.agreed_to_terms)
            .field("environment", &self.environment)
            .finish_non_exhaustive()
    }
}

/// PEM encoded output of a successful issuance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedCertificate {
    pub private_key_pem: Vec<u8>,
    pub certificate_chain_pem: Vec<u8>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IssuanceError {
    #[error("Could not reach the certificate authority: {0}")]
    Network(String),

    #[error("Rate limited by the certificate authority: {0}")]
    RateLimited(String),

    #[error("Domain validation failed: {0}")]
    ValidationFailed(String),

    #[error("Terms of service were not accepted: {0}")]
    TermsRejected(String),

    #[error("Issuance did not complete within {0:?}")]
    Timeout(Duration),
}

/// A source of publicly trusted certificates
#[async_trait]
pub trait CertificateAuthority: Send + Sync {
    /// Issue a certificate covering every hostname in `request`
    ///
    /// Implementations may write challenge tokens to `request.challenges` and should remove them
    /// once validation is over.
    async fn issue(&self, request: &IssuanceRequest) -> Result<IssuedCertificate, IssuanceError>;
}
