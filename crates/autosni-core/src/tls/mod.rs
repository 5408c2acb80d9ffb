// Certificate selection and on-demand provisioning for the secure listener

pub mod acceptor;
pub mod acme;
pub mod authority;
pub mod cache;
pub mod credential;
pub mod identity;
pub mod pipeline;
pub mod resolver;
pub mod self_signed;
pub mod store;

use thiserror::Error;

pub use acceptor::CertificateSelector;
pub use acme::AcmeAuthority;
pub use authority::{CertificateAuthority, IssuanceError, IssuanceRequest, IssuedCertificate};
pub use cache::{CertificateCache, Provisioner};
pub use credential::{Credential, Origin};
pub use identity::{Fingerprint, Identity};
pub use pipeline::{PipelineSettings, ProvisionOutcome, ProvisioningPipeline};
pub use resolver::DomainResolver;
pub use self_signed::{GeneratedKeyPair, GeneratorError, RcgenGenerator, SelfSignedGenerator};
pub use store::CredentialStorage;

/// Raised when no usable credential could be produced for an identity
///
/// Every waiter on the same provisioning slot receives a clone of the same error.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProvisionError {
    #[error("Failed to generate a self-signed certificate for `{host}`: {message}")]
    SelfSigned { host: String, message: String },

    #[error("Unusable credential for `{host}`: {message}")]
    InvalidCredential { host: String, message: String },

    #[error("Provisioning for `{host}` was aborted: {message}")]
    Aborted { host: String, message: String },
}

/// Install the aws-lc-rs provider as the process default, if nothing else has been installed yet
pub fn install_default_crypto_provider() {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}
