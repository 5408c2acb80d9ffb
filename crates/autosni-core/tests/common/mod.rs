// Helpers shared by the integration tests
#![allow(dead_code)]

use std::{
    net::SocketAddr,
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use autosni::{
    config::{Config, DomainEntry, Ports},
    tls::{
        CertificateAuthority, Credential, Fingerprint, GeneratedKeyPair, GeneratorError, Identity,
        IssuanceError, IssuanceRequest, IssuedCertificate, Origin, ProvisionError, Provisioner,
        RcgenGenerator, SelfSignedGenerator,
    },
};
use rustls::{
    ClientConfig, DigitallySignedStruct, SignatureScheme,
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    crypto::{CryptoProvider, verify_tls12_signature, verify_tls13_signature},
    pki_types::{CertificateDer, ServerName, UnixTime},
};
use tokio::net::TcpStream;
use tokio_rustls::{TlsConnector, client::TlsStream};

/// A config that passes validation, listening on ephemeral loopback ports
pub fn test_config(config_directory: &Path, domains: Vec<DomainEntry>) -> Config {
    Config {
        email: Some("admin@example.com".to_string()),
        agree_to_terms: true,
        domains,
        host: "127.0.0.1".parse().unwrap(),
        ports: Ports { http: 0, https: 0 },
        config_directory: config_directory.to_path_buf(),
        ..Default::default()
    }
}

/// A certificate authority that is never reachable
#[derive(Default)]
pub struct FailingAuthority {
    pub calls: AtomicUsize,
}

impl FailingAuthority {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CertificateAuthority for FailingAuthority {
    async fn issue(&self, _request: &IssuanceRequest) -> Result<IssuedCertificate, IssuanceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(IssuanceError::Network("connection refused".to_string()))
    }
}

/// A certificate authority that signs everything itself
#[derive(Default)]
pub struct LocalAuthority {
    pub calls: AtomicUsize,
}

impl LocalAuthority {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CertificateAuthority for LocalAuthority {
    async fn issue(&self, request: &IssuanceRequest) -> Result<IssuedCertificate, IssuanceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let generated = RcgenGenerator::new()
            .generate(&request.hostnames[0])
            .map_err(|e| IssuanceError::Network(e.to_string()))?;

        Ok(IssuedCertificate {
            private_key_pem: generated.private_key_pem,
            certificate_chain_pem: generated.certificate_chain_pem,
        })
    }
}

/// Publishes a challenge token and then fails without cleaning it up
pub struct LeakyAuthority;

#[async_trait]
impl CertificateAuthority for LeakyAuthority {
    async fn issue(&self, request: &IssuanceRequest) -> Result<IssuedCertificate, IssuanceError> {
        request
            .challenges
            .write("leaked-token", "leaked-token.thumbprint")
            .await
            .map_err(|e| IssuanceError::Network(e.to_string()))?;

        Err(IssuanceError::ValidationFailed("incorrect response".to_string()))
    }
}

/// Never answers
pub struct HangingAuthority;

#[async_trait]
impl CertificateAuthority for HangingAuthority {
    async fn issue(&self, _request: &IssuanceRequest) -> Result<IssuedCertificate, IssuanceError> {
        std::future::pending().await
    }
}

pub struct FailingGenerator;

impl SelfSignedGenerator for FailingGenerator {
    fn generate(&self, _common_name: &str) -> Result<GeneratedKeyPair, GeneratorError> {
        Err(GeneratorError("entropy source unavailable".to_string()))
    }
}

/// Produces self-signed credentials after a delay, counting every run
pub struct CountingProvisioner {
    pub calls: AtomicUsize,
    pub delay: Duration,
    pub ttl: Duration,
    pub fail_first: bool,
}

impl CountingProvisioner {
    pub fn new(delay: Duration, ttl: Duration) -> Self {
        CountingProvisioner {
            calls: AtomicUsize::new(0),
            delay,
            ttl,
            fail_first: false,
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Provisioner for CountingProvisioner {
    async fn provision(&self, identity: &Identity) -> Result<Credential, ProvisionError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;

        if self.fail_first && call == 0 {
            return Err(ProvisionError::SelfSigned {
                host: identity.primary().to_string(),
                message: "first attempt fails".to_string(),
            });
        }

        let generated = RcgenGenerator::new().generate(identity.primary()).unwrap();
        Credential::new(
            identity.clone(),
            generated.private_key_pem,
            generated.certificate_chain_pem,
            chrono::Utc::now(),
            Origin::SelfSigned,
            self.fingerprint(identity),
        )
    }

    fn fingerprint(&self, identity: &Identity) -> Fingerprint {
        identity.fingerprint(autosni::config::Environment::Production)
    }

    fn expiry(&self, _origin: Origin) -> Duration {
        self.ttl
    }
}

#[derive(Debug)]
struct AcceptAnyCertificate(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

/// Complete a TLS handshake with `addr`, sending `server_name` as SNI and trusting any certificate
pub async fn tls_connect(
    addr: SocketAddr,
    server_name: &str,
) -> std::io::Result<TlsStream<TcpStream>> {
    autosni::tls::install_default_crypto_provider();
    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());

    let config = ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()
        .unwrap()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate(provider)))
        .with_no_client_auth();

    let stream = TcpStream::connect(addr).await?;
    let server_name = ServerName::try_from(server_name.to_string()).unwrap();

    TlsConnector::from(Arc::new(config))
        .connect(server_name, stream)
        .await
}

/// The subject common name of a DER certificate
pub fn common_name(der: &[u8]) -> String {
    let (_, certificate) = x509_parser::parse_x509_certificate(der).unwrap();
    certificate
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .unwrap()
        .to_string()
}

/// The notAfter of a DER certificate as a Unix timestamp
pub fn not_after(der: &[u8]) -> i64 {
    let (_, certificate) = x509_parser::parse_x509_certificate(der).unwrap();
    certificate.validity().not_after.timestamp()
}

/// The common name of the first certificate in a PEM chain
pub fn pem_common_name(chain_pem: &[u8]) -> String {
    let mut reader = chain_pem;
    let first = rustls_pemfile::certs(&mut reader).next().unwrap().unwrap();
    common_name(&first)
}
