// Per-connection certificate selection and TLS acceptance

use std::{io, sync::Arc, time::Duration};

use log::{debug, trace};
use rustls::{
    ServerConfig,
    crypto::CryptoProvider,
    server::{Acceptor, ClientHello, ResolvesServerCert},
    sign::CertifiedKey,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::{LazyConfigAcceptor, server::TlsStream};

use crate::error::ServerError;

use super::{CertificateCache, Credential, DomainResolver};

const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Hands rustls the certificate selected before the handshake resumed
#[derive(Debug)]
struct SelectedCertificate(Arc<CertifiedKey>);

impl ResolvesServerCert for SelectedCertificate {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(Arc::clone(&self.0))
    }
}

/// Build a server config that always presents `certified_key`
pub fn build_server_config(
    provider: Arc<CryptoProvider>,
    certified_key: Arc<CertifiedKey>,
) -> Result<Arc<ServerConfig>, ServerError> {
    let mut config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| ServerError::TlsInitializationFailed(e.to_string()))?
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(SelectedCertificate(certified_key)));

    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(Arc::new(config))
}

/// Picks the credential for each incoming handshake from its SNI name
///
/// The ClientHello is read first, the name is resolved and the credential fetched (or
/// provisioned) asynchronously, and only then does the handshake continue.
///
/// Reading the ClientHello and finishing the handshake are each bounded by the handshake
/// timeout. The time spent provisioning in between is not.
#[derive(Clone)]
pub struct CertificateSelector {
    resolver: Arc<DomainResolver>,
    cache: CertificateCache,
    provider: Arc<CryptoProvider>,
    handshake_timeout: Duration,
}

impl CertificateSelector {
    pub fn new(resolver: Arc<DomainResolver>, cache: CertificateCache) -> Self {
        CertificateSelector {
            resolver,
            cache,
            provider: Arc::new(rustls::crypto::aws_lc_rs::default_provider()),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn resolver(&self) -> &DomainResolver {
        &self.resolver
    }

    pub fn cache(&self) -> &CertificateCache {
        &self.cache
    }

    /// The credential to present for `server_name`
    pub async fn select(&self, server_name: Option<&str>) -> Result<Arc<Credential>, ServerError> {
        let server_name = server_name.ok_or(ServerError::MissingServerName)?;
        let identity = self.resolver.resolve(server_name)?;
        trace!("`{server_name}` resolved to identity `{identity}`");

        Ok(self.cache.get_or_provision(&identity).await?)
    }

    /// Complete a TLS handshake on `stream` with the credential selected for its SNI name
    pub async fn accept<IO>(&self, stream: IO) -> Result<TlsStream<IO>, ServerError>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        let start = tokio::time::timeout(
            self.handshake_timeout,
            LazyConfigAcceptor::new(Acceptor::default(), stream),
        )
        .await
        .map_err(|_| self.timed_out("ClientHello"))?
        .map_err(ServerError::TlsHandshakeFailed)?;

        let server_name = start.client_hello().server_name().map(str::to_string);
        let credential = self.select(server_name.as_deref()).await?;
        debug!(
            "Presenting {} certificate for `{}`",
            credential.origin(),
            credential.identity()
        );

        let config = build_server_config(Arc::clone(&self.provider), credential.certified_key())?;
        tokio::time::timeout(self.handshake_timeout, start.into_stream(config))
            .await
            .map_err(|_| self.timed_out("handshake completion"))?
            .map_err(ServerError::TlsHandshakeFailed)
    }

    fn timed_out(&self, stage: &str) -> ServerError {
        ServerError::TlsHandshakeFailed(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("no {stage} within {:?}", self.handshake_timeout),
        ))
    }
}
