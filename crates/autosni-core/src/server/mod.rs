pub mod challenge;
pub mod handler;
pub mod redirect;

use std::{fmt::Display, future::Future, io, net::SocketAddr, sync::Arc, time::Duration};

use hyper::server::conn::http1;
use hyper_util::{rt::TokioIo, server::graceful::GracefulShutdown};
use log::{debug, error, info, warn};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::watch,
};
use tokio_util::sync::CancellationToken;

use crate::{
    challenge::{ChallengeStore, FileChallengeStore},
    config::Config,
    error::ServerError,
    tls::{
        AcmeAuthority, CertificateAuthority, CertificateCache, CertificateSelector,
        CredentialStorage, DomainResolver, PipelineSettings, ProvisionOutcome, Provisioner,
        ProvisioningPipeline, RcgenGenerator, SelfSignedGenerator, install_default_crypto_provider,
    },
};

use self::{
    challenge::ChallengeResponder,
    handler::{Handler, NotFoundHandler},
    redirect::{RedirectPolicy, RedirectService},
};

const SHUTDOWN_WAIT_PERIOD: u64 = 15; // seconds

/// Lifecycle of the listener pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Created,
    Binding,
    Listening,
    Closing,
    Closed,
}

impl Display for ListenerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ListenerState::Created => write!(f, "created"),
            ListenerState::Binding => write!(f, "binding"),
            ListenerState::Listening => write!(f, "listening"),
            ListenerState::Closing => write!(f, "closing"),
            ListenerState::Closed => write!(f, "closed"),
        }
    }
}

/// Controls a running server from elsewhere
#[derive(Clone)]
pub struct ServerHandle {
    shutdown: CancellationToken,
    state: watch::Receiver<ListenerState>,
}

impl ServerHandle {
    /// Close both listeners and drain open connections
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn state(&self) -> ListenerState {
        *self.state.borrow()
    }

    /// Wait until both listeners are closed
    pub async fn closed(&self) {
        let mut state = self.state.clone();
        let _ = state
            .wait_for(|state| *state == ListenerState::Closed)
            .await;
    }
}

/// Assembles a [`Server`], with every collaborator replaceable
pub struct ServerBuilder {
    config: Config,
    authority: Option<Arc<dyn CertificateAuthority>>,
    generator: Option<Arc<dyn SelfSignedGenerator>>,
    challenge_store: Option<Arc<dyn ChallengeStore>>,
    handler: Option<Arc<dyn Handler>>,
    persist_credentials: bool,
    graceful_shutdown: bool,
}

impl ServerBuilder {
    pub fn new(config: Config) -> Self {
        ServerBuilder {
            config,
            authority: None,
            generator: None,
            challenge_store: None,
            handler: None,
            persist_credentials: true,
            graceful_shutdown: true,
        }
    }

    /// Defaults to an ACME client talking to Let's Encrypt
    pub fn authority(mut self, authority: Arc<dyn CertificateAuthority>) -> Self {
        self.authority = Some(authority);
        self
    }

    /// Defaults to [`RcgenGenerator`] with the configured validity
    pub fn generator(mut self, generator: Arc<dyn SelfSignedGenerator>) -> Self {
        self.generator = Some(generator);
        self
    }

    /// Defaults to a [`FileChallengeStore`] in the configured webroot
    pub fn challenge_store(mut self, store: Arc<dyn ChallengeStore>) -> Self {
        self.challenge_store = Some(store);
        self
    }

    /// Defaults to answering `404 Not Found`
    pub fn handler(mut self, handler: impl Handler) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    /// Whether issued certificates are written under `<config_directory>/live` (default: true)
    pub fn persist_credentials(mut self, persist: bool) -> Self {
        self.persist_credentials = persist;
        self
    }

    /// Whether Ctrl+C triggers a graceful shutdown (default: true)
    pub fn graceful_shutdown(mut self, graceful: bool) -> Self {
        self.graceful_shutdown = graceful;
        self
    }

    /// Validate the configuration and wire everything together, no socket is opened yet
    pub fn build(self) -> Result<Server, ServerError> {
        let config = self.config;
        config.validate()?;

        let resolver = DomainResolver::from_config(&config)?;
        let redirect = RedirectPolicy::from_config(&config)?;

        install_default_crypto_provider();

        let challenge_store = match self.challenge_store {
            Some(store) => store,
            None => Arc::new(FileChallengeStore::new(&config.webroot())?),
        };
        let authority = self
            .authority
            .unwrap_or_else(|| Arc::new(AcmeAuthority::from_config(&config)));
        let generator = self.generator.unwrap_or_else(|| {
            Arc::new(RcgenGenerator::with_validity(
                config.self_signed_validity(),
            ))
        });

        let mut pipeline = ProvisioningPipeline::new(
            authority,
            generator,
            Arc::clone(&challenge_store),
            PipelineSettings::from_config(&config),
        );
        if self.persist_credentials {
            pipeline = pipeline.with_storage(CredentialStorage::new(config.live_directory()));
        }
        let pipeline = Arc::new(pipeline);

        let cache = CertificateCache::new(Arc::clone(&pipeline) as Arc<dyn Provisioner>);
        let selector = CertificateSelector::new(Arc::new(resolver), cache)
            .with_handshake_timeout(config.handshake_timeout());

        let (state, _) = watch::channel(ListenerState::Created);

        debug!(
            "Server configured for {} (environment: {})",
            if selector.resolver().is_open() {
                "any hostname".to_string()
            } else {
                format!("{} certificate(s)", selector.resolver().identities().len())
            },
            config.environment()
        );

        Ok(Server {
            config,
            selector,
            pipeline,
            challenges: ChallengeResponder::new(challenge_store),
            redirect,
            handler: self.handler.unwrap_or_else(|| Arc::new(NotFoundHandler)),
            state,
            shutdown: CancellationToken::new(),
            graceful_shutdown: self.graceful_shutdown,
            listeners: None,
        })
    }
}

struct BoundListeners {
    http: TcpListener,
    https: TcpListener,
}

/// A paired plaintext and secure listener sharing one lifecycle
pub struct Server {
    config: Config,
    selector: CertificateSelector,
    pipeline: Arc<ProvisioningPipeline>,
    challenges: ChallengeResponder,
    redirect: Option<RedirectPolicy>,
    handler: Arc<dyn Handler>,
    state: watch::Sender<ListenerState>,
    shutdown: CancellationToken,
    graceful_shutdown: bool,
    listeners: Option<BoundListeners>,
}

impl Server {
    /// A server with the default collaborators, see [`ServerBuilder`] to replace them
    pub fn new(config: Config, handler: impl Handler) -> Result<Self, ServerError> {
        ServerBuilder::new(config).handler(handler).build()
    }

    pub fn builder(config: Config) -> ServerBuilder {
        ServerBuilder::new(config)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn state(&self) -> ListenerState {
        *self.state.borrow()
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            shutdown: self.shutdown.clone(),
            state: self.state.subscribe(),
        }
    }

    pub fn cache(&self) -> &CertificateCache {
        self.selector.cache()
    }

    /// How provisioning runs have ended so far
    pub fn outcomes(&self) -> ProvisionOutcome {
        self.pipeline.outcomes()
    }

    /// The bound plaintext and secure addresses, once [`Server::bind`] succeeded
    pub fn local_addrs(&self) -> Option<(SocketAddr, SocketAddr)> {
        let listeners = self.listeners.as_ref()?;
        Some((
            listeners.http.local_addr().ok()?,
            listeners.https.local_addr().ok()?,
        ))
    }

    fn set_state(&self, state: ListenerState) {
        let previous = self.state.send_replace(state);
        debug!("Listener state: {previous} -> {state}");
    }

    /// Bind both listeners, or neither
    pub async fn bind(&mut self) -> Result<(SocketAddr, SocketAddr), ServerError> {
        let current = self.state();
        if current != ListenerState::Created {
            return Err(ServerError::InvalidState {
                action: "bind",
                state: current,
            });
        }

        self.set_state(ListenerState::Binding);

        let http_address = self.config.http_address();
        let http = match TcpListener::bind(http_address).await {
            Ok(listener) => listener,
            Err(source) => {
                self.set_state(ListenerState::Closed);
                return Err(ServerError::FailedToBind {
                    listener: "plaintext",
                    address: http_address,
                    source,
                });
            }
        };

        let https_address = self.config.https_address();
        let https = match TcpListener::bind(https_address).await {
            Ok(listener) => listener,
            Err(source) => {
                drop(http);
                self.set_state(ListenerState::Closed);
                return Err(ServerError::FailedToBind {
                    listener: "secure",
                    address: https_address,
                    source,
                });
            }
        };

        let addresses = (http.local_addr()?, https.local_addr()?);
        info!(
            "Listening on http://{} and https://{}",
            addresses.0, addresses.1
        );

        self.listeners = Some(BoundListeners { http, https });
        self.set_state(ListenerState::Listening);

        Ok(addresses)
    }

    /// Watch for a shutdown signal (like Ctrl+C) and close both listeners gracefully.
    fn watch_for_shutdown(&self) {
        if !self.graceful_shutdown {
            debug!("Graceful shutdown is disabled, skipping signal watcher");
            return;
        }

        debug!("Setting up Ctrl+C signal handler for graceful shutdown");

        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                result = tokio::signal::ctrl_c() => match result {
                    Ok(()) => {
                        debug!("Received shutdown signal, shutting down the server...");
                        shutdown.cancel();
                    }
                    Err(e) => error!("Failed to install Ctrl+C handler: {e}"),
                },
                _ = shutdown.cancelled() => {}
            }
        });
    }

    /// Serve both listeners until either closes, binding first if needed
    ///
    /// Returns the first fatal error of either listener. Connections still open when the
    /// listeners close get a grace period to finish.
    pub async fn run(&mut self) -> Result<(), ServerError> {
        if self.state() == ListenerState::Created {
            self.bind().await?;
        }

        let Some(listeners) = self.listeners.take() else {
            return Err(ServerError::InvalidState {
                action: "run",
                state: self.state(),
            });
        };

        let https_port = listeners.https.local_addr()?.port();
        self.serve(listeners.http, listeners.https, https_port)
            .await
    }

    async fn serve<P, S>(
        &mut self,
        http: P,
        https: S,
        https_port: u16,
    ) -> Result<(), ServerError>
    where
        P: Accept,
        S: Accept,
    {
        debug!("Starting autosni server...");
        self.watch_for_shutdown();

        let plaintext = RedirectService::plaintext(
            self.challenges.clone(),
            self.redirect.map(|policy| policy.with_https_port(https_port)),
            Arc::clone(&self.handler),
        );
        let secure = RedirectService::secure(Arc::clone(&self.handler));

        let graceful = GracefulShutdown::new();

        let (plaintext_result, secure_result) = tokio::join!(
            accept_plaintext(http, plaintext, &graceful, self.shutdown.clone()),
            accept_secure(
                https,
                self.selector.clone(),
                secure,
                &graceful,
                self.shutdown.clone()
            ),
        );

        self.set_state(ListenerState::Closing);

        // Start graceful shutdown watcher when both accept loops are done
        let drained = tokio::select! {
            _ = graceful.shutdown() => {
                debug!("Closed all connections gracefully");
                Ok(())
            }
            _ = tokio::time::sleep(Duration::from_secs(SHUTDOWN_WAIT_PERIOD)) => {
                error!("Timed out wait for all connections to close");
                Err(ServerError::TimeoutWaitingForConnections)
            }
        };

        self.set_state(ListenerState::Closed);

        plaintext_result.and(secure_result).and(drained)
    }
}

/// Where a listener's connections come from
trait Accept: Send {
    fn accept(&mut self) -> impl Future<Output = io::Result<(TcpStream, SocketAddr)>> + Send;
}

impl Accept for TcpListener {
    fn accept(&mut self) -> impl Future<Output = io::Result<(TcpStream, SocketAddr)>> + Send {
        TcpListener::accept(self)
    }
}

async fn accept_plaintext(
    mut listener: impl Accept,
    service: RedirectService,
    graceful: &GracefulShutdown,
    shutdown: CancellationToken,
) -> Result<(), ServerError> {
    // Whichever way this loop ends, the secure listener closes with it
    let _close_both = shutdown.clone().drop_guard();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("Plaintext listener closing");
                return Ok(());
            }

            connection = listener.accept() => {
                let (stream, addr) = connection.map_err(ServerError::FailedToAcceptConnection)?;
                debug!("Accepted plaintext connection from {addr}");

                let io = TokioIo::new(stream);
                let service = service.clone();
                let watcher = graceful.watcher();

                tokio::task::spawn(async move {
                    let connection = http1::Builder::new().serve_connection(io, service);
                    if let Err(err) = watcher.watch(connection).await {
                        error!("Failed to serve connection: {err:?}");
                    }
                });
            }
        }
    }
}

async fn accept_secure(
    mut listener: impl Accept,
    selector: CertificateSelector,
    service: RedirectService,
    graceful: &GracefulShutdown,
    shutdown: CancellationToken,
) -> Result<(), ServerError> {
    let _close_both = shutdown.clone().drop_guard();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("Secure listener closing");
                return Ok(());
            }

            connection = listener.accept() => {
                let (stream, addr) = connection.map_err(ServerError::FailedToAcceptConnection)?;
                debug!("Accepted secure connection from {addr}");

                let selector = selector.clone();
                let service = service.clone();
                let watcher = graceful.watcher();

                tokio::task::spawn(async move {
                    let stream = match selector.accept(stream).await {
                        Ok(stream) => stream,
                        Err(e) => {
                            warn!("TLS handshake with {addr} failed: {e}");
                            return;
                        }
                    };

                    let connection =
                        http1::Builder::new().serve_connection(TokioIo::new(stream), service);
                    if let Err(err) = watcher.watch(connection).await {
                        error!("Failed to serve connection: {err:?}");
                    }
                });
            }
        }
    }
}
