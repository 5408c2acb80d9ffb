use std::net::SocketAddr;

use thiserror::Error;

use crate::{challenge::ChallengeStoreError, tls::ProvisionError};

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Error in `{field}`: {message}")]
    ConfigError { field: String, message: String },

    #[error("Failed to parse `{field}`: {message}")]
    ParseError { field: String, message: String },

    #[error("Failed to bind the {listener} listener to {address}, reason: {source}")]
    FailedToBind {
        listener: &'static str,
        address: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to accept connection, reason: {0}")]
    FailedToAcceptConnection(std::io::Error),

    #[error("Host `{host}` is not in the configured domain list")]
    DomainNotAllowed { host: String },

    #[error("Client did not send a server name during the TLS handshake")]
    MissingServerName,

    #[error(transparent)]
    Provision(#[from] ProvisionError),

    #[error("TLS handshake failed, reason: {0}")]
    TlsHandshakeFailed(std::io::Error),

    #[error("Failed to initialize TLS: {0}")]
    TlsInitializationFailed(String),

    #[error("Failed to create certificate directory `{path}`: {message}")]
    CertificateDirectoryCreationFailed { path: String, message: String },

    #[error("Failed to persist credential to `{path}`: {message}")]
    FailedToPersistCredential { path: String, message: String },

    #[error("Invalid stored credential `{path}`: {message}")]
    InvalidStoredCredential { path: String, message: String },

    #[error(transparent)]
    ChallengeStore(#[from] ChallengeStoreError),

    #[error("Server cannot {action} while {state}")]
    InvalidState {
        action: &'static str,
        state: crate::server::ListenerState,
    },

    #[error("Timed out waiting for connections to close")]
    TimeoutWaitingForConnections,

    #[error("IO error: {0}")]
    IOError(#[from] std::io::Error),
}

impl ServerError {
    pub(crate) fn config(field: impl Into<String>, message: impl Into<String>) -> Self {
        ServerError::ConfigError {
            field: field.into(),
            message: message.into(),
        }
    }
}
