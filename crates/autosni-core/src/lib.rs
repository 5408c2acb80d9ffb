//! TLS front-end that picks, or lazily provisions, a certificate for every hostname at
//! handshake time.
//!
//! Certificates come from an ACME certificate authority over HTTP-01. When issuance is not
//! possible a self-signed certificate is served instead, and issuance is retried once it
//! expires.

pub mod challenge;
pub mod config;
pub mod error;
pub mod server;
pub mod tls;

pub use config::Config;
pub use error::ServerError;
pub use server::{ListenerState, Server, ServerBuilder, ServerHandle};
