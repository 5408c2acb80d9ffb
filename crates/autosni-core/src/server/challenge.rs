// Serves `/.well-known/acme-challenge/<token>` from the challenge store

use std::sync::Arc;

use http_body_util::Full;
use hyper::{Method, Response, StatusCode, body::Bytes, http::request::Parts};
use log::{debug, warn};

use crate::challenge::{ChallengeStore, ChallengeStoreError, extract_token};

use super::handler::text_response;

#[derive(Clone)]
pub struct ChallengeResponder {
    store: Arc<dyn ChallengeStore>,
}

impl ChallengeResponder {
    pub fn new(store: Arc<dyn ChallengeStore>) -> Self {
        ChallengeResponder { store }
    }

    /// Answer the request if it is an HTTP-01 validation request, `None` otherwise
    ///
    /// Only `GET` and `HEAD` are answered. Tokens are only ever read here.
    pub async fn handle(&self, request: &Parts) -> Option<Response<Full<Bytes>>> {
        let token = extract_token(request.uri.path())?;

        if request.method != Method::GET && request.method != Method::HEAD {
            return None;
        }

        let value = match self.store.read(token).await {
            Ok(value) => value,
            Err(ChallengeStoreError::InvalidToken(_)) => None,
            Err(e) => {
                warn!("Failed to read challenge token {token}: {e}");
                None
            }
        };

        let response = match value {
            Some(value) => {
                debug!("Answering HTTP-01 challenge for token {token}");
                text_response(StatusCode::OK, value)
            }
            None => {
                debug!("Unknown HTTP-01 challenge token {token}");
                text_response(StatusCode::NOT_FOUND, "Not Found")
            }
        };

        Some(response)
    }
}
