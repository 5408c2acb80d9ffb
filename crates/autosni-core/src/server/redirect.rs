// Plaintext request routing: challenges first, then the HTTPS redirect, then the application

use std::{future::Future, pin::Pin, sync::Arc};

use http_body_util::Full;
use hyper::{
    Request, Response, StatusCode,
    body::{Bytes, Incoming},
    header::{self, HeaderValue},
    http::request::Parts,
    service::Service as HyperService,
};
use log::debug;

use crate::{config::Config, error::ServerError};

use super::{
    challenge::ChallengeResponder,
    handler::{Handler, text_response},
};

const DEFAULT_HTTPS_PORT: u16 = 443;

/// How plaintext requests are sent to HTTPS
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RedirectPolicy {
    pub status: StatusCode,
    pub https_port: u16,
}

impl RedirectPolicy {
    /// `None` when HTTPS is not forced
    pub fn from_config(config: &Config) -> Result<Option<Self>, ServerError> {
        if !config.force_https {
            return Ok(None);
        }

        Ok(Some(RedirectPolicy {
            status: config.redirect_status()?,
            https_port: config.ports.https,
        }))
    }

    pub fn with_https_port(self, https_port: u16) -> Self {
        RedirectPolicy { https_port, ..self }
    }

    /// The `Location` for a request to `host` (which may carry the plaintext port)
    pub fn location(&self, host: &str, path_and_query: &str) -> String {
        let host = strip_port(host);

        if self.https_port == DEFAULT_HTTPS_PORT {
            format!("https://{host}{path_and_query}")
        } else {
            format!("https://{host}:{}{path_and_query}", self.https_port)
        }
    }
}

/// Remove a trailing `:port` from a Host header value, keeping IPv6 brackets intact
fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        return match host.find(']') {
            Some(end) => &host[..=end],
            None => host,
        };
    }

    match host.rsplit_once(':') {
        Some((name, port)) if !name.contains(':') && port.chars().all(|c| c.is_ascii_digit()) => {
            name
        }
        _ => host,
    }
}

/// Build a redirect response for the request described by `parts`
pub fn build_redirect_response(policy: &RedirectPolicy, parts: &Parts) -> Response<Full<Bytes>> {
    let host = parts
        .headers
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .or_else(|| parts.uri.authority().map(|authority| authority.to_string()));

    let Some(host) = host.filter(|host| !host.is_empty()) else {
        debug!("Cannot redirect a request without a Host header");
        return text_response(StatusCode::BAD_REQUEST, "Missing Host header");
    };

    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let location = policy.location(&host, path_and_query);

    let Ok(location_value) = HeaderValue::from_str(&location) else {
        return text_response(StatusCode::BAD_REQUEST, "Invalid Host header");
    };

    debug!("Redirecting to HTTPS: {location}");

    let mut response = text_response(policy.status, "Redirecting to HTTPS");
    response
        .headers_mut()
        .insert(header::LOCATION, location_value);
    response
}

/// Where a request ended up after routing
pub enum Routed<B> {
    /// Answered by the front-end itself
    Respond(Response<Full<Bytes>>),
    /// Passed on to the application handler
    Forward(Request<B>),
}

/// The service behind both listeners
///
/// On the plaintext listener it answers HTTP-01 challenges and, when HTTPS is forced, redirects
/// everything else. On the secure listener it forwards every request to the application.
#[derive(Clone)]
pub struct RedirectService {
    challenges: Option<ChallengeResponder>,
    redirect: Option<RedirectPolicy>,
    handler: Arc<dyn Handler>,
}

impl RedirectService {
    pub fn plaintext(
        challenges: ChallengeResponder,
        redirect: Option<RedirectPolicy>,
        handler: Arc<dyn Handler>,
    ) -> Self {
        Self {
            challenges: Some(challenges),
            redirect,
            handler,
        }
    }

    pub fn secure(handler: Arc<dyn Handler>) -> Self {
        Self {
            challenges: None,
            redirect: None,
            handler,
        }
    }

    pub async fn route<B>(&self, request: Request<B>) -> Routed<B> {
        let (parts, body) = request.into_parts();

        if let Some(challenges) = &self.challenges {
            if let Some(response) = challenges.handle(&parts).await {
                return Routed::Respond(response);
            }
        }

        if let Some(policy) = &self.redirect {
            return Routed::Respond(build_redirect_response(policy, &parts));
        }

        Routed::Forward(Request::from_parts(parts, body))
    }
}

impl HyperService<Request<Incoming>> for RedirectService {
    type Response = Response<Full<Bytes>>;
    type Error = ServerError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let service = self.clone();

        Box::pin(async move {
            match service.route(req).await {
                Routed::Respond(response) => Ok(response),
                Routed::Forward(req) => Ok(service.handler.handle(req).await),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_port() {
        assert_eq!(strip_port("example.com"), "example.com");
        assert_eq!(strip_port("example.com:8080"), "example.com");
        assert_eq!(strip_port("[::1]:8080"), "[::1]");
        assert_eq!(strip_port("[::1]"), "[::1]");
        assert_eq!(strip_port("127.0.0.1:80"), "127.0.0.1");
    }

    #[test]
    fn test_location_appends_non_default_port() {
        let policy = RedirectPolicy {
            status: StatusCode::FOUND,
            https_port: 443,
        };
        assert_eq!(policy.location("x.test:80", "/a?b=c"), "https://x.test/a?b=c");

        let policy = policy.with_https_port(8443);
        assert_eq!(policy.location("x.test:8080", "/"), "https://x.test:8443/");
    }
}
