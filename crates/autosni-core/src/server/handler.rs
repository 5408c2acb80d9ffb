use std::{future::Future, pin::Pin};

use http_body_util::Full;
use hyper::{
    Request, Response, StatusCode,
    body::{Bytes, Incoming},
    header::{self, HeaderValue},
};

pub type HandlerFuture = Pin<Box<dyn Future<Output = Response<Full<Bytes>>> + Send>>;

/// The application behind the front-end
///
/// Receives every request on the secure listener, and plaintext requests when HTTPS is not
/// forced. Any `Fn(Request<Incoming>) -> impl Future<Output = Response<Full<Bytes>>>` closure
/// is a handler.
pub trait Handler: Send + Sync + 'static {
    fn handle(&self, request: Request<Incoming>) -> HandlerFuture;
}

impl<F, Fut> Handler for F
where
    F: Fn(Request<Incoming>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Response<Full<Bytes>>> + Send + 'static,
{
    fn handle(&self, request: Request<Incoming>) -> HandlerFuture {
        Box::pin(self(request))
    }
}

/// Answers every request with `404 Not Found`
#[derive(Debug, Clone, Copy, Default)]
pub struct NotFoundHandler;

impl Handler for NotFoundHandler {
    fn handle(&self, _request: Request<Incoming>) -> HandlerFuture {
        Box::pin(async { text_response(StatusCode::NOT_FOUND, "Not Found") })
    }
}

/// A `text/plain` response with the given status
pub fn text_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}
