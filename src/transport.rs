use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, Method};

use crate::error::{BoxError, TransportErrorKind};
use crate::response::HttpResponse;

/// Everything a transport needs for one attempt. The same request is handed to
/// every attempt of a logical request.
#[derive(Clone, Debug)]
pub struct TransportRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub params: Vec<(String, String)>,
    pub body: Option<Bytes>,
    /// Enforcing the timeout is the transport's responsibility.
    pub timeout: Duration,
}

#[derive(Debug)]
pub struct TransportError {
    kind: TransportErrorKind,
    source: BoxError,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, source: impl Into<BoxError>) -> Self {
        Self {
            kind,
            source: source.into(),
        }
    }

    pub fn connect(source: impl Into<BoxError>) -> Self {
        Self::new(TransportErrorKind::Connect, source)
    }

    pub fn timeout(source: impl Into<BoxError>) -> Self {
        Self::new(TransportErrorKind::Timeout, source)
    }

    pub fn other(source: impl Into<BoxError>) -> Self {
        Self::new(TransportErrorKind::Other, source)
    }

    pub fn kind(&self) -> TransportErrorKind {
        self.kind
    }

    pub(crate) fn into_source(self) -> BoxError {
        self.source
    }
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(formatter, "{} error: {}", self.kind, self.source)
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.source.as_ref())
    }
}

pub type TransportResult = Result<HttpResponse, TransportError>;

/// Blocking network collaborator.
pub trait Transport: Send + Sync {
    fn send(&self, request: &TransportRequest) -> TransportResult;
}

impl<F> Transport for F
where
    F: Fn(&TransportRequest) -> TransportResult + Send + Sync,
{
    fn send(&self, request: &TransportRequest) -> TransportResult {
        self(request)
    }
}

pub type TransportFuture<'a> = Pin<Box<dyn Future<Output = TransportResult> + Send + 'a>>;

/// Non-blocking network collaborator driven by the async client.
pub trait AsyncTransport: Send + Sync {
    fn send<'a>(&'a self, request: &'a TransportRequest) -> TransportFuture<'a>;
}
