use std::time::Duration;

use bytes::Bytes;
use http::header::{CONTENT_TYPE, HeaderName, HeaderValue};
use http::{HeaderMap, Method};
use serde::Serialize;

use crate::error::Error;
use crate::util::{parse_header_name, parse_header_value};

/// Per-request options handed to `execute`. `pre_request` hooks receive a
/// mutable reference before the first attempt; every attempt then sends the
/// same options.
#[derive(Clone, Debug, Default)]
pub struct RequestOptions {
    headers: HeaderMap,
    params: Vec<(String, String)>,
    body: Option<Bytes>,
    timeout: Option<Duration>,
    cache_ttl: Option<Duration>,
    skip_cache: bool,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn try_header(self, name: &str, value: &str) -> crate::Result<Self> {
        let name = parse_header_name(name)?;
        let value = parse_header_value(name.as_str(), value)?;
        Ok(self.header(name, value))
    }

    pub fn query_pair(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((name.into(), value.into()));
        self
    }

    pub fn query<T>(mut self, params: &T) -> crate::Result<Self>
    where
        T: Serialize + ?Sized,
    {
        let encoded =
            serde_urlencoded::to_string(params).map_err(|source| Error::SerializeQuery { source })?;
        self.params.extend(
            url::form_urlencoded::parse(encoded.as_bytes())
                .map(|(name, value)| (name.into_owned(), value.into_owned())),
        );
        Ok(self)
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn json<T>(self, payload: &T) -> crate::Result<Self>
    where
        T: Serialize + ?Sized,
    {
        let body = serde_json::to_vec(payload).map_err(|source| Error::Serialize { source })?;
        Ok(self
            .body(Bytes::from(body))
            .header(CONTENT_TYPE, HeaderValue::from_static("application/json")))
    }

    /// Per-attempt timeout handed to the transport. Falls back to the client's
    /// default timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Overrides the cache's default TTL for this response.
    pub fn cache_ttl(mut self, cache_ttl: Duration) -> Self {
        self.cache_ttl = Some(cache_ttl);
        self
    }

    /// Neither reads from nor writes to the response cache.
    pub fn skip_cache(mut self) -> Self {
        self.skip_cache = true;
        self
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn params(&self) -> &[(String, String)] {
        &self.params
    }

    pub fn params_mut(&mut self) -> &mut Vec<(String, String)> {
        &mut self.params
    }

    pub fn body_bytes(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }

    pub fn set_body(&mut self, body: Option<Bytes>) {
        self.body = body;
    }

    pub fn configured_timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    pub fn configured_cache_ttl(&self) -> Option<Duration> {
        self.cache_ttl
    }

    pub fn skips_cache(&self) -> bool {
        self.skip_cache
    }
}

/// Read-only view of the request handed to plugin hooks.
#[derive(Clone, Debug)]
pub struct RequestContext {
    id: u64,
    method: Method,
    url: String,
    host: String,
}

impl RequestContext {
    pub(crate) fn new(method: Method, url: String, host: String) -> Self {
        Self {
            id: 0,
            method,
            url,
            host,
        }
    }

    pub(crate) fn with_id(mut self, id: u64) -> Self {
        self.id = id;
        self
    }

    /// Identifies one logical request within its client. Every hook call
    /// for the same request sees the same id.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn host(&self) -> &str {
        &self.host
    }
}
