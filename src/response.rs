use std::collections::BTreeMap;

use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use serde::de::DeserializeOwned;

use crate::error::Error;
use crate::util::truncate_body;

#[derive(Clone, Debug)]
pub struct HttpResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
    metadata: BTreeMap<String, serde_json::Value>,
    from_cache: bool,
}

impl HttpResponse {
    pub fn new(status: StatusCode, headers: HeaderMap, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers,
            body: body.into(),
            metadata: BTreeMap::new(),
            from_cache: false,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn set_body(&mut self, body: impl Into<Bytes>) {
        self.body = body.into();
    }

    pub fn into_body(self) -> Bytes {
        self.body
    }

    /// Annotations attached by `post_request` hooks.
    pub fn metadata(&self) -> &BTreeMap<String, serde_json::Value> {
        &self.metadata
    }

    pub fn insert_metadata(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.metadata.insert(key.into(), value);
    }

    pub fn is_from_cache(&self) -> bool {
        self.from_cache
    }

    pub(crate) fn mark_from_cache(mut self) -> Self {
        self.from_cache = true;
        self
    }

    pub fn text_lossy(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T>(&self) -> crate::Result<T>
    where
        T: DeserializeOwned,
    {
        serde_json::from_slice(&self.body).map_err(|source| Error::Deserialize {
            source,
            body: truncate_body(&self.body),
        })
    }
}

#[cfg(test)]
mod tests {
    use http::{HeaderMap, StatusCode};
    use serde::Deserialize;

    use super::HttpResponse;
    use crate::error::Error;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Item {
        id: u32,
    }

    #[test]
    fn json_decodes_body() {
        let response = HttpResponse::new(StatusCode::OK, HeaderMap::new(), r#"{"id":7}"#);
        let item: Item = response.json().expect("body should decode");
        assert_eq!(item, Item { id: 7 });
    }

    #[test]
    fn json_error_keeps_body_excerpt() {
        let response = HttpResponse::new(StatusCode::OK, HeaderMap::new(), "not json");
        match response.json::<Item>() {
            Err(Error::Deserialize { body, .. }) => assert_eq!(body, "not json"),
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
