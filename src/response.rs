//! Uniform wrapper around one completed call
//!
//! A [`ClientResponse`] captures what the server answered: status code,
//! headers and raw bytes. Non-2xx statuses live here as data — a server
//! that answered with an error payload is still a completed call,
//! distinct from a transport failure. Text and structured views are
//! derived lazily on first access and cached for the lifetime of the
//! wrapper; a payload that is not structured data yields an explicit
//! [`Parsed::NotStructured`] rather than an error.

use std::collections::HashMap;
use std::sync::OnceLock;

use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::transport::RawResponse;

/// Errors raised when decoding a response payload into a typed value
#[derive(Error, Debug)]
pub enum ResponseError {
    /// The payload is neither JSON nor a YAML document
    #[error("response body is not structured data")]
    NotStructured,

    /// The payload parsed but did not match the requested type
    #[error("could not decode response payload: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Structured view of a response body
#[derive(Debug, Clone, PartialEq)]
pub enum Parsed {
    /// Body was a JSON document
    Json(JsonValue),
    /// Body was a YAML mapping or sequence
    Yaml(JsonValue),
    /// Body is not structured data (binary, plain text, or malformed)
    NotStructured,
}

impl Parsed {
    /// The parsed value, if the body was structured
    pub fn value(&self) -> Option<&JsonValue> {
        match self {
            Parsed::Json(v) | Parsed::Yaml(v) => Some(v),
            Parsed::NotStructured => None,
        }
    }
}

/// One completed call: status, headers, raw bytes, and cached views
#[derive(Debug, Clone)]
pub struct ClientResponse {
    status: u16,
    headers: HashMap<String, String>,
    body: Vec<u8>,
    text: OnceLock<Option<String>>,
    parsed: OnceLock<Parsed>,
}

impl ClientResponse {
    /// Wrap a raw transport result
    pub(crate) fn from_raw(raw: RawResponse) -> Self {
        Self {
            status: raw.status,
            headers: raw.headers,
            body: raw.body,
            text: OnceLock::new(),
            parsed: OnceLock::new(),
        }
    }

    /// Construct a response directly; used by tests and fakes
    pub fn new(status: u16, headers: HashMap<String, String>, body: Vec<u8>) -> Self {
        Self {
            status,
            headers,
            body,
            text: OnceLock::new(),
            parsed: OnceLock::new(),
        }
    }

    /// HTTP status code
    pub fn status(&self) -> u16 {
        self.status
    }

    /// Whether the status is in the 2xx range
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Response headers, keys lowercased
    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    /// Raw body bytes
    pub fn bytes(&self) -> &[u8] {
        &self.body
    }

    /// UTF-8 view of the body; `None` when the bytes are not valid text.
    /// Computed once and cached.
    pub fn text(&self) -> Option<&str> {
        self.text
            .get_or_init(|| String::from_utf8(self.body.clone()).ok())
            .as_deref()
    }

    /// Structured view of the body, computed once and cached.
    ///
    /// JSON is tried first; a YAML document is accepted only when it is
    /// a mapping or a sequence — bare scalars would make every text body
    /// "structured", which defeats the sentinel.
    pub fn parsed(&self) -> &Parsed {
        self.parsed.get_or_init(|| {
            if let Ok(value) = serde_json::from_slice::<JsonValue>(&self.body) {
                return Parsed::Json(value);
            }
            let Some(text) = self.text() else {
                return Parsed::NotStructured;
            };
            match serde_yaml::from_str::<JsonValue>(text) {
                Ok(value @ (JsonValue::Object(_) | JsonValue::Array(_))) => Parsed::Yaml(value),
                _ => Parsed::NotStructured,
            }
        })
    }

    /// Decode the structured body into a typed value
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, ResponseError> {
        match self.parsed().value() {
            Some(value) => Ok(serde_json::from_value(value.clone())?),
            None => Err(ResponseError::NotStructured),
        }
    }

    /// Pretty-printed JSON rendering of the structured body, for display
    pub fn to_pretty_json(&self) -> Option<String> {
        self.parsed()
            .value()
            .and_then(|v| serde_json::to_string_pretty(v).ok())
    }

    /// YAML rendering of the structured body, for display
    pub fn to_pretty_yaml(&self) -> Option<String> {
        self.parsed().value().and_then(|v| serde_yaml::to_string(v).ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    fn response(status: u16, body: &[u8]) -> ClientResponse {
        ClientResponse::new(status, HashMap::new(), body.to_vec())
    }

    #[test]
    fn json_body_parses() {
        let resp = response(200, br#"{"id":"f1","size":10}"#);
        assert!(resp.is_success());
        assert_eq!(
            resp.parsed().value().unwrap(),
            &json!({ "id": "f1", "size": 10 })
        );
    }

    #[test]
    fn yaml_mapping_parses_when_json_fails() {
        let resp = response(200, b"id: f1\nsize: 10\n");
        assert!(matches!(resp.parsed(), Parsed::Yaml(_)));
        assert_eq!(resp.parsed().value().unwrap()["id"], json!("f1"));
    }

    #[test]
    fn plain_text_is_not_structured() {
        let resp = response(200, b"just some words");
        assert_eq!(resp.parsed(), &Parsed::NotStructured);
        assert_eq!(resp.text(), Some("just some words"));
    }

    #[test]
    fn binary_body_is_not_structured_and_not_text() {
        let resp = response(200, &[0xff, 0xfe, 0x00, 0x89]);
        assert_eq!(resp.parsed(), &Parsed::NotStructured);
        assert!(resp.text().is_none());
        assert_eq!(resp.bytes(), &[0xff, 0xfe, 0x00, 0x89]);
    }

    #[test]
    fn parsing_twice_returns_the_same_cached_value() {
        let resp = response(200, br#"{"a":1}"#);
        let first = resp.parsed() as *const Parsed;
        let second = resp.parsed() as *const Parsed;
        assert_eq!(first, second);
        assert_eq!(resp.parsed(), &Parsed::Json(json!({ "a": 1 })));
    }

    #[test]
    fn non_2xx_is_data_not_error() {
        let resp = response(404, br#"{"error":"not found"}"#);
        assert!(!resp.is_success());
        assert_eq!(resp.status(), 404);
        assert_eq!(resp.parsed().value().unwrap()["error"], json!("not found"));
    }

    #[test]
    fn decode_into_typed_value() {
        #[derive(Deserialize, PartialEq, Debug)]
        struct Ack {
            offset: u64,
        }
        let resp = response(200, br#"{"offset":4096}"#);
        assert_eq!(resp.decode::<Ack>().unwrap(), Ack { offset: 4096 });

        let resp = response(200, b"not structured at all");
        assert!(matches!(
            resp.decode::<Ack>(),
            Err(ResponseError::NotStructured)
        ));
    }

    #[test]
    fn pretty_renderings() {
        let resp = response(200, br#"{"b":2,"a":1}"#);
        let pretty = resp.to_pretty_json().unwrap();
        assert!(pretty.contains("\"a\": 1"));
        let yaml = resp.to_pretty_yaml().unwrap();
        assert!(yaml.contains("a: 1"));
    }
}
