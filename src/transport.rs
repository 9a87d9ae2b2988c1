//! Transport seam between the dispatcher and the HTTP layer
//!
//! The dispatcher never talks to `reqwest` directly: it builds a
//! [`TransportRequest`] from a descriptor and a validated bag, then hands
//! it to a [`Transport`] implementation. Production uses the
//! reqwest-backed [`HttpTransport`]; tests substitute in-process fakes.
//!
//! A [`TransportError`] means the exchange could not be completed at
//! all. A server that answered — with any status — produces a
//! [`RawResponse`], never an error.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::operation::{HttpMethod, OperationDescriptor};
use crate::params::{scalar_to_string, ParameterBag};

/// Errors raised when a call could not be made at all
#[derive(Error, Debug)]
pub enum TransportError {
    /// The request could not be assembled from the descriptor and bag
    #[error("request could not be built: {0}")]
    Request(String),

    /// Connection could not be established
    #[error("connection failed: {0}")]
    Connect(String),

    /// The exchange timed out
    #[error("request timed out")]
    Timeout,

    /// Any other transport-level failure
    #[error("transport failure: {0}")]
    Other(String),

    /// A file-backed parameter could not be read
    #[error("failed reading request payload: {0}")]
    Source(#[from] std::io::Error),
}

/// One multipart file part, already read into memory
#[derive(Debug, Clone)]
pub struct FilePart {
    /// Multipart field name
    pub field: String,
    /// File name reported to the server
    pub filename: String,
    /// Part contents
    pub bytes: Vec<u8>,
}

/// A fully-assembled request, independent of any HTTP library
#[derive(Debug, Clone)]
pub struct TransportRequest {
    /// HTTP method
    pub method: HttpMethod,
    /// Absolute URL without the query string
    pub url: String,
    /// Query pairs, in declaration order
    pub query: Vec<(String, String)>,
    /// Bearer token to attach, if any
    pub bearer: Option<String>,
    /// JSON body, if any
    pub body: Option<serde_json::Value>,
    /// Multipart file parts, if any
    pub files: Vec<FilePart>,
}

impl TransportRequest {
    /// Attach (or replace) the bearer token
    pub fn with_bearer(mut self, token: Option<String>) -> Self {
        self.bearer = token;
        self
    }
}

/// What the server answered, uninterpreted
#[derive(Debug, Clone)]
pub struct RawResponse {
    /// HTTP status code
    pub status: u16,
    /// Headers, keys lowercased
    pub headers: HashMap<String, String>,
    /// Body bytes
    pub body: Vec<u8>,
}

/// The seam the dispatcher calls through.
///
/// Implementations must be `Send + Sync`; the dispatcher shares one
/// transport across concurrent callers.
#[async_trait]
pub trait Transport: Send + Sync + std::fmt::Debug {
    /// Execute one request, returning whatever the server answered
    async fn execute(&self, request: TransportRequest) -> Result<RawResponse, TransportError>;
}

/// Assemble a [`TransportRequest`] from a descriptor and a validated bag.
///
/// Path placeholders are substituted from the bag, query pairs rendered
/// in declaration order, and file sources read into memory here — the
/// bag itself stays untouched. Runs after validation, so a missing path
/// value or non-scalar here is an internal inconsistency, reported as a
/// `Request` error rather than a panic.
pub async fn build_request(
    base_url: &str,
    descriptor: &OperationDescriptor,
    bag: &ParameterBag,
) -> Result<TransportRequest, TransportError> {
    let mut path_values = HashMap::new();
    for (name, value) in bag.path_params() {
        let rendered = scalar_to_string(value).ok_or_else(|| {
            TransportError::Request(format!("path parameter '{name}' is not a scalar"))
        })?;
        path_values.insert(name.clone(), rendered);
    }

    let path = descriptor.render_path(&path_values).ok_or_else(|| {
        TransportError::Request(format!(
            "missing path parameter for operation '{}'",
            descriptor.key()
        ))
    })?;

    let mut query = Vec::with_capacity(bag.query_params().len());
    for (name, value) in bag.query_params() {
        let rendered = scalar_to_string(value).ok_or_else(|| {
            TransportError::Request(format!("query parameter '{name}' is not a scalar"))
        })?;
        query.push((name.clone(), rendered));
    }

    let mut files = Vec::with_capacity(bag.files().len());
    for (name, source) in bag.files() {
        let bytes = source.read_all().await?;
        files.push(FilePart {
            field: name.clone(),
            filename: name.clone(),
            bytes,
        });
    }

    Ok(TransportRequest {
        method: descriptor.method(),
        url: format!("{}{}", base_url.trim_end_matches('/'), path),
        query,
        bearer: None,
        body: bag.body_payload().map(|b| b.value().clone()),
        files,
    })
}

trait WithBearer {
    fn with_bearer(self, token: Option<&str>) -> Self;
}

impl WithBearer for reqwest::RequestBuilder {
    fn with_bearer(self, token: Option<&str>) -> Self {
        match token {
            Some(token) => self.header("authorization", format!("Bearer {token}")),
            None => self,
        }
    }
}

/// Production transport backed by a shared `reqwest` client
#[derive(Debug)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    /// Build a transport with the given request timeout
    pub fn new(timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::Other(format!("failed to create HTTP client: {e}")))?;
        Ok(Self { client })
    }

    fn method(method: HttpMethod) -> reqwest::Method {
        match method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Patch => reqwest::Method::PATCH,
            HttpMethod::Delete => reqwest::Method::DELETE,
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn execute(&self, request: TransportRequest) -> Result<RawResponse, TransportError> {
        let mut builder = self
            .client
            .request(Self::method(request.method), &request.url)
            .query(&request.query)
            .with_bearer(request.bearer.as_deref());

        if !request.files.is_empty() {
            let mut form = reqwest::multipart::Form::new();
            for part in request.files {
                form = form.part(
                    part.field,
                    reqwest::multipart::Part::bytes(part.bytes).file_name(part.filename),
                );
            }
            builder = builder.multipart(form);
        } else if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(classify_reqwest_error)?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();
        let body = response
            .bytes()
            .await
            .map_err(classify_reqwest_error)?
            .to_vec();

        Ok(RawResponse {
            status,
            headers,
            body,
        })
    }
}

fn classify_reqwest_error(error: reqwest::Error) -> TransportError {
    if error.is_timeout() {
        TransportError::Timeout
    } else if error.is_connect() {
        TransportError::Connect(error.to_string())
    } else {
        TransportError::Other(error.to_string())
    }
}
