//! Caller-supplied inputs for one dispatched call
//!
//! A [`ParameterBag`] collects path values, query values, an optional
//! request body and named file slots. Bags are assembled with the
//! builder-style setters and never mutated afterwards; the validator
//! checks the whole bag against a descriptor before anything touches
//! the network.

use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;

use serde::Serialize;
use serde_json::Value as JsonValue;
use tokio::io::AsyncReadExt;

/// Request body payload.
///
/// `Raw` bodies are loose JSON assembled by the caller and are validated
/// against the operation's schema before dispatch. `Model` bodies were
/// serialized from an already-typed generated model; their structure is
/// the model's own responsibility, so schema validation skips them.
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    /// Loose JSON value, schema-validated before dispatch
    Raw(JsonValue),
    /// Serialized generated model, exempt from schema validation
    Model(JsonValue),
}

impl Body {
    /// Wrap a loose JSON value
    pub fn raw(value: JsonValue) -> Self {
        Body::Raw(value)
    }

    /// Serialize a typed model into a body exempt from schema validation
    pub fn model<T: Serialize>(model: &T) -> Result<Self, serde_json::Error> {
        Ok(Body::Model(serde_json::to_value(model)?))
    }

    /// The contained JSON value, whichever way it was produced
    pub fn value(&self) -> &JsonValue {
        match self {
            Body::Raw(v) | Body::Model(v) => v,
        }
    }
}

/// A byte source for file parameters: bytes already in memory, or a
/// path opened lazily inside the consuming call
#[derive(Debug, Clone)]
pub enum ByteSource {
    /// Bytes held in memory
    Memory(Vec<u8>),
    /// A file on disk, opened when the bytes are needed
    File(PathBuf),
}

impl ByteSource {
    /// Source backed by an in-memory buffer
    pub fn memory(bytes: impl Into<Vec<u8>>) -> Self {
        ByteSource::Memory(bytes.into())
    }

    /// Source backed by a file path
    pub fn file(path: impl Into<PathBuf>) -> Self {
        ByteSource::File(path.into())
    }

    /// Total size in bytes
    pub async fn size(&self) -> io::Result<u64> {
        match self {
            ByteSource::Memory(bytes) => Ok(bytes.len() as u64),
            ByteSource::File(path) => Ok(tokio::fs::metadata(path).await?.len()),
        }
    }

    /// Read the entire source into memory
    pub async fn read_all(&self) -> io::Result<Vec<u8>> {
        match self {
            ByteSource::Memory(bytes) => Ok(bytes.clone()),
            ByteSource::File(path) => tokio::fs::read(path).await,
        }
    }

    /// Open a sequential reader over the source. The returned reader
    /// owns any file handle and releases it on drop, whichever way the
    /// consuming call exits.
    pub(crate) async fn open(&self) -> io::Result<SourceReader> {
        match self {
            ByteSource::Memory(bytes) => Ok(SourceReader::Memory {
                bytes: bytes.clone(),
                pos: 0,
            }),
            ByteSource::File(path) => {
                let file = tokio::fs::File::open(path).await?;
                Ok(SourceReader::File(file))
            }
        }
    }
}

/// Sequential chunk reader over a [`ByteSource`]
#[derive(Debug)]
pub(crate) enum SourceReader {
    Memory { bytes: Vec<u8>, pos: usize },
    File(tokio::fs::File),
}

impl SourceReader {
    /// Read the next chunk of at most `size` bytes. An empty result
    /// means the source is exhausted.
    pub(crate) async fn next_chunk(&mut self, size: usize) -> io::Result<Vec<u8>> {
        match self {
            SourceReader::Memory { bytes, pos } => {
                let end = (*pos + size).min(bytes.len());
                let chunk = bytes[*pos..end].to_vec();
                *pos = end;
                Ok(chunk)
            }
            SourceReader::File(file) => {
                let mut chunk = vec![0u8; size];
                let mut filled = 0;
                while filled < size {
                    let n = file.read(&mut chunk[filled..]).await?;
                    if n == 0 {
                        break;
                    }
                    filled += n;
                }
                chunk.truncate(filled);
                Ok(chunk)
            }
        }
    }
}

/// The caller's inputs for one call, validated as a unit.
///
/// Path and query values are ordered maps so validation reports come
/// out in a stable order.
#[derive(Debug, Clone, Default)]
pub struct ParameterBag {
    path: BTreeMap<String, JsonValue>,
    query: BTreeMap<String, JsonValue>,
    body: Option<Body>,
    files: BTreeMap<String, ByteSource>,
}

impl ParameterBag {
    /// An empty bag
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a path parameter
    pub fn path(mut self, name: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.path.insert(name.into(), value.into());
        self
    }

    /// Set a query parameter
    pub fn query(mut self, name: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.query.insert(name.into(), value.into());
        self
    }

    /// Attach a loose JSON body
    pub fn body(mut self, value: JsonValue) -> Self {
        self.body = Some(Body::Raw(value));
        self
    }

    /// Attach a typed-model body, exempt from schema validation
    pub fn model_body<T: Serialize>(mut self, model: &T) -> Result<Self, serde_json::Error> {
        self.body = Some(Body::model(model)?);
        Ok(self)
    }

    /// Fill a file slot
    pub fn file(mut self, name: impl Into<String>, source: ByteSource) -> Self {
        self.files.insert(name.into(), source);
        self
    }

    /// Path parameters
    pub fn path_params(&self) -> &BTreeMap<String, JsonValue> {
        &self.path
    }

    /// Query parameters
    pub fn query_params(&self) -> &BTreeMap<String, JsonValue> {
        &self.query
    }

    /// The request body, if any
    pub fn body_payload(&self) -> Option<&Body> {
        self.body.as_ref()
    }

    /// Filled file slots
    pub fn files(&self) -> &BTreeMap<String, ByteSource> {
        &self.files
    }
}

/// Render a scalar JSON value as query/path text. Non-scalars return
/// `None`; the validator rejects them before dispatch.
pub(crate) fn scalar_to_string(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Bool(b) => Some(b.to_string()),
        JsonValue::Null | JsonValue::Array(_) | JsonValue::Object(_) => None,
    }
}
