//! Formal operation definitions for the generated REST surface
//!
//! An operation definition describes one remote endpoint: its canonical
//! `resource/operation` key, the HTTP method and path template, and the
//! declared parameters partitioned into path, query, body and file
//! categories. Definitions are authored as JSON documents (one file per
//! resource, bundled under `apidef/`) and turned into immutable
//! [`OperationDescriptor`]s when the registry loads.
//!
//! ## Definition Format
//!
//! ```json
//! {
//!   "resource": "groups",
//!   "operations": [
//!     {
//!       "name": "set_organizational",
//!       "method": "POST",
//!       "path": "/groups/{id}/organizational",
//!       "body": {
//!         "type": "object",
//!         "required": ["value"],
//!         "properties": { "value": { "type": "boolean" } }
//!       }
//!     }
//!   ]
//! }
//! ```

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

/// Errors raised while resolving or constructing operations
#[derive(Error, Debug)]
pub enum RegistryError {
    /// No operation in the loaded set matches the requested key
    #[error("unknown operation '{key}'")]
    UnknownOperation {
        /// The key that failed to resolve
        key: OperationKey,
    },

    /// A bundled definition file could not be parsed
    #[error("invalid operation definition in '{file}': {error}")]
    Definition {
        /// Definition file the error originated from
        file: String,
        /// Parser diagnostic
        error: String,
    },

    /// Two definitions claim the same canonical key
    #[error("operation '{key}' is defined more than once")]
    DuplicateOperation {
        /// The contested key
        key: OperationKey,
    },

    /// The request body schema of a definition did not compile
    #[error("request body schema for '{key}' failed to compile: {error}")]
    Schema {
        /// Owning operation
        key: OperationKey,
        /// Compiler diagnostic
        error: String,
    },
}

/// Canonical identity of one remote operation: resource name plus
/// operation name. Displays as `resource/operation`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OperationKey {
    /// Resource (controller) name, e.g. "groups"
    pub resource: String,
    /// Operation (action) name, e.g. "set_organizational"
    pub operation: String,
}

impl OperationKey {
    /// Create a key from resource and operation names
    pub fn new(resource: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            operation: operation.into(),
        }
    }
}

impl fmt::Display for OperationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.resource, self.operation)
    }
}

/// Stable compile-time handle to a generated operation.
///
/// Refs are exported by the [`crate::ops`] module, one constant per
/// operation, so call sites can name an endpoint without string literals.
/// A ref is only a claim — resolution checks it against the loaded
/// operation set and rejects handles that name nothing there.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OperationRef {
    resource: &'static str,
    operation: &'static str,
}

impl OperationRef {
    /// Create a new operation ref
    pub const fn new(resource: &'static str, operation: &'static str) -> Self {
        Self {
            resource,
            operation,
        }
    }

    /// Resource name this ref points at
    pub fn resource(&self) -> &'static str {
        self.resource
    }

    /// Operation name this ref points at
    pub fn operation(&self) -> &'static str {
        self.operation
    }

    /// The canonical key for this ref
    pub fn key(&self) -> OperationKey {
        OperationKey::new(self.resource, self.operation)
    }
}

impl fmt::Display for OperationRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.resource, self.operation)
    }
}

/// HTTP method of an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    /// Canonical uppercase name
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scalar kind a query parameter accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamKind {
    /// Any scalar, rendered as text
    #[default]
    String,
    /// Whole number, or a string parseable as one
    Integer,
    /// Fractional number, or a string parseable as one
    Number,
    /// `true`/`false`, literal or as text
    Boolean,
}

/// Declared query parameter
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueryParamDef {
    /// Parameter name as it appears on the wire
    pub name: String,

    /// Scalar kind; defaults to string
    #[serde(default)]
    pub kind: ParamKind,

    /// Whether the parameter must be supplied
    #[serde(default)]
    pub required: bool,

    /// Closed set of accepted values, if the parameter is enumerated
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed: Option<Vec<String>>,
}

/// Declared file slot
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileSlotDef {
    /// Multipart field name
    pub name: String,

    /// Whether the slot must be filled
    #[serde(default)]
    pub required: bool,
}

/// One operation as authored in a definition file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationDef {
    /// Operation name, unique within its resource
    pub name: String,

    /// HTTP method
    pub method: HttpMethod,

    /// Path template with `{param}` placeholders, e.g. `/groups/{id}`
    pub path: String,

    /// Declared query parameters
    #[serde(default)]
    pub query: Vec<QueryParamDef>,

    /// JSON-schema fragment governing the request body, if the operation
    /// accepts one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<JsonValue>,

    /// Declared file slots
    #[serde(default)]
    pub files: Vec<FileSlotDef>,

    /// Human-readable description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// A resource definition file: one resource, many operations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceDef {
    /// Resource name shared by all contained operations
    pub resource: String,

    /// Human-readable description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// The operations this resource exposes
    pub operations: Vec<OperationDef>,
}

/// Resolved, introspected metadata for one remote operation.
///
/// Built once per operation when the registry loads and shared behind
/// `Arc` afterwards; the request body schema is compiled a single time
/// here so validation never recompiles it per call.
pub struct OperationDescriptor {
    key: OperationKey,
    method: HttpMethod,
    path: String,
    path_params: Vec<String>,
    query_params: Vec<QueryParamDef>,
    file_slots: Vec<FileSlotDef>,
    body_schema: Option<JsonValue>,
    compiled_body_schema: Option<jsonschema::JSONSchema>,
}

impl OperationDescriptor {
    /// Build a descriptor from a parsed definition.
    ///
    /// Path parameters are introspected from the template: every
    /// `{name}` placeholder becomes a required path parameter. The body
    /// schema, when present, is compiled here; a schema that does not
    /// compile poisons the whole load rather than failing at call time.
    pub fn from_def(resource: &str, def: &OperationDef) -> Result<Self, RegistryError> {
        let key = OperationKey::new(resource, def.name.clone());
        let path_params = extract_path_params(&def.path);

        let compiled_body_schema = match &def.body {
            Some(schema) => Some(jsonschema::JSONSchema::compile(schema).map_err(|e| {
                RegistryError::Schema {
                    key: key.clone(),
                    error: e.to_string(),
                }
            })?),
            None => None,
        };

        Ok(Self {
            key,
            method: def.method,
            path: def.path.clone(),
            path_params,
            query_params: def.query.clone(),
            file_slots: def.files.clone(),
            body_schema: def.body.clone(),
            compiled_body_schema,
        })
    }

    /// Canonical key of this operation
    pub fn key(&self) -> &OperationKey {
        &self.key
    }

    /// HTTP method
    pub fn method(&self) -> HttpMethod {
        self.method
    }

    /// Path template with placeholders intact
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Names of path parameters, in template order
    pub fn path_params(&self) -> &[String] {
        &self.path_params
    }

    /// Declared query parameters
    pub fn query_params(&self) -> &[QueryParamDef] {
        &self.query_params
    }

    /// Look up a declared query parameter by name
    pub fn query_param(&self, name: &str) -> Option<&QueryParamDef> {
        self.query_params.iter().find(|p| p.name == name)
    }

    /// Declared file slots
    pub fn file_slots(&self) -> &[FileSlotDef] {
        &self.file_slots
    }

    /// Look up a declared file slot by name
    pub fn file_slot(&self, name: &str) -> Option<&FileSlotDef> {
        self.file_slots.iter().find(|s| s.name == name)
    }

    /// Raw request body schema fragment, if any
    pub fn body_schema(&self) -> Option<&JsonValue> {
        self.body_schema.as_ref()
    }

    /// Compiled request body schema, if any
    pub(crate) fn compiled_body_schema(&self) -> Option<&jsonschema::JSONSchema> {
        self.compiled_body_schema.as_ref()
    }

    /// Whether the body schema names required fields
    pub fn body_required(&self) -> bool {
        self.body_schema
            .as_ref()
            .and_then(|s| s.get("required"))
            .and_then(|r| r.as_array())
            .map(|r| !r.is_empty())
            .unwrap_or(false)
    }

    /// Substitute path parameters into the template.
    ///
    /// Every placeholder must have a value; the validator guarantees this
    /// for dispatched bags, so a miss here is an internal error surfaced
    /// as `None`.
    pub fn render_path(&self, values: &HashMap<String, String>) -> Option<String> {
        let mut rendered = self.path.clone();
        for param in &self.path_params {
            let value = values.get(param)?;
            rendered = rendered.replace(&format!("{{{}}}", param), value);
        }
        Some(rendered)
    }
}

impl fmt::Debug for OperationDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationDescriptor")
            .field("key", &self.key)
            .field("method", &self.method)
            .field("path", &self.path)
            .field("path_params", &self.path_params)
            .field("query_params", &self.query_params)
            .field("file_slots", &self.file_slots)
            .field("has_body_schema", &self.body_schema.is_some())
            .finish()
    }
}

/// Scan a path template for `{name}` placeholders, in order
fn extract_path_params(template: &str) -> Vec<String> {
    let mut params = Vec::new();
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        let Some(close) = rest[open..].find('}') else {
            break;
        };
        let name = &rest[open + 1..open + close];
        if !name.is_empty() && !params.iter().any(|p| p == name) {
            params.push(name.to_string());
        }
        rest = &rest[open + close + 1..];
    }
    params
}
