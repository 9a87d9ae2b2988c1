//! In-process fakes and helpers shared by the test modules

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use crate::operation::{OperationDescriptor, ParamKind};
use crate::params::{ByteSource, ParameterBag};
use crate::transport::{RawResponse, Transport, TransportError, TransportRequest};

type Handler = Box<dyn Fn(&TransportRequest) -> Result<RawResponse, TransportError> + Send + Sync>;

enum Behavior {
    Scripted(Mutex<VecDeque<Result<RawResponse, TransportError>>>),
    Handler(Handler),
}

/// Transport fake: either a fixed script of responses consumed in
/// order, or a handler closure playing the server. Every request is
/// recorded for assertions.
pub(crate) struct MockTransport {
    calls: Mutex<Vec<TransportRequest>>,
    behavior: Behavior,
}

impl MockTransport {
    pub(crate) fn scripted(responses: Vec<Result<RawResponse, TransportError>>) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            behavior: Behavior::Scripted(Mutex::new(responses.into())),
        }
    }

    pub(crate) fn with_handler<F>(handler: F) -> Self
    where
        F: Fn(&TransportRequest) -> Result<RawResponse, TransportError> + Send + Sync + 'static,
    {
        Self {
            calls: Mutex::new(Vec::new()),
            behavior: Behavior::Handler(Box::new(handler)),
        }
    }

    pub(crate) fn calls(&self) -> Vec<TransportRequest> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

impl fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockTransport")
            .field("calls", &self.call_count())
            .finish()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn execute(&self, request: TransportRequest) -> Result<RawResponse, TransportError> {
        self.calls.lock().unwrap().push(request.clone());
        match &self.behavior {
            Behavior::Scripted(responses) => responses
                .lock()
                .unwrap()
                .pop_front()
                .expect("mock transport ran out of scripted responses"),
            Behavior::Handler(handler) => handler(&request),
        }
    }
}

/// A JSON response with the given status
pub(crate) fn ok_json(status: u16, body: JsonValue) -> RawResponse {
    let mut headers = HashMap::new();
    headers.insert(
        "content-type".to_string(),
        "application/json".to_string(),
    );
    RawResponse {
        status,
        headers,
        body: serde_json::to_vec(&body).unwrap(),
    }
}

/// The smallest bag a descriptor accepts: every path parameter, every
/// required query parameter and file slot, and a body satisfying the
/// schema's required fields
pub(crate) fn minimal_bag(descriptor: &OperationDescriptor) -> ParameterBag {
    let mut bag = ParameterBag::new();

    for name in descriptor.path_params() {
        bag = bag.path(name.clone(), "x");
    }

    for def in descriptor.query_params() {
        if !def.required {
            continue;
        }
        let value: JsonValue = match def.allowed.as_ref().and_then(|a| a.first()) {
            Some(first) => JsonValue::String(first.clone()),
            None => match def.kind {
                ParamKind::String => "x".into(),
                ParamKind::Integer | ParamKind::Number => 1.into(),
                ParamKind::Boolean => true.into(),
            },
        };
        bag = bag.query(def.name.clone(), value);
    }

    for slot in descriptor.file_slots() {
        if slot.required {
            bag = bag.file(slot.name.clone(), ByteSource::memory(b"x".to_vec()));
        }
    }

    if descriptor.body_required() {
        if let Some(schema) = descriptor.body_schema() {
            bag = bag.body(minimal_body(schema));
        }
    }

    bag
}

fn minimal_body(schema: &JsonValue) -> JsonValue {
    let empty = serde_json::Map::new();
    let properties = schema
        .get("properties")
        .and_then(|p| p.as_object())
        .unwrap_or(&empty);
    let mut object = serde_json::Map::new();

    if let Some(required) = schema.get("required").and_then(|r| r.as_array()) {
        for name in required.iter().filter_map(|n| n.as_str()) {
            let sample = properties
                .get(name)
                .map(sample_value)
                .unwrap_or_else(|| "x".into());
            object.insert(name.to_string(), sample);
        }
    }

    JsonValue::Object(object)
}

fn sample_value(property: &JsonValue) -> JsonValue {
    if let Some(first) = property
        .get("enum")
        .and_then(|e| e.as_array())
        .and_then(|a| a.first())
    {
        return first.clone();
    }
    match property.get("type").and_then(|t| t.as_str()) {
        Some("boolean") => true.into(),
        Some("integer") | Some("number") => 1.into(),
        Some("array") => JsonValue::Array(Vec::new()),
        Some("object") => minimal_body(property),
        _ => "x".into(),
    }
}
