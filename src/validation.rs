//! Request validation against an operation's declared parameters
//!
//! A bag is validated as a whole before dispatch: every violation is
//! collected into one ordered report rather than failing on the first
//! problem, so a caller can fix a malformed request in a single pass.
//! Validation never mutates the bag and performs no I/O.

use std::fmt;

use jsonschema::error::ValidationErrorKind;
use serde_json::Value as JsonValue;

use crate::operation::{OperationDescriptor, ParamKind};
use crate::params::{Body, ParameterBag};

/// One field-level violation: where, what was expected, what arrived
#[derive(Debug, Clone, PartialEq)]
pub struct Violation {
    /// Path of the offending field, e.g. `query/limit` or `body/value`
    pub field: String,
    /// The constraint that was not met
    pub constraint: String,
    /// The offending value, when one was supplied
    pub value: Option<JsonValue>,
}

impl Violation {
    fn new(field: impl Into<String>, constraint: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            constraint: constraint.into(),
            value: None,
        }
    }

    fn with_value(mut self, value: JsonValue) -> Self {
        self.value = Some(value);
        self
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            Some(value) => write!(f, "{}: {} (got {})", self.field, self.constraint, value),
            None => write!(f, "{}: {}", self.field, self.constraint),
        }
    }
}

/// A parameter bag failed validation; carries every violation found
#[derive(Debug, Clone)]
pub struct RequestValidationError {
    /// Ordered, non-empty list of violations
    pub violations: Vec<Violation>,
}

impl fmt::Display for RequestValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "request validation failed ({} violation(s)):", self.violations.len())?;
        for violation in &self.violations {
            writeln!(f, "  - {violation}")?;
        }
        Ok(())
    }
}

impl std::error::Error for RequestValidationError {}

/// Validate a bag against a descriptor.
///
/// Checks, in order: unknown and missing path parameters, unknown and
/// missing query parameters plus scalar-kind conformance, unknown and
/// missing file slots, and the request body against the operation's
/// schema fragment. `Body::Model` payloads skip the schema check; the
/// generated model already guarantees its own shape.
pub fn validate(
    descriptor: &OperationDescriptor,
    bag: &ParameterBag,
) -> Result<(), RequestValidationError> {
    let mut violations = Vec::new();

    check_path_params(descriptor, bag, &mut violations);
    check_query_params(descriptor, bag, &mut violations);
    check_file_slots(descriptor, bag, &mut violations);
    check_body(descriptor, bag, &mut violations);

    if violations.is_empty() {
        Ok(())
    } else {
        Err(RequestValidationError { violations })
    }
}

fn check_path_params(
    descriptor: &OperationDescriptor,
    bag: &ParameterBag,
    violations: &mut Vec<Violation>,
) {
    for (name, value) in bag.path_params() {
        if !descriptor.path_params().iter().any(|p| p == name) {
            violations.push(
                Violation::new(
                    format!("path/{name}"),
                    "not a declared path parameter of this operation",
                )
                .with_value(value.clone()),
            );
        } else if !is_scalar(value) {
            violations.push(
                Violation::new(format!("path/{name}"), "path values must be scalars")
                    .with_value(value.clone()),
            );
        }
    }

    for name in descriptor.path_params() {
        if !bag.path_params().contains_key(name) {
            violations.push(Violation::new(
                format!("path/{name}"),
                "required path parameter is missing",
            ));
        }
    }
}

fn check_query_params(
    descriptor: &OperationDescriptor,
    bag: &ParameterBag,
    violations: &mut Vec<Violation>,
) {
    for (name, value) in bag.query_params() {
        let Some(def) = descriptor.query_param(name) else {
            violations.push(
                Violation::new(
                    format!("query/{name}"),
                    "not a declared query parameter of this operation",
                )
                .with_value(value.clone()),
            );
            continue;
        };

        if !is_scalar(value) {
            violations.push(
                Violation::new(format!("query/{name}"), "query values must be scalars")
                    .with_value(value.clone()),
            );
            continue;
        }

        if !kind_accepts(def.kind, value) {
            violations.push(
                Violation::new(
                    format!("query/{name}"),
                    format!("value is not coercible to {:?}", def.kind),
                )
                .with_value(value.clone()),
            );
        }

        if let Some(allowed) = &def.allowed {
            let rendered = crate::params::scalar_to_string(value).unwrap_or_default();
            if !allowed.iter().any(|a| a == &rendered) {
                violations.push(
                    Violation::new(
                        format!("query/{name}"),
                        format!("value must be one of: {}", allowed.join(", ")),
                    )
                    .with_value(value.clone()),
                );
            }
        }
    }

    for def in descriptor.query_params() {
        if def.required && !bag.query_params().contains_key(&def.name) {
            violations.push(Violation::new(
                format!("query/{}", def.name),
                "required query parameter is missing",
            ));
        }
    }
}

fn check_file_slots(
    descriptor: &OperationDescriptor,
    bag: &ParameterBag,
    violations: &mut Vec<Violation>,
) {
    for name in bag.files().keys() {
        if descriptor.file_slot(name).is_none() {
            violations.push(Violation::new(
                format!("files/{name}"),
                "not a declared file slot of this operation",
            ));
        }
    }

    for slot in descriptor.file_slots() {
        if slot.required && !bag.files().contains_key(&slot.name) {
            violations.push(Violation::new(
                format!("files/{}", slot.name),
                "required file slot is empty",
            ));
        }
    }
}

fn check_body(
    descriptor: &OperationDescriptor,
    bag: &ParameterBag,
    violations: &mut Vec<Violation>,
) {
    match (descriptor.body_schema(), bag.body_payload()) {
        (None, None) => {}
        (None, Some(body)) => {
            violations.push(
                Violation::new("body", "this operation accepts no request body")
                    .with_value(body.value().clone()),
            );
        }
        (Some(_), None) => {
            if descriptor.body_required() {
                violations.push(Violation::new("body", "required request body is missing"));
            }
        }
        (Some(_), Some(Body::Model(_))) => {
            // Typed models validate themselves; nothing to check here.
        }
        (Some(_), Some(Body::Raw(value))) => {
            let Some(schema) = descriptor.compiled_body_schema() else {
                return;
            };
            if let Err(errors) = schema.validate(value) {
                for error in errors {
                    violations.push(schema_error_to_violation(&error));
                }
            }
        }
    }
}

/// Map one `jsonschema` diagnostic to a violation with a useful field
/// path. Missing-property errors point at the absent field itself, not
/// at the object that lacks it.
fn schema_error_to_violation(error: &jsonschema::ValidationError<'_>) -> Violation {
    let pointer = error.instance_path.to_string();

    let field = match &error.kind {
        ValidationErrorKind::Required { property } => {
            let name = property.as_str().unwrap_or("<unknown>");
            if pointer.is_empty() {
                format!("body/{name}")
            } else {
                format!("body{pointer}/{name}")
            }
        }
        _ => {
            if pointer.is_empty() {
                "body".to_string()
            } else {
                format!("body{pointer}")
            }
        }
    };

    let constraint = match &error.kind {
        ValidationErrorKind::Required { property } => format!(
            "required field '{}' is missing",
            property.as_str().unwrap_or("<unknown>")
        ),
        _ => error.to_string(),
    };

    let violation = Violation::new(field, constraint);
    match &error.kind {
        // The offending "value" of a missing field is the absence itself
        ValidationErrorKind::Required { .. } => violation,
        _ => violation.with_value(error.instance.clone().into_owned()),
    }
}

fn is_scalar(value: &JsonValue) -> bool {
    matches!(
        value,
        JsonValue::String(_) | JsonValue::Number(_) | JsonValue::Bool(_)
    )
}

fn kind_accepts(kind: ParamKind, value: &JsonValue) -> bool {
    match kind {
        ParamKind::String => true,
        ParamKind::Integer => match value {
            JsonValue::Number(n) => n.is_i64() || n.is_u64(),
            JsonValue::String(s) => s.parse::<i64>().is_ok(),
            _ => false,
        },
        ParamKind::Number => match value {
            JsonValue::Number(_) => true,
            JsonValue::String(s) => s.parse::<f64>().is_ok(),
            _ => false,
        },
        ParamKind::Boolean => match value {
            JsonValue::Bool(_) => true,
            JsonValue::String(s) => s == "true" || s == "false",
            _ => false,
        },
    }
}
