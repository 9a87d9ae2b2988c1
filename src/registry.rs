//! Operation registry built from the bundled API definitions
//!
//! The registry is the explicit replacement for call-time reflection:
//! every generated operation is enumerated once at construction, its
//! parameter partition introspected, and its descriptor memoized under
//! the canonical `resource/operation` key. Lookups after that are pure
//! map reads.

use std::collections::HashMap;
use std::sync::Arc;

use include_dir::{include_dir, Dir};

use crate::operation::{
    OperationDescriptor, OperationKey, OperationRef, RegistryError, ResourceDef,
};

// Bundle the generated API definitions at compile time
pub(crate) static API_DEFS: Dir = include_dir!("$CARGO_MANIFEST_DIR/apidef");

/// File inside `apidef/` holding alias entries rather than operations
pub(crate) const ALIAS_FILE: &str = "aliases.json";

/// Registry of every operation in the generated set
#[derive(Debug)]
pub struct OperationRegistry {
    descriptors: HashMap<OperationKey, Arc<OperationDescriptor>>,
}

impl OperationRegistry {
    /// Build the registry from the definitions bundled into the crate.
    ///
    /// Every `apidef/*.json` file except the alias table is parsed as a
    /// [`ResourceDef`]; a malformed file or duplicate key fails the whole
    /// load, since a partially-populated registry would turn a packaging
    /// mistake into runtime `UnknownOperation` noise.
    pub fn bundled() -> Result<Self, RegistryError> {
        let mut defs = Vec::new();

        for file in API_DEFS.files() {
            let extension = file.path().extension().and_then(|e| e.to_str());
            if extension != Some("json") {
                continue;
            }
            let file_name = file
                .path()
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("<unknown>");
            if file_name == ALIAS_FILE {
                continue;
            }

            let content = file.contents_utf8().ok_or_else(|| RegistryError::Definition {
                file: file_name.to_string(),
                error: "not valid UTF-8".to_string(),
            })?;

            let def: ResourceDef =
                serde_json::from_str(content).map_err(|e| RegistryError::Definition {
                    file: file_name.to_string(),
                    error: e.to_string(),
                })?;
            defs.push(def);
        }

        Self::from_definitions(defs)
    }

    /// Build a registry from already-parsed resource definitions
    pub fn from_definitions(defs: Vec<ResourceDef>) -> Result<Self, RegistryError> {
        let mut descriptors = HashMap::new();

        for resource in &defs {
            for op in &resource.operations {
                let descriptor = OperationDescriptor::from_def(&resource.resource, op)?;
                let key = descriptor.key().clone();
                if descriptors.insert(key.clone(), Arc::new(descriptor)).is_some() {
                    return Err(RegistryError::DuplicateOperation { key });
                }
            }
        }

        Ok(Self { descriptors })
    }

    /// Resolve a canonical `(resource, operation)` pair to its descriptor
    pub fn resolve(
        &self,
        resource: &str,
        operation: &str,
    ) -> Result<Arc<OperationDescriptor>, RegistryError> {
        let key = OperationKey::new(resource, operation);
        self.descriptors
            .get(&key)
            .cloned()
            .ok_or(RegistryError::UnknownOperation { key })
    }

    /// Resolve a generated [`OperationRef`] to its descriptor.
    ///
    /// A ref that names nothing in the loaded set fails exactly like an
    /// unknown string pair; this rejects handles fabricated outside the
    /// generated constants.
    pub fn resolve_ref(
        &self,
        op_ref: OperationRef,
    ) -> Result<Arc<OperationDescriptor>, RegistryError> {
        self.resolve(op_ref.resource(), op_ref.operation())
    }

    /// Whether the given key names an operation in the loaded set
    pub fn contains(&self, resource: &str, operation: &str) -> bool {
        self.descriptors
            .contains_key(&OperationKey::new(resource, operation))
    }

    /// Iterate all descriptors in the loaded set
    pub fn descriptors(&self) -> impl Iterator<Item = &Arc<OperationDescriptor>> {
        self.descriptors.values()
    }

    /// Number of operations in the loaded set
    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    /// Whether the registry holds no operations
    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}
