//! Alias table mapping friendly names to canonical operations
//!
//! Aliases are a convenience overlay: a single friendly string resolving
//! directly to a canonical `(resource, operation)` pair. Targets are
//! always canonical pairs, never other aliases, so chains and cycles are
//! structurally impossible. The table is loaded once from a declarative
//! source and immutable afterwards.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::operation::OperationKey;
use crate::registry::{OperationRegistry, ALIAS_FILE, API_DEFS};

/// Errors raised while loading or consulting the alias table
#[derive(Error, Debug)]
pub enum AliasError {
    /// The alias source was syntactically or structurally malformed
    #[error("alias source could not be parsed: {0}")]
    Parse(String),

    /// The same alias name appeared twice in the source
    #[error("alias '{0}' is defined more than once")]
    Duplicate(String),

    /// An entry's target names no operation in the generated set
    #[error("alias '{alias}' targets unknown operation '{key}'")]
    UnknownTarget {
        /// The offending alias
        alias: String,
        /// The target that failed to resolve
        key: OperationKey,
    },

    /// Explicit lookup of a name absent from the table
    #[error("unknown alias '{0}'")]
    Unknown(String),

    /// The alias source file could not be read
    #[error("could not read alias source '{path}': {error}")]
    Io {
        /// Path of the unreadable source
        path: String,
        /// Underlying I/O diagnostic
        error: String,
    },
}

/// One alias definition as authored in the source
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct AliasEntry {
    /// Friendly name
    pub alias: String,
    /// Target resource
    pub resource: String,
    /// Target operation
    pub operation: String,
}

/// Immutable alias table
#[derive(Debug, Default)]
pub struct AliasRegistry {
    targets: HashMap<String, OperationKey>,
}

impl AliasRegistry {
    /// An empty table: every lookup misses
    pub fn empty() -> Self {
        Self::default()
    }

    /// Load the alias table bundled with the API definitions
    pub fn bundled() -> Result<Self, AliasError> {
        let file = API_DEFS
            .get_file(ALIAS_FILE)
            .ok_or_else(|| AliasError::Parse(format!("bundled '{ALIAS_FILE}' is missing")))?;
        let content = file
            .contents_utf8()
            .ok_or_else(|| AliasError::Parse(format!("bundled '{ALIAS_FILE}' is not UTF-8")))?;
        Self::from_json(content)
    }

    /// Parse a JSON sequence of alias entries
    pub fn from_json(source: &str) -> Result<Self, AliasError> {
        let entries: Vec<AliasEntry> =
            serde_json::from_str(source).map_err(|e| AliasError::Parse(e.to_string()))?;
        Self::from_entries(entries)
    }

    /// Parse a YAML sequence of alias entries
    pub fn from_yaml(source: &str) -> Result<Self, AliasError> {
        let entries: Vec<AliasEntry> =
            serde_yaml::from_str(source).map_err(|e| AliasError::Parse(e.to_string()))?;
        Self::from_entries(entries)
    }

    /// Load alias entries from a file, choosing the parser by extension
    /// (`.json` for JSON, anything else is treated as YAML)
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, AliasError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| AliasError::Io {
            path: path.display().to_string(),
            error: e.to_string(),
        })?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json(&content),
            _ => Self::from_yaml(&content),
        }
    }

    /// Build the table from parsed entries, rejecting duplicates
    pub fn from_entries(entries: Vec<AliasEntry>) -> Result<Self, AliasError> {
        let mut targets = HashMap::with_capacity(entries.len());
        for entry in entries {
            let key = OperationKey::new(entry.resource, entry.operation);
            if targets.insert(entry.alias.clone(), key).is_some() {
                return Err(AliasError::Duplicate(entry.alias));
            }
        }
        Ok(Self { targets })
    }

    /// Check every target against the loaded operation set.
    ///
    /// Performed at client construction so a typo in the alias source
    /// fails at startup instead of at first use.
    pub fn verify_targets(&self, registry: &OperationRegistry) -> Result<(), AliasError> {
        for (alias, key) in &self.targets {
            if !registry.contains(&key.resource, &key.operation) {
                return Err(AliasError::UnknownTarget {
                    alias: alias.clone(),
                    key: key.clone(),
                });
            }
        }
        Ok(())
    }

    /// Resolve an alias, failing with [`AliasError::Unknown`] on a miss.
    ///
    /// This is the explicit-lookup entry point; the dispatcher's lenient
    /// alias-then-literal policy uses [`AliasRegistry::get`] instead.
    pub fn resolve(&self, name: &str) -> Result<&OperationKey, AliasError> {
        self.targets
            .get(name)
            .ok_or_else(|| AliasError::Unknown(name.to_string()))
    }

    /// Look up an alias, returning `None` on a miss
    pub fn get(&self, name: &str) -> Option<&OperationKey> {
        self.targets.get(name)
    }

    /// Iterate every alias and its target
    pub fn iter(&self) -> impl Iterator<Item = (&str, &OperationKey)> {
        self.targets.iter().map(|(alias, key)| (alias.as_str(), key))
    }

    /// Number of aliases in the table
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    /// Whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}
