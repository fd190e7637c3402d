//! Label mapping table used by the admission translator.
//!
//! The table is immutable once built. Reloads build a fresh table and swap it
//! in behind [`SharedMappingTable`], so readers always see one complete
//! snapshot.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::RwLock;

use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;
use tracing::debug;
use tracing::warn;

use crate::AcceleratorFunctionSpec;
use crate::FunctionId;
use crate::InterfaceId;
use crate::LogicalFunctionId;
use crate::NamingError;
use crate::ResourceName;

/// How a mapped label is satisfied on a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum MappingMode {
    /// Orchestrated: any region of the interface, programmed on demand.
    Region,
    /// Preprogrammed: a port that already carries the function.
    Af,
}

/// One `label -> (interface id, function id)` binding.
///
/// Entries without a namespace apply to every namespace; a namespaced entry
/// shadows a global one with the same label inside its namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingEntry {
    pub namespace: Option<String>,
    pub label: String,
    pub function: LogicalFunctionId,
    pub mode: MappingMode,
}

impl MappingEntry {
    pub fn from_spec(label: &str, spec: &AcceleratorFunctionSpec) -> Result<Self, NamingError> {
        Ok(Self {
            namespace: None,
            label: label.to_string(),
            function: LogicalFunctionId::new(
                InterfaceId::parse(&spec.interface_id)?,
                FunctionId::parse(&spec.afu_id)?,
            ),
            mode: spec.mode,
        })
    }

    pub fn in_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Concrete resource name the label is rewritten to.
    pub fn resource_name(&self) -> ResourceName {
        match self.mode {
            MappingMode::Region => {
                ResourceName::orchestrated(self.function.interface_id.clone())
            }
            MappingMode::Af => ResourceName::preprogrammed(self.function.clone()),
        }
    }
}

type EntryKey = (Option<String>, String);

/// An immutable label lookup table keyed by `(namespace, label)`.
#[derive(Debug, Clone, Default)]
pub struct MappingTable {
    entries: HashMap<EntryKey, MappingEntry>,
}

impl MappingTable {
    /// Builds a table; the first entry for a `(namespace, label)` pair wins.
    pub fn from_entries(entries: impl IntoIterator<Item = MappingEntry>) -> Self {
        let mut table = HashMap::new();
        for entry in entries {
            let key = (entry.namespace.clone(), entry.label.clone());
            if table.contains_key(&key) {
                warn!(
                    namespace = entry.namespace.as_deref().unwrap_or("*"),
                    label = %entry.label,
                    "duplicate mapping entry ignored"
                );
                continue;
            }
            table.insert(key, entry);
        }
        Self { entries: table }
    }

    /// Resolves `label` for a pod in `namespace`, preferring an entry of that
    /// namespace over a global one.
    pub fn lookup(&self, namespace: Option<&str>, label: &str) -> Option<&MappingEntry> {
        namespace
            .and_then(|namespace| {
                self.entries
                    .get(&(Some(namespace.to_string()), label.to_string()))
            })
            .or_else(|| self.entries.get(&(None, label.to_string())))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Where a group of entries came from. Earlier sources win on conflicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MappingSource {
    File,
    Cluster,
}

/// Hot-reloadable handle around the current [`MappingTable`] snapshot.
#[derive(Debug, Default)]
pub struct SharedMappingTable {
    sources: Mutex<BTreeMap<MappingSource, Vec<MappingEntry>>>,
    current: RwLock<Arc<MappingTable>>,
}

impl SharedMappingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entries(source: MappingSource, entries: Vec<MappingEntry>) -> Self {
        let shared = Self::new();
        shared.replace_source(source, entries);
        shared
    }

    /// Current snapshot. Holding it keeps that version alive across reloads.
    pub fn snapshot(&self) -> Arc<MappingTable> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replaces every entry of `source` and publishes a new merged snapshot.
    pub fn replace_source(&self, source: MappingSource, entries: Vec<MappingEntry>) {
        let mut sources = self.sources.lock().unwrap_or_else(PoisonError::into_inner);
        sources.insert(source, entries);
        let merged = MappingTable::from_entries(sources.values().flatten().cloned());
        debug!(?source, entries = merged.len(), "publishing mapping table");
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(merged);
    }
}

#[derive(Debug, Deserialize)]
struct CollectionDocument {
    kind: Option<String>,
    metadata: Option<DocumentMetadata>,
    spec: Option<serde_yaml::Value>,
    items: Option<Vec<serde_yaml::Value>>,
}

#[derive(Debug, Deserialize)]
struct DocumentMetadata {
    name: Option<String>,
    namespace: Option<String>,
}

/// Result of parsing a mapping collection.
#[derive(Debug, Default)]
pub struct ParsedCollection {
    pub entries: Vec<MappingEntry>,
    pub skipped: usize,
}

/// Parses a YAML stream of `AcceleratorFunction` documents (or `List`s of
/// them). Malformed documents are skipped with a warning.
pub fn parse_collection(yaml: &str) -> ParsedCollection {
    let mut parsed = ParsedCollection::default();
    let mut pending: Vec<serde_yaml::Value> = Vec::new();

    for document in serde_yaml::Deserializer::from_str(yaml) {
        match serde_yaml::Value::deserialize(document) {
            Ok(serde_yaml::Value::Null) => {}
            Ok(value) => pending.push(value),
            Err(e) => {
                warn!("skipping unreadable mapping document: {e}");
                parsed.skipped += 1;
            }
        }
    }

    while let Some(value) = pending.pop() {
        let document: CollectionDocument = match serde_yaml::from_value(value) {
            Ok(document) => document,
            Err(e) => {
                warn!("skipping malformed mapping document: {e}");
                parsed.skipped += 1;
                continue;
            }
        };

        if let Some(items) = document.items {
            pending.extend(items);
            continue;
        }

        match document_to_entry(document) {
            Ok(entry) => parsed.entries.push(entry),
            Err(reason) => {
                warn!("skipping mapping document: {reason}");
                parsed.skipped += 1;
            }
        }
    }

    parsed.entries.sort_by(|a, b| a.label.cmp(&b.label));
    parsed
}

fn document_to_entry(document: CollectionDocument) -> Result<MappingEntry, String> {
    if document.kind.as_deref() != Some("AcceleratorFunction") {
        return Err(format!("unexpected kind {:?}", document.kind));
    }
    let (label, namespace) = document
        .metadata
        .and_then(|metadata| Some((metadata.name?, metadata.namespace)))
        .ok_or_else(|| "missing metadata.name".to_string())?;
    let spec: AcceleratorFunctionSpec = document
        .spec
        .ok_or_else(|| format!("{label}: missing spec"))
        .and_then(|spec| serde_yaml::from_value(spec).map_err(|e| format!("{label}: {e}")))?;
    let entry = MappingEntry::from_spec(&label, &spec).map_err(|e| format!("{label}: {e}"))?;
    Ok(match namespace {
        Some(namespace) => entry.in_namespace(namespace),
        None => entry,
    })
}
