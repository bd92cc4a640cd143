//! Layered configuration loader (spec §4.G): an ordered list of typed
//! config documents, flattened and filtered, with last-non-nil-wins lookup
//! and a change-detection hash, the way the teacher layers Docker config
//! lookups by host (`docker.rs`'s `DockerConfig::auth_keys` fallback chain)
//! generalized to an arbitrary ordered document list.

use std::collections::HashMap;
use std::sync::Arc;

use color_eyre::eyre::Context;
use serde_json::{Map, Value};
use sha2::{Digest as _, Sha256};

use crate::Result;

/// One layer of configuration: a typed document plus the options it sets.
///
/// `options` is a [`serde_json::Map`], which (absent the `preserve_order`
/// feature, not enabled here) is `BTreeMap`-backed — keeping iteration
/// order deterministic so [`ConfigDocument::content_hash`] is stable for
/// two logically-equal documents, unlike `std::collections::HashMap`'s
/// randomized order.
#[derive(Debug, Clone)]
pub struct ConfigEntry {
    /// The entry's type string (as registered in a [`crate::scheme::Scheme`]).
    pub type_name: String,
    /// The options this layer contributes, as a flat key-value map.
    pub options: Map<String, Value>,
}

/// An ordered stack of configuration layers. Declaration order matters:
/// later entries override earlier ones for the same key (spec §4.G
/// last-non-nil-wins).
#[derive(Debug, Clone, Default)]
pub struct ConfigDocument {
    entries: Vec<ConfigEntry>,
}

impl ConfigDocument {
    /// An empty configuration document.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a layer, preserving the order entries were added in.
    pub fn push(&mut self, entry: ConfigEntry) {
        self.entries.push(entry);
    }

    /// All entries, in declaration order.
    pub fn entries(&self) -> &[ConfigEntry] {
        &self.entries
    }

    /// Keep only entries whose type matches `predicate` (spec §4.G
    /// `Filter`), preserving relative order.
    pub fn filter(&self, predicate: impl Fn(&str) -> bool) -> ConfigDocument {
        ConfigDocument {
            entries: self
                .entries
                .iter()
                .filter(|e| predicate(&e.type_name))
                .cloned()
                .collect(),
        }
    }

    /// Flatten every entry's options into a single map, later entries
    /// overriding earlier ones key-by-key (spec §4.G `FlatMap`). A `null`
    /// value does not override an earlier non-null value for the same key
    /// (last-non-nil-wins).
    pub fn flat_map(&self) -> Map<String, Value> {
        let mut out: Map<String, Value> = Map::new();
        for entry in &self.entries {
            for (key, value) in &entry.options {
                if value.is_null() && out.contains_key(key) {
                    continue;
                }
                out.insert(key.clone(), value.clone());
            }
        }
        out
    }

    /// Look up a single option by key, applying the same last-non-nil-wins
    /// rule as [`ConfigDocument::flat_map`] without materializing the full
    /// merge (spec §4.G `LookupConfig`).
    pub fn lookup_config(&self, key: &str) -> Option<&Value> {
        let mut found: Option<&Value> = None;
        for entry in &self.entries {
            if let Some(value) = entry.options.get(key) {
                if !value.is_null() {
                    found = Some(value);
                } else if found.is_none() {
                    found = Some(value);
                }
            }
        }
        found
    }

    /// A SHA-256 hash over the document's canonical JSON form, for change
    /// detection between successive fetches (spec §4.G).
    pub fn content_hash(&self) -> Result<String> {
        let canonical: Vec<(&str, &Map<String, Value>)> = self
            .entries
            .iter()
            .map(|e| (e.type_name.as_str(), &e.options))
            .collect();
        let bytes = serde_json::to_vec(&canonical)?;
        let hash = Sha256::digest(&bytes);
        Ok(hex::encode(hash))
    }
}

/// A pluggable source of configuration documents, fetched by reference
/// (spec §4.G's Kubernetes-style collector, generalized: this crate has no
/// hard Kubernetes dependency, so any backing store — a ConfigMap, a file,
/// a test double — implements this trait).
#[async_trait::async_trait]
pub trait ConfigSource: Send + Sync {
    /// Fetch the document named by `reference`.
    async fn fetch(&self, reference: &str) -> Result<ConfigDocument>;
}

/// Fetch a set of named references concurrently, then merge them in the
/// order the references were given (not completion order), per spec
/// §4.G's "concurrent fetch, declaration-order merge" collector contract.
pub async fn collect_ordered(source: &Arc<dyn ConfigSource>, references: &[String]) -> Result<ConfigDocument> {
    let mut set = tokio::task::JoinSet::new();
    for (i, reference) in references.iter().cloned().enumerate() {
        let source = source.clone();
        set.spawn(async move { (i, source.fetch(&reference).await) });
    }

    let mut slots: Vec<Option<ConfigDocument>> = (0..references.len()).map(|_| None).collect();
    while let Some(joined) = set.join_next().await {
        let (i, document) = joined.context("config fetch task panicked")?;
        slots[i] = Some(document?);
    }

    let mut merged = ConfigDocument::new();
    for slot in slots {
        merged.entries.extend(slot.expect("every index fetched").entries);
    }
    Ok(merged)
}

/// `InMemoryConfigSource` is a [`ConfigSource`] test double mapping
/// reference strings directly to documents, used to exercise the
/// merge/ordering contract without a real backing store.
#[derive(Debug, Default)]
pub struct InMemoryConfigSource {
    documents: HashMap<String, ConfigDocument>,
}

impl InMemoryConfigSource {
    /// An empty in-memory source.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a document under `reference`.
    pub fn insert(&mut self, reference: impl Into<String>, document: ConfigDocument) {
        self.documents.insert(reference.into(), document);
    }
}

#[async_trait::async_trait]
impl ConfigSource for InMemoryConfigSource {
    async fn fetch(&self, reference: &str) -> Result<ConfigDocument> {
        self.documents
            .get(reference)
            .cloned()
            .ok_or_else(|| crate::error::OcmError::NotFound { what: reference.to_string() }.into())
    }
}
