//! Layered configuration end to end: concurrent fetch-by-reference,
//! ordered merge, and change-detection hashing together.

use ocm_core::config::{collect_ordered, ConfigDocument, ConfigEntry, ConfigSource, InMemoryConfigSource};
use serde_json::json;
use std::sync::Arc;

fn entry(type_name: &str, options: &[(&str, serde_json::Value)]) -> ConfigEntry {
    ConfigEntry {
        type_name: type_name.to_string(),
        options: options.iter().cloned().map(|(k, v)| (k.to_string(), v)).collect(),
    }
}

#[tokio::test]
async fn layered_fetch_merges_in_reference_order_and_hash_changes_on_edit() {
    let mut source = InMemoryConfigSource::new();

    let mut base = ConfigDocument::new();
    base.push(entry("GenericConfig", &[("registry", json!("ghcr.io")), ("timeout", json!(30))]));

    let mut overrides = ConfigDocument::new();
    overrides.push(entry("GenericConfig", &[("timeout", json!(5))]));

    source.insert("base", base);
    source.insert("overrides", overrides.clone());

    let source: Arc<dyn ConfigSource> = Arc::new(source);
    let merged = collect_ordered(&source, &["base".to_string(), "overrides".to_string()])
        .await
        .expect("collect");

    let flattened = merged.flat_map();
    assert_eq!(flattened["registry"], json!("ghcr.io"));
    assert_eq!(flattened["timeout"], json!(5));

    let before_hash = merged.content_hash().expect("hash");

    overrides.push(entry("GenericConfig", &[("timeout", json!(15))]));
    let mut edited_source = InMemoryConfigSource::new();
    let mut base2 = ConfigDocument::new();
    base2.push(entry("GenericConfig", &[("registry", json!("ghcr.io")), ("timeout", json!(30))]));
    edited_source.insert("base", base2);
    edited_source.insert("overrides", overrides);
    let edited_source: Arc<dyn ConfigSource> = Arc::new(edited_source);

    let merged_after_edit = collect_ordered(&edited_source, &["base".to_string(), "overrides".to_string()])
        .await
        .expect("collect edited");
    let after_hash = merged_after_edit.content_hash().expect("hash");

    assert_ne!(before_hash, after_hash);
}
