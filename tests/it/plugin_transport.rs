//! End-to-end plugin HTTP flow: a real `axum` server wired through a real
//! `reqwest` client, rather than the in-process handler calls exercised by
//! `src/plugin/mod.rs`'s own unit tests.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use ocm_core::error::OcmError;
use ocm_core::plugin::transport::{router, PluginClient, PluginHandler, REPOSITORY_HEADER};
use ocm_core::scheme::{Scheme, TypeId};
use ocm_core::Result;
use serde_json::{json, Value};
use std::str::FromStr;
use tokio::sync::Mutex;

#[derive(Default)]
struct DummyRepositoryV1 {
    versions: Mutex<Vec<(String, Value)>>,
    resources: Mutex<Vec<u8>>,
    sources: Mutex<Vec<u8>>,
}

#[async_trait]
impl PluginHandler for DummyRepositoryV1 {
    async fn readyz(&self) -> Result<()> {
        Ok(())
    }

    async fn get_identity(&self, _repository: &str, credentials: &HashMap<String, String>, _spec: Value) -> Result<HashMap<String, String>> {
        Ok(credentials.clone())
    }

    async fn add_component_version(&self, _repository: &str, _credentials: &HashMap<String, String>, descriptor: Value) -> Result<()> {
        let version = descriptor["component"]["version"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        self.versions.lock().await.push((version, descriptor));
        Ok(())
    }

    async fn get_component_version(&self, _repository: &str, _credentials: &HashMap<String, String>, _name: &str, version: &str) -> Result<Value> {
        let versions = self.versions.lock().await;
        versions
            .iter()
            .find(|(v, _)| v == version)
            .map(|(_, d)| d.clone())
            .ok_or_else(|| OcmError::NotFound { what: version.into() }.into())
    }

    async fn list_component_versions(&self, _repository: &str, _credentials: &HashMap<String, String>, _name: &str) -> Result<Vec<String>> {
        Ok(self.versions.lock().await.iter().map(|(v, _)| v.clone()).collect())
    }

    async fn download_local_resource(
        &self,
        _repository: &str,
        _credentials: &HashMap<String, String>,
        _name: &str,
        _version: &str,
        _resource_id: &str,
    ) -> Result<Vec<u8>> {
        Ok(self.resources.lock().await.clone())
    }

    async fn upload_local_resource(
        &self,
        _repository: &str,
        _credentials: &HashMap<String, String>,
        _name: &str,
        _version: &str,
        _resource_id: &str,
        content: Vec<u8>,
    ) -> Result<()> {
        *self.resources.lock().await = content;
        Ok(())
    }

    async fn download_local_source(
        &self,
        _repository: &str,
        _credentials: &HashMap<String, String>,
        _name: &str,
        _version: &str,
        _source_id: &str,
    ) -> Result<Vec<u8>> {
        Ok(self.sources.lock().await.clone())
    }

    async fn upload_local_source(
        &self,
        _repository: &str,
        _credentials: &HashMap<String, String>,
        _name: &str,
        _version: &str,
        _source_id: &str,
        content: Vec<u8>,
    ) -> Result<()> {
        *self.sources.lock().await = content;
        Ok(())
    }
}

async fn spawn_server(scheme: Scheme) -> String {
    let handler = Arc::new(DummyRepositoryV1::default());
    let app = router(handler, Arc::new(scheme));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local_addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    format!("http://{addr}")
}

#[tokio::test]
async fn full_round_trip_over_http() {
    let base_url = spawn_server(Scheme::new()).await;
    let client = PluginClient::new(base_url);
    let credentials = HashMap::from([("token".to_string(), "secret".to_string())]);

    client.readyz().await.expect("ready");

    let descriptor = json!({
        "meta": {"schemaVersion": "v2"},
        "component": {
            "name": "github.com/acme/widget",
            "version": "v1.0.0",
            "resources": [],
            "sources": [],
            "labels": {},
        }
    });
    client
        .add_component_version("DummyRepository/v1", &credentials, &descriptor)
        .await
        .expect("add");

    let fetched = client
        .get_component_version("DummyRepository/v1", &credentials, "github.com/acme/widget", "v1.0.0")
        .await
        .expect("get");
    assert_eq!(fetched["component"]["version"], "v1.0.0");

    let versions = client
        .list_component_versions("DummyRepository/v1", &credentials, "github.com/acme/widget")
        .await
        .expect("list");
    assert_eq!(versions, vec!["v1.0.0".to_string()]);

    client
        .upload_local_resource(
            "DummyRepository/v1",
            &credentials,
            "github.com/acme/widget",
            "v1.0.0",
            "image",
            b"layer-bytes".to_vec(),
        )
        .await
        .expect("upload");
    let downloaded = client
        .download_local_resource("DummyRepository/v1", &credentials, "github.com/acme/widget", "v1.0.0", "image")
        .await
        .expect("download");
    assert_eq!(downloaded, b"layer-bytes");

    client
        .upload_local_source(
            "DummyRepository/v1",
            &credentials,
            "github.com/acme/widget",
            "v1.0.0",
            "git",
            b"source-bytes".to_vec(),
        )
        .await
        .expect("upload source");
    let downloaded_source = client
        .download_local_source("DummyRepository/v1", &credentials, "github.com/acme/widget", "v1.0.0", "git")
        .await
        .expect("download source");
    assert_eq!(downloaded_source, b"source-bytes");
    assert_ne!(downloaded_source, downloaded);

    let identity = client
        .get_identity("DummyRepository/v1", &credentials, &json!({"type": "DummyRepository/v1"}))
        .await
        .expect("identity");
    assert_eq!(identity.get("token"), Some(&"secret".to_string()));
}

#[tokio::test]
async fn missing_repository_header_is_rejected() {
    let base_url = spawn_server(Scheme::new()).await;
    let http = reqwest::Client::new();
    let resp = http
        .get(format!("{base_url}/component-version?name=x&version=v1"))
        .send()
        .await
        .expect("send");
    assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);

    let resp_with_header = http
        .get(format!("{base_url}/component-version?name=x&version=v1"))
        .header(REPOSITORY_HEADER, "DummyRepository/v1")
        .send()
        .await
        .expect("send");
    assert_eq!(resp_with_header.status(), reqwest::StatusCode::NOT_FOUND);
}

fn strict_type() -> TypeId {
    TypeId::from_str("DummyRepository/v1").expect("valid literal")
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct StrictDescriptor {
    #[serde(default = "strict_type", rename = "type")]
    r#type: TypeId,
    #[serde(default, rename = "requiredField")]
    required_field: Option<String>,
}

impl Default for StrictDescriptor {
    fn default() -> Self {
        Self { r#type: strict_type(), required_field: None }
    }
}

ocm_core::typed_object!(StrictDescriptor);

#[tokio::test]
async fn schema_validation_rejects_non_conforming_descriptor() {
    let mut scheme = Scheme::new();
    scheme.register_with_alias::<StrictDescriptor>([strict_type()]).expect("register");
    scheme
        .set_schema(
            &strict_type(),
            json!({
                "type": "object",
                "required": ["requiredField"],
            }),
        )
        .expect("set schema");

    let base_url = spawn_server(scheme).await;
    let http = reqwest::Client::new();
    let resp = http
        .post(format!("{base_url}/component-version"))
        .header(REPOSITORY_HEADER, "DummyRepository/v1")
        .json(&json!({"type": "DummyRepository/v1"}))
        .send()
        .await
        .expect("send");
    assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);
}
