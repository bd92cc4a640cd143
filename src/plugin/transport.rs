//! HTTP transport between the registry and external plugin processes
//! (spec §6 endpoint table): an `axum` server side for plugins written in
//! this crate or used as test doubles, and a `reqwest` client side used by
//! [`super::Registry`] to talk to any plugin over its base URL.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use axum::extract::{Path as AxumPath, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use color_eyre::eyre::Context;
use serde_json::Value;
use tracing::instrument;

use crate::error::OcmError;
use crate::scheme::{Scheme, TypeId};
use crate::Result;

/// Header a caller attaches to identify which repository specification a
/// request concerns (spec §6: `X-Ocm-Repository`).
pub const REPOSITORY_HEADER: &str = "X-Ocm-Repository";

/// Header carrying JSON-encoded credentials for the backing plugin to use
/// against the real repository (spec §4.D/§6: `Authorization`).
pub const AUTHORIZATION_HEADER: &str = "Authorization";

/// Where a binary payload lives, passed by reference rather than inline
/// (spec §4.D: "Binary payloads... passed by reference to a local file
/// path... avoiding HTTP multipart").
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResourceLocationType {
    LocalFile,
    NamedPipe,
}

/// A reference to a binary payload living on the local filesystem, the wire
/// counterpart of an in-memory blob for `/local-resource/*` and
/// `/local-source/*` transfers (spec §4.E "blob ⇄ Location" adapter).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ResourceLocation {
    pub r#type: ResourceLocationType,
    pub value: String,
}

/// The fixed endpoint surface every external plugin implements (spec §6).
#[async_trait::async_trait]
pub trait PluginHandler: Send + Sync + 'static {
    /// `GET /healthz` — liveness.
    async fn healthz(&self) -> Result<()> {
        Ok(())
    }

    /// `GET /readyz` — readiness, separate from liveness since a plugin may
    /// be alive but still initializing.
    async fn readyz(&self) -> Result<()>;

    /// `POST /identity` — resolve a typed spec to a credential-consumer
    /// identity map (spec §4.E `GetIdentity`).
    async fn get_identity(&self, repository: &str, credentials: &HashMap<String, String>, spec: Value) -> Result<HashMap<String, String>>;

    /// `POST /component-version` — add a component version.
    async fn add_component_version(&self, repository: &str, credentials: &HashMap<String, String>, descriptor: Value) -> Result<()>;

    /// `GET /component-version` — fetch a component version.
    async fn get_component_version(
        &self,
        repository: &str,
        credentials: &HashMap<String, String>,
        name: &str,
        version: &str,
    ) -> Result<Value>;

    /// `GET /component-versions` — list versions of a component.
    async fn list_component_versions(&self, repository: &str, credentials: &HashMap<String, String>, name: &str) -> Result<Vec<String>>;

    /// `GET /local-resource/download` — fetch a local resource's bytes.
    async fn download_local_resource(
        &self,
        repository: &str,
        credentials: &HashMap<String, String>,
        name: &str,
        version: &str,
        resource_id: &str,
    ) -> Result<Vec<u8>>;

    /// `POST /local-resource/upload` — store a local resource's bytes.
    async fn upload_local_resource(
        &self,
        repository: &str,
        credentials: &HashMap<String, String>,
        name: &str,
        version: &str,
        resource_id: &str,
        content: Vec<u8>,
    ) -> Result<()>;

    /// `GET /local-source/download` — fetch a local source's bytes
    /// (symmetric with [`PluginHandler::download_local_resource`]).
    async fn download_local_source(
        &self,
        repository: &str,
        credentials: &HashMap<String, String>,
        name: &str,
        version: &str,
        source_id: &str,
    ) -> Result<Vec<u8>>;

    /// `POST /local-source/upload` — store a local source's bytes
    /// (symmetric with [`PluginHandler::upload_local_resource`]).
    async fn upload_local_source(
        &self,
        repository: &str,
        credentials: &HashMap<String, String>,
        name: &str,
        version: &str,
        source_id: &str,
        content: Vec<u8>,
    ) -> Result<()>;
}

/// Shared server state: the handler plus the scheme used to schema-validate
/// inbound requests (spec §4.D). Implemented by hand rather than
/// `#[derive(Clone)]` since only the `Arc`s need to be `Clone`, not `H`
/// itself — the derive would otherwise add an unwanted `H: Clone` bound.
struct AppState<H> {
    handler: Arc<H>,
    scheme: Arc<Scheme>,
}

impl<H> Clone for AppState<H> {
    fn clone(&self) -> Self {
        Self {
            handler: self.handler.clone(),
            scheme: self.scheme.clone(),
        }
    }
}

/// Build the fixed-route `axum` server for a [`PluginHandler`] (spec §6
/// endpoint table). This is what an in-process test double, or an external
/// plugin process implemented in Rust, serves on its listening port.
/// `scheme` supplies the JSON Schemas every inbound request is validated
/// against before the handler runs (spec §4.D); an empty [`Scheme`] (no
/// schemas registered) validates everything trivially.
pub fn router<H: PluginHandler>(handler: Arc<H>, scheme: Arc<Scheme>) -> Router {
    let state = AppState { handler, scheme };
    Router::new()
        .route("/healthz", get(healthz::<H>))
        .route("/readyz", get(readyz::<H>))
        .route("/identity", post(get_identity::<H>))
        .route("/component-version", post(add_component_version::<H>))
        .route("/component-version", get(get_component_version::<H>))
        .route("/component-versions/:name", get(list_component_versions::<H>))
        .route("/local-resource/download", get(download_local_resource::<H>))
        .route("/local-resource/upload", post(upload_local_resource::<H>))
        .route("/local-source/download", get(download_local_source::<H>))
        .route("/local-source/upload", post(upload_local_source::<H>))
        .with_state(state)
}

fn into_status(err: &color_eyre::Report) -> StatusCode {
    match err.downcast_ref::<OcmError>() {
        Some(OcmError::NotFound { .. }) => StatusCode::NOT_FOUND,
        Some(OcmError::Conflict { .. }) => StatusCode::CONFLICT,
        Some(OcmError::SchemaValidation { .. }) | Some(OcmError::Decode { .. }) => StatusCode::BAD_REQUEST,
        Some(OcmError::Permission) | Some(OcmError::ReadOnly) => StatusCode::FORBIDDEN,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(err: color_eyre::Report) -> Response {
    let status = into_status(&err);
    (status, format!("{err:#}")).into_response()
}

async fn healthz<H: PluginHandler>(State(state): State<AppState<H>>) -> Response {
    match state.handler.healthz().await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => error_response(e),
    }
}

async fn readyz<H: PluginHandler>(State(state): State<AppState<H>>) -> Response {
    match state.handler.readyz().await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => error_response(e),
    }
}

fn repository_of(headers: &HeaderMap) -> Result<String> {
    headers
        .get(REPOSITORY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .ok_or_else(|| {
            OcmError::Decode {
                detail: format!("missing {REPOSITORY_HEADER} header"),
            }
            .into()
        })
}

/// Parse the `Authorization` header as a JSON-encoded credentials map
/// (spec §4.D). Absent header means no credentials were supplied.
fn credentials_of(headers: &HeaderMap) -> Result<HashMap<String, String>> {
    let Some(raw) = headers.get(AUTHORIZATION_HEADER) else {
        return Ok(HashMap::new());
    };
    let raw = raw.to_str().map_err(|e| OcmError::Decode { detail: e.to_string() })?;
    serde_json::from_str(raw).map_err(|e| {
        OcmError::Decode {
            detail: format!("invalid {AUTHORIZATION_HEADER} header: {e}"),
        }
        .into()
    })
}

/// Validate `value` against the schema registered for `repository`'s type,
/// if the header parses as a [`TypeId`] and the scheme has one registered
/// (spec §4.D: "every inbound request is schema-validated... failures
/// return HTTP 400"). A repository string that isn't a valid type id (e.g.
/// an opaque test identifier) is not schema-validated.
fn validate_against_repository_type(scheme: &Scheme, repository: &str, value: &Value) -> Result<()> {
    let Ok(t) = TypeId::from_str(repository) else {
        return Ok(());
    };
    scheme.validate(&t, value)
}

async fn get_identity<H: PluginHandler>(
    State(state): State<AppState<H>>,
    headers: HeaderMap,
    Json(spec): Json<Value>,
) -> Response {
    let repository = match repository_of(&headers) {
        Ok(r) => r,
        Err(e) => return error_response(e),
    };
    let credentials = match credentials_of(&headers) {
        Ok(c) => c,
        Err(e) => return error_response(e),
    };
    if let Err(e) = validate_against_repository_type(&state.scheme, &repository, &spec) {
        return error_response(e);
    }
    match state.handler.get_identity(&repository, &credentials, spec).await {
        Ok(identity) => Json(identity).into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(serde::Deserialize)]
struct ComponentVersionQuery {
    name: String,
    version: String,
}

async fn add_component_version<H: PluginHandler>(
    State(state): State<AppState<H>>,
    headers: HeaderMap,
    Json(descriptor): Json<Value>,
) -> Response {
    let repository = match repository_of(&headers) {
        Ok(r) => r,
        Err(e) => return error_response(e),
    };
    let credentials = match credentials_of(&headers) {
        Ok(c) => c,
        Err(e) => return error_response(e),
    };
    if let Err(e) = validate_against_repository_type(&state.scheme, &repository, &descriptor) {
        return error_response(e);
    }
    match state.handler.add_component_version(&repository, &credentials, descriptor).await {
        Ok(()) => StatusCode::CREATED.into_response(),
        Err(e) => error_response(e),
    }
}

async fn get_component_version<H: PluginHandler>(
    State(state): State<AppState<H>>,
    headers: HeaderMap,
    axum::extract::Query(q): axum::extract::Query<ComponentVersionQuery>,
) -> Response {
    let repository = match repository_of(&headers) {
        Ok(r) => r,
        Err(e) => return error_response(e),
    };
    let credentials = match credentials_of(&headers) {
        Ok(c) => c,
        Err(e) => return error_response(e),
    };
    match state
        .handler
        .get_component_version(&repository, &credentials, &q.name, &q.version)
        .await
    {
        Ok(v) => Json(v).into_response(),
        Err(e) => error_response(e),
    }
}

async fn list_component_versions<H: PluginHandler>(
    State(state): State<AppState<H>>,
    headers: HeaderMap,
    AxumPath(name): AxumPath<String>,
) -> Response {
    let repository = match repository_of(&headers) {
        Ok(r) => r,
        Err(e) => return error_response(e),
    };
    let credentials = match credentials_of(&headers) {
        Ok(c) => c,
        Err(e) => return error_response(e),
    };
    match state.handler.list_component_versions(&repository, &credentials, &name).await {
        Ok(v) => Json(v).into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(serde::Deserialize)]
struct LocalResourceUploadQuery {
    name: String,
    version: String,
    resource_id: String,
}

#[derive(serde::Deserialize)]
struct LocalResourceDownloadQuery {
    name: String,
    version: String,
    resource_id: String,
    target_location_type: ResourceLocationType,
    target_location_value: String,
}

/// Write `target_value` per `target_type`, the destination side of the
/// by-reference payload convention (spec §4.D).
async fn write_target_location(target_type: ResourceLocationType, target_value: &str, bytes: &[u8]) -> Result<()> {
    match target_type {
        ResourceLocationType::LocalFile | ResourceLocationType::NamedPipe => tokio::fs::write(target_value, bytes)
            .await
            .with_context(|| format!("write target location {target_value}")),
    }
}

async fn download_local_resource<H: PluginHandler>(
    State(state): State<AppState<H>>,
    headers: HeaderMap,
    axum::extract::Query(q): axum::extract::Query<LocalResourceDownloadQuery>,
) -> Response {
    let repository = match repository_of(&headers) {
        Ok(r) => r,
        Err(e) => return error_response(e),
    };
    let credentials = match credentials_of(&headers) {
        Ok(c) => c,
        Err(e) => return error_response(e),
    };
    let bytes = match state
        .handler
        .download_local_resource(&repository, &credentials, &q.name, &q.version, &q.resource_id)
        .await
    {
        Ok(b) => b,
        Err(e) => return error_response(e),
    };
    match write_target_location(q.target_location_type, &q.target_location_value, &bytes).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => error_response(e),
    }
}

async fn upload_local_resource<H: PluginHandler>(
    State(state): State<AppState<H>>,
    headers: HeaderMap,
    axum::extract::Query(q): axum::extract::Query<LocalResourceUploadQuery>,
    Json(location): Json<ResourceLocation>,
) -> Response {
    let repository = match repository_of(&headers) {
        Ok(r) => r,
        Err(e) => return error_response(e),
    };
    let credentials = match credentials_of(&headers) {
        Ok(c) => c,
        Err(e) => return error_response(e),
    };
    let content = match tokio::fs::read(&location.value).await {
        Ok(c) => c,
        Err(e) => return error_response(OcmError::Decode { detail: format!("read location {}: {e}", location.value) }.into()),
    };
    match state
        .handler
        .upload_local_resource(&repository, &credentials, &q.name, &q.version, &q.resource_id, content)
        .await
    {
        Ok(()) => StatusCode::CREATED.into_response(),
        Err(e) => error_response(e),
    }
}

async fn download_local_source<H: PluginHandler>(
    State(state): State<AppState<H>>,
    headers: HeaderMap,
    axum::extract::Query(q): axum::extract::Query<LocalResourceDownloadQuery>,
) -> Response {
    let repository = match repository_of(&headers) {
        Ok(r) => r,
        Err(e) => return error_response(e),
    };
    let credentials = match credentials_of(&headers) {
        Ok(c) => c,
        Err(e) => return error_response(e),
    };
    let bytes = match state
        .handler
        .download_local_source(&repository, &credentials, &q.name, &q.version, &q.resource_id)
        .await
    {
        Ok(b) => b,
        Err(e) => return error_response(e),
    };
    match write_target_location(q.target_location_type, &q.target_location_value, &bytes).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => error_response(e),
    }
}

async fn upload_local_source<H: PluginHandler>(
    State(state): State<AppState<H>>,
    headers: HeaderMap,
    axum::extract::Query(q): axum::extract::Query<LocalResourceUploadQuery>,
    Json(location): Json<ResourceLocation>,
) -> Response {
    let repository = match repository_of(&headers) {
        Ok(r) => r,
        Err(e) => return error_response(e),
    };
    let credentials = match credentials_of(&headers) {
        Ok(c) => c,
        Err(e) => return error_response(e),
    };
    let content = match tokio::fs::read(&location.value).await {
        Ok(c) => c,
        Err(e) => return error_response(OcmError::Decode { detail: format!("read location {}: {e}", location.value) }.into()),
    };
    match state
        .handler
        .upload_local_source(&repository, &credentials, &q.name, &q.version, &q.resource_id, content)
        .await
    {
        Ok(()) => StatusCode::CREATED.into_response(),
        Err(e) => error_response(e),
    }
}

/// A client talking to a plugin process over HTTP, used by
/// [`super::Registry`] for every external (non in-process) plugin.
#[derive(Debug, Clone)]
pub struct PluginClient {
    base_url: String,
    http: reqwest::Client,
}

impl PluginClient {
    /// Construct a client for a plugin listening at `base_url`.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            http: reqwest::Client::new(),
        }
    }

    fn authorization_header(credentials: &HashMap<String, String>) -> Result<String> {
        serde_json::to_string(credentials).context("encode credentials")
    }

    #[instrument(skip(self, credentials))]
    async fn get(&self, path: &str, repository: &str, credentials: &HashMap<String, String>, query: &[(&str, &str)]) -> Result<reqwest::Response> {
        let resp = self
            .http
            .get(format!("{}{path}", self.base_url))
            .header(REPOSITORY_HEADER, repository)
            .header(AUTHORIZATION_HEADER, Self::authorization_header(credentials)?)
            .query(query)
            .send()
            .await
            .map_err(|e| OcmError::Transport { detail: e.to_string() })?;
        ensure_success(resp).await
    }

    /// `GET /readyz`.
    pub async fn readyz(&self) -> Result<()> {
        self.http
            .get(format!("{}/readyz", self.base_url))
            .send()
            .await
            .map_err(|e| OcmError::Transport { detail: e.to_string() })?
            .error_for_status()
            .map_err(|e| OcmError::Transport { detail: e.to_string() })?;
        Ok(())
    }

    /// `POST /identity`.
    pub async fn get_identity(&self, repository: &str, credentials: &HashMap<String, String>, spec: &Value) -> Result<HashMap<String, String>> {
        let resp = self
            .http
            .post(format!("{}/identity", self.base_url))
            .header(REPOSITORY_HEADER, repository)
            .header(AUTHORIZATION_HEADER, Self::authorization_header(credentials)?)
            .json(spec)
            .send()
            .await
            .map_err(|e| OcmError::Transport { detail: e.to_string() })?;
        let resp = ensure_success(resp).await?;
        resp.json().await.context("decode identity response")
    }

    /// `GET /component-version`.
    pub async fn get_component_version(&self, repository: &str, credentials: &HashMap<String, String>, name: &str, version: &str) -> Result<Value> {
        let resp = self
            .get("/component-version", repository, credentials, &[("name", name), ("version", version)])
            .await?;
        resp.json().await.context("decode component version response")
    }

    /// `POST /component-version`.
    pub async fn add_component_version(&self, repository: &str, credentials: &HashMap<String, String>, descriptor: &Value) -> Result<()> {
        let resp = self
            .http
            .post(format!("{}/component-version", self.base_url))
            .header(REPOSITORY_HEADER, repository)
            .header(AUTHORIZATION_HEADER, Self::authorization_header(credentials)?)
            .json(descriptor)
            .send()
            .await
            .map_err(|e| OcmError::Transport { detail: e.to_string() })?;
        ensure_success(resp).await?;
        Ok(())
    }

    /// `GET /component-versions/{name}`.
    pub async fn list_component_versions(&self, repository: &str, credentials: &HashMap<String, String>, name: &str) -> Result<Vec<String>> {
        let resp = self
            .get(&format!("/component-versions/{name}"), repository, credentials, &[])
            .await?;
        resp.json().await.context("decode component-version list")
    }

    /// `GET /local-resource/download`, writing the fetched bytes through a
    /// temporary file the way the plugin wire protocol requires (spec §4.E
    /// "blob ⇄ Location" adapter: "reads a temp file for download").
    pub async fn download_local_resource(
        &self,
        repository: &str,
        credentials: &HashMap<String, String>,
        name: &str,
        version: &str,
        resource_id: &str,
    ) -> Result<Vec<u8>> {
        self.download_local("/local-resource/download", repository, credentials, name, version, resource_id)
            .await
    }

    /// `POST /local-resource/upload`, staging `content` through a temporary
    /// file the way the plugin wire protocol requires (spec §4.E "blob ⇄
    /// Location" adapter: "writes to a temp file for upload").
    pub async fn upload_local_resource(
        &self,
        repository: &str,
        credentials: &HashMap<String, String>,
        name: &str,
        version: &str,
        resource_id: &str,
        content: Vec<u8>,
    ) -> Result<()> {
        self.upload_local("/local-resource/upload", repository, credentials, name, version, resource_id, content)
            .await
    }

    /// `GET /local-source/download` (symmetric with
    /// [`PluginClient::download_local_resource`]).
    pub async fn download_local_source(
        &self,
        repository: &str,
        credentials: &HashMap<String, String>,
        name: &str,
        version: &str,
        source_id: &str,
    ) -> Result<Vec<u8>> {
        self.download_local("/local-source/download", repository, credentials, name, version, source_id)
            .await
    }

    /// `POST /local-source/upload` (symmetric with
    /// [`PluginClient::upload_local_resource`]).
    pub async fn upload_local_source(
        &self,
        repository: &str,
        credentials: &HashMap<String, String>,
        name: &str,
        version: &str,
        source_id: &str,
        content: Vec<u8>,
    ) -> Result<()> {
        self.upload_local("/local-source/upload", repository, credentials, name, version, source_id, content)
            .await
    }

    async fn download_local(
        &self,
        path: &str,
        repository: &str,
        credentials: &HashMap<String, String>,
        name: &str,
        version: &str,
        id: &str,
    ) -> Result<Vec<u8>> {
        let target = tempfile::NamedTempFile::new().context("create temp file for download target")?;
        let target_path = target.path().to_string_lossy().to_string();

        let resp = self
            .http
            .get(format!("{}{path}", self.base_url))
            .header(REPOSITORY_HEADER, repository)
            .header(AUTHORIZATION_HEADER, Self::authorization_header(credentials)?)
            .query(&[
                ("name", name),
                ("version", version),
                ("resource_id", id),
                ("target_location_type", "localFile"),
                ("target_location_value", &target_path),
            ])
            .send()
            .await
            .map_err(|e| OcmError::Transport { detail: e.to_string() })?;
        ensure_success(resp).await?;

        tokio::fs::read(&target_path)
            .await
            .with_context(|| format!("read download target {target_path}"))
    }

    async fn upload_local(
        &self,
        path: &str,
        repository: &str,
        credentials: &HashMap<String, String>,
        name: &str,
        version: &str,
        id: &str,
        content: Vec<u8>,
    ) -> Result<()> {
        let mut source = tempfile::NamedTempFile::new().context("create temp file for upload source")?;
        std::io::Write::write_all(&mut source, &content).context("stage upload content")?;
        let source_path = source.path().to_string_lossy().to_string();

        let location = ResourceLocation {
            r#type: ResourceLocationType::LocalFile,
            value: source_path,
        };

        let resp = self
            .http
            .post(format!("{}{path}", self.base_url))
            .header(REPOSITORY_HEADER, repository)
            .header(AUTHORIZATION_HEADER, Self::authorization_header(credentials)?)
            .query(&[("name", name), ("version", version), ("resource_id", id)])
            .json(&location)
            .send()
            .await
            .map_err(|e| OcmError::Transport { detail: e.to_string() })?;
        ensure_success(resp).await?;
        Ok(())
    }
}

async fn ensure_success(resp: reqwest::Response) -> Result<reqwest::Response> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    if status == reqwest::StatusCode::NOT_FOUND {
        return Err(OcmError::NotFound { what: body }.into());
    }
    if status == reqwest::StatusCode::BAD_REQUEST {
        return Err(OcmError::SchemaValidation { detail: body }.into());
    }
    Err(OcmError::Transport {
        detail: format!("{status}: {body}"),
    }
    .into())
}
