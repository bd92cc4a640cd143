//! The generic repository contract (spec §4.E): `ComponentVersionRepository`
//! plus the descriptor/resource/source types and the v2-wire ⇄ runtime
//! conversion adapters.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::blob::Blob;
use crate::digest::Digest;
use crate::Result;

/// A component's identity: name plus version, the primary key of every
/// lookup in this module.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, bon::Builder)]
pub struct Identity {
    /// The component name, e.g. `github.com/acme/widget`.
    pub name: String,
    /// The component version, e.g. `v1.2.3`.
    pub version: String,
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.name, self.version)
    }
}

/// Where a relation points: to something else inside the same component
/// version graph, or to something external.
///
/// v2 wire documents carry a `relation` string; unrecognized values widen
/// into [`Relation::Other`] rather than failing decode (DESIGN.md's Open
/// Question 3 decision), so a registry never breaks on a forward-compatible
/// plugin.
#[derive(Debug, Clone, PartialEq, Eq, strum::EnumString, strum::Display)]
#[strum(serialize_all = "lowercase")]
enum KnownRelation {
    Local,
    External,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Relation {
    Local,
    External,
    Other(String),
}

impl Serialize for Relation {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let s = match self {
            Relation::Local => KnownRelation::Local.to_string(),
            Relation::External => KnownRelation::External.to_string(),
            Relation::Other(s) => s.clone(),
        };
        s.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Relation {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(match s.parse::<KnownRelation>() {
            Ok(KnownRelation::Local) => Relation::Local,
            Ok(KnownRelation::External) => Relation::External,
            Err(_) => Relation::Other(s),
        })
    }
}

/// A resource attached to a component version: an artifact (binary,
/// image, file) it references or embeds.
#[derive(Debug, Clone, Serialize, Deserialize, bon::Builder)]
pub struct Resource {
    /// The resource's identifier within its component version.
    pub id: String,
    /// The resource's declared type (e.g. `ociImage`, `blob`).
    pub r#type: String,
    /// Local or external.
    pub relation: Relation,
    /// Digest of the resource content, when known ahead of access.
    pub digest: Option<Digest>,
    /// Access-specific metadata, kept opaque at this layer (spec §4.E: the
    /// contract layer does not interpret access types, only transports
    /// them to/from the backing plugin).
    #[builder(default)]
    pub access: serde_json::Value,
}

/// A source reference attached to a component version (e.g. the git
/// commit a component was built from). Structurally identical to
/// [`Resource`] but kept as a distinct type since the two are never
/// interchangeable at the contract layer.
#[derive(Debug, Clone, Serialize, Deserialize, bon::Builder)]
pub struct Source {
    /// The source's identifier within its component version.
    pub id: String,
    /// The source's declared type (e.g. `git`).
    pub r#type: String,
    /// Access-specific metadata, opaque at this layer.
    #[builder(default)]
    pub access: serde_json::Value,
}

/// A component version descriptor: the runtime (in-memory) representation
/// used throughout this crate, independent of whichever v2 wire encoding a
/// backing plugin happens to speak.
#[derive(Debug, Clone, Serialize, Deserialize, bon::Builder)]
pub struct Descriptor {
    pub identity: Identity,
    #[builder(default)]
    pub resources: Vec<Resource>,
    #[builder(default)]
    pub sources: Vec<Source>,
    #[builder(default)]
    pub labels: serde_json::Map<String, serde_json::Value>,
}

/// The v2 wire-format counterpart of [`Descriptor`] (spec §4.E): the shape
/// a backing plugin actually exchanges over the transport, converted to and
/// from [`Descriptor`] by [`to_v2`] and [`from_v2`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct V2Descriptor {
    pub meta: V2Meta,
    pub component: V2Component,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct V2Meta {
    pub schema_version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct V2Component {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub resources: Vec<Resource>,
    #[serde(default)]
    pub sources: Vec<Source>,
    #[serde(default)]
    pub labels: serde_json::Map<String, serde_json::Value>,
}

/// Widen a runtime descriptor into the v2 wire shape.
pub fn to_v2(descriptor: &Descriptor) -> V2Descriptor {
    V2Descriptor {
        meta: V2Meta {
            schema_version: "v2".to_string(),
        },
        component: V2Component {
            name: descriptor.identity.name.clone(),
            version: descriptor.identity.version.clone(),
            resources: descriptor.resources.clone(),
            sources: descriptor.sources.clone(),
            labels: descriptor.labels.clone(),
        },
    }
}

/// Narrow a v2 wire descriptor into the runtime representation.
pub fn from_v2(v2: V2Descriptor) -> Descriptor {
    Descriptor {
        identity: Identity {
            name: v2.component.name,
            version: v2.component.version,
        },
        resources: v2.component.resources,
        sources: v2.component.sources,
        labels: v2.component.labels,
    }
}

/// The repository contract every backing plugin implements (spec §4.E).
/// Implementations are typically a thin adapter over a
/// [`crate::plugin::PluginClientHandle`].
#[async_trait]
pub trait ComponentVersionRepository: Send + Sync {
    /// A stable identifier for this repository instance (e.g. its base URL
    /// or spec string), used in error messages and logs.
    fn identity(&self) -> &str;

    /// Resolve a typed spec to the credential-consumer identity map the
    /// backing plugin needs to authenticate (spec §4.E `GetIdentity`) — not
    /// to be confused with [`ComponentVersionRepository::identity`], which
    /// is this repository instance's own stable label.
    async fn get_identity(&self, spec: serde_json::Value) -> Result<HashMap<String, String>>;

    /// Fetch a component version's descriptor.
    async fn get_component_version(&self, name: &str, version: &str) -> Result<Descriptor>;

    /// List the versions known for a component (spec §9 Open Question 1:
    /// unsorted, non-deduplicated; see DESIGN.md).
    async fn list_component_versions(&self, name: &str) -> Result<Vec<String>>;

    /// Add (or replace) a component version's descriptor.
    async fn add_component_version(&self, descriptor: &Descriptor) -> Result<()>;

    /// Fetch a local resource's content as a blob.
    async fn get_local_resource(
        &self,
        name: &str,
        version: &str,
        resource_id: &str,
    ) -> Result<Box<dyn Blob>>;

    /// Store a local resource's content.
    async fn add_local_resource(
        &self,
        name: &str,
        version: &str,
        resource_id: &str,
        blob: Box<dyn Blob>,
    ) -> Result<()>;

    /// Fetch a local source's content as a blob.
    async fn get_local_source(&self, name: &str, version: &str, source_id: &str) -> Result<Box<dyn Blob>>;

    /// Store a local source's content.
    async fn add_local_source(
        &self,
        name: &str,
        version: &str,
        source_id: &str,
        blob: Box<dyn Blob>,
    ) -> Result<()>;

    /// Release any resources (connections, file handles) held by this
    /// repository instance.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// A [`ComponentVersionRepository`] backed by a plugin resolved through
/// [`crate::plugin::Registry`], translating the contract's calls into the
/// plugin transport's fixed endpoint surface and handling v2⇄runtime
/// conversion at the boundary.
pub struct PluginBackedRepository {
    repository_spec: String,
    handle: crate::plugin::PluginClientHandle,
    credentials: HashMap<String, String>,
}

impl PluginBackedRepository {
    /// Wrap a resolved plugin handle, scoped to one repository spec string
    /// (forwarded via the `X-Ocm-Repository` header on every call).
    pub fn new(repository_spec: impl Into<String>, handle: crate::plugin::PluginClientHandle) -> Self {
        Self {
            repository_spec: repository_spec.into(),
            handle,
            credentials: HashMap::new(),
        }
    }

    /// Attach credentials (forwarded via the `Authorization` header on
    /// every call) resolved ahead of time, e.g. from
    /// [`ComponentVersionRepository::get_identity`].
    pub fn with_credentials(mut self, credentials: HashMap<String, String>) -> Self {
        self.credentials = credentials;
        self
    }
}

#[async_trait]
impl ComponentVersionRepository for PluginBackedRepository {
    fn identity(&self) -> &str {
        &self.repository_spec
    }

    async fn get_identity(&self, spec: serde_json::Value) -> Result<HashMap<String, String>> {
        self.handle.get_identity(&self.repository_spec, &self.credentials, spec).await
    }

    async fn get_component_version(&self, name: &str, version: &str) -> Result<Descriptor> {
        let value = self
            .handle
            .get_component_version(&self.repository_spec, &self.credentials, name, version)
            .await?;
        let v2: V2Descriptor = serde_json::from_value(value)?;
        Ok(from_v2(v2))
    }

    async fn list_component_versions(&self, name: &str) -> Result<Vec<String>> {
        self.handle
            .list_component_versions(&self.repository_spec, &self.credentials, name)
            .await
    }

    async fn add_component_version(&self, descriptor: &Descriptor) -> Result<()> {
        let v2 = to_v2(descriptor);
        let value = serde_json::to_value(v2)?;
        self.handle
            .add_component_version(&self.repository_spec, &self.credentials, value)
            .await
    }

    async fn get_local_resource(&self, name: &str, version: &str, resource_id: &str) -> Result<Box<dyn Blob>> {
        let bytes = self
            .handle
            .download_local_resource(&self.repository_spec, &self.credentials, name, version, resource_id)
            .await?;
        Ok(Box::new(crate::blob::DirectBlob::new(bytes, "application/octet-stream")))
    }

    async fn add_local_resource(
        &self,
        name: &str,
        version: &str,
        resource_id: &str,
        blob: Box<dyn Blob>,
    ) -> Result<()> {
        let mut reader = blob.reader().await?;
        let mut buf = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut reader, &mut buf).await?;
        self.handle
            .upload_local_resource(&self.repository_spec, &self.credentials, name, version, resource_id, buf)
            .await
    }

    async fn get_local_source(&self, name: &str, version: &str, source_id: &str) -> Result<Box<dyn Blob>> {
        let bytes = self
            .handle
            .download_local_source(&self.repository_spec, &self.credentials, name, version, source_id)
            .await?;
        Ok(Box::new(crate::blob::DirectBlob::new(bytes, "application/octet-stream")))
    }

    async fn add_local_source(
        &self,
        name: &str,
        version: &str,
        source_id: &str,
        blob: Box<dyn Blob>,
    ) -> Result<()> {
        let mut reader = blob.reader().await?;
        let mut buf = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut reader, &mut buf).await?;
        self.handle
            .upload_local_source(&self.repository_spec, &self.credentials, name, version, source_id, buf)
            .await
    }
}
