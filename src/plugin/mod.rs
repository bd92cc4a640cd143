//! Plugin registry and lifecycle (spec §4.D): internal (in-process) and
//! external (child-process over HTTP) repository backends behind one
//! lookup table.

pub mod transport;

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use color_eyre::eyre::{bail, ensure, Context};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tap::TapFallible;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, instrument, warn};

use crate::error::OcmError;
use crate::scheme::TypeId;
use crate::Result;
use transport::PluginClient;

/// A plugin's supervised lifecycle state (spec §4.D state machine).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginState {
    /// Known to the registry, not yet started.
    Registered,
    /// Child process spawned, waiting for the ready-line handshake.
    Starting,
    /// Passed its readiness check; available for dispatch.
    Ready,
    /// Was ready, crashed or failed a health check, being respawned.
    Restarting,
    /// Exhausted its restart budget or failed to start.
    Failed,
}

/// Static metadata about a plugin, independent of whether it's internal or
/// external.
#[derive(Debug, Clone, bon::Builder)]
pub struct PluginDescriptor {
    /// Unique plugin name.
    pub name: String,
    /// The repository-spec types this plugin can serve (spec §4.D lookup:
    /// the registry picks a plugin by matching a repository spec's type
    /// against this list).
    pub handles: Vec<TypeId>,
    /// Path to the plugin's executable, for external plugins.
    pub command: Option<std::path::PathBuf>,
    /// Extra arguments passed to the plugin binary.
    #[builder(default)]
    pub args: Vec<String>,
    /// How long to wait for the ready-line handshake before failing.
    #[builder(default = Duration::from_secs(10))]
    pub start_timeout: Duration,
}

enum Backend {
    /// A plugin implemented directly in this process.
    Internal(Arc<dyn transport::PluginHandler>),
    /// A plugin reached over HTTP, whether spawned by us or pre-existing.
    External(PluginClient),
}

struct Entry {
    descriptor: PluginDescriptor,
    state: Mutex<PluginState>,
    backend: RwLock<Option<Backend>>,
    process: Mutex<Option<Child>>,
}

/// The registry: internal plugins, external plugin descriptors, and the
/// constructed (started) instances of each, keyed by repository-spec type
/// (spec §4.D).
#[derive(Default)]
pub struct Registry {
    entries: HashMap<String, Arc<Entry>>,
    by_type: HashMap<TypeId, String>,
}

impl Registry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an in-process plugin, immediately marking it `Ready`
    /// (internal plugins never need the spawn/handshake dance).
    pub fn register_internal(
        &mut self,
        descriptor: PluginDescriptor,
        handler: Arc<dyn transport::PluginHandler>,
    ) -> Result<()> {
        ensure!(
            !self.entries.contains_key(&descriptor.name),
            OcmError::Conflict {
                what: format!("plugin already registered: {}", descriptor.name)
            }
        );
        for t in &descriptor.handles {
            ensure!(
                !self.by_type.contains_key(t),
                OcmError::Conflict {
                    what: format!("type already claimed by another plugin: {t}")
                }
            );
        }
        let name = descriptor.name.clone();
        for t in &descriptor.handles {
            self.by_type.insert(t.clone(), name.clone());
        }
        self.entries.insert(
            name,
            Arc::new(Entry {
                descriptor,
                state: Mutex::new(PluginState::Ready),
                backend: RwLock::new(Some(Backend::Internal(handler))),
                process: Mutex::new(None),
            }),
        );
        Ok(())
    }

    /// Register an external plugin descriptor. The process is not spawned
    /// until [`Registry::ensure_started`] is called for a lookup that
    /// resolves to it.
    pub fn register_external(&mut self, descriptor: PluginDescriptor) -> Result<()> {
        ensure!(
            descriptor.command.is_some(),
            "external plugin descriptor requires a command path"
        );
        ensure!(
            !self.entries.contains_key(&descriptor.name),
            OcmError::Conflict {
                what: format!("plugin already registered: {}", descriptor.name)
            }
        );
        for t in &descriptor.handles {
            ensure!(
                !self.by_type.contains_key(t),
                OcmError::Conflict {
                    what: format!("type already claimed by another plugin: {t}")
                }
            );
        }
        let name = descriptor.name.clone();
        for t in &descriptor.handles {
            self.by_type.insert(t.clone(), name.clone());
        }
        self.entries.insert(
            name,
            Arc::new(Entry {
                descriptor,
                state: Mutex::new(PluginState::Registered),
                backend: RwLock::new(None),
                process: Mutex::new(None),
            }),
        );
        Ok(())
    }

    /// Resolve the plugin that handles `repo_type`, starting it (spawning
    /// its process and waiting for the ready handshake) on first use.
    #[instrument(skip(self))]
    pub async fn resolve(&self, repo_type: &TypeId) -> Result<PluginClientHandle> {
        let name = self
            .by_type
            .get(repo_type)
            .ok_or_else(|| OcmError::NotFound {
                what: format!("no plugin handles {repo_type}"),
            })?;
        let entry = self.entries.get(name).expect("by_type index must be consistent");
        self.ensure_started(entry).await?;
        let backend = entry.backend.read().await;
        match backend.as_ref() {
            Some(Backend::Internal(handler)) => Ok(PluginClientHandle::Internal(handler.clone())),
            Some(Backend::External(client)) => Ok(PluginClientHandle::External(client.clone())),
            None => bail!("plugin backend missing after start"),
        }
    }

    async fn ensure_started(&self, entry: &Arc<Entry>) -> Result<()> {
        {
            let state = entry.state.lock().await;
            if *state == PluginState::Ready {
                return Ok(());
            }
        }
        self.start_external(entry).await
    }

    #[instrument(skip(self, entry), fields(plugin = %entry.descriptor.name))]
    async fn start_external(&self, entry: &Arc<Entry>) -> Result<()> {
        let mut state = entry.state.lock().await;
        if *state == PluginState::Ready {
            return Ok(());
        }
        *state = PluginState::Starting;
        drop(state);

        let command = entry
            .descriptor
            .command
            .as_ref()
            .ok_or_else(|| OcmError::PluginStart {
                detail: "no command configured".into(),
            })?;

        let mut child = Command::new(command)
            .args(&entry.descriptor.args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("spawn plugin {}", entry.descriptor.name))?;

        let stdout = child.stdout.take().expect("piped stdout");
        let mut lines = BufReader::new(stdout).lines();

        let ready_line = tokio::time::timeout(entry.descriptor.start_timeout, lines.next_line())
            .await
            .map_err(|_| OcmError::PluginStart {
                detail: "timed out waiting for ready line".into(),
            })?
            .context("read plugin stdout")?
            .ok_or_else(|| OcmError::PluginStart {
                detail: "plugin exited before printing a ready line".into(),
            })?;

        let base_url: PluginBoot = serde_json::from_str(&ready_line).map_err(|e| OcmError::PluginStart {
            detail: format!("invalid ready line {ready_line:?}: {e}"),
        })?;

        let client = PluginClient::new(base_url.base_url);
        client
            .readyz()
            .await
            .map_err(|e| OcmError::PluginStart {
                detail: format!("readiness check failed: {e}"),
            })
            .tap_err(|err| warn!(plugin = %entry.descriptor.name, ?err, "plugin readiness check failed"))?;

        info!(plugin = %entry.descriptor.name, "plugin ready");

        *entry.process.lock().await = Some(child);
        *entry.backend.write().await = Some(Backend::External(client));
        *entry.state.lock().await = PluginState::Ready;
        Ok(())
    }

    /// Send SIGINT (or terminate, on non-Unix) to every running external
    /// plugin process and wait up to `grace` for it to exit before killing
    /// it outright.
    #[instrument(skip(self))]
    pub async fn shutdown_all(&self, grace: Duration) {
        for entry in self.entries.values() {
            let mut process = entry.process.lock().await;
            let Some(child) = process.as_mut() else {
                continue;
            };
            if let Some(pid) = child.id() {
                send_interrupt(pid);
            }
            if tokio::time::timeout(grace, child.wait()).await.is_err() {
                warn!(plugin = %entry.descriptor.name, "plugin did not exit in time, killing");
                let _ = child.kill().await;
            }
        }
    }
}

#[derive(serde::Deserialize)]
struct PluginBoot {
    base_url: String,
}

#[cfg(unix)]
fn send_interrupt(pid: u32) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;
    let _ = kill(Pid::from_raw(pid as i32), Signal::SIGINT);
}

#[cfg(not(unix))]
fn send_interrupt(_pid: u32) {}

/// A resolved handle to a started plugin, dispatching to whichever backend
/// serves it.
#[derive(Clone)]
pub enum PluginClientHandle {
    /// An in-process handler.
    Internal(Arc<dyn transport::PluginHandler>),
    /// An HTTP client talking to an external plugin process.
    External(PluginClient),
}

impl PluginClientHandle {
    /// `POST /identity`.
    pub async fn get_identity(
        &self,
        repository: &str,
        credentials: &HashMap<String, String>,
        spec: serde_json::Value,
    ) -> Result<HashMap<String, String>> {
        match self {
            Self::Internal(h) => h.get_identity(repository, credentials, spec).await,
            Self::External(c) => c.get_identity(repository, credentials, &spec).await,
        }
    }

    /// `GET /component-version`.
    pub async fn get_component_version(
        &self,
        repository: &str,
        credentials: &HashMap<String, String>,
        name: &str,
        version: &str,
    ) -> Result<serde_json::Value> {
        match self {
            Self::Internal(h) => h.get_component_version(repository, credentials, name, version).await,
            Self::External(c) => c.get_component_version(repository, credentials, name, version).await,
        }
    }

    /// `POST /component-version`.
    pub async fn add_component_version(
        &self,
        repository: &str,
        credentials: &HashMap<String, String>,
        descriptor: serde_json::Value,
    ) -> Result<()> {
        match self {
            Self::Internal(h) => h.add_component_version(repository, credentials, descriptor).await,
            Self::External(c) => c.add_component_version(repository, credentials, &descriptor).await,
        }
    }

    /// `GET /component-versions/{name}`.
    pub async fn list_component_versions(&self, repository: &str, credentials: &HashMap<String, String>, name: &str) -> Result<Vec<String>> {
        match self {
            Self::Internal(h) => h.list_component_versions(repository, credentials, name).await,
            Self::External(c) => c.list_component_versions(repository, credentials, name).await,
        }
    }

    /// `GET /local-resource/download`.
    pub async fn download_local_resource(
        &self,
        repository: &str,
        credentials: &HashMap<String, String>,
        name: &str,
        version: &str,
        resource_id: &str,
    ) -> Result<Vec<u8>> {
        match self {
            Self::Internal(h) => h.download_local_resource(repository, credentials, name, version, resource_id).await,
            Self::External(c) => c.download_local_resource(repository, credentials, name, version, resource_id).await,
        }
    }

    /// `POST /local-resource/upload`.
    pub async fn upload_local_resource(
        &self,
        repository: &str,
        credentials: &HashMap<String, String>,
        name: &str,
        version: &str,
        resource_id: &str,
        content: Vec<u8>,
    ) -> Result<()> {
        match self {
            Self::Internal(h) => {
                h.upload_local_resource(repository, credentials, name, version, resource_id, content)
                    .await
            }
            Self::External(c) => {
                c.upload_local_resource(repository, credentials, name, version, resource_id, content)
                    .await
            }
        }
    }

    /// `GET /local-source/download`.
    pub async fn download_local_source(
        &self,
        repository: &str,
        credentials: &HashMap<String, String>,
        name: &str,
        version: &str,
        source_id: &str,
    ) -> Result<Vec<u8>> {
        match self {
            Self::Internal(h) => h.download_local_source(repository, credentials, name, version, source_id).await,
            Self::External(c) => c.download_local_source(repository, credentials, name, version, source_id).await,
        }
    }

    /// `POST /local-source/upload`.
    pub async fn upload_local_source(
        &self,
        repository: &str,
        credentials: &HashMap<String, String>,
        name: &str,
        version: &str,
        source_id: &str,
        content: Vec<u8>,
    ) -> Result<()> {
        match self {
            Self::Internal(h) => {
                h.upload_local_source(repository, credentials, name, version, source_id, content)
                    .await
            }
            Self::External(c) => {
                c.upload_local_source(repository, credentials, name, version, source_id, content)
                    .await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::str::FromStr;
    use tokio::sync::Mutex as TokioMutex;

    #[derive(Debug, Default)]
    struct DummyRepository {
        versions: TokioMutex<Vec<(String, serde_json::Value)>>,
    }

    #[async_trait]
    impl transport::PluginHandler for DummyRepository {
        async fn readyz(&self) -> Result<()> {
            Ok(())
        }

        async fn get_identity(
            &self,
            _repository: &str,
            _credentials: &HashMap<String, String>,
            _spec: serde_json::Value,
        ) -> Result<HashMap<String, String>> {
            Ok(HashMap::new())
        }

        async fn add_component_version(
            &self,
            _repository: &str,
            _credentials: &HashMap<String, String>,
            descriptor: serde_json::Value,
        ) -> Result<()> {
            let version = descriptor["version"].as_str().unwrap_or_default().to_string();
            self.versions.lock().await.push((version, descriptor));
            Ok(())
        }

        async fn get_component_version(
            &self,
            _repository: &str,
            _credentials: &HashMap<String, String>,
            _name: &str,
            version: &str,
        ) -> Result<serde_json::Value> {
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
            Ok(b"blob-bytes".to_vec())
        }

        async fn upload_local_resource(
            &self,
            _repository: &str,
            _credentials: &HashMap<String, String>,
            _name: &str,
            _version: &str,
            _resource_id: &str,
            _content: Vec<u8>,
        ) -> Result<()> {
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
            Ok(b"source-bytes".to_vec())
        }

        async fn upload_local_source(
            &self,
            _repository: &str,
            _credentials: &HashMap<String, String>,
            _name: &str,
            _version: &str,
            _source_id: &str,
            _content: Vec<u8>,
        ) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn resolves_internal_plugin_by_type() {
        let mut registry = Registry::new();
        let t = TypeId::from_str("DummyRepository/v1").unwrap();
        registry
            .register_internal(
                PluginDescriptor::builder()
                    .name("dummy".into())
                    .handles(vec![t.clone()])
                    .build(),
                Arc::new(DummyRepository::default()),
            )
            .unwrap();

        let handle = registry.resolve(&t).await.expect("resolve");
        let credentials = HashMap::new();
        handle
            .add_component_version("repo", &credentials, json!({"version": "v1.0.0"}))
            .await
            .expect("add");
        let fetched = handle
            .get_component_version("repo", &credentials, "comp", "v1.0.0")
            .await
            .expect("get");
        assert_eq!(fetched["version"], "v1.0.0");
    }

    #[tokio::test]
    async fn local_source_uses_its_own_dispatch_not_resource_aliasing() {
        let mut registry = Registry::new();
        let t = TypeId::from_str("DummyRepository/v2").unwrap();
        registry
            .register_internal(
                PluginDescriptor::builder().name("dummy2".into()).handles(vec![t.clone()]).build(),
                Arc::new(DummyRepository::default()),
            )
            .unwrap();

        let handle = registry.resolve(&t).await.expect("resolve");
        let credentials = HashMap::new();
        let resource_bytes = handle
            .download_local_resource("repo", &credentials, "comp", "v1.0.0", "id")
            .await
            .expect("download resource");
        let source_bytes = handle
            .download_local_source("repo", &credentials, "comp", "v1.0.0", "id")
            .await
            .expect("download source");
        assert_ne!(resource_bytes, source_bytes);

        let identity = handle.get_identity("repo", &credentials, json!({"type": "Nope"})).await.expect("identity");
        assert!(identity.is_empty());
    }

    #[tokio::test]
    async fn resolve_unknown_type_fails() {
        let registry = Registry::new();
        let t = TypeId::from_str("Nope/v1").unwrap();
        assert!(registry.resolve(&t).await.is_err());
    }

    #[test]
    fn duplicate_internal_registration_fails() {
        let mut registry = Registry::new();
        let t = TypeId::from_str("DummyRepository/v1").unwrap();
        registry
            .register_internal(
                PluginDescriptor::builder().name("a".into()).handles(vec![t.clone()]).build(),
                Arc::new(DummyRepository::default()),
            )
            .unwrap();
        let err = registry.register_internal(
            PluginDescriptor::builder().name("b".into()).handles(vec![t]).build(),
            Arc::new(DummyRepository::default()),
        );
        assert!(err.is_err());
    }
}
