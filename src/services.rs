//! Component wiring.

use std::sync::Arc;

use crate::ai_env::{AiEnvOverride, AiEnvSummary};
use crate::config::Config;
use crate::config_fallback::ConfigFallbackResolver;
use crate::gateway::{GatewaySupervisor, StartGuards};
use crate::sandbox::{LocalRuntime, SandboxRuntime};
use crate::store::{FsStore, RemoteStore};
use crate::sync::{RemoteMount, SyncEngine};

/// Every component, sharing one runtime, store and mount.
pub struct Services {
    pub config: Config,
    pub runtime: Arc<dyn SandboxRuntime>,
    pub store: Arc<dyn RemoteStore>,
    pub mount: Arc<RemoteMount>,
    pub supervisor: GatewaySupervisor,
    pub sync: SyncEngine,
    pub config_files: ConfigFallbackResolver,
}

impl Services {
    pub fn new(
        config: Config,
        runtime: Arc<dyn SandboxRuntime>,
        store: Arc<dyn RemoteStore>,
        guards: Arc<StartGuards>,
    ) -> Self {
        let mount = Arc::new(RemoteMount::new(
            Arc::clone(&runtime),
            config.storage.clone(),
            config.paths.mount_path.clone(),
        ));
        let supervisor = GatewaySupervisor::new(
            Arc::clone(&runtime),
            Arc::clone(&store),
            Arc::clone(&mount),
            guards,
            &config,
        );
        let sync = SyncEngine::new(
            Arc::clone(&runtime),
            Arc::clone(&mount),
            config.paths.clone(),
            config.timeouts.clone(),
        );
        let config_files = ConfigFallbackResolver::new(
            Arc::clone(&runtime),
            Arc::clone(&mount),
            config.paths.clone(),
            config.timeouts.clone(),
        );
        Self {
            config,
            runtime,
            store,
            mount,
            supervisor,
            sync,
            config_files,
        }
    }

    /// Local runtime on this host, with the store rooted under
    /// `store_root/<bucket>`.
    pub fn local(config: Config) -> Self {
        let runtime = Arc::new(LocalRuntime::new(config.store_root.clone()));
        let store = Arc::new(FsStore::new(config.store_root.join(&config.storage.bucket)));
        tracing::debug!(
            store_root = %config.store_root.display(),
            bucket = %config.storage.bucket,
            "Using local runtime"
        );
        Self::new(config, runtime, store, Arc::new(StartGuards::new()))
    }

    /// Effective AI settings with secrets reduced to their source.
    pub async fn ai_summary(&self) -> AiEnvSummary {
        AiEnvOverride::load(self.store.as_ref())
            .await
            .summary(&self.config.env)
    }
}
