//! Mounting the remote store into the sandbox.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::config::StorageConfig;
use crate::error::SyncError;
use crate::sandbox::{SandboxError, SandboxRuntime};

/// Mounts the remote store once per instance.
///
/// A successful mount is remembered, and a runtime reporting the path as
/// already mounted counts as success.
pub struct RemoteMount {
    runtime: Arc<dyn SandboxRuntime>,
    storage: StorageConfig,
    mount_path: PathBuf,
    mounted: AtomicBool,
}

impl RemoteMount {
    pub fn new(runtime: Arc<dyn SandboxRuntime>, storage: StorageConfig, mount_path: PathBuf) -> Self {
        Self {
            runtime,
            storage,
            mount_path,
            mounted: AtomicBool::new(false),
        }
    }

    pub fn storage(&self) -> &StorageConfig {
        &self.storage
    }

    /// Storage is enabled and has every credential.
    pub fn is_configured(&self) -> bool {
        !self.storage.disabled && self.storage.has_credentials()
    }

    /// Check preconditions and mount.
    pub async fn ensure(&self) -> Result<(), SyncError> {
        if self.storage.disabled {
            return Err(SyncError::Disabled);
        }
        let Some(request) = self.storage.mount_request(self.mount_path.clone()) else {
            return Err(SyncError::NotConfigured {
                missing: self.storage.missing(),
            });
        };
        if self.mounted.load(Ordering::Acquire) {
            return Ok(());
        }

        match self.runtime.mount_bucket(&request).await {
            Ok(()) => {
                tracing::info!(
                    bucket = %request.bucket,
                    path = %self.mount_path.display(),
                    "Mounted remote store"
                );
            }
            Err(e) if is_already_mounted(&e) => {
                tracing::debug!(path = %self.mount_path.display(), "Remote store already mounted");
            }
            Err(e) => {
                return Err(SyncError::MountFailed {
                    reason: e.to_string(),
                });
            }
        }
        self.mounted.store(true, Ordering::Release);
        Ok(())
    }

    /// Mount if possible, logging instead of failing.
    pub async fn try_mount(&self) -> bool {
        match self.ensure().await {
            Ok(()) => true,
            Err(e @ (SyncError::Disabled | SyncError::NotConfigured { .. })) => {
                tracing::debug!(reason = %e, "Skipping remote store mount");
                false
            }
            Err(e) => {
                tracing::warn!(error = %e, "Remote store mount failed");
                false
            }
        }
    }
}

fn is_already_mounted(e: &SandboxError) -> bool {
    matches!(e, SandboxError::MountFailed { reason, .. } if reason.contains("already mounted"))
}
