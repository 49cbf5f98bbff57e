//! Remote-state backend adapters.
//!
//! The core never provisions remote state itself; it talks to backends
//! through the [`BackendAdapter`] contract. Cloud implementations (S3,
//! GCS, Azure Blob) live outside the core and register by kind; the
//! filesystem-backed [`LocalBackend`] ships here so `backend bootstrap`,
//! `backend delete` and `backend migrate` are exercisable end to end.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use hcl::{Map, Value};
use tracing::info;

use crate::error::{StratusError, StratusResult};

/// Options shared by all backend operations.
#[derive(Debug, Clone, Default)]
pub struct BackendOptions {
    pub non_interactive: bool,
    pub working_dir: PathBuf,
}

/// Contract a remote-state backend must satisfy.
///
/// Implementations are interchangeable; the core refers to them only
/// through this trait.
#[async_trait]
pub trait BackendAdapter: Send + Sync {
    /// Backend kind, matching `remote_state.backend`.
    fn name(&self) -> &'static str;

    /// Provisions whatever the backend needs before first use.
    async fn bootstrap(
        &self,
        config: &Map<String, Value>,
        opts: &BackendOptions,
    ) -> StratusResult<()>;

    /// Tears the remote state down. `force` skips safety checks.
    async fn delete(
        &self,
        config: &Map<String, Value>,
        force: bool,
        opts: &BackendOptions,
    ) -> StratusResult<()>;

    /// Moves state between two backend configurations.
    async fn migrate(
        &self,
        src: &Map<String, Value>,
        dst: &Map<String, Value>,
        opts: &BackendOptions,
    ) -> StratusResult<()>;

    /// Whether the IaC binary must re-run `init` given the previously
    /// recorded backend config.
    fn needs_init(&self, config: &Map<String, Value>, existing: Option<&Map<String, Value>>)
        -> bool;
}

/// Looks up the adapter registered for a backend kind.
pub fn adapter_for(kind: &str) -> Option<Arc<dyn BackendAdapter>> {
    match kind {
        "local" => Some(Arc::new(LocalBackend)),
        _ => None,
    }
}

/// Filesystem-backed state. Config carries a single `path` attribute.
pub struct LocalBackend;

impl LocalBackend {
    fn state_path(
        &self,
        config: &Map<String, Value>,
        opts: &BackendOptions,
    ) -> StratusResult<PathBuf> {
        let raw = config
            .get("path")
            .and_then(Value::as_str)
            .ok_or_else(|| StratusError::Backend {
                backend: "local".to_string(),
                message: "config needs a path attribute".to_string(),
            })?;
        let path = Path::new(raw);
        Ok(if path.is_absolute() {
            path.to_path_buf()
        } else {
            opts.working_dir.join(path)
        })
    }
}

#[async_trait]
impl BackendAdapter for LocalBackend {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn bootstrap(
        &self,
        config: &Map<String, Value>,
        opts: &BackendOptions,
    ) -> StratusResult<()> {
        let path = self.state_path(config, opts)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StratusError::Backend {
                    backend: "local".to_string(),
                    message: format!("cannot create {}: {e}", parent.display()),
                })?;
        }
        info!("bootstrapped local state at {}", path.display());
        Ok(())
    }

    async fn delete(
        &self,
        config: &Map<String, Value>,
        force: bool,
        opts: &BackendOptions,
    ) -> StratusResult<()> {
        let path = self.state_path(config, opts)?;
        if !path.exists() {
            return Ok(());
        }
        if !force {
            let contents = tokio::fs::read_to_string(&path).await.unwrap_or_default();
            let non_empty = serde_json::from_str::<serde_json::Value>(&contents)
                .ok()
                .and_then(|v| v.get("resources").and_then(|r| r.as_array()).map(|a| !a.is_empty()))
                .unwrap_or(false);
            if non_empty {
                return Err(StratusError::Backend {
                    backend: "local".to_string(),
                    message: format!(
                        "state at {} still tracks resources; pass --force to delete",
                        path.display()
                    ),
                });
            }
        }
        tokio::fs::remove_file(&path)
            .await
            .map_err(|e| StratusError::Backend {
                backend: "local".to_string(),
                message: format!("cannot delete {}: {e}", path.display()),
            })?;
        info!("deleted local state at {}", path.display());
        Ok(())
    }

    async fn migrate(
        &self,
        src: &Map<String, Value>,
        dst: &Map<String, Value>,
        opts: &BackendOptions,
    ) -> StratusResult<()> {
        let from = self.state_path(src, opts)?;
        let to = self.state_path(dst, opts)?;
        if !from.is_file() {
            return Err(StratusError::Backend {
                backend: "local".to_string(),
                message: format!("no state to migrate at {}", from.display()),
            });
        }
        if let Some(parent) = to.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(&from, &to)
            .await
            .map_err(|e| StratusError::Backend {
                backend: "local".to_string(),
                message: format!("copy failed: {e}"),
            })?;
        info!("migrated state {} -> {}", from.display(), to.display());
        Ok(())
    }

    fn needs_init(
        &self,
        config: &Map<String, Value>,
        existing: Option<&Map<String, Value>>,
    ) -> bool {
        match existing {
            Some(existing) => existing != config,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(path: &str) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("path".to_string(), Value::String(path.to_string()));
        map
    }

    #[tokio::test]
    async fn test_bootstrap_creates_parent_dirs() {
        let tmp = tempfile::tempdir().unwrap();
        let opts = BackendOptions {
            non_interactive: true,
            working_dir: tmp.path().to_path_buf(),
        };
        LocalBackend
            .bootstrap(&config("state/deep/terraform.tfstate"), &opts)
            .await
            .unwrap();
        assert!(tmp.path().join("state/deep").is_dir());
    }

    #[tokio::test]
    async fn test_delete_refuses_tracked_resources_without_force() {
        let tmp = tempfile::tempdir().unwrap();
        let state = tmp.path().join("terraform.tfstate");
        std::fs::write(&state, r#"{"resources": [{"type": "null_resource"}]}"#).unwrap();

        let opts = BackendOptions {
            non_interactive: true,
            working_dir: tmp.path().to_path_buf(),
        };
        let err = LocalBackend
            .delete(&config("terraform.tfstate"), false, &opts)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Backend);
        assert!(state.exists());

        LocalBackend
            .delete(&config("terraform.tfstate"), true, &opts)
            .await
            .unwrap();
        assert!(!state.exists());
    }

    #[tokio::test]
    async fn test_migrate_copies_state() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("old.tfstate"), "{}").unwrap();

        let opts = BackendOptions {
            non_interactive: true,
            working_dir: tmp.path().to_path_buf(),
        };
        LocalBackend
            .migrate(&config("old.tfstate"), &config("new/state.tfstate"), &opts)
            .await
            .unwrap();
        assert!(tmp.path().join("new/state.tfstate").is_file());
    }

    #[test]
    fn test_needs_init_on_changed_config() {
        let a = config("one.tfstate");
        let b = config("two.tfstate");
        assert!(LocalBackend.needs_init(&a, None));
        assert!(LocalBackend.needs_init(&a, Some(&b)));
        assert!(!LocalBackend.needs_init(&a, Some(&a)));
    }

    #[test]
    fn test_adapter_registry() {
        assert!(adapter_for("local").is_some());
        assert!(adapter_for("s3").is_none());
    }
}
