//! Workspace isolation.
//!
//! Each verification runs in a private copy of the project tree under
//! `<data>/workspaces/`. The copy excludes VCS, build, and dependency
//! directories and never contains symlinks. Removal is guaranteed on
//! every exit path by a drop guard, including panics and cancellation.
//! Total disk usage is capped by a slot semaphore sized from the
//! measured project footprint.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::errors::{PipelineError, PipelineResult};
use crate::domain::models::{FileAction, FileChange, WorkspaceConfig};

/// Upper bound on concurrent workspaces regardless of disk headroom.
const MAX_WORKSPACE_SLOTS: u64 = 64;

pub struct WorkspaceManager {
    root: PathBuf,
    project_root: PathBuf,
    config: WorkspaceConfig,
    slots: Arc<Semaphore>,
}

impl WorkspaceManager {
    /// Create the manager, measuring the project footprint to size the
    /// disk-cap slot count.
    pub async fn new(
        project_root: impl Into<PathBuf>,
        workspaces_root: impl Into<PathBuf>,
        config: WorkspaceConfig,
    ) -> PipelineResult<Self> {
        let project_root = project_root.into();
        let root = workspaces_root.into();

        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| PipelineError::WorkspaceCreationFailed(e.to_string()))?;

        let project_bytes = dir_size(&project_root, &config.exclude).await.max(1);
        let slot_count = (config.disk_cap_bytes / project_bytes)
            .clamp(1, MAX_WORKSPACE_SLOTS) as usize;

        debug!(
            project_bytes,
            slot_count, "workspace manager sized from project footprint"
        );

        Ok(Self {
            root,
            project_root,
            config,
            slots: Arc::new(Semaphore::new(slot_count)),
        })
    }

    /// Remove workspaces left behind by prior crashes. Called on startup
    /// before any new work is accepted.
    pub async fn sweep_orphans(&self) -> PipelineResult<usize> {
        let mut removed = 0usize;
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(_) => return Ok(0),
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.is_dir() {
                match tokio::fs::remove_dir_all(&path).await {
                    Ok(()) => {
                        removed += 1;
                        info!(path = %path.display(), "removed orphan workspace");
                    }
                    Err(e) => warn!(path = %path.display(), error = %e, "orphan sweep failed"),
                }
            }
        }
        Ok(removed)
    }

    /// Run `f` inside a freshly populated workspace for `attempt_id`.
    ///
    /// The workspace directory is removed on every exit path: normal
    /// return, error, panic inside `f`, and cancellation of the future.
    pub async fn with_workspace<F, Fut, R>(
        &self,
        attempt_id: Uuid,
        changes: &[FileChange],
        spec_suite: Option<(&str, &str)>,
        f: F,
    ) -> PipelineResult<R>
    where
        F: FnOnce(PathBuf) -> Fut,
        Fut: std::future::Future<Output = PipelineResult<R>>,
    {
        let _slot = timeout(
            Duration::from_secs(self.config.acquire_deadline_secs),
            self.slots.clone().acquire_owned(),
        )
        .await
        .map_err(|_| {
            PipelineError::DiskFull("workspace capacity wait exceeded its deadline".into())
        })?
        .map_err(|e| PipelineError::WorkspaceCreationFailed(e.to_string()))?;

        let path = self.root.join(format!("attempt-{attempt_id}"));
        if path.exists() {
            let _ = tokio::fs::remove_dir_all(&path).await;
        }

        // Guard created before population so a half-built workspace is
        // still removed.
        let guard = WorkspaceGuard {
            path: path.clone(),
            cleanup: self.config.cleanup,
        };

        copy_tree(
            &self.project_root,
            &path,
            &self.config.exclude,
            self.config.max_file_bytes,
        )
        .await
        .map_err(|e| PipelineError::WorkspaceCreationFailed(e.to_string()))?;

        apply_changes(&path, changes)
            .await
            .map_err(|e| PipelineError::WorkspaceCreationFailed(e.to_string()))?;

        if let Some((suite_path, suite_content)) = spec_suite {
            let full = path.join(suite_path);
            if let Some(parent) = full.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| PipelineError::WorkspaceCreationFailed(e.to_string()))?;
            }
            tokio::fs::write(&full, suite_content)
                .await
                .map_err(|e| PipelineError::WorkspaceCreationFailed(e.to_string()))?;
        }

        let result = f(path).await;
        drop(guard);
        result
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Free workspace slots right now.
    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }
}

/// Removes the workspace directory when dropped, on every exit path.
struct WorkspaceGuard {
    path: PathBuf,
    cleanup: bool,
}

impl Drop for WorkspaceGuard {
    fn drop(&mut self) {
        if !self.cleanup {
            return;
        }
        if let Err(e) = std::fs::remove_dir_all(&self.path) {
            if self.path.exists() {
                warn!(path = %self.path.display(), error = %e, "workspace removal failed");
            }
        }
    }
}

/// Apply file changes inside a workspace.
async fn apply_changes(root: &Path, changes: &[FileChange]) -> std::io::Result<()> {
    for change in changes {
        let target = root.join(&change.path);
        match change.action {
            FileAction::Create | FileAction::Modify => {
                if let Some(parent) = target.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::write(&target, change.content.as_deref().unwrap_or("")).await?;
            }
            FileAction::Delete => {
                if target.exists() {
                    tokio::fs::remove_file(&target).await?;
                }
            }
        }
    }
    Ok(())
}

/// Recursively copy `src` into `dst`, skipping excluded directory names,
/// symlinks, and oversized files. Real copies only; a workspace must not
/// be able to reach back into the source tree.
fn copy_tree<'a>(
    src: &'a Path,
    dst: &'a Path,
    exclude: &'a [String],
    max_file_bytes: u64,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = std::io::Result<()>> + Send + 'a>> {
    Box::pin(async move {
        tokio::fs::create_dir_all(dst).await?;
        let mut entries = tokio::fs::read_dir(src).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let name_str = name.to_string_lossy().to_string();
            if exclude.iter().any(|e| e == &name_str) {
                continue;
            }

            let file_type = entry.file_type().await?;
            if file_type.is_symlink() {
                continue;
            }

            let from = entry.path();
            let to = dst.join(&name);
            if file_type.is_dir() {
                copy_tree(&from, &to, exclude, max_file_bytes).await?;
            } else {
                let meta = entry.metadata().await?;
                if meta.len() > max_file_bytes {
                    continue;
                }
                tokio::fs::copy(&from, &to).await?;
            }
        }
        Ok(())
    })
}

/// Total bytes under a directory, honoring the exclude list.
fn dir_size<'a>(
    path: &'a Path,
    exclude: &'a [String],
) -> std::pin::Pin<Box<dyn std::future::Future<Output = u64> + Send + 'a>> {
    Box::pin(async move {
        let mut total = 0u64;
        let Ok(mut entries) = tokio::fs::read_dir(path).await else {
            return 0;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name().to_string_lossy().to_string();
            if exclude.iter().any(|e| e == &name) {
                continue;
            }
            let Ok(file_type) = entry.file_type().await else {
                continue;
            };
            if file_type.is_symlink() {
                continue;
            }
            if file_type.is_dir() {
                total += dir_size(&entry.path(), exclude).await;
            } else if let Ok(meta) = entry.metadata().await {
                total += meta.len();
            }
        }
        total
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn manager(project: &Path, workspaces: &Path) -> WorkspaceManager {
        WorkspaceManager::new(project, workspaces, WorkspaceConfig::default())
            .await
            .unwrap()
    }

    fn create_change(path: &str, content: &str) -> FileChange {
        FileChange {
            path: path.into(),
            action: FileAction::Create,
            content: Some(content.into()),
        }
    }

    #[tokio::test]
    async fn workspace_is_populated_and_removed() {
        let project = tempdir().unwrap();
        std::fs::write(project.path().join("existing.txt"), "source").unwrap();
        std::fs::create_dir(project.path().join(".git")).unwrap();
        std::fs::write(project.path().join(".git/HEAD"), "ref").unwrap();

        let ws_root = tempdir().unwrap();
        let manager = manager(project.path(), ws_root.path()).await;

        let attempt_id = Uuid::new_v4();
        let seen = manager
            .with_workspace(
                attempt_id,
                &[create_change("src/new.rs", "fn new() {}")],
                Some(("tests/spec.rs", "#[test] fn t() {}")),
                |path| async move {
                    assert!(path.join("existing.txt").exists());
                    assert!(!path.join(".git").exists(), "VCS dir must be excluded");
                    assert!(path.join("src/new.rs").exists());
                    assert!(path.join("tests/spec.rs").exists());
                    Ok(path)
                },
            )
            .await
            .unwrap();

        assert!(!seen.exists(), "workspace must be removed after release");
    }

    #[tokio::test]
    async fn workspace_removed_on_error() {
        let project = tempdir().unwrap();
        let ws_root = tempdir().unwrap();
        let manager = manager(project.path(), ws_root.path()).await;

        let attempt_id = Uuid::new_v4();
        let expected = ws_root.path().join(format!("attempt-{attempt_id}"));
        let result: PipelineResult<()> = manager
            .with_workspace(attempt_id, &[], None, |_path| async {
                Err(PipelineError::Validation("boom".into()))
            })
            .await;

        assert!(result.is_err());
        assert!(!expected.exists());
    }

    #[tokio::test]
    async fn delete_change_removes_copied_file() {
        let project = tempdir().unwrap();
        std::fs::write(project.path().join("doomed.txt"), "bye").unwrap();
        let ws_root = tempdir().unwrap();
        let manager = manager(project.path(), ws_root.path()).await;

        manager
            .with_workspace(
                Uuid::new_v4(),
                &[FileChange {
                    path: "doomed.txt".into(),
                    action: FileAction::Delete,
                    content: None,
                }],
                None,
                |path| async move {
                    assert!(!path.join("doomed.txt").exists());
                    Ok(())
                },
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn sweep_removes_leftover_directories() {
        let project = tempdir().unwrap();
        let ws_root = tempdir().unwrap();
        std::fs::create_dir(ws_root.path().join("attempt-stale")).unwrap();
        std::fs::write(ws_root.path().join("attempt-stale/file"), "x").unwrap();

        let manager = manager(project.path(), ws_root.path()).await;
        let removed = manager.sweep_orphans().await.unwrap();
        assert_eq!(removed, 1);
        assert!(!ws_root.path().join("attempt-stale").exists());
    }

    #[tokio::test]
    async fn capacity_blocks_with_deadline() {
        let project = tempdir().unwrap();
        std::fs::write(project.path().join("f"), vec![0u8; 1024]).unwrap();
        let ws_root = tempdir().unwrap();

        // Cap sized to exactly one workspace, with a short wait deadline.
        let config = WorkspaceConfig {
            disk_cap_bytes: 1500,
            acquire_deadline_secs: 1,
            ..WorkspaceConfig::default()
        };
        let manager = Arc::new(
            WorkspaceManager::new(project.path(), ws_root.path(), config)
                .await
                .unwrap(),
        );
        assert_eq!(manager.available_slots(), 1);

        let inner = manager.clone();
        let result = manager
            .with_workspace(Uuid::new_v4(), &[], None, move |_path| async move {
                // A second acquisition while the slot is held must time out.
                inner
                    .with_workspace(Uuid::new_v4(), &[], None, |_p| async { Ok(()) })
                    .await
            })
            .await;

        assert!(matches!(result, Err(PipelineError::DiskFull(_))));
    }
}
