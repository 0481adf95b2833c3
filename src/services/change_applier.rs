//! Atomic application of an accepted survivor to the real project tree.
//!
//! The project is read-only everywhere else in the pipeline; this is the
//! single mutation point. Pre-images of every touched path are captured
//! in memory before any write; content lands via temp-file-then-rename;
//! on partial failure every already-applied path is rolled back.

use std::path::{Path, PathBuf};

use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::domain::errors::{PipelineError, PipelineResult};
use crate::domain::models::{FileAction, FileChange};

/// Captured state of one path before the apply.
enum PreImage {
    Absent,
    Content(Vec<u8>),
}

pub struct ChangeApplier {
    project_root: PathBuf,
}

impl ChangeApplier {
    pub fn new(project_root: impl Into<PathBuf>) -> Self {
        Self {
            project_root: project_root.into(),
        }
    }

    /// Apply all changes, all-or-nothing.
    #[instrument(skip_all, fields(changes = changes.len()))]
    pub async fn apply(&self, changes: &[FileChange]) -> PipelineResult<()> {
        // Capture pre-images first so rollback never depends on disk
        // state after a partial failure.
        let mut pre_images: Vec<(PathBuf, PreImage)> = Vec::with_capacity(changes.len());
        for change in changes {
            let target = self.project_root.join(&change.path);
            let image = match tokio::fs::read(&target).await {
                Ok(bytes) => PreImage::Content(bytes),
                Err(_) => PreImage::Absent,
            };
            pre_images.push((target, image));
        }

        let mut applied = 0usize;
        for (i, change) in changes.iter().enumerate() {
            let target = &pre_images[i].0;
            if let Err(e) = self.apply_one(change, target).await {
                error!(path = %change.path, error = %e, "apply failed; rolling back");
                self.rollback(&pre_images[..applied + 1]).await;
                return Err(PipelineError::Validation(format!(
                    "apply of '{}' failed and was rolled back: {e}",
                    change.path
                )));
            }
            applied += 1;
        }

        info!(applied, "changes applied to project tree");
        Ok(())
    }

    async fn apply_one(&self, change: &FileChange, target: &Path) -> std::io::Result<()> {
        match change.action {
            FileAction::Create | FileAction::Modify => {
                if let Some(parent) = target.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                // Write to a sibling temp file, then rename into place.
                let temp = target.with_file_name(format!(
                    ".manifest-apply-{}",
                    Uuid::new_v4().simple()
                ));
                tokio::fs::write(&temp, change.content.as_deref().unwrap_or("")).await?;
                if let Err(e) = tokio::fs::rename(&temp, target).await {
                    let _ = tokio::fs::remove_file(&temp).await;
                    return Err(e);
                }
                Ok(())
            }
            FileAction::Delete => match tokio::fs::remove_file(target).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e),
            },
        }
    }

    /// Restore every touched path from its in-memory pre-image.
    async fn rollback(&self, touched: &[(PathBuf, PreImage)]) {
        for (path, image) in touched.iter().rev() {
            let result = match image {
                PreImage::Content(bytes) => tokio::fs::write(path, bytes).await,
                PreImage::Absent => match tokio::fs::remove_file(path).await {
                    Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
                    _ => Ok(()),
                },
            };
            if let Err(e) = result {
                warn!(path = %path.display(), error = %e, "rollback step failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn create(path: &str, content: &str) -> FileChange {
        FileChange {
            path: path.into(),
            action: FileAction::Create,
            content: Some(content.into()),
        }
    }

    #[tokio::test]
    async fn applies_creates_modifies_and_deletes() {
        let project = tempdir().unwrap();
        std::fs::write(project.path().join("old.txt"), "old").unwrap();
        std::fs::write(project.path().join("doomed.txt"), "bye").unwrap();

        let applier = ChangeApplier::new(project.path());
        applier
            .apply(&[
                create("src/new.rs", "fn new() {}"),
                FileChange {
                    path: "old.txt".into(),
                    action: FileAction::Modify,
                    content: Some("updated".into()),
                },
                FileChange {
                    path: "doomed.txt".into(),
                    action: FileAction::Delete,
                    content: None,
                },
            ])
            .await
            .unwrap();

        assert_eq!(
            std::fs::read_to_string(project.path().join("src/new.rs")).unwrap(),
            "fn new() {}"
        );
        assert_eq!(
            std::fs::read_to_string(project.path().join("old.txt")).unwrap(),
            "updated"
        );
        assert!(!project.path().join("doomed.txt").exists());
    }

    #[tokio::test]
    async fn partial_failure_rolls_back_applied_changes() {
        let project = tempdir().unwrap();
        std::fs::write(project.path().join("keep.txt"), "original").unwrap();
        // A directory at the target path makes the rename fail.
        std::fs::create_dir(project.path().join("blocked")).unwrap();
        std::fs::write(project.path().join("blocked/inner"), "x").unwrap();

        let applier = ChangeApplier::new(project.path());
        let result = applier
            .apply(&[
                FileChange {
                    path: "keep.txt".into(),
                    action: FileAction::Modify,
                    content: Some("clobbered".into()),
                },
                create("blocked", "cannot overwrite a directory"),
            ])
            .await;

        assert!(result.is_err());
        assert_eq!(
            std::fs::read_to_string(project.path().join("keep.txt")).unwrap(),
            "original",
            "first change must be rolled back"
        );
    }

    #[tokio::test]
    async fn rollback_removes_created_files() {
        let project = tempdir().unwrap();
        std::fs::create_dir(project.path().join("blocked")).unwrap();
        std::fs::write(project.path().join("blocked/inner"), "x").unwrap();

        let applier = ChangeApplier::new(project.path());
        let result = applier
            .apply(&[
                create("fresh.txt", "new file"),
                create("blocked", "fails"),
            ])
            .await;

        assert!(result.is_err());
        assert!(
            !project.path().join("fresh.txt").exists(),
            "created file must be removed on rollback"
        );
    }

    #[tokio::test]
    async fn no_temp_files_left_behind() {
        let project = tempdir().unwrap();
        let applier = ChangeApplier::new(project.path());
        applier.apply(&[create("a.txt", "content")]).await.unwrap();

        let stray = std::fs::read_dir(project.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .any(|e| e.file_name().to_string_lossy().starts_with(".manifest-apply-"));
        assert!(!stray);
    }
}
