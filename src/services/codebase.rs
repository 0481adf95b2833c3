//! Project tree enumeration for codebase analysis.
//!
//! Walks the project root, skipping binary, generated, and oversized
//! files, and renders a compact tree for the analyze prompt.

use std::path::{Path, PathBuf};

use crate::domain::errors::{PipelineError, PipelineResult};

/// Extensions treated as binary and excluded from analysis.
const BINARY_EXTENSIONS: &[&str] = &[
    "png", "jpg", "jpeg", "gif", "ico", "pdf", "zip", "tar", "gz", "exe", "so", "dylib", "a",
    "o", "class", "wasm", "woff", "woff2", "ttf", "db", "sqlite",
];

#[derive(Debug, Clone)]
pub struct ScanFilters {
    /// Directory names skipped entirely (VCS, build output, generated).
    pub exclude_dirs: Vec<String>,
    pub max_file_bytes: u64,
}

impl Default for ScanFilters {
    fn default() -> Self {
        Self {
            exclude_dirs: vec![
                ".git".into(),
                "target".into(),
                "node_modules".into(),
                "dist".into(),
                ".manifest".into(),
            ],
            max_file_bytes: 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProjectFile {
    /// Path relative to the project root, `/`-separated.
    pub path: String,
    pub bytes: u64,
}

#[derive(Debug, Clone, Default)]
pub struct ProjectSnapshot {
    pub files: Vec<ProjectFile>,
}

impl ProjectSnapshot {
    /// One path per line, capped, for inclusion in a prompt.
    pub fn render_tree(&self, limit: usize) -> String {
        let mut lines: Vec<&str> = self.files.iter().map(|f| f.path.as_str()).collect();
        lines.sort();
        let shown = lines.len().min(limit);
        let mut rendered = lines[..shown].join("\n");
        if lines.len() > shown {
            rendered.push_str(&format!("\n... and {} more files", lines.len() - shown));
        }
        rendered
    }

    pub fn contains(&self, path: &str) -> bool {
        self.files.iter().any(|f| f.path == path)
    }
}

pub struct CodebaseScanner {
    root: PathBuf,
    filters: ScanFilters,
}

impl CodebaseScanner {
    pub fn new(root: impl Into<PathBuf>, filters: ScanFilters) -> Self {
        Self {
            root: root.into(),
            filters,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Enumerate the project. An unreadable root is fatal for the
    /// intent; unreadable individual entries are skipped.
    pub async fn scan(&self) -> PipelineResult<ProjectSnapshot> {
        if !self.root.is_dir() {
            return Err(PipelineError::CodebaseUnreadable(format!(
                "project root {} is not a directory",
                self.root.display()
            )));
        }

        let mut files = Vec::new();
        self.walk(self.root.clone(), String::new(), &mut files)
            .await
            .map_err(|e| PipelineError::CodebaseUnreadable(e.to_string()))?;
        Ok(ProjectSnapshot { files })
    }

    fn walk<'a>(
        &'a self,
        dir: PathBuf,
        prefix: String,
        out: &'a mut Vec<ProjectFile>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = std::io::Result<()>> + Send + 'a>>
    {
        Box::pin(async move {
            let mut entries = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name().to_string_lossy().to_string();
                let rel = if prefix.is_empty() {
                    name.clone()
                } else {
                    format!("{prefix}/{name}")
                };

                let Ok(file_type) = entry.file_type().await else {
                    continue;
                };
                if file_type.is_symlink() {
                    continue;
                }
                if file_type.is_dir() {
                    if self.filters.exclude_dirs.iter().any(|e| e == &name) {
                        continue;
                    }
                    self.walk(entry.path(), rel, out).await?;
                    continue;
                }

                if is_binary_name(&name) {
                    continue;
                }
                let Ok(meta) = entry.metadata().await else {
                    continue;
                };
                if meta.len() > self.filters.max_file_bytes {
                    continue;
                }
                out.push(ProjectFile {
                    path: rel,
                    bytes: meta.len(),
                });
            }
            Ok(())
        })
    }
}

fn is_binary_name(name: &str) -> bool {
    name.rsplit('.')
        .next()
        .map(|ext| BINARY_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
        .unwrap_or(false)
}
