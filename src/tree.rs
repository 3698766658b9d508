//! Working-tree collaborator for the structural indexer.
//!
//! [`FileTree`] lists relative file paths and reads file bytes.
//! [`WorkingTree`] walks a directory on disk, always skipping `.git`,
//! `target` and `node_modules` in addition to any configured exclude globs.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

#[async_trait]
pub trait FileTree: Send + Sync {
    /// Every indexable file, as `/`-separated paths relative to the root,
    /// sorted.
    async fn list_files(&self) -> Result<Vec<String>>;

    async fn read(&self, path: &str) -> Result<Vec<u8>>;
}

pub struct WorkingTree {
    root: PathBuf,
    excludes: GlobSet,
}

impl WorkingTree {
    pub fn new(root: &Path, exclude_globs: &[String]) -> Result<Self> {
        if !root.is_dir() {
            bail!("working tree root does not exist: {}", root.display());
        }

        let mut patterns = vec![
            "**/.git/**".to_string(),
            "**/target/**".to_string(),
            "**/node_modules/**".to_string(),
        ];
        patterns.extend(exclude_globs.iter().cloned());

        Ok(Self {
            root: root.to_path_buf(),
            excludes: build_globset(&patterns)?,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn is_excluded(&self, rel: &str) -> bool {
        self.excludes.is_match(rel)
    }
}

#[async_trait]
impl FileTree for WorkingTree {
    async fn list_files(&self) -> Result<Vec<String>> {
        let root = self.root.clone();
        let mut files = Vec::new();

        let walker = WalkDir::new(&root).follow_links(false).into_iter();
        for entry in walker.filter_entry(|e| {
            let rel = e.path().strip_prefix(&root).unwrap_or(e.path());
            match to_slash(rel) {
                Some(rel) => rel.is_empty() || !self.is_excluded(&format!("{rel}/")),
                None => true,
            }
        }) {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }

            let relative = entry.path().strip_prefix(&root).unwrap_or(entry.path());
            let Some(rel_str) = to_slash(relative) else {
                tracing::warn!(path = %relative.display(), "non UTF-8 file name, skipped");
                continue;
            };
            if self.is_excluded(&rel_str) {
                continue;
            }
            files.push(rel_str);
        }

        files.sort();
        Ok(files)
    }

    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        let full = self.root.join(path);
        tokio::fs::read(&full)
            .await
            .with_context(|| format!("Failed to read {}", full.display()))
    }
}

/// `None` when any component is not valid UTF-8.
fn to_slash(path: &Path) -> Option<String> {
    let parts = path
        .components()
        .map(|c| c.as_os_str().to_str())
        .collect::<Option<Vec<_>>>()?;
    Some(parts.join("/"))
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).with_context(|| format!("invalid glob: {pattern}"))?);
    }
    Ok(builder.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(root: &Path, rel: &str, body: &str) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, body).unwrap();
    }

    #[tokio::test]
    async fn test_default_excludes() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "src/main.rs", "fn main() {}");
        write(tmp.path(), ".git/config", "[core]");
        write(tmp.path(), "target/debug/app", "bin");
        write(tmp.path(), "web/node_modules/x/index.js", "x");
        write(tmp.path(), "README.md", "# hi");

        let tree = WorkingTree::new(tmp.path(), &[]).unwrap();
        let files = tree.list_files().await.unwrap();

        assert_eq!(files, vec!["README.md", "src/main.rs"]);
    }

    #[tokio::test]
    async fn test_configured_excludes() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "src/lib.rs", "");
        write(tmp.path(), "docs/notes.log", "");

        let tree = WorkingTree::new(tmp.path(), &["**/*.log".to_string()]).unwrap();
        assert_eq!(tree.list_files().await.unwrap(), vec!["src/lib.rs"]);
        assert!(tree.read("src/lib.rs").await.unwrap().is_empty());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_non_utf8_names_are_skipped() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "src/lib.rs", "");
        std::fs::write(tmp.path().join(OsStr::from_bytes(b"bad\xffname.rs")), "x").unwrap();

        let tree = WorkingTree::new(tmp.path(), &[]).unwrap();
        assert_eq!(tree.list_files().await.unwrap(), vec!["src/lib.rs"]);
    }

    #[test]
    fn test_missing_root_rejected() {
        assert!(WorkingTree::new(Path::new("/definitely/not/here"), &[]).is_err());
    }
}
