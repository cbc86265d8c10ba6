//! Build contexts assembled from a source directory tree.
//!
//! Every regular file under the root becomes one entry, at any depth, named by
//! its `/`-separated path relative to the root. Directories contribute no
//! entries of their own. Symlinks to files are followed; symlinks to
//! directories are skipped so a link cycle cannot recurse forever.

use std::fs;
use std::path::Path;

use bytes::Bytes;

use crate::environment::error::ArchiveError;

type Result<T> = std::result::Result<T, ArchiveError>;

/// One file in a build context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextEntry {
    /// Path relative to the context root, `/`-separated.
    pub path: String,
    /// Unix permission bits.
    pub mode: u32,
    /// Raw file content.
    pub content: Vec<u8>,
}

impl ContextEntry {
    /// Declared size in bytes.
    pub fn size(&self) -> u64 {
        self.content.len() as u64
    }
}

/// The complete file tree handed to an image build.
#[derive(Debug, Clone)]
pub struct BuildContext {
    entries: Vec<ContextEntry>,
}

impl BuildContext {
    /// Walk `root` and capture every regular file beneath it.
    pub fn from_dir(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        let mut entries = Vec::new();
        collect_entries(root, "", &mut entries)?;

        tracing::debug!(
            "Collected {} build context entries from {}",
            entries.len(),
            root.display()
        );

        Ok(Self { entries })
    }

    pub fn entries(&self) -> &[ContextEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether an entry exists at `path`.
    pub fn contains(&self, path: &str) -> bool {
        self.entries.iter().any(|e| e.path == path)
    }

    /// Total content size in bytes.
    pub fn total_size(&self) -> u64 {
        self.entries.iter().map(ContextEntry::size).sum()
    }

    /// Serialize the entries as a tar stream.
    pub fn to_archive(&self) -> Result<Bytes> {
        let mut builder = tar::Builder::new(Vec::new());

        for entry in &self.entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(entry.size());
            header.set_mode(entry.mode);
            header.set_cksum();
            builder
                .append_data(&mut header, &entry.path, entry.content.as_slice())
                .map_err(|source| ArchiveError::Write {
                    entry: entry.path.clone(),
                    source,
                })?;
        }

        let archive = builder.into_inner().map_err(|source| ArchiveError::Write {
            entry: "archive trailer".to_string(),
            source,
        })?;

        Ok(Bytes::from(archive))
    }
}

fn collect_entries(dir: &Path, prefix: &str, entries: &mut Vec<ContextEntry>) -> Result<()> {
    let read_dir_err = |source| ArchiveError::ReadDir {
        path: dir.to_path_buf(),
        source,
    };

    let mut children = fs::read_dir(dir)
        .map_err(read_dir_err)?
        .collect::<std::io::Result<Vec<_>>>()
        .map_err(read_dir_err)?;
    children.sort_by_key(|child| child.file_name());

    for child in children {
        let path = child.path();
        let name = child
            .file_name()
            .into_string()
            .map_err(|_| ArchiveError::InvalidPath { path: path.clone() })?;
        let relative = if prefix.is_empty() {
            name
        } else {
            format!("{}/{}", prefix, name)
        };

        let file_type = child.file_type().map_err(|source| ArchiveError::ReadFile {
            path: path.clone(),
            source,
        })?;

        if file_type.is_dir() {
            collect_entries(&path, &relative, entries)?;
            continue;
        }

        // Follow symlinks for the regular-file check only.
        let metadata = fs::metadata(&path).map_err(|source| ArchiveError::ReadFile {
            path: path.clone(),
            source,
        })?;
        if !metadata.is_file() {
            tracing::debug!("Skipping non-regular entry {}", path.display());
            continue;
        }

        let content = fs::read(&path).map_err(|source| ArchiveError::ReadFile {
            path: path.clone(),
            source,
        })?;

        entries.push(ContextEntry {
            path: relative,
            mode: file_mode(&metadata),
            content,
        });
    }

    Ok(())
}

#[cfg(unix)]
fn file_mode(metadata: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn file_mode(_metadata: &fs::Metadata) -> u32 {
    0o644
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use pretty_assertions::assert_eq;

    use super::*;

    fn write(root: &Path, relative: &str, content: &[u8]) {
        let path = root.join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn read_archive(bytes: &[u8]) -> Vec<(String, u64, Vec<u8>)> {
        let mut archive = tar::Archive::new(bytes);
        archive
            .entries()
            .unwrap()
            .map(|entry| {
                let mut entry = entry.unwrap();
                let path = entry.path().unwrap().to_string_lossy().into_owned();
                let size = entry.size();
                let mut data = Vec::new();
                entry.read_to_end(&mut data).unwrap();
                (path, size, data)
            })
            .collect()
    }

    #[test]
    fn test_nested_tree_is_complete() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "Dockerfile", b"FROM scratch\n");
        write(dir.path(), "app.bin", &[0, 1, 2, 255]);
        write(dir.path(), "handlers/health.go", b"package handlers");
        write(dir.path(), "migrations/sql/0001_init.up.sql", b"CREATE TABLE Stock ();");
        fs::create_dir_all(dir.path().join("empty/deeper")).unwrap();

        let context = BuildContext::from_dir(dir.path()).unwrap();

        let paths: Vec<&str> = context.entries().iter().map(|e| e.path.as_str()).collect();
        assert_eq!(
            paths,
            vec![
                "Dockerfile",
                "app.bin",
                "handlers/health.go",
                "migrations/sql/0001_init.up.sql",
            ]
        );
        assert_eq!(context.total_size(), 13 + 4 + 16 + 22);
    }

    #[test]
    fn test_archive_preserves_paths_sizes_and_content() {
        let dir = tempfile::tempdir().unwrap();
        let binary: Vec<u8> = (0..=255u8).cycle().take(4096).collect();
        write(dir.path(), "Dockerfile", b"FROM scratch\nCOPY app.bin /\n");
        write(dir.path(), "a/b/c/app.bin", &binary);

        let context = BuildContext::from_dir(dir.path()).unwrap();
        let archive = context.to_archive().unwrap();
        let entries = read_archive(&archive);

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].0, "Dockerfile");
        assert_eq!(entries[1].0, "a/b/c/app.bin");
        assert_eq!(entries[1].1, 4096);
        assert_eq!(entries[1].2, binary);
    }

    #[test]
    fn test_empty_tree_has_no_entries() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("only/dirs/here")).unwrap();

        let context = BuildContext::from_dir(dir.path()).unwrap();
        assert!(context.is_empty());

        let archive = context.to_archive().unwrap();
        assert!(read_archive(&archive).is_empty());
    }

    #[test]
    fn test_missing_root_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");

        let err = BuildContext::from_dir(&missing).unwrap_err();
        match err {
            ArchiveError::ReadDir { path, .. } => assert_eq!(path, missing),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_executable_bit_survives() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "run.sh", b"#!/bin/sh\n");
        fs::set_permissions(dir.path().join("run.sh"), fs::Permissions::from_mode(0o755))
            .unwrap();

        let context = BuildContext::from_dir(dir.path()).unwrap();
        assert_eq!(context.entries()[0].mode, 0o755);
    }

    #[cfg(unix)]
    #[test]
    fn test_directory_symlink_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "src/main.go", b"package main");
        std::os::unix::fs::symlink(dir.path(), dir.path().join("src/loop")).unwrap();

        let context = BuildContext::from_dir(dir.path()).unwrap();
        assert_eq!(context.len(), 1);
        assert!(context.contains("src/main.go"));
    }
}
