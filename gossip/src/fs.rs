// Copyright (c) 2018-2022 The Botho Foundation

//! The file-system adapter: the channel file manifest's external
//! collaborator, "treated as a create/open/stat interface" (spec.md §1).
//! `Channel` never touches `std::fs` directly; it only knows the manifest
//! entries (`path`, `mode`) exist somewhere an embedder-supplied adapter can
//! reach.

use std::io::{self, Read, Write};

/// What a stat call reports about a manifest path.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct FileMetadata {
    /// Size in bytes, `0` if the path does not exist.
    pub len: u64,
    /// Whether the path currently exists.
    pub exists: bool,
}

/// An open file handle, readable and writable depending on how it was
/// opened.
pub trait FileHandle: Read + Write + Send {}

impl<T: Read + Write + Send> FileHandle for T {}

/// create/open/stat over the channel's file manifest paths (spec.md §1).
/// Implementations decide where `path` actually lives — local disk, an
/// object store, a test double.
pub trait FileSystemAdapter: Send + Sync {
    /// Create `path` if absent; idempotent if it already exists.
    fn create(&self, path: &str) -> io::Result<()>;
    /// Open `path` for reading and writing.
    fn open(&self, path: &str) -> io::Result<Box<dyn FileHandle>>;
    /// Metadata for `path`, without requiring it to exist.
    fn stat(&self, path: &str) -> io::Result<FileMetadata>;
}

/// The straightforward local-disk implementation, rooted under a configured
/// base directory so a single adapter instance can't escape its sandbox via
/// a manifest entry like `../../etc/passwd`.
pub struct LocalFileSystemAdapter {
    root: std::path::PathBuf,
}

impl LocalFileSystemAdapter {
    /// Root every manifest path under `root`.
    pub fn new(root: impl Into<std::path::PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> io::Result<std::path::PathBuf> {
        let joined = self.root.join(path.trim_start_matches('/'));
        if joined.components().any(|c| matches!(c, std::path::Component::ParentDir)) {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "manifest path escapes root"));
        }
        Ok(joined)
    }
}

impl FileSystemAdapter for LocalFileSystemAdapter {
    fn create(&self, path: &str) -> io::Result<()> {
        let resolved = self.resolve(path)?;
        if let Some(parent) = resolved.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::OpenOptions::new().create(true).write(true).open(resolved)?;
        Ok(())
    }

    fn open(&self, path: &str) -> io::Result<Box<dyn FileHandle>> {
        let resolved = self.resolve(path)?;
        let file = std::fs::OpenOptions::new().read(true).write(true).create(true).open(resolved)?;
        Ok(Box::new(file))
    }

    fn stat(&self, path: &str) -> io::Result<FileMetadata> {
        let resolved = self.resolve(path)?;
        match std::fs::metadata(resolved) {
            Ok(meta) => Ok(FileMetadata { len: meta.len(), exists: true }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(FileMetadata::default()),
            Err(e) => Err(e),
        }
    }
}
