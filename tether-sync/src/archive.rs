//! Archive format behind the backup store.
//!
//! [`Archiver`] is the seam; [`TarGzArchiver`] is the only implementation
//! shipped. Symlinks are archived as links, never followed; sockets, fifos
//! and device nodes are left out.

use std::fs::File;
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use walkdir::WalkDir;

use crate::error::SyncError;

/// Snapshot a directory tree into one file and overlay it back.
pub trait Archiver: Send + Sync {
    /// File extension (without leading dot) of archives produced.
    fn extension(&self) -> &'static str;

    /// Archive everything under `source` into `dest`, skipping any path
    /// that lies under one of `skip`.
    fn create(&self, source: &Path, dest: &Path, skip: &[PathBuf]) -> Result<(), SyncError>;

    /// Extract `archive` on top of `target`. Existing files are overwritten;
    /// files absent from the archive are left in place.
    fn extract(&self, archive: &Path, target: &Path) -> Result<(), SyncError>;
}

/// gzip-compressed tar archives.
#[derive(Debug, Default, Clone, Copy)]
pub struct TarGzArchiver;

impl Archiver for TarGzArchiver {
    fn extension(&self) -> &'static str {
        "tar.gz"
    }

    fn create(&self, source: &Path, dest: &Path, skip: &[PathBuf]) -> Result<(), SyncError> {
        let file = File::create(dest).map_err(|e| backup_err("create", dest, e))?;
        let encoder = GzEncoder::new(file, Compression::default());
        let mut builder = tar::Builder::new(encoder);
        builder.follow_symlinks(false);

        let walker = WalkDir::new(source)
            .min_depth(1)
            .follow_links(false)
            .into_iter()
            .filter_entry(|entry| !skip.iter().any(|s| entry.path().starts_with(s)));
        for entry in walker {
            let entry = entry.map_err(|e| SyncError::Backup(format!("walk {}: {e}", source.display())))?;
            let relative = entry
                .path()
                .strip_prefix(source)
                .map_err(|e| SyncError::Backup(e.to_string()))?;
            let file_type = entry.file_type();
            if !(file_type.is_file() || file_type.is_dir() || file_type.is_symlink()) {
                tracing::warn!("not archiving special file {}", entry.path().display());
                continue;
            }
            builder
                .append_path_with_name(entry.path(), relative)
                .map_err(|e| backup_err("append", entry.path(), e))?;
        }

        let encoder = builder
            .into_inner()
            .map_err(|e| backup_err("finish", dest, e))?;
        let file = encoder.finish().map_err(|e| backup_err("compress", dest, e))?;
        file.sync_all().map_err(|e| backup_err("sync", dest, e))?;
        Ok(())
    }

    fn extract(&self, archive: &Path, target: &Path) -> Result<(), SyncError> {
        std::fs::create_dir_all(target).map_err(|e| backup_err("create", target, e))?;
        let file = File::open(archive).map_err(|e| backup_err("open", archive, e))?;
        let mut unpacker = tar::Archive::new(GzDecoder::new(file));
        unpacker.set_overwrite(true);
        unpacker.set_preserve_permissions(true);
        unpacker
            .unpack(target)
            .map_err(|e| backup_err("extract", archive, e))
    }
}

fn backup_err(action: &str, path: &Path, err: impl std::fmt::Display) -> SyncError {
    SyncError::Backup(format!("{action} {}: {err}", path.display()))
}
