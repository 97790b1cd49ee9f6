//! Snapshot metadata and the collaborator interfaces around snapshot files.
//!
//! The pipeline only decides *what* goes into a snapshot and *when*; where
//! the files live and how the archive is compressed belong to the embedding
//! process and are injected through the traits below.

use std::fs;
use std::io;
use std::path::Path;

use serde::Deserialize;
use serde::Serialize;

/// Metadata describing the state covered by a snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub last_included_index: u64,
    pub last_included_term: u64,
    pub peers: Vec<String>,
    pub old_peers: Vec<String>,
}

/// Per-file metadata attached to a snapshot archive entry.
///
/// `user_meta` carries the serialized backup descriptor in backup mode and
/// is absent in fast (checkpoint) mode.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalFileMeta {
    pub user_meta: Option<Vec<u8>>,
}

/// Descriptor of one RocksDB backup inside a backup set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RocksBackupInfo {
    pub backup_id: u32,
    pub timestamp: i64,
    pub size: u64,
    pub num_files: u32,
}

/// Destination of an in-progress snapshot save.
pub trait SnapshotWriter: Send + Sync {
    /// Directory the snapshot is assembled in.
    fn path(&self) -> &Path;

    /// Register a produced file. Returns `false` when the writer refuses it
    /// (e.g. the snapshot was cancelled).
    fn add_file(&self, name: &str, meta: Option<LocalFileMeta>) -> bool;
}

/// Source of a snapshot being installed.
pub trait SnapshotReader: Send + Sync {
    /// Directory the snapshot files were downloaded to.
    fn path(&self) -> &Path;

    /// The snapshot metadata, or `None` when it cannot be loaded.
    fn load_meta(&self) -> Option<SnapshotMeta>;

    /// Metadata registered for a named file.
    fn file_meta(&self, name: &str) -> Option<LocalFileMeta>;
}

/// Packs the snapshot directory into a single archive file and back.
///
/// Compression mechanics are out of this crate's scope; production deploys
/// inject a real (zip) implementation here.
pub trait SnapshotArchiver: Send + Sync {
    fn compress(&self, source_dir: &Path, archive: &Path) -> io::Result<()>;
    fn extract(&self, archive: &Path, dest_dir: &Path) -> io::Result<()>;
}

/// Archiver that stores the snapshot tree verbatim, without compression.
///
/// The "archive" is a directory with the same layout as the source. Useful
/// for tests and single-host deployments where transport compression does
/// not matter.
#[derive(Debug, Default, Clone, Copy)]
pub struct DirCopyArchiver;

impl SnapshotArchiver for DirCopyArchiver {
    fn compress(&self, source_dir: &Path, archive: &Path) -> io::Result<()> {
        if archive.exists() {
            fs::remove_dir_all(archive)?;
        }
        copy_dir_recursive(source_dir, archive)
    }

    fn extract(&self, archive: &Path, dest_dir: &Path) -> io::Result<()> {
        let dest = dest_dir.join(
            archive
                .file_stem()
                .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "bad archive path"))?,
        );
        if dest.exists() {
            fs::remove_dir_all(&dest)?;
        }
        copy_dir_recursive(archive, &dest)
    }
}

fn copy_dir_recursive(from: &Path, to: &Path) -> io::Result<()> {
    fs::create_dir_all(to)?;
    for entry in fs::read_dir(from)? {
        let entry = entry?;
        let target = to.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_recursive(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dir_copy_archiver_round_trip() -> anyhow::Result<()> {
        let dir = tempfile::TempDir::new()?;
        let source = dir.path().join("kv");
        fs::create_dir_all(source.join("sub"))?;
        fs::write(source.join("a.sst"), b"aaa")?;
        fs::write(source.join("sub/b.sst"), b"bbb")?;

        let archive = dir.path().join("out").join("kv.zip");
        fs::create_dir_all(archive.parent().unwrap())?;
        let archiver = DirCopyArchiver;
        archiver.compress(&source, &archive)?;

        let restore = tempfile::TempDir::new()?;
        archiver.extract(&archive, restore.path())?;
        assert_eq!(b"aaa".to_vec(), fs::read(restore.path().join("kv/a.sst"))?);
        assert_eq!(
            b"bbb".to_vec(),
            fs::read(restore.path().join("kv/sub/b.sst"))?
        );
        Ok(())
    }
}
