//! Content-addressed object store on a local filesystem
//!
//! Objects are write-once. A new object is first materialized under a
//! uniquely named sibling temp file and then renamed over its final path, so
//! readers never observe a partial object. The existence check before the
//! rename is the only concurrency control: when two writers race on the same
//! oid, both produce identical content and the loser discards its temp file.

use crate::error::{AgentError, Result};
use crate::link::can_link;
use crate::object::{Oid, storage_path};
use std::fs;
use std::os::unix::fs::{DirBuilderExt, MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Mode of directories in a shared (group-writable, setgid) store
pub const SHARED_DIR_MODE: u32 = 0o2770;
/// Mode of directories in a private store
pub const PRIVATE_DIR_MODE: u32 = 0o700;
/// Mode of committed copies
pub const OBJECT_MODE: u32 = 0o444;

const SETGID: u32 = 0o2000;

/// How an object ended up at its destination
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// Destination already held the object; nothing was written
    AlreadyPresent,
    /// Destination is a hard link to the source
    Linked,
    /// Destination is a private copy of the source
    Copied,
    /// A prepared temp file was renamed into place
    Renamed,
}

/// A directory tree of committed objects
#[derive(Debug, Clone)]
pub struct ObjectStore {
    root: PathBuf,
    shared: bool,
}

impl ObjectStore {
    /// Open an existing store rooted at `root`.
    ///
    /// The store is shared when its root directory carries the setgid bit.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let meta = fs::metadata(&root)
            .map_err(|e| AgentError::path(&root, format!("object store not accessible: {}", e)))?;
        if !meta.is_dir() {
            return Err(AgentError::path(&root, "object store is not a directory"));
        }
        Ok(Self {
            shared: meta.mode() & SETGID != 0,
            root,
        })
    }

    /// Also treat the store as shared when the repository says so
    pub fn with_shared(mut self, shared: bool) -> Self {
        self.shared |= shared;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn is_shared(&self) -> bool {
        self.shared
    }

    /// Final path of `oid` in this store
    pub fn object_path(&self, oid: &Oid) -> PathBuf {
        storage_path(&self.root, oid)
    }

    /// Whether `oid` is committed
    pub fn contains(&self, oid: &Oid) -> bool {
        self.object_path(oid).exists()
    }

    /// Mode used for directories this store creates
    pub fn dir_mode(&self) -> u32 {
        if self.shared {
            SHARED_DIR_MODE
        } else {
            PRIVATE_DIR_MODE
        }
    }

    /// Create the two shard directories of `oid`; returns the inner one
    pub fn ensure_shard_dirs(&self, oid: &Oid) -> Result<PathBuf> {
        let hex = oid.to_hex();
        let outer = self.root.join(&hex[..2]);
        let inner = outer.join(&hex[2..4]);
        create_dir(&outer, self.dir_mode(), self.shared)?;
        create_dir(&inner, self.dir_mode(), self.shared)?;
        Ok(inner)
    }

    /// Create `path` with the store's directory mode.
    ///
    /// The parent must exist.
    pub fn ensure_dir(&self, path: &Path) -> Result<()> {
        create_dir(path, self.dir_mode(), self.shared)
    }

    /// Commit the content of `src` as `oid`, linking when the link policy
    /// allows and copying otherwise.
    pub fn commit_file(&self, oid: &Oid, src: &Path) -> Result<Placement> {
        let dst = self.object_path(oid);
        if dst.exists() {
            debug!("{} already present, skipping", oid);
            return Ok(Placement::AlreadyPresent);
        }

        let dir = self.ensure_shard_dirs(oid)?;
        let tmp = dir.join(temp_name(oid));
        let placement = link_or_copy(src, &tmp)?;
        self.publish(oid, &tmp, &dst, placement)
    }

    /// Commit `oid` as a hard link to `src`, never falling back to a copy.
    ///
    /// The link policy is the caller's responsibility.
    pub fn commit_link(&self, oid: &Oid, src: &Path) -> Result<Placement> {
        let dst = self.object_path(oid);
        if dst.exists() {
            return Ok(Placement::AlreadyPresent);
        }

        let dir = self.ensure_shard_dirs(oid)?;
        let tmp = dir.join(temp_name(oid));
        fs::hard_link(src, &tmp).map_err(|e| AgentError::Link {
            src: src.to_path_buf(),
            dst: tmp.clone(),
            source: e,
        })?;
        self.publish(oid, &tmp, &dst, Placement::Linked)
    }

    /// Commit an already written temp file as `oid`.
    ///
    /// The caller is responsible for having verified the content.
    pub fn commit_temp(&self, oid: &Oid, tmp: &Path) -> Result<Placement> {
        let dst = self.object_path(oid);
        if dst.exists() {
            discard(tmp);
            debug!("{} committed by another writer, discarded {}", oid, tmp.display());
            return Ok(Placement::AlreadyPresent);
        }

        fs::set_permissions(tmp, fs::Permissions::from_mode(OBJECT_MODE))
            .map_err(|e| AgentError::path(tmp, format!("cannot make read-only: {}", e)))?;
        self.ensure_shard_dirs(oid)?;
        self.publish(oid, tmp, &dst, Placement::Renamed)
    }

    /// Materialize `oid` as a fresh file inside `dst_dir` and return its path
    pub fn export(&self, oid: &Oid, dst_dir: &Path) -> Result<PathBuf> {
        let src = self.object_path(oid);
        if !src.exists() {
            return Err(AgentError::MissingObject {
                oid: oid.to_hex(),
                store: self.root.clone(),
            });
        }
        fs::create_dir_all(dst_dir).map_err(|e| AgentError::directory(dst_dir, e))?;
        let dst = dst_dir.join(temp_name(oid));
        let placement = link_or_copy(&src, &dst)?;
        debug!("exported {} to {} ({:?})", oid, dst.display(), placement);
        Ok(dst)
    }

    fn publish(&self, oid: &Oid, tmp: &Path, dst: &Path, placement: Placement) -> Result<Placement> {
        // lost the race against a concurrent writer; content is identical
        if dst.exists() {
            discard(tmp);
            info!("{} appeared while writing, discarded {}", oid, tmp.display());
            return Ok(Placement::AlreadyPresent);
        }

        if let Err(e) = fs::rename(tmp, dst) {
            discard(tmp);
            let (src, dst) = (tmp.to_path_buf(), dst.to_path_buf());
            return Err(match placement {
                Placement::Linked => AgentError::Link { src, dst, source: e },
                _ => AgentError::Copy { src, dst, source: e },
            });
        }

        info!("committed {} ({:?})", oid, placement);
        Ok(placement)
    }
}

/// Unique temp file name for `oid`
pub fn temp_name(oid: &Oid) -> String {
    format!("{}.tmp.{}", oid, uuid::Uuid::new_v4().simple())
}

/// Hard-link `src` to `dst` when the link policy allows it, otherwise copy.
///
/// `dst` must not exist. Copies are made read-only.
pub fn link_or_copy(src: &Path, dst: &Path) -> Result<Placement> {
    let dir = dst
        .parent()
        .ok_or_else(|| AgentError::path(dst, "destination has no parent directory"))?;
    let linkable = can_link(src, dir)
        .map_err(|e| AgentError::path(src, format!("cannot inspect source: {}", e)))?;
    place(src, dst, linkable)
}

/// Hard-link `src` to `dst` or make a read-only copy of it
pub fn place(src: &Path, dst: &Path, linkable: bool) -> Result<Placement> {
    if linkable {
        fs::hard_link(src, dst).map_err(|e| AgentError::Link {
            src: src.to_path_buf(),
            dst: dst.to_path_buf(),
            source: e,
        })?;
        return Ok(Placement::Linked);
    }

    let copied = fs::copy(src, dst)
        .and_then(|_| fs::set_permissions(dst, fs::Permissions::from_mode(OBJECT_MODE)));
    if let Err(e) = copied {
        if dst.exists() {
            discard(dst);
        }
        return Err(AgentError::Copy {
            src: src.to_path_buf(),
            dst: dst.to_path_buf(),
            source: e,
        });
    }
    Ok(Placement::Copied)
}

fn create_dir(path: &Path, mode: u32, shared: bool) -> Result<()> {
    if path.is_dir() {
        return Ok(());
    }
    match fs::DirBuilder::new().mode(mode).create(path) {
        Ok(()) => {}
        // another writer created it first
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists && path.is_dir() => return Ok(()),
        Err(e) => return Err(AgentError::directory(path, e)),
    }
    // umask strips group bits and mkdir ignores setgid
    if shared {
        fs::set_permissions(path, fs::Permissions::from_mode(mode))
            .map_err(|e| AgentError::directory(path, e))?;
    }
    Ok(())
}

fn discard(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        tracing::warn!("failed to remove {}: {}", path.display(), e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (TempDir, ObjectStore) {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("objects");
        fs::create_dir_all(&root).unwrap();
        let store = ObjectStore::open(&root).unwrap();
        (tmp, store)
    }

    fn source(dir: &Path, data: &[u8]) -> (PathBuf, Oid) {
        let path = dir.join("source.bin");
        fs::write(&path, data).unwrap();
        (path, Oid::from_data(data))
    }

    #[test]
    fn test_open_missing_root() {
        let tmp = TempDir::new().unwrap();
        let err = ObjectStore::open(tmp.path().join("absent")).unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::Path);
    }

    #[test]
    fn test_commit_links_own_file() {
        let (tmp, store) = setup();
        let (src, oid) = source(tmp.path(), b"large file content");

        let placement = store.commit_file(&oid, &src).unwrap();
        assert_eq!(placement, Placement::Linked);

        let dst = store.object_path(&oid);
        assert_eq!(fs::read(&dst).unwrap(), b"large file content");
        assert_eq!(fs::metadata(&dst).unwrap().ino(), fs::metadata(&src).unwrap().ino());
    }

    #[test]
    fn test_commit_is_idempotent() {
        let (tmp, store) = setup();
        let (src, oid) = source(tmp.path(), b"dedup me");

        store.commit_file(&oid, &src).unwrap();
        let dst = store.object_path(&oid);
        let before = fs::metadata(&dst).unwrap();

        let placement = store.commit_file(&oid, &src).unwrap();
        assert_eq!(placement, Placement::AlreadyPresent);

        let after = fs::metadata(&dst).unwrap();
        assert_eq!(before.ino(), after.ino());
        assert_eq!(before.mtime_nsec(), after.mtime_nsec());
        assert_eq!(fs::read_dir(dst.parent().unwrap()).unwrap().count(), 1);
    }

    #[test]
    fn test_second_writer_discards_temp() {
        let (tmp, store) = setup();
        let (src, oid) = source(tmp.path(), b"racing writers");

        // second writer prepared its temp file before the first one committed
        let dir = store.ensure_shard_dirs(&oid).unwrap();
        let late_tmp = dir.join(temp_name(&oid));
        fs::copy(&src, &late_tmp).unwrap();

        assert_eq!(store.commit_file(&oid, &src).unwrap(), Placement::Linked);
        assert_eq!(store.commit_temp(&oid, &late_tmp).unwrap(), Placement::AlreadyPresent);

        assert!(!late_tmp.exists());
        assert_eq!(fs::read(store.object_path(&oid)).unwrap(), b"racing writers");
        assert_eq!(fs::read_dir(&dir).unwrap().count(), 1);
    }

    #[test]
    fn test_commit_temp_is_read_only() {
        let (tmp, store) = setup();
        let data = b"uploaded bytes";
        let oid = Oid::from_data(data);
        let staged = tmp.path().join("staged");
        fs::write(&staged, data).unwrap();

        assert_eq!(store.commit_temp(&oid, &staged).unwrap(), Placement::Renamed);
        let mode = fs::metadata(store.object_path(&oid)).unwrap().mode();
        assert_eq!(mode & 0o777, OBJECT_MODE);
        assert!(!staged.exists());
    }

    #[test]
    fn test_private_shard_dirs() {
        let (_tmp, store) = setup();
        let oid = Oid::from_data(b"x");
        let dir = store.ensure_shard_dirs(&oid).unwrap();
        assert!(!store.is_shared());
        assert_eq!(fs::metadata(&dir).unwrap().mode() & 0o7777, PRIVATE_DIR_MODE);
    }

    #[test]
    fn test_shared_shard_dirs() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("objects");
        fs::create_dir_all(&root).unwrap();
        fs::set_permissions(&root, fs::Permissions::from_mode(0o2775)).unwrap();

        let store = ObjectStore::open(&root).unwrap();
        assert!(store.is_shared());

        let oid = Oid::from_data(b"shared");
        let inner = store.ensure_shard_dirs(&oid).unwrap();
        for dir in [inner.parent().unwrap(), inner.as_path()] {
            assert_eq!(fs::metadata(dir).unwrap().mode() & 0o7777, SHARED_DIR_MODE);
        }
    }

    #[test]
    fn test_shared_temp_dir_keeps_group_mode() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("objects");
        fs::create_dir_all(&root).unwrap();
        fs::set_permissions(&root, fs::Permissions::from_mode(0o2775)).unwrap();
        let store = ObjectStore::open(&root).unwrap();

        let staging = tmp.path().join("tmp");
        store.ensure_dir(&staging).unwrap();
        assert_eq!(fs::metadata(&staging).unwrap().mode() & 0o7777, SHARED_DIR_MODE);
    }

    #[test]
    fn test_copy_is_private_and_read_only() {
        let (tmp, _store) = setup();
        let (src, _) = source(tmp.path(), b"copied, not linked");
        let dst = tmp.path().join("copy");

        assert_eq!(place(&src, &dst, false).unwrap(), Placement::Copied);
        let (src_meta, dst_meta) = (fs::metadata(&src).unwrap(), fs::metadata(&dst).unwrap());
        assert_ne!(src_meta.ino(), dst_meta.ino());
        assert_eq!(dst_meta.mode() & 0o777, OBJECT_MODE);
        assert_eq!(fs::read(&dst).unwrap(), b"copied, not linked");
    }

    #[test]
    fn test_failed_copy_leaves_nothing_behind() {
        let (tmp, _store) = setup();
        let dst = tmp.path().join("copy");

        let err = place(&tmp.path().join("vanished"), &dst, false).unwrap_err();
        assert!(matches!(err, AgentError::Copy { .. }));
        assert_eq!(err.code().as_i32(), 5);
        assert!(!dst.exists());
    }

    #[test]
    fn test_failed_link_is_link_error() {
        let (tmp, _store) = setup();
        let err = place(&tmp.path().join("vanished"), &tmp.path().join("link"), true).unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::Link);
    }

    #[test]
    fn test_shared_from_config() {
        let (_tmp, store) = setup();
        assert!(store.with_shared(true).is_shared());
    }

    #[test]
    fn test_export_missing_object() {
        let (tmp, store) = setup();
        let err = store.export(&Oid::from_data(b"nothing"), tmp.path()).unwrap_err();
        assert!(matches!(err, AgentError::MissingObject { .. }));
    }

    #[test]
    fn test_export_creates_fresh_file() {
        let (tmp, store) = setup();
        let (src, oid) = source(tmp.path(), b"download me");
        store.commit_file(&oid, &src).unwrap();

        let out_dir = tmp.path().join("lfs-tmp");
        let first = store.export(&oid, &out_dir).unwrap();
        let second = store.export(&oid, &out_dir).unwrap();
        assert_ne!(first, second);
        assert_eq!(fs::read(&first).unwrap(), b"download me");
        assert!(first.starts_with(&out_dir));
    }
}
