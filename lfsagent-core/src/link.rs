//! Hard-link policy
//!
//! A committed object may be realized as a hard link to an existing file
//! instead of a private copy. Linking shares the inode, so it is only done
//! when the source can be trusted to stay unmodified.

use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

/// Ownership and device facts about a link source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceFacts {
    pub dev: u64,
    pub uid: u32,
    pub mode: u32,
    /// Whether the current process can read the file
    pub readable: bool,
}

/// Decide whether `src` may be hard-linked into a directory on `dst_dev`
/// by a process running as `euid`.
pub fn link_allowed(src: &SourceFacts, dst_dev: u64, euid: u32) -> bool {
    if src.dev != dst_dev {
        return false;
    }
    // the owner can always tighten permissions afterwards
    if src.uid == euid {
        return true;
    }
    src.mode & 0o022 == 0 && src.readable
}

/// Whether `src` can be hard-linked into `dst_dir`
pub fn can_link(src: &Path, dst_dir: &Path) -> io::Result<bool> {
    let src_meta = std::fs::metadata(src)?;
    let dst_meta = std::fs::metadata(dst_dir)?;
    let facts = SourceFacts {
        dev: src_meta.dev(),
        uid: src_meta.uid(),
        mode: src_meta.mode(),
        readable: is_readable(src),
    };
    Ok(link_allowed(&facts, dst_meta.dev(), effective_uid()))
}

/// Effective user id of this process
pub fn effective_uid() -> u32 {
    // SAFETY: geteuid has no preconditions and cannot fail.
    unsafe { libc::geteuid() }
}

fn is_readable(path: &Path) -> bool {
    let Ok(c_path) = std::ffi::CString::new(path.as_os_str().as_bytes()) else {
        return false;
    };
    // SAFETY: c_path is a valid NUL-terminated string for the duration of the call.
    unsafe { libc::access(c_path.as_ptr(), libc::R_OK) == 0 }
}
