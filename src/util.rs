use std::io::Read;
use std::path::{Path, PathBuf};

use memmap2::Mmap;

use crate::error::{PatchError, Result};

/// Memory-map a file for read-only access.
///
/// # Safety
/// The mapping is read-only. Callers must not concurrently truncate or replace
/// the underlying file while the `Mmap` is live.
pub fn mmap_file(path: &Path) -> Result<Mmap> {
    let file = std::fs::File::open(path).map_err(|e| PatchError::io(path, e))?;
    // SAFETY: We only read from this mapping; no concurrent modification of these files.
    unsafe { Mmap::map(&file).map_err(|e| PatchError::io(path, e)) }
}

/// Fill `buf` as far as possible, retrying on interruption. Returns the
/// number of bytes read; less than `buf.len()` only at end of file.
pub fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Normalize a tree root for relative-path joining: trailing separators are
/// stripped, and a root that reduces to nothing (filesystem root given as
/// `/`) becomes the `/.` sentinel.
pub fn normalize_root(root: &Path) -> PathBuf {
    let s = root.to_string_lossy();
    let trimmed = s.trim_end_matches('/');
    if trimmed.is_empty() {
        PathBuf::from("/.")
    } else {
        PathBuf::from(trimmed)
    }
}

/// Join a slash-separated relative prefix with an entry name.
pub fn join_rel(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}/{name}")
    }
}

/// Sort directory paths so parents come before children.
pub fn sort_dirs_parent_first(dirs: &mut [String]) {
    dirs.sort();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_root() {
        assert_eq!(normalize_root(Path::new("/tmp/tree/")), PathBuf::from("/tmp/tree"));
        assert_eq!(normalize_root(Path::new("/")), PathBuf::from("/."));
        assert_eq!(normalize_root(Path::new("rel")), PathBuf::from("rel"));
    }

    #[test]
    fn test_join_rel() {
        assert_eq!(join_rel("", "a"), "a");
        assert_eq!(join_rel("a/b", "c"), "a/b/c");
    }

    #[test]
    fn test_read_full_short_source() {
        let data = b"abc";
        let mut buf = [0u8; 8];
        let n = read_full(&mut &data[..], &mut buf).unwrap();
        assert_eq!(n, 3);
        assert_eq!(&buf[..n], b"abc");
    }
}
