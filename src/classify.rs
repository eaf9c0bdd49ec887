use std::fs::File;
use std::path::Path;

use crate::error::{PatchError, Result};
use crate::util::read_full;

/// Comparison buffer size. Memory use per file pair stays at two buffers of
/// this size no matter how large the files are.
pub const BUFSIZE: usize = 2 * 1024 * 1024;

/// Outcome of comparing a file pair that is a regular file on both sides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentClass {
    Identical,
    Text,
    Binary,
}

/// Stream both files in lock-step and classify the pair.
///
/// A zero byte in any compared chunk of either side, up to and including the
/// chunk where the first difference appears, marks the pair binary; the probe
/// never depends on file extensions or magic numbers.
pub fn classify(path1: &Path, path2: &Path) -> Result<ContentClass> {
    let mut f1 = File::open(path1).map_err(|e| PatchError::io(path1, e))?;
    let mut f2 = File::open(path2).map_err(|e| PatchError::io(path2, e))?;

    let mut buf1 = vec![0u8; BUFSIZE];
    let mut buf2 = vec![0u8; BUFSIZE];
    let mut saw_null = false;

    loop {
        let n1 = read_full(&mut f1, &mut buf1).map_err(|e| PatchError::io(path1, e))?;
        let n2 = read_full(&mut f2, &mut buf2).map_err(|e| PatchError::io(path2, e))?;

        if !saw_null && (buf1[..n1].contains(&0) || buf2[..n2].contains(&0)) {
            saw_null = true;
        }

        if buf1[..n1] != buf2[..n2] {
            return Ok(if saw_null {
                ContentClass::Binary
            } else {
                ContentClass::Text
            });
        }
        if n1 == 0 {
            return Ok(ContentClass::Identical);
        }
    }
}

/// Single-file variant for files that exist only on the new side: no
/// comparison, only the null-byte probe.
pub fn is_binary(path: &Path) -> Result<bool> {
    let mut file = File::open(path).map_err(|e| PatchError::io(path, e))?;
    let mut buf = vec![0u8; BUFSIZE];

    loop {
        let n = read_full(&mut file, &mut buf).map_err(|e| PatchError::io(path, e))?;
        if buf[..n].contains(&0) {
            return Ok(true);
        }
        if n == 0 {
            return Ok(false);
        }
    }
}
