use std::fmt::Write as _;
use std::path::Path;

use crate::error::Result;
use crate::util::mmap_file;

/// Hex byte pairs per rendered `-`/`+` line.
pub const CHUNK_SIZE: usize = 16;

/// Coalescing threshold: a run of at least this many consecutive matching
/// bytes ends a differing region; shorter runs of matches inside a region do
/// not split it into two records.
pub const MIN_NON_DIFF_BYTES: usize = 16;

/// One byte-range replacement, keyed by offset. `old` or `new` being absent
/// records pure truncation or pure appending at the end of the shared range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffRecord {
    pub offset: u64,
    pub old: Option<Vec<u8>>,
    pub new: Option<Vec<u8>>,
}

/// Lazily compare two byte buffers, yielding one record per differing region
/// over the shared prefix plus one trailing record when the lengths differ.
pub fn diff_bytes<'a>(old: &'a [u8], new: &'a [u8]) -> ByteDiff<'a> {
    ByteDiff {
        old,
        new,
        pos: 0,
        shared: old.len().min(new.len()),
        tail_emitted: false,
    }
}

pub struct ByteDiff<'a> {
    old: &'a [u8],
    new: &'a [u8],
    pos: usize,
    shared: usize,
    tail_emitted: bool,
}

impl Iterator for ByteDiff<'_> {
    type Item = DiffRecord;

    fn next(&mut self) -> Option<DiffRecord> {
        while self.pos < self.shared {
            if self.old[self.pos] == self.new[self.pos] {
                self.pos += 1;
                continue;
            }
            let start = self.pos;
            self.pos = find_difference_end(self.old, self.new, start, self.shared);
            return Some(DiffRecord {
                offset: start as u64,
                old: Some(self.old[start..self.pos].to_vec()),
                new: Some(self.new[start..self.pos].to_vec()),
            });
        }

        if !self.tail_emitted {
            self.tail_emitted = true;
            if self.old.len() != self.new.len() {
                let at = self.shared;
                return Some(if self.old.len() == at {
                    DiffRecord {
                        offset: at as u64,
                        old: None,
                        new: Some(self.new[at..].to_vec()),
                    }
                } else {
                    DiffRecord {
                        offset: at as u64,
                        old: Some(self.old[at..].to_vec()),
                        new: None,
                    }
                });
            }
        }
        None
    }
}

/// Scan past a differing region starting at `i`. The region ends at the
/// first run of `MIN_NON_DIFF_BYTES` consecutive matching bytes, or at the
/// end of the shared range; trailing matches shorter than the threshold at
/// end of range are excluded from the region.
fn find_difference_end(old: &[u8], new: &[u8], mut i: usize, total: usize) -> usize {
    loop {
        while i < total && old[i] != new[i] {
            i += 1;
        }
        if i == total {
            return i;
        }

        let common_start = i;
        while i < total && i < common_start + MIN_NON_DIFF_BYTES && old[i] == new[i] {
            i += 1;
        }
        if i == total || i == common_start + MIN_NON_DIFF_BYTES {
            return common_start;
        }
    }
}

/// Render one record in the `@0x` / `-` / `+` grammar at the given indent.
pub fn render_record(record: &DiffRecord, indent: &str, out: &mut String) {
    let _ = writeln!(out, "{indent}@0x{:08x}", record.offset);
    if let Some(old) = record.old.as_deref() {
        push_hex_lines("- ", old, indent, out);
    }
    if let Some(new) = record.new.as_deref() {
        push_hex_lines("+ ", new, indent, out);
    }
}

fn push_hex_lines(prefix: &str, data: &[u8], indent: &str, out: &mut String) {
    for chunk in data.chunks(CHUNK_SIZE) {
        out.push_str(indent);
        out.push_str(prefix);
        for (i, byte) in chunk.iter().enumerate() {
            if i > 0 {
                out.push(' ');
            }
            let _ = write!(out, "{byte:02x}");
        }
        out.push('\n');
    }
}

/// Diff each (original, patched, target-name) file group and render the
/// grouped `>> name` document. Files with no differences contribute nothing.
pub fn render_file_groups(
    base_dir: &Path,
    groups: &[(String, String, String)],
    indent: &str,
    out: &mut String,
) -> Result<()> {
    for (file1, file2, target_name) in groups {
        let bytes1 = mmap_file(&base_dir.join(file1))?;
        let bytes2 = mmap_file(&base_dir.join(file2))?;

        let mut shown = false;
        for record in diff_bytes(&bytes1, &bytes2) {
            if !shown {
                let _ = writeln!(out, "{indent}>> {target_name}");
                shown = true;
            }
            render_record(&record, indent, out);
        }
    }
    Ok(())
}
