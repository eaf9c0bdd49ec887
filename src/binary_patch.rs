use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, Seek, SeekFrom, Write};
use std::path::Path;

use tracing::debug;

use crate::error::{PatchError, Result};
use crate::line_proto::LineReader;
use crate::util::read_full;

/// One parsed byte-range edit. Empty `old` means there is nothing to match
/// against (pure append); empty `new` at the final offset of a file records
/// end-of-file shrinkage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Edit {
    pub old: Vec<u8>,
    pub new: Vec<u8>,
}

/// Parsed binary patch: target name → edits in ascending offset order.
pub type BinPatchSet = BTreeMap<String, BTreeMap<u64, Edit>>;

/// Parse the `>> name` / `@0x` / `-`/`+` grammar from the reader's current
/// section. With `unpatch` set the roles of `+` and `-` lines are swapped,
/// enabling best-effort reverse application.
pub fn parse_records<R: BufRead>(reader: &mut LineReader<R>, unpatch: bool) -> Result<BinPatchSet> {
    let mut records = BinPatchSet::new();

    let mut current_file: Option<String> = None;
    let mut current_offset: Option<u64> = None;
    let mut old_buf: Vec<u8> = Vec::new();
    let mut new_buf: Vec<u8> = Vec::new();

    let (old_prefix, new_prefix) = if unpatch { ("+ ", "- ") } else { ("- ", "+ ") };

    let mut flush = |file: &Option<String>,
                     offset: &mut Option<u64>,
                     old_buf: &mut Vec<u8>,
                     new_buf: &mut Vec<u8>,
                     records: &mut BinPatchSet| {
        if let (Some(file), Some(offset)) = (file.as_ref(), offset.take()) {
            records.entry(file.clone()).or_default().insert(
                offset,
                Edit {
                    old: std::mem::take(old_buf),
                    new: std::mem::take(new_buf),
                },
            );
        }
    };

    let mut section = reader.section();
    while let Some(line) = section.next_line(reader)? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(name) = line.strip_prefix(">> ") {
            flush(&current_file, &mut current_offset, &mut old_buf, &mut new_buf, &mut records);
            current_file = Some(name.to_string());
        } else if let Some(hex) = line.strip_prefix("@0x") {
            if current_file.is_none() {
                return Err(PatchError::malformed(format!("offset with no target file: {line}")));
            }
            flush(&current_file, &mut current_offset, &mut old_buf, &mut new_buf, &mut records);
            let offset = u64::from_str_radix(hex, 16)
                .map_err(|_| PatchError::malformed(format!("bad offset: {line}")))?;
            current_offset = Some(offset);
            old_buf.clear();
            new_buf.clear();
        } else if let Some(hex) = line.strip_prefix(old_prefix) {
            if current_offset.is_none() {
                return Err(PatchError::malformed(format!("byte line with no open offset: {line}")));
            }
            decode_hex_line(hex, &mut old_buf)?;
        } else if let Some(hex) = line.strip_prefix(new_prefix) {
            if current_offset.is_none() {
                return Err(PatchError::malformed(format!("byte line with no open offset: {line}")));
            }
            decode_hex_line(hex, &mut new_buf)?;
        } else {
            return Err(PatchError::malformed(line.to_string()));
        }
    }

    flush(&current_file, &mut current_offset, &mut old_buf, &mut new_buf, &mut records);
    Ok(records)
}

fn decode_hex_line(hex: &str, out: &mut Vec<u8>) -> Result<()> {
    for pair in hex.split_whitespace() {
        let byte = u8::from_str_radix(pair, 16)
            .map_err(|_| PatchError::malformed(format!("bad hex byte: {pair}")))?;
        out.push(byte);
    }
    Ok(())
}

/// Check one file's edits against its live content without mutating it:
/// every recorded old byte range must match exactly at its offset.
pub fn verify_file(dir: &Path, name: &str, edits: &BTreeMap<u64, Edit>) -> Result<()> {
    let path = dir.join(name);
    let mut file = File::open(&path).map_err(|e| PatchError::io(&path, e))?;

    for (&offset, edit) in edits {
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| PatchError::io(&path, e))?;
        let mut actual = vec![0u8; edit.old.len()];
        let n = read_full(&mut file, &mut actual).map_err(|e| PatchError::io(&path, e))?;
        if actual[..n] != edit.old[..] {
            return Err(PatchError::ContentMismatch {
                path: name.to_string(),
                offset,
            });
        }
    }
    Ok(())
}

/// Apply one file's edits in ascending offset order. If the final record's
/// replacement is shorter than the bytes it removes, the file is truncated to
/// `offset + new.len()`, modeling end-of-file shrinkage.
pub fn apply_file(dir: &Path, name: &str, edits: &BTreeMap<u64, Edit>) -> Result<()> {
    let path = dir.join(name);
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(&path)
        .map_err(|e| PatchError::io(&path, e))?;

    let mut last: Option<(u64, usize, usize)> = None;
    for (&offset, edit) in edits {
        if !edit.new.is_empty() {
            debug!("{name}: writing {} bytes at {offset:#010x}", edit.new.len());
            file.seek(SeekFrom::Start(offset))
                .map_err(|e| PatchError::io(&path, e))?;
            file.write_all(&edit.new).map_err(|e| PatchError::io(&path, e))?;
        }
        last = Some((offset, edit.old.len(), edit.new.len()));
    }

    if let Some((offset, old_len, new_len)) = last {
        if new_len < old_len {
            debug!("{name}: removing {} bytes at the end", old_len - new_len);
            file.set_len(offset + new_len as u64)
                .map_err(|e| PatchError::io(&path, e))?;
        }
    }
    Ok(())
}

/// Verify a whole parsed patch against `dir`.
pub fn verify_records(records: &BinPatchSet, dir: &Path) -> Result<()> {
    for (name, edits) in records {
        verify_file(dir, name, edits)?;
    }
    Ok(())
}

/// Apply a whole parsed patch to `dir`. Callers verify first.
pub fn apply_records(records: &BinPatchSet, dir: &Path) -> Result<()> {
    for (name, edits) in records {
        apply_file(dir, name, edits)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binary_diff::{diff_bytes, render_record};
    use std::fs;
    use std::io::Cursor;
    use tempfile::TempDir;

    fn parse_str(text: &str, unpatch: bool) -> Result<BinPatchSet> {
        let mut reader = LineReader::new(Cursor::new(text.as_bytes().to_vec()));
        parse_records(&mut reader, unpatch)
    }

    fn render(name: &str, old: &[u8], new: &[u8]) -> String {
        let mut out = String::new();
        out.push_str(&format!(">> {name}\n"));
        for record in diff_bytes(old, new) {
            render_record(&record, "", &mut out);
        }
        out
    }

    #[test]
    fn test_parse_rendered_diff() {
        let old = vec![0u8; 20];
        let mut new = old.clone();
        new[5] = 0xff;
        new[6] = 0xff;

        let text = render("file.bin", &old, &new);
        let records = parse_str(&text, false).unwrap();

        let edits = &records["file.bin"];
        assert_eq!(edits.len(), 1);
        assert_eq!(edits[&5], Edit { old: vec![0, 0], new: vec![0xff, 0xff] });
    }

    #[test]
    fn test_unpatch_swaps_sides() {
        let text = ">> f\n@0x00000005\n- 00 00\n+ ff ff\n";
        let records = parse_str(text, true).unwrap();
        assert_eq!(records["f"][&5], Edit { old: vec![0xff, 0xff], new: vec![0, 0] });
    }

    #[test]
    fn test_parse_rejects_orphan_byte_line() {
        let err = parse_str(">> f\n- 00\n", false).unwrap_err();
        assert!(matches!(err, PatchError::MalformedDocument(_)));
    }

    #[test]
    fn test_parse_rejects_offset_without_file() {
        let err = parse_str("@0x00000000\n", false).unwrap_err();
        assert!(matches!(err, PatchError::MalformedDocument(_)));
    }

    #[test]
    fn test_parse_rejects_bad_hex() {
        let err = parse_str(">> f\n@0x00000000\n- zz\n", false).unwrap_err();
        assert!(matches!(err, PatchError::MalformedDocument(_)));
    }

    #[test]
    fn test_comments_tolerated() {
        let text = "# leading note\n>> f\n/* block\nstill comment\n*/\n@0x00000002\n- 01\n+ 02\n";
        let records = parse_str(text, false).unwrap();
        assert_eq!(records["f"][&2], Edit { old: vec![1], new: vec![2] });
    }

    #[test]
    fn test_verify_and_apply_roundtrip() {
        let dir = TempDir::new().unwrap();
        let old: Vec<u8> = (0u8..=255).cycle().take(600).collect();
        let mut new = old.clone();
        new[17] = 0xde;
        new[300] = 0xad;
        new.truncate(500);

        let text = render("data.bin", &old, &new);
        let records = parse_str(&text, false).unwrap();

        fs::write(dir.path().join("data.bin"), &old).unwrap();
        verify_records(&records, dir.path()).unwrap();
        apply_records(&records, dir.path()).unwrap();

        assert_eq!(fs::read(dir.path().join("data.bin")).unwrap(), new);
    }

    #[test]
    fn test_apply_grows_file() {
        let dir = TempDir::new().unwrap();
        let old = b"short".to_vec();
        let new = b"short and then much longer".to_vec();

        let text = render("grow.bin", &old, &new);
        let records = parse_str(&text, false).unwrap();

        fs::write(dir.path().join("grow.bin"), &old).unwrap();
        verify_records(&records, dir.path()).unwrap();
        apply_records(&records, dir.path()).unwrap();

        assert_eq!(fs::read(dir.path().join("grow.bin")).unwrap(), new);
    }

    #[test]
    fn test_verify_rejects_drifted_content() {
        let dir = TempDir::new().unwrap();
        let text = ">> f.bin\n@0x00000000\n- 01 02\n+ 03 04\n";
        let records = parse_str(text, false).unwrap();

        fs::write(dir.path().join("f.bin"), [9u8, 9]).unwrap();
        let err = verify_records(&records, dir.path()).unwrap_err();
        match err {
            PatchError::ContentMismatch { path, offset } => {
                assert_eq!(path, "f.bin");
                assert_eq!(offset, 0);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_verify_rejects_short_file() {
        let dir = TempDir::new().unwrap();
        let text = ">> f.bin\n@0x00000010\n- 01 02\n+ 03 04\n";
        let records = parse_str(text, false).unwrap();

        fs::write(dir.path().join("f.bin"), [1u8; 4]).unwrap();
        assert!(matches!(
            verify_records(&records, dir.path()),
            Err(PatchError::ContentMismatch { .. })
        ));
    }

    #[test]
    fn test_forward_inverse_on_binary_content() {
        // Arbitrary content with embedded zero bytes and unequal lengths.
        let dir = TempDir::new().unwrap();
        let old: Vec<u8> = [0u8, 0, 1, 0, 200, 0, 0, 3].repeat(40);
        let mut new = old.clone();
        new[3] = 77;
        new[100] = 78;
        new.extend_from_slice(&[0, 9, 0, 9]);

        let text = render("blob", &old, &new);
        let records = parse_str(&text, false).unwrap();

        fs::write(dir.path().join("blob"), &old).unwrap();
        verify_records(&records, dir.path()).unwrap();
        apply_records(&records, dir.path()).unwrap();
        assert_eq!(fs::read(dir.path().join("blob")).unwrap(), new);
    }
}
