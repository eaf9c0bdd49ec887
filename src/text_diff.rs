use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use similar::TextDiff;
use tracing::debug;

use crate::error::{PatchError, Result};

const CONTEXT_RADIUS: usize = 3;

/// Produce one unified-diff blob covering all changed-or-new text files,
/// rooted at the tree roots. Each file contributes a
/// `diff -rNu a/<path> b/<path>` marker line followed by `---`/`+++` headers
/// carrying the canonical root-relative `a/`/`b/` paths (never the absolute
/// tree locations), then the hunks; paths are taken in the order given,
/// which callers keep ascending for determinism. A file missing on the left
/// side diffs against empty content.
pub fn render_tree_diff(left_root: &Path, right_root: &Path, files: &[String]) -> Result<Option<String>> {
    let mut out = String::new();

    for rel in files {
        let old = read_text_side(&left_root.join(rel))?;
        let new = read_text_side(&right_root.join(rel))?;

        let _ = writeln!(out, "diff -rNu a/{rel} b/{rel}");

        let diff = TextDiff::from_lines(old.as_str(), new.as_str());
        let header_a = format!("a/{rel}");
        let header_b = format!("b/{rel}");
        let mut udiff = diff.unified_diff();
        udiff.context_radius(CONTEXT_RADIUS).header(&header_a, &header_b);
        // Identical sides render no hunks and no headers; the marker line
        // alone records the (empty) new file.
        let _ = write!(out, "{udiff}");
    }

    Ok(if out.is_empty() { None } else { Some(out) })
}

fn read_text_side(path: &Path) -> Result<String> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(String::new()),
        Err(e) => return Err(PatchError::io(path, e)),
    };
    String::from_utf8(bytes)
        .map_err(|_| PatchError::ExternalTool(format!("diff input is not valid UTF-8: {}", path.display())))
}

/// Apply (or, with `dry_run`, only check) a unified-diff blob against a tree.
/// Hunks are applied strictly: every context and removed line must match the
/// live file, and any mismatch rejects the patch naming the path and hunk.
/// A dry run performs the full computation and touches nothing.
pub fn apply_blob(root: &Path, blob: &str, dry_run: bool) -> Result<()> {
    for file_patch in parse_blob(blob)? {
        apply_file(root, &file_patch, dry_run)?;
    }
    Ok(())
}

struct FilePatch {
    path: String,
    hunks: Vec<Hunk>,
}

#[derive(Default)]
struct Hunk {
    old_start: usize,
    old_count: usize,
    lines: Vec<HunkLine>,
    /// Set by a `\ No newline at end of file` marker following an old-side
    /// or new-side line respectively.
    old_missing_newline: bool,
    new_missing_newline: bool,
}

enum HunkLine {
    Context(String),
    Remove(String),
    Add(String),
}

fn parse_blob(blob: &str) -> Result<Vec<FilePatch>> {
    let mut patches: Vec<FilePatch> = Vec::new();

    for line in blob.lines() {
        if let Some(rest) = line.strip_prefix("diff ") {
            let path = parse_marker_path(rest)
                .ok_or_else(|| PatchError::malformed(format!("bad diff marker: {line}")))?;
            patches.push(FilePatch {
                path: path.to_string(),
                hunks: Vec::new(),
            });
            continue;
        }

        let current = patches
            .last_mut()
            .ok_or_else(|| PatchError::malformed(format!("diff line with no open file: {line}")))?;

        if line.starts_with("--- ") || line.starts_with("+++ ") {
            continue;
        }
        if line.starts_with("@@") {
            current.hunks.push(parse_hunk_header(line)?);
            continue;
        }

        let hunk = current
            .hunks
            .last_mut()
            .ok_or_else(|| PatchError::malformed(format!("hunk line with no open hunk: {line}")))?;

        if let Some(rest) = line.strip_prefix('+') {
            hunk.lines.push(HunkLine::Add(rest.to_string()));
        } else if let Some(rest) = line.strip_prefix('-') {
            hunk.lines.push(HunkLine::Remove(rest.to_string()));
        } else if let Some(rest) = line.strip_prefix(' ') {
            hunk.lines.push(HunkLine::Context(rest.to_string()));
        } else if line.starts_with('\\') {
            match hunk.lines.last() {
                Some(HunkLine::Remove(_)) => hunk.old_missing_newline = true,
                Some(HunkLine::Add(_)) => hunk.new_missing_newline = true,
                Some(HunkLine::Context(_)) => {
                    hunk.old_missing_newline = true;
                    hunk.new_missing_newline = true;
                }
                None => return Err(PatchError::malformed(line.to_string())),
            }
        } else if line.is_empty() {
            // Tolerated as an empty context line.
            hunk.lines.push(HunkLine::Context(String::new()));
        } else {
            return Err(PatchError::malformed(line.to_string()));
        }
    }

    Ok(patches)
}

/// Extract the path from a `diff -rNu a/<path> b/<path>` marker. The path
/// appears twice, so a name containing spaces (or even ` b/`) is recovered by
/// finding the split where both halves agree.
fn parse_marker_path(rest: &str) -> Option<&str> {
    let rest = rest.strip_prefix("-rNu a/")?;
    for (i, _) in rest.match_indices(" b/") {
        let (a_part, b_part) = (&rest[..i], &rest[i + 3..]);
        if a_part == b_part {
            return Some(a_part);
        }
    }
    None
}

/// Parse `@@ -old_start[,old_count] +new_start[,new_count] @@`. A zero count
/// positions the range after `start` instead of on it.
fn parse_hunk_header(line: &str) -> Result<Hunk> {
    let bad = || PatchError::malformed(format!("bad hunk header: {line}"));

    let mut parts = line.split_whitespace();
    let _at = parts.next().ok_or_else(bad)?;
    let old = parts.next().and_then(|p| p.strip_prefix('-')).ok_or_else(bad)?;
    let _new = parts.next().and_then(|p| p.strip_prefix('+')).ok_or_else(bad)?;

    let (old_start, old_count) = parse_range(old).ok_or_else(bad)?;
    Ok(Hunk {
        old_start,
        old_count,
        ..Hunk::default()
    })
}

fn parse_range(range: &str) -> Option<(usize, usize)> {
    match range.split_once(',') {
        Some((start, count)) => Some((start.parse().ok()?, count.parse().ok()?)),
        None => Some((range.parse().ok()?, 1)),
    }
}

fn apply_file(root: &Path, file_patch: &FilePatch, dry_run: bool) -> Result<()> {
    let target = root.join(&file_patch.path);
    let existing = match fs::read(&target) {
        Ok(bytes) => Some(bytes),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => return Err(PatchError::io(&target, e)),
    };
    let content = match &existing {
        Some(bytes) => std::str::from_utf8(bytes).map_err(|_| {
            PatchError::ExternalTool(format!("patch target is not valid UTF-8: {}", target.display()))
        })?,
        None => "",
    };

    let (lines, trailing_newline) = split_lines(content);
    let reject = |hunk: usize| PatchError::TextPatchRejected {
        path: file_patch.path.clone(),
        hunk,
    };

    let mut out: Vec<&str> = Vec::new();
    let mut pos = 0usize;
    let mut out_trailing_newline = trailing_newline;

    for (idx, hunk) in file_patch.hunks.iter().enumerate() {
        let hunk_no = idx + 1;
        let start = if hunk.old_count == 0 {
            hunk.old_start
        } else {
            hunk.old_start.checked_sub(1).ok_or_else(|| reject(hunk_no))?
        };
        if start < pos || start > lines.len() {
            return Err(reject(hunk_no));
        }
        out.extend_from_slice(&lines[pos..start]);
        pos = start;

        for hunk_line in &hunk.lines {
            match hunk_line {
                HunkLine::Context(text) => {
                    if lines.get(pos).copied() != Some(text.as_str()) {
                        return Err(reject(hunk_no));
                    }
                    out.push(lines[pos]);
                    pos += 1;
                }
                HunkLine::Remove(text) => {
                    if lines.get(pos).copied() != Some(text.as_str()) {
                        return Err(reject(hunk_no));
                    }
                    pos += 1;
                }
                HunkLine::Add(text) => out.push(text.as_str()),
            }
        }

        if hunk.old_missing_newline || hunk.new_missing_newline {
            out_trailing_newline = !hunk.new_missing_newline;
        }
    }

    out.extend_from_slice(&lines[pos..]);

    if dry_run {
        return Ok(());
    }

    let mut new_content = out.join("\n");
    if out_trailing_newline && !out.is_empty() {
        new_content.push('\n');
    }

    debug!("patching {}", file_patch.path);
    fs::write(&target, new_content).map_err(|e| PatchError::io(&target, e))
}

/// Split file content into logical lines plus a trailing-newline flag. An
/// empty file has zero lines; the flag defaults to true so created files end
/// with a newline unless a hunk marker says otherwise.
fn split_lines(content: &str) -> (Vec<&str>, bool) {
    if content.is_empty() {
        return (Vec::new(), true);
    }
    let trailing = content.ends_with('\n');
    let mut lines: Vec<&str> = content.split('\n').collect();
    if trailing {
        lines.pop();
    }
    (lines, trailing)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write(root: &Path, rel: &str, data: &str) {
        let path = root.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, data).unwrap();
    }

    fn roundtrip(old_files: &[(&str, &str)], new_files: &[(&str, &str)], changed: &[&str]) {
        let left = TempDir::new().unwrap();
        let right = TempDir::new().unwrap();
        let target = TempDir::new().unwrap();
        for (rel, data) in old_files {
            write(left.path(), rel, data);
            write(target.path(), rel, data);
        }
        for (rel, data) in new_files {
            write(right.path(), rel, data);
        }

        let files: Vec<String> = changed.iter().map(|s| s.to_string()).collect();
        let blob = render_tree_diff(left.path(), right.path(), &files)
            .unwrap()
            .expect("changes expected");

        apply_blob(target.path(), &blob, true).unwrap();
        apply_blob(target.path(), &blob, false).unwrap();

        for (rel, data) in new_files {
            let actual = fs::read_to_string(target.path().join(rel)).unwrap();
            assert_eq!(&actual, data, "file {rel}");
        }
    }

    #[test]
    fn test_modify_roundtrip() {
        roundtrip(
            &[("a.txt", "one\ntwo\nthree\nfour\nfive\n")],
            &[("a.txt", "one\ntwo\nTHREE\nfour\nfive\nsix\n")],
            &["a.txt"],
        );
    }

    #[test]
    fn test_new_file_roundtrip() {
        roundtrip(&[], &[("sub/new.txt", "fresh\ncontent\n")], &["sub/new.txt"]);
    }

    #[test]
    fn test_missing_trailing_newline_roundtrip() {
        roundtrip(
            &[("a.txt", "alpha\nbeta\n")],
            &[("a.txt", "alpha\nbeta\ngamma")],
            &["a.txt"],
        );
    }

    #[test]
    fn test_gains_trailing_newline_roundtrip() {
        roundtrip(
            &[("a.txt", "alpha\nbeta")],
            &[("a.txt", "alpha\nbeta\n")],
            &["a.txt"],
        );
    }

    #[test]
    fn test_multiple_files_and_hunks() {
        let old_a: String = (0..40).map(|i| format!("line {i}\n")).collect();
        let mut new_a = old_a.replace("line 3\n", "line three\n");
        new_a = new_a.replace("line 30\n", "line thirty\n");
        roundtrip(
            &[("a.txt", old_a.as_str()), ("b.txt", "b old\n")],
            &[("a.txt", new_a.as_str()), ("b.txt", "b new\n")],
            &["a.txt", "b.txt"],
        );
    }

    #[test]
    fn test_headers_are_root_relative() {
        let left = TempDir::new().unwrap();
        let right = TempDir::new().unwrap();
        write(left.path(), "f.txt", "old\n");
        write(right.path(), "f.txt", "new\n");

        let blob = render_tree_diff(left.path(), right.path(), &["f.txt".to_string()])
            .unwrap()
            .unwrap();
        let lines: Vec<&str> = blob.lines().collect();
        assert_eq!(lines[0], "diff -rNu a/f.txt b/f.txt");
        assert_eq!(lines[1], "--- a/f.txt");
        assert_eq!(lines[2], "+++ b/f.txt");
        assert!(!blob.contains(left.path().to_str().unwrap()));
        assert!(!blob.contains(right.path().to_str().unwrap()));
    }

    #[test]
    fn test_dry_run_does_not_mutate() {
        let left = TempDir::new().unwrap();
        let right = TempDir::new().unwrap();
        let target = TempDir::new().unwrap();
        write(left.path(), "f.txt", "old\n");
        write(right.path(), "f.txt", "new\n");
        write(target.path(), "f.txt", "old\n");

        let blob = render_tree_diff(left.path(), right.path(), &["f.txt".to_string()])
            .unwrap()
            .unwrap();
        apply_blob(target.path(), &blob, true).unwrap();
        assert_eq!(fs::read_to_string(target.path().join("f.txt")).unwrap(), "old\n");
    }

    #[test]
    fn test_rejects_on_drifted_target() {
        let left = TempDir::new().unwrap();
        let right = TempDir::new().unwrap();
        let target = TempDir::new().unwrap();
        write(left.path(), "f.txt", "expected\n");
        write(right.path(), "f.txt", "updated\n");
        write(target.path(), "f.txt", "something else\n");

        let blob = render_tree_diff(left.path(), right.path(), &["f.txt".to_string()])
            .unwrap()
            .unwrap();
        let err = apply_blob(target.path(), &blob, true).unwrap_err();
        match err {
            PatchError::TextPatchRejected { path, hunk } => {
                assert_eq!(path, "f.txt");
                assert_eq!(hunk, 1);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_marker_without_hunks_creates_empty_file() {
        let target = TempDir::new().unwrap();
        apply_blob(target.path(), "diff -rNu a/empty.txt b/empty.txt\n", false).unwrap();
        assert_eq!(fs::read(target.path().join("empty.txt")).unwrap(), b"");
    }

    #[test]
    fn test_parse_rejects_hunk_line_without_file() {
        let err = apply_blob(Path::new("."), "@@ -1,1 +1,1 @@\n", true).unwrap_err();
        assert!(matches!(err, PatchError::MalformedDocument(_)));
    }
}
