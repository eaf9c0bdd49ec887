use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::io::{BufRead, Read as _, Write as _};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::binary_diff::DiffRecord;
use crate::binary_patch::{self, BinPatchSet, Edit};
use crate::error::{PatchError, Result};
use crate::line_proto::{escape_line, unescape_line, LineReader, Section};

/// Characters of base64 payload per line.
const PAYLOAD_WRAP: usize = 120;

/// The complete, ordered description of all operations needed to turn one
/// tree into another. A pure value type: no open file handles, no external
/// process state; it can be serialized, stored indefinitely, parsed back and
/// consumed by verify + apply.
///
/// `new_files` holds raw (decompressed) bytes; gzip is applied at the
/// serialize/parse boundary.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PatchDocument {
    pub remove_dirs: Vec<String>,
    pub make_dirs: Vec<String>,
    pub remove_files: Vec<String>,
    pub make_symlinks: Vec<(String, String)>,
    pub bindiff: BinPatchSet,
    pub new_files: Vec<(String, Vec<u8>)>,
    pub text_diff: Option<String>,
}

/// One patch operation, borrowed from a document. The variants cover every
/// operation kind the format can express, so apply and verify drivers match
/// exhaustively.
#[derive(Debug, Clone, Copy)]
pub enum PatchOp<'a> {
    RemoveDir(&'a str),
    RemoveFile(&'a str),
    MakeDir(&'a str),
    MakeSymlink { path: &'a str, target: &'a str },
    NewFile { path: &'a str, data: &'a [u8] },
    BinaryEdits { path: &'a str, edits: &'a BTreeMap<u64, Edit> },
    TextPatch(&'a str),
}

/// Counts of the operations a document carries, for reporting.
#[derive(Debug, Default, Clone, Copy)]
pub struct PatchSummary {
    pub dirs_removed: usize,
    pub dirs_created: usize,
    pub files_removed: usize,
    pub symlinks_created: usize,
    pub files_created: usize,
    pub files_bindiffed: usize,
    pub text_patched: bool,
}

impl PatchDocument {
    pub fn is_empty(&self) -> bool {
        self.remove_dirs.is_empty()
            && self.make_dirs.is_empty()
            && self.remove_files.is_empty()
            && self.make_symlinks.is_empty()
            && self.bindiff.is_empty()
            && self.new_files.is_empty()
            && self.text_diff.is_none()
    }

    pub fn summary(&self) -> PatchSummary {
        PatchSummary {
            dirs_removed: self.remove_dirs.len(),
            dirs_created: self.make_dirs.len(),
            files_removed: self.remove_files.len(),
            symlinks_created: self.make_symlinks.len(),
            files_created: self.new_files.len(),
            files_bindiffed: self.bindiff.len(),
            text_patched: self.text_diff.is_some(),
        }
    }

    /// All operations in apply order: removals first, then structure
    /// creation, then content. Creates never race removals of the same name,
    /// and byte-level patches run against trees whose structure already
    /// matches the target.
    pub fn operations(&self) -> impl Iterator<Item = PatchOp<'_>> {
        let removals = self
            .remove_dirs
            .iter()
            .map(|p| PatchOp::RemoveDir(p))
            .chain(self.remove_files.iter().map(|p| PatchOp::RemoveFile(p)));
        let creation = self
            .make_dirs
            .iter()
            .map(|p| PatchOp::MakeDir(p))
            .chain(self.make_symlinks.iter().map(|(p, t)| PatchOp::MakeSymlink {
                path: p,
                target: t,
            }))
            .chain(self.new_files.iter().map(|(p, data)| PatchOp::NewFile {
                path: p,
                data,
            }));
        let content = self
            .bindiff
            .iter()
            .map(|(p, edits)| PatchOp::BinaryEdits { path: p, edits })
            .chain(self.text_diff.iter().map(|blob| PatchOp::TextPatch(blob)));
        removals.chain(creation).chain(content)
    }

    /// Render the document in the canonical section order. Empty sections
    /// are omitted; the reader accepts any order and tolerates missing
    /// sections.
    pub fn to_text(&self) -> String {
        let mut out = String::new();

        write_path_section(&mut out, "remove directories:", &self.remove_dirs);
        write_path_section(&mut out, "create directories:", &self.make_dirs);
        write_path_section(&mut out, "remove:", &self.remove_files);

        if !self.make_symlinks.is_empty() {
            out.push_str("create symlinks:\n");
            for (path, target) in &self.make_symlinks {
                let _ = writeln!(out, "  {}", escape_line(path, false));
                let _ = writeln!(out, "    {}", escape_line(target, false));
                out.push('\n');
            }
            out.push('\n');
        }

        if !self.bindiff.is_empty() {
            out.push_str("bindiff:\n");
            for (name, edits) in &self.bindiff {
                let _ = writeln!(out, "  >> {name}");
                for (&offset, edit) in edits {
                    let record = DiffRecord {
                        offset,
                        old: Some(edit.old.clone()),
                        new: Some(edit.new.clone()),
                    };
                    crate::binary_diff::render_record(&record, "  ", &mut out);
                }
            }
            out.push('\n');
        }

        if !self.new_files.is_empty() {
            out.push_str("new binary files:\n");
            for (path, data) in &self.new_files {
                let _ = writeln!(out, "  {}", escape_line(path, false));
                let payload = BASE64.encode(gzip(data));
                for chunk in payload.as_bytes().chunks(PAYLOAD_WRAP) {
                    // Base64 payload is ASCII-safe; escaping it is the identity.
                    let _ = writeln!(out, "    {}", std::str::from_utf8(chunk).unwrap_or_default());
                }
                out.push_str("  \n");
            }
        }

        if let Some(blob) = &self.text_diff {
            out.push_str("diff:\n");
            for line in blob.lines() {
                let _ = writeln!(out, "  {}", escape_line(line, true));
            }
            out.push('\n');
        }

        out
    }
}

fn write_path_section(out: &mut String, header: &str, paths: &[String]) {
    if paths.is_empty() {
        return;
    }
    out.push_str(header);
    out.push('\n');
    for path in paths {
        let _ = writeln!(out, "  {}", escape_line(path, false));
    }
    out.push('\n');
}

fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    // Writing into a Vec cannot fail.
    let _ = encoder.write_all(data);
    encoder.finish().unwrap_or_default()
}

fn gunzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| PatchError::malformed(format!("bad gzip payload: {e}")))?;
    Ok(out)
}

/// Parse a patch document from the reader. Sections may appear in any order
/// and may be missing; an unrecognized section header is a parse error
/// reported with the offending line.
pub fn parse_document<R: BufRead>(reader: &mut LineReader<R>) -> Result<PatchDocument> {
    let mut doc = PatchDocument::default();

    let mut top = reader.section();
    while let Some(line) = top.next_line(reader)? {
        if line.is_empty() {
            continue;
        }
        match line.as_str() {
            "remove directories:" => read_paths(reader, &mut doc.remove_dirs)?,
            "create directories:" => read_paths(reader, &mut doc.make_dirs)?,
            "remove:" => read_paths(reader, &mut doc.remove_files)?,
            "create symlinks:" => {
                let mut names = reader.section();
                while let Some(name) = names.next_line(reader)? {
                    let mut target_section = reader.section();
                    let target = target_section
                        .next_line(reader)?
                        .ok_or_else(|| PatchError::malformed(format!("symlink without target: {name}")))?;
                    // Drain any stray deeper lines of this entry.
                    while target_section.next_line(reader)?.is_some() {}
                    doc.make_symlinks
                        .push((unescape_line(&name), unescape_line(&target)));
                }
            }
            "bindiff:" => {
                doc.bindiff = binary_patch::parse_records(reader, false)?;
            }
            "new binary files:" => {
                let mut names = reader.section();
                while let Some(name) = names.next_line(reader)? {
                    let mut payload_section = reader.raw_section();
                    let mut payload = String::new();
                    while let Some(chunk) = payload_section.next_line(reader)? {
                        payload.push_str(&unescape_line(&chunk));
                    }
                    let compressed = BASE64
                        .decode(payload.trim())
                        .map_err(|e| PatchError::malformed(format!("bad base64 payload: {e}")))?;
                    doc.new_files.push((unescape_line(&name), gunzip(&compressed)?));
                }
            }
            "diff:" => {
                let mut blob_section = reader.raw_section();
                let mut blob = String::new();
                while let Some(diff_line) = blob_section.next_line(reader)? {
                    blob.push_str(&unescape_line(&diff_line));
                    blob.push('\n');
                }
                doc.text_diff = Some(blob);
            }
            other => return Err(PatchError::malformed(other.to_string())),
        }
    }

    Ok(doc)
}

fn read_paths<R: BufRead>(reader: &mut LineReader<R>, into: &mut Vec<String>) -> Result<()> {
    let mut section: Section = reader.section();
    while let Some(line) = section.next_line(reader)? {
        into.push(unescape_line(&line));
    }
    Ok(())
}
