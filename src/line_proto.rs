use std::io::BufRead;

use crate::error::Result;

/// Pull-based, indentation-scoped line tokenizer.
///
/// The stream is an ordered, arbitrarily nested sequence of text records
/// encoded with two structural cues: a section header line, followed by a run
/// of lines indented strictly deeper than the header. The indentation of the
/// first line inside a section fixes that section's base indent; the first
/// line at or below the parent's indent ends the section and is pushed back
/// for the parent to re-consume.
///
/// All reader state (the single-line pushback slot, the last-seen base
/// indent) lives on this struct; concurrent parses of different documents
/// use separate readers.
pub struct LineReader<R: BufRead> {
    input: R,
    pending: Option<String>,
    last_level: i64,
}

impl<R: BufRead> LineReader<R> {
    pub fn new(input: R) -> Self {
        LineReader {
            input,
            pending: None,
            last_level: -1,
        }
    }

    /// Next physical line with the trailing newline stripped, or `None` at
    /// end of input. Trailing spaces are kept; they carry indentation
    /// information for otherwise-blank lines.
    fn next_line(&mut self) -> Result<Option<String>> {
        if let Some(line) = self.pending.take() {
            return Ok(Some(line));
        }
        let mut buf = String::new();
        let n = self.input.read_line(&mut buf)?;
        if n == 0 {
            return Ok(None);
        }
        while buf.ends_with('\n') || buf.ends_with('\r') {
            buf.pop();
        }
        Ok(Some(buf))
    }

    fn unread(&mut self, line: String) {
        debug_assert!(self.pending.is_none(), "single-line pushback exceeded");
        self.pending = Some(line);
    }

    /// Open a section scoped below the last-seen base indent.
    pub fn section(&mut self) -> Section {
        Section::new(self.last_level, false)
    }

    /// Open a raw section: blank lines are forwarded and comment syntax is
    /// not interpreted. Needed when decoding embedded blob text or diff
    /// hunks, where such lines are meaningful payload.
    pub fn raw_section(&mut self) -> Section {
        Section::new(self.last_level, true)
    }
}

/// One indentation-scoped run of lines. Create via [`LineReader::section`],
/// then drain with [`Section::next_line`]; the section owns its base indent
/// and block-comment state so nested sections never interfere.
pub struct Section {
    parent_indent: i64,
    base_indent: Option<usize>,
    raw: bool,
    in_block_comment: bool,
    done: bool,
}

impl Section {
    fn new(parent_indent: i64, raw: bool) -> Self {
        Section {
            parent_indent,
            base_indent: None,
            raw,
            in_block_comment: false,
            done: false,
        }
    }

    /// The next content line of this section with the base indent stripped,
    /// or `None` once the section ends. A shallower line ending the section
    /// is pushed back into the reader.
    pub fn next_line<R: BufRead>(&mut self, reader: &mut LineReader<R>) -> Result<Option<String>> {
        if self.done {
            return Ok(None);
        }
        loop {
            let line = match reader.next_line()? {
                Some(line) => line,
                None => {
                    self.done = true;
                    return Ok(None);
                }
            };
            let trimmed = line.trim();

            if !self.raw && trimmed.is_empty() {
                continue;
            }

            // Comment lines are exempt from indentation rules.
            if !self.raw {
                if self.in_block_comment {
                    if trimmed.contains("*/") {
                        self.in_block_comment = false;
                    }
                    continue;
                }
                if trimmed.starts_with('#') {
                    continue;
                }
                if trimmed.starts_with("/*") {
                    self.in_block_comment = true;
                    continue;
                }
            }

            let indent = indent_level(&line);
            if indent as i64 <= self.parent_indent {
                // Fully blank lines never terminate a section.
                if line.is_empty() {
                    continue;
                }
                reader.unread(line);
                self.done = true;
                return Ok(None);
            }

            let base = *self.base_indent.get_or_insert(indent);
            reader.last_level = base as i64;
            let cut = base.min(indent);
            return Ok(Some(line[cut..].to_string()));
        }
    }

    /// Drain the remaining lines of this section into a vector.
    pub fn collect_lines<R: BufRead>(&mut self, reader: &mut LineReader<R>) -> Result<Vec<String>> {
        let mut lines = Vec::new();
        while let Some(line) = self.next_line(reader)? {
            lines.push(line);
        }
        Ok(lines)
    }
}

/// Number of leading whitespace characters of a line.
fn indent_level(line: &str) -> usize {
    line.len() - line.trim_start_matches([' ', '\t']).len()
}

/// Encode an arbitrary text line so it survives the line protocol: backslash,
/// newline and carriage return are backslash-escaped; a line beginning with
/// whitespace is prefixed with a backslash (unless the caller allows leading
/// spaces); a line whose content starts with `#` or `/*` after optional
/// leading whitespace is escaped the same way so payload never collides with
/// comment syntax.
pub fn escape_line(line: &str, allow_spaces: bool) -> String {
    let mut out = line
        .replace('\\', "\\\\")
        .replace('\n', "\\n")
        .replace('\r', "\\r");

    if !allow_spaces && out.starts_with([' ', '\t']) {
        out.insert(0, '\\');
    }

    let ws = indent_level(&out);
    let rest = &out[ws..];
    if rest.starts_with('#') || rest.starts_with("/*") {
        out.insert(ws, '\\');
    }

    out
}

/// Reverse [`escape_line`]: `\n` → newline, `\r` → carriage return,
/// `\t` → tab, `\x` → `x` for any other escaped character. A trailing lone
/// backslash is kept as-is.
pub fn unescape_line(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut chars = line.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('t') => out.push('\t'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}
