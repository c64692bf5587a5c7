//! Quote and comment aware SQL scanning
//!
//! Statement-by-statement execution needs to cut a script unit at its
//! delimiters without being fooled by delimiters inside string literals,
//! quoted identifiers, comments or `$tag$` bodies, and to recover the row
//! blocks delimited by the driver's marker comments.

use std::ops::Range;

use crate::driver::{BLOCK_BEGIN_MARKER, BLOCK_END_MARKER};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SegmentKind {
    Code,
    Quoted,
    Comment,
}

#[derive(Debug, Clone)]
struct Segment {
    kind: SegmentKind,
    range: Range<usize>,
}

/// Cut the text into code, quoted and comment segments
fn scan(sql: &str) -> Vec<Segment> {
    let bytes = sql.as_bytes();
    let mut segments = Vec::new();
    let mut code_start = 0;
    let mut i = 0;

    let push = |segments: &mut Vec<Segment>, kind: SegmentKind, range: Range<usize>| {
        if !range.is_empty() {
            segments.push(Segment { kind, range });
        }
    };

    while i < bytes.len() {
        let special = match bytes[i] {
            q @ (b'\'' | b'"' | b'`') => Some((SegmentKind::Quoted, quoted_end(bytes, i, q))),
            b'-' if bytes.get(i + 1) == Some(&b'-') => {
                let end = memchr_from(bytes, i, b'\n').unwrap_or(bytes.len());
                Some((SegmentKind::Comment, end))
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                let end = sql[i + 2..]
                    .find("*/")
                    .map(|p| i + 2 + p + 2)
                    .unwrap_or(bytes.len());
                Some((SegmentKind::Comment, end))
            }
            b'$' => dollar_tag(sql, i).map(|tag| {
                let body = i + tag.len();
                let end = sql[body..]
                    .find(tag)
                    .map(|p| body + p + tag.len())
                    .unwrap_or(bytes.len());
                (SegmentKind::Quoted, end)
            }),
            _ => None,
        };

        match special {
            Some((kind, end)) => {
                push(&mut segments, SegmentKind::Code, code_start..i);
                push(&mut segments, kind, i..end);
                i = end;
                code_start = end;
            }
            None => i += 1,
        }
    }
    push(&mut segments, SegmentKind::Code, code_start..bytes.len());
    segments
}

fn memchr_from(bytes: &[u8], from: usize, needle: u8) -> Option<usize> {
    bytes[from..].iter().position(|&b| b == needle).map(|p| from + p)
}

/// End (exclusive) of a quoted run starting at `start`; doubled quotes escape
fn quoted_end(bytes: &[u8], start: usize, quote: u8) -> usize {
    let mut i = start + 1;
    while i < bytes.len() {
        if bytes[i] == quote {
            if bytes.get(i + 1) == Some(&quote) {
                i += 2;
                continue;
            }
            return i + 1;
        }
        i += 1;
    }
    bytes.len()
}

/// `$$` or `$tag$` starting at `start`; `$1` style placeholders are not tags
fn dollar_tag(sql: &str, start: usize) -> Option<&str> {
    let rest = &sql[start + 1..];
    let len = rest
        .bytes()
        .take_while(|b| b.is_ascii_alphanumeric() || *b == b'_')
        .count();
    if rest.as_bytes().first().is_some_and(u8::is_ascii_digit) {
        return None;
    }
    (rest.as_bytes().get(len) == Some(&b'$')).then(|| &sql[start..start + len + 2])
}

/// One executable statement of a script
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlStatement {
    /// Statement text without delimiter and comments
    pub sql: String,
    /// 1-based line of the script the statement starts on
    pub line: usize,
}

/// Row block marker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Marker {
    /// Opens the statements of one row
    Begin {
        /// Destination name
        destination: String,
        /// Row index
        row: usize,
    },
    /// Closes the statements of one row
    End {
        /// Destination name
        destination: String,
        /// Row index
        row: usize,
    },
}

/// Parse a marker comment
pub fn parse_marker(comment: &str) -> Option<Marker> {
    let comment = comment.trim();
    let (is_begin, rest) = if let Some(rest) = comment.strip_prefix(BLOCK_BEGIN_MARKER) {
        (true, rest)
    } else {
        (false, comment.strip_prefix(BLOCK_END_MARKER)?)
    };
    let (destination, row) = rest.trim().rsplit_once(char::is_whitespace)?;
    let destination = destination.trim().to_string();
    let row = row.parse().ok()?;
    Some(if is_begin {
        Marker::Begin { destination, row }
    } else {
        Marker::End { destination, row }
    })
}

enum Piece {
    Statement(SqlStatement),
    Marker(Marker),
}

struct LineIndex(Vec<usize>);

impl LineIndex {
    fn new(sql: &str) -> Self {
        Self(sql.match_indices('\n').map(|(i, _)| i).collect())
    }

    fn line_of(&self, offset: usize) -> usize {
        self.0.partition_point(|&nl| nl < offset) + 1
    }
}

#[derive(Default)]
struct Pending {
    text: String,
    start: Option<usize>,
}

impl Pending {
    fn push(&mut self, piece: &str, offset: usize) {
        if self.start.is_none() {
            if let Some(lead) = piece.find(|c: char| !c.is_whitespace()) {
                self.start = Some(offset + lead);
            }
        }
        self.text.push_str(piece);
    }

    fn take(&mut self, lines: &LineIndex) -> Option<SqlStatement> {
        let pending = std::mem::take(self);
        let start = pending.start?;
        Some(SqlStatement {
            sql: pending.text.trim().to_string(),
            line: lines.line_of(start),
        })
    }
}

fn pieces(script: &str, delimiter: &str) -> Vec<Piece> {
    let lines = LineIndex::new(script);
    let mut out = Vec::new();
    let mut pending = Pending::default();

    for segment in scan(script) {
        let text = &script[segment.range.clone()];
        match segment.kind {
            SegmentKind::Quoted => pending.push(text, segment.range.start),
            SegmentKind::Comment => {
                match parse_marker(text) {
                    Some(marker) => {
                        out.extend(pending.take(&lines).map(Piece::Statement));
                        out.push(Piece::Marker(marker));
                    }
                    None => pending.push(" ", segment.range.start),
                }
            }
            SegmentKind::Code if delimiter.is_empty() => pending.push(text, segment.range.start),
            SegmentKind::Code => {
                let mut offset = segment.range.start;
                let mut rest = text;
                while let Some(pos) = rest.find(delimiter) {
                    pending.push(&rest[..pos], offset);
                    out.extend(pending.take(&lines).map(Piece::Statement));
                    offset += pos + delimiter.len();
                    rest = &rest[pos + delimiter.len()..];
                }
                pending.push(rest, offset);
            }
        }
    }
    out.extend(pending.take(&lines).map(Piece::Statement));
    out
}

/// Split a script into statements at the delimiter
pub fn split_statements(script: &str, delimiter: &str) -> Vec<SqlStatement> {
    pieces(script, delimiter)
        .into_iter()
        .filter_map(|p| match p {
            Piece::Statement(s) => Some(s),
            Piece::Marker(_) => None,
        })
        .collect()
}

/// Statements of one row, or a run of statements outside any row markers
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatementBlock {
    /// Destination named by the marker
    pub destination: Option<String>,
    /// Row index named by the marker
    pub row: Option<usize>,
    /// Statements in script order
    pub statements: Vec<SqlStatement>,
}

/// Split a script into row blocks
pub fn split_blocks(script: &str, delimiter: &str) -> Vec<StatementBlock> {
    let mut blocks = Vec::new();
    let mut current = StatementBlock::default();

    let flush = |blocks: &mut Vec<StatementBlock>, current: &mut StatementBlock| {
        let block = std::mem::take(current);
        if !block.statements.is_empty() {
            blocks.push(block);
        }
    };

    for piece in pieces(script, delimiter) {
        match piece {
            Piece::Statement(statement) => current.statements.push(statement),
            Piece::Marker(Marker::Begin { destination, row }) => {
                flush(&mut blocks, &mut current);
                current.destination = Some(destination);
                current.row = Some(row);
            }
            Piece::Marker(Marker::End { .. }) => flush(&mut blocks, &mut current),
        }
    }
    flush(&mut blocks, &mut current);
    blocks
}

/// A positional parameter placeholder
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Placeholder {
    /// Byte range in the text
    pub range: Range<usize>,
    /// Explicit 1-based number of `$n` placeholders
    pub number: Option<usize>,
}

/// Placeholders (`?` or `$n`) outside quotes and comments
pub(crate) fn placeholders(sql: &str) -> Vec<Placeholder> {
    let mut found = Vec::new();
    for segment in scan(sql) {
        if segment.kind != SegmentKind::Code {
            continue;
        }
        let bytes = sql.as_bytes();
        let mut i = segment.range.start;
        while i < segment.range.end {
            match bytes[i] {
                b'?' => {
                    found.push(Placeholder {
                        range: i..i + 1,
                        number: None,
                    });
                    i += 1;
                }
                b'$' => {
                    let digits = bytes[i + 1..segment.range.end]
                        .iter()
                        .take_while(|b| b.is_ascii_digit())
                        .count();
                    if digits > 0 {
                        let end = i + 1 + digits;
                        found.push(Placeholder {
                            range: i..end,
                            number: sql[i + 1..end].parse().ok(),
                        });
                        i = end;
                    } else {
                        i += 1;
                    }
                }
                _ => i += 1,
            }
        }
    }
    found
}

/// Number of positional parameter placeholders in a statement
pub fn count_placeholders(sql: &str) -> usize {
    placeholders(sql).len()
}

/// Byte offset of the parenthesis closing the one at `open`
pub(crate) fn matching_paren(sql: &str, open: usize) -> Option<usize> {
    let mut depth = 0usize;
    for segment in scan(sql) {
        if segment.kind != SegmentKind::Code || segment.range.end <= open {
            continue;
        }
        let from = segment.range.start.max(open);
        for (offset, b) in sql.as_bytes()[from..segment.range.end].iter().enumerate() {
            match b {
                b'(' => depth += 1,
                b')' => {
                    depth = depth.checked_sub(1)?;
                    if depth == 0 {
                        return Some(from + offset);
                    }
                }
                _ => {}
            }
        }
    }
    None
}

/// Split on `separator` at parenthesis depth zero, outside quotes
pub(crate) fn split_top_level(sql: &str, separator: u8) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for segment in scan(sql) {
        if segment.kind != SegmentKind::Code {
            continue;
        }
        for offset in segment.range.clone() {
            match sql.as_bytes()[offset] {
                b'(' => depth += 1,
                b')' => depth = depth.saturating_sub(1),
                b if b == separator && depth == 0 => {
                    parts.push(sql[start..offset].trim());
                    start = offset + 1;
                }
                _ => {}
            }
        }
    }
    parts.push(sql[start..].trim());
    parts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_ignores_quoted_delimiters() {
        let script = "INSERT INTO t VALUES ('a;b');\n-- c;d\nUPDATE t SET v = \"x;y\";\n/* ; */ DELETE FROM t";
        let statements = split_statements(script, ";");
        assert_eq!(statements.len(), 3);
        assert_eq!(statements[0].sql, "INSERT INTO t VALUES ('a;b')");
        assert_eq!(statements[1].sql, "UPDATE t SET v = \"x;y\"");
        assert_eq!(statements[1].line, 3);
        assert_eq!(statements[2].sql, "DELETE FROM t");
        assert_eq!(statements[2].line, 4);
    }

    #[test]
    fn test_split_dollar_quoted_body() {
        let script = "DO $$ BEGIN PERFORM 1; END $$;\nSELECT 2;";
        let statements = split_statements(script, ";");
        assert_eq!(statements.len(), 2);
        assert_eq!(statements[0].sql, "DO $$ BEGIN PERFORM 1; END $$");
    }

    #[test]
    fn test_escaped_quotes() {
        let statements = split_statements("SELECT 'it''s; fine';SELECT 1;", ";");
        assert_eq!(statements[0].sql, "SELECT 'it''s; fine'");
        assert_eq!(statements.len(), 2);
    }

    #[test]
    fn test_blocks_from_markers() {
        let script = "\
DELETE FROM stage;
-- etl:begin load users 0
INSERT INTO t VALUES (1);
INSERT INTO audit VALUES (1);
-- etl:end load users 0
-- etl:begin load users 1
INSERT INTO t VALUES (2);
-- etl:end load users 1
";
        let blocks = split_blocks(script, ";");
        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[0].row, None);
        assert_eq!(blocks[1].destination.as_deref(), Some("load users"));
        assert_eq!(blocks[1].row, Some(0));
        assert_eq!(blocks[1].statements.len(), 2);
        assert_eq!(blocks[2].row, Some(1));
        assert_eq!(blocks[2].statements[0].line, 7);
    }

    #[test]
    fn test_parse_marker() {
        assert_eq!(
            parse_marker("-- etl:end d 12"),
            Some(Marker::End {
                destination: "d".into(),
                row: 12
            })
        );
        assert_eq!(parse_marker("-- etl:begin d"), None);
        assert_eq!(parse_marker("-- plain comment"), None);
    }

    #[test]
    fn test_placeholders() {
        assert_eq!(count_placeholders("INSERT INTO t VALUES (?, '?', ?)"), 2);
        let found = placeholders("UPDATE t SET b = $2 WHERE id = $1");
        assert_eq!(found[0].number, Some(2));
        assert_eq!(found[1].number, Some(1));
        assert_eq!(count_placeholders("DO $$ SELECT $1 $$"), 0);
    }

    #[test]
    fn test_paren_helpers() {
        let sql = "(a, f(b, c), ')')";
        assert_eq!(matching_paren(sql, 0), Some(sql.len() - 1));
        assert_eq!(split_top_level(&sql[1..sql.len() - 1], b','), vec!["a", "f(b, c)", "')'"]);
    }
}
