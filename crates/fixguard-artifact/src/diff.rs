//! Strict unified diff application
//!
//! Hunks must match the base text exactly (no fuzz, no offset search). A
//! diff that does not apply cleanly is an error, never a best-effort result.

/// One parsed hunk
#[derive(Debug, Clone, PartialEq, Eq)]
struct Hunk<'a> {
    old_start: usize,
    old_count: usize,
    lines: Vec<HunkLine<'a>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HunkLine<'a> {
    Context(&'a str),
    Remove(&'a str),
    Add(&'a str),
}

/// Where a `\ No newline at end of file` marker applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NewlineMarker {
    None,
    OldSide,
    NewSide,
}

/// Parsed unified diff for a single file
#[derive(Debug, Clone, PartialEq, Eq)]
struct ParsedDiff<'a> {
    hunks: Vec<Hunk<'a>>,
    marker: NewlineMarker,
}

/// Count added and removed lines without applying
///
/// # Errors
/// Returns error if the diff is malformed
pub fn diff_stats(diff: &str) -> Result<(usize, usize), DiffError> {
    let parsed = parse(diff)?;
    let mut added = 0;
    let mut removed = 0;
    for line in parsed.hunks.iter().flat_map(|h| &h.lines) {
        match line {
            HunkLine::Add(_) => added += 1,
            HunkLine::Remove(_) => removed += 1,
            HunkLine::Context(_) => {}
        }
    }
    Ok((added, removed))
}

/// Apply a unified diff to `base`, returning the new text
///
/// # Errors
/// Returns error if the diff is malformed or any hunk does not match `base`
pub fn apply_unified_diff(base: &str, diff: &str) -> Result<String, DiffError> {
    let parsed = parse(diff)?;
    let base_lines = split_lines(base);
    let base_trailing_newline = base.is_empty() || base.ends_with('\n');

    let mut out: Vec<&str> = Vec::with_capacity(base_lines.len());
    let mut cursor = 0usize;

    for hunk in &parsed.hunks {
        let start = if hunk.old_count == 0 {
            hunk.old_start
        } else {
            hunk.old_start.saturating_sub(1)
        };
        if start < cursor || start > base_lines.len() {
            return Err(DiffError::OutOfRange {
                line: hunk.old_start,
                len: base_lines.len(),
            });
        }
        out.extend_from_slice(&base_lines[cursor..start]);

        let mut pos = start;
        for line in &hunk.lines {
            match *line {
                HunkLine::Context(text) | HunkLine::Remove(text) => {
                    let found = base_lines.get(pos).copied();
                    if found != Some(text) {
                        return Err(DiffError::ContextMismatch {
                            line: pos + 1,
                            expected: text.to_string(),
                            found: found.unwrap_or("<eof>").to_string(),
                        });
                    }
                    if matches!(line, HunkLine::Context(_)) {
                        out.push(text);
                    }
                    pos += 1;
                }
                HunkLine::Add(text) => out.push(text),
            }
        }
        cursor = pos;
    }
    out.extend_from_slice(&base_lines[cursor..]);

    if out.is_empty() {
        return Ok(String::new());
    }
    let trailing = match parsed.marker {
        NewlineMarker::NewSide => false,
        NewlineMarker::OldSide => true,
        NewlineMarker::None => base_trailing_newline,
    };
    let mut text = out.join("\n");
    if trailing {
        text.push('\n');
    }
    Ok(text)
}

/// Split into lines without terminators; `\r` stays part of the line
fn split_lines(text: &str) -> Vec<&str> {
    if text.is_empty() {
        return Vec::new();
    }
    let body = text.strip_suffix('\n').unwrap_or(text);
    body.split('\n').collect()
}

fn parse(diff: &str) -> Result<ParsedDiff<'_>, DiffError> {
    if diff.trim().is_empty() {
        return Err(DiffError::Empty);
    }

    let lines = split_lines(diff);
    let mut hunks = Vec::new();
    let mut marker = NewlineMarker::None;
    let mut idx = 0;

    while idx < lines.len() {
        let line = lines[idx];
        if line.starts_with("@@") {
            let (old_start, old_count, new_count) = parse_header(line, idx + 1)?;
            idx += 1;
            let mut old_left = old_count;
            let mut new_left = new_count;
            let mut body = Vec::new();
            let mut last: Option<HunkLine<'_>> = None;

            while old_left > 0 || new_left > 0 {
                let Some(raw) = lines.get(idx).copied() else {
                    return Err(DiffError::Truncated { line: idx + 1 });
                };
                let parsed = match raw.as_bytes().first() {
                    Some(b' ') => HunkLine::Context(&raw[1..]),
                    None => HunkLine::Context(""),
                    Some(b'-') => HunkLine::Remove(&raw[1..]),
                    Some(b'+') => HunkLine::Add(&raw[1..]),
                    Some(b'\\') => {
                        marker = marker_for(last);
                        idx += 1;
                        continue;
                    }
                    _ => {
                        return Err(DiffError::UnexpectedLine {
                            line: idx + 1,
                            text: raw.to_string(),
                        })
                    }
                };
                match parsed {
                    HunkLine::Context(_) => {
                        old_left = dec(old_left, idx)?;
                        new_left = dec(new_left, idx)?;
                    }
                    HunkLine::Remove(_) => old_left = dec(old_left, idx)?,
                    HunkLine::Add(_) => new_left = dec(new_left, idx)?,
                }
                body.push(parsed);
                last = Some(parsed);
                idx += 1;
            }

            if lines.get(idx).is_some_and(|l| l.starts_with('\\')) {
                marker = marker_for(last);
                idx += 1;
            }

            hunks.push(Hunk {
                old_start,
                old_count,
                lines: body,
            });
            continue;
        }

        let is_header = line.starts_with("--- ")
            || line.starts_with("+++ ")
            || line.starts_with("diff ")
            || line.starts_with("index ");
        if is_header && !hunks.is_empty() && line.starts_with("--- ") {
            return Err(DiffError::MultipleFiles { line: idx + 1 });
        }
        if !is_header && !line.trim().is_empty() {
            return Err(DiffError::UnexpectedLine {
                line: idx + 1,
                text: line.to_string(),
            });
        }
        idx += 1;
    }

    if hunks.is_empty() {
        return Err(DiffError::NoHunks);
    }
    Ok(ParsedDiff { hunks, marker })
}

fn marker_for(last: Option<HunkLine<'_>>) -> NewlineMarker {
    match last {
        Some(HunkLine::Remove(_)) => NewlineMarker::OldSide,
        Some(_) => NewlineMarker::NewSide,
        None => NewlineMarker::None,
    }
}

fn dec(left: usize, idx: usize) -> Result<usize, DiffError> {
    left.checked_sub(1)
        .ok_or(DiffError::CountMismatch { line: idx + 1 })
}

/// Parse `@@ -a[,b] +c[,d] @@`
fn parse_header(line: &str, line_no: usize) -> Result<(usize, usize, usize), DiffError> {
    let malformed = || DiffError::MalformedHeader {
        line: line_no,
        text: line.to_string(),
    };
    let inner = line
        .strip_prefix("@@ ")
        .and_then(|rest| rest.split(" @@").next())
        .ok_or_else(malformed)?;
    let mut parts = inner.split_whitespace();
    let old = parts
        .next()
        .and_then(|p| p.strip_prefix('-'))
        .ok_or_else(malformed)?;
    let new = parts
        .next()
        .and_then(|p| p.strip_prefix('+'))
        .ok_or_else(malformed)?;

    let range = |spec: &str| -> Option<(usize, usize)> {
        match spec.split_once(',') {
            Some((start, count)) => Some((start.parse().ok()?, count.parse().ok()?)),
            None => Some((spec.parse().ok()?, 1)),
        }
    };
    let (old_start, old_count) = range(old).ok_or_else(malformed)?;
    let (_, new_count) = range(new).ok_or_else(malformed)?;
    Ok((old_start, old_count, new_count))
}

/// Errors from diff parsing and application
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DiffError {
    /// Diff text is empty
    #[error("empty diff")]
    Empty,

    /// Diff contains no hunks
    #[error("diff contains no hunks")]
    NoHunks,

    /// Bad `@@` header
    #[error("malformed hunk header at line {line}: {text}")]
    MalformedHeader { line: usize, text: String },

    /// Line that is not part of any hunk or header
    #[error("unexpected line {line}: {text}")]
    UnexpectedLine { line: usize, text: String },

    /// Hunk body ended before its declared counts were consumed
    #[error("truncated hunk at line {line}")]
    Truncated { line: usize },

    /// Hunk body has more lines than its header declares
    #[error("hunk line counts do not match header at line {line}")]
    CountMismatch { line: usize },

    /// More than one file in a single-file diff
    #[error("diff touches more than one file (second header at line {line})")]
    MultipleFiles { line: usize },

    /// Context or removed line does not match the base
    #[error("hunk does not match base at line {line}: expected {expected:?}, found {found:?}")]
    ContextMismatch {
        line: usize,
        expected: String,
        found: String,
    },

    /// Hunk starts outside the base or overlaps a previous hunk
    #[error("hunk at line {line} out of range for base of {len} lines")]
    OutOfRange { line: usize, len: usize },
}
