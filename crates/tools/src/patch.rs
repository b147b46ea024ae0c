//! Unified diff parsing and application.
//!
//! Accepts the shape models usually produce: optional `diff`/`---`/`+++`
//! headers, one or more `@@ -a,b +c,d @@` hunks. Hunk line counts in headers
//! are not trusted; a hunk runs until the next `@@` or file header. Hunks are
//! applied in order against the evolving content, searching outward from the
//! expected position when earlier edits shifted things. Trailing whitespace is
//! ignored when matching context.

use sandcastle_core::ToolError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HunkLine {
    Context(String),
    Remove(String),
    Add(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hunk {
    pub old_start: usize,
    pub old_count: usize,
    pub new_start: usize,
    pub new_count: usize,
    pub lines: Vec<HunkLine>,
}

impl Hunk {
    fn old_lines(&self) -> Vec<&str> {
        self.lines
            .iter()
            .filter_map(|l| match l {
                HunkLine::Context(s) | HunkLine::Remove(s) => Some(s.as_str()),
                HunkLine::Add(_) => None,
            })
            .collect()
    }

    fn new_lines(&self) -> Vec<&str> {
        self.lines
            .iter()
            .filter_map(|l| match l {
                HunkLine::Context(s) | HunkLine::Add(s) => Some(s.as_str()),
                HunkLine::Remove(_) => None,
            })
            .collect()
    }

    fn header(&self) -> String {
        format!(
            "@@ -{},{} +{},{} @@",
            self.old_start, self.old_count, self.new_start, self.new_count
        )
    }
}

/// A parsed unified diff for a single file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Patch {
    pub hunks: Vec<Hunk>,
}

impl Patch {
    pub fn parse(diff: &str) -> Result<Self, ToolError> {
        let lines: Vec<&str> = diff.lines().collect();
        let mut hunks: Vec<Hunk> = Vec::new();
        let mut current: Option<(Hunk, usize)> = None;
        let mut i = 0;

        while i < lines.len() {
            let line = lines[i];

            if line.starts_with("@@") {
                if let Some((hunk, blanks)) = current.take() {
                    hunks.push(finish_hunk(hunk, blanks));
                }
                current = Some((parse_header(line)?, 0));
                i += 1;
                continue;
            }

            let is_file_header = line.starts_with("diff ")
                || (line.starts_with("--- ")
                    && lines.get(i + 1).is_some_and(|next| next.starts_with("+++ ")));
            if is_file_header {
                if let Some((hunk, blanks)) = current.take() {
                    hunks.push(finish_hunk(hunk, blanks));
                }
                i += if line.starts_with("--- ") { 2 } else { 1 };
                continue;
            }

            if let Some((hunk, blanks)) = current.as_mut() {
                match line.chars().next() {
                    Some(' ') => {
                        hunk.lines.push(HunkLine::Context(line[1..].to_string()));
                        *blanks = 0;
                    }
                    Some('-') => {
                        hunk.lines.push(HunkLine::Remove(line[1..].to_string()));
                        *blanks = 0;
                    }
                    Some('+') => {
                        hunk.lines.push(HunkLine::Add(line[1..].to_string()));
                        *blanks = 0;
                    }
                    // "\ No newline at end of file"
                    Some('\\') => {}
                    None => {
                        hunk.lines.push(HunkLine::Context(String::new()));
                        *blanks += 1;
                    }
                    Some(_) => {
                        return Err(ToolError::PatchRejected(format!(
                            "unexpected line in hunk {}: {line:?}",
                            hunks.len() + 1
                        )));
                    }
                }
            }
            i += 1;
        }

        if let Some((hunk, blanks)) = current.take() {
            hunks.push(finish_hunk(hunk, blanks));
        }

        if hunks.is_empty() {
            return Err(ToolError::PatchRejected("diff contains no hunks".into()));
        }
        Ok(Self { hunks })
    }

    /// Lines prefixed with `+` inside hunks.
    pub fn lines_added(&self) -> usize {
        self.count(|l| matches!(l, HunkLine::Add(_)))
    }

    /// Lines prefixed with `-` inside hunks.
    pub fn lines_removed(&self) -> usize {
        self.count(|l| matches!(l, HunkLine::Remove(_)))
    }

    fn count(&self, pred: impl Fn(&HunkLine) -> bool) -> usize {
        self.hunks
            .iter()
            .flat_map(|h| h.lines.iter())
            .filter(|l| pred(l))
            .count()
    }

    /// Apply every hunk to `content`, returning the new content.
    pub fn apply(&self, content: &str) -> Result<String, ToolError> {
        let mut lines: Vec<String> = content.lines().map(String::from).collect();
        let trailing_newline = content.is_empty() || content.ends_with('\n');
        let mut offset: isize = 0;

        for (index, hunk) in self.hunks.iter().enumerate() {
            let old = hunk.old_lines();
            let new = hunk.new_lines();

            let hint = if old.is_empty() {
                // Pure insertion: `-N,0` inserts after line N
                hunk.old_start as isize + offset
            } else {
                hunk.old_start.saturating_sub(1) as isize + offset
            };
            let hint = hint.clamp(0, lines.len() as isize) as usize;

            let position = find_block(&lines, &old, hint).ok_or_else(|| {
                ToolError::PatchRejected(format!(
                    "hunk {} ({}) does not apply: expected lines not found",
                    index + 1,
                    hunk.header()
                ))
            })?;

            lines.splice(
                position..position + old.len(),
                new.iter().map(|s| s.to_string()),
            );
            offset += new.len() as isize - old.len() as isize;
        }

        if lines.is_empty() {
            return Ok(String::new());
        }
        let mut out = lines.join("\n");
        if trailing_newline {
            out.push('\n');
        }
        Ok(out)
    }
}

fn finish_hunk(mut hunk: Hunk, trailing_blanks: usize) -> Hunk {
    // Bare empty lines at the very end are usually padding, not context
    let keep = hunk.lines.len() - trailing_blanks;
    hunk.lines.truncate(keep);
    hunk
}

fn parse_header(line: &str) -> Result<Hunk, ToolError> {
    let invalid = || ToolError::PatchRejected(format!("malformed hunk header: {line:?}"));

    let inner = line
        .strip_prefix("@@")
        .and_then(|rest| rest.split("@@").next())
        .ok_or_else(invalid)?;
    let mut parts = inner.split_whitespace();
    let old = parts
        .next()
        .and_then(|p| p.strip_prefix('-'))
        .ok_or_else(invalid)?;
    let new = parts
        .next()
        .and_then(|p| p.strip_prefix('+'))
        .ok_or_else(invalid)?;

    let (old_start, old_count) = parse_range(old).ok_or_else(invalid)?;
    let (new_start, new_count) = parse_range(new).ok_or_else(invalid)?;
    Ok(Hunk {
        old_start,
        old_count,
        new_start,
        new_count,
        lines: Vec::new(),
    })
}

/// `12,3` → (12, 3); `12` → (12, 1).
fn parse_range(range: &str) -> Option<(usize, usize)> {
    match range.split_once(',') {
        Some((start, count)) => Some((start.parse().ok()?, count.parse().ok()?)),
        None => Some((range.parse().ok()?, 1)),
    }
}

/// How far a hunk may land from the line its header names.
const MAX_HUNK_DRIFT: usize = 100;

/// Locate `block` in `lines` within [`MAX_HUNK_DRIFT`] of `hint`, preferring
/// the closest position.
fn find_block(lines: &[String], block: &[&str], hint: usize) -> Option<usize> {
    if block.is_empty() {
        return Some(hint.min(lines.len()));
    }
    if block.len() > lines.len() {
        return None;
    }
    let last = lines.len() - block.len();
    let matches_at = |pos: usize| {
        lines[pos..pos + block.len()]
            .iter()
            .zip(block)
            .all(|(a, b)| a.trim_end() == b.trim_end())
    };

    let hint = hint.min(last);
    for distance in 0..=last.min(MAX_HUNK_DRIFT) {
        if hint >= distance && matches_at(hint - distance) {
            return Some(hint - distance);
        }
        if distance > 0 && hint + distance <= last && matches_at(hint + distance) {
            return Some(hint + distance);
        }
    }
    None
}
