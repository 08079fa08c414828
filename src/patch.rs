use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::trace;

/// Failure to parse or apply a file patch
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PatchError {
    #[error("hunk {hunk} of {file} does not apply (expected line {expected_line})")]
    HunkMismatch {
        file: String,
        hunk: usize,
        expected_line: u32,
    },

    #[error("malformed patch for {file}: {reason}")]
    Malformed { file: String, reason: String },
}

/// A single file's structured patch, as stored alongside a review
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilePatch {
    pub old_file_name: String,
    pub new_file_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_header: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_header: Option<String>,
    #[serde(default)]
    pub hunks: Vec<Hunk>,
}

/// One `@@ -old_start,old_lines +new_start,new_lines @@` section.
///
/// `lines` keep their one-character prefix: `' '` context, `-` removed,
/// `+` added, `\` end-of-file newline marker.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hunk {
    pub old_start: u32,
    pub old_lines: u32,
    pub new_start: u32,
    pub new_lines: u32,
    #[serde(default)]
    pub lines: Vec<String>,
}

/// Apply `patch` to `source`, returning the patched text.
///
/// Every context and removal line must match exactly. A hunk that does not
/// fit at its recorded position is searched for nearby (closest first), but
/// never before the end of the previous hunk.
pub fn apply_patch(source: &str, patch: &FilePatch) -> Result<String, PatchError> {
    validate(patch)?;

    let (mut lines, mut delimiters) = split_lines(source);

    let mut offsets = Vec::with_capacity(patch.hunks.len());
    let mut offset: i64 = 0;
    let mut min_line: i64 = 0;

    for (index, hunk) in patch.hunks.iter().enumerate() {
        let max_line = lines.len() as i64 - i64::from(hunk.old_lines);
        let to_pos = offset + i64::from(hunk.old_start) - 1;

        let local = candidate_offsets(to_pos, min_line, max_line)
            .find(|local| hunk_fits(hunk, &lines, to_pos + local))
            .ok_or_else(|| PatchError::HunkMismatch {
                file: patch.new_file_name.clone(),
                hunk: index + 1,
                expected_line: hunk.old_start,
            })?;

        if local != 0 {
            trace!(hunk = index + 1, local, "Hunk applied at offset");
        }

        offset += local;
        offsets.push(offset);
        min_line = offset + i64::from(hunk.old_start) + i64::from(hunk.old_lines);
    }

    let mut diff_offset: i64 = 0;
    let mut remove_eof_newline = false;
    let mut add_eof_newline = false;

    for (hunk, hunk_offset) in patch.hunks.iter().zip(offsets) {
        let start = i64::from(hunk.old_start) + hunk_offset + diff_offset - 1;
        diff_offset += i64::from(hunk.new_lines) - i64::from(hunk.old_lines);
        let mut to_pos = usize::try_from(start).unwrap_or(0);

        let mut previous_op = None;
        for line in &hunk.lines {
            let (op, content) = split_op(line);
            match op {
                ' ' => to_pos += 1,
                '-' => {
                    remove_at(&mut lines, to_pos);
                    remove_at(&mut delimiters, to_pos);
                }
                '+' => {
                    insert_at(&mut lines, to_pos, content.to_string());
                    insert_at(&mut delimiters, to_pos, "\n".to_string());
                    to_pos += 1;
                }
                '\\' => match previous_op {
                    Some('+') => remove_eof_newline = true,
                    Some('-') => add_eof_newline = true,
                    _ => {}
                },
                _ => unreachable!("validated above"),
            }
            previous_op = Some(op);
        }
    }

    if remove_eof_newline {
        while lines.last().is_some_and(|l| l.is_empty()) {
            lines.pop();
            delimiters.pop();
        }
    } else if add_eof_newline {
        lines.push(String::new());
        delimiters.push("\n".to_string());
    }

    let mut out = String::with_capacity(source.len());
    let last = lines.len().saturating_sub(1);
    for (i, line) in lines.iter().enumerate() {
        out.push_str(line);
        if i < last {
            out.push_str(delimiters.get(i).map_or("\n", String::as_str));
        }
    }

    Ok(out)
}

fn validate(patch: &FilePatch) -> Result<(), PatchError> {
    for (index, hunk) in patch.hunks.iter().enumerate() {
        if let Some(line) = hunk
            .lines
            .iter()
            .find(|l| !matches!(l.chars().next(), None | Some(' ' | '-' | '+' | '\\')))
        {
            return Err(PatchError::Malformed {
                file: patch.new_file_name.clone(),
                reason: format!("unknown line in hunk {}: {:?}", index + 1, line),
            });
        }
    }
    Ok(())
}

/// Split off the operation prefix; an empty line is an empty context line
fn split_op(line: &str) -> (char, &str) {
    let mut chars = line.chars();
    match chars.next() {
        Some(op) => (op, chars.as_str()),
        None => (' ', ""),
    }
}

/// Offsets to try for a hunk expected at `start`: 0, +1, -1, +2, -2, ...
/// Non-zero offsets keep the hunk within `min_line..=max_line`.
fn candidate_offsets(start: i64, min_line: i64, max_line: i64) -> impl Iterator<Item = i64> {
    let reach = (max_line - start).max(start - min_line).max(0);
    std::iter::once(0).chain((1..=reach).flat_map(move |d| {
        let forward = (start + d <= max_line).then_some(d);
        let backward = (start - d >= min_line).then_some(-d);
        forward.into_iter().chain(backward)
    }))
}

fn hunk_fits(hunk: &Hunk, lines: &[String], pos: i64) -> bool {
    let mut pos = pos;
    for line in &hunk.lines {
        let (op, content) = split_op(line);
        if op == ' ' || op == '-' {
            let existing = usize::try_from(pos).ok().and_then(|p| lines.get(p));
            if existing.map(String::as_str) != Some(content) {
                return false;
            }
            pos += 1;
        }
    }
    true
}

/// Split text into lines and the delimiters that ended them (`\r\n`, `\n`, `\r`).
/// There is always one more line than delimiter.
fn split_lines(source: &str) -> (Vec<String>, Vec<String>) {
    let mut lines = Vec::new();
    let mut delimiters = Vec::new();
    let mut current = String::new();
    let mut chars = source.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\r' if chars.peek() == Some(&'\n') => {
                chars.next();
                lines.push(std::mem::take(&mut current));
                delimiters.push("\r\n".to_string());
            }
            '\r' | '\n' => {
                lines.push(std::mem::take(&mut current));
                delimiters.push(c.to_string());
            }
            _ => current.push(c),
        }
    }
    lines.push(current);

    (lines, delimiters)
}

fn insert_at(v: &mut Vec<String>, index: usize, value: String) {
    let index = index.min(v.len());
    v.insert(index, value);
}

fn remove_at(v: &mut Vec<String>, index: usize) {
    if index < v.len() {
        v.remove(index);
    }
}

/// Parse unified diff text into structured file patches
pub fn parse_patch(diff: &str) -> Result<Vec<FilePatch>, PatchError> {
    let mut files = Vec::new();
    let mut current_file: Option<FilePatch> = None;
    let mut current_hunk: Option<Hunk> = None;
    // Lines still expected on the old and new side of the open hunk
    let mut remaining = (0u32, 0u32);

    for line in diff.lines() {
        if let Some(mut hunk) = current_hunk.take() {
            if remaining != (0, 0) || line.starts_with('\\') {
                let (op, _) = split_op(line);
                match op {
                    ' ' => {
                        remaining.0 = remaining.0.saturating_sub(1);
                        remaining.1 = remaining.1.saturating_sub(1);
                    }
                    '-' => remaining.0 = remaining.0.saturating_sub(1),
                    '+' => remaining.1 = remaining.1.saturating_sub(1),
                    '\\' => {}
                    _ => {
                        let file = current_file
                            .as_ref()
                            .map(|f| f.new_file_name.clone())
                            .unwrap_or_default();
                        return Err(PatchError::Malformed {
                            file,
                            reason: format!("unexpected line in hunk: {:?}", line),
                        });
                    }
                }
                hunk.lines.push(line.to_string());
                current_hunk = Some(hunk);
                continue;
            }

            // Hunk is complete; fall through and treat this line as a header
            if let Some(ref mut file) = current_file {
                file.hunks.push(hunk);
            }
        }

        if let Some(rest) = line.strip_prefix("diff --git ") {
            if let Some(file) = current_file.take() {
                files.push(file);
            }

            // Parse file paths from "diff --git a/path b/path"
            let parts: Vec<&str> = rest.split(' ').collect();
            let mut file = FilePatch::default();
            if parts.len() >= 2 {
                file.old_file_name = strip_prefix(parts[0], "a/");
                file.new_file_name = strip_prefix(parts[parts.len() - 1], "b/");
            }
            current_file = Some(file);
        } else if let Some(rest) = line.strip_prefix("--- ") {
            let starts_new = current_file
                .as_ref()
                .map_or(true, |f| !f.hunks.is_empty() || f.old_header.is_some());
            if starts_new {
                if let Some(file) = current_file.take() {
                    files.push(file);
                }
                current_file = Some(FilePatch::default());
            }
            if let Some(ref mut file) = current_file {
                let (name, header) = split_file_header(rest);
                file.old_file_name = strip_prefix(name, "a/");
                file.old_header = Some(header.to_string());
            }
        } else if let Some(rest) = line.strip_prefix("+++ ") {
            if let Some(ref mut file) = current_file {
                let (name, header) = split_file_header(rest);
                file.new_file_name = strip_prefix(name, "b/");
                file.new_header = Some(header.to_string());
            }
        } else if line.starts_with("@@") {
            let Some(file) = current_file.as_ref() else {
                return Err(PatchError::Malformed {
                    file: String::new(),
                    reason: "hunk header before file header".to_string(),
                });
            };
            let hunk = parse_hunk_header(line).ok_or_else(|| PatchError::Malformed {
                file: file.new_file_name.clone(),
                reason: format!("invalid hunk header: {:?}", line),
            })?;
            remaining = (hunk.old_lines, hunk.new_lines);
            current_hunk = Some(hunk);
        }
    }

    if let Some(mut file) = current_file {
        if let Some(hunk) = current_hunk {
            if remaining != (0, 0) {
                return Err(PatchError::Malformed {
                    file: file.new_file_name,
                    reason: "hunk ended early".to_string(),
                });
            }
            file.hunks.push(hunk);
        }
        files.push(file);
    }

    Ok(files)
}

fn split_file_header(rest: &str) -> (&str, &str) {
    match rest.split_once('\t') {
        Some((name, header)) => (name, header),
        None => (rest, ""),
    }
}

fn strip_prefix(path: &str, prefix: &str) -> String {
    path.strip_prefix(prefix).unwrap_or(path).to_string()
}

fn parse_hunk_header(line: &str) -> Option<Hunk> {
    // Format: @@ -old_start,old_count +new_start,new_count @@
    let line = line.trim_start_matches("@@ ");
    let parts: Vec<&str> = line.split(" @@").next()?.split(' ').collect();

    if parts.len() < 2 {
        return None;
    }

    let old_parts: Vec<&str> = parts[0].strip_prefix('-')?.split(',').collect();
    let new_parts: Vec<&str> = parts[1].strip_prefix('+')?.split(',').collect();

    let old_start = old_parts.first()?.parse().ok()?;
    let old_lines = match old_parts.get(1) {
        Some(s) => s.parse().ok()?,
        None => 1,
    };
    let new_start = new_parts.first()?.parse().ok()?;
    let new_lines = match new_parts.get(1) {
        Some(s) => s.parse().ok()?,
        None => 1,
    };

    Some(Hunk {
        old_start,
        old_lines,
        new_start,
        new_lines,
        lines: Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn patch(hunks: Vec<Hunk>) -> FilePatch {
        FilePatch {
            old_file_name: "a.txt".to_string(),
            new_file_name: "a.txt".to_string(),
            hunks,
            ..Default::default()
        }
    }

    fn hunk(old_start: u32, old_lines: u32, new_start: u32, new_lines: u32, lines: &[&str]) -> Hunk {
        Hunk {
            old_start,
            old_lines,
            new_start,
            new_lines,
            lines: lines.iter().map(|l| l.to_string()).collect(),
        }
    }

    #[test]
    fn test_apply_simple_replacement() {
        let p = patch(vec![hunk(1, 3, 1, 3, &[" one", "-two", "+TWO", " three"])]);
        let result = apply_patch("one\ntwo\nthree\n", &p).unwrap();
        assert_eq!(result, "one\nTWO\nthree\n");
    }

    #[test]
    fn test_apply_multiple_hunks_tracks_offset() {
        let base = "a\nb\nc\nd\ne\nf\ng\nh\n";
        let p = patch(vec![
            hunk(1, 2, 1, 3, &[" a", "+a2", " b"]),
            hunk(7, 2, 8, 1, &[" g", "-h"]),
        ]);
        let result = apply_patch(base, &p).unwrap();
        assert_eq!(result, "a\na2\nb\nc\nd\ne\nf\ng\n");
    }

    #[test]
    fn test_apply_finds_shifted_hunk() {
        // Recorded at line 1, but two lines were inserted above it since
        let p = patch(vec![hunk(1, 2, 1, 2, &[" x", "-y", "+z"])]);
        let result = apply_patch("new1\nnew2\nx\ny\n", &p).unwrap();
        assert_eq!(result, "new1\nnew2\nx\nz\n");
    }

    #[test]
    fn test_apply_context_mismatch_fails() {
        let p = patch(vec![hunk(1, 2, 1, 2, &[" one", "-two", "+2"])]);
        let err = apply_patch("one\nthree\n", &p).unwrap_err();
        assert_eq!(
            err,
            PatchError::HunkMismatch {
                file: "a.txt".to_string(),
                hunk: 1,
                expected_line: 1
            }
        );
    }

    #[test]
    fn test_apply_malformed_line_fails() {
        let p = patch(vec![hunk(1, 1, 1, 1, &["?what"])]);
        assert!(matches!(
            apply_patch("what\n", &p),
            Err(PatchError::Malformed { .. })
        ));
    }

    #[test]
    fn test_apply_creates_new_file() {
        let p = patch(vec![hunk(0, 0, 1, 2, &["+first", "+second"])]);
        assert_eq!(apply_patch("", &p).unwrap(), "first\nsecond\n");
    }

    #[test]
    fn test_apply_removes_trailing_newline() {
        let p = patch(vec![hunk(
            1,
            2,
            1,
            2,
            &[" a", "-b", "+c", "\\ No newline at end of file"],
        )]);
        assert_eq!(apply_patch("a\nb\n", &p).unwrap(), "a\nc");
    }

    #[test]
    fn test_apply_adds_trailing_newline() {
        let p = patch(vec![hunk(
            1,
            2,
            1,
            2,
            &[" a", "-b", "\\ No newline at end of file", "+b"],
        )]);
        assert_eq!(apply_patch("a\nb", &p).unwrap(), "a\nb\n");
    }

    #[test]
    fn test_apply_preserves_crlf() {
        let p = patch(vec![hunk(1, 2, 1, 2, &[" a", "-b", "+c"])]);
        assert_eq!(apply_patch("a\r\nb\r\n", &p).unwrap(), "a\r\nc\n");
    }

    #[test]
    fn test_apply_without_hunks_is_identity() {
        assert_eq!(apply_patch("same\n", &patch(vec![])).unwrap(), "same\n");
    }

    #[test]
    fn test_parse_patch() {
        let diff = r#"diff --git a/src/main.rs b/src/main.rs
index 1234567..abcdefg 100644
--- a/src/main.rs
+++ b/src/main.rs
@@ -1,3 +1,4 @@
 fn main() {
+    println!("Hello");
     println!("World");
 }
"#;

        let files = parse_patch(diff).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].old_file_name, "src/main.rs");
        assert_eq!(files[0].new_file_name, "src/main.rs");
        assert_eq!(files[0].hunks.len(), 1);
        assert_eq!(files[0].hunks[0].new_start, 1);
        assert_eq!(files[0].hunks[0].new_lines, 4);
        assert_eq!(files[0].hunks[0].lines.len(), 4);
    }

    #[test]
    fn test_parse_plain_unified_diff_with_two_files() {
        let diff = "--- a/one.txt\t2020-01-01\n+++ b/one.txt\n@@ -1 +1 @@\n-x\n+y\n--- /dev/null\n+++ b/two.txt\n@@ -0,0 +1 @@\n+new\n";

        let files = parse_patch(diff).unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].old_header.as_deref(), Some("2020-01-01"));
        assert_eq!(files[1].old_file_name, "/dev/null");
        assert_eq!(files[1].new_file_name, "two.txt");

        assert_eq!(apply_patch("x\n", &files[0]).unwrap(), "y\n");
        assert_eq!(apply_patch("", &files[1]).unwrap(), "new\n");
    }

    #[test]
    fn test_parse_truncated_hunk_fails() {
        let diff = "--- a/x\n+++ b/x\n@@ -1,3 +1,3 @@\n a\n";
        assert!(parse_patch(diff).is_err());
    }

    #[test]
    fn test_parse_hunk_header() {
        let hunk = parse_hunk_header("@@ -10,5 +10,7 @@ fn example()").unwrap();
        assert_eq!(hunk.old_start, 10);
        assert_eq!(hunk.old_lines, 5);
        assert_eq!(hunk.new_start, 10);
        assert_eq!(hunk.new_lines, 7);

        let single = parse_hunk_header("@@ -3 +4 @@").unwrap();
        assert_eq!((single.old_lines, single.new_lines), (1, 1));
    }
}
