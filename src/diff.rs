//! Unified diff parsing
//!
//! Parses multi-file unified diffs (git-style or plain `---`/`+++`), keeps
//! the raw text of each file section so a filtered subset can be re-emitted,
//! and pulls diff blocks out of free-form generator output.

use std::collections::BTreeSet;

/// A single line in a diff hunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiffLine {
    Context(String),
    Add(String),
    Remove(String),
}

impl DiffLine {
    pub fn content(&self) -> &str {
        match self {
            DiffLine::Context(s) => s,
            DiffLine::Add(s) => s,
            DiffLine::Remove(s) => s,
        }
    }
}

/// A hunk in a unified diff
#[derive(Debug, Clone, PartialEq)]
pub struct DiffHunk {
    pub old_start: usize,
    pub old_count: usize,
    pub new_start: usize,
    pub new_count: usize,
    pub lines: Vec<DiffLine>,
}

impl DiffHunk {
    /// (additions, removals) in this hunk
    pub fn summary(&self) -> (usize, usize) {
        let adds = self
            .lines
            .iter()
            .filter(|l| matches!(l, DiffLine::Add(_)))
            .count();
        let removes = self
            .lines
            .iter()
            .filter(|l| matches!(l, DiffLine::Remove(_)))
            .count();
        (adds, removes)
    }
}

/// One file's section of a diff. `None` paths stand for `/dev/null`.
#[derive(Debug, Clone, PartialEq)]
pub struct FileDiff {
    pub old_path: Option<String>,
    pub new_path: Option<String>,
    pub hunks: Vec<DiffHunk>,
    pub binary: bool,
    raw: Vec<String>,
}

impl FileDiff {
    fn new(old_path: Option<String>, new_path: Option<String>) -> Self {
        Self {
            old_path,
            new_path,
            hunks: Vec::new(),
            binary: false,
            raw: Vec::new(),
        }
    }

    /// Every repository path this section touches (both sides of a rename).
    pub fn paths(&self) -> Vec<&str> {
        let mut out = Vec::new();
        if let Some(old) = self.old_path.as_deref() {
            out.push(old);
        }
        if let Some(new) = self.new_path.as_deref() {
            if Some(new) != self.old_path.as_deref() {
                out.push(new);
            }
        }
        out
    }

    /// The path the file lives at after the patch, or before it for deletions.
    pub fn path(&self) -> &str {
        self.new_path
            .as_deref()
            .or(self.old_path.as_deref())
            .unwrap_or("")
    }

    pub fn is_new_file(&self) -> bool {
        self.old_path.is_none()
    }

    pub fn stats(&self) -> (usize, usize) {
        self.hunks.iter().fold((0, 0), |acc, h| {
            let (a, r) = h.summary();
            (acc.0 + a, acc.1 + r)
        })
    }

    /// Added lines paired with their 1-based line number in the new file.
    pub fn added_lines(&self) -> Vec<(usize, &str)> {
        let mut out = Vec::new();
        for hunk in &self.hunks {
            let mut new_line = hunk.new_start;
            for line in &hunk.lines {
                match line {
                    DiffLine::Add(s) => {
                        out.push((new_line, s.as_str()));
                        new_line += 1;
                    }
                    DiffLine::Context(_) => new_line += 1,
                    DiffLine::Remove(_) => {}
                }
            }
        }
        out
    }

    pub fn raw_text(&self) -> String {
        let mut text = self.raw.join("\n");
        text.push('\n');
        text
    }
}

/// A parsed multi-file diff
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PatchSet {
    pub files: Vec<FileDiff>,
}

impl PatchSet {
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn touched_paths(&self) -> BTreeSet<String> {
        self.files
            .iter()
            .flat_map(|f| f.paths())
            .map(str::to_string)
            .collect()
    }

    pub fn file_count(&self) -> usize {
        self.touched_paths().len()
    }

    /// Added plus removed lines across all files
    pub fn changed_line_count(&self) -> usize {
        self.files
            .iter()
            .map(|f| {
                let (a, r) = f.stats();
                a + r
            })
            .sum()
    }

    pub fn file(&self, path: &str) -> Option<&FileDiff> {
        self.files.iter().find(|f| f.paths().contains(&path))
    }

    /// Re-emit the raw text of every file section accepted by `keep`.
    pub fn filtered_text<F>(&self, keep: F) -> String
    where
        F: Fn(&FileDiff) -> bool,
    {
        self.files
            .iter()
            .filter(|f| keep(f))
            .map(FileDiff::raw_text)
            .collect::<Vec<_>>()
            .join("")
    }
}

/// Parse a unified diff string into structured data.
///
/// Text outside file sections is ignored. A section with neither hunks
/// nor a binary marker is dropped unless it is a pure rename or mode change.
pub fn parse_patch(diff: &str) -> Result<PatchSet, String> {
    let lines: Vec<&str> = diff.lines().collect();
    let mut files: Vec<FileDiff> = Vec::new();
    let mut current: Option<FileDiff> = None;
    // True while inside a `diff --git` section that has not seen its `---` yet.
    let mut git_header_open = false;
    let mut i = 0;

    while i < lines.len() {
        let line = lines[i];

        if let Some(rest) = line.strip_prefix("diff --git ") {
            push_section(&mut files, current.take());
            let (old, new) = parse_git_header_paths(rest);
            let mut file = FileDiff::new(old, new);
            file.raw.push(line.to_string());
            current = Some(file);
            git_header_open = true;
            i += 1;
            continue;
        }

        if line.starts_with("--- ") && lines.get(i + 1).is_some_and(|l| l.starts_with("+++ ")) {
            let old = parse_marker_path(&line[4..], "a/");
            let new = parse_marker_path(&lines[i + 1][4..], "b/");
            if git_header_open {
                if let Some(file) = current.as_mut() {
                    file.old_path = old;
                    file.new_path = new;
                    file.raw.push(line.to_string());
                    file.raw.push(lines[i + 1].to_string());
                }
            } else {
                push_section(&mut files, current.take());
                let mut file = FileDiff::new(old, new);
                file.raw.push(line.to_string());
                file.raw.push(lines[i + 1].to_string());
                current = Some(file);
            }
            git_header_open = false;
            i += 2;
            continue;
        }

        if line.starts_with("@@ ") {
            let Some(file) = current.as_mut() else {
                return Err(format!("Hunk without file header: {}", line));
            };
            git_header_open = false;
            let hunk = parse_hunk(&lines, &mut i, &mut file.raw)?;
            file.hunks.push(hunk);
            continue;
        }

        if git_header_open {
            if let Some(file) = current.as_mut() {
                if is_git_extended_header(line) {
                    file.raw.push(line.to_string());
                    if let Some(path) = line.strip_prefix("rename from ") {
                        file.old_path = Some(path.trim().to_string());
                    } else if let Some(path) = line.strip_prefix("rename to ") {
                        file.new_path = Some(path.trim().to_string());
                    } else if line.starts_with("new file mode") {
                        file.old_path = None;
                    } else if line.starts_with("deleted file mode") {
                        file.new_path = None;
                    } else if line.starts_with("Binary files ") || line == "GIT binary patch" {
                        file.binary = true;
                    }
                }
            }
        }
        i += 1;
    }
    push_section(&mut files, current.take());

    Ok(PatchSet { files })
}

fn push_section(files: &mut Vec<FileDiff>, section: Option<FileDiff>) {
    let Some(file) = section else {
        return;
    };
    let header_only_change = file.raw.iter().any(|l| {
        l.starts_with("rename ")
            || l.starts_with("new file mode")
            || l.starts_with("deleted file mode")
            || l.starts_with("old mode")
    });
    if !file.hunks.is_empty() || file.binary || header_only_change {
        files.push(file);
    }
}

fn is_git_extended_header(line: &str) -> bool {
    const PREFIXES: &[&str] = &[
        "index ",
        "new file mode",
        "deleted file mode",
        "old mode",
        "new mode",
        "similarity index",
        "dissimilarity index",
        "rename from ",
        "rename to ",
        "copy from ",
        "copy to ",
        "Binary files ",
        "GIT binary patch",
    ];
    PREFIXES.iter().any(|p| line.starts_with(p))
}

fn parse_git_header_paths(rest: &str) -> (Option<String>, Option<String>) {
    // `a/<path> b/<path>`; paths with spaces are split at the last " b/".
    let rest = rest.trim();
    if let Some(idx) = rest.rfind(" b/") {
        let old = parse_marker_path(&rest[..idx], "a/");
        let new = parse_marker_path(&rest[idx + 1..], "b/");
        (old, new)
    } else {
        (None, None)
    }
}

fn parse_marker_path(raw: &str, side_prefix: &str) -> Option<String> {
    let mut path = raw.trim_end();
    // Handle timestamp suffix
    if let Some(tab_pos) = path.find('\t') {
        path = &path[..tab_pos];
    }
    let path = path.trim().trim_matches('"');
    if path == "/dev/null" || path.is_empty() {
        return None;
    }
    let path = path.strip_prefix(side_prefix).unwrap_or(path);
    Some(path.to_string())
}

/// Parse a single hunk, consuming exactly the lines its header announces.
fn parse_hunk(lines: &[&str], idx: &mut usize, raw: &mut Vec<String>) -> Result<DiffHunk, String> {
    let header = lines[*idx];

    // Parse @@ -old_start,old_count +new_start,new_count @@
    let parts: Vec<&str> = header.split_whitespace().collect();
    if parts.len() < 3 || parts[0] != "@@" {
        return Err(format!("Invalid hunk header: {}", header));
    }

    let (old_start, old_count) = parse_range(parts[1].trim_start_matches('-'))?;
    let (new_start, new_count) = parse_range(parts[2].trim_start_matches('+'))?;
    raw.push(header.to_string());

    *idx += 1;
    let mut diff_lines = Vec::new();
    let mut old_left = old_count;
    let mut new_left = new_count;

    while *idx < lines.len() && (old_left > 0 || new_left > 0) {
        let line = lines[*idx];
        if let Some(rest) = line.strip_prefix('+') {
            if new_left == 0 {
                break;
            }
            diff_lines.push(DiffLine::Add(rest.to_string()));
            new_left -= 1;
        } else if let Some(rest) = line.strip_prefix('-') {
            if old_left == 0 {
                break;
            }
            diff_lines.push(DiffLine::Remove(rest.to_string()));
            old_left -= 1;
        } else if line.starts_with(' ') || line.is_empty() {
            if old_left == 0 || new_left == 0 {
                break;
            }
            let content = if line.is_empty() { "" } else { &line[1..] };
            diff_lines.push(DiffLine::Context(content.to_string()));
            old_left -= 1;
            new_left -= 1;
        } else if line.starts_with('\\') {
            // "\ No newline at end of file"
        } else {
            break;
        }
        raw.push(line.to_string());
        *idx += 1;
    }

    // A trailing "\ No newline" marker belongs to this hunk.
    if lines.get(*idx).is_some_and(|l| l.starts_with('\\')) {
        raw.push(lines[*idx].to_string());
        *idx += 1;
    }

    Ok(DiffHunk {
        old_start,
        old_count,
        new_start,
        new_count,
        lines: diff_lines,
    })
}

/// Parse a range like "10,5" or "10" into (start, count)
fn parse_range(s: &str) -> Result<(usize, usize), String> {
    if let Some(comma) = s.find(',') {
        let start: usize = s[..comma]
            .parse()
            .map_err(|_| format!("Invalid start: {}", s))?;
        let count: usize = s[comma + 1..]
            .parse()
            .map_err(|_| format!("Invalid count: {}", s))?;
        Ok((start, count))
    } else {
        let start: usize = s
            .parse()
            .map_err(|_| format!("Invalid line number: {}", s))?;
        Ok((start, 1))
    }
}

/// Pull diff text out of free-form generator output.
///
/// Fenced blocks (```diff, ```patch, or bare fences containing a hunk) win;
/// otherwise the whole response is scanned. Only file sections whose every
/// path satisfies `admit` survive. Unparseable output yields an empty string.
pub fn extract_diff<F>(raw_output: &str, admit: F) -> String
where
    F: Fn(&str) -> bool,
{
    let fenced = fenced_blocks(raw_output);
    let candidates: Vec<&str> = if fenced.is_empty() {
        vec![raw_output]
    } else {
        fenced
    };

    let mut out = String::new();
    for candidate in candidates {
        let Ok(patch) = parse_patch(candidate) else {
            continue;
        };
        out.push_str(&patch.filtered_text(|file| file.paths().into_iter().all(&admit)));
    }
    out
}

fn fenced_blocks(text: &str) -> Vec<&str> {
    let mut blocks = Vec::new();
    let mut rest = text;
    while let Some(open) = rest.find("```") {
        let after_open = &rest[open + 3..];
        let Some(newline) = after_open.find('\n') else {
            break;
        };
        let lang = after_open[..newline].trim().to_ascii_lowercase();
        let body_start = &after_open[newline + 1..];
        let Some(close) = find_closing_fence(body_start) else {
            break;
        };
        let body = &body_start[..close];
        let looks_like_diff = matches!(lang.as_str(), "diff" | "patch" | "udiff")
            || (lang.is_empty() && body.contains("\n@@ "));
        if looks_like_diff {
            blocks.push(body);
        }
        rest = &body_start[(close + 3).min(body_start.len())..];
    }
    blocks
}

/// Offset of a closing fence that starts a line.
fn find_closing_fence(body: &str) -> Option<usize> {
    if body.starts_with("```") {
        return Some(0);
    }
    body.find("\n```").map(|i| i + 1)
}
