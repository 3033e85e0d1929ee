use tiller_types::{DiffLine, DiffLineKind, FileDiff, Hunk};

/// Parses unified-diff text into per-file structures for review and
/// storage. Tolerant by contract: malformed or truncated input yields
/// whatever well-formed files and hunks could be recovered, never an
/// error. A file with zero hunks is valid (rename-only, or content
/// deliberately not persisted).
pub fn parse_diff(patch: &str) -> Vec<FileDiff> {
    let mut files: Vec<FileDiff> = Vec::new();
    let mut current: Option<FileDiff> = None;
    let mut hunk: Option<Hunk> = None;
    // Lines still owed per the open hunk's header; once both reach
    // zero the hunk is done and `---` reads as a header again.
    let (mut old_left, mut new_left) = (0u64, 0u64);

    for line in patch.lines() {
        if let Some(rest) = line.strip_prefix("diff --git ") {
            close_hunk(&mut current, &mut hunk);
            if let Some(file) = current.take() {
                files.push(file);
            }
            let (old_path, new_path) = parse_git_header_paths(rest);
            current = Some(FileDiff {
                old_path,
                new_path,
                is_new: false,
                is_deleted: false,
                hunks: Vec::new(),
            });
            continue;
        }

        // `---`/`+++` are file headers only outside a hunk; inside one,
        // a leading `-` or `+` always classifies as remove/add.
        if let Some(rest) = line.strip_prefix("--- ") {
            if hunk.is_none() {
                // A fresh `---` after recorded hunks starts the next file
                // in diffs that carry no `diff --git` separators.
                if let Some(file) = current.take_if(|f| !f.hunks.is_empty()) {
                    files.push(file);
                }
                let file = current.get_or_insert_with(empty_file);
                if rest.trim() == "/dev/null" {
                    file.is_new = true;
                } else {
                    file.old_path = strip_prefix_marker(rest.trim());
                }
                continue;
            }
        }
        if let Some(rest) = line.strip_prefix("+++ ") {
            if hunk.is_none() {
                let file = current.get_or_insert_with(empty_file);
                if rest.trim() == "/dev/null" {
                    file.is_deleted = true;
                } else {
                    file.new_path = strip_prefix_marker(rest.trim());
                }
                continue;
            }
        }

        if line.starts_with("@@") {
            close_hunk(&mut current, &mut hunk);
            match parse_hunk_header(line) {
                Some(parsed) => {
                    current.get_or_insert_with(empty_file);
                    old_left = parsed.old_count;
                    new_left = parsed.new_count;
                    hunk = Some(parsed);
                }
                // Malformed hunk header: skip it and keep scanning.
                None => continue,
            }
            continue;
        }

        if let Some(open) = hunk.as_mut() {
            let (kind, content) = match line.chars().next() {
                Some('+') => {
                    new_left = new_left.saturating_sub(1);
                    (DiffLineKind::Add, &line[1..])
                }
                Some('-') => {
                    old_left = old_left.saturating_sub(1);
                    (DiffLineKind::Remove, &line[1..])
                }
                Some(' ') => {
                    old_left = old_left.saturating_sub(1);
                    new_left = new_left.saturating_sub(1);
                    (DiffLineKind::Context, &line[1..])
                }
                // `\ No newline at end of file` and friends.
                Some('\\') => (DiffLineKind::Header, line),
                _ => {
                    // Anything else at a hunk boundary ends the hunk and
                    // reads as file-level header material.
                    close_hunk(&mut current, &mut hunk);
                    apply_file_header(current.get_or_insert_with(empty_file), line);
                    continue;
                }
            };
            open.lines.push(DiffLine {
                kind,
                content: content.to_string(),
            });
            if old_left == 0 && new_left == 0 {
                close_hunk(&mut current, &mut hunk);
            }
            continue;
        }

        if let Some(file) = current.as_mut() {
            apply_file_header(file, line);
        }
    }

    close_hunk(&mut current, &mut hunk);
    if let Some(file) = current.take() {
        files.push(file);
    }
    files
}

fn empty_file() -> FileDiff {
    FileDiff {
        old_path: String::new(),
        new_path: String::new(),
        is_new: false,
        is_deleted: false,
        hunks: Vec::new(),
    }
}

fn close_hunk(current: &mut Option<FileDiff>, hunk: &mut Option<Hunk>) {
    if let Some(done) = hunk.take() {
        current.get_or_insert_with(empty_file).hunks.push(done);
    }
}

fn apply_file_header(file: &mut FileDiff, line: &str) {
    if line.starts_with("new file mode") {
        file.is_new = true;
    } else if line.starts_with("deleted file mode") {
        file.is_deleted = true;
    } else if let Some(path) = line.strip_prefix("rename from ") {
        file.old_path = path.trim().to_string();
    } else if let Some(path) = line.strip_prefix("rename to ") {
        file.new_path = path.trim().to_string();
    }
}

/// `a/X b/Y` out of a `diff --git` line. Paths with spaces split on the
/// ` b/` boundary when present.
fn parse_git_header_paths(rest: &str) -> (String, String) {
    if let Some(idx) = rest.find(" b/") {
        let old = strip_prefix_marker(&rest[..idx]);
        let new = strip_prefix_marker(rest[idx + 1..].trim());
        return (old, new);
    }
    let mut parts = rest.split_whitespace();
    let old = parts.next().map(strip_prefix_marker).unwrap_or_default();
    let new = parts.next().map(strip_prefix_marker).unwrap_or_default();
    (old, new)
}

fn strip_prefix_marker(raw: &str) -> String {
    raw.strip_prefix("a/")
        .or_else(|| raw.strip_prefix("b/"))
        .unwrap_or(raw)
        .to_string()
}

/// `@@ -a,b +c,d @@` with counts defaulting to 1 when omitted.
fn parse_hunk_header(line: &str) -> Option<Hunk> {
    let inner = line.strip_prefix("@@")?;
    let end = inner.find("@@")?;
    let body = inner[..end].trim();
    let mut old = None;
    let mut new = None;
    for token in body.split_whitespace() {
        if let Some(range) = token.strip_prefix('-') {
            old = parse_range(range);
        } else if let Some(range) = token.strip_prefix('+') {
            new = parse_range(range);
        }
    }
    let (old_start, old_count) = old?;
    let (new_start, new_count) = new?;
    Some(Hunk {
        old_start,
        old_count,
        new_start,
        new_count,
        lines: Vec::new(),
    })
}

fn parse_range(range: &str) -> Option<(u64, u64)> {
    match range.split_once(',') {
        Some((start, count)) => Some((start.parse().ok()?, count.parse().ok()?)),
        None => Some((range.parse().ok()?, 1)),
    }
}
