// sync/diff.rs - Line diff model for the manual-merge editor
//
// Decomposes the local and remote text of a conflict into rows a merge UI
// can render side by side. The full row list is always returned; truncation
// is the consumer's concern.

use serde::{Deserialize, Serialize};

/// Classification of one diff row.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DiffRowKind {
    Same,
    LocalOnly,
    RemoteOnly,
    Changed,
}

/// One row of the side-by-side diff. Line numbers are 1-based and absent on
/// the side that has no line.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiffRow {
    pub kind: DiffRowKind,
    pub local_line: Option<usize>,
    pub remote_line: Option<usize>,
    pub local_text: Option<String>,
    pub remote_text: Option<String>,
}

/// Diff two text bodies line-wise.
///
/// A deleted run paired with an inserted run at the same position collapses
/// into `changed` rows; leftovers stay `local_only` / `remote_only`.
pub fn diff_lines(local_text: &str, remote_text: &str) -> Vec<DiffRow> {
    let local: Vec<&str> = split_lines(local_text);
    let remote: Vec<&str> = split_lines(remote_text);

    // Longest-common-subsequence table; notes are small enough that the
    // quadratic table is fine.
    let rows = local.len();
    let cols = remote.len();
    let mut lcs = vec![vec![0usize; cols + 1]; rows + 1];
    for i in (0..rows).rev() {
        for j in (0..cols).rev() {
            lcs[i][j] = if local[i] == remote[j] {
                lcs[i + 1][j + 1] + 1
            } else {
                lcs[i + 1][j].max(lcs[i][j + 1])
            };
        }
    }

    let mut out = Vec::new();
    let mut pending_local: Vec<(usize, &str)> = Vec::new();
    let mut pending_remote: Vec<(usize, &str)> = Vec::new();
    let (mut i, mut j) = (0usize, 0usize);

    let flush = |out: &mut Vec<DiffRow>,
                 pending_local: &mut Vec<(usize, &str)>,
                 pending_remote: &mut Vec<(usize, &str)>| {
        let pairs = pending_local.len().min(pending_remote.len());
        for k in 0..pairs {
            let (local_line, local_text) = pending_local[k];
            let (remote_line, remote_text) = pending_remote[k];
            out.push(DiffRow {
                kind: DiffRowKind::Changed,
                local_line: Some(local_line + 1),
                remote_line: Some(remote_line + 1),
                local_text: Some(local_text.to_string()),
                remote_text: Some(remote_text.to_string()),
            });
        }
        for &(line, text) in &pending_local[pairs..] {
            out.push(DiffRow {
                kind: DiffRowKind::LocalOnly,
                local_line: Some(line + 1),
                remote_line: None,
                local_text: Some(text.to_string()),
                remote_text: None,
            });
        }
        for &(line, text) in &pending_remote[pairs..] {
            out.push(DiffRow {
                kind: DiffRowKind::RemoteOnly,
                local_line: None,
                remote_line: Some(line + 1),
                local_text: None,
                remote_text: Some(text.to_string()),
            });
        }
        pending_local.clear();
        pending_remote.clear();
    };

    while i < rows && j < cols {
        if local[i] == remote[j] {
            flush(&mut out, &mut pending_local, &mut pending_remote);
            out.push(DiffRow {
                kind: DiffRowKind::Same,
                local_line: Some(i + 1),
                remote_line: Some(j + 1),
                local_text: Some(local[i].to_string()),
                remote_text: Some(remote[j].to_string()),
            });
            i += 1;
            j += 1;
        } else if lcs[i + 1][j] >= lcs[i][j + 1] {
            pending_local.push((i, local[i]));
            i += 1;
        } else {
            pending_remote.push((j, remote[j]));
            j += 1;
        }
    }
    while i < rows {
        pending_local.push((i, local[i]));
        i += 1;
    }
    while j < cols {
        pending_remote.push((j, remote[j]));
        j += 1;
    }
    flush(&mut out, &mut pending_local, &mut pending_remote);

    out
}

fn split_lines(text: &str) -> Vec<&str> {
    if text.is_empty() {
        Vec::new()
    } else {
        text.lines().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identical_texts_are_all_same() {
        let rows = diff_lines("a\nb\nc", "a\nb\nc");
        assert_eq!(rows.len(), 3);
        assert!(rows.iter().all(|r| r.kind == DiffRowKind::Same));
        assert_eq!(rows[2].local_line, Some(3));
        assert_eq!(rows[2].remote_line, Some(3));
    }

    #[test]
    fn test_changed_line_pairs_up() {
        let rows = diff_lines("intro\nold middle\noutro", "intro\nnew middle\noutro");
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].kind, DiffRowKind::Same);
        assert_eq!(rows[1].kind, DiffRowKind::Changed);
        assert_eq!(rows[1].local_text.as_deref(), Some("old middle"));
        assert_eq!(rows[1].remote_text.as_deref(), Some("new middle"));
        assert_eq!(rows[2].kind, DiffRowKind::Same);
    }

    #[test]
    fn test_insertions_and_deletions() {
        let rows = diff_lines("a\nb", "a\nb\nc\nd");
        let remote_only: Vec<&DiffRow> = rows
            .iter()
            .filter(|r| r.kind == DiffRowKind::RemoteOnly)
            .collect();
        assert_eq!(remote_only.len(), 2);
        assert_eq!(remote_only[0].remote_text.as_deref(), Some("c"));
        assert_eq!(remote_only[0].local_line, None);

        let rows = diff_lines("a\nb\nc", "c");
        let local_only = rows
            .iter()
            .filter(|r| r.kind == DiffRowKind::LocalOnly)
            .count();
        assert_eq!(local_only, 2);
    }

    #[test]
    fn test_empty_sides() {
        assert!(diff_lines("", "").is_empty());

        let rows = diff_lines("", "x\ny");
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.kind == DiffRowKind::RemoteOnly));

        let rows = diff_lines("x", "");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].kind, DiffRowKind::LocalOnly);
    }

    #[test]
    fn test_uneven_change_run_mixes_changed_and_only() {
        let rows = diff_lines("a\nx\ny\nb", "a\nz\nb");
        let kinds: Vec<DiffRowKind> = rows.iter().map(|r| r.kind).collect();
        assert_eq!(
            kinds,
            vec![
                DiffRowKind::Same,
                DiffRowKind::Changed,
                DiffRowKind::LocalOnly,
                DiffRowKind::Same
            ]
        );
    }
}
