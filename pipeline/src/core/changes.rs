//! Change-set merge rules.
//!
//! The change set holds at most one record per file. Every writer goes through
//! [`upsert_change`]: an existing record is replaced in place (keeping its
//! position), a new file is appended.

use std::path::Path;

use crate::core::types::ChangeRecord;

/// What an upsert did to the change set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Inserted,
    Replaced,
    Unchanged,
}

/// Counts for a batch of upserts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertSummary {
    pub inserted: usize,
    pub replaced: usize,
    pub unchanged: usize,
}

/// Canonical key for a change record path: relative to `workspace` when it
/// lies inside it, no leading `./`, forward slashes.
pub fn file_key(file: &str, workspace: &Path) -> String {
    let normalized = file.trim().replace('\\', "/");
    let root = workspace.to_string_lossy().replace('\\', "/");
    let root = root.trim_end_matches('/');
    let mut key = match normalized.strip_prefix(root) {
        Some(rest) if !root.is_empty() && rest.starts_with('/') => rest.trim_start_matches('/'),
        _ => normalized.as_str(),
    };
    while let Some(rest) = key.strip_prefix("./") {
        key = rest;
    }
    key.to_string()
}

pub fn upsert_change(
    changes: &mut Vec<ChangeRecord>,
    mut change: ChangeRecord,
    workspace: &Path,
) -> Upsert {
    change.file = file_key(&change.file, workspace);
    match changes.iter_mut().find(|c| c.file == change.file) {
        Some(existing) if *existing == change => Upsert::Unchanged,
        Some(existing) => {
            *existing = change;
            Upsert::Replaced
        }
        None => {
            changes.push(change);
            Upsert::Inserted
        }
    }
}

pub fn upsert_changes<I>(
    changes: &mut Vec<ChangeRecord>,
    incoming: I,
    workspace: &Path,
) -> UpsertSummary
where
    I: IntoIterator<Item = ChangeRecord>,
{
    let mut summary = UpsertSummary::default();
    for change in incoming {
        match upsert_change(changes, change, workspace) {
            Upsert::Inserted => summary.inserted += 1,
            Upsert::Replaced => summary.replaced += 1,
            Upsert::Unchanged => summary.unchanged += 1,
        }
    }
    summary
}

/// Files in the change set, in change-set order.
pub fn touched_files(changes: &[ChangeRecord]) -> Vec<String> {
    changes.iter().map(|c| c.file.clone()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::ChangeAction;

    const WS: &str = "/abs/ws";

    fn change(file: &str, action: ChangeAction, summary: &str) -> ChangeRecord {
        ChangeRecord {
            file: file.to_string(),
            action,
            summary: summary.to_string(),
        }
    }

    #[test]
    fn replaces_in_place_and_appends_new_files() {
        let mut changes = vec![
            change("a.rs", ChangeAction::Modified, "a"),
            change("b.rs", ChangeAction::Created, "b"),
        ];

        let summary = upsert_changes(
            &mut changes,
            vec![
                change("a.rs", ChangeAction::Modified, "a + fix"),
                change("c.rs", ChangeAction::Created, "c"),
            ],
            Path::new(WS),
        );

        assert_eq!(
            summary,
            UpsertSummary {
                inserted: 1,
                replaced: 1,
                unchanged: 0
            }
        );
        let files: Vec<&str> = changes.iter().map(|c| c.file.as_str()).collect();
        assert_eq!(files, vec!["a.rs", "b.rs", "c.rs"]);
        assert_eq!(changes[0].summary, "a + fix");
    }

    #[test]
    fn applying_the_same_batch_twice_is_idempotent() {
        let batch = vec![
            change("x.ts", ChangeAction::Modified, "validation"),
            change("y.ts", ChangeAction::Deleted, "gone"),
        ];
        let mut once = Vec::new();
        upsert_changes(&mut once, batch.clone(), Path::new(WS));
        let mut twice = once.clone();
        let second = upsert_changes(&mut twice, batch, Path::new(WS));

        assert_eq!(once, twice);
        assert_eq!(second.unchanged, 2);
    }

    #[test]
    fn duplicates_inside_one_batch_collapse_to_last_write() {
        let mut changes = Vec::new();
        upsert_changes(
            &mut changes,
            vec![
                change("x.ts", ChangeAction::Created, "first"),
                change("./x.ts", ChangeAction::Modified, "second"),
            ],
            Path::new(WS),
        );
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].summary, "second");
        assert_eq!(changes[0].action, ChangeAction::Modified);
    }

    #[test]
    fn any_sequence_keeps_one_record_per_file() {
        let files = ["a", "b", "./a", "c", "/abs/ws/b", "a", "./c"];
        let mut changes = Vec::new();
        for (i, file) in files.iter().enumerate() {
            upsert_change(
                &mut changes,
                change(file, ChangeAction::Modified, &i.to_string()),
                Path::new(WS),
            );
            let mut keys: Vec<&str> = changes.iter().map(|c| c.file.as_str()).collect();
            let before = keys.len();
            keys.sort_unstable();
            keys.dedup();
            assert_eq!(keys.len(), before, "duplicate after step {i}");
        }
        assert_eq!(touched_files(&changes), vec!["a", "b", "c"]);
    }

    #[test]
    fn file_key_normalizes_separators_and_dot_prefix() {
        let ws = Path::new(WS);
        assert_eq!(file_key(" ././src\\lib.rs ", ws), "src/lib.rs");
        assert_eq!(file_key("src/lib.rs", ws), "src/lib.rs");
    }

    /// Verifies absolute paths inside the workspace key the same as relative ones.
    #[test]
    fn file_key_strips_workspace_prefix() {
        assert_eq!(file_key("/abs/ws/x.ts", Path::new(WS)), "x.ts");
        assert_eq!(file_key("/abs/ws/src/x.ts", Path::new("/abs/ws/")), "src/x.ts");
        assert_eq!(file_key("/abs/wsx/x.ts", Path::new(WS)), "/abs/wsx/x.ts");
        assert_eq!(file_key("/elsewhere/x.ts", Path::new(WS)), "/elsewhere/x.ts");
    }

    #[test]
    fn absolute_report_replaces_relative_record() {
        let mut changes = vec![change("x.ts", ChangeAction::Modified, "added validation")];
        let summary = upsert_changes(
            &mut changes,
            vec![change("/abs/ws/x.ts", ChangeAction::Modified, "null check")],
            Path::new(WS),
        );
        assert_eq!(summary.replaced, 1);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].file, "x.ts");
        assert_eq!(changes[0].summary, "null check");
    }
}
