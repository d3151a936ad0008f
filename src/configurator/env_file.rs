use std::collections::{BTreeMap, BTreeSet};

/// Outcome of reconciling managed keys against a file's current content.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct EnvFileUpdate {
    pub changed: bool,
    pub content: String,
}

/// Rewrites only the keys the platform owns in an env file. `managed` holds
/// the desired values; `owned` is the full key universe the platform may
/// ever write for this app, so keys that dropped out of the desired set are
/// removed rather than orphaned. Lines for other keys, comments, and blank
/// lines are preserved byte-for-byte in place; managed keys keep their
/// original position, and missing ones are appended in sorted order.
/// `changed` is true iff an owned key was added, removed, or its value
/// differs, which makes this the restart decision for the app.
pub fn reconcile(
    current: Option<&str>,
    managed: &BTreeMap<String, String>,
    owned: &BTreeSet<String>,
) -> EnvFileUpdate {
    let mut remaining = managed.clone();
    let mut lines = Vec::new();
    let mut changed = false;

    for line in current.unwrap_or_default().lines() {
        match parse_key(line) {
            Some(key) if managed.contains_key(key) => {
                let key = key.to_string();
                if let Some(value) = remaining.remove(&key) {
                    let desired = format!("{key}={value}");
                    if line != desired {
                        changed = true;
                    }
                    lines.push(desired);
                } else {
                    // duplicate managed line; drop it
                    changed = true;
                }
            }
            Some(key) if owned.contains(key) => {
                // owned but no longer desired; remove
                changed = true;
            }
            _ => lines.push(line.to_string()),
        }
    }

    for (key, value) in remaining {
        lines.push(format!("{key}={value}"));
        changed = true;
    }

    let mut content = lines.join("\n");
    if !content.is_empty() {
        content.push('\n');
    }

    if !changed {
        if let Some(current) = current {
            // normalization (e.g. a missing trailing newline) alone must not
            // count as a change
            if current != content {
                content = current.to_string();
            }
        }
    }

    EnvFileUpdate { changed, content }
}

fn parse_key(line: &str) -> Option<&str> {
    let trimmed = line.trim_start();
    if trimmed.starts_with('#') {
        return None;
    }
    let (key, _) = trimmed.split_once('=')?;
    let key = key.trim();
    if key.is_empty() {
        None
    } else {
        Some(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn managed(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
        entries
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect()
    }

    fn owned(keys: &[&str]) -> BTreeSet<String> {
        keys.iter().map(|key| key.to_string()).collect()
    }

    #[test]
    fn creates_content_from_scratch() {
        let update = reconcile(None, &managed(&[("B", "2"), ("A", "1")]), &owned(&["A", "B"]));
        assert!(update.changed);
        assert_eq!(update.content, "A=1\nB=2\n");
    }

    #[test]
    fn is_idempotent() {
        let keys = managed(&[("A", "1"), ("B", "2")]);
        let universe = owned(&["A", "B"]);
        let first = reconcile(None, &keys, &universe);
        let second = reconcile(Some(&first.content), &keys, &universe);

        assert!(!second.changed);
        assert_eq!(second.content, first.content);
    }

    #[test]
    fn preserves_user_keys_and_comments() {
        let current = "# hand-tuned\nCUSTOM=keep me\nA=old\n";
        let update = reconcile(Some(current), &managed(&[("A", "new")]), &owned(&["A"]));

        assert!(update.changed);
        assert_eq!(update.content, "# hand-tuned\nCUSTOM=keep me\nA=new\n");
    }

    #[test]
    fn user_edits_to_other_keys_are_not_a_change() {
        let current = "CUSTOM=whatever the user wants\nA=1\n";
        let update = reconcile(Some(current), &managed(&[("A", "1")]), &owned(&["A"]));

        assert!(!update.changed);
        assert_eq!(update.content, current);
    }

    #[test]
    fn appends_missing_managed_keys() {
        let current = "CUSTOM=x\n";
        let update = reconcile(Some(current), &managed(&[("A", "1")]), &owned(&["A"]));

        assert!(update.changed);
        assert_eq!(update.content, "CUSTOM=x\nA=1\n");
    }

    #[test]
    fn removes_owned_keys_that_are_no_longer_desired() {
        let current = "OIDC_CLIENT_ID=abc\nCUSTOM=x\n";
        let update = reconcile(Some(current), &managed(&[]), &owned(&["OIDC_CLIENT_ID"]));

        assert!(update.changed);
        assert_eq!(update.content, "CUSTOM=x\n");
    }

    #[test]
    fn collapses_duplicate_managed_lines() {
        let current = "A=1\nA=1\n";
        let update = reconcile(Some(current), &managed(&[("A", "1")]), &owned(&["A"]));

        assert!(update.changed);
        assert_eq!(update.content, "A=1\n");
    }
}
