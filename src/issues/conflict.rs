// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Advisory file-path conflict detection between issues.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeSet;

use super::types::Issue;

static URL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[A-Za-z][A-Za-z0-9+.\-]*://\S+").expect("valid regex"));

static PATH_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:\.{1,2}/)?(?:[A-Za-z0-9_@\-][A-Za-z0-9_@.\-]*/)+[A-Za-z0-9_@.\-]*")
        .expect("valid regex")
});

/// Two issues that touch overlapping paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conflict {
    pub issue_id: u32,
    /// The shorter of the two overlapping tokens.
    pub shared: String,
}

/// Path-shaped substrings of free text, each reduced to a directory.
///
/// Tokens whose last component has an extension are treated as files and
/// replaced by their parent; other tokens are taken as directories.
pub fn extract_paths(text: &str) -> BTreeSet<String> {
    let without_urls = URL_RE.replace_all(text, " ");
    PATH_RE
        .find_iter(&without_urls)
        .filter_map(|m| normalize(m.as_str()))
        .collect()
}

fn normalize(raw: &str) -> Option<String> {
    let trimmed = raw.trim_end_matches(['.', ',', ':', ';']);
    let trimmed = trimmed.trim_start_matches("./").trim_end_matches('/');

    let (parent, last) = match trimmed.rsplit_once('/') {
        Some((parent, last)) => (parent, last),
        None => ("", trimmed),
    };
    let dir = if last.contains('.') && !last.starts_with('.') {
        parent
    } else {
        trimmed
    };
    if dir.is_empty() || dir == "." || dir == ".." {
        None
    } else {
        Some(dir.to_string())
    }
}

/// Every path token of an issue: extracted directories plus declared specs.
pub fn path_tokens(issue: &Issue) -> BTreeSet<String> {
    let mut tokens = extract_paths(&issue.description);
    for criterion in &issue.acceptance_criteria {
        tokens.extend(extract_paths(criterion));
    }
    tokens.extend(
        issue
            .specs
            .iter()
            .map(|s| s.trim_start_matches("./").trim_end_matches('/').to_string())
            .filter(|s| !s.is_empty()),
    );
    tokens
}

/// Whether `prefix` equals `path` or is one of its leading components.
pub fn is_path_prefix(prefix: &str, path: &str) -> bool {
    match path.strip_prefix(prefix) {
        Some("") => true,
        Some(rest) => rest.starts_with('/'),
        None => false,
    }
}

fn overlap(a: &BTreeSet<String>, b: &BTreeSet<String>) -> Option<String> {
    for x in a {
        for y in b {
            if is_path_prefix(x, y) {
                return Some(x.clone());
            }
            if is_path_prefix(y, x) {
                return Some(y.clone());
            }
        }
    }
    None
}

/// Issues among `others` whose path tokens overlap with `issue`'s.
pub fn find_conflicts<'a>(issue: &Issue, others: impl IntoIterator<Item = &'a Issue>) -> Vec<Conflict> {
    let mine = path_tokens(issue);
    if mine.is_empty() {
        return Vec::new();
    }
    others
        .into_iter()
        .filter(|other| other.id != issue.id)
        .filter_map(|other| {
            overlap(&mine, &path_tokens(other)).map(|shared| Conflict {
                issue_id: other.id,
                shared,
            })
        })
        .collect()
}

/// Human-readable warning, or `None` without conflicts.
pub fn conflict_warning(issue_id: u32, conflicts: &[Conflict]) -> Option<String> {
    if conflicts.is_empty() {
        return None;
    }
    let parts: Vec<String> = conflicts
        .iter()
        .map(|c| format!("#{} (shared path {})", c.issue_id, c.shared))
        .collect();
    Some(format!(
        "Warning: issue #{} may conflict with running {}",
        issue_id,
        parts.join(", ")
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::issues::types::{IssueStatus, Priority};
    use chrono::Utc;

    fn issue(id: u32, description: &str, specs: &[&str]) -> Issue {
        Issue {
            id,
            title: format!("Issue {}", id),
            slug: format!("issue-{}", id),
            status: IssueStatus::Open,
            priority: Priority::Medium,
            specs: specs.iter().map(|s| s.to_string()).collect(),
            description: description.to_string(),
            acceptance_criteria: Vec::new(),
            agent_log: Vec::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_extract_paths_uses_containing_directory() {
        let paths = extract_paths("Update src/auth/login.ts and docs/guide/ then ./lib/util.rs.");
        let paths: Vec<_> = paths.into_iter().collect();
        assert_eq!(paths, vec!["docs/guide", "lib", "src/auth"]);
    }

    #[test]
    fn test_extract_paths_ignores_urls_and_bare_files() {
        let paths = extract_paths("See https://example.com/a/b.html and README.md");
        assert!(paths.is_empty());
    }

    #[test]
    fn test_shared_directory_conflict() {
        let one = issue(1, "Fix redirect in src/auth/login.ts", &[]);
        let two = issue(2, "Rotate tokens in src/auth/session.ts", &[]);

        let conflicts = find_conflicts(&one, [&two]);
        assert_eq!(
            conflicts,
            vec![Conflict {
                issue_id: 2,
                shared: "src/auth".to_string()
            }]
        );
        let warning = conflict_warning(1, &conflicts).unwrap();
        assert!(warning.contains("#2"));
        assert!(warning.contains("src/auth"));
    }

    #[test]
    fn test_prefix_is_component_aware() {
        assert!(is_path_prefix("src", "src/auth"));
        assert!(is_path_prefix("src/auth", "src/auth"));
        assert!(!is_path_prefix("src/a", "src/auth"));

        let one = issue(1, "Touch src/a/x.rs", &[]);
        let two = issue(2, "Touch src/auth/y.rs", &[]);
        assert!(find_conflicts(&one, [&two]).is_empty());
    }

    #[test]
    fn test_nested_directory_conflicts_with_parent() {
        let one = issue(1, "Refactor src/", &[]);
        let two = issue(2, "Change src/auth/login.ts", &[]);
        assert_eq!(find_conflicts(&one, [&two])[0].shared, "src");
    }

    #[test]
    fn test_spec_paths_participate() {
        let mut one = issue(1, "No paths here", &["specs/auth.md"]);
        one.acceptance_criteria.push("Nothing".to_string());
        let two = issue(2, "Read specs/auth.md first", &[]);
        // Issue 2's token is the directory `specs`, a prefix of the spec path.
        assert_eq!(find_conflicts(&one, [&two])[0].shared, "specs");
    }

    #[test]
    fn test_self_and_disjoint_ignored() {
        let one = issue(1, "src/auth/login.ts", &[]);
        let other = issue(3, "web/ui/button.tsx", &[]);
        assert!(find_conflicts(&one, [&one, &other]).is_empty());
        assert!(conflict_warning(1, &[]).is_none());
    }
}
