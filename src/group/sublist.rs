//! Group subject list parsing and derivative filtering.

use super::error::GroupError;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Read subject-list entries, skipping blank lines and `#` comments.
pub fn parse_subject_list(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(String::from)
        .collect()
}

/// Check that entries are comma-joined exactly when repeated measures is on.
pub fn validate_format(entries: &[String], repeated_measures: bool) -> Result<(), GroupError> {
    for entry in entries {
        let has_comma = entry.contains(',');
        if repeated_measures && !has_comma {
            return Err(GroupError::ExpectedRepeatedMeasures {
                entry: entry.clone(),
            });
        }
        if !repeated_measures && has_comma {
            return Err(GroupError::UnexpectedRepeatedMeasures {
                entry: entry.clone(),
            });
        }
    }
    Ok(())
}

/// Identifiers an entry must match: the subject ID alone, or the subject
/// plus scan/session IDs of a repeated-measures group.
pub fn entry_ids(entry: &str) -> Vec<&str> {
    entry.split(',').map(str::trim).filter(|s| !s.is_empty()).collect()
}

/// Whether `id` occurs in `haystack` delimited by non-alphanumeric
/// characters (or the string edges).
pub fn contains_id(haystack: &str, id: &str) -> bool {
    if id.is_empty() {
        return false;
    }
    haystack.match_indices(id).any(|(start, _)| {
        let before = haystack[..start].chars().next_back();
        let after = haystack[start + id.len()..].chars().next();
        let open = |c: Option<char>| c.map_or(true, |c| !c.is_alphanumeric());
        open(before) && open(after)
    })
}

/// Whether a derivative path belongs to a subject-list entry.
pub fn path_matches(path: &Path, entry: &str) -> bool {
    let text = path.to_string_lossy();
    let ids = entry_ids(entry);
    !ids.is_empty() && ids.iter().all(|id| contains_id(&text, id))
}

/// Subject-list entries and the derivatives that survived filtering.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilteredSubjects {
    /// Entries with at least one derivative, in list order, each once.
    pub entries: Vec<String>,
    /// (entry, derivative path) pairs in list order.
    pub derivatives: Vec<(String, PathBuf)>,
}

impl FilteredSubjects {
    pub fn paths(&self) -> Vec<PathBuf> {
        self.derivatives.iter().map(|(_, p)| p.clone()).collect()
    }
}

/// Keep, for every entry in list order, the candidate paths that match it.
///
/// A path is assigned to the first entry it matches.
pub fn filter_derivatives(entries: &[String], candidates: &[PathBuf]) -> FilteredSubjects {
    let mut taken = vec![false; candidates.len()];
    let mut filtered = FilteredSubjects::default();

    for entry in entries {
        let mut found = false;
        for (i, path) in candidates.iter().enumerate() {
            if taken[i] || !path_matches(path, entry) {
                continue;
            }
            taken[i] = true;
            found = true;
            filtered.derivatives.push((entry.clone(), path.clone()));
        }

        if found {
            filtered.entries.push(entry.clone());
        } else {
            debug!("No derivative found for subject {}", entry);
        }
    }

    filtered
}

/// Write the filtered subject list, one entry per line.
pub fn write_subject_list(path: &Path, entries: &[String]) -> std::io::Result<()> {
    let mut content = entries.join("\n");
    if !content.is_empty() {
        content.push('\n');
    }
    std::fs::write(path, content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_strips_blank_and_comments() {
        let content = "# group list\n001\n\n002\r\n  \n#003\n004\n";
        assert_eq!(parse_subject_list(content), strings(&["001", "002", "004"]));
    }

    #[test]
    fn test_repeated_measures_requires_commas() {
        let entries = strings(&["sub001,rest_1", "sub002"]);
        let err = validate_format(&entries, true).unwrap_err();
        assert!(matches!(err, GroupError::ExpectedRepeatedMeasures { ref entry } if entry == "sub002"));
        assert!(err.to_string().contains("repeated measures"));
    }

    #[test]
    fn test_commas_without_repeated_measures() {
        let entries = strings(&["sub001", "sub002,rest_1"]);
        let err = validate_format(&entries, false).unwrap_err();
        assert!(matches!(err, GroupError::UnexpectedRepeatedMeasures { .. }));
    }

    #[test]
    fn test_valid_formats() {
        assert!(validate_format(&strings(&["a", "b"]), false).is_ok());
        assert!(validate_format(&strings(&["a,s1", "b,s1,r2"]), true).is_ok());
        assert!(validate_format(&[], true).is_ok());
    }

    #[test]
    fn test_contains_id_boundaries() {
        assert!(contains_id("/out/p/001/alff.nii.gz", "001"));
        assert!(contains_id("/out/p/sub001_session_1/alff", "sub001"));
        assert!(!contains_id("/out/p/0010/alff", "001"));
        assert!(!contains_id("/out/p/sub001/alff", "001"));
        assert!(contains_id("_scan_rest_1/", "rest_1"));
        assert!(!contains_id("anything", ""));
    }

    #[test]
    fn test_repeated_measures_matching() {
        let path = PathBuf::from("/out/p/sub001_session_1/alff/_scan_rest_1/alff.nii.gz");
        assert!(path_matches(&path, "sub001,session_1,rest_1"));
        assert!(path_matches(&path, "sub001,rest_1"));
        assert!(!path_matches(&path, "sub001,rest_2"));
    }

    #[test]
    fn test_filter_keeps_matched_subjects_in_order() {
        let entries = strings(&["003", "001", "002", "004"]);
        let candidates = vec![
            PathBuf::from("/out/p/001/alff/a.nii.gz"),
            PathBuf::from("/out/p/003/alff/a.nii.gz"),
            PathBuf::from("/out/p/005/alff/a.nii.gz"),
        ];

        let filtered = filter_derivatives(&entries, &candidates);
        assert_eq!(filtered.entries, strings(&["003", "001"]));
        assert_eq!(
            filtered.paths(),
            vec![candidates[1].clone(), candidates[0].clone()]
        );
    }

    #[test]
    fn test_filter_assigns_path_once() {
        let entries = strings(&["sub1", "sub1"]);
        let candidates = vec![PathBuf::from("/out/p/sub1/x.nii.gz")];
        let filtered = filter_derivatives(&entries, &candidates);
        assert_eq!(filtered.derivatives.len(), 1);
        assert_eq!(filtered.entries, strings(&["sub1"]));
    }

    #[test]
    fn test_write_subject_list() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("subjects.txt");
        write_subject_list(&path, &strings(&["001", "003"])).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "001\n003\n");
        assert_eq!(parse_subject_list(&content), strings(&["001", "003"]));
    }
}
