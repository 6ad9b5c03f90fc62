//! Saved-query files: `-- Title` on line 1, `-- a@x b@y` on line 2, query text after.

use std::path::Path;

use anyhow::{Context, Result};
use evwatch_core::SavedQuery;
use tokio::fs;
use tracing::warn;

/// Parses one saved-query file. Returns `None` when the file is not a usable query.
pub fn parse_saved_query(text: &str) -> Option<SavedQuery> {
    let lines: Vec<&str> = text.lines().collect();
    if lines.len() < 3 {
        return None;
    }
    let title = lines[0].trim().trim_start_matches('-').trim().to_string();
    let recipients = lines[1]
        .trim()
        .trim_start_matches('-')
        .split_whitespace()
        .map(str::to_string)
        .collect();
    let query_text = lines[2..].join("\n").trim().to_string();

    if title.is_empty() || query_text.is_empty() {
        return None;
    }
    Some(SavedQuery {
        title,
        query_text,
        recipients,
    })
}

/// Loads every `*.sql` file in `dir`, sorted by file name. Unusable files are skipped with a warning.
pub async fn load_saved_queries(dir: &Path) -> Result<Vec<SavedQuery>> {
    let mut entries = fs::read_dir(dir)
        .await
        .with_context(|| format!("reading {}", dir.display()))?;
    let mut paths = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "sql") {
            paths.push(path);
        }
    }
    paths.sort();

    let mut queries: Vec<SavedQuery> = Vec::new();
    for path in paths {
        let text = fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        match parse_saved_query(&text) {
            Some(query) if queries.iter().any(|q| q.has_title(&query.title)) => {
                warn!(path = %path.display(), title = %query.title, "duplicate saved query title; skipping");
            }
            Some(query) => queries.push(query),
            None => warn!(path = %path.display(), "not a saved query file; skipping"),
        }
    }
    Ok(queries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn parses_title_recipients_and_query() {
        let query = parse_saved_query(
            "-- Oslo courses\n-- ops@example.org  Kari@example.no\nSELECT * FROM items\nWHERE location = 'Oslo'\n",
        )
        .unwrap();
        assert_eq!(query.title, "Oslo courses");
        assert_eq!(query.recipients, vec!["ops@example.org", "Kari@example.no"]);
        assert_eq!(query.query_text, "SELECT * FROM items\nWHERE location = 'Oslo'");
    }

    #[test]
    fn bare_marker_means_no_recipients() {
        let query = parse_saved_query("-- Quiet\n--\nSELECT * FROM items").unwrap();
        assert!(query.recipients.is_empty());
    }

    #[test]
    fn short_or_malformed_files_are_rejected() {
        assert!(parse_saved_query("-- Title\n-- a@x").is_none());
        assert!(parse_saved_query("--   \n-- a@x\nSELECT 1").is_none());
        assert!(parse_saved_query("-- Title\n-- a@x\n   \n").is_none());
    }

    #[test]
    fn dashes_are_optional_and_blank_recipient_line_is_empty() {
        let query = parse_saved_query("Weekend hikes\n\nSELECT * FROM items").unwrap();
        assert_eq!(query.title, "Weekend hikes");
        assert!(query.recipients.is_empty());
    }

    #[tokio::test]
    async fn loads_sql_files_in_name_order() {
        let dir = tempdir().unwrap();
        tokio::fs::write(dir.path().join("b.sql"), "-- Second\n--\nSELECT * FROM items").await.unwrap();
        tokio::fs::write(dir.path().join("a.sql"), "-- First\n-- x@y\nSELECT * FROM items").await.unwrap();
        tokio::fs::write(dir.path().join("c.sql"), "-- first\n--\nSELECT * FROM items").await.unwrap();
        tokio::fs::write(dir.path().join("notes.txt"), "ignored").await.unwrap();
        tokio::fs::write(dir.path().join("broken.sql"), "nothing here").await.unwrap();

        let queries = load_saved_queries(dir.path()).await.unwrap();
        let titles: Vec<_> = queries.iter().map(|q| q.title.as_str()).collect();
        assert_eq!(titles, vec!["First", "Second"]);
    }
}
