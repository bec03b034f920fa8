//! Tag sets shared by tasks, experiments, and machines.

use std::collections::BTreeSet;

/// Marks machines and tasks reserved for recurring experiments.
pub const LONGTERM_TAG: &str = "longterm";

/// Ordered set of tags.
pub type TagSet = BTreeSet<String>;

/// Parse a comma-separated tag list. Items are trimmed; empty items are dropped.
pub fn parse_tags(input: &str) -> TagSet {
    input
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// Render a tag set back into its comma-separated form.
pub fn join_tags(tags: &TagSet) -> String {
    tags.iter().map(String::as_str).collect::<Vec<_>>().join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_drops_empty_items() {
        let tags = parse_tags("longterm, ,win7,,x64 ");
        assert_eq!(join_tags(&tags), "longterm,win7,x64");
        assert!(parse_tags("").is_empty());
    }

    #[test]
    fn duplicates_collapse() {
        let tags = parse_tags("longterm,longterm");
        assert_eq!(tags.len(), 1);
        assert!(tags.contains(LONGTERM_TAG));
    }
}
