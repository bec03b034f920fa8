//! What a task analyzes.

use std::fmt;

use serde::{Deserialize, Serialize};

/// The analysis target of a task: a sample on disk or a URL to visit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "category", rename_all = "snake_case")]
pub enum Target {
    /// Local sample: /srv/samples/dropper.exe
    File { path: String },
    /// Remote page: http://example.com/landing
    Url { url: String },
}

impl Target {
    /// Classify a raw target string. Anything with an http(s) scheme is a
    /// URL; everything else is treated as a file path.
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if raw.starts_with("http://") || raw.starts_with("https://") {
            Target::Url { url: raw.to_string() }
        } else if let Some(path) = raw.strip_prefix("file://") {
            Target::File { path: path.to_string() }
        } else {
            Target::File { path: raw.to_string() }
        }
    }

    /// Category label used in listings ("file" or "url").
    pub fn category(&self) -> &'static str {
        match self {
            Target::File { .. } => "file",
            Target::Url { .. } => "url",
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::File { path } => f.write_str(path),
            Target::Url { url } => f.write_str(url),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_file_paths() {
        assert_eq!(
            Target::parse("/srv/samples/a.exe"),
            Target::File { path: "/srv/samples/a.exe".to_string() }
        );
        assert_eq!(
            Target::parse("file:///tmp/b.doc"),
            Target::File { path: "/tmp/b.doc".to_string() }
        );
        assert_eq!(Target::parse("relative.bin").category(), "file");
    }

    #[test]
    fn parse_urls() {
        let t = Target::parse("https://example.com/x");
        assert_eq!(t.category(), "url");
        assert_eq!(t.to_string(), "https://example.com/x");
    }
}
