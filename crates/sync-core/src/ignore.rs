//! Ignore rules for temporary, editor and system files.
//!
//! A path is ignored when any of its components starts or ends with one of
//! the patterns. The `.sync` state directory is always ignored.

/// Directory holding sync state inside the synced root
pub const SYNC_DIR: &str = ".sync";

/// Patterns ignored unless the caller replaces them.
pub const DEFAULT_PATTERNS: &[&str] = &[
    ".goutputstream-",
    "~",
    ".swp",
    ".tmp",
    ".part",
    ".DS_Store",
    ".git",
    ".gitignore",
    ".env",
    ".venv",
    ".idea",
    ".vscode",
    ".svn",
    ".cache",
    ".local",
    ".npm",
    ".yarn",
    "Thumbs.db",
    "desktop.ini",
];

#[derive(Debug, Clone)]
pub struct IgnoreRules {
    patterns: Vec<String>,
}

impl IgnoreRules {
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            patterns: patterns
                .into_iter()
                .map(Into::into)
                .filter(|p: &String| !p.is_empty())
                .collect(),
        }
    }

    /// Default patterns plus `extra`.
    pub fn with_extra<I, S>(extra: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut rules = Self::default();
        rules
            .patterns
            .extend(extra.into_iter().map(Into::into).filter(|p: &String| !p.is_empty()));
        rules
    }

    pub fn is_ignored(&self, path: &str) -> bool {
        path.split('/').filter(|c| !c.is_empty()).any(|component| {
            component == SYNC_DIR
                || self
                    .patterns
                    .iter()
                    .any(|p| component.starts_with(p.as_str()) || component.ends_with(p.as_str()))
        })
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }
}

impl Default for IgnoreRules {
    fn default() -> Self {
        Self::new(DEFAULT_PATTERNS.iter().copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_rules() {
        let rules = IgnoreRules::default();
        assert!(rules.is_ignored("notes.txt.swp"));
        assert!(rules.is_ignored("draft~"));
        assert!(rules.is_ignored(".goutputstream-ABC123"));
        assert!(rules.is_ignored("photos/.DS_Store"));
        assert!(rules.is_ignored(".git/objects/ab"));
        assert!(rules.is_ignored(".sync/state.json"));
        assert!(!rules.is_ignored("notes.txt"));
        assert!(!rules.is_ignored("docs/report.pdf"));
    }

    #[test]
    fn test_extra_patterns() {
        let rules = IgnoreRules::with_extra(["node_modules", ".log"]);
        assert!(rules.is_ignored("web/node_modules/x.js"));
        assert!(rules.is_ignored("server.log"));
        assert!(rules.is_ignored("a.tmp"));
    }

    #[test]
    fn test_sync_dir_ignored_with_empty_rules() {
        let rules = IgnoreRules::new(Vec::<String>::new());
        assert!(rules.is_ignored(".sync/state.json"));
        assert!(!rules.is_ignored("a.tmp"));
    }
}
