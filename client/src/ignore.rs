//! `.syncignore` parsing: one gitignore-style pattern per line (§4.8/§6.3).
//! Blank lines and `#`-prefixed comments are ignored. A trailing `/`
//! restricts a pattern to directories; `**` matches any depth; otherwise
//! a pattern is matched against both the path relative to the sync root
//! and the entry's basename.

use std::path::Path;

const DEFAULT_PATTERNS: &[&str] = &[
    ".git/**",
    ".DS_Store",
    "Thumbs.db",
    "*.tmp",
    "*.swp",
    ".syncagent/**",
];

#[derive(Debug, Clone)]
struct Pattern {
    glob: String,
    dir_only: bool,
}

#[derive(Debug, Clone, Default)]
pub struct IgnoreRules {
    patterns: Vec<Pattern>,
}

impl IgnoreRules {
    pub fn load(sync_root: &Path) -> Self {
        let mut rules = IgnoreRules::default();
        for p in DEFAULT_PATTERNS {
            rules.push(p);
        }

        let ignore_file = sync_root.join(".syncignore");
        if let Ok(content) = std::fs::read_to_string(&ignore_file) {
            for line in content.lines() {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                rules.push(line);
            }
        }
        rules
    }

    fn push(&mut self, raw: &str) {
        let dir_only = raw.ends_with('/');
        let glob = raw.trim_end_matches('/').to_string();
        self.patterns.push(Pattern { glob, dir_only });
    }

    /// `relative_path` uses forward slashes and is relative to the sync
    /// root; `is_dir` is used to honor directory-only patterns.
    pub fn is_ignored(&self, relative_path: &str, is_dir: bool) -> bool {
        let basename = relative_path.rsplit('/').next().unwrap_or(relative_path);
        self.patterns.iter().any(|p| {
            if p.dir_only && !is_dir {
                return false;
            }
            glob_match(&p.glob, relative_path) || glob_match(&p.glob, basename)
        })
    }
}

/// Minimal gitignore-flavored glob: `**` matches any sequence including
/// `/`, `*` matches any sequence excluding `/`, `?` matches one character.
fn glob_match(pattern: &str, text: &str) -> bool {
    return matches(pattern.as_bytes(), text.as_bytes());

    fn matches(pattern: &[u8], text: &[u8]) -> bool {
        match pattern.first() {
            None => text.is_empty(),
            Some(b'*') if pattern.get(1) == Some(&b'*') => {
                let rest = &pattern[2..];
                matches(rest, text) || (!text.is_empty() && matches(pattern, &text[1..]))
            }
            Some(b'*') => {
                let rest = &pattern[1..];
                for i in 0..=text.len() {
                    if text[i..].iter().all(|&b| b != b'/') || i == text.len() {
                        if matches(rest, &text[i..]) {
                            return true;
                        }
                    }
                }
                false
            }
            Some(b'?') if !text.is_empty() && text[0] != b'/' => matches(&pattern[1..], &text[1..]),
            Some(&c) => !text.is_empty() && text[0] == c && matches(&pattern[1..], &text[1..]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_git_and_swap_files() {
        let rules = IgnoreRules { patterns: vec![] };
        let mut rules = rules;
        for p in DEFAULT_PATTERNS {
            rules.push(p);
        }
        assert!(rules.is_ignored(".git/HEAD", false));
        assert!(rules.is_ignored("notes.txt.swp", false));
        assert!(rules.is_ignored(".DS_Store", false));
        assert!(!rules.is_ignored("notes.txt", false));
    }

    #[test]
    fn double_star_matches_any_depth() {
        let mut rules = IgnoreRules::default();
        rules.push("build/**");
        assert!(rules.is_ignored("build/a/b/c.o", false));
        assert!(!rules.is_ignored("src/build/x", false));
    }

    #[test]
    fn directory_only_pattern_skips_files() {
        let mut rules = IgnoreRules::default();
        rules.push("node_modules/");
        assert!(rules.is_ignored("node_modules", true));
        assert!(!rules.is_ignored("node_modules", false));
    }
}
