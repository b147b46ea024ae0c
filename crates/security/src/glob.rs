//! Glob patterns over project-relative paths.
//!
//! The dialect is deliberately small:
//! - `*` matches any run of characters except `/`
//! - `**` matches across directories; `dir/**` also matches `dir` itself and
//!   `**/name` also matches `name` at the top level
//! - `?` matches exactly one character except `/`
//!
//! Everything else is literal. Paths are compared with `/` separators and no
//! leading `./`.

use regex_lite::Regex;

/// A compiled glob pattern.
#[derive(Debug, Clone)]
pub struct Glob {
    pattern: String,
    regex: Regex,
}

impl Glob {
    /// Compile a glob.
    pub fn new(pattern: &str) -> Result<Self, regex_lite::Error> {
        let normalized = normalize(pattern);
        let regex = Regex::new(&to_regex(&normalized))?;
        Ok(Self {
            pattern: pattern.to_string(),
            regex,
        })
    }

    /// The pattern as written.
    pub fn as_str(&self) -> &str {
        &self.pattern
    }

    /// Whether the pattern contains a directory separator.
    pub fn has_separator(&self) -> bool {
        self.pattern.contains('/')
    }

    /// Match a project-relative path.
    pub fn is_match(&self, path: &str) -> bool {
        self.regex.is_match(&normalize(path))
    }
}

/// Normalize separators and strip a leading `./`.
pub fn normalize(path: &str) -> String {
    let mut s = path.trim().replace('\\', "/");
    while let Some(rest) = s.strip_prefix("./") {
        s = rest.to_string();
    }
    s
}

/// Translate a normalized glob into an anchored regular expression.
fn to_regex(glob: &str) -> String {
    if glob == "**" {
        return "^.*$".into();
    }

    let (body, any_suffix) = match glob.strip_suffix("/**") {
        Some(prefix) => (prefix, true),
        None => (glob, false),
    };

    let chars: Vec<char> = body.chars().collect();
    let mut out = String::from("^");
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '*' if chars.get(i + 1) == Some(&'*') => {
                if chars.get(i + 2) == Some(&'/') {
                    // `**/` spans zero or more whole directories
                    out.push_str("(?:.*/)?");
                    i += 3;
                } else {
                    out.push_str(".*");
                    i += 2;
                }
            }
            '*' => {
                out.push_str("[^/]*");
                i += 1;
            }
            '?' => {
                out.push_str("[^/]");
                i += 1;
            }
            c => {
                out.push_str(&regex_lite::escape(c.encode_utf8(&mut [0u8; 4])));
                i += 1;
            }
        }
    }

    if any_suffix {
        out.push_str("(?:/.*)?");
    }
    out.push('$');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matches(pattern: &str, path: &str) -> bool {
        Glob::new(pattern).unwrap().is_match(path)
    }

    #[test]
    fn single_star_stays_in_one_directory() {
        assert!(matches("src/*.ts", "src/index.ts"));
        assert!(!matches("src/*.ts", "src/lib/index.ts"));
        assert!(matches("*.md", "README.md"));
        assert!(!matches("*.md", "docs/README.md"));
    }

    #[test]
    fn double_star_spans_directories() {
        assert!(matches("src/**", "src/a.ts"));
        assert!(matches("src/**", "src/a/b/c.ts"));
        assert!(matches("src/**", "src"));
        assert!(!matches("src/**", "srcx/a.ts"));
        assert!(!matches("src/**", "config/x.json"));
    }

    #[test]
    fn leading_double_star_matches_top_level() {
        assert!(matches("**/*.rs", "main.rs"));
        assert!(matches("**/*.rs", "crates/core/src/lib.rs"));
        assert!(!matches("**/*.rs", "main.rsx"));
    }

    #[test]
    fn middle_double_star() {
        assert!(matches("src/**/test_*.py", "src/test_a.py"));
        assert!(matches("src/**/test_*.py", "src/pkg/sub/test_b.py"));
        assert!(!matches("src/**/test_*.py", "lib/test_a.py"));
    }

    #[test]
    fn question_mark_is_one_character() {
        assert!(matches("file?.txt", "file1.txt"));
        assert!(!matches("file?.txt", "file10.txt"));
        assert!(!matches("a?b", "a/b"));
    }

    #[test]
    fn regex_metacharacters_are_literal() {
        assert!(matches("a+b(1).txt", "a+b(1).txt"));
        assert!(!matches("a.b", "axb"));
        assert!(matches("[x].md", "[x].md"));
    }

    #[test]
    fn leading_dot_slash_and_backslashes_are_normalized() {
        assert!(matches("./src/**", "src/main.rs"));
        assert!(matches("src/*.rs", "src\\main.rs"));
        assert!(matches("src/*.rs", "./src/main.rs"));
    }

    #[test]
    fn bare_double_star_matches_everything() {
        assert!(matches("**", "a"));
        assert!(matches("**", "a/b/c"));
    }
}
