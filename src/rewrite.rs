//! Path rewrite rules.
//!
//! Rules are compiled once at configuration time and applied in declaration
//! order; the first rule whose pattern matches wins. A path that matches no
//! rule is returned unchanged.

use regex::Regex;

/// A single pattern -> replacement rule. Replacement templates use `$1`-style
/// capture references.
#[derive(Debug, Clone)]
pub struct RewriteRule {
    pattern: Regex,
    replacement: String,
}

impl RewriteRule {
    /// Compile a rule. Fails on an invalid pattern.
    pub fn new(pattern: &str, replacement: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: Regex::new(pattern)?,
            replacement: replacement.to_string(),
        })
    }

    /// Whether the rule applies to this path.
    pub fn is_match(&self, path: &str) -> bool {
        self.pattern.is_match(path)
    }

    /// Apply the rule to a path.
    pub fn rewrite(&self, path: &str) -> String {
        self.pattern
            .replace_all(path, self.replacement.as_str())
            .into_owned()
    }
}

/// An ordered list of rewrite rules; first match wins.
#[derive(Debug, Clone, Default)]
pub struct RewriteRules(Vec<RewriteRule>);

impl RewriteRules {
    pub fn new(rules: Vec<RewriteRule>) -> Self {
        Self(rules)
    }

    /// Compile an ordered list of `(pattern, replacement)` pairs.
    pub fn compile<I, S, T>(pairs: I) -> Result<Self, regex::Error>
    where
        I: IntoIterator<Item = (S, T)>,
        S: AsRef<str>,
        T: AsRef<str>,
    {
        let mut rules = Vec::new();
        for (pattern, replacement) in pairs {
            rules.push(RewriteRule::new(pattern.as_ref(), replacement.as_ref())?);
        }
        Ok(Self(rules))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Rewrite a path through the first matching rule, or return it
    /// unchanged when no rule matches.
    pub fn rewrite(&self, path: &str) -> String {
        for rule in &self.0 {
            if rule.is_match(path) {
                return rule.rewrite(path);
            }
        }
        path.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_rule() {
        let rule = RewriteRule::new("^/api/(.*)", "/$1").unwrap();
        assert!(rule.is_match("/api/foo/bar"));
        assert_eq!(rule.rewrite("/api/foo/bar"), "/foo/bar");
    }

    #[test]
    fn test_first_match_wins() {
        let rules = RewriteRules::compile([
            ("^/api/foo/(.*)", "/$1"),
            ("^/api/(.*)", "/$1"),
        ])
        .unwrap();

        // Both rules match; only the first applies.
        assert_eq!(rules.rewrite("/api/foo/bar"), "/bar");
        // Only the second matches.
        assert_eq!(rules.rewrite("/api/baz"), "/baz");
    }

    #[test]
    fn test_no_match_returns_path_unchanged() {
        let rules = RewriteRules::compile([("^/v1/(.*)", "/$1")]).unwrap();
        assert_eq!(rules.rewrite("/v2/users"), "/v2/users");
        assert_eq!(RewriteRules::default().rewrite("/v1/users"), "/v1/users");
    }

    #[test]
    fn test_invalid_pattern_is_rejected() {
        assert!(RewriteRule::new("(", "/").is_err());
    }
}
