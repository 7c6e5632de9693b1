//! Domain pattern matching shared by interception, certificate selection
//! and PAC generation.

use std::fmt;

/// A single hostname template such as `pixiv.net` or `*.pximg.net`.
///
/// Each label is either a literal or `*`, which stands for exactly one label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainPattern {
    raw: String,
}

impl DomainPattern {
    pub fn new(pattern: impl Into<String>) -> Self {
        Self { raw: pattern.into() }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// See [`pattern_matches`].
    pub fn matches(&self, host: &str) -> bool {
        pattern_matches(&self.raw, host)
    }
}

impl fmt::Display for DomainPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Label-wise match of a single pattern string against a hostname.
///
/// True if `host` has the same label count and every label is equal or
/// wildcarded. Comparison is case-sensitive.
pub fn pattern_matches(pattern: &str, host: &str) -> bool {
    let mut pattern_labels = pattern.split('.');
    let mut host_labels = host.split('.');
    loop {
        match (pattern_labels.next(), host_labels.next()) {
            (None, None) => return true,
            (Some(p), Some(h)) if p == "*" || p == h => continue,
            _ => return false,
        }
    }
}

/// Ordered set of patterns deciding which hosts are in scope for
/// interception.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DomainPatternSet {
    patterns: Vec<DomainPattern>,
}

impl DomainPatternSet {
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            patterns: patterns.into_iter().map(DomainPattern::new).collect(),
        }
    }

    /// Returns true if any pattern in the set matches `host`.
    pub fn matches(&self, host: &str) -> bool {
        self.patterns.iter().any(|p| p.matches(host))
    }

    pub fn iter(&self) -> impl Iterator<Item = &DomainPattern> {
        self.patterns.iter()
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

impl<S: Into<String>> FromIterator<S> for DomainPatternSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self::new(iter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Tests that a wildcard stands for exactly one label.
    /// The apex domain has fewer labels and must not match.
    #[test]
    fn wildcard_requires_equal_depth() {
        let set = DomainPatternSet::new(["*.github.com"]);
        assert!(set.matches("api.github.com"));
        assert!(!set.matches("github.com"));
        assert!(!set.matches("a.b.github.com"));
    }

    #[test]
    fn exact_pattern() {
        let set = DomainPatternSet::new(["github.com"]);
        assert!(set.matches("github.com"));
        assert!(!set.matches("gitlab.com"));
        assert!(!set.matches("www.github.com"));
    }

    /// Matching is byte-for-byte; callers normalise case if they need to.
    #[test]
    fn case_sensitive() {
        let set = DomainPatternSet::new(["pixiv.net"]);
        assert!(!set.matches("PIXIV.net"));
    }

    /// A wildcard may sit in any label position, not just the first.
    #[test]
    fn wildcard_in_middle_label() {
        assert!(pattern_matches("img.*.net", "img.pximg.net"));
        assert!(!pattern_matches("img.*.net", "img.pximg.com"));
    }

    /// The free function and the set must agree for every pair.
    #[test]
    fn free_function_agrees_with_set() {
        let patterns = ["pixiv.net", "*.pixiv.net", "*.secure.pixiv.net"];
        let hosts = [
            "pixiv.net",
            "www.pixiv.net",
            "accounts.secure.pixiv.net",
            "secure.pixiv.net",
            "evil.com",
            "",
        ];
        let set = DomainPatternSet::new(patterns);
        for host in hosts {
            let expected = patterns.iter().any(|p| pattern_matches(p, host));
            assert_eq!(set.matches(host), expected, "host {host:?}");
        }
    }

    /// A parsed pattern and its raw string classify hosts identically,
    /// including empty labels.
    #[test]
    fn pattern_agrees_with_free_function() {
        let cases = [
            ("*.pximg.net", "i.pximg.net", true),
            ("*.pximg.net", "pximg.net", false),
            ("*", "localhost", true),
            ("*", "", true),
            ("pixiv.net", "pixiv.net.", false),
            ("*.net", ".net", true),
            ("*.*", "a.b", true),
        ];
        for (pattern, host, expected) in cases {
            assert_eq!(pattern_matches(pattern, host), expected, "{pattern} vs {host:?}");
            assert_eq!(DomainPattern::new(pattern).matches(host), expected, "{pattern} vs {host:?}");
        }
    }

    #[test]
    fn empty_set_matches_nothing() {
        let set = DomainPatternSet::default();
        assert!(set.is_empty());
        assert!(!set.matches("pixiv.net"));
    }
}
