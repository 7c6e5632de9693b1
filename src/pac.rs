//! Proxy auto-configuration script generation.
//!
//! The rules mirror [`DomainPattern::matches`]: a `*` label matches exactly
//! one label, so every rule pins the label count with `dnsDomainLevels`
//! before handing the pattern to `shExpMatch`.

use std::fmt::Write as _;
use std::net::SocketAddr;
use std::path::Path;

use crate::pattern::{DomainPattern, DomainPatternSet};

/// Renders a `FindProxyForURL` script sending intercepted hosts to `proxy`.
pub fn render(patterns: &DomainPatternSet, proxy: SocketAddr) -> String {
    let mut script = String::from("function FindProxyForURL(url, host) {\n");
    for pattern in patterns.iter() {
        // `write!` into a String cannot fail.
        let _ = writeln!(
            script,
            "  if (dnsDomainLevels(host) == {} && shExpMatch(host, \"{}\")) {{\n    return \"PROXY {}\";\n  }}",
            domain_levels(pattern),
            pattern.as_str(),
            proxy
        );
    }
    script.push_str("  return \"DIRECT\";\n}\n");
    script
}

/// Writes the script to `path`.
pub fn write(path: &Path, patterns: &DomainPatternSet, proxy: SocketAddr) -> std::io::Result<()> {
    std::fs::write(path, render(patterns, proxy))
}

/// Number of dots, which is what `dnsDomainLevels` reports.
fn domain_levels(pattern: &DomainPattern) -> usize {
    pattern.as_str().matches('.').count()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proxy() -> SocketAddr {
        "127.0.0.1:8080".parse().unwrap()
    }

    #[test]
    fn renders_rule_per_pattern() {
        let patterns = DomainPatternSet::new(["*.pixiv.net", "pixiv.net"]);
        let script = render(&patterns, proxy());

        assert!(script.starts_with("function FindProxyForURL(url, host) {\n"));
        assert!(script.contains(
            "if (dnsDomainLevels(host) == 2 && shExpMatch(host, \"*.pixiv.net\")) {\n    return \"PROXY 127.0.0.1:8080\";"
        ));
        assert!(script.contains("if (dnsDomainLevels(host) == 1 && shExpMatch(host, \"pixiv.net\"))"));
        assert!(script.trim_end().ends_with("return \"DIRECT\";\n}"));
    }

    #[test]
    fn empty_set_is_all_direct() {
        let script = render(&DomainPatternSet::default(), proxy());
        assert_eq!(
            script,
            "function FindProxyForURL(url, host) {\n  return \"DIRECT\";\n}\n"
        );
    }

    #[test]
    fn writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("proxy.pac");
        let patterns = DomainPatternSet::new(["*.pximg.net"]);
        write(&path, &patterns, proxy()).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), render(&patterns, proxy()));
    }
}
