use radix_trie::{Trie, TrieCommon};
use std::borrow::Cow;
use std::collections::HashSet;

/// Exact and suffix domain set.
///
/// Suffix entries are keyed by their reversed text plus a trailing dot, so any
/// ancestor found for a reversed query lies on a label boundary.
pub struct HostMatcher {
    exact: HashSet<String>,
    suffix: Trie<String, ()>,
    suffix_count: usize,
}

impl HostMatcher {
    pub fn matches(&self, host: &str) -> bool {
        let host = normalize_host(host);
        if self.exact.contains(host.as_ref()) {
            return true;
        }
        if self.suffix_count == 0 {
            return false;
        }
        self.suffix
            .get_ancestor(reversed_key(host.as_ref()).as_str())
            .is_some_and(|sub| sub.value().is_some())
    }

    pub fn len(&self) -> usize {
        self.exact.len() + self.suffix_count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct HostMatcherBuilder {
    exact: HashSet<String>,
    suffix: Vec<(String, ())>,
}

impl HostMatcherBuilder {
    pub fn new() -> Self {
        Self {
            exact: HashSet::new(),
            suffix: Vec::new(),
        }
    }

    pub fn add_exact(&mut self, host: &str) {
        self.exact.insert(normalize_host(host).into_owned());
    }

    pub fn add_suffix(&mut self, host: &str) {
        self.suffix
            .push((reversed_key(normalize_host(host).as_ref()), ()))
    }

    pub fn build(self) -> HostMatcher {
        let suffix = Trie::from_iter(self.suffix);
        let suffix_count = suffix.iter().count();
        HostMatcher {
            exact: self.exact,
            suffix,
            suffix_count,
        }
    }
}

impl Default for HostMatcherBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Lowercase and strip the root dot; borrows when already normalized.
pub fn normalize_host(host: &str) -> Cow<'_, str> {
    let trimmed = host.strip_suffix('.').unwrap_or(host);
    if trimmed.bytes().any(|b| b.is_ascii_uppercase()) {
        Cow::Owned(trimmed.to_ascii_lowercase())
    } else {
        Cow::Borrowed(trimmed)
    }
}

fn reversed_key(host: &str) -> String {
    let mut key: String = host.chars().rev().collect();
    key.push('.');
    key
}

#[test]
fn test_matcher() {
    let mut builder = HostMatcherBuilder::new();
    builder.add_suffix("telemetry.google.com");
    builder.add_suffix("analytics.google.com");
    builder.add_exact("test.google.com");
    let matcher = builder.build();
    assert!(!matcher.matches("google.com"));
    assert!(matcher.matches("telemetry.google.com"));
    assert!(matcher.matches("t-01.telemetry.google.com"));
    assert!(matcher.matches("test.google.com"));
    assert!(!matcher.matches("notgoogle.com"));
    assert!(!matcher.matches("me.notgoogle.com"));
    assert!(!matcher.matches("ogle.com"));
    assert!(!matcher.matches("t-02.test.google.com"));
    let mut builder = HostMatcherBuilder::new();
    builder.add_suffix("ogle.com");
    let matcher = builder.build();
    assert!(matcher.matches("hi.ogle.com"));
    assert!(!matcher.matches("google.com"));
    assert!(!matcher.matches("hi.google.com"));
}

#[test]
fn test_matcher_shorter_suffix_behind_longer_one() {
    let mut builder = HostMatcherBuilder::new();
    builder.add_suffix("com");
    builder.add_suffix("ple.com");
    builder.add_exact("a.b.example.com");
    let matcher = builder.build();
    assert!(matcher.matches("example.com"));
    assert!(matcher.matches("c.a.b.example.com"));
    assert!(matcher.matches("Example.COM."));
    assert!(!matcher.matches("example.org"));
    assert_eq!(matcher.len(), 3);
}
