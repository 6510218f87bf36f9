//! Domain whitelist deciding which requests are routed through the relay.
//!
//! The matching layer is split into three types:
//!
//! - [`Whitelist`]: an immutable, ordered set of patterns.
//! - [`RoutePolicy`]: the whitelist plus its enabled flag; answers
//!   "should this connection use the relay?".
//! - [`SharedRoutePolicy`]: the runtime handle. Readers take an `Arc`
//!   snapshot; reloads swap in a whole new policy.
//!
//! # Pattern Matching
//!
//! | Pattern           | Matches                                        |
//! |-------------------|------------------------------------------------|
//! | `"example.com"`   | Exactly `example.com`.                         |
//! | `"*.example.com"` | `example.com` itself and any subdomain of it.  |
//!
//! A `:port` suffix on the candidate is stripped before comparison, and
//! comparison ignores ASCII case.

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

/// Strip a `:port` suffix (and IPv6 brackets) from a host string.
pub fn strip_port(domain: &str) -> &str {
    if let Some(rest) = domain.strip_prefix('[') {
        return match rest.find(']') {
            Some(end) => &rest[..end],
            None => rest,
        };
    }
    match domain.split_once(':') {
        // A second colon means a bare IPv6 literal, not a port.
        Some((host, rest)) if !rest.contains(':') => host,
        _ => domain,
    }
}

/// Whether `domain` matches any of `patterns`.
///
/// Pure: the result depends only on the two arguments.
pub fn is_whitelisted<S: AsRef<str>>(domain: &str, patterns: &[S]) -> bool {
    let candidate = strip_port(domain).to_ascii_lowercase();
    if candidate.is_empty() {
        return false;
    }

    // Exact match first.
    if patterns
        .iter()
        .any(|p| p.as_ref().eq_ignore_ascii_case(&candidate))
    {
        return true;
    }

    patterns.iter().any(|pattern| {
        let Some(base) = pattern.as_ref().strip_prefix("*.") else {
            return false;
        };
        let base = base.to_ascii_lowercase();
        if base.is_empty() {
            return false;
        }
        candidate == base
            || (candidate.len() > base.len() + 1
                && candidate.ends_with(&base)
                && candidate.as_bytes()[candidate.len() - base.len() - 1] == b'.')
    })
}

/// An immutable, ordered set of whitelist patterns.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Whitelist {
    patterns: Vec<String>,
}

impl Whitelist {
    /// Build from patterns, trimming whitespace and dropping empties and
    /// duplicates while keeping first-seen order.
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut out: Vec<String> = Vec::new();
        for p in patterns {
            let p: String = p.into().trim().to_string();
            if !p.is_empty() && !out.contains(&p) {
                out.push(p);
            }
        }
        Self { patterns: out }
    }

    /// Parse a comma-separated list such as `"google.com,*.google.com"`.
    pub fn parse_list(list: &str) -> Self {
        Self::new(list.split(','))
    }

    pub fn matches(&self, domain: &str) -> bool {
        is_whitelisted(domain, &self.patterns)
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// A copy with `pattern` appended (no-op if already present).
    pub fn with_domain(&self, pattern: &str) -> Self {
        Self::new(self.patterns.iter().map(String::as_str).chain([pattern]))
    }

    /// A copy without `pattern`.
    pub fn without_domain(&self, pattern: &str) -> Self {
        Self {
            patterns: self
                .patterns
                .iter()
                .filter(|p| p.as_str() != pattern.trim())
                .cloned()
                .collect(),
        }
    }
}

impl fmt::Display for Whitelist {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.patterns.join(","))
    }
}

/// Routing decision: whitelist mode flag plus the pattern set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoutePolicy {
    pub enabled: bool,
    pub whitelist: Whitelist,
}

impl RoutePolicy {
    pub fn new(enabled: bool, whitelist: Whitelist) -> Self {
        Self { enabled, whitelist }
    }

    /// Route everything through the relay.
    pub fn proxy_all() -> Self {
        Self::default()
    }

    /// Whether traffic for `domain` goes through the relay.
    ///
    /// Whitelist mode disabled: always `true`. Enabled: only matching
    /// domains use the relay; the rest connect directly.
    pub fn should_proxy(&self, domain: &str) -> bool {
        !self.enabled || self.whitelist.matches(domain)
    }
}

/// Copy-on-write handle to the active [`RoutePolicy`].
///
/// Cloning the handle shares the same policy. Updates build a new policy
/// and swap it in; in-flight readers keep the snapshot they took.
#[derive(Debug, Clone, Default)]
pub struct SharedRoutePolicy {
    current: Arc<RwLock<Arc<RoutePolicy>>>,
}

impl SharedRoutePolicy {
    pub fn new(policy: RoutePolicy) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(policy))),
        }
    }

    /// The policy in force right now.
    pub fn snapshot(&self) -> Arc<RoutePolicy> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn should_proxy(&self, domain: &str) -> bool {
        self.snapshot().should_proxy(domain)
    }

    /// Replace the whole policy.
    pub fn reload(&self, policy: RoutePolicy) {
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(policy);
    }

    pub fn add_domain(&self, pattern: &str) {
        self.update(|p| RoutePolicy::new(p.enabled, p.whitelist.with_domain(pattern)));
    }

    pub fn remove_domain(&self, pattern: &str) {
        self.update(|p| RoutePolicy::new(p.enabled, p.whitelist.without_domain(pattern)));
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.update(|p| RoutePolicy::new(enabled, p.whitelist.clone()));
    }

    fn update(&self, f: impl FnOnce(&RoutePolicy) -> RoutePolicy) {
        let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
        let next = f(&guard);
        *guard = Arc::new(next);
    }
}
