// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Topic Route Matching
//!
//! Compiles topic patterns (`a.*.c`, `a.#`) into anchored regular expressions
//! and caches them by pattern string. The cache belongs to the [`RouteMatcher`]
//! instance, so independent clients never share compiled state.

use regex::Regex;
use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};
use tracing::{error, trace};

/// ASCII letters, digits, underscores and hyphens.
const SEGMENT: &str = r"[A-Za-z0-9_\-]*";
const MULTI_SEGMENT: &str = r"[A-Za-z0-9_\-\.]*";

/// Matches routing keys against topic patterns.
#[derive(Debug, Clone, Default)]
pub struct RouteMatcher {
    cache: Arc<RwLock<HashMap<String, Regex>>>,
}

impl RouteMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true when `candidate` satisfies `pattern`.
    ///
    /// `*` matches exactly one (possibly empty) segment, `#` matches zero or
    /// more segments, everything else is literal.
    pub fn matches(&self, pattern: &str, candidate: &str) -> bool {
        if let Ok(cache) = self.cache.read() {
            if let Some(re) = cache.get(pattern) {
                return re.is_match(candidate);
            }
        }

        let Some(re) = compile(pattern) else {
            return false;
        };
        let matched = re.is_match(candidate);

        if let Ok(mut cache) = self.cache.write() {
            cache.entry(pattern.to_owned()).or_insert(re);
        }

        matched
    }

    /// Number of compiled patterns held by the cache.
    pub fn cached(&self) -> usize {
        self.cache.read().map(|c| c.len()).unwrap_or_default()
    }
}

fn compile(pattern: &str) -> Option<Regex> {
    let mut expr = String::with_capacity(pattern.len() * 2 + 2);
    expr.push('^');
    for c in pattern.chars() {
        match c {
            '*' => expr.push_str(SEGMENT),
            '#' => expr.push_str(MULTI_SEGMENT),
            other => expr.push_str(&regex::escape(&other.to_string())),
        }
    }
    expr.push('$');

    trace!(pattern, expr, "compiling route pattern");

    match Regex::new(&expr) {
        Ok(re) => Some(re),
        Err(err) => {
            error!(error = err.to_string(), pattern, "invalid route pattern");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_patterns_match_only_themselves() {
        let m = RouteMatcher::new();
        assert!(m.matches("a.b.c", "a.b.c"));
        assert!(!m.matches("a.b.c", "a.b.d"));
        assert!(!m.matches("a.b", "a.b.c"));
        assert!(!m.matches("a.b.c", "a.b"));
    }

    #[test]
    fn dots_are_literal() {
        let m = RouteMatcher::new();
        assert!(!m.matches("a.b", "axb"));
    }

    #[test]
    fn single_segment_wildcard() {
        let m = RouteMatcher::new();
        assert!(m.matches("a.*", "a.hello"));
        assert!(!m.matches("a.*", "a.hello.world"));
        assert!(m.matches("a.*.c", "a.b-1_x.c"));
        assert!(m.matches("a.*", "a."));
    }

    #[test]
    fn multi_segment_wildcard() {
        let m = RouteMatcher::new();
        assert!(m.matches("a.#", "a.hello.world"));
        assert!(m.matches("a.#.b", "a..b"));
        assert!(m.matches("a.#.b", "a.x.y.b"));
        assert!(m.matches("#", "any.thing.with.dots"));
        assert!(m.matches("#", ""));
    }

    #[test]
    fn wildcards_stay_within_ascii_words() {
        let m = RouteMatcher::new();
        assert!(!m.matches("a.*", "a.héllo"));
        assert!(!m.matches("a.#", "a.b.ünïcode"));
        assert!(!m.matches("#", "日本"));
        assert!(m.matches("a.*", "a.Hello_World-9"));
    }

    #[test]
    fn caches_compiled_patterns_per_instance() {
        let m = RouteMatcher::new();
        m.matches("a.*", "a.b");
        m.matches("a.*", "a.c");
        m.matches("b.#", "b");
        assert_eq!(m.cached(), 2);

        let other = RouteMatcher::new();
        assert_eq!(other.cached(), 0);

        let shared = m.clone();
        assert_eq!(shared.cached(), 2);
    }
}
