// Copyright 2025 the Foreman Project
// Licensed under the MIT License

//! Path glob sets.
//!
//! A [`PathGlobs`] is an ordered set of include patterns, an ordered set of
//! exclude patterns, a policy describing what happens when a required include
//! matches nothing, and a description of where the globs came from so that
//! error messages can point at the responsible configuration.

use globset::{GlobBuilder, GlobMatcher};
use sha2::Digest as _;
use tracing::warn;

use crate::digest::{DigestComputer, Digestible};
use crate::errors::Failure;

/// What to do when an include pattern matches zero files.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NoMatchPolicy {
    Ignore,
    Warn,
    Error,
}

impl NoMatchPolicy {
    fn tag(&self) -> u8 {
        match self {
            NoMatchPolicy::Ignore => 0,
            NoMatchPolicy::Warn => 1,
            NoMatchPolicy::Error => 2,
        }
    }
}

#[derive(Clone, Debug)]
pub struct PathGlobs {
    includes: Vec<String>,
    excludes: Vec<String>,
    policy: NoMatchPolicy,
    origin: String,
    include_matchers: Vec<GlobMatcher>,
    exclude_matchers: Vec<GlobMatcher>,
}

impl PathGlobs {
    /// Compile a glob set. Patterns use extended glob syntax (`*`, `**`, `?`,
    /// `[…]`); excludes are applied after includes.
    pub fn new(
        includes: impl IntoIterator<Item = impl Into<String>>,
        excludes: impl IntoIterator<Item = impl Into<String>>,
        policy: NoMatchPolicy,
        origin: impl Into<String>,
    ) -> Result<Self, Failure> {
        let includes: Vec<String> = includes.into_iter().map(Into::into).collect();
        let excludes: Vec<String> = excludes.into_iter().map(Into::into).collect();
        let origin = origin.into();

        let compile = |pattern: &String| -> Result<GlobMatcher, Failure> {
            Ok(GlobBuilder::new(pattern)
                // `*` and `?` must not cross directory separators; `**` spans
                // them explicitly.
                .literal_separator(true)
                .build()
                .map_err(|e| {
                    Failure::missing_input(format!("invalid glob `{pattern}`: {e}"), &origin)
                })?
                .compile_matcher())
        };

        let include_matchers = includes.iter().map(compile).collect::<Result<_, _>>()?;
        let exclude_matchers = excludes.iter().map(compile).collect::<Result<_, _>>()?;

        Ok(PathGlobs {
            includes,
            excludes,
            policy,
            origin,
            include_matchers,
            exclude_matchers,
        })
    }

    /// A glob set matching a list of literal paths exactly.
    pub fn literal(
        paths: impl IntoIterator<Item = impl Into<String>>,
        origin: impl Into<String>,
    ) -> Result<Self, Failure> {
        // globset treats most literal paths as themselves; escape the handful
        // of meta characters so a literal `[` cannot change meaning.
        let escaped: Vec<String> = paths
            .into_iter()
            .map(|p| escape_glob_meta(&p.into()))
            .collect();
        PathGlobs::new(escaped, Vec::<String>::new(), NoMatchPolicy::Ignore, origin)
    }

    pub fn includes(&self) -> &[String] {
        &self.includes
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn policy(&self) -> NoMatchPolicy {
        self.policy
    }

    /// Whether a single relative path is selected by this glob set.
    pub fn matches(&self, path: &str) -> bool {
        self.include_matchers.iter().any(|m| m.is_match(path))
            && !self.exclude_matchers.iter().any(|m| m.is_match(path))
    }

    /// Apply the glob set to a list of relative paths.
    ///
    /// Returns the selected paths in canonical sorted order regardless of
    /// pattern order, enforcing the no-match policy per include pattern.
    pub fn select<'a>(
        &self,
        paths: impl IntoIterator<Item = &'a str>,
    ) -> Result<Vec<String>, Failure> {
        let paths: Vec<&str> = paths.into_iter().collect();
        let mut unmatched: Vec<&String> = Vec::new();

        for (pattern, matcher) in self.includes.iter().zip(&self.include_matchers) {
            if !paths.iter().any(|p| matcher.is_match(p)) {
                unmatched.push(pattern);
            }
        }

        if !unmatched.is_empty() {
            match self.policy {
                NoMatchPolicy::Ignore => {}
                NoMatchPolicy::Warn => {
                    warn!(
                        origin = %self.origin,
                        "globs matched no files: {}",
                        unmatched
                            .iter()
                            .map(|s| s.as_str())
                            .collect::<Vec<_>>()
                            .join(", ")
                    );
                }
                NoMatchPolicy::Error => {
                    return Err(Failure::NoFilesMatched {
                        origin: self.origin.clone(),
                        globs: unmatched.iter().map(|s| s.to_string()).collect(),
                    });
                }
            }
        }

        let mut selected: Vec<String> = paths
            .into_iter()
            .filter(|p| self.matches(p))
            .map(|p| p.to_string())
            .collect();
        selected.sort();
        selected.dedup();
        Ok(selected)
    }
}

impl Digestible for PathGlobs {
    fn update_digest(&self, dc: &mut DigestComputer) {
        self.includes.update_digest(dc);
        self.excludes.update_digest(dc);
        dc.update([self.policy.tag()]);
        // The origin is part of identity: it appears in NoFilesMatched
        // failures, and failures are memoized values.
        self.origin.update_digest(dc);
    }
}

fn escape_glob_meta(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    for c in path.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '{' | '}') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn globs(inc: &[&str], exc: &[&str], policy: NoMatchPolicy) -> PathGlobs {
        PathGlobs::new(inc.to_vec(), exc.to_vec(), policy, "test").unwrap()
    }

    #[test]
    fn includes_then_excludes() {
        let g = globs(&["src/**/*.rs"], &["src/gen/**"], NoMatchPolicy::Ignore);
        let picked = g
            .select(["src/lib.rs", "src/gen/x.rs", "docs/a.md", "src/a/b.rs"])
            .unwrap();
        assert_eq!(picked, vec!["src/a/b.rs", "src/lib.rs"]);
    }

    #[test]
    fn output_is_sorted_regardless_of_pattern_order() {
        let g = globs(&["b/*", "a/*"], &[], NoMatchPolicy::Ignore);
        let picked = g.select(["b/2", "a/1"]).unwrap();
        assert_eq!(picked, vec!["a/1", "b/2"]);
    }

    #[test]
    fn error_policy_names_the_origin_and_globs() {
        let g = globs(&["src/nonexistent.x"], &[], NoMatchPolicy::Error);
        let err = g.select(["src/lib.x"]).unwrap_err();
        match err {
            Failure::NoFilesMatched { origin, globs } => {
                assert_eq!(origin, "test");
                assert_eq!(globs, vec!["src/nonexistent.x"]);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn ignore_policy_passes_through() {
        let g = globs(&["missing/*"], &[], NoMatchPolicy::Ignore);
        assert!(g.select(["present.txt"]).unwrap().is_empty());
    }

    #[test]
    fn literal_paths_match_themselves_only() {
        let g = PathGlobs::literal(["a/b.txt", "weird[1].txt"], "test").unwrap();
        assert!(g.matches("a/b.txt"));
        assert!(g.matches("weird[1].txt"));
        assert!(!g.matches("a/c.txt"));
    }

    #[test]
    fn identity_includes_policy_and_origin() {
        let a = globs(&["*.rs"], &[], NoMatchPolicy::Ignore).compute_digest();
        let b = globs(&["*.rs"], &[], NoMatchPolicy::Error).compute_digest();
        let c = PathGlobs::new(["*.rs"], Vec::<String>::new(), NoMatchPolicy::Ignore, "other")
            .unwrap()
            .compute_digest();
        assert_ne!(a, b);
        assert_ne!(a, c);
    }
}
