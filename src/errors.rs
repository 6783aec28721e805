// Copyright 2025 the Foreman Project
// Licensed under the MIT License

//! The failure taxonomy.
//!
//! Every error that crosses a rule or suspension boundary is a [`Failure`]:
//! a value, not an unwound exception. Failures are cloned freely because an
//! uncaught failure becomes the memoized result of its node and is re-raised
//! to every demander. General-purpose plumbing below this boundary uses
//! [`anyhow`] and is converted at the edge.

use thiserror::Error;

use crate::digest::Digest;

#[derive(Clone, Debug, Error)]
pub enum Failure {
    /// Static validation: no registered rule can produce the demanded output
    /// from the types in scope.
    #[error("no rule provides `{output}` from ({inputs}){}", origin_suffix(.origin))]
    NoRuleProvides {
        output: String,
        inputs: String,
        origin: String,
    },

    /// Static validation: more than one rule satisfies the same typed demand
    /// in the same scope.
    #[error("ambiguous providers for `{output}`: {}", candidates.join(", "))]
    AmbiguousRule {
        output: String,
        candidates: Vec<String>,
    },

    /// Static validation: the chosen providers form a cycle at the type level.
    #[error("rule types form a cycle: {}", path.join(" -> "))]
    CycleInRuleTypes { path: Vec<String> },

    /// A cycle among concrete nodes at runtime. Almost always prevented by
    /// validation; surfaced when parameter threading defeats the static check.
    #[error("dependency cycle while evaluating: {}", path.join(" -> "))]
    EvaluationCycle { path: Vec<String> },

    /// A required file, target, or input value was not found.
    #[error("missing input: {message}{}", origin_suffix(.origin))]
    MissingInput { message: String, origin: String },

    /// A required include glob matched zero files under an `Error` policy.
    #[error("no files matched {} (required by {origin})", globs.join(", "))]
    NoFilesMatched { origin: String, globs: Vec<String> },

    /// Two snapshots disagree about the content of the same path.
    #[error("cannot merge snapshots: conflicting content at `{path}`")]
    MergeConflict { path: String },

    /// A process exited outside its declared success set.
    #[error("process `{description}` failed with exit code {exit_code}\n{stderr_excerpt}")]
    ProcessFailed {
        description: String,
        exit_code: i32,
        stdout: Digest,
        stderr: Digest,
        /// Captured stderr, truncated to the configured limit for display;
        /// the full stream is in the store under `stderr`.
        stderr_excerpt: String,
    },

    /// A process exceeded its wall-clock timeout and was killed.
    #[error("process `{description}` timed out after {timeout_ms} ms")]
    ProcessTimeout { description: String, timeout_ms: u64 },

    /// Local store I/O failure or detected corruption.
    #[error("store error: {message}")]
    Store { message: String },

    /// A configured remote CAS or action cache could not be reached, or a
    /// digest was absent everywhere.
    #[error("remote unavailable: {message}")]
    RemoteUnavailable { message: String },

    /// The demanding session was cancelled.
    #[error("cancelled")]
    Cancelled,

    /// A failure propagating out of a named rule, keeping the origin chain.
    #[error("in rule `{rule}`: {source}")]
    InRule {
        rule: String,
        #[source]
        source: Box<Failure>,
    },
}

fn origin_suffix(origin: &str) -> String {
    if origin.is_empty() {
        String::new()
    } else {
        format!(" (from {origin})")
    }
}

impl Failure {
    pub fn store(err: impl std::fmt::Display) -> Self {
        Failure::Store {
            message: err.to_string(),
        }
    }

    pub fn missing_input(message: impl Into<String>, origin: impl Into<String>) -> Self {
        Failure::MissingInput {
            message: message.into(),
            origin: origin.into(),
        }
    }

    /// Wrap with the name of the rule the failure escaped from. Applied once
    /// per node so that deep chains stay readable.
    pub fn in_rule(self, rule: &str) -> Self {
        match self {
            already @ Failure::InRule { .. } => already,
            Failure::Cancelled => Failure::Cancelled,
            other => Failure::InRule {
                rule: rule.to_string(),
                source: Box::new(other),
            },
        }
    }

    /// Whether this failure is (or wraps) a cancellation.
    pub fn is_cancelled(&self) -> bool {
        match self {
            Failure::Cancelled => true,
            Failure::InRule { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }
}

impl From<anyhow::Error> for Failure {
    fn from(err: anyhow::Error) -> Self {
        // Preserve context chains built up by lower layers.
        Failure::Store {
            message: format!("{err:#}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_rule_wraps_once() {
        let f = Failure::missing_input("no such file", "test").in_rule("outer");
        let again = f.clone().in_rule("inner");
        match again {
            Failure::InRule { rule, .. } => assert_eq!(rule, "outer"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn cancellation_is_never_wrapped() {
        assert!(Failure::Cancelled.in_rule("r").is_cancelled());
        assert!(matches!(
            Failure::Cancelled.in_rule("r"),
            Failure::Cancelled
        ));
    }

    #[test]
    fn messages_name_the_origin() {
        let f = Failure::NoFilesMatched {
            origin: "test".into(),
            globs: vec!["src/nonexistent.x".into()],
        };
        let msg = f.to_string();
        assert!(msg.contains("test"));
        assert!(msg.contains("src/nonexistent.x"));
    }
}
