// Copyright 2026 the Foreman Project
// Licensed under the MIT License

//! Runtime evaluation nodes.
//!
//! A node is one memoized invocation: a rule plus the digest of its concrete
//! input values. Node entries move through a small state machine driven by
//! the scheduler: `NotStarted -> Running -> Done`, with invalidation sending
//! a node back to `NotStarted` and cancellation dropping an in-flight run.

use std::{
    collections::HashSet,
    fmt,
    sync::{Arc, Mutex},
};
use sha2::Digest as _;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::digest::{DigestComputer, DigestData, Digestible};
use crate::errors::Failure;
use crate::rules::Value;

/// The identity of a runtime node: which rule, applied to which values.
#[derive(Clone)]
pub struct NodeKey {
    pub rule: usize,
    pub rule_name: Arc<str>,
    pub inputs: Arc<Vec<Value>>,
    pub identity: DigestData,
}

impl NodeKey {
    pub fn new(rule: usize, rule_name: &str, inputs: Vec<Value>) -> NodeKey {
        let mut dc = DigestComputer::new();
        rule_name.update_digest(&mut dc);
        for input in &inputs {
            dc.update(input.identity());
        }

        NodeKey {
            rule,
            rule_name: rule_name.into(),
            inputs: Arc::new(inputs),
            identity: dc.finalize(),
        }
    }

    /// A human-readable label: the rule name plus a short input summary.
    pub fn label(&self) -> String {
        if self.inputs.is_empty() {
            self.rule_name.to_string()
        } else {
            let inputs = self
                .inputs
                .iter()
                .map(|v| v.type_key().name())
                .collect::<Vec<_>>()
                .join(", ");
            format!("{}({inputs})", self.rule_name)
        }
    }
}

impl fmt::Debug for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

pub type NodeResult = Result<Value, Failure>;

/// The lifecycle of a node entry.
pub enum NodeState {
    NotStarted,
    Running {
        /// Demanders wait here; the runner sends exactly one `Some`.
        rx: watch::Receiver<Option<NodeResult>>,
        /// Set when an invalidation sweep touches a node mid-run: the result
        /// is delivered to current waiters but not memoized.
        dirtied: bool,
    },
    Done {
        result: NodeResult,
        /// The invalidation generation current when the result landed.
        generation: u64,
    },
}

pub struct NodeEntry {
    pub key: NodeKey,
    pub state: Mutex<NodeState>,
    /// Sessions with a live interest in this node.
    pub sessions: Mutex<HashSet<u64>>,
    /// Cancellation for the in-flight run, if any.
    pub cancel: Mutex<Option<CancellationToken>>,
    /// Identities of nodes that demanded this one; walked on invalidation.
    pub dependents: Mutex<HashSet<DigestData>>,
}

impl NodeEntry {
    pub fn new(key: NodeKey) -> NodeEntry {
        NodeEntry {
            key,
            state: Mutex::new(NodeState::NotStarted),
            sessions: Mutex::new(HashSet::new()),
            cancel: Mutex::new(None),
            dependents: Mutex::new(HashSet::new()),
        }
    }
}

/// The chain of node identities leading to the current demand, for runtime
/// cycle detection and error reporting.
pub struct DemandStack {
    pub identity: DigestData,
    pub label: String,
    pub parent: Option<Arc<DemandStack>>,
}

impl DemandStack {
    pub fn root(identity: DigestData, label: String) -> Arc<DemandStack> {
        Arc::new(DemandStack {
            identity,
            label,
            parent: None,
        })
    }

    pub fn push(self: &Arc<Self>, identity: DigestData, label: String) -> Arc<DemandStack> {
        Arc::new(DemandStack {
            identity,
            label,
            parent: Some(Arc::clone(self)),
        })
    }

    pub fn contains(&self, identity: &DigestData) -> bool {
        if self.identity == *identity {
            return true;
        }
        match &self.parent {
            Some(parent) => parent.contains(identity),
            None => false,
        }
    }

    /// The labels from the root of the demand chain to this point.
    pub fn path(&self) -> Vec<String> {
        let mut labels = Vec::new();
        let mut current = Some(self);
        while let Some(stack) = current {
            labels.push(stack.label.clone());
            current = stack.parent.as_deref();
        }
        labels.reverse();
        labels
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::Digest;

    #[test]
    fn node_identity_depends_on_rule_and_inputs() {
        let a = NodeKey::new(0, "capture", vec![Value::new(Digest::empty())]);
        let b = NodeKey::new(0, "capture", vec![Value::new(Digest::empty())]);
        let c = NodeKey::new(0, "capture", vec![Value::new(Digest::of_bytes(b"x"))]);
        let d = NodeKey::new(1, "other_rule", vec![Value::new(Digest::empty())]);

        assert_eq!(a.identity, b.identity);
        assert_ne!(a.identity, c.identity);
        assert_ne!(a.identity, d.identity);
    }

    #[test]
    fn demand_stack_tracks_membership_and_path() {
        let k1 = NodeKey::new(0, "first", vec![]);
        let k2 = NodeKey::new(1, "second", vec![]);

        let stack = DemandStack::root(k1.identity, "first".into());
        let deeper = stack.push(k2.identity, "second".into());

        assert!(deeper.contains(&k1.identity));
        assert!(deeper.contains(&k2.identity));
        assert!(!stack.contains(&k2.identity));
        assert_eq!(deeper.path(), vec!["first", "second"]);
    }
}
