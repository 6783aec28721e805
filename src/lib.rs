// Copyright 2025-2026 the Foreman Project
// Licensed under the MIT License

//! The foreman execution engine.
//!
//! Foreman is the core of a polyglot build orchestrator: a demand-driven,
//! memoizing evaluator over a statically validated graph of typed rules,
//! backed by a content-addressed file store and a hermetic process executor.
//!
//! The pieces, leaves first:
//!
//! - [`digest`] and [`store`]: content-addressed blobs and trees, keyed by
//!   SHA-256 digests, persisted under a sharded cache root with an optional
//!   remote backend.
//! - [`snapshot`] and [`glob`]: immutable file trees as values, with merge,
//!   prefix, subset, and workspace-capture operations.
//! - [`process`] and [`executor`]: fully specified process requests executed
//!   in fresh sandboxes, with results cached by action digest across three
//!   tiers.
//! - [`rules`], [`graph`], [`nodes`], [`scheduler`], and [`session`]: the
//!   typed rule registry, its startup validation into a dispatch table, and
//!   the cooperative evaluator that runs it all.
//! - [`intrinsics`]: the file-system and process primitives exposed to rules
//!   as ordinary typed demands.
//! - [`watch`]: debounced filesystem watching feeding invalidation.
//!
//! A minimal embedding registers rules and queries, builds a [`Scheduler`],
//! and drives it through [`Session`]s:
//!
//! ```no_run
//! use foreman::{EngineConfig, RuleRegistry, Scheduler};
//!
//! # fn main() -> Result<(), foreman::Failure> {
//! let config = EngineConfig::load(".").map_err(foreman::Failure::from)?;
//! let registry = RuleRegistry::new();
//! let scheduler = Scheduler::new(config, registry)?;
//! let _session = scheduler.session();
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod digest;
pub mod errors;
pub mod executor;
pub mod glob;
pub mod graph;
pub mod intrinsics;
pub mod messages;
pub mod nodes;
pub mod process;
pub mod rules;
pub mod scheduler;
pub mod session;
pub mod snapshot;
pub mod store;
pub mod tree;
pub mod watch;

pub use config::{EngineConfig, KeepSandboxes};
pub use digest::{Digest, DigestComputer, DigestData, Digestible};
pub use errors::Failure;
pub use glob::{NoMatchPolicy, PathGlobs};
pub use process::{CacheScope, ExecutionEnv, ProcessRequest, ProcessResult};
pub use rules::{Query, Rule, RuleRegistry, TypeKey, Value, ValueCodec};
pub use scheduler::{Context, Scheduler};
pub use session::Session;
pub use snapshot::{Snapshot, SnapshotOps};
pub use store::Store;
pub use watch::InvalidationWatcher;
