// Copyright 2025 the Foreman Project
// Licensed under the MIT License

//! Hermetic process requests and results.
//!
//! A [`ProcessRequest`] fully specifies an execution: if a field could change
//! what the process produces, it must be part of the canonical encoding that
//! yields the action digest, because that digest is the cache key shared by
//! every caching tier. Fields that only affect presentation (the description)
//! or scheduling (semaphore names, tolerated exit codes) are deliberately
//! excluded from the encoding.

use serde::{Deserialize, Serialize};
use sha2::Digest as _;
use std::{collections::BTreeMap, time::Duration};

use crate::digest::{Digest, DigestComputer, Digestible};
use crate::errors::Failure;
use crate::snapshot::Snapshot;
use crate::tree::validate_relative_path;

/// Bump whenever the canonical request encoding changes; stale action cache
/// entries become unreachable rather than wrong.
pub const PROCESS_WIRE_VERSION: u32 = 1;

/// How long a process result may be reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CacheScope {
    /// Cache across restarts; the default for pure tools.
    Always,
    /// Keep within the engine process lifetime; drop on restart.
    PerRestart,
    /// Keep within one user session.
    PerSession,
    /// Always execute, e.g. interactive runs.
    Never,
}

impl CacheScope {
    fn tag(&self) -> u8 {
        match self {
            CacheScope::Always => 0,
            CacheScope::PerRestart => 1,
            CacheScope::PerSession => 2,
            CacheScope::Never => 3,
        }
    }
}

/// Where a process is allowed to run. The local executor handles `Local`;
/// the other environments additionally make the request eligible for the
/// remote action cache.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionEnv {
    Local,
    Remote,
    Container(String),
}

impl ExecutionEnv {
    pub fn tag(&self) -> String {
        match self {
            ExecutionEnv::Local => "local".to_string(),
            ExecutionEnv::Remote => "remote".to_string(),
            ExecutionEnv::Container(image) => format!("container:{image}"),
        }
    }

    /// Whether results for this environment may be exchanged with a remote
    /// action cache.
    pub fn remote_eligible(&self) -> bool {
        !matches!(self, ExecutionEnv::Local)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProcessRequest {
    pub argv: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub input_digest: Digest,
    pub output_files: Vec<String>,
    pub output_dirs: Vec<String>,
    pub working_dir: Option<String>,
    pub timeout: Option<Duration>,
    pub cache_scope: CacheScope,
    pub execution_env: ExecutionEnv,

    /// Human-readable label for messages and failures; not part of identity.
    pub description: String,

    /// Exit codes the requesting rule tolerates; results outside this set
    /// surface as `ProcessFailed` and are never written to persistent caches.
    pub success_exit_codes: Vec<i32>,

    /// Named execution semaphores to hold while the process runs.
    pub resources: Vec<String>,
}

impl ProcessRequest {
    pub fn new(
        argv: Vec<String>,
        input_digest: Digest,
        description: impl Into<String>,
    ) -> Self {
        ProcessRequest {
            argv,
            env: BTreeMap::new(),
            input_digest,
            output_files: Vec::new(),
            output_dirs: Vec::new(),
            working_dir: None,
            timeout: None,
            cache_scope: CacheScope::Always,
            execution_env: ExecutionEnv::Local,
            description: description.into(),
            success_exit_codes: vec![0],
            resources: Vec::new(),
        }
    }

    pub fn env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn output_files(mut self, files: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.output_files = files.into_iter().map(Into::into).collect();
        self.output_files.sort();
        self.output_files.dedup();
        self
    }

    pub fn output_dirs(mut self, dirs: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.output_dirs = dirs.into_iter().map(Into::into).collect();
        self.output_dirs.sort();
        self.output_dirs.dedup();
        self
    }

    pub fn working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn cache_scope(mut self, scope: CacheScope) -> Self {
        self.cache_scope = scope;
        self
    }

    pub fn execution_env(mut self, env: ExecutionEnv) -> Self {
        self.execution_env = env;
        self
    }

    pub fn success_exit_codes(mut self, codes: impl IntoIterator<Item = i32>) -> Self {
        self.success_exit_codes = codes.into_iter().collect();
        self.success_exit_codes.sort_unstable();
        self.success_exit_codes.dedup();
        self
    }

    pub fn resources(mut self, resources: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.resources = resources.into_iter().map(Into::into).collect();
        // Canonical acquisition order prevents lock-order cycles.
        self.resources.sort();
        self.resources.dedup();
        self
    }

    /// Check structural invariants before the request enters the engine.
    pub fn validate(&self) -> Result<(), Failure> {
        let invalid = |message: String| Failure::MissingInput {
            message,
            origin: self.description.clone(),
        };

        if self.argv.is_empty() {
            return Err(invalid("process argv is empty".to_string()));
        }

        for path in self.output_files.iter().chain(&self.output_dirs) {
            validate_relative_path(path)
                .map_err(|e| invalid(format!("invalid output path: {e:#}")))?;
        }
        if let Some(dir) = &self.working_dir {
            validate_relative_path(dir)
                .map_err(|e| invalid(format!("invalid working directory: {e:#}")))?;
        }

        // Overlapping output directories have no defined materialization
        // order, so one being a prefix of another is rejected outright.
        for (i, a) in self.output_dirs.iter().enumerate() {
            for b in &self.output_dirs[i + 1..] {
                if b.starts_with(&format!("{a}/")) || a == b {
                    return Err(invalid(format!(
                        "output directory `{b}` overlaps output directory `{a}`"
                    )));
                }
            }
        }

        Ok(())
    }

    /// The canonical, deterministic encoding of everything that affects what
    /// this process can produce. The digest of this encoding is the action
    /// digest used as the cache key at every tier.
    pub fn canonical_encoding(&self) -> Vec<u8> {
        fn put_str(out: &mut Vec<u8>, s: &str) {
            out.extend((s.len() as u64).to_le_bytes());
            out.extend(s.as_bytes());
        }

        fn put_list(out: &mut Vec<u8>, items: &[String]) {
            out.extend((items.len() as u64).to_le_bytes());
            for item in items {
                put_str(out, item);
            }
        }

        let mut out = Vec::new();
        out.extend(PROCESS_WIRE_VERSION.to_le_bytes());

        put_list(&mut out, &self.argv);

        out.extend((self.env.len() as u64).to_le_bytes());
        for (k, v) in &self.env {
            put_str(&mut out, k);
            put_str(&mut out, v);
        }

        out.extend(self.input_digest.fingerprint);
        out.extend(self.input_digest.size_bytes.to_le_bytes());

        put_list(&mut out, &self.output_files);
        put_list(&mut out, &self.output_dirs);
        put_str(&mut out, self.working_dir.as_deref().unwrap_or(""));

        let timeout_ms = self
            .timeout
            .map(|t| t.as_millis().min(u128::from(u64::MAX)) as u64)
            .unwrap_or(u64::MAX);
        out.extend(timeout_ms.to_le_bytes());

        out.push(self.cache_scope.tag());
        put_str(&mut out, &self.execution_env.tag());

        out
    }

    /// The cache key for this request.
    pub fn action_digest(&self) -> Digest {
        Digest::of_bytes(&self.canonical_encoding())
    }

    /// A shell-like rendering for progress messages. Informational only.
    pub fn command_line(&self) -> String {
        self.argv
            .iter()
            .map(|a| {
                if a.contains(' ') {
                    format!("'{a}'")
                } else {
                    a.clone()
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl Digestible for ProcessRequest {
    fn update_digest(&self, dc: &mut DigestComputer) {
        // Identity for rule memoization matches the action digest exactly.
        dc.update(self.canonical_encoding());
    }
}

/// Which tier produced a result.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResultSource {
    Ran,
    MemoryCache,
    LocalCache,
    RemoteCache,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultMetadata {
    pub elapsed_ms: u64,
    pub source: ResultSource,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProcessResult {
    pub exit_code: i32,
    pub stdout: Digest,
    pub stderr: Digest,
    pub output: Snapshot,
    pub execution_env: ExecutionEnv,
    pub metadata: ResultMetadata,
}

impl Digestible for ProcessResult {
    fn update_digest(&self, dc: &mut DigestComputer) {
        self.exit_code.update_digest(dc);
        self.stdout.update_digest(dc);
        self.stderr.update_digest(dc);
        self.output.update_digest(dc);
        // Metadata (timing, cache tier) is observational and excluded.
    }
}
