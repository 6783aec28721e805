// Copyright 2025 the Foreman Project
// Licensed under the MIT License

//! Engine configuration.
//!
//! A read-only [`EngineConfig`] is assembled once per engine from defaults,
//! an optional `foreman.toml` at the workspace root, and whatever the
//! embedding tool overrides programmatically. Rules see the configuration as
//! an ordinary input value through the rule graph, so anything that consults
//! it is automatically part of node identity.

use serde::Deserialize;
use std::{
    collections::BTreeMap,
    env, fs,
    io::ErrorKind,
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use anyhow::{bail, Context, Result};

use sha2::Digest as _;

use crate::digest::{DigestComputer, Digestible};

/// Name of the optional config file at the workspace root.
const CONFIG_FILE: &str = "foreman.toml";

/// Whether execution sandboxes are retained after a process finishes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KeepSandboxes {
    Always,
    #[default]
    Never,
    OnFailure,
}

impl FromStr for KeepSandboxes {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "always" => Ok(KeepSandboxes::Always),
            "never" => Ok(KeepSandboxes::Never),
            "on-failure" => Ok(KeepSandboxes::OnFailure),
            other => bail!("unknown keep-sandboxes value `{other}`"),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct EngineConfig {
    /// The project root whose files workspace captures read.
    pub workspace_root: PathBuf,

    /// Root of all persisted engine state (blobs, trees, action records).
    pub cache_root: PathBuf,

    /// Bound on concurrently executing leaf work (file ingestion, processes).
    pub workers: usize,

    /// Patterns never picked up by workspace captures, e.g. VCS metadata and
    /// our own cache directory.
    pub ignore: Vec<String>,

    pub keep_sandboxes: KeepSandboxes,

    /// Milliseconds between SIGTERM and SIGKILL when tearing down a process
    /// group on cancellation or timeout.
    pub grace_period_ms: u64,

    /// Default fail-fast policy for new sessions.
    pub fail_fast: bool,

    /// Largest stderr excerpt embedded in a ProcessFailed message; the full
    /// stream is always stored.
    pub stderr_excerpt_limit: usize,

    /// Sizes for named execution semaphores; a process that names a semaphore
    /// not listed here gets a slot count equal to `workers`.
    pub semaphores: BTreeMap<String, usize>,

    /// Remote CAS endpoint, if any.
    pub remote_store: Option<String>,

    /// Remote action cache endpoint, if any.
    pub remote_cache: Option<String>,

    /// Age in days past which unpinned store entries are eligible for sweep.
    pub gc_max_age_days: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let workspace_root = env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        EngineConfig {
            cache_root: workspace_root.join(".foreman"),
            workspace_root,
            workers: num_cpus::get(),
            ignore: vec![".git/**".to_string(), ".foreman/**".to_string()],
            keep_sandboxes: KeepSandboxes::Never,
            grace_period_ms: 500,
            fail_fast: true,
            stderr_excerpt_limit: 8192,
            semaphores: BTreeMap::new(),
            remote_store: None,
            remote_cache: None,
            gc_max_age_days: 14,
        }
    }
}

impl EngineConfig {
    /// Load the configuration for a workspace, merging `foreman.toml` over
    /// the defaults if it exists.
    pub fn load(workspace_root: impl Into<PathBuf>) -> Result<Self> {
        let workspace_root = workspace_root.into();
        let path = workspace_root.join(CONFIG_FILE);

        let mut config = match fs::read_to_string(&path) {
            Ok(text) => toml::from_str::<EngineConfig>(&text)
                .with_context(|| format!("failed to parse `{}`", path.display()))?,
            Err(ref e) if e.kind() == ErrorKind::NotFound => EngineConfig::default(),
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read `{}`", path.display()))
            }
        };

        config.cache_root = workspace_root.join(".foreman");
        config.workspace_root = workspace_root;

        if config.workers == 0 {
            config.workers = num_cpus::get();
        }

        Ok(config)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn gc_max_age(&self) -> Duration {
        Duration::from_secs(self.gc_max_age_days * 24 * 60 * 60)
    }
}

impl Digestible for EngineConfig {
    fn update_digest(&self, dc: &mut DigestComputer) {
        // Paths are intentionally excluded: relocating a workspace or cache
        // does not change what rules compute.
        self.workers.update_digest(dc);
        self.ignore.update_digest(dc);
        dc.update([match self.keep_sandboxes {
            KeepSandboxes::Always => 0u8,
            KeepSandboxes::Never => 1,
            KeepSandboxes::OnFailure => 2,
        }]);
        self.grace_period_ms.update_digest(dc);
        self.fail_fast.update_digest(dc);
        self.stderr_excerpt_limit.update_digest(dc);
        self.semaphores.update_digest(dc);
        self.remote_store.update_digest(dc);
        self.remote_cache.update_digest(dc);
        self.gc_max_age_days.update_digest(dc);
    }
}
