// Copyright 2025-2026 the Foreman Project
// Licensed under the MIT License

//! Hermetic process execution.
//!
//! The local runner materializes a request's input tree into a fresh sandbox
//! directory, scrubs the environment down to exactly the declared variables,
//! runs the command in its own process group, and captures the declared
//! outputs back into the store. Anything the process writes outside its
//! declared outputs stays in the sandbox and is destroyed with it.
//!
//! The caching runner wraps the local one with the three cache tiers: the
//! in-memory table, the local action cache in the store, and an optional
//! remote action cache. Reads short-circuit at the first hit; writes cascade
//! to every eligible tier.

use async_trait::async_trait;
use bytes::Bytes;
use std::{
    collections::{BTreeMap, HashMap},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};
use tokio::sync::{Semaphore, OwnedSemaphorePermit};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use anyhow::Result as AnyResult;

use crate::config::KeepSandboxes;
use crate::digest::Digest;
use crate::errors::Failure;
use crate::glob::{NoMatchPolicy, PathGlobs};
use crate::process::{
    CacheScope, ProcessRequest, ProcessResult, ResultMetadata, ResultSource,
};
use crate::snapshot::Snapshot;
use crate::store::{ActionRecord, Store};
use crate::tree::TreeEntry;

/// Ambient information for one execution: which session is asking, and the
/// token that cancels it.
#[derive(Clone, Debug)]
pub struct RunContext {
    pub session: u64,
    pub cancel: CancellationToken,
}

impl Default for RunContext {
    fn default() -> Self {
        RunContext {
            session: 0,
            cancel: CancellationToken::new(),
        }
    }
}

#[async_trait]
pub trait ProcessRunner: Send + Sync {
    async fn run(&self, req: &ProcessRequest, ctx: &RunContext) -> Result<ProcessResult, Failure>;
}

/// A remote action cache backend.
#[async_trait]
pub trait ActionCacheProvider: Send + Sync {
    async fn load(&self, action: Digest) -> AnyResult<Option<ActionRecord>>;
    async fn store(&self, action: Digest, record: &ActionRecord) -> AnyResult<()>;
    fn describe(&self) -> String;
}

/// Named execution semaphores. Acquisition order is canonical (lexicographic
/// by name), which combined with the acyclic rule graph rules out wait
/// cycles.
pub struct Semaphores {
    default_slots: usize,
    sizes: BTreeMap<String, usize>,
    map: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl Semaphores {
    pub fn new(sizes: BTreeMap<String, usize>, default_slots: usize) -> Self {
        Semaphores {
            default_slots: default_slots.max(1),
            sizes,
            map: Mutex::new(HashMap::new()),
        }
    }

    fn get(&self, name: &str) -> Arc<Semaphore> {
        let mut map = self.map.lock().unwrap();
        map.entry(name.to_string())
            .or_insert_with(|| {
                let slots = self.sizes.get(name).copied().unwrap_or(self.default_slots);
                Arc::new(Semaphore::new(slots.max(1)))
            })
            .clone()
    }

    /// Acquire every named semaphore, suspending as needed. `names` must be
    /// sorted; request construction guarantees that.
    pub async fn acquire(&self, names: &[String]) -> Result<Vec<OwnedSemaphorePermit>, Failure> {
        let mut permits = Vec::with_capacity(names.len());
        for name in names {
            let sem = self.get(name);
            let permit = sem
                .acquire_owned()
                .await
                .map_err(|_| Failure::Cancelled)?;
            permits.push(permit);
        }
        Ok(permits)
    }
}

/// Runs processes on the local machine, one fresh sandbox per execution.
pub struct LocalRunner {
    store: Store,
    work_root: PathBuf,
    keep_sandboxes: KeepSandboxes,
    grace_period: Duration,
    stderr_excerpt_limit: usize,
    spawned: AtomicU64,
}

impl LocalRunner {
    pub fn new(
        store: Store,
        work_root: PathBuf,
        keep_sandboxes: KeepSandboxes,
        grace_period: Duration,
        stderr_excerpt_limit: usize,
    ) -> Self {
        LocalRunner {
            store,
            work_root,
            keep_sandboxes,
            grace_period,
            stderr_excerpt_limit,
            spawned: AtomicU64::new(0),
        }
    }

    /// How many processes this runner has actually spawned. Cache hits do not
    /// move this counter.
    pub fn spawn_count(&self) -> u64 {
        self.spawned.load(Ordering::Relaxed)
    }

    async fn run_in_sandbox(
        &self,
        req: &ProcessRequest,
        ctx: &RunContext,
        sandbox: &Path,
    ) -> Result<ProcessResult, Failure> {
        let started = Instant::now();

        self.store.materialize(req.input_digest, sandbox).await?;

        // Tools expect to be able to create their declared outputs without
        // making directories first.
        for file in &req.output_files {
            if let Some(parent) = Path::new(file).parent() {
                if !parent.as_os_str().is_empty() {
                    tokio::fs::create_dir_all(sandbox.join(parent)).await.map_err(|e| {
                        Failure::store(format!("failed to prepare output directory: {e}"))
                    })?;
                }
            }
        }
        for dir in &req.output_dirs {
            tokio::fs::create_dir_all(sandbox.join(dir))
                .await
                .map_err(|e| Failure::store(format!("failed to prepare output directory: {e}")))?;
        }

        let cwd = match &req.working_dir {
            Some(dir) => sandbox.join(dir),
            None => sandbox.to_path_buf(),
        };

        let mut cmd = tokio::process::Command::new(&req.argv[0]);
        cmd.args(&req.argv[1..])
            .env_clear()
            .envs(&req.env)
            .current_dir(&cwd)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        // Give the child its own process group so that cancellation can tear
        // down anything it spawned as well.
        #[cfg(unix)]
        unsafe {
            cmd.pre_exec(|| {
                libc::setpgid(0, 0);
                Ok(())
            });
        }

        let mut child = cmd.spawn().map_err(|e| Failure::MissingInput {
            message: format!("failed to spawn `{}`: {e}", req.argv[0]),
            origin: req.description.clone(),
        })?;
        self.spawned.fetch_add(1, Ordering::Relaxed);
        let pid = child.id();

        let mut stdout_pipe = child.stdout.take().expect("stdout was piped");
        let mut stderr_pipe = child.stderr.take().expect("stderr was piped");
        let stdout_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            use tokio::io::AsyncReadExt;
            let _ = stdout_pipe.read_to_end(&mut buf).await;
            buf
        });
        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            use tokio::io::AsyncReadExt;
            let _ = stderr_pipe.read_to_end(&mut buf).await;
            buf
        });

        let deadline = async {
            match req.timeout {
                Some(t) => tokio::time::sleep(t).await,
                None => futures::future::pending().await,
            }
        };

        let status = tokio::select! {
            status = child.wait() => status.map_err(|e| {
                Failure::store(format!("failed to wait for `{}`: {e}", req.argv[0]))
            })?,

            _ = deadline => {
                self.kill_group(pid, &mut child).await;
                return Err(Failure::ProcessTimeout {
                    description: req.description.clone(),
                    timeout_ms: req.timeout.map(|t| t.as_millis() as u64).unwrap_or(0),
                });
            }

            _ = ctx.cancel.cancelled() => {
                self.kill_group(pid, &mut child).await;
                return Err(Failure::Cancelled);
            }
        };

        let stdout_bytes = stdout_task.await.unwrap_or_default();
        let stderr_bytes = stderr_task.await.unwrap_or_default();

        let exit_code = exit_code_of(&status);
        let stdout = self.store.store_blob(Bytes::from(stdout_bytes)).await?;
        let stderr_blob = self.store.store_blob(Bytes::from(stderr_bytes.clone())).await?;

        let output = self.capture_outputs(req, sandbox).await?;

        let elapsed_ms = started.elapsed().as_millis() as u64;
        debug!(
            description = %req.description,
            exit_code,
            elapsed_ms,
            "process finished"
        );

        if !req.success_exit_codes.contains(&exit_code) {
            let mut excerpt = String::from_utf8_lossy(&stderr_bytes).into_owned();
            if excerpt.len() > self.stderr_excerpt_limit {
                let mut cut = self.stderr_excerpt_limit;
                while !excerpt.is_char_boundary(cut) {
                    cut -= 1;
                }
                excerpt.truncate(cut);
                excerpt.push_str("\n[... stderr truncated ...]");
            }
            return Err(Failure::ProcessFailed {
                description: req.description.clone(),
                exit_code,
                stdout,
                stderr: stderr_blob,
                stderr_excerpt: excerpt,
            });
        }

        Ok(ProcessResult {
            exit_code,
            stdout,
            stderr: stderr_blob,
            output,
            execution_env: req.execution_env.clone(),
            metadata: ResultMetadata {
                elapsed_ms,
                source: ResultSource::Ran,
            },
        })
    }

    async fn kill_group(&self, pid: Option<u32>, child: &mut tokio::process::Child) {
        #[cfg(unix)]
        if let Some(pid) = pid {
            unsafe {
                libc::kill(-(pid as i32), libc::SIGTERM);
            }
            tokio::time::sleep(self.grace_period).await;
            unsafe {
                libc::kill(-(pid as i32), libc::SIGKILL);
            }
        }
        let _ = child.kill().await;
        let _ = child.wait().await;
    }

    /// Collect the declared outputs from the sandbox into a snapshot.
    /// Undeclared files are simply not captured.
    async fn capture_outputs(
        &self,
        req: &ProcessRequest,
        sandbox: &Path,
    ) -> Result<Snapshot, Failure> {
        if req.output_files.is_empty() && req.output_dirs.is_empty() {
            return Ok(Snapshot::empty());
        }

        let mut patterns: Vec<String> = req.output_files.clone();
        for dir in &req.output_dirs {
            patterns.push(dir.clone());
            patterns.push(format!("{dir}/**"));
        }
        let globs = PathGlobs::new(
            patterns,
            Vec::<String>::new(),
            NoMatchPolicy::Ignore,
            req.description.clone(),
        )?;

        let mut files: BTreeMap<String, TreeEntry> = BTreeMap::new();

        for entry in walkdir::WalkDir::new(sandbox).follow_links(false) {
            let entry =
                entry.map_err(|e| Failure::store(format!("error scanning sandbox: {e}")))?;
            let rel = entry
                .path()
                .strip_prefix(sandbox)
                .unwrap_or(entry.path())
                .to_string_lossy()
                .to_string();
            if rel.is_empty() || !globs.matches(&rel) {
                continue;
            }

            if entry.path_is_symlink() {
                let target = std::fs::read_link(entry.path()).map_err(|e| {
                    Failure::store(format!("failed to read output symlink `{rel}`: {e}"))
                })?;
                files.insert(
                    rel,
                    TreeEntry::Symlink {
                        target: target.to_string_lossy().to_string(),
                    },
                );
                continue;
            }

            if !entry.file_type().is_file() {
                continue;
            }

            let bytes = tokio::fs::read(entry.path())
                .await
                .map_err(|e| Failure::store(format!("failed to read output `{rel}`: {e}")))?;
            let executable = {
                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    entry
                        .metadata()
                        .map(|m| m.permissions().mode() & 0o111 != 0)
                        .unwrap_or(false)
                }
                #[cfg(not(unix))]
                false
            };
            let digest = self.store.store_blob(Bytes::from(bytes)).await?;
            files.insert(rel, TreeEntry::File { digest, executable });
        }

        let digest = self.store.store_file_tree(&files).await?;
        Snapshot::from_digest(&self.store, digest).await
    }
}

#[cfg(unix)]
fn exit_code_of(status: &std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .unwrap_or_else(|| status.signal().map(|s| -s).unwrap_or(-1))
}

#[cfg(not(unix))]
fn exit_code_of(status: &std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

#[async_trait]
impl ProcessRunner for LocalRunner {
    async fn run(&self, req: &ProcessRequest, ctx: &RunContext) -> Result<ProcessResult, Failure> {
        req.validate()?;

        let sandbox = tempfile::Builder::new()
            .prefix("foreman-sandbox-")
            .tempdir_in(&self.work_root)
            .map_err(|e| Failure::store(format!("failed to create sandbox: {e}")))?;

        let result = self.run_in_sandbox(req, ctx, sandbox.path()).await;

        let keep = match self.keep_sandboxes {
            KeepSandboxes::Always => true,
            KeepSandboxes::Never => false,
            KeepSandboxes::OnFailure => result.is_err(),
        };
        if keep {
            let path = sandbox.keep();
            info!(
                description = %req.description,
                "preserved sandbox at `{}`",
                path.display()
            );
        }

        result
    }
}

struct MemoryEntry {
    result: ProcessResult,
    scope: CacheScope,
    session: u64,
}

/// The tiered caching wrapper around a concrete runner.
pub struct CachingRunner {
    inner: Arc<LocalRunner>,
    store: Store,
    semaphores: Arc<Semaphores>,
    remote: Option<Arc<dyn ActionCacheProvider>>,
    memory: Mutex<HashMap<Digest, MemoryEntry>>,
}

impl CachingRunner {
    pub fn new(
        inner: Arc<LocalRunner>,
        store: Store,
        semaphores: Arc<Semaphores>,
        remote: Option<Arc<dyn ActionCacheProvider>>,
    ) -> Self {
        CachingRunner {
            inner,
            store,
            semaphores,
            remote,
            memory: Mutex::new(HashMap::new()),
        }
    }

    pub fn local_runner(&self) -> &LocalRunner {
        &self.inner
    }

    /// Drop cache entries scoped to a finished session.
    pub fn end_session(&self, session: u64) {
        self.memory
            .lock()
            .unwrap()
            .retain(|_, e| !(e.scope == CacheScope::PerSession && e.session == session));
    }

    fn memory_hit(&self, action: Digest, ctx: &RunContext) -> Option<ProcessResult> {
        let memory = self.memory.lock().unwrap();
        let entry = memory.get(&action)?;
        if entry.scope == CacheScope::PerSession && entry.session != ctx.session {
            return None;
        }
        let mut result = entry.result.clone();
        result.metadata.source = ResultSource::MemoryCache;
        Some(result)
    }

    async fn rehydrate(
        &self,
        record: &ActionRecord,
        req: &ProcessRequest,
        source: ResultSource,
    ) -> Result<Option<ProcessResult>, Failure> {
        // A swept store can hold an action record whose trees are gone;
        // treat that as a miss rather than an error.
        let output = match self.store.load_tree(record.output).await? {
            Some(_) => Snapshot::from_digest(&self.store, record.output).await?,
            None => return Ok(None),
        };

        Ok(Some(ProcessResult {
            exit_code: record.exit_code,
            stdout: record.stdout,
            stderr: record.stderr,
            output,
            execution_env: req.execution_env.clone(),
            metadata: ResultMetadata {
                elapsed_ms: record.elapsed_ms,
                source,
            },
        }))
    }

    fn record_of(result: &ProcessResult) -> ActionRecord {
        ActionRecord {
            exit_code: result.exit_code,
            stdout: result.stdout,
            stderr: result.stderr,
            output: result.output.digest,
            execution_env: result.execution_env.tag(),
            elapsed_ms: result.metadata.elapsed_ms,
        }
    }
}

#[async_trait]
impl ProcessRunner for CachingRunner {
    async fn run(&self, req: &ProcessRequest, ctx: &RunContext) -> Result<ProcessResult, Failure> {
        req.validate()?;

        if req.cache_scope == CacheScope::Never {
            let _permits = self.semaphores.acquire(&req.resources).await?;
            return self.inner.run(req, ctx).await;
        }

        let action = req.action_digest();

        if let Some(hit) = self.memory_hit(action, ctx) {
            debug!(description = %req.description, "memory cache hit for {action}");
            return Ok(hit);
        }

        if req.cache_scope == CacheScope::Always {
            if let Some(record) = self.store.load_action(action).await? {
                if let Some(result) = self.rehydrate(&record, req, ResultSource::LocalCache).await? {
                    self.memory.lock().unwrap().insert(
                        action,
                        MemoryEntry {
                            result: result.clone(),
                            scope: req.cache_scope,
                            session: ctx.session,
                        },
                    );
                    return Ok(result);
                }
            }

            if req.execution_env.remote_eligible() {
                if let Some(remote) = &self.remote {
                    match remote.load(action).await {
                        Ok(Some(record)) => {
                            if let Some(result) =
                                self.rehydrate(&record, req, ResultSource::RemoteCache).await?
                            {
                                self.store.record_action(action, &record).await?;
                                return Ok(result);
                            }
                        }
                        Ok(None) => {}
                        Err(e) => {
                            // A flaky remote cache degrades to a miss.
                            warn!("remote action cache lookup failed: {e:#}");
                        }
                    }
                }
            }
        }

        let _permits = self.semaphores.acquire(&req.resources).await?;
        let result = self.inner.run(req, ctx).await?;

        self.memory.lock().unwrap().insert(
            action,
            MemoryEntry {
                result: result.clone(),
                scope: req.cache_scope,
                session: ctx.session,
            },
        );

        if req.cache_scope == CacheScope::Always {
            let record = Self::record_of(&result);
            self.store.record_action(action, &record).await?;

            if req.execution_env.remote_eligible() {
                if let Some(remote) = self.remote.clone() {
                    // Best-effort background push; evaluation never waits on it.
                    tokio::spawn(async move {
                        if let Err(e) = remote.store(action, &record).await {
                            debug!("remote action cache push failed: {e:#}");
                        }
                    });
                }
            }
        }

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runners(keep: KeepSandboxes) -> (tempfile::TempDir, Arc<LocalRunner>, CachingRunner) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("cache")).unwrap();
        let work = dir.path().join("work");
        std::fs::create_dir_all(&work).unwrap();
        let local = Arc::new(LocalRunner::new(
            store.clone(),
            work,
            keep,
            Duration::from_millis(100),
            8192,
        ));
        let semaphores = Arc::new(Semaphores::new(BTreeMap::new(), 4));
        let caching = CachingRunner::new(local.clone(), store, semaphores, None);
        (dir, local, caching)
    }

    fn echo_request() -> ProcessRequest {
        ProcessRequest::new(
            vec!["/bin/echo".into(), "hi".into()],
            Digest::empty(),
            "echo hi",
        )
    }

    #[tokio::test]
    async fn runs_a_process_and_captures_streams() {
        let (_dir, local, _caching) = runners(KeepSandboxes::Never);
        let result = local
            .run(&echo_request(), &RunContext::default())
            .await
            .unwrap();

        assert_eq!(result.exit_code, 0);
        assert_eq!(
            local.store.load_blob(result.stdout).await.unwrap().unwrap(),
            Bytes::from_static(b"hi\n")
        );
        assert!(result.output.is_empty());
    }

    #[tokio::test]
    async fn second_identical_request_hits_the_cache() {
        let (_dir, local, caching) = runners(KeepSandboxes::Never);
        let ctx = RunContext::default();

        let first = caching.run(&echo_request(), &ctx).await.unwrap();
        assert_eq!(first.metadata.source, ResultSource::Ran);

        let second = caching.run(&echo_request(), &ctx).await.unwrap();
        assert_eq!(second.metadata.source, ResultSource::MemoryCache);
        assert_eq!(second.exit_code, 0);

        // The defining property: one spawn across the pair.
        assert_eq!(local.spawn_count(), 1);
    }

    #[tokio::test]
    async fn local_action_cache_survives_a_fresh_memory_tier() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("cache")).unwrap();
        let work = dir.path().join("work");
        std::fs::create_dir_all(&work).unwrap();

        let make = |store: Store, work: PathBuf| {
            let local = Arc::new(LocalRunner::new(
                store.clone(),
                work,
                KeepSandboxes::Never,
                Duration::from_millis(100),
                8192,
            ));
            let semaphores = Arc::new(Semaphores::new(BTreeMap::new(), 4));
            (
                local.clone(),
                CachingRunner::new(local, store, semaphores, None),
            )
        };

        let ctx = RunContext::default();
        let (local1, caching1) = make(store.clone(), work.clone());
        caching1.run(&echo_request(), &ctx).await.unwrap();
        assert_eq!(local1.spawn_count(), 1);

        // A "restarted" runner sharing the same store: disk tier hit.
        let (local2, caching2) = make(store, work);
        let result = caching2.run(&echo_request(), &ctx).await.unwrap();
        assert_eq!(result.metadata.source, ResultSource::LocalCache);
        assert_eq!(local2.spawn_count(), 0);
    }

    #[tokio::test]
    async fn cache_scope_never_always_executes() {
        let (_dir, local, caching) = runners(KeepSandboxes::Never);
        let ctx = RunContext::default();
        let req = echo_request().cache_scope(CacheScope::Never);

        caching.run(&req, &ctx).await.unwrap();
        caching.run(&req, &ctx).await.unwrap();
        assert_eq!(local.spawn_count(), 2);
    }

    #[tokio::test]
    async fn per_session_results_are_not_shared_across_sessions() {
        let (_dir, local, caching) = runners(KeepSandboxes::Never);
        let req = echo_request().cache_scope(CacheScope::PerSession);

        let ctx1 = RunContext {
            session: 1,
            cancel: CancellationToken::new(),
        };
        let ctx2 = RunContext {
            session: 2,
            cancel: CancellationToken::new(),
        };

        caching.run(&req, &ctx1).await.unwrap();
        caching.run(&req, &ctx1).await.unwrap();
        assert_eq!(local.spawn_count(), 1);

        caching.run(&req, &ctx2).await.unwrap();
        assert_eq!(local.spawn_count(), 2);

        caching.end_session(2);
        caching.run(&req, &ctx2).await.unwrap();
        assert_eq!(local.spawn_count(), 3);
    }

    #[tokio::test]
    async fn declared_outputs_are_captured_and_undeclared_discarded() {
        let (_dir, local, _caching) = runners(KeepSandboxes::Never);
        let req = ProcessRequest::new(
            vec![
                "/bin/sh".into(),
                "-c".into(),
                "echo wanted > out/result.txt; echo stray > stray.txt".into(),
            ],
            Digest::empty(),
            "write outputs",
        )
        .output_dirs(["out"]);

        let result = local.run(&req, &RunContext::default()).await.unwrap();
        assert_eq!(result.output.files(), &["out/result.txt"]);
    }

    #[tokio::test]
    async fn input_tree_is_materialized_and_env_scrubbed() {
        let (_dir, local, _caching) = runners(KeepSandboxes::Never);
        let store = &local.store;

        let blob = store
            .store_blob(Bytes::from_static(b"from input\n"))
            .await
            .unwrap();
        let mut files = BTreeMap::new();
        files.insert(
            "data/in.txt".to_string(),
            TreeEntry::File {
                digest: blob,
                executable: false,
            },
        );
        let input = store.store_file_tree(&files).await.unwrap();

        let mut env = BTreeMap::new();
        env.insert("ONLY_VAR".to_string(), "present".to_string());

        let req = ProcessRequest::new(
            vec!["/bin/sh".into(), "-c".into(), "cat data/in.txt; env".into()],
            input,
            "inspect sandbox",
        )
        .env(env);

        let result = local.run(&req, &RunContext::default()).await.unwrap();
        let stdout = store.load_blob(result.stdout).await.unwrap().unwrap();
        let text = String::from_utf8_lossy(&stdout);
        assert!(text.contains("from input"));
        assert!(text.contains("ONLY_VAR=present"));
        // A scrubbed environment has nothing inherited from the test runner.
        assert!(!text.contains("CARGO"));
    }

    #[tokio::test]
    async fn nonzero_exit_is_a_process_failed_failure() {
        let (_dir, local, _caching) = runners(KeepSandboxes::Never);
        let req = ProcessRequest::new(
            vec!["/bin/sh".into(), "-c".into(), "echo boom >&2; exit 3".into()],
            Digest::empty(),
            "failing tool",
        );

        match local.run(&req, &RunContext::default()).await {
            Err(Failure::ProcessFailed {
                exit_code,
                stderr_excerpt,
                ..
            }) => {
                assert_eq!(exit_code, 3);
                assert!(stderr_excerpt.contains("boom"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn tolerated_exit_codes_produce_results() {
        let (_dir, local, _caching) = runners(KeepSandboxes::Never);
        let req = ProcessRequest::new(
            vec!["/bin/sh".into(), "-c".into(), "exit 3".into()],
            Digest::empty(),
            "tolerated failure",
        )
        .success_exit_codes([0, 3]);

        let result = local.run(&req, &RunContext::default()).await.unwrap();
        assert_eq!(result.exit_code, 3);
    }

    #[tokio::test]
    async fn timeout_kills_the_process() {
        let (_dir, local, _caching) = runners(KeepSandboxes::Never);
        let req = ProcessRequest::new(
            vec!["/bin/sleep".into(), "30".into()],
            Digest::empty(),
            "sleepy",
        )
        .timeout(Duration::from_millis(200));

        let started = Instant::now();
        match local.run(&req, &RunContext::default()).await {
            Err(Failure::ProcessTimeout { timeout_ms, .. }) => assert_eq!(timeout_ms, 200),
            other => panic!("unexpected: {other:?}"),
        }
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn cancellation_kills_the_process() {
        let (_dir, local, _caching) = runners(KeepSandboxes::Never);
        let req = ProcessRequest::new(
            vec!["/bin/sleep".into(), "30".into()],
            Digest::empty(),
            "sleepy",
        );

        let ctx = RunContext::default();
        let cancel = ctx.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel.cancel();
        });

        match local.run(&req, &ctx).await {
            Err(Failure::Cancelled) => {}
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn named_semaphores_serialize_execution() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("cache")).unwrap();
        let work = dir.path().join("work");
        std::fs::create_dir_all(&work).unwrap();

        let local = Arc::new(LocalRunner::new(
            store.clone(),
            work,
            KeepSandboxes::Never,
            Duration::from_millis(100),
            8192,
        ));
        let mut sizes = BTreeMap::new();
        sizes.insert("exclusive".to_string(), 1);
        let semaphores = Arc::new(Semaphores::new(sizes, 8));
        let caching = Arc::new(CachingRunner::new(local, store, semaphores, None));

        let req = |tag: &str| {
            ProcessRequest::new(
                vec!["/bin/sleep".into(), "0.2".into()],
                Digest::empty(),
                format!("sleep {tag}"),
            )
            .cache_scope(CacheScope::Never)
            .resources(["exclusive"])
        };

        let started = Instant::now();
        let a = {
            let caching = caching.clone();
            let req = req("a");
            tokio::spawn(async move { caching.run(&req, &RunContext::default()).await })
        };
        let b = {
            let caching = caching.clone();
            let req = req("b");
            tokio::spawn(async move { caching.run(&req, &RunContext::default()).await })
        };

        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        // One slot: the sleeps cannot overlap.
        assert!(started.elapsed() >= Duration::from_millis(400));
    }

    #[tokio::test]
    async fn sandboxes_are_destroyed_by_default() {
        let (dir, local, _caching) = runners(KeepSandboxes::Never);
        local
            .run(&echo_request(), &RunContext::default())
            .await
            .unwrap();

        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("work"))
            .unwrap()
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn on_failure_keeps_the_failed_sandbox() {
        let (dir, local, _caching) = runners(KeepSandboxes::OnFailure);

        local
            .run(&echo_request(), &RunContext::default())
            .await
            .unwrap();
        assert!(std::fs::read_dir(dir.path().join("work"))
            .unwrap()
            .next()
            .is_none());

        let failing = ProcessRequest::new(
            vec!["/bin/sh".into(), "-c".into(), "exit 1".into()],
            Digest::empty(),
            "fails",
        );
        let _ = local.run(&failing, &RunContext::default()).await;
        assert!(std::fs::read_dir(dir.path().join("work"))
            .unwrap()
            .next()
            .is_some());
    }
}
