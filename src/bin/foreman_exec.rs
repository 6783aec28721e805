// Copyright 2026 the Foreman Project
// Licensed under the MIT License

//! A debugging driver for the hermetic executor.
//!
//! Runs a single process request through the store and caching runner,
//! outside any rule graph: capture an input tree from the current workspace
//! (or name an existing digest), run the command, print its stdout/stderr,
//! and exit with its exit code.
//!
//!     foreman-exec --capture 'src/**' --output-file out.txt -- /usr/bin/tool --flag
//!
//! It does not perform `$PATH` lookup or shell expansion.

use clap::Parser;
use std::{collections::BTreeMap, path::PathBuf, process::exit, sync::Arc, time::Duration};
use tracing_subscriber::EnvFilter;

use anyhow::{anyhow, Context, Result};

use foreman::executor::{CachingRunner, LocalRunner, ProcessRunner, RunContext, Semaphores};
use foreman::snapshot::{capture_workspace, DigestMemo};
use foreman::{
    CacheScope, Digest, EngineConfig, KeepSandboxes, NoMatchPolicy, PathGlobs, ProcessRequest,
    Store,
};

#[derive(Debug, Parser)]
#[command(name = "foreman-exec")]
struct Args {
    /// Globs to capture from the workspace as the input tree.
    #[arg(long)]
    capture: Vec<String>,

    /// Fingerprint (hex) of an existing tree digest to use as the input.
    #[arg(long, conflicts_with = "capture")]
    input_digest: Option<String>,

    /// Byte size of the serialized tree named by --input-digest.
    #[arg(long, requires = "input_digest")]
    input_digest_size: Option<u64>,

    /// Environment variables for the process, as NAME=value.
    #[arg(long)]
    env: Vec<String>,

    /// Paths considered to be output files.
    #[arg(long)]
    output_file: Vec<String>,

    /// Paths considered to be output directories.
    #[arg(long)]
    output_dir: Vec<String>,

    /// Working directory, relative to the sandbox root.
    #[arg(long)]
    working_dir: Option<String>,

    /// Wall-clock timeout in seconds.
    #[arg(long)]
    timeout_secs: Option<u64>,

    /// Bypass every cache tier and always execute.
    #[arg(long)]
    no_cache: bool,

    /// Keep the sandbox around for inspection.
    #[arg(long)]
    keep_sandbox: bool,

    /// Materialize the captured output tree into this directory.
    #[arg(long)]
    materialize_to: Option<PathBuf>,

    /// The command to run.
    #[arg(last = true, required = true)]
    argv: Vec<String>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    match run(Args::parse()).await {
        Ok(code) => exit(code),
        Err(e) => {
            eprintln!("foreman-exec: {e:#}");
            exit(1);
        }
    }
}

async fn run(args: Args) -> Result<i32> {
    let mut config = EngineConfig::load(std::env::current_dir()?)?;
    if args.keep_sandbox {
        config.keep_sandboxes = KeepSandboxes::Always;
    }

    let store = Store::open(config.cache_root.clone()).map_err(|e| anyhow!("{e}"))?;
    let memo = DigestMemo::load(&config.cache_root);

    let input_digest = if !args.capture.is_empty() {
        let globs = PathGlobs::new(
            args.capture.clone(),
            Vec::<String>::new(),
            NoMatchPolicy::Error,
            "--capture",
        )
        .map_err(|e| anyhow!("{e}"))?;
        let snapshot = capture_workspace(
            &store,
            &memo,
            &config.workspace_root,
            &config.ignore,
            &globs,
            config.workers,
        )
        .await
        .map_err(|e| anyhow!("{e}"))?;
        eprintln!(
            "captured {} file(s) as {}",
            snapshot.files().len(),
            snapshot.digest
        );
        snapshot.digest
    } else if let Some(hex) = &args.input_digest {
        let size = args
            .input_digest_size
            .context("--input-digest-size is required with --input-digest")?;
        Digest::from_hex(hex, size)?
    } else {
        Digest::of_bytes(&foreman::tree::Tree::empty().canonical_bytes())
    };

    let env: BTreeMap<String, String> = args
        .env
        .iter()
        .map(|kv| {
            let mut parts = kv.splitn(2, '=');
            (
                parts.next().unwrap_or_default().to_string(),
                parts.next().unwrap_or_default().to_string(),
            )
        })
        .collect();

    let mut request = ProcessRequest::new(args.argv.clone(), input_digest, "foreman-exec")
        .env(env)
        .output_files(args.output_file.clone())
        .output_dirs(args.output_dir.clone());
    if let Some(dir) = &args.working_dir {
        request = request.working_dir(dir.clone());
    }
    if let Some(secs) = args.timeout_secs {
        request = request.timeout(Duration::from_secs(secs));
    }
    if args.no_cache {
        request = request.cache_scope(CacheScope::Never);
    }

    let work_root = config.cache_root.join("sandboxes");
    std::fs::create_dir_all(&work_root)?;
    let local = Arc::new(LocalRunner::new(
        store.clone(),
        work_root,
        config.keep_sandboxes,
        config.grace_period(),
        config.stderr_excerpt_limit,
    ));
    let semaphores = Arc::new(Semaphores::new(config.semaphores.clone(), config.workers));
    let runner = CachingRunner::new(local, store.clone(), semaphores, None);

    let result = runner
        .run(&request, &RunContext::default())
        .await
        .map_err(|e| anyhow!("{e}"))?;

    if let Some(dest) = &args.materialize_to {
        store
            .materialize(result.output.digest, dest)
            .await
            .map_err(|e| anyhow!("{e}"))?;
        eprintln!("materialized outputs to `{}`", dest.display());
    }

    if let Some(stdout) = store
        .load_blob(result.stdout)
        .await
        .map_err(|e| anyhow!("{e}"))?
    {
        print!("{}", String::from_utf8_lossy(&stdout));
    }
    if let Some(stderr) = store
        .load_blob(result.stderr)
        .await
        .map_err(|e| anyhow!("{e}"))?
    {
        eprint!("{}", String::from_utf8_lossy(&stderr));
    }

    eprintln!(
        "exit {} in {} ms (source: {:?}; output {})",
        result.exit_code,
        result.metadata.elapsed_ms,
        result.metadata.source,
        result.output.digest
    );

    Ok(result.exit_code)
}
