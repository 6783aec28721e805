// Copyright 2026 the Foreman Project
// Licensed under the MIT License

//! Filesystem watching for invalidation.
//!
//! A debounced watcher monitors the workspace root (plus any paths sessions
//! asked for) and translates change events into scheduler invalidations.
//! Events are reported by link identity: a change to a symlink invalidates
//! the link path, not its target.

use notify_debouncer_mini::{
    new_debouncer,
    notify::{RecommendedWatcher, RecursiveMode},
    DebounceEventHandler, DebounceEventResult, Debouncer,
};
use std::{path::{Path, PathBuf}, time::Duration};
use tracing::{debug, warn};

use anyhow::{Context as _, Result};

use crate::scheduler::Scheduler;

const DEBOUNCE_WINDOW: Duration = Duration::from_millis(250);

struct InvalidationHandler {
    scheduler: Scheduler,
    root: PathBuf,
}

impl DebounceEventHandler for InvalidationHandler {
    fn handle_event(&mut self, event: DebounceEventResult) {
        match event {
            Ok(events) => {
                let paths: Vec<String> = events
                    .iter()
                    .filter_map(|e| {
                        e.path
                            .strip_prefix(&self.root)
                            .ok()
                            .map(|rel| rel.to_string_lossy().to_string())
                    })
                    .filter(|rel| !rel.is_empty())
                    .collect();

                if !paths.is_empty() {
                    let reset = self.scheduler.invalidate_paths(&paths);
                    debug!(changed = paths.len(), reset, "filesystem change observed");
                }
            }

            Err(errors) => {
                for e in errors {
                    warn!("filesystem watch error: {e}");
                }
            }
        }
    }
}

/// Watches the workspace and keeps the scheduler's memo tables honest.
pub struct InvalidationWatcher {
    debouncer: Debouncer<RecommendedWatcher>,
}

impl InvalidationWatcher {
    /// Start watching the scheduler's workspace root recursively, plus every
    /// path sessions have registered so far.
    pub fn start(scheduler: Scheduler) -> Result<InvalidationWatcher> {
        let root = scheduler.config().workspace_root.clone();
        let watched = scheduler.watched_paths();

        let handler = InvalidationHandler {
            scheduler,
            root: root.clone(),
        };

        let mut debouncer = new_debouncer(DEBOUNCE_WINDOW, None, handler)
            .context("failed to initialize the filesystem watcher")?;

        debouncer
            .watcher()
            .watch(&root, RecursiveMode::Recursive)
            .with_context(|| format!("failed to watch `{}`", root.display()))?;

        let mut watcher = InvalidationWatcher { debouncer };
        for path in watched {
            let full = root.join(&path);
            if let Err(e) = watcher.watch(&full) {
                warn!("failed to watch `{path}`: {e:#}");
            }
        }

        Ok(watcher)
    }

    /// Watch an additional path, e.g. one outside the workspace root that a
    /// session declared it reads.
    pub fn watch(&mut self, path: &Path) -> Result<()> {
        self.debouncer
            .watcher()
            .watch(path, RecursiveMode::NonRecursive)
            .with_context(|| format!("failed to watch `{}`", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::digest::{DigestComputer, Digestible};
    use crate::errors::Failure;
    use crate::rules::{Query, Rule, RuleRegistry, TypeKey, Value};

    #[derive(Debug, Clone, PartialEq)]
    struct FileName(String);

    impl Digestible for FileName {
        fn update_digest(&self, dc: &mut DigestComputer) {
            self.0.update_digest(dc);
        }
    }

    #[derive(Debug, Clone, PartialEq)]
    struct FileText(String);

    impl Digestible for FileText {
        fn update_digest(&self, dc: &mut DigestComputer) {
            self.0.update_digest(dc);
        }
    }

    // End-to-end: modifying a watched file makes the same demand return the
    // new content without a restart.
    #[tokio::test]
    async fn watcher_invalidation_recomputes_demands() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("input.txt"), "before").unwrap();

        let mut registry = RuleRegistry::new();
        registry.register(Rule::new::<FileText>("read_file").param::<FileName>().body(
            |ctx| async move {
                let name = ctx.param::<FileName>()?;
                let path = ctx.config().workspace_root.join(&name.0);
                let content = std::fs::read_to_string(&path)
                    .map_err(|e| Failure::missing_input(e.to_string(), "read_file"))?;
                ctx.record_file_deps([name.0.as_str()]);
                Ok(Value::new(FileText(content)))
            },
        ));
        registry.register_query(Query::new::<FileText>([TypeKey::of::<FileName>()]));

        let mut config = EngineConfig::default();
        config.workspace_root = dir.path().to_path_buf();
        config.cache_root = dir.path().join(".foreman");
        config.workers = 2;

        let scheduler = Scheduler::new(config, registry).unwrap();
        let session = scheduler.session();
        session.watch_paths(["input.txt"]);

        let _watcher = InvalidationWatcher::start(scheduler.clone()).unwrap();

        let params = vec![Value::new(FileName("input.txt".into()))];
        let first = session.request::<FileText>(params.clone()).await.unwrap();
        assert_eq!(*first, FileText("before".into()));

        std::fs::write(dir.path().join("input.txt"), "after").unwrap();

        // Wait out the debounce window, then poll for the recompute.
        let mut fresh = (*first).clone();
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            fresh = (*session.request::<FileText>(params.clone()).await.unwrap()).clone();
            if fresh != *first {
                break;
            }
        }
        assert_eq!(fresh, FileText("after".into()));
    }
}
