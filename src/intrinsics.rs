// Copyright 2026 the Foreman Project
// Licensed under the MIT License

//! Engine primitives exposed as ordinary rules.
//!
//! File-system and process operations enter the rule graph here, so user
//! rules demand them exactly like any other typed value and the evaluator
//! memoizes and invalidates them uniformly. Each request wrapper is a plain
//! value type whose digest identity covers everything that affects the
//! operation's result.

use serde::{Deserialize, Serialize};

use crate::digest::{DigestComputer, Digestible};
use crate::errors::Failure;
use crate::glob::PathGlobs;
use crate::process::{ProcessRequest, ProcessResult};
use crate::rules::{Query, Rule, RuleRegistry, TypeKey, Value};
use crate::snapshot::{capture_workspace, Snapshot, SnapshotOps};

/// Merge several snapshots into one tree.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MergeSnapshots(pub Vec<Snapshot>);

impl Digestible for MergeSnapshots {
    fn update_digest(&self, dc: &mut DigestComputer) {
        self.0.update_digest(dc);
    }
}

/// Re-root a snapshot under a prefix.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AddPrefix {
    pub snapshot: Snapshot,
    pub prefix: String,
}

impl Digestible for AddPrefix {
    fn update_digest(&self, dc: &mut DigestComputer) {
        self.snapshot.update_digest(dc);
        self.prefix.update_digest(dc);
    }
}

/// Strip a prefix under which every file in the snapshot must live.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemovePrefix {
    pub snapshot: Snapshot,
    pub prefix: String,
}

impl Digestible for RemovePrefix {
    fn update_digest(&self, dc: &mut DigestComputer) {
        self.snapshot.update_digest(dc);
        self.prefix.update_digest(dc);
    }
}

/// Select a subset of a snapshot by glob.
#[derive(Clone, Debug)]
pub struct SnapshotSubset {
    pub snapshot: Snapshot,
    pub globs: PathGlobs,
}

impl Digestible for SnapshotSubset {
    fn update_digest(&self, dc: &mut DigestComputer) {
        self.snapshot.update_digest(dc);
        self.globs.update_digest(dc);
    }
}

/// Read the file contents of a snapshot out of the store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileContentsRequest(pub Snapshot);

impl Digestible for FileContentsRequest {
    fn update_digest(&self, dc: &mut DigestComputer) {
        self.0.update_digest(dc);
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileContent {
    pub path: String,
    pub content: Vec<u8>,
    pub executable: bool,
}

impl Digestible for FileContent {
    fn update_digest(&self, dc: &mut DigestComputer) {
        self.path.update_digest(dc);
        self.content.as_slice().update_digest(dc);
        self.executable.update_digest(dc);
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileContents {
    pub files: Vec<FileContent>,
}

impl Digestible for FileContents {
    fn update_digest(&self, dc: &mut DigestComputer) {
        self.files.update_digest(dc);
    }
}

/// Register the intrinsic rules and their root queries. Called once while a
/// scheduler is being built, after user rules are in place.
pub(crate) fn register(registry: &mut RuleRegistry) {
    registry.register(Rule::new::<Snapshot>("capture_snapshot").param::<PathGlobs>().body(
        |ctx| async move {
            let globs = ctx.param::<PathGlobs>()?;
            ctx.set_label(format!("capturing {}", globs.includes().join(", ")));

            let config = ctx.config().clone();
            let snapshot = capture_workspace(
                ctx.store(),
                ctx.digest_memo(),
                &config.workspace_root,
                &config.ignore,
                &globs,
                config.workers,
            )
            .await?;

            ctx.record_file_deps(snapshot.files().iter().map(|s| s.as_str()));
            Ok(Value::new(snapshot))
        },
    ));

    registry.register(Rule::new::<Snapshot>("merge_snapshots").param::<MergeSnapshots>().body(
        |ctx| async move {
            let request = ctx.param::<MergeSnapshots>()?;
            let merged = ctx.store().merge(request.0.clone()).await?;
            Ok(Value::new(merged))
        },
    ));

    registry.register(Rule::new::<Snapshot>("add_prefix").param::<AddPrefix>().body(
        |ctx| async move {
            let request = ctx.param::<AddPrefix>()?;
            let prefixed = ctx
                .store()
                .add_prefix(request.snapshot.clone(), &request.prefix)
                .await?;
            Ok(Value::new(prefixed))
        },
    ));

    registry.register(Rule::new::<Snapshot>("remove_prefix").param::<RemovePrefix>().body(
        |ctx| async move {
            let request = ctx.param::<RemovePrefix>()?;
            let stripped = ctx
                .store()
                .remove_prefix(request.snapshot.clone(), &request.prefix)
                .await?;
            Ok(Value::new(stripped))
        },
    ));

    registry.register(Rule::new::<Snapshot>("snapshot_subset").param::<SnapshotSubset>().body(
        |ctx| async move {
            let request = ctx.param::<SnapshotSubset>()?;
            let subset = ctx
                .store()
                .subset(request.snapshot.clone(), &request.globs)
                .await?;
            Ok(Value::new(subset))
        },
    ));

    registry.register(
        Rule::new::<FileContents>("file_contents").param::<FileContentsRequest>().body(
            |ctx| async move {
                let request = ctx.param::<FileContentsRequest>()?;
                let store = ctx.store().clone();

                let mut files = Vec::new();
                for (path, entry) in store.walk_files(request.0.digest).await? {
                    if let crate::tree::TreeEntry::File { digest, executable } = entry {
                        let content = store.load_blob(digest).await?.ok_or_else(|| {
                            Failure::store(format!("blob {digest} for `{path}` is missing"))
                        })?;
                        files.push(FileContent {
                            path,
                            content: content.to_vec(),
                            executable,
                        });
                    }
                }

                Ok(Value::new(FileContents { files }))
            },
        ),
    );

    registry.register(Rule::new::<crate::config::EngineConfig>("engine_config").body(
        |ctx| async move { Ok(Value::new(ctx.config().clone())) },
    ));

    registry.register(Rule::new::<ProcessResult>("execute_process").param::<ProcessRequest>().body(
        |ctx| async move {
            let request = ctx.param::<ProcessRequest>()?;
            ctx.set_label(request.description.clone());
            let result = ctx.run_process((*request).clone()).await?;
            Ok(Value::new(result))
        },
    ));

    // The operations above are also valid session roots.
    registry.register_query(Query::new::<Snapshot>([TypeKey::of::<PathGlobs>()]));
    registry.register_query(Query::new::<Snapshot>([TypeKey::of::<MergeSnapshots>()]));
    registry.register_query(Query::new::<Snapshot>([TypeKey::of::<AddPrefix>()]));
    registry.register_query(Query::new::<Snapshot>([TypeKey::of::<RemovePrefix>()]));
    registry.register_query(Query::new::<Snapshot>([TypeKey::of::<SnapshotSubset>()]));
    registry.register_query(Query::new::<FileContents>([
        TypeKey::of::<FileContentsRequest>(),
    ]));
    registry.register_query(Query::new::<ProcessResult>([TypeKey::of::<ProcessRequest>()]));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::glob::NoMatchPolicy;
    use crate::scheduler::Scheduler;

    fn scheduler_in(dir: &tempfile::TempDir) -> Scheduler {
        let mut config = EngineConfig::default();
        config.workspace_root = dir.path().to_path_buf();
        config.cache_root = dir.path().join(".foreman");
        config.workers = 2;
        Scheduler::new(config, RuleRegistry::new()).unwrap()
    }

    #[tokio::test]
    async fn capture_then_subset_through_the_session() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/lib.x"), "lib").unwrap();
        std::fs::write(dir.path().join("notes.md"), "notes").unwrap();

        let scheduler = scheduler_in(&dir);
        let session = scheduler.session();

        let globs =
            PathGlobs::new(["**"], Vec::<String>::new(), NoMatchPolicy::Ignore, "test").unwrap();
        let snapshot = session
            .request::<Snapshot>(vec![Value::new(globs)])
            .await
            .unwrap();
        assert_eq!(snapshot.files(), &["notes.md", "src/lib.x"]);

        let subset_globs = PathGlobs::new(
            ["src/**"],
            Vec::<String>::new(),
            NoMatchPolicy::Ignore,
            "test",
        )
        .unwrap();
        let subset = session
            .request::<Snapshot>(vec![Value::new(SnapshotSubset {
                snapshot: (*snapshot).clone(),
                globs: subset_globs,
            })])
            .await
            .unwrap();
        assert_eq!(subset.files(), &["src/lib.x"]);
    }

    #[tokio::test]
    async fn subset_with_error_policy_fails_with_origin() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/lib.x"), "lib").unwrap();

        let scheduler = scheduler_in(&dir);
        let session = scheduler.session();

        let globs =
            PathGlobs::new(["**"], Vec::<String>::new(), NoMatchPolicy::Ignore, "test").unwrap();
        let snapshot = session
            .request::<Snapshot>(vec![Value::new(globs)])
            .await
            .unwrap();

        let bad_globs = PathGlobs::new(
            ["src/nonexistent.x"],
            Vec::<String>::new(),
            NoMatchPolicy::Error,
            "test",
        )
        .unwrap();
        let err = session
            .request::<Snapshot>(vec![Value::new(SnapshotSubset {
                snapshot: (*snapshot).clone(),
                globs: bad_globs,
            })])
            .await
            .unwrap_err();

        let msg = err.to_string();
        assert!(msg.contains("test"), "got: {msg}");
        assert!(msg.contains("src/nonexistent.x"), "got: {msg}");
    }

    #[tokio::test]
    async fn process_execution_round_trips_file_contents() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = scheduler_in(&dir);
        let session = scheduler.session();

        let request = ProcessRequest::new(
            vec![
                "/bin/sh".into(),
                "-c".into(),
                "printf hello > greeting.txt".into(),
            ],
            crate::digest::Digest::empty(),
            "write greeting",
        )
        .output_files(["greeting.txt"]);

        let result = session
            .request::<ProcessResult>(vec![Value::new(request)])
            .await
            .unwrap();
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.output.files(), &["greeting.txt"]);

        let contents = session
            .request::<FileContents>(vec![Value::new(FileContentsRequest(
                result.output.clone(),
            ))])
            .await
            .unwrap();
        assert_eq!(contents.files.len(), 1);
        assert_eq!(contents.files[0].content, b"hello");
    }

    #[tokio::test]
    async fn merge_as_a_root_query() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "a").unwrap();
        std::fs::write(dir.path().join("b.txt"), "b").unwrap();

        let scheduler = scheduler_in(&dir);
        let session = scheduler.session();

        let capture = |pattern: &str| {
            PathGlobs::new([pattern], Vec::<String>::new(), NoMatchPolicy::Ignore, "test").unwrap()
        };

        let left = session
            .request::<Snapshot>(vec![Value::new(capture("a.txt"))])
            .await
            .unwrap();
        let right = session
            .request::<Snapshot>(vec![Value::new(capture("b.txt"))])
            .await
            .unwrap();

        let merged = session
            .request::<Snapshot>(vec![Value::new(MergeSnapshots(vec![
                (*left).clone(),
                (*right).clone(),
            ]))])
            .await
            .unwrap();
        assert_eq!(merged.files(), &["a.txt", "b.txt"]);
    }
}
