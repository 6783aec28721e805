// Copyright 2026 the Foreman Project
// Licensed under the MIT License

//! Sessions: one user-initiated evaluation.
//!
//! A session owns a cancellation scope and a fail-fast policy. Roots
//! submitted through a session resolve against the registered queries only;
//! no type search happens at request time. Cancelling a session tears down
//! exactly the in-flight work no other live session is interested in.

use futures::stream::{FuturesUnordered, StreamExt};
use std::sync::Mutex;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::errors::Failure;
use crate::messages::{
    bus_channel, BusReceiver, Message, SessionCompleteMessage, SessionStartedMessage,
};
use crate::nodes::NodeKey;
use crate::rules::{RuleData, TypeKey, Value};
use crate::scheduler::Scheduler;

pub struct Session {
    scheduler: Scheduler,
    id: u64,
    cancel: CancellationToken,
    fail_fast: Mutex<bool>,
}

impl Session {
    pub(crate) fn new(scheduler: Scheduler, id: u64, fail_fast: bool) -> Session {
        Session {
            scheduler,
            id,
            cancel: CancellationToken::new(),
            fail_fast: Mutex::new(fail_fast),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn set_fail_fast(&self, fail_fast: bool) {
        *self.fail_fast.lock().unwrap() = fail_fast;
    }

    pub fn fail_fast(&self) -> bool {
        *self.fail_fast.lock().unwrap()
    }

    /// Subscribe to this session's progress messages. The engine holds the
    /// sending half; drain the receiver with a [`crate::messages::MessageBus`]
    /// or read it directly.
    pub fn subscribe(&self) -> BusReceiver {
        let (tx, rx) = bus_channel();
        self.scheduler.register_bus(self.id, tx);
        rx
    }

    /// Ask for the workspace paths in `paths` to be watched for changes on
    /// behalf of this session; an [`crate::watch::InvalidationWatcher`]
    /// consults this set.
    pub fn watch_paths(&self, paths: impl IntoIterator<Item = impl Into<String>>) {
        self.scheduler
            .add_watched_paths(paths.into_iter().map(Into::into));
    }

    /// Request a single typed root value.
    pub async fn request<T: RuleData>(&self, params: Vec<Value>) -> Result<std::sync::Arc<T>, Failure> {
        let value = self.request_value(TypeKey::of::<T>(), params).await?;
        value.downcast_arc::<T>().ok_or_else(|| {
            Failure::store(format!(
                "query provider returned `{}` where `{}` was requested",
                value.type_key(),
                TypeKey::of::<T>()
            ))
        })
    }

    /// Request a single root value by type key.
    pub async fn request_value(
        &self,
        output: TypeKey,
        params: Vec<Value>,
    ) -> Result<Value, Failure> {
        let param_types: Vec<TypeKey> = params.iter().map(|v| v.type_key()).collect();
        let provider = self
            .scheduler
            .graph()
            .query_provider(output, &param_types)
            .ok_or_else(|| Failure::NoRuleProvides {
                output: output.to_string(),
                inputs: param_types
                    .iter()
                    .map(|t| t.to_string())
                    .collect::<Vec<_>>()
                    .join(", "),
                origin: "session request (is the query registered?)".to_string(),
            })?;

        let rule = self.scheduler.graph().rule(provider);

        // Order the session's values to the provider's declared parameters.
        let mut inputs = Vec::with_capacity(rule.params().len());
        for param in rule.params() {
            let value = params
                .iter()
                .find(|v| v.type_key() == *param)
                .cloned()
                .ok_or_else(|| Failure::MissingInput {
                    message: format!("request is missing a value of type `{param}`"),
                    origin: format!("rule `{}`", rule.name()),
                })?;
            inputs.push(value);
        }

        let key = NodeKey::new(provider, rule.name(), inputs);
        let demand = self.scheduler.demand(self.id, None, None, key);

        tokio::select! {
            result = demand => result,
            _ = self.cancel.cancelled() => Err(Failure::Cancelled),
        }
    }

    /// Evaluate several roots under this session's fail-fast policy.
    ///
    /// With fail-fast on, the first root failure cancels every outstanding
    /// root and the session reports it alongside `Cancelled` for the rest.
    /// With it off, all roots run to completion and every failure is
    /// reported.
    pub async fn request_all(
        &self,
        roots: Vec<(TypeKey, Vec<Value>)>,
    ) -> Vec<Result<Value, Failure>> {
        let started = Instant::now();
        self.scheduler.post(
            self.id,
            Message::SessionStarted(SessionStartedMessage {
                session: self.id,
                roots: roots.len(),
            }),
        );

        let mut pending: FuturesUnordered<_> = roots
            .into_iter()
            .enumerate()
            .map(|(index, (output, params))| async move {
                (index, self.request_value(output, params).await)
            })
            .collect();

        let mut results: Vec<Option<Result<Value, Failure>>> = Vec::new();
        results.resize_with(pending.len(), || None);

        while let Some((index, result)) = pending.next().await {
            let is_failure = matches!(&result, Err(f) if !f.is_cancelled());
            results[index] = Some(result);

            if is_failure && self.fail_fast() {
                self.cancel();
            }
        }

        let results: Vec<Result<Value, Failure>> = results
            .into_iter()
            .map(|r| r.unwrap_or(Err(Failure::Cancelled)))
            .collect();

        self.scheduler.post(
            self.id,
            Message::SessionComplete(SessionCompleteMessage {
                session: self.id,
                success: results.iter().all(|r| r.is_ok()),
                elapsed: started.elapsed().as_secs_f32(),
            }),
        );

        results
    }

    /// Cancel this session: outstanding roots resolve to `Cancelled`, and
    /// in-flight nodes demanded only by this session are torn down, killing
    /// their process groups after the grace period.
    pub fn cancel(&self) {
        self.cancel.cancel();
        self.scheduler.cancel_session(self.id);
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.scheduler.end_session(self.id);
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("fail_fast", &self.fail_fast())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::digest::{DigestComputer, Digestible};
    use crate::rules::{Query, Rule, RuleRegistry};
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq)]
    struct Tag(String);

    impl Digestible for Tag {
        fn update_digest(&self, dc: &mut DigestComputer) {
            self.0.update_digest(dc);
        }
    }

    fn scheduler_with(registry: RuleRegistry) -> (tempfile::TempDir, Scheduler) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = EngineConfig::default();
        config.workspace_root = dir.path().to_path_buf();
        config.cache_root = dir.path().join(".foreman");
        config.workers = 2;
        (dir, Scheduler::new(config, registry).unwrap())
    }

    fn slow_and_failing_registry() -> RuleRegistry {
        let mut registry = RuleRegistry::new();
        registry.register(Rule::new::<Tag>("maybe_slow").param::<Tag>().body(
            |ctx| async move {
                let tag = ctx.param::<Tag>()?;
                match tag.0.as_str() {
                    "fails" => Err(Failure::missing_input("this root fails", "maybe_slow")),
                    _ => {
                        tokio::time::sleep(Duration::from_secs(30)).await;
                        Ok(Value::new(Tag(format!("done:{}", tag.0))))
                    }
                }
            },
        ));
        registry.register_query(Query::new::<Tag>([TypeKey::of::<Tag>()]));
        registry
    }

    #[tokio::test]
    async fn fail_fast_cancels_outstanding_roots() {
        let (_dir, scheduler) = scheduler_with(slow_and_failing_registry());
        let session = scheduler.session();
        session.set_fail_fast(true);

        let started = Instant::now();
        let results = session
            .request_all(vec![
                (TypeKey::of::<Tag>(), vec![Value::new(Tag("fails".into()))]),
                (TypeKey::of::<Tag>(), vec![Value::new(Tag("slow".into()))]),
            ])
            .await;

        // Well under the 30s the slow rule would need.
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(matches!(&results[0], Err(f) if !f.is_cancelled()));
        assert!(matches!(&results[1], Err(f) if f.is_cancelled()));
    }

    #[tokio::test]
    async fn without_fail_fast_all_failures_are_collected() {
        let mut registry = RuleRegistry::new();
        registry.register(Rule::new::<Tag>("judge").param::<Tag>().body(
            |ctx| async move {
                let tag = ctx.param::<Tag>()?;
                if tag.0.starts_with("bad") {
                    Err(Failure::missing_input(format!("{} is bad", tag.0), "judge"))
                } else {
                    Ok(Value::new(Tag(tag.0.clone())))
                }
            },
        ));
        registry.register_query(Query::new::<Tag>([TypeKey::of::<Tag>()]));

        let (_dir, scheduler) = scheduler_with(registry);
        let session = scheduler.session();
        session.set_fail_fast(false);

        let results = session
            .request_all(vec![
                (TypeKey::of::<Tag>(), vec![Value::new(Tag("bad1".into()))]),
                (TypeKey::of::<Tag>(), vec![Value::new(Tag("good".into()))]),
                (TypeKey::of::<Tag>(), vec![Value::new(Tag("bad2".into()))]),
            ])
            .await;

        assert!(results[0].is_err());
        assert!(results[1].is_ok());
        assert!(results[2].is_err());
    }

    #[tokio::test]
    async fn explicit_cancel_resolves_requests() {
        let (_dir, scheduler) = scheduler_with(slow_and_failing_registry());
        let session = std::sync::Arc::new(scheduler.session());

        let requester = session.clone();
        let handle = tokio::spawn(async move {
            requester
                .request::<Tag>(vec![Value::new(Tag("slow".into()))])
                .await
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        session.cancel();

        let result = handle.await.unwrap();
        assert!(matches!(result, Err(f) if f.is_cancelled()));
    }

    #[tokio::test]
    async fn unregistered_query_is_refused() {
        let (_dir, scheduler) = scheduler_with(RuleRegistry::new());
        let session = scheduler.session();
        let err = session
            .request::<Tag>(vec![Value::new(Tag("x".into()))])
            .await
            .unwrap_err();
        assert!(matches!(err, Failure::NoRuleProvides { .. }));
    }

    #[tokio::test]
    async fn session_messages_report_lifecycle() {
        let mut registry = RuleRegistry::new();
        registry.register(Rule::new::<Tag>("ok").param::<Tag>().body(|ctx| async move {
            let tag = ctx.param::<Tag>()?;
            Ok(Value::new(Tag(tag.0.clone())))
        }));
        registry.register_query(Query::new::<Tag>([TypeKey::of::<Tag>()]));

        let (_dir, scheduler) = scheduler_with(registry);
        let session = scheduler.session();
        let mut bus = session.subscribe();

        let results = session
            .request_all(vec![(
                TypeKey::of::<Tag>(),
                vec![Value::new(Tag("x".into()))],
            )])
            .await;
        assert!(results[0].is_ok());
        drop(session);

        let mut saw_started = false;
        let mut saw_complete = false;
        while let Some(msg) = bus.recv().await {
            match msg {
                Message::SessionStarted(m) => {
                    saw_started = true;
                    assert_eq!(m.roots, 1);
                }
                Message::SessionComplete(m) => {
                    saw_complete = true;
                    assert!(m.success);
                }
                _ => {}
            }
        }
        assert!(saw_started && saw_complete);
    }
}
