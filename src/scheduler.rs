// Copyright 2025-2026 the Foreman Project
// Licensed under the MIT License

//! The demand-driven evaluator.
//!
//! Sessions submit root requests; the scheduler resolves each to a node via
//! the validated dispatch table and evaluates it, memoizing by node identity.
//! Rule bodies run as tokio tasks and suspend at every sub-demand, so many
//! bodies are in flight at once while leaf work (file ingestion, processes)
//! is bounded by the worker count and named semaphores.
//!
//! For any node identity at most one evaluation runs at a time; concurrent
//! demanders attach to the same watch channel and receive the same result,
//! including failures, which are values and are memoized like any other.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};
use futures::future::BoxFuture;
use string_interner::{DefaultSymbol, StringInterner};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::config::EngineConfig;
use crate::digest::{Digest, DigestData};
use crate::errors::Failure;
use crate::executor::{
    ActionCacheProvider, CachingRunner, LocalRunner, ProcessRunner, RunContext, Semaphores,
};
use crate::graph::RuleGraph;
use crate::messages::{BusSender, Message, NodeCompletedMessage, NodeMessage, NodeProgressMessage};
use crate::nodes::{DemandStack, NodeEntry, NodeKey, NodeResult, NodeState};
use crate::process::{ProcessRequest, ProcessResult};
use crate::rules::{RuleData, RuleRegistry, TypeKey, Value};
use crate::session::Session;
use crate::snapshot::DigestMemo;
use crate::store::{RemoteProvider, Store};

/// The engine core: validated rules, the store, the process runner, and the
/// runtime node table. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Scheduler {
    pub(crate) inner: Arc<SchedulerInner>,
}

pub(crate) struct SchedulerInner {
    pub(crate) config: EngineConfig,
    pub(crate) store: Store,
    pub(crate) memo: DigestMemo,
    pub(crate) runner: Arc<CachingRunner>,
    pub(crate) graph: RuleGraph,
    nodes: Mutex<HashMap<DigestData, Arc<NodeEntry>>>,
    path_index: Mutex<PathIndex>,
    generation: AtomicU64,
    next_session: AtomicU64,
    buses: Mutex<HashMap<u64, BusSender>>,
    watched: Mutex<HashSet<String>>,
    cancelled_sessions: Mutex<HashSet<u64>>,
}

#[derive(Default)]
struct PathIndex {
    interner: StringInterner,
    by_path: HashMap<DefaultSymbol, HashSet<DigestData>>,
}

impl Scheduler {
    /// Build a scheduler with no remote backends.
    pub fn new(config: EngineConfig, registry: RuleRegistry) -> Result<Scheduler, Failure> {
        Scheduler::with_providers(config, registry, None, None)
    }

    /// Build a scheduler, wiring in remote CAS and action cache providers
    /// constructed by the embedding tool.
    pub fn with_providers(
        config: EngineConfig,
        mut registry: RuleRegistry,
        remote_store: Option<Arc<dyn RemoteProvider>>,
        remote_cache: Option<Arc<dyn ActionCacheProvider>>,
    ) -> Result<Scheduler, Failure> {
        crate::intrinsics::register(&mut registry);
        let graph = RuleGraph::validate(registry)?;

        let store = Store::open_with_remote(config.cache_root.clone(), remote_store)?;
        let memo = DigestMemo::load(&config.cache_root);

        let work_root = config.cache_root.join("sandboxes");
        std::fs::create_dir_all(&work_root)
            .map_err(|e| Failure::store(format!("failed to create sandbox root: {e}")))?;

        let local = Arc::new(LocalRunner::new(
            store.clone(),
            work_root,
            config.keep_sandboxes,
            config.grace_period(),
            config.stderr_excerpt_limit,
        ));
        let semaphores = Arc::new(Semaphores::new(config.semaphores.clone(), config.workers));
        let runner = Arc::new(CachingRunner::new(local, store.clone(), semaphores, remote_cache));

        Ok(Scheduler {
            inner: Arc::new(SchedulerInner {
                config,
                store,
                memo,
                runner,
                graph,
                nodes: Mutex::new(HashMap::new()),
                path_index: Mutex::new(PathIndex::default()),
                generation: AtomicU64::new(0),
                next_session: AtomicU64::new(1),
                buses: Mutex::new(HashMap::new()),
                watched: Mutex::new(HashSet::new()),
                cancelled_sessions: Mutex::new(HashSet::new()),
            }),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &Store {
        &self.inner.store
    }

    pub fn graph(&self) -> &RuleGraph {
        &self.inner.graph
    }

    /// The current invalidation generation.
    pub fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::SeqCst)
    }

    /// Open a new session with the configured default fail-fast policy.
    pub fn session(&self) -> Session {
        let id = self.inner.next_session.fetch_add(1, Ordering::SeqCst);
        Session::new(self.clone(), id, self.inner.config.fail_fast)
    }

    pub(crate) fn register_bus(&self, session: u64, bus: BusSender) {
        self.inner.buses.lock().unwrap().insert(session, bus);
    }

    pub(crate) fn post(&self, session: u64, msg: Message) {
        if let Some(bus) = self.inner.buses.lock().unwrap().get(&session) {
            bus.post(msg);
        }
    }

    /// Paths a session explicitly asked to have watched, workspace-relative.
    pub fn watched_paths(&self) -> Vec<String> {
        let watched = self.inner.watched.lock().unwrap();
        let mut paths: Vec<String> = watched.iter().cloned().collect();
        paths.sort();
        paths
    }

    pub(crate) fn add_watched_paths(&self, paths: impl IntoIterator<Item = String>) {
        self.inner.watched.lock().unwrap().extend(paths);
    }

    fn entry(&self, key: &NodeKey) -> Arc<NodeEntry> {
        let mut nodes = self.inner.nodes.lock().unwrap();
        nodes
            .entry(key.identity)
            .or_insert_with(|| Arc::new(NodeEntry::new(key.clone())))
            .clone()
    }

    /// Associate a node with workspace-relative file paths it read, so a
    /// change to any of them invalidates the node.
    pub(crate) fn record_file_deps<'a>(
        &self,
        paths: impl IntoIterator<Item = &'a str>,
        node: DigestData,
    ) {
        let mut index = self.inner.path_index.lock().unwrap();
        for path in paths {
            let sym = index.interner.get_or_intern(path);
            index.by_path.entry(sym).or_default().insert(node);
        }
    }

    /// Invalidate every node whose transitive inputs include one of the
    /// given workspace-relative paths. Returns how many nodes were reset.
    pub fn invalidate_paths(&self, paths: &[String]) -> usize {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);

        let seeds: Vec<DigestData> = {
            let index = self.inner.path_index.lock().unwrap();
            paths
                .iter()
                .filter_map(|p| index.interner.get(p.as_str()))
                .filter_map(|sym| index.by_path.get(&sym))
                .flatten()
                .copied()
                .collect()
        };

        let mut visited: HashSet<DigestData> = HashSet::new();
        let mut worklist = seeds;
        let mut reset = 0usize;

        while let Some(identity) = worklist.pop() {
            if !visited.insert(identity) {
                continue;
            }

            let entry = match self.inner.nodes.lock().unwrap().get(&identity) {
                Some(entry) => entry.clone(),
                None => continue,
            };

            {
                let mut state = entry.state.lock().unwrap();
                match &mut *state {
                    NodeState::Done { .. } => {
                        *state = NodeState::NotStarted;
                        reset += 1;
                    }
                    NodeState::Running { dirtied, .. } => {
                        // The in-flight result will be delivered to waiters
                        // but not memoized.
                        *dirtied = true;
                        reset += 1;
                    }
                    NodeState::NotStarted => {}
                }
            }

            worklist.extend(entry.dependents.lock().unwrap().iter().copied());
        }

        if reset > 0 {
            debug!(paths = paths.len(), nodes = reset, "invalidated nodes");
        }
        reset
    }

    fn session_is_cancelled(&self, session: u64) -> bool {
        self.inner.cancelled_sessions.lock().unwrap().contains(&session)
    }

    /// Withdraw a session's interest in every node; in-flight nodes that no
    /// other session wants are cancelled.
    pub(crate) fn cancel_session(&self, session: u64) {
        self.inner.cancelled_sessions.lock().unwrap().insert(session);
        let entries: Vec<Arc<NodeEntry>> =
            self.inner.nodes.lock().unwrap().values().cloned().collect();

        for entry in entries {
            let now_empty = {
                let mut sessions = entry.sessions.lock().unwrap();
                sessions.remove(&session) && sessions.is_empty()
            };
            if now_empty {
                if let Some(token) = entry.cancel.lock().unwrap().as_ref() {
                    token.cancel();
                }
            }
        }
    }

    /// Tear down a finished session's bookkeeping. Session ids are never
    /// reused, so dropping the cancellation marker is safe.
    pub(crate) fn end_session(&self, session: u64) {
        self.inner.runner.end_session(session);
        self.inner.buses.lock().unwrap().remove(&session);
        self.inner.cancelled_sessions.lock().unwrap().remove(&session);
        let entries: Vec<Arc<NodeEntry>> =
            self.inner.nodes.lock().unwrap().values().cloned().collect();
        for entry in entries {
            entry.sessions.lock().unwrap().remove(&session);
        }
    }

    /// Demand a node, attaching to an existing evaluation when one is in
    /// flight.
    pub(crate) fn demand(
        &self,
        session: u64,
        stack: Option<Arc<DemandStack>>,
        dependent: Option<DigestData>,
        key: NodeKey,
    ) -> BoxFuture<'static, NodeResult> {
        let scheduler = self.clone();
        Box::pin(async move {
            if let Some(stack) = &stack {
                if stack.contains(&key.identity) {
                    let mut path = stack.path();
                    path.push(key.label());
                    return Err(Failure::EvaluationCycle { path });
                }
            }

            let entry = scheduler.entry(&key);
            entry.sessions.lock().unwrap().insert(session);
            if let Some(dependent) = dependent {
                entry.dependents.lock().unwrap().insert(dependent);
            }

            // A demander that attaches just as a run is being torn down for
            // someone else's cancellation sees `Cancelled`; since this
            // session is still being polled, re-demand rather than surface
            // the neighbor's cancellation.
            let mut attempts = 0u32;
            loop {
                if scheduler.session_is_cancelled(session) {
                    return Err(Failure::Cancelled);
                }

                let mut rx = {
                    let mut state = entry.state.lock().unwrap();
                    match &*state {
                        NodeState::Done { result, .. } => return result.clone(),
                        NodeState::Running { rx, .. } => rx.clone(),
                        NodeState::NotStarted => {
                            let (tx, rx) = watch::channel(None);
                            let token = CancellationToken::new();
                            *entry.cancel.lock().unwrap() = Some(token.clone());
                            *state = NodeState::Running {
                                rx: rx.clone(),
                                dirtied: false,
                            };

                            let runner = scheduler.clone();
                            let run_entry = entry.clone();
                            let run_stack = stack.clone();
                            tokio::spawn(async move {
                                runner.run_node(run_entry, run_stack, session, tx, token).await;
                            });
                            rx
                        }
                    }
                };

                let result = match rx.wait_for(|v| v.is_some()).await {
                    Ok(guard) => (*guard).clone().unwrap_or(Err(Failure::Cancelled)),
                    // The runner went away without delivering: cancelled.
                    Err(_) => Err(Failure::Cancelled),
                };

                let spurious = matches!(&result, Err(f) if f.is_cancelled()) && attempts < 3;
                if spurious {
                    attempts += 1;
                    continue;
                }
                return result;
            }
        })
    }

    async fn run_node(
        self,
        entry: Arc<NodeEntry>,
        stack: Option<Arc<DemandStack>>,
        session: u64,
        tx: watch::Sender<Option<NodeResult>>,
        token: CancellationToken,
    ) {
        let key = entry.key.clone();
        let rule = self.inner.graph.rule(key.rule).clone();
        let label = key.label();
        trace!(node = %label, "node started");
        self.post(
            session,
            Message::NodeStarted(NodeMessage {
                label: label.clone(),
            }),
        );

        // Persistent rules may already have an answer on disk.
        let mut from_cache = false;
        let mut outcome: Option<NodeResult> = None;
        if let Some(codec) = rule.persistent() {
            let memo_key = Digest::new(key.identity, 0);
            match self.inner.store.load_rule_memo(memo_key).await {
                Ok(Some(payload)) => match codec.decode(&payload) {
                    Ok(value) => {
                        from_cache = true;
                        outcome = Some(Ok(value));
                    }
                    Err(e) => debug!(node = %label, "discarding stale rule memo: {e}"),
                },
                Ok(None) => {}
                Err(e) => debug!(node = %label, "rule memo load failed: {e}"),
            }
        }

        let result = match outcome {
            Some(result) => result,
            None => {
                let body_stack = match &stack {
                    Some(stack) => stack.push(key.identity, label.clone()),
                    None => DemandStack::root(key.identity, label.clone()),
                };
                let ctx = Context {
                    scheduler: self.clone(),
                    session,
                    node: key.clone(),
                    stack: body_stack,
                    cancel: token.clone(),
                    label: Arc::new(Mutex::new(label.clone())),
                };

                let result = tokio::select! {
                    result = rule.invoke(ctx) => result.map_err(|f| f.in_rule(rule.name())),
                    _ = token.cancelled() => Err(Failure::Cancelled),
                };

                if let (Some(codec), Ok(value)) = (rule.persistent(), &result) {
                    match codec.encode(value) {
                        Ok(bytes) => {
                            let memo_key = Digest::new(key.identity, 0);
                            if let Err(e) =
                                self.inner.store.record_rule_memo(memo_key, &bytes).await
                            {
                                debug!(node = %label, "rule memo write failed: {e}");
                            }
                        }
                        Err(e) => debug!(node = %label, "rule memo encode failed: {e}"),
                    }
                }

                result
            }
        };

        {
            // The cancel slot is only touched while the state lock is held,
            // so a successor run spawned after a reset cannot have its token
            // clobbered by this one finishing.
            let mut state = entry.state.lock().unwrap();
            let dirtied = matches!(&*state, NodeState::Running { dirtied: true, .. });
            let cancelled = matches!(&result, Err(f) if f.is_cancelled());

            *state = if cancelled || dirtied {
                NodeState::NotStarted
            } else {
                NodeState::Done {
                    result: result.clone(),
                    generation: self.inner.generation.load(Ordering::SeqCst),
                }
            };
            *entry.cancel.lock().unwrap() = None;
        }

        self.post(
            session,
            Message::NodeCompleted(NodeCompletedMessage {
                label,
                success: result.is_ok(),
                from_cache,
            }),
        );
        let _ = tx.send(Some(result));
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("rules", &self.inner.graph.rules().len())
            .field("generation", &self.generation())
            .finish_non_exhaustive()
    }
}

/// The callback surface available inside a rule body.
#[derive(Clone)]
pub struct Context {
    scheduler: Scheduler,
    session: u64,
    node: NodeKey,
    stack: Arc<DemandStack>,
    cancel: CancellationToken,
    label: Arc<Mutex<String>>,
}

impl Context {
    /// A typed view of one of this node's input parameters.
    pub fn param<T: RuleData>(&self) -> Result<Arc<T>, Failure> {
        let wanted = TypeKey::of::<T>();
        self.node
            .inputs
            .iter()
            .find(|v| v.type_key() == wanted)
            .and_then(|v| v.downcast_arc::<T>())
            .ok_or_else(|| Failure::MissingInput {
                message: format!("no parameter of type `{wanted}`"),
                origin: format!("rule `{}`", self.node.rule_name),
            })
    }

    /// Demand a sub-result: one value of `O`, derived from `input`.
    ///
    /// The demand site must have been declared when the rule was registered;
    /// the provider was chosen at validation time.
    pub async fn get<O: RuleData, I: RuleData>(&self, input: I) -> Result<Arc<O>, Failure> {
        let value = self.get_value(TypeKey::of::<O>(), Value::new(input)).await?;
        value.downcast_arc::<O>().ok_or_else(|| {
            Failure::store(format!(
                "provider returned `{}` where `{}` was demanded",
                value.type_key(),
                TypeKey::of::<O>()
            ))
        })
    }

    /// Untyped demand, for callers that assemble types dynamically.
    pub async fn get_value(&self, output: TypeKey, input: Value) -> Result<Value, Failure> {
        let provider = self
            .scheduler
            .inner
            .graph
            .provider_for(&self.node.rule_name, output, input.type_key())
            .ok_or_else(|| Failure::NoRuleProvides {
                output: output.to_string(),
                inputs: input.type_key().to_string(),
                origin: format!("undeclared demand in rule `{}`", self.node.rule_name),
            })?;

        let key = self.node_key_for(provider, input)?;
        self.scheduler
            .demand(
                self.session,
                Some(self.stack.clone()),
                Some(self.node.identity),
                key,
            )
            .await
    }

    /// Demand one value per registered member of a union type, concurrently,
    /// and return them in member order.
    pub async fn get_union<I: RuleData + Clone>(
        &self,
        union: &str,
        input: I,
    ) -> Result<Vec<Value>, Failure> {
        let members: Vec<TypeKey> = self
            .scheduler
            .inner
            .graph
            .union_members(union)
            .ok_or_else(|| Failure::NoRuleProvides {
                output: format!("union `{union}`"),
                inputs: TypeKey::of::<I>().to_string(),
                origin: format!("rule `{}`", self.node.rule_name),
            })?
            .to_vec();

        let demands = members
            .into_iter()
            .map(|member| self.get_value(member, Value::new(input.clone())));
        futures::future::try_join_all(demands).await
    }

    /// Assemble a provider's positional inputs: the demanded value plus any
    /// parameters threaded through from this node's own scope.
    fn node_key_for(&self, provider: usize, input: Value) -> Result<NodeKey, Failure> {
        let rule = self.scheduler.inner.graph.rule(provider);
        let mut inputs = Vec::with_capacity(rule.params().len());

        for param in rule.params() {
            if *param == input.type_key() {
                inputs.push(input.clone());
                continue;
            }
            let threaded = self
                .node
                .inputs
                .iter()
                .find(|v| v.type_key() == *param)
                .cloned()
                .ok_or_else(|| Failure::NoRuleProvides {
                    output: param.to_string(),
                    inputs: format!("parameters of rule `{}`", self.node.rule_name),
                    origin: format!("threading into rule `{}`", rule.name()),
                })?;
            inputs.push(threaded);
        }

        Ok(NodeKey::new(provider, rule.name(), inputs))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.scheduler.inner.config
    }

    pub fn store(&self) -> &Store {
        &self.scheduler.inner.store
    }

    pub(crate) fn digest_memo(&self) -> &DigestMemo {
        &self.scheduler.inner.memo
    }

    pub fn session_id(&self) -> u64 {
        self.session
    }

    /// Execute a process through the caching tiers, suspending on semaphore
    /// acquisition and honoring this node's cancellation.
    pub async fn run_process(&self, req: ProcessRequest) -> Result<ProcessResult, Failure> {
        self.post(Message::CommandLaunched(req.command_line()));
        let ctx = RunContext {
            session: self.session,
            cancel: self.cancel.clone(),
        };
        self.scheduler.inner.runner.run(&req, &ctx).await
    }

    /// Declare that this node's output depends on the content of the given
    /// workspace-relative files.
    pub fn record_file_deps<'a>(&self, paths: impl IntoIterator<Item = &'a str>) {
        self.scheduler.record_file_deps(paths, self.node.identity);
    }

    /// Replace the label shown for this node in progress UIs.
    pub fn set_label(&self, label: impl Into<String>) {
        let label = label.into();
        *self.label.lock().unwrap() = label.clone();
        self.post(Message::NodeProgress(NodeProgressMessage {
            label,
            lines: Vec::new(),
        }));
    }

    /// Attach progress lines to this node.
    pub fn progress(&self, lines: Vec<String>) {
        self.post(Message::NodeProgress(NodeProgressMessage {
            label: self.label.lock().unwrap().clone(),
            lines,
        }));
    }

    pub fn post(&self, msg: Message) {
        self.scheduler.post(self.session, msg);
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Context({:?})", self.node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::{DigestComputer, Digestible};
    use crate::rules::{Query, Rule};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq)]
    struct Text(String);

    impl Digestible for Text {
        fn update_digest(&self, dc: &mut DigestComputer) {
            self.0.update_digest(dc);
        }
    }

    #[derive(Debug, Clone, PartialEq)]
    struct Doubled(String);

    impl Digestible for Doubled {
        fn update_digest(&self, dc: &mut DigestComputer) {
            self.0.update_digest(dc);
        }
    }

    fn test_config() -> (tempfile::TempDir, EngineConfig) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = EngineConfig::default();
        config.workspace_root = dir.path().to_path_buf();
        config.cache_root = dir.path().join(".foreman");
        config.workers = 2;
        (dir, config)
    }

    fn scheduler_with(registry: RuleRegistry) -> (tempfile::TempDir, Scheduler) {
        let (dir, config) = test_config();
        (dir, Scheduler::new(config, registry).unwrap())
    }

    #[tokio::test]
    async fn evaluates_a_chain_of_rules() {
        let mut registry = RuleRegistry::new();
        registry.register(
            Rule::new::<Doubled>("double")
                .param::<Text>()
                .body(|ctx| async move {
                    let text = ctx.param::<Text>()?;
                    Ok(Value::new(Doubled(format!("{0}{0}", text.0))))
                }),
        );
        registry.register_query(Query::new::<Doubled>([TypeKey::of::<Text>()]));

        let (_dir, scheduler) = scheduler_with(registry);
        let session = scheduler.session();
        let result = session
            .request::<Doubled>(vec![Value::new(Text("ab".into()))])
            .await
            .unwrap();
        assert_eq!(*result, Doubled("abab".into()));
    }

    #[tokio::test]
    async fn results_are_memoized_per_identity() {
        let runs = Arc::new(AtomicUsize::new(0));
        let runs_in_rule = runs.clone();

        let mut registry = RuleRegistry::new();
        registry.register(
            Rule::new::<Doubled>("double")
                .param::<Text>()
                .body(move |ctx| {
                    let runs = runs_in_rule.clone();
                    async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                        let text = ctx.param::<Text>()?;
                        Ok(Value::new(Doubled(format!("{0}{0}", text.0))))
                    }
                }),
        );
        registry.register_query(Query::new::<Doubled>([TypeKey::of::<Text>()]));

        let (_dir, scheduler) = scheduler_with(registry);
        let session = scheduler.session();

        for _ in 0..3 {
            session
                .request::<Doubled>(vec![Value::new(Text("x".into()))])
                .await
                .unwrap();
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        // A distinct input value is a distinct node.
        session
            .request::<Doubled>(vec![Value::new(Text("y".into()))])
            .await
            .unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn concurrent_demanders_share_one_evaluation() {
        let runs = Arc::new(AtomicUsize::new(0));
        let runs_in_rule = runs.clone();

        let mut registry = RuleRegistry::new();
        registry.register(
            Rule::new::<Doubled>("slow_double")
                .param::<Text>()
                .body(move |ctx| {
                    let runs = runs_in_rule.clone();
                    async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        let text = ctx.param::<Text>()?;
                        Ok(Value::new(Doubled(text.0.clone())))
                    }
                }),
        );
        registry.register_query(Query::new::<Doubled>([TypeKey::of::<Text>()]));

        let (_dir, scheduler) = scheduler_with(registry);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let session = scheduler.session();
            handles.push(tokio::spawn(async move {
                session
                    .request::<Doubled>(vec![Value::new(Text("shared".into()))])
                    .await
                    .unwrap()
            }));
        }

        for handle in handles {
            assert_eq!(*handle.await.unwrap(), Doubled("shared".into()));
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failures_are_memoized_and_reraised() {
        let runs = Arc::new(AtomicUsize::new(0));
        let runs_in_rule = runs.clone();

        let mut registry = RuleRegistry::new();
        registry.register(
            Rule::new::<Doubled>("always_fails")
                .param::<Text>()
                .body(move |_ctx| {
                    let runs = runs_in_rule.clone();
                    async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                        Err(Failure::missing_input("nothing here", "always_fails"))
                    }
                }),
        );
        registry.register_query(Query::new::<Doubled>([TypeKey::of::<Text>()]));

        let (_dir, scheduler) = scheduler_with(registry);
        let session = scheduler.session();
        let params = vec![Value::new(Text("x".into()))];

        let first = session.request::<Doubled>(params.clone()).await.unwrap_err();
        let second = session.request::<Doubled>(params).await.unwrap_err();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(matches!(first, Failure::InRule { ref rule, .. } if rule == "always_fails"));
        assert_eq!(first.to_string(), second.to_string());
    }

    #[tokio::test]
    async fn sub_demands_flow_through_the_dispatch_table() {
        let mut registry = RuleRegistry::new();
        registry.register(
            Rule::new::<Doubled>("double")
                .param::<Text>()
                .body(|ctx| async move {
                    let text = ctx.param::<Text>()?;
                    Ok(Value::new(Doubled(format!("{0}{0}", text.0))))
                }),
        );
        registry.register(
            Rule::new::<Text>("shout")
                .param::<Text>()
                .demands::<Doubled, Text>()
                .body(|ctx| async move {
                    let text = ctx.param::<Text>()?;
                    let doubled = ctx.get::<Doubled, Text>(Text(text.0.to_uppercase())).await?;
                    Ok(Value::new(Text(doubled.0.clone())))
                }),
        );
        registry.register_query(Query::new::<Text>([TypeKey::of::<Text>()]));

        let (_dir, scheduler) = scheduler_with(registry);
        let session = scheduler.session();
        let result = session
            .request::<Text>(vec![Value::new(Text("hi".into()))])
            .await
            .unwrap();
        assert_eq!(*result, Text("HIHI".into()));
    }

    #[tokio::test]
    async fn undeclared_demands_are_rejected_at_runtime() {
        let mut registry = RuleRegistry::new();
        registry.register(
            Rule::new::<Doubled>("double")
                .param::<Text>()
                .body(|ctx| async move {
                    let text = ctx.param::<Text>()?;
                    Ok(Value::new(Doubled(text.0.clone())))
                }),
        );
        // `sneaky` calls get() without declaring the demand site.
        registry.register(
            Rule::new::<Text>("sneaky")
                .param::<Text>()
                .body(|ctx| async move {
                    let text = ctx.param::<Text>()?;
                    let doubled = ctx.get::<Doubled, Text>(Text(text.0.clone())).await?;
                    Ok(Value::new(Text(doubled.0.clone())))
                }),
        );
        registry.register_query(Query::new::<Text>([TypeKey::of::<Text>()]));

        let (_dir, scheduler) = scheduler_with(registry);
        let session = scheduler.session();
        let err = session
            .request::<Text>(vec![Value::new(Text("x".into()))])
            .await
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("undeclared demand"), "got: {msg}");
    }

    #[tokio::test]
    async fn invalidation_recomputes_only_affected_nodes() {
        let (dir, config) = test_config();
        std::fs::write(dir.path().join("watched.txt"), "first").unwrap();

        let mut registry = RuleRegistry::new();
        registry.register(
            Rule::new::<Text>("read_watched")
                .param::<Text>()
                .body(|ctx| async move {
                    let name = ctx.param::<Text>()?;
                    let path = ctx.config().workspace_root.join(&name.0);
                    let content = std::fs::read_to_string(&path)
                        .map_err(|e| Failure::missing_input(e.to_string(), "read_watched"))?;
                    ctx.record_file_deps([name.0.as_str()]);
                    Ok(Value::new(Text(content)))
                }),
        );
        registry.register_query(Query::new::<Text>([TypeKey::of::<Text>()]));

        let scheduler = Scheduler::new(config, registry).unwrap();
        let session = scheduler.session();
        let params = vec![Value::new(Text("watched.txt".into()))];

        let first = session.request::<Text>(params.clone()).await.unwrap();
        assert_eq!(*first, Text("first".into()));

        // Unrelated paths invalidate nothing.
        assert_eq!(scheduler.invalidate_paths(&["other.txt".into()]), 0);
        let cached = session.request::<Text>(params.clone()).await.unwrap();
        assert_eq!(*cached, Text("first".into()));

        std::fs::write(dir.path().join("watched.txt"), "second").unwrap();
        assert!(scheduler.invalidate_paths(&["watched.txt".into()]) >= 1);

        let fresh = session.request::<Text>(params).await.unwrap();
        assert_eq!(*fresh, Text("second".into()));
    }

    #[tokio::test]
    async fn persistent_rules_survive_a_restart() {
        use serde::{Deserialize, Serialize};

        #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
        struct Expensive(String);

        impl Digestible for Expensive {
            fn update_digest(&self, dc: &mut DigestComputer) {
                self.0.update_digest(dc);
            }
        }

        let runs = Arc::new(AtomicUsize::new(0));

        let registry_for = |runs: Arc<AtomicUsize>| {
            let mut registry = RuleRegistry::new();
            registry.register(
                Rule::new::<Expensive>("expensive")
                    .param::<Text>()
                    .persistent(crate::rules::ValueCodec::bincode::<Expensive>())
                    .body(move |ctx| {
                        let runs = runs.clone();
                        async move {
                            runs.fetch_add(1, Ordering::SeqCst);
                            let text = ctx.param::<Text>()?;
                            Ok(Value::new(Expensive(format!("made from {}", text.0))))
                        }
                    }),
            );
            registry.register_query(Query::new::<Expensive>([TypeKey::of::<Text>()]));
            registry
        };

        let (dir, config) = test_config();
        let params = vec![Value::new(Text("seed".into()))];

        {
            let scheduler =
                Scheduler::new(config.clone(), registry_for(runs.clone())).unwrap();
            let session = scheduler.session();
            let result = session.request::<Expensive>(params.clone()).await.unwrap();
            assert_eq!(*result, Expensive("made from seed".into()));
            assert_eq!(runs.load(Ordering::SeqCst), 1);
        }

        // A fresh scheduler over the same cache root answers from the disk
        // memo without invoking the body.
        let scheduler = Scheduler::new(config, registry_for(runs.clone())).unwrap();
        let session = scheduler.session();
        let result = session.request::<Expensive>(params).await.unwrap();
        assert_eq!(*result, Expensive("made from seed".into()));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        drop(dir);
    }

    #[tokio::test]
    async fn invalidation_walks_dependents_transitively() {
        let (dir, config) = test_config();
        std::fs::write(dir.path().join("base.txt"), "v1").unwrap();

        let derived_runs = Arc::new(AtomicUsize::new(0));
        let derived_runs_in_rule = derived_runs.clone();

        let mut registry = RuleRegistry::new();
        registry.register(
            Rule::new::<Text>("read_base")
                .param::<Doubled>()
                .body(|ctx| async move {
                    let name = ctx.param::<Doubled>()?;
                    let path = ctx.config().workspace_root.join(&name.0);
                    let content = std::fs::read_to_string(&path)
                        .map_err(|e| Failure::missing_input(e.to_string(), "read_base"))?;
                    ctx.record_file_deps([name.0.as_str()]);
                    Ok(Value::new(Text(content)))
                }),
        );
        registry.register(
            Rule::new::<Doubled>("derive")
                .param::<Doubled>()
                .demands::<Text, Doubled>()
                .body(move |ctx| {
                    let runs = derived_runs_in_rule.clone();
                    async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                        let name = ctx.param::<Doubled>()?;
                        let base = ctx.get::<Text, Doubled>((*name).clone()).await?;
                        Ok(Value::new(Doubled(format!("{}!", base.0))))
                    }
                }),
        );
        registry.register_query(Query::new::<Doubled>([TypeKey::of::<Doubled>()]));

        let scheduler = Scheduler::new(config, registry).unwrap();
        let session = scheduler.session();
        let params = vec![Value::new(Doubled("base.txt".into()))];

        let first = session.request::<Doubled>(params.clone()).await.unwrap();
        assert_eq!(*first, Doubled("v1!".into()));
        assert_eq!(derived_runs.load(Ordering::SeqCst), 1);

        std::fs::write(dir.path().join("base.txt"), "v2").unwrap();
        // The file dep belongs to `read_base`; `derive` is reached through
        // the reverse edge.
        assert_eq!(scheduler.invalidate_paths(&["base.txt".into()]), 2);

        let fresh = session.request::<Doubled>(params).await.unwrap();
        assert_eq!(*fresh, Doubled("v2!".into()));
        assert_eq!(derived_runs.load(Ordering::SeqCst), 2);
    }
}
