// Copyright 2025-2026 the Foreman Project
// Licensed under the MIT License

//! Rules, typed values, and the registry.
//!
//! A rule is a pure function from typed input values to one typed output
//! value, which may demand sub-results while it runs. Rules are registered
//! once at startup together with their demand sites, union memberships, and
//! root queries; the validator in [`crate::graph`] then proves the whole set
//! coherent before anything executes.
//!
//! Values crossing rule boundaries are dynamically typed but carry a stable
//! digest identity computed at construction, which is what node memoization
//! keys on.

use futures::future::BoxFuture;
use serde::{de::DeserializeOwned, Serialize};
use sha2::Digest as _;
use std::{
    any::{type_name, Any, TypeId},
    collections::BTreeMap,
    fmt,
    sync::Arc,
};

use crate::digest::{DigestComputer, DigestData, Digestible};
use crate::errors::Failure;
use crate::scheduler::Context;

/// The identity of a rule-visible type.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TypeKey {
    id: TypeId,
    name: &'static str,
}

impl TypeKey {
    pub fn of<T: RuleData>() -> TypeKey {
        TypeKey {
            id: TypeId::of::<T>(),
            name: type_name::<T>(),
        }
    }

    /// The unqualified type name, for messages.
    pub fn name(&self) -> &'static str {
        self.name.rsplit("::").next().unwrap_or(self.name)
    }

    pub fn full_name(&self) -> &'static str {
        self.name
    }
}

impl PartialOrd for TypeKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TypeKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Name first so orderings are stable across builds; the id breaks
        // ties between identically named types from different modules.
        self.name
            .cmp(other.name)
            .then_with(|| self.id.cmp(&other.id))
    }
}

impl fmt::Debug for TypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl fmt::Display for TypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Anything that can flow between rules: shareable, printable, and with a
/// stable digest identity.
pub trait RuleData: Any + Send + Sync + fmt::Debug + Digestible {}

impl<T> RuleData for T where T: Any + Send + Sync + fmt::Debug + Digestible {}

/// A shared, dynamically typed rule value. The identity digest is computed
/// once at construction from the type name and the payload's canonical
/// digest contribution.
#[derive(Clone)]
pub struct Value {
    inner: Arc<dyn Any + Send + Sync>,
    key: TypeKey,
    identity: DigestData,
    summary: Arc<str>,
}

impl Value {
    pub fn new<T: RuleData>(value: T) -> Value {
        let key = TypeKey::of::<T>();

        let mut dc = DigestComputer::new();
        key.full_name().update_digest(&mut dc);
        value.update_digest(&mut dc);
        let identity = dc.finalize();

        let mut summary = format!("{value:?}");
        if summary.len() > 160 {
            let mut cut = 157;
            while !summary.is_char_boundary(cut) {
                cut -= 1;
            }
            summary.truncate(cut);
            summary.push_str("...");
        }

        Value {
            inner: Arc::new(value),
            key,
            identity,
            summary: summary.into(),
        }
    }

    pub fn type_key(&self) -> TypeKey {
        self.key
    }

    pub fn identity(&self) -> &DigestData {
        &self.identity
    }

    pub fn downcast_arc<T: RuleData>(&self) -> Option<Arc<T>> {
        Arc::clone(&self.inner).downcast::<T>().ok()
    }

    pub fn summary(&self) -> &str {
        &self.summary
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.key.name(), self.summary)
    }
}

impl Digestible for Value {
    fn update_digest(&self, dc: &mut DigestComputer) {
        dc.update(self.identity);
    }
}

/// A typed demand site inside a rule body: "a value of `output`, derived
/// from one value of `input`".
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Demand {
    pub output: TypeKey,
    pub input: TypeKey,
}

pub type RuleBody =
    Arc<dyn Fn(Context) -> BoxFuture<'static, Result<Value, Failure>> + Send + Sync>;

/// An encoder/decoder pair letting a rule's output survive on disk for rules
/// flagged persistent.
#[derive(Clone)]
pub struct ValueCodec {
    type_key: TypeKey,
    encode: Arc<dyn Fn(&Value) -> Result<Vec<u8>, Failure> + Send + Sync>,
    decode: Arc<dyn Fn(&[u8]) -> Result<Value, Failure> + Send + Sync>,
}

impl ValueCodec {
    /// A codec for any serde-capable rule type, using the same bincode
    /// framing as the rest of the persisted state.
    pub fn bincode<T>() -> ValueCodec
    where
        T: RuleData + Serialize + DeserializeOwned,
    {
        ValueCodec {
            type_key: TypeKey::of::<T>(),
            encode: Arc::new(|value: &Value| {
                let typed = value.downcast_arc::<T>().ok_or_else(|| {
                    Failure::store("persistent rule output has an unexpected type".to_string())
                })?;
                bincode::serialize(&*typed)
                    .map_err(|e| Failure::store(format!("failed to encode rule memo: {e}")))
            }),
            decode: Arc::new(|bytes: &[u8]| {
                let typed: T = bincode::deserialize(bytes)
                    .map_err(|e| Failure::store(format!("failed to decode rule memo: {e}")))?;
                Ok(Value::new(typed))
            }),
        }
    }

    pub fn type_key(&self) -> TypeKey {
        self.type_key
    }

    pub fn encode(&self, value: &Value) -> Result<Vec<u8>, Failure> {
        (self.encode)(value)
    }

    pub fn decode(&self, bytes: &[u8]) -> Result<Value, Failure> {
        (self.decode)(bytes)
    }
}

/// A registered rule.
#[derive(Clone)]
pub struct Rule {
    name: String,
    output: TypeKey,
    params: Vec<TypeKey>,
    demands: Vec<Demand>,
    union_demands: Vec<(String, TypeKey)>,
    persistent: Option<ValueCodec>,
    body: RuleBody,
}

impl fmt::Debug for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rule")
            .field("name", &self.name)
            .field("output", &self.output)
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

impl Rule {
    /// Start building a rule producing values of type `O`.
    pub fn new<O: RuleData>(name: impl Into<String>) -> RuleBuilder {
        RuleBuilder {
            name: name.into(),
            output: TypeKey::of::<O>(),
            params: Vec::new(),
            demands: Vec::new(),
            union_demands: Vec::new(),
            persistent: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn output(&self) -> TypeKey {
        self.output
    }

    pub fn params(&self) -> &[TypeKey] {
        &self.params
    }

    pub fn demands(&self) -> &[Demand] {
        &self.demands
    }

    pub fn union_demands(&self) -> &[(String, TypeKey)] {
        &self.union_demands
    }

    pub fn persistent(&self) -> Option<&ValueCodec> {
        self.persistent.as_ref()
    }

    pub fn invoke(&self, ctx: Context) -> BoxFuture<'static, Result<Value, Failure>> {
        (self.body)(ctx)
    }
}

pub struct RuleBuilder {
    name: String,
    output: TypeKey,
    params: Vec<TypeKey>,
    demands: Vec<Demand>,
    union_demands: Vec<(String, TypeKey)>,
    persistent: Option<ValueCodec>,
}

impl RuleBuilder {
    /// Declare a positional input parameter.
    pub fn param<P: RuleData>(mut self) -> Self {
        self.params.push(TypeKey::of::<P>());
        self
    }

    /// Declare a demand site: the body may `get::<O, I>(..)`.
    pub fn demands<O: RuleData, I: RuleData>(mut self) -> Self {
        self.demands.push(Demand {
            output: TypeKey::of::<O>(),
            input: TypeKey::of::<I>(),
        });
        self
    }

    /// Declare a union demand site: the body may `get_union::<I>(name, ..)`.
    pub fn demands_union<I: RuleData>(mut self, union: impl Into<String>) -> Self {
        self.union_demands.push((union.into(), TypeKey::of::<I>()));
        self
    }

    /// Mark the rule's output as persistable across engine restarts.
    pub fn persistent(mut self, codec: ValueCodec) -> Self {
        self.persistent = Some(codec);
        self
    }

    /// Attach the body and finish the rule.
    pub fn body<F, Fut>(self, f: F) -> Rule
    where
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value, Failure>> + Send + 'static,
    {
        Rule {
            name: self.name,
            output: self.output,
            params: self.params,
            demands: self.demands,
            union_demands: self.union_demands,
            persistent: self.persistent,
            body: Arc::new(move |ctx| Box::pin(f(ctx))),
        }
    }
}

/// A root request shape the engine must be able to answer:
/// (output type, input types supplied by the session).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Query {
    pub output: TypeKey,
    pub params: Vec<TypeKey>,
}

impl Query {
    pub fn new<O: RuleData>(params: impl IntoIterator<Item = TypeKey>) -> Query {
        let mut params: Vec<TypeKey> = params.into_iter().collect();
        params.sort();
        Query {
            output: TypeKey::of::<O>(),
            params,
        }
    }
}

/// Everything registered before validation: rules, union memberships, and
/// the queries sessions will be allowed to submit.
#[derive(Default)]
pub struct RuleRegistry {
    rules: Vec<Rule>,
    unions: BTreeMap<String, Vec<TypeKey>>,
    queries: Vec<Query>,
}

impl RuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, rule: Rule) -> &mut Self {
        self.rules.push(rule);
        self
    }

    /// Register (or extend) a union type's membership.
    pub fn register_union(
        &mut self,
        name: impl Into<String>,
        members: impl IntoIterator<Item = TypeKey>,
    ) -> &mut Self {
        let entry = self.unions.entry(name.into()).or_default();
        for member in members {
            if !entry.contains(&member) {
                entry.push(member);
            }
        }
        entry.sort();
        self
    }

    pub fn register_query(&mut self, query: Query) -> &mut Self {
        if !self.queries.contains(&query) {
            self.queries.push(query);
        }
        self
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn unions(&self) -> &BTreeMap<String, Vec<TypeKey>> {
        &self.unions
    }

    pub fn queries(&self) -> &[Query] {
        &self.queries
    }

    pub(crate) fn into_parts(self) -> (Vec<Rule>, BTreeMap<String, Vec<TypeKey>>, Vec<Query>) {
        (self.rules, self.unions, self.queries)
    }
}
