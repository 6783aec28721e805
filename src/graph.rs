// Copyright 2025-2026 the Foreman Project
// Licensed under the MIT License

//! Static validation of the rule graph.
//!
//! Before a scheduler accepts any work, every declared query and every demand
//! site inside every rule is resolved to exactly one provider rule, given the
//! types in scope at that site: the demanded input type plus the demander's
//! own parameters threaded through as ambient inputs. The result is a
//! dispatch table; at runtime the evaluator indexes into it and never
//! searches by type again.
//!
//! Validation failures are the user-facing contract: `NoRuleProvides` when a
//! demand has no provider, `AmbiguousRule` when it has more than one, and
//! `CycleInRuleTypes` when the chosen providers can recurse forever.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::errors::Failure;
use crate::rules::{Query, Rule, RuleRegistry, TypeKey};

/// A resolved demand site: which rule is asking, for what, given what.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct SiteKey {
    demander: String,
    output: TypeKey,
    input: TypeKey,
}

/// The validated rule set plus its dispatch tables.
pub struct RuleGraph {
    rules: Vec<Rule>,
    unions: BTreeMap<String, Vec<TypeKey>>,
    providers: HashMap<SiteKey, usize>,
    query_providers: HashMap<(TypeKey, Vec<TypeKey>), usize>,
}

impl RuleGraph {
    /// Validate a registry into a usable graph.
    pub fn validate(registry: RuleRegistry) -> Result<RuleGraph, Failure> {
        let (rules, unions, queries) = registry.into_parts();

        for (name, members) in &unions {
            if members.is_empty() {
                return Err(Failure::NoRuleProvides {
                    output: format!("union `{name}`"),
                    inputs: "no registered members".to_string(),
                    origin: "union registration".to_string(),
                });
            }
        }

        // Parameters are addressed by type, so each type may appear once per
        // rule.
        for rule in &rules {
            let mut seen = BTreeSet::new();
            for param in rule.params() {
                if !seen.insert(*param) {
                    return Err(Failure::AmbiguousRule {
                        output: format!("parameter `{param}` of rule `{}`", rule.name()),
                        candidates: vec![rule.name().to_string()],
                    });
                }
            }
        }

        let mut providers = HashMap::new();
        // rule index -> provider indices it can invoke, for cycle detection
        let mut edges: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); rules.len()];

        for (demander_idx, rule) in rules.iter().enumerate() {
            let ambient: Vec<TypeKey> = rule.params().to_vec();

            let mut sites: Vec<(TypeKey, TypeKey)> = rule
                .demands()
                .iter()
                .map(|d| (d.output, d.input))
                .collect();

            // A union demand is a fan-out: one concrete site per member.
            for (union_name, input) in rule.union_demands() {
                let members = unions.get(union_name).ok_or_else(|| {
                    Failure::NoRuleProvides {
                        output: format!("union `{union_name}`"),
                        inputs: "union is not registered".to_string(),
                        origin: format!("rule `{}`", rule.name()),
                    }
                })?;
                for member in members {
                    sites.push((*member, *input));
                }
            }

            for (output, input) in sites {
                let provider = resolve_provider(
                    &rules,
                    output,
                    &scope_types(input, &ambient),
                    &format!("rule `{}`", rule.name()),
                )?;
                edges[demander_idx].insert(provider);
                providers.insert(
                    SiteKey {
                        demander: rule.name().to_string(),
                        output,
                        input,
                    },
                    provider,
                );
            }
        }

        let mut query_providers = HashMap::new();
        for query in &queries {
            let provider = resolve_provider(
                &rules,
                query.output,
                &query.params.iter().copied().collect(),
                &format!("query for `{}`", query.output),
            )?;
            query_providers.insert((query.output, query.params.clone()), provider);
        }

        check_acyclic(&rules, &edges)?;

        Ok(RuleGraph {
            rules,
            unions,
            providers,
            query_providers,
        })
    }

    pub fn rule(&self, idx: usize) -> &Rule {
        &self.rules[idx]
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// The provider chosen at validation time for a demand site.
    pub fn provider_for(
        &self,
        demander: &str,
        output: TypeKey,
        input: TypeKey,
    ) -> Option<usize> {
        self.providers
            .get(&SiteKey {
                demander: demander.to_string(),
                output,
                input,
            })
            .copied()
    }

    /// The provider for a registered root query.
    pub fn query_provider(&self, output: TypeKey, params: &[TypeKey]) -> Option<usize> {
        let mut params = params.to_vec();
        params.sort();
        self.query_providers.get(&(output, params)).copied()
    }

    pub fn union_members(&self, name: &str) -> Option<&[TypeKey]> {
        self.unions.get(name).map(|v| v.as_slice())
    }
}

fn scope_types(input: TypeKey, ambient: &[TypeKey]) -> BTreeSet<TypeKey> {
    let mut scope: BTreeSet<TypeKey> = ambient.iter().copied().collect();
    scope.insert(input);
    scope
}

/// Find the unique rule producing `output` whose parameters are all available
/// in `scope`.
fn resolve_provider(
    rules: &[Rule],
    output: TypeKey,
    scope: &BTreeSet<TypeKey>,
    origin: &str,
) -> Result<usize, Failure> {
    let candidates: Vec<usize> = rules
        .iter()
        .enumerate()
        .filter(|(_, r)| r.output() == output)
        .filter(|(_, r)| r.params().iter().all(|p| scope.contains(p)))
        .map(|(i, _)| i)
        .collect();

    match candidates.len() {
        1 => Ok(candidates[0]),
        0 => Err(Failure::NoRuleProvides {
            output: output.to_string(),
            inputs: scope
                .iter()
                .map(|t| t.to_string())
                .collect::<Vec<_>>()
                .join(", "),
            origin: origin.to_string(),
        }),
        _ => Err(Failure::AmbiguousRule {
            output: output.to_string(),
            candidates: candidates
                .into_iter()
                .map(|i| rules[i].name().to_string())
                .collect(),
        }),
    }
}

/// Depth-first three-color check over the chosen provider edges.
fn check_acyclic(rules: &[Rule], edges: &[BTreeSet<usize>]) -> Result<(), Failure> {
    #[derive(Clone, Copy, PartialEq)]
    enum Color {
        White,
        Gray,
        Black,
    }

    fn visit(
        node: usize,
        rules: &[Rule],
        edges: &[BTreeSet<usize>],
        colors: &mut [Color],
        path: &mut Vec<usize>,
    ) -> Result<(), Failure> {
        colors[node] = Color::Gray;
        path.push(node);

        for &next in &edges[node] {
            match colors[next] {
                Color::Black => {}
                Color::White => visit(next, rules, edges, colors, path)?,
                Color::Gray => {
                    let start = path.iter().position(|&n| n == next).unwrap_or(0);
                    let mut names: Vec<String> = path[start..]
                        .iter()
                        .map(|&i| rules[i].name().to_string())
                        .collect();
                    names.push(rules[next].name().to_string());
                    return Err(Failure::CycleInRuleTypes { path: names });
                }
            }
        }

        path.pop();
        colors[node] = Color::Black;
        Ok(())
    }

    let mut colors = vec![Color::White; rules.len()];
    let mut path = Vec::new();
    for node in 0..rules.len() {
        if colors[node] == Color::White {
            visit(node, rules, edges, &mut colors, &mut path)?;
        }
    }
    Ok(())
}
