//! Intra-phase dependency graph and ordering.
//!
//! Nodes are the features of one phase. Every `before` requirement draws an
//! edge from each same-phase provider to the requiring feature; anything
//! not provided in the phase must already be in the state. Predictable
//! phases are then sorted with Kahn's algorithm, taking the
//! earliest-declared ready feature first, so the order is stable and
//! sorting an already sorted phase is a no-op.
//!
//! Unpredictable phases are a single barrier: requirements are still
//! validated against the state, but features run in declaration order,
//! except removals, which run deepest path first.

pub mod conflict;

use crate::entity::{normalize_path, Entity, EntityKey, Expect, FileType, Requirement};
use crate::error::{Error, Result};
use crate::feature::requires_provides::extract_all;
use crate::feature::{ExtractContext, Feature, FeatureData, RequiresProvides};
use crate::layer::Layer;
use crate::partition::PhaseBucket;
use crate::phase::Phase;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::{Path, PathBuf};

const MAX_SYMLINK_HOPS: usize = 40;

/// A feature with its extracted contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedFeature {
    pub feature: Feature,
    pub contract: RequiresProvides,
}

/// One phase, reduced, checked and ordered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderedPhase {
    pub phase: Phase,
    pub steps: Vec<PlannedFeature>,
}

impl OrderedPhase {
    pub fn labels(&self) -> Vec<String> {
        self.steps
            .iter()
            .map(|s| s.feature.origin_label.clone())
            .collect()
    }

    pub fn features(&self) -> impl Iterator<Item = &Feature> {
        self.steps.iter().map(|s| &s.feature)
    }
}

/// Serializable view of a planned phase.
#[derive(Debug, Clone, Serialize)]
pub struct PhaseSummary {
    pub phase: Phase,
    pub order: Vec<String>,
}

impl From<&OrderedPhase> for PhaseSummary {
    fn from(ordered: &OrderedPhase) -> Self {
        PhaseSummary {
            phase: ordered.phase,
            order: ordered.labels(),
        }
    }
}

/// Reduce, extract, check and order one phase against `ctx.state`.
#[tracing::instrument(level = "debug", skip_all, fields(phase = %bucket.phase, features = bucket.features.len()))]
pub fn plan_phase(bucket: PhaseBucket, ctx: &ExtractContext<'_>) -> Result<OrderedPhase> {
    let phase = bucket.phase;
    let features = conflict::reduce_phase(bucket.features)?;
    let contracts = extract_all(&features, ctx)?;
    conflict::check(&features, &contracts, ctx.state)?;

    let graph = DepGraph::build(phase, &features, &contracts, ctx.state)?;
    let order = if phase.is_predictable() {
        graph.sort()?
    } else {
        barrier_order(&features)
    };
    tracing::debug!(edges = graph.edge_count(), "ordered phase {}", phase);

    let mut slots: Vec<Option<PlannedFeature>> = features
        .into_iter()
        .zip(contracts)
        .map(|(feature, contract)| Some(PlannedFeature { feature, contract }))
        .collect();
    let steps = order.into_iter().filter_map(|i| slots[i].take()).collect();
    Ok(OrderedPhase { phase, steps })
}

/// Declaration order, with removals moved first and deepest path first.
pub fn barrier_order(features: &[Feature]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..features.len()).collect();
    order.sort_by_key(|&i| match &features[i].data {
        FeatureData::Remove(r) => (0, std::cmp::Reverse(r.path.components().count())),
        _ => (1, std::cmp::Reverse(0)),
    });
    order
}

/// Dependency edges between the features of one phase.
#[derive(Debug, Clone)]
pub struct DepGraph {
    phase: Phase,
    labels: Vec<String>,
    /// `dependents[p]`: features that must run after `p`.
    dependents: Vec<BTreeSet<usize>>,
}

impl DepGraph {
    /// Resolve every requirement and draw the edges.
    pub fn build(
        phase: Phase,
        features: &[Feature],
        contracts: &[RequiresProvides],
        state: &Layer,
    ) -> Result<Self> {
        let view = View::new(contracts, state);
        let mut dependents = vec![BTreeSet::new(); features.len()];

        for (i, contract) in contracts.iter().enumerate() {
            for requirement in &contract.requires {
                let resolved = view.resolve(requirement).map_err(|found| {
                    Error::UnsatisfiedRequirement {
                        required_by: features[i].origin_label.clone(),
                        requirement: requirement.clone(),
                        found,
                    }
                })?;
                if requirement.is_ordered() {
                    for provider in resolved {
                        dependents[provider].insert(i);
                    }
                }
            }
        }

        Ok(DepGraph {
            phase,
            labels: features.iter().map(|f| f.origin_label.clone()).collect(),
            dependents,
        })
    }

    pub fn edge_count(&self) -> usize {
        self.dependents.iter().map(BTreeSet::len).sum()
    }

    /// Whether `dependent` must run after `provider`.
    pub fn has_edge(&self, provider: usize, dependent: usize) -> bool {
        self.dependents
            .get(provider)
            .map_or(false, |d| d.contains(&dependent))
    }

    /// Kahn's algorithm with the ready set ordered by declaration index.
    pub fn sort(&self) -> Result<Vec<usize>> {
        let n = self.dependents.len();
        let mut in_degree = vec![0usize; n];
        for deps in &self.dependents {
            for &d in deps {
                in_degree[d] += 1;
            }
        }

        let mut ready: BTreeSet<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
        let mut order = Vec::with_capacity(n);
        while let Some(node) = ready.pop_first() {
            order.push(node);
            for &d in &self.dependents[node] {
                in_degree[d] -= 1;
                if in_degree[d] == 0 {
                    ready.insert(d);
                }
            }
        }

        if order.len() < n {
            let remaining: BTreeSet<usize> = (0..n).filter(|&i| in_degree[i] > 0).collect();
            let cycle = self.minimal_cycle(&remaining);
            return Err(Error::Cycle {
                phase: self.phase,
                cycle: cycle.iter().map(|&i| self.labels[i].clone()).collect(),
            });
        }
        Ok(order)
    }

    /// Shortest cycle among `nodes`, starting and ending at its
    /// earliest-declared member.
    fn minimal_cycle(&self, nodes: &BTreeSet<usize>) -> Vec<usize> {
        let mut best: Option<Vec<usize>> = None;
        for &start in nodes {
            let Some(path) = self.shortest_path_back(start, nodes) else {
                continue;
            };
            if best.as_ref().map_or(true, |b| path.len() < b.len()) {
                best = Some(path);
            }
        }
        best.unwrap_or_default()
    }

    /// BFS from `start` back to itself within `nodes`. The returned path
    /// begins and ends with `start`.
    fn shortest_path_back(&self, start: usize, nodes: &BTreeSet<usize>) -> Option<Vec<usize>> {
        let mut parent: BTreeMap<usize, usize> = BTreeMap::new();
        let mut queue = VecDeque::from([start]);
        while let Some(node) = queue.pop_front() {
            for &next in &self.dependents[node] {
                if !nodes.contains(&next) {
                    continue;
                }
                if next == start {
                    let mut path = vec![node];
                    let mut cur = node;
                    while cur != start {
                        match parent.get(&cur) {
                            Some(&p) => cur = p,
                            None => break,
                        }
                        path.push(cur);
                    }
                    path.reverse();
                    path.push(start);
                    return Some(path);
                }
                if next != start && !parent.contains_key(&next) {
                    parent.insert(next, node);
                    queue.push_back(next);
                }
            }
        }
        None
    }
}

/// Combined view of the state and the phase's own provides.
struct View<'a> {
    state: &'a Layer,
    providers: BTreeMap<EntityKey, (Vec<usize>, &'a Entity)>,
}

impl<'a> View<'a> {
    fn new(contracts: &'a [RequiresProvides], state: &'a Layer) -> Self {
        let mut providers: BTreeMap<EntityKey, (Vec<usize>, &'a Entity)> = BTreeMap::new();
        for (i, contract) in contracts.iter().enumerate() {
            for entity in &contract.provides {
                providers
                    .entry(entity.key())
                    .or_insert_with(|| (Vec::new(), entity))
                    .0
                    .push(i);
            }
        }
        View { state, providers }
    }

    /// Entity at exactly `key`, and the same-phase features providing it.
    fn get(&self, key: &EntityKey) -> Option<(&Entity, &[usize])> {
        if let Some((indices, entity)) = self.providers.get(key) {
            return Some((*entity, indices.as_slice()));
        }
        self.state.get(key).map(|r| (&r.entity, &[][..]))
    }

    /// Resolve a requirement to the same-phase providers it depends on.
    ///
    /// Symlinked ancestors are followed, and so is a symlink at the key
    /// itself when a file or directory is expected. On failure returns the
    /// kind of whatever was found, if anything.
    fn resolve(&self, requirement: &Requirement) -> std::result::Result<Vec<usize>, Option<String>> {
        let EntityKey::Path(path) = &requirement.key else {
            return match self.get(&requirement.key) {
                Some((entity, providers)) if requirement.expect.satisfied_by(entity) => {
                    Ok(providers.to_vec())
                }
                Some((entity, _)) => Err(Some(entity.kind_name().to_string())),
                None => Err(None),
            };
        };

        let mut used = Vec::new();
        let mut current = normalize_path(path);
        for _ in 0..MAX_SYMLINK_HOPS {
            if let Some((link, target, providers)) = self.first_symlinked_ancestor(&current) {
                used.extend_from_slice(providers);
                let rest = current.strip_prefix(&link).unwrap_or(Path::new("")).to_path_buf();
                current = normalize_path(&target.join(rest));
                continue;
            }
            let Some((entity, providers)) = self.get(&EntityKey::Path(current.clone())) else {
                return Err(None);
            };
            used.extend_from_slice(providers);
            let follow = matches!(requirement.expect, Expect::FileType(ft) if ft != FileType::Symlink);
            match entity.absolute_symlink_target() {
                Some(target) if follow => current = target,
                _ if requirement.expect.satisfied_by(entity) => return Ok(used),
                _ => return Err(Some(entity.kind_name().to_string())),
            }
        }
        Err(Some("symlink loop".to_string()))
    }

    fn first_symlinked_ancestor(&self, path: &Path) -> Option<(PathBuf, PathBuf, &[usize])> {
        let mut ancestors: Vec<&Path> = path.ancestors().skip(1).collect();
        ancestors.reverse();
        for ancestor in ancestors {
            if let Some((entity, providers)) = self.get(&EntityKey::path(ancestor)) {
                if let Some(target) = entity.absolute_symlink_target() {
                    return Some((ancestor.to_path_buf(), target, providers));
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests;
