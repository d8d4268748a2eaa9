//! The per-phase compile driver.
//!
//! A [`LayerBuild`] collects features on top of a parent layer. Compiling it
//! walks the phases in canonical order, skipping empty ones. Each phase is
//! planned against the state left by the phases before it, resolved (for
//! package actions), handed to a [`Materializer`] and then folded into the
//! state:
//!
//! - predictable phases apply exactly what their features declared;
//! - unpredictable phases apply whatever the materializer reports, since
//!   nothing else can know what a script or a package transaction did.
//!
//! # Example
//!
//! ```rust
//! use layer_compiler::compiler::LayerBuild;
//! use layer_compiler::feature::{self, Feature};
//!
//! let mut build = LayerBuild::new("//img:app", None);
//! build.add_feature(Feature::new("dirs", feature::ensure_dirs("/a/b"))).unwrap();
//! build.add_feature(Feature::new("link", feature::symlink("/a/b/c", "/a"))).unwrap();
//! let compiled = build.plan().unwrap();
//! assert_eq!(compiled.steps[0].order, vec!["dirs", "link"]);
//! ```

mod resolve;

pub use resolve::{CommandResolver, PackageResolver, PassthroughResolver, Transaction};

use crate::cache::{CacheEntry, KeyInputs, PhaseCache};
use crate::depgraph::{plan_phase, OrderedPhase};
use crate::entity::EntityKey;
use crate::error::{Error, Result};
use crate::feature::{ExtractContext, Feature, FeatureData, RpmItem};
use crate::layer::{EntityRecord, Layer, PhaseOutcome};
use crate::partition::partition;
use crate::phase::Phase;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Everything a materializer gets for one phase.
#[derive(Debug, Clone, Copy)]
pub struct PhaseInput<'a> {
    pub layer_label: &'a str,
    pub phase: &'a OrderedPhase,
    /// Set for phases that carry package actions.
    pub transaction: Option<&'a Transaction>,
    /// State before the phase.
    pub state: &'a Layer,
}

/// Performs the side effects of a phase.
pub trait Materializer {
    /// Apply `input.phase` and report what changed. The report is
    /// authoritative for unpredictable phases only.
    fn materialize(&mut self, input: &PhaseInput<'_>) -> anyhow::Result<PhaseOutcome>;

    /// Directory holding the image, if there is one to snapshot.
    fn root(&self) -> Option<&Path> {
        None
    }

    /// Base of relative sources, used when the build does not set one.
    fn sources_dir(&self) -> Option<&Path> {
        None
    }
}

/// Touches nothing and reports the declared outcome.
#[derive(Debug, Clone, Copy, Default)]
pub struct DryRunMaterializer;

impl Materializer for DryRunMaterializer {
    fn materialize(&mut self, input: &PhaseInput<'_>) -> anyhow::Result<PhaseOutcome> {
        Ok(declared_outcome(input.phase, input.state))
    }
}

/// What a planned phase declares it will do. Path removals take the whole
/// subtree present in `state`.
pub fn declared_outcome(ordered: &OrderedPhase, state: &Layer) -> PhaseOutcome {
    let mut outcome = PhaseOutcome::default();
    for step in &ordered.steps {
        for key in &step.contract.removes {
            match key {
                EntityKey::Path(path) => {
                    outcome
                        .removed
                        .extend(state.paths_under(path).map(|r| r.entity.key()));
                }
                other if state.contains(other) => outcome.removed.push(other.clone()),
                _ => {}
            }
        }
        outcome.provided.extend(step.contract.provides.iter().map(|entity| {
            EntityRecord::new(
                entity.clone(),
                step.feature.origin_label.clone(),
                Some(ordered.phase),
            )
        }));
    }
    outcome
}

/// One compiled phase.
#[derive(Debug, Clone, Serialize)]
pub struct PhaseStep {
    pub phase: Phase,
    pub order: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction: Option<Transaction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_key: Option<String>,
    pub cached: bool,
}

/// Output of a layer build.
#[derive(Debug, Clone, Serialize)]
pub struct CompiledLayer {
    pub layer: Layer,
    pub steps: Vec<PhaseStep>,
}

/// A layer under construction.
#[derive(Debug, Clone)]
pub struct LayerBuild {
    label: String,
    parent: Layer,
    features: Vec<Feature>,
    dependencies: BTreeMap<String, Layer>,
    sources_dir: Option<PathBuf>,
}

impl LayerBuild {
    /// Start a build of `label` on top of `parent`, or on an empty image.
    /// The parent is also available to `clone` features.
    pub fn new(label: impl Into<String>, parent: Option<&Layer>) -> Self {
        let label = label.into();
        let mut dependencies = BTreeMap::new();
        let parent = match parent {
            Some(parent) => {
                dependencies.insert(parent.label.clone(), parent.clone());
                Layer::child_of(parent, label.clone())
            }
            None => Layer::new(label.clone()),
        };
        Self {
            label,
            parent,
            features: Vec::new(),
            dependencies,
            sources_dir: None,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn features(&self) -> &[Feature] {
        &self.features
    }

    pub fn add_feature(&mut self, feature: Feature) -> Result<()> {
        feature.validate(&self.label)?;
        self.features.push(feature);
        Ok(())
    }

    pub fn add_features(&mut self, features: impl IntoIterator<Item = Feature>) -> Result<()> {
        for feature in features {
            self.add_feature(feature)?;
        }
        Ok(())
    }

    /// Make `layer` available to `clone` features under its label.
    pub fn add_layer_dependency(&mut self, layer: Layer) {
        self.dependencies.insert(layer.label.clone(), layer);
    }

    /// Base directory for relative `install_files` sources.
    pub fn with_sources_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.sources_dir = Some(dir.into());
        self
    }

    /// Compile without side effects.
    pub fn plan(&self) -> Result<CompiledLayer> {
        self.compile(&mut DryRunMaterializer, &PassthroughResolver, None)
    }

    #[tracing::instrument(skip_all, fields(layer = %self.label))]
    pub fn compile(
        &self,
        materializer: &mut dyn Materializer,
        resolver: &dyn PackageResolver,
        cache: Option<&PhaseCache>,
    ) -> Result<CompiledLayer> {
        let mut state = self.parent.clone();
        let mut steps = Vec::new();
        let mut previous_key = match cache {
            Some(_) => Some(PhaseCache::seed_key(&self.parent).map_err(cache_error)?),
            None => None,
        };
        // A run of cache hits only needs the last snapshot, restored before
        // the first phase that actually runs.
        let mut pending_restore: Option<CacheEntry> = None;
        let sources_dir = self
            .sources_dir
            .clone()
            .or_else(|| materializer.sources_dir().map(Path::to_path_buf));
        let inputs = KeyInputs {
            sources_dir: sources_dir.as_deref(),
            dependencies: Some(&self.dependencies),
        };

        for bucket in partition(self.features.iter().cloned()) {
            let ctx = ExtractContext {
                layer_label: &self.label,
                state: &state,
                dependencies: &self.dependencies,
                sources_dir: sources_dir.as_deref(),
            };
            let ordered = plan_phase(bucket, &ctx)?;
            let phase = ordered.phase;
            let transaction = resolve_packages(&ordered, &state, resolver)?;

            let key = match (cache, &previous_key) {
                (Some(_), Some(previous)) => Some(
                    PhaseCache::phase_key(
                        previous,
                        phase,
                        ordered.features(),
                        transaction.as_ref(),
                        &inputs,
                    )
                    .map_err(cache_error)?,
                ),
                _ => None,
            };

            if let (Some(cache), Some(key)) = (cache, &key) {
                if let Some(entry) = cache.get(key).map_err(cache_error)? {
                    tracing::info!(%phase, key = %key, "phase cached");
                    state.apply(&entry.outcome);
                    if entry.snapshot.is_some() {
                        pending_restore = Some(entry);
                    }
                    steps.push(PhaseStep {
                        phase,
                        order: ordered.labels(),
                        transaction,
                        cache_key: Some(key.clone()),
                        cached: true,
                    });
                    previous_key = Some(key.clone());
                    continue;
                }
            }

            let _lock = match (cache, &key) {
                (Some(cache), Some(key)) => Some(cache.lock(key).map_err(cache_error)?),
                _ => None,
            };
            if let (Some(cache), Some(entry)) = (cache, pending_restore.take()) {
                restore(cache, &entry, materializer.root())?;
            }

            tracing::info!(%phase, features = ordered.steps.len(), "materializing phase");
            let input = PhaseInput {
                layer_label: &self.label,
                phase: &ordered,
                transaction: transaction.as_ref(),
                state: &state,
            };
            let reported = materializer
                .materialize(&input)
                .map_err(|e| Error::materialization(phase, e))?;
            let outcome = if phase.is_predictable() {
                declared_outcome(&ordered, &state)
            } else {
                reported
            };
            tracing::debug!(
                %phase,
                provided = outcome.provided.len(),
                removed = outcome.removed.len(),
                "phase applied"
            );
            state.apply(&outcome);

            if let (Some(cache), Some(key)) = (cache, &key) {
                let entry = CacheEntry {
                    key: key.clone(),
                    phase,
                    layer_label: self.label.clone(),
                    order: ordered.labels(),
                    outcome,
                    snapshot: None,
                    stored_at_unix: 0,
                };
                cache
                    .store(entry, materializer.root())
                    .map_err(cache_error)?;
            }
            steps.push(PhaseStep {
                phase,
                order: ordered.labels(),
                transaction,
                cache_key: key.clone(),
                cached: false,
            });
            previous_key = key;
        }

        if let (Some(cache), Some(entry)) = (cache, pending_restore.take()) {
            restore(cache, &entry, materializer.root())?;
        }

        state.label = self.label.clone();
        Ok(CompiledLayer {
            layer: state,
            steps,
        })
    }
}

/// Resolve the phase's package actions, if it has any. The resolver is
/// called once per phase.
fn resolve_packages(
    ordered: &OrderedPhase,
    state: &Layer,
    resolver: &dyn PackageResolver,
) -> Result<Option<Transaction>> {
    let mut items: Vec<RpmItem> = Vec::new();
    let mut origins = Vec::new();
    for feature in ordered.features() {
        if let FeatureData::RpmAction(action) = &feature.data {
            items.extend(action.items.iter().cloned());
            origins.extend(feature.origins());
        }
    }
    if items.is_empty() {
        return Ok(None);
    }
    let transaction = resolver
        .resolve(&items, state)
        .map_err(|e| Error::PackageResolution {
            origins,
            message: format!("{:#}", e),
        })?;
    tracing::debug!(items = transaction.items.len(), "resolved package transaction");
    Ok(Some(transaction))
}

fn restore(cache: &PhaseCache, entry: &CacheEntry, root: Option<&Path>) -> Result<()> {
    let Some(root) = root else {
        return Ok(());
    };
    tracing::info!(phase = %entry.phase, "restoring cached root");
    cache.restore(entry, root).map_err(cache_error)
}

fn cache_error(e: anyhow::Error) -> Error {
    Error::Cache(format!("{:#}", e))
}
