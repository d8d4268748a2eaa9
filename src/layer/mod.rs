//! The entity set of an image layer.
//!
//! A [`Layer`] is both the output of a build and the state a build runs
//! against: it starts as a copy of the parent layer (or the implicit root
//! entities) and each phase applies its [`PhaseOutcome`].
//!
//! Layers serialize to JSON as `{"label": ..., "entities": [...]}` so that a
//! compiled layer can be loaded as the parent of the next one.

pub mod crawl;

use crate::entity::{is_within, normalize_path, Entity, EntityKey, FileType};
use crate::phase::Phase;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Origin recorded for the entities every layer starts with.
pub const IMPLICIT_ORIGIN: &str = "<implicit root>";

/// Symlink hops followed while resolving one path.
const MAX_SYMLINK_HOPS: usize = 40;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub entity: Entity,
    /// Label of the feature (or layer) that provided the entity.
    pub origin: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<Phase>,
}

impl EntityRecord {
    pub fn new(entity: Entity, origin: impl Into<String>, phase: Option<Phase>) -> Self {
        Self {
            entity,
            origin: origin.into(),
            phase,
        }
    }
}

/// What a phase changed: entities added or redefined, and keys removed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseOutcome {
    pub provided: Vec<EntityRecord>,
    pub removed: Vec<EntityKey>,
}

impl PhaseOutcome {
    pub fn is_empty(&self) -> bool {
        self.provided.is_empty() && self.removed.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "LayerFile", try_from = "LayerFile")]
pub struct Layer {
    pub label: String,
    entities: BTreeMap<EntityKey, EntityRecord>,
}

#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct LayerFile {
    label: String,
    entities: Vec<EntityRecord>,
}

impl From<Layer> for LayerFile {
    fn from(layer: Layer) -> Self {
        LayerFile {
            label: layer.label,
            entities: layer.entities.into_values().collect(),
        }
    }
}

impl TryFrom<LayerFile> for Layer {
    type Error = String;

    fn try_from(file: LayerFile) -> std::result::Result<Self, String> {
        let mut entities = BTreeMap::new();
        for record in file.entities {
            let key = record.entity.key();
            if entities.insert(key.clone(), record).is_some() {
                return Err(format!("duplicate entity {} in layer '{}'", key, file.label));
            }
        }
        Ok(Layer {
            label: file.label,
            entities,
        })
    }
}

impl Layer {
    /// An empty image: the root directory plus the root user and group.
    pub fn new(label: impl Into<String>) -> Self {
        let mut layer = Layer {
            label: label.into(),
            entities: BTreeMap::new(),
        };
        for entity in [
            Entity::dir("/", 0o755),
            Entity::user("root"),
            Entity::group("root"),
        ] {
            layer.insert(EntityRecord::new(entity, IMPLICIT_ORIGIN, None));
        }
        layer
    }

    /// Start a new build on top of `parent`.
    pub fn child_of(parent: &Layer, label: impl Into<String>) -> Self {
        Layer {
            label: label.into(),
            entities: parent.entities.clone(),
        }
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn records(&self) -> impl Iterator<Item = &EntityRecord> {
        self.entities.values()
    }

    /// Exact-key lookup, no symlink resolution.
    pub fn get(&self, key: &EntityKey) -> Option<&EntityRecord> {
        self.entities.get(key)
    }

    pub fn contains(&self, key: &EntityKey) -> bool {
        self.entities.contains_key(key)
    }

    /// Lookup with symlinked ancestors resolved. A path key whose parent
    /// chain passes through a symlink is looked up at the link's target.
    pub fn lookup(&self, key: &EntityKey) -> Option<&EntityRecord> {
        match key {
            EntityKey::Path(path) => self
                .get(key)
                .or_else(|| self.get(&EntityKey::Path(self.resolve_path(path)))),
            _ => self.get(key),
        }
    }

    /// Rewrite `path` so that none of its proper ancestors is a symlink.
    /// The final component is kept even when it is a symlink.
    pub fn resolve_path(&self, path: &Path) -> PathBuf {
        let mut current = normalize_path(path);
        for _ in 0..MAX_SYMLINK_HOPS {
            let Some((link, target)) = self.first_symlinked_ancestor(&current) else {
                return current;
            };
            let rest = current.strip_prefix(&link).unwrap_or(Path::new(""));
            current = normalize_path(&target.join(rest));
        }
        current
    }

    fn first_symlinked_ancestor(&self, path: &Path) -> Option<(PathBuf, PathBuf)> {
        let mut ancestors: Vec<&Path> = path.ancestors().skip(1).collect();
        ancestors.reverse();
        for ancestor in ancestors {
            if let Some(record) = self.get(&EntityKey::path(ancestor)) {
                if let Some(target) = record.entity.absolute_symlink_target() {
                    return Some((ancestor.to_path_buf(), target));
                }
            }
        }
        None
    }

    /// Path entities at or below `base`.
    pub fn paths_under<'a>(&'a self, base: &'a Path) -> impl Iterator<Item = &'a EntityRecord> + 'a {
        self.entities
            .range(EntityKey::Path(base.to_path_buf())..)
            .take_while(move |(k, _)| matches!(k, EntityKey::Path(p) if is_within(p, base)))
            .map(|(_, r)| r)
    }

    /// Mount entities in the layer.
    pub fn mounts(&self) -> impl Iterator<Item = &EntityRecord> {
        self.entities
            .iter()
            .filter(|(k, _)| matches!(k, EntityKey::Mount(_)))
            .map(|(_, r)| r)
    }

    pub fn insert(&mut self, record: EntityRecord) -> Option<EntityRecord> {
        self.entities.insert(record.entity.key(), record)
    }

    pub fn remove(&mut self, key: &EntityKey) -> Option<EntityRecord> {
        self.entities.remove(key)
    }

    /// Remove `path` and every path below it. Returns the removed keys.
    pub fn remove_tree(&mut self, path: &Path) -> Vec<EntityKey> {
        let keys: Vec<EntityKey> = self.paths_under(path).map(|r| r.entity.key()).collect();
        for key in &keys {
            self.entities.remove(key);
        }
        keys
    }

    /// Apply a phase outcome: removals first, then provides.
    pub fn apply(&mut self, outcome: &PhaseOutcome) {
        for key in &outcome.removed {
            self.entities.remove(key);
        }
        for record in &outcome.provided {
            self.insert(record.clone());
        }
    }

    /// Whether `key` names a directory in this layer.
    pub fn is_dir(&self, key: &EntityKey) -> bool {
        self.lookup(key)
            .and_then(|r| r.entity.file_type())
            .map_or(false, |ft| ft == FileType::Directory)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read layer file '{}'", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse layer file '{}'", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create directory '{}'", parent.display())
                })?;
            }
        }
        let json = serde_json::to_string_pretty(self).context("Failed to serialize layer")?;
        fs::write(path, json + "\n")
            .with_context(|| format!("Failed to write layer file '{}'", path.display()))
    }

    /// Build a layer by crawling an existing root filesystem.
    pub fn from_rootfs(label: impl Into<String>, root: &Path) -> Result<Self> {
        let label = label.into();
        let mut layer = Layer {
            label: label.clone(),
            entities: BTreeMap::new(),
        };
        for entity in crawl::crawl(root)? {
            layer.insert(EntityRecord::new(entity, label.clone(), None));
        }
        Ok(layer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn layer_with(entities: Vec<Entity>) -> Layer {
        let mut layer = Layer::new("//img:test");
        for entity in entities {
            layer.insert(EntityRecord::new(entity, "fixture", Some(Phase::Compile)));
        }
        layer
    }

    #[test]
    fn test_new_layer_has_implicit_root() {
        let layer = Layer::new("x");
        assert!(layer.is_dir(&EntityKey::path("/")));
        assert!(layer.contains(&EntityKey::User("root".into())));
        assert!(layer.contains(&EntityKey::Group("root".into())));
        assert_eq!(layer.len(), 3);
    }

    #[test]
    fn test_lookup_resolves_symlinked_ancestor() {
        let layer = layer_with(vec![
            Entity::dir("/x", 0o755),
            Entity::dir("/x/b", 0o755),
            Entity::symlink("/a", "/x"),
        ]);
        let record = layer.lookup(&EntityKey::path("/a/b")).unwrap();
        assert_eq!(record.entity.key(), EntityKey::path("/x/b"));
        assert_eq!(layer.resolve_path(Path::new("/a/b/c")), PathBuf::from("/x/b/c"));
    }

    #[test]
    fn test_lookup_relative_symlink_chain() {
        let layer = layer_with(vec![
            Entity::dir("/usr", 0o755),
            Entity::dir("/usr/lib", 0o755),
            Entity::symlink("/lib", "usr/lib"),
            Entity::symlink("/lib64", "lib"),
        ]);
        assert!(!layer.is_dir(&EntityKey::path("/lib64")));
        assert_eq!(
            layer.resolve_path(Path::new("/lib64/libc.so")),
            PathBuf::from("/usr/lib/libc.so")
        );
    }

    #[test]
    fn test_symlink_loop_terminates() {
        let layer = layer_with(vec![Entity::symlink("/a", "/b"), Entity::symlink("/b", "/a")]);
        let _ = layer.resolve_path(Path::new("/a/c"));
    }

    #[test]
    fn test_remove_tree() {
        let mut layer = layer_with(vec![
            Entity::dir("/a", 0o755),
            Entity::dir("/a/b", 0o755),
            Entity::file("/a/b/f", 0o644),
            Entity::dir("/ab", 0o755),
        ]);
        let removed = layer.remove_tree(Path::new("/a"));
        assert_eq!(removed.len(), 3);
        assert!(layer.contains(&EntityKey::path("/ab")), "sibling prefix must survive");
        assert!(!layer.contains(&EntityKey::path("/a/b/f")));
    }

    #[test]
    fn test_save_load() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("out/layer.json");
        let layer = layer_with(vec![Entity::symlink("/a", "/x")]);
        layer.save(&path).unwrap();
        let loaded = Layer::load(&path).unwrap();
        assert_eq!(loaded, layer);
    }

    #[test]
    fn test_load_rejects_duplicates() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("layer.json");
        let record = r#"{"entity": {"kind": "user", "name": "a"}, "origin": "x"}"#;
        fs::write(
            &path,
            format!(r#"{{"label": "l", "entities": [{}, {}]}}"#, record, record),
        )
        .unwrap();
        let err = Layer::load(&path).unwrap_err();
        assert!(format!("{:#}", err).contains("duplicate entity"), "{:#}", err);
    }

    #[test]
    fn test_apply_outcome() {
        let mut layer = layer_with(vec![Entity::file("/old", 0o644)]);
        layer.apply(&PhaseOutcome {
            provided: vec![EntityRecord::new(Entity::file("/new", 0o644), "f", None)],
            removed: vec![EntityKey::path("/old")],
        });
        assert!(layer.contains(&EntityKey::path("/new")));
        assert!(!layer.contains(&EntityKey::path("/old")));
    }
}
