//! Reduction and conflict detection for one phase.
//!
//! Runs before the dependency graph is built, so that every provider of a
//! key is known to be legitimate by the time edges are drawn.

use crate::entity::{is_within, Entity, EntityKey};
use crate::error::{Error, Result};
use crate::feature::registry::reduce;
use crate::feature::{Feature, FeatureKind, RequiresProvides};
use crate::layer::Layer;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

/// Collapse identical duplicates into their first occurrence and fold
/// reducible kinds into one feature placed where the first of them was.
pub fn reduce_phase(features: Vec<Feature>) -> Result<Vec<Feature>> {
    let mut kept: Vec<Feature> = Vec::with_capacity(features.len());
    for feature in features {
        match kept
            .iter_mut()
            .find(|k| k.data == feature.data && k.phase() == feature.phase())
        {
            Some(first) => first.merged_from.extend(feature.origins()),
            None => kept.push(feature),
        }
    }

    let reducible: BTreeSet<FeatureKind> = kept
        .iter()
        .map(Feature::kind)
        .filter(|k| k.is_reducible())
        .collect();
    for kind in reducible {
        let Some(merged) = reduce(kind, &kept)? else {
            continue;
        };
        let mut placed = false;
        kept = kept
            .into_iter()
            .filter_map(|f| {
                if f.kind() != kind {
                    Some(f)
                } else if !placed {
                    placed = true;
                    Some(merged.clone())
                } else {
                    None
                }
            })
            .collect();
    }
    Ok(kept)
}

/// Check a reduced phase against itself and against `state`.
///
/// `contracts[i]` belongs to `features[i]`.
pub fn check(features: &[Feature], contracts: &[RequiresProvides], state: &Layer) -> Result<()> {
    check_duplicate_providers(features, contracts)?;
    check_overwrites(features, contracts, state)?;
    check_mounts(features, contracts, state)
}

fn check_duplicate_providers(features: &[Feature], contracts: &[RequiresProvides]) -> Result<()> {
    let mut providers: BTreeMap<EntityKey, Vec<(usize, &Entity)>> = BTreeMap::new();
    for (i, contract) in contracts.iter().enumerate() {
        for entity in &contract.provides {
            providers.entry(entity.key()).or_default().push((i, entity));
        }
    }

    for list in providers.into_values() {
        if list.len() < 2 {
            continue;
        }
        let first = list[0].1;
        let compatible = list
            .iter()
            .all(|(i, e)| *e == first && features[*i].kind().ensures_dirs());
        if !compatible {
            return Err(Error::conflict(
                first,
                list.iter().map(|(i, _)| features[*i].origin_label.clone()),
            ));
        }
    }
    Ok(())
}

fn check_overwrites(features: &[Feature], contracts: &[RequiresProvides], state: &Layer) -> Result<()> {
    for (feature, contract) in features.iter().zip(contracts) {
        for entity in &contract.provides {
            if let Some(existing) = state.lookup(&entity.key()) {
                return Err(Error::conflict(
                    entity,
                    [existing.origin.clone(), feature.origin_label.clone()],
                ));
            }
        }
    }
    Ok(())
}

fn check_mounts(features: &[Feature], contracts: &[RequiresProvides], state: &Layer) -> Result<()> {
    let mut mounts: Vec<(PathBuf, String)> = state
        .mounts()
        .filter_map(|r| match &r.entity {
            Entity::Mount { mountpoint, .. } => Some((mountpoint.clone(), r.origin.clone())),
            _ => None,
        })
        .collect();
    let existing = mounts.len();
    for (feature, contract) in features.iter().zip(contracts) {
        for entity in &contract.provides {
            if let Entity::Mount { mountpoint, .. } = entity {
                mounts.push((mountpoint.clone(), feature.origin_label.clone()));
            }
        }
    }

    for (i, (a, a_origin)) in mounts.iter().enumerate().skip(existing) {
        for (j, (b, b_origin)) in mounts.iter().enumerate() {
            if i != j && (is_within(a, b) || is_within(b, a)) {
                return Err(Error::conflict(
                    EntityKey::Mount(a.clone()),
                    [b_origin.clone(), a_origin.clone()],
                ));
            }
        }
        if let Some(under) = state.paths_under(a).next() {
            return Err(Error::conflict(
                EntityKey::Mount(a.clone()),
                [under.origin.clone(), a_origin.clone()],
            ));
        }
    }

    for (feature, contract) in features.iter().zip(contracts) {
        for entity in &contract.provides {
            let Entity::Path { path, .. } = entity else {
                continue;
            };
            if let Some((mountpoint, origin)) = mounts.iter().find(|(m, _)| is_within(path, m)) {
                return Err(Error::conflict(
                    entity,
                    [
                        format!("{} (mount {})", origin, mountpoint.display()),
                        feature.origin_label.clone(),
                    ],
                ));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feature::{self, RpmActionKind};
    use crate::layer::EntityRecord;

    fn provides(entities: Vec<Entity>) -> RequiresProvides {
        RequiresProvides {
            provides: entities,
            ..Default::default()
        }
    }

    fn conflict_origins(err: Error) -> Vec<String> {
        match err {
            Error::Conflict { origins, .. } => origins,
            other => panic!("expected conflict, got {:?}", other),
        }
    }

    #[test]
    fn test_identical_duplicates_collapse() {
        let features = vec![
            Feature::new("a", feature::mkdir("/x")),
            Feature::new("b", feature::mkdir("/y")),
            Feature::new("c", feature::mkdir("/x")),
        ];
        let reduced = reduce_phase(features).unwrap();
        assert_eq!(reduced.len(), 2);
        assert_eq!(reduced[0].merged_from, vec!["c".to_string()]);
    }

    #[test]
    fn test_rpm_actions_fold_in_place() {
        let features = vec![
            Feature::new("g", feature::genrule(["true"])).with_phase(crate::Phase::PackageManager),
            Feature::new("a", feature::rpm(RpmActionKind::Install, ["foo"])),
            Feature::new("b", feature::rpm(RpmActionKind::Install, ["bar"])),
        ];
        let reduced = reduce_phase(features).unwrap();
        assert_eq!(reduced.len(), 2);
        assert_eq!(reduced[0].origin_label, "g");
        assert_eq!(
            reduced[1].data,
            feature::rpm(RpmActionKind::Install, ["foo", "bar"])
        );
    }

    #[test]
    fn test_duplicate_file_providers_conflict() {
        let features = vec![
            Feature::new("a", feature::install_file("x", "/etc/x")),
            Feature::new("b", feature::install_file("y", "/etc/x")),
        ];
        let contracts = vec![
            provides(vec![Entity::file("/etc/x", 0o644)]),
            provides(vec![Entity::file("/etc/x", 0o644)]),
        ];
        let err = check(&features, &contracts, &Layer::new("p")).unwrap_err();
        assert_eq!(conflict_origins(err), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_shared_ensured_dirs_are_compatible() {
        let features = vec![
            Feature::new("a", feature::ensure_dirs("/a/b")),
            Feature::new("b", feature::ensure_dirs("/a/c")),
        ];
        let contracts = vec![
            provides(vec![Entity::dir("/a", 0o755), Entity::dir("/a/b", 0o755)]),
            provides(vec![Entity::dir("/a", 0o755), Entity::dir("/a/c", 0o755)]),
        ];
        check(&features, &contracts, &Layer::new("p")).unwrap();
    }

    #[test]
    fn test_ensured_dirs_with_different_modes_conflict() {
        let features = vec![
            Feature::new("a", feature::ensure_dirs("/a")),
            Feature::new("b", feature::ensure_dirs("/a")),
        ];
        let contracts = vec![
            provides(vec![Entity::dir("/a", 0o755)]),
            provides(vec![Entity::dir("/a", 0o700)]),
        ];
        assert!(check(&features, &contracts, &Layer::new("p")).is_err());
    }

    #[test]
    fn test_overwrite_of_parent_entity_conflicts() {
        let mut state = Layer::new("p");
        state.insert(EntityRecord::new(Entity::file("/etc/x", 0o644), "//img:parent[3]", None));
        let features = vec![Feature::new("child", feature::install_file("x", "/etc/x"))];
        let contracts = vec![provides(vec![Entity::file("/etc/x", 0o644)])];
        let err = check(&features, &contracts, &state).unwrap_err();
        assert_eq!(
            conflict_origins(err),
            vec!["//img:parent[3]".to_string(), "child".to_string()]
        );
    }

    #[test]
    fn test_nested_mounts_conflict() {
        let features = vec![
            Feature::new("outer", feature::mount("/mnt", "//v:a")),
            Feature::new("inner", feature::mount("/mnt/sub", "//v:b")),
        ];
        let contracts = vec![
            provides(vec![Entity::Mount {
                mountpoint: "/mnt".into(),
                source: "//v:a".into(),
            }]),
            provides(vec![Entity::Mount {
                mountpoint: "/mnt/sub".into(),
                source: "//v:b".into(),
            }]),
        ];
        assert!(check(&features, &contracts, &Layer::new("p")).is_err());
    }

    #[test]
    fn test_write_under_mount_conflicts() {
        let mut state = Layer::new("p");
        state.insert(EntityRecord::new(
            Entity::Mount {
                mountpoint: "/mnt".into(),
                source: "//v:a".into(),
            },
            "parent-mount",
            None,
        ));
        let features = vec![Feature::new("w", feature::mkdir("/mnt/x"))];
        let contracts = vec![provides(vec![Entity::dir("/mnt/x", 0o755)])];
        let origins = conflict_origins(check(&features, &contracts, &state).unwrap_err());
        assert_eq!(origins[1], "w");
        assert!(origins[0].starts_with("parent-mount"));
    }
}
