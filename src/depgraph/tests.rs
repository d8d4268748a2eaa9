use super::*;
use crate::entity::Entity;
use crate::feature::{self, RpmActionKind};
use crate::layer::EntityRecord;
use crate::partition::partition;

fn plan_single(features: Vec<Feature>, state: &Layer) -> Result<OrderedPhase> {
    let deps = BTreeMap::new();
    let ctx = ExtractContext {
        layer_label: "//img:test",
        state,
        dependencies: &deps,
        sources_dir: None,
    };
    let mut buckets = partition(features);
    assert_eq!(buckets.len(), 1, "fixture must stay within one phase");
    plan_phase(buckets.remove(0), &ctx)
}

fn labels(features: &[(&str, FeatureData)]) -> Vec<Feature> {
    features
        .iter()
        .map(|(label, data)| Feature::new(*label, data.clone()))
        .collect()
}

fn cycle_of(err: Error) -> Vec<String> {
    match err {
        Error::Cycle { cycle, .. } => cycle,
        other => panic!("expected cycle, got {:?}", other),
    }
}

#[test]
fn test_dirs_before_install() {
    let state = Layer::new("p");
    let ordered = plan_single(
        labels(&[
            ("ensure", feature::ensure_dirs("/a/b")),
            ("install", feature::install_file("src", "/a/b/c")),
        ]),
        &state,
    )
    .unwrap();
    assert_eq!(ordered.phase, Phase::Compile);
    assert_eq!(ordered.labels(), vec!["ensure", "install"]);
}

#[test]
fn test_provider_declared_later_runs_first() {
    let state = Layer::new("p");
    let ordered = plan_single(
        labels(&[
            ("install", feature::install_file("src", "/a/b/c")),
            ("ensure", feature::ensure_dirs("/a/b")),
            ("other", feature::mkdir("/z")),
        ]),
        &state,
    )
    .unwrap();
    assert_eq!(ordered.labels(), vec!["ensure", "install", "other"]);
}

#[test]
fn test_sort_is_idempotent() {
    let state = Layer::new("p");
    let input = labels(&[
        ("link", feature::symlink("/a/b/c", "/a")),
        ("z", feature::mkdir("/z")),
        ("ensure", feature::ensure_dirs("/a/b")),
        ("y", feature::mkdir("/y")),
    ]);
    let first = plan_single(input.clone(), &state).unwrap();
    let again = plan_single(input, &state).unwrap();
    assert_eq!(first.labels(), again.labels());

    let resorted: Vec<Feature> = first.features().cloned().collect();
    let second = plan_single(resorted, &state).unwrap();
    assert_eq!(first.labels(), second.labels());
    assert_eq!(first.labels(), vec!["z", "ensure", "link", "y"]);
}

#[test]
fn test_missing_parent_dir_is_unsatisfied() {
    let state = Layer::new("p");
    let err = plan_single(labels(&[("install", feature::install_file("src", "/a/b/c"))]), &state)
        .unwrap_err();
    match &err {
        Error::UnsatisfiedRequirement {
            required_by,
            requirement,
            found,
        } => {
            assert_eq!(required_by, "install");
            assert_eq!(requirement.to_string(), "(dir, \"/a/b\")");
            assert!(found.is_none());
        }
        other => panic!("expected unsatisfied requirement, got {:?}", other),
    }
}

#[test]
fn test_parent_provided_dir_satisfies() {
    let mut state = Layer::new("p");
    state.insert(EntityRecord::new(Entity::dir("/a", 0o755), "parent", None));
    state.insert(EntityRecord::new(Entity::dir("/a/b", 0o755), "parent", None));
    let ordered =
        plan_single(labels(&[("install", feature::install_file("src", "/a/b/c"))]), &state).unwrap();
    assert_eq!(ordered.labels(), vec!["install"]);
}

#[test]
fn test_duplicate_install_conflicts() {
    let state = Layer::new("p");
    let err = plan_single(
        labels(&[
            ("one", feature::install_file("src1", "/x")),
            ("two", feature::install_file("src2", "/x")),
        ]),
        &state,
    )
    .unwrap_err();
    match err {
        Error::Conflict { key, origins } => {
            assert_eq!(key, "(file, \"/x\")");
            assert_eq!(origins, vec!["one".to_string(), "two".to_string()]);
        }
        other => panic!("expected conflict, got {:?}", other),
    }
}

#[test]
fn test_providers_of_different_kinds_conflict() {
    let state = Layer::new("p");
    for second in [feature::install_file("src", "/x"), feature::symlink("/x", "/")] {
        let err = plan_single(
            labels(&[("dir", feature::mkdir("/x")), ("other", second)]),
            &state,
        )
        .unwrap_err();
        match err {
            Error::Conflict { key, origins } => {
                assert_eq!(key, "(dir, \"/x\")", "key is named after the first provider");
                assert_eq!(origins, vec!["dir".to_string(), "other".to_string()]);
            }
            other => panic!("expected conflict, got {:?}", other),
        }
    }
}

#[test]
fn test_identical_duplicate_is_merged_not_conflicting() {
    let state = Layer::new("p");
    let ordered = plan_single(
        labels(&[
            ("one", feature::install_file("src", "/x")),
            ("two", feature::install_file("src", "/x")),
        ]),
        &state,
    )
    .unwrap();
    assert_eq!(ordered.steps.len(), 1);
    assert_eq!(ordered.steps[0].feature.merged_from, vec!["two".to_string()]);
}

#[test]
fn test_rpm_installs_reduce_to_one_transaction() {
    let state = Layer::new("p");
    let ordered = plan_single(
        labels(&[
            ("foo", feature::rpm(RpmActionKind::Install, ["foo"])),
            ("bar", feature::rpm(RpmActionKind::Install, ["bar"])),
        ]),
        &state,
    )
    .unwrap();
    assert_eq!(ordered.phase, Phase::PackageManager);
    assert_eq!(ordered.steps.len(), 1);
    assert_eq!(
        ordered.steps[0].feature.data,
        feature::rpm(RpmActionKind::Install, ["foo", "bar"])
    );
}

#[test]
fn test_dangling_symlink_is_unsatisfied() {
    let state = Layer::new("p");
    let err = plan_single(labels(&[("link", feature::symlink("/link", "/nonexistent"))]), &state)
        .unwrap_err();
    assert!(
        err.to_string().contains("(any, \"/nonexistent\")"),
        "message must name the missing key: {}",
        err
    );
    assert!(err.to_string().contains("link"));
}

#[test]
fn test_wrong_entity_type_is_unsatisfied() {
    let state = Layer::new("p");
    let err = plan_single(
        labels(&[
            ("file", feature::install_file("src", "/a")),
            ("dir", feature::mkdir("/a/b")),
        ]),
        &state,
    )
    .unwrap_err();
    match err {
        Error::UnsatisfiedRequirement { found, .. } => assert_eq!(found.as_deref(), Some("file")),
        other => panic!("expected unsatisfied requirement, got {:?}", other),
    }
}

#[test]
fn test_requirement_through_symlinked_ancestor() {
    let state = Layer::new("p");
    let features = labels(&[
        ("mk", feature::mkdir("/a/b")),
        ("link", feature::symlink("/a", "/x")),
        ("dir", feature::ensure_dirs("/x")),
    ]);
    let contracts: Vec<RequiresProvides> = {
        let deps = BTreeMap::new();
        let ctx = ExtractContext {
            layer_label: "t",
            state: &state,
            dependencies: &deps,
            sources_dir: None,
        };
        extract_all(&features, &ctx).unwrap()
    };
    let graph = DepGraph::build(Phase::Compile, &features, &contracts, &state).unwrap();
    assert!(graph.has_edge(1, 0), "symlink must precede the mkdir below it");
    assert!(graph.has_edge(2, 0), "link target must precede the mkdir below it");
    assert!(graph.has_edge(2, 1), "link target must precede the link");
    assert_eq!(graph.sort().unwrap(), vec![2, 1, 0]);
}

#[test]
fn test_state_symlink_redirects_lookup() {
    let mut state = Layer::new("p");
    state.insert(EntityRecord::new(Entity::dir("/usr", 0o755), "parent", None));
    state.insert(EntityRecord::new(Entity::dir("/usr/lib", 0o755), "parent", None));
    state.insert(EntityRecord::new(Entity::symlink("/lib", "usr/lib"), "parent", None));
    let ordered =
        plan_single(labels(&[("so", feature::install_file("src", "/lib/libfoo.so"))]), &state);
    assert!(ordered.is_ok(), "{:?}", ordered);
}

#[test]
fn test_two_cycle_reported() {
    let state = Layer::new("p");
    let err = plan_single(
        labels(&[
            ("a", feature::symlink("/a", "/b")),
            ("b", feature::symlink("/b", "/a")),
        ]),
        &state,
    )
    .unwrap_err();
    assert_eq!(cycle_of(err), vec!["a", "b", "a"]);
}

#[test]
fn test_minimal_cycle_is_reported() {
    let state = Layer::new("p");
    let err = plan_single(
        labels(&[
            ("p", feature::symlink("/p", "/q")),
            ("q", feature::symlink("/q", "/r")),
            ("r", feature::symlink("/r", "/p")),
            ("s", feature::symlink("/s", "/t")),
            ("t", feature::symlink("/t", "/s")),
        ]),
        &state,
    )
    .unwrap_err();
    assert_eq!(cycle_of(err), vec!["s", "t", "s"]);
}

#[test]
fn test_three_cycle_starts_at_earliest() {
    let state = Layer::new("p");
    let err = plan_single(
        labels(&[
            ("p", feature::symlink("/p", "/q")),
            ("q", feature::symlink("/q", "/r")),
            ("r", feature::symlink("/r", "/p")),
        ]),
        &state,
    )
    .unwrap_err();
    assert_eq!(cycle_of(err), vec!["p", "r", "q", "p"]);
}

#[test]
fn test_self_satisfied_requirement_is_cycle() {
    let state = Layer::new("p");
    let err =
        plan_single(labels(&[("loop", feature::symlink("/loop", "/loop"))]), &state).unwrap_err();
    assert_eq!(cycle_of(err), vec!["loop", "loop"]);
}

#[test]
fn test_concurrent_requirement_adds_no_edge() {
    let state = Layer::new("p");
    let mut wheel = feature::group_add("wheel");
    if let FeatureData::GroupAdd(g) = &mut wheel {
        g.members.push("alice".into());
    }
    let ordered = plan_single(
        labels(&[
            ("alice", feature::user_add("alice", "wheel")),
            ("wheel", wheel),
        ]),
        &state,
    )
    .unwrap();
    assert_eq!(ordered.labels(), vec!["wheel", "alice"]);
}

#[test]
fn test_missing_concurrent_requirement_is_unsatisfied() {
    let state = Layer::new("p");
    let mut wheel = feature::group_add("wheel");
    if let FeatureData::GroupAdd(g) = &mut wheel {
        g.members.push("bob".into());
    }
    let err = plan_single(labels(&[("wheel", wheel)]), &state).unwrap_err();
    assert!(err.to_string().contains("(user, \"bob\")"), "{}", err);
}

#[test]
fn test_removes_run_deepest_first() {
    let state = Layer::new("p");
    let ordered = plan_single(
        labels(&[
            ("a", feature::remove_if_exists("/a")),
            ("abc", feature::remove_if_exists("/a/b/c")),
            ("ab", feature::remove_if_exists("/a/b")),
        ]),
        &state,
    )
    .unwrap();
    assert_eq!(ordered.labels(), vec!["abc", "ab", "a"]);
}

#[test]
fn test_remove_of_missing_path_is_unsatisfied() {
    let state = Layer::new("p");
    let err = plan_single(labels(&[("rm", feature::remove("/etc/motd"))]), &state).unwrap_err();
    assert!(matches!(err, Error::UnsatisfiedRequirement { .. }));
}

#[test]
fn test_unpredictable_phase_keeps_declaration_order() {
    let state = Layer::new("p");
    let ordered = plan_single(
        labels(&[
            ("second", feature::genrule(["b"])),
            ("first", feature::genrule(["a"])),
        ]),
        &state,
    )
    .unwrap();
    assert_eq!(ordered.labels(), vec!["second", "first"]);
}

#[test]
fn test_inter_phase_overwrite_rejected_even_if_identical() {
    let mut state = Layer::new("p");
    state.insert(EntityRecord::new(
        Entity::dir("/a", 0o755),
        "earlier",
        Some(Phase::Compile),
    ));
    let err = plan_single(labels(&[("again", feature::mkdir("/a"))]), &state).unwrap_err();
    assert!(matches!(err, Error::Conflict { .. }), "{:?}", err);

    // Ensuring an identical directory is not an overwrite.
    plan_single(labels(&[("ensure", feature::ensure_dirs("/a"))]), &state).unwrap();
}

#[test]
fn test_hardlink_runs_after_its_target() {
    let state = Layer::new("p");
    let ordered = plan_single(
        labels(&[
            ("link", feature::hardlink("/etc/b", "/etc/a")),
            ("dirs", feature::ensure_dirs("/etc")),
            ("file", feature::install_file("src", "/etc/a")),
        ]),
        &state,
    )
    .unwrap();
    assert_eq!(ordered.labels(), vec!["dirs", "file", "link"]);

    let err = plan_single(
        labels(&[
            ("dirs", feature::ensure_dirs("/etc/a")),
            ("link", feature::hardlink("/etc/b", "/etc/a")),
        ]),
        &state,
    )
    .unwrap_err();
    match err {
        Error::UnsatisfiedRequirement { required_by, found, .. } => {
            assert_eq!(required_by, "link");
            assert_eq!(found.as_deref(), Some("dir"), "a directory cannot be hardlinked");
        }
        other => panic!("expected unsatisfied requirement, got {:?}", other),
    }
}

#[test]
fn test_tarball_entries_satisfy_later_features() {
    let temp = tempfile::TempDir::new().unwrap();
    let archive = temp.path().join("app.tar");
    crate::feature::tarball::tests::write_archive(&archive, false);

    let state = Layer::new("p");
    let ordered = plan_single(
        labels(&[
            ("link", feature::symlink("/app.conf", "/opt/dir/file")),
            ("unpack", feature::tarball(&archive, "/opt")),
            ("dirs", feature::ensure_dirs("/opt")),
        ]),
        &state,
    )
    .unwrap();
    assert_eq!(ordered.labels(), vec!["dirs", "unpack", "link"]);

    let err = plan_single(
        labels(&[
            ("dirs", feature::ensure_dirs("/opt/dir")),
            ("unpack", feature::tarball(&archive, "/opt")),
        ]),
        &state,
    )
    .unwrap_err();
    match err {
        Error::Conflict { origins, .. } => {
            assert_eq!(origins, vec!["dirs".to_string(), "unpack".to_string()]);
        }
        other => panic!("expected conflict, got {:?}", other),
    }
}
