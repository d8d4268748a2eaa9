//! The closed catalog of feature kinds: default phase, allowed phase
//! overrides and reduction.

use super::{Feature, FeatureData, FeatureDecl, RpmAction, RpmActionKind};
use crate::error::{Error, Result};
use crate::phase::Phase;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FeatureKind {
    RpmAction,
    Chef,
    Genrule,
    Remove,
    EnsureDirsExist,
    Mkdir,
    InstallFiles,
    Tarball,
    Symlink,
    Hardlink,
    Clone,
    UserAdd,
    GroupAdd,
    Mount,
    BuildinfoStamp,
}

impl FeatureKind {
    pub const ALL: [FeatureKind; 15] = [
        FeatureKind::RpmAction,
        FeatureKind::Chef,
        FeatureKind::Genrule,
        FeatureKind::Remove,
        FeatureKind::EnsureDirsExist,
        FeatureKind::Mkdir,
        FeatureKind::InstallFiles,
        FeatureKind::Tarball,
        FeatureKind::Symlink,
        FeatureKind::Hardlink,
        FeatureKind::Clone,
        FeatureKind::UserAdd,
        FeatureKind::GroupAdd,
        FeatureKind::Mount,
        FeatureKind::BuildinfoStamp,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            FeatureKind::RpmAction => "rpm_action",
            FeatureKind::Chef => "chef",
            FeatureKind::Genrule => "genrule",
            FeatureKind::Remove => "remove",
            FeatureKind::EnsureDirsExist => "ensure_dirs_exist",
            FeatureKind::Mkdir => "mkdir",
            FeatureKind::InstallFiles => "install_files",
            FeatureKind::Tarball => "tarball",
            FeatureKind::Symlink => "symlink",
            FeatureKind::Hardlink => "hardlink",
            FeatureKind::Clone => "clone",
            FeatureKind::UserAdd => "user_add",
            FeatureKind::GroupAdd => "group_add",
            FeatureKind::Mount => "mount",
            FeatureKind::BuildinfoStamp => "buildinfo_stamp",
        }
    }

    pub fn default_phase(self) -> Phase {
        match self {
            FeatureKind::RpmAction => Phase::PackageManager,
            FeatureKind::Chef => Phase::Chef,
            FeatureKind::Genrule => Phase::Genrule,
            FeatureKind::Remove => Phase::Remove,
            FeatureKind::EnsureDirsExist
            | FeatureKind::Mkdir
            | FeatureKind::InstallFiles
            | FeatureKind::Tarball
            | FeatureKind::Symlink
            | FeatureKind::Hardlink
            | FeatureKind::Clone
            | FeatureKind::UserAdd
            | FeatureKind::GroupAdd
            | FeatureKind::Mount => Phase::Compile,
            FeatureKind::BuildinfoStamp => Phase::BuildinfoStamp,
        }
    }

    /// Whether a declaration of this kind may be pinned to `phase`.
    pub fn allows_override(self, phase: Phase) -> bool {
        if phase == self.default_phase() {
            return true;
        }
        match self {
            FeatureKind::Chef => Phase::chef_phases().contains(&phase),
            FeatureKind::Genrule => !phase.is_predictable(),
            _ => false,
        }
    }

    /// Kinds whose features a phase folds into one.
    pub fn is_reducible(self) -> bool {
        matches!(self, FeatureKind::RpmAction)
    }

    /// Kinds that may share identical directory provides with each other.
    pub fn ensures_dirs(self) -> bool {
        matches!(self, FeatureKind::EnsureDirsExist)
    }
}

impl fmt::Display for FeatureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FeatureKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "rpms_install" | "rpms_remove_if_exists" | "rpms_upgrade" => Ok(FeatureKind::RpmAction),
            _ => Self::ALL
                .iter()
                .copied()
                .find(|k| k.as_str() == s)
                .ok_or_else(|| s.to_string()),
        }
    }
}

/// Default phase of a kind.
pub fn phase_for(kind: FeatureKind) -> Phase {
    kind.default_phase()
}

/// The override if present, else the kind's default phase.
pub fn effective_phase(feature: &Feature) -> Phase {
    feature
        .phase_override
        .unwrap_or_else(|| phase_for(feature.kind()))
}

/// Parse and validate a whole batch before any phase runs. Fails on the
/// first invalid declaration.
pub fn validate_declarations(
    target: &str,
    decls: impl IntoIterator<Item = FeatureDecl>,
) -> Result<Vec<Feature>> {
    decls
        .into_iter()
        .enumerate()
        .map(|(index, decl)| Feature::from_decl(target, index, decl))
        .collect()
}

/// Fold all features of a reducible `kind` into one.
///
/// Returns `Ok(None)` when `kind` is not reducible or `features` has none of
/// it. For package actions, items keep their declaration order, repeated
/// `(action, subject)` pairs collapse, and one subject with two different
/// actions is a conflict.
pub fn reduce(kind: FeatureKind, features: &[Feature]) -> Result<Option<Feature>> {
    if !kind.is_reducible() {
        return Ok(None);
    }
    let of_kind: Vec<&Feature> = features.iter().filter(|f| f.kind() == kind).collect();
    let Some((first, rest)) = of_kind.split_first() else {
        return Ok(None);
    };

    let mut merged = (*first).clone();
    let mut items = Vec::new();
    let mut seen: BTreeMap<String, (RpmActionKind, String)> = BTreeMap::new();
    for feature in rest {
        merged.merged_from.extend(feature.origins());
    }

    for feature in &of_kind {
        let FeatureData::RpmAction(action) = &feature.data else {
            continue;
        };
        for item in &action.items {
            match seen.get(&item.subject) {
                Some((existing, _)) if *existing == item.action => {}
                Some((existing, origin)) => {
                    return Err(Error::conflict(
                        format!(
                            "(rpm-unit, {:?}) with actions {} and {}",
                            item.subject,
                            existing.as_str(),
                            item.action.as_str()
                        ),
                        [origin.clone(), feature.origin_label.clone()],
                    ));
                }
                None => {
                    seen.insert(
                        item.subject.clone(),
                        (item.action, feature.origin_label.clone()),
                    );
                    items.push(item.clone());
                }
            }
        }
    }

    merged.data = FeatureData::RpmAction(RpmAction { items });
    Ok(Some(merged))
}
