//! Build phases determine the coarse ordering of a layer build.
//!
//! Features are bucketed into exactly one [`Phase`] each. Phases run in the
//! fixed order given by [`Phase::ORDER`]; the order goes from the most
//! side-effectful (package manager, configuration management, arbitrary
//! commands) to the most predictable (features with an exhaustive
//! requires/provides contract), so that later phases can rely on a stable,
//! fully discovered filesystem.
//!
//! # Example
//!
//! ```rust
//! use layer_compiler::Phase;
//!
//! assert!(Phase::PackageManager < Phase::Compile);
//! assert!(!Phase::Genrule.is_predictable());
//! assert_eq!("buildinfo_stamp".parse::<Phase>().unwrap(), Phase::BuildinfoStamp);
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A fixed-order bucket of features sharing a side-effect predictability
/// class.
///
/// The discriminant order is the build order. Never reorder these variants:
/// an image built with a different phase order is silently different.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum Phase {
    /// Package manager transactions (install, remove, upgrade).
    PackageManager = 1,
    /// Configuration-management bootstrap.
    ChefSetup = 2,
    /// Package installs driven by configuration management.
    ChefPackageManager = 3,
    /// The main configuration-management run.
    Chef = 4,
    /// Configuration-management cleanup.
    ChefCleanup = 5,
    /// Arbitrary user commands.
    Genrule = 6,
    /// Path removals.
    Remove = 7,
    /// Every feature with an exhaustive requires/provides contract.
    Compile = 8,
    /// Build metadata written into the layer.
    BuildinfoStamp = 9,
}

impl Phase {
    /// Canonical build order.
    pub const ORDER: [Phase; 9] = [
        Phase::PackageManager,
        Phase::ChefSetup,
        Phase::ChefPackageManager,
        Phase::Chef,
        Phase::ChefCleanup,
        Phase::Genrule,
        Phase::Remove,
        Phase::Compile,
        Phase::BuildinfoStamp,
    ];

    /// Whether features in this phase declare everything they create.
    ///
    /// Unpredictable phases must be reconciled after materialization by
    /// discovering what actually changed on disk.
    pub fn is_predictable(self) -> bool {
        matches!(self, Phase::Compile | Phase::BuildinfoStamp)
    }

    /// Stable snake_case name, as used in declarations and cache keys.
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::PackageManager => "package_manager",
            Phase::ChefSetup => "chef_setup",
            Phase::ChefPackageManager => "chef_package_manager",
            Phase::Chef => "chef",
            Phase::ChefCleanup => "chef_cleanup",
            Phase::Genrule => "genrule",
            Phase::Remove => "remove",
            Phase::Compile => "compile",
            Phase::BuildinfoStamp => "buildinfo_stamp",
        }
    }

    /// The configuration-management phases, in order.
    pub fn chef_phases() -> &'static [Phase] {
        &Self::ORDER[1..5]
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a phase name is not part of [`Phase::ORDER`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown phase '{0}'")]
pub struct UnknownPhase(pub String);

impl FromStr for Phase {
    type Err = UnknownPhase;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ORDER
            .iter()
            .copied()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| UnknownPhase(s.to_string()))
    }
}
