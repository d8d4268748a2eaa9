//! Bucket features into phases.

use crate::feature::Feature;
use crate::phase::Phase;
use std::collections::BTreeMap;

/// Features of one phase, in declaration order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseBucket {
    pub phase: Phase,
    pub features: Vec<Feature>,
}

/// Group `features` by effective phase. Only non-empty phases are returned,
/// in canonical order; each bucket preserves declaration order.
pub fn partition(features: impl IntoIterator<Item = Feature>) -> Vec<PhaseBucket> {
    let mut buckets: BTreeMap<Phase, Vec<Feature>> = BTreeMap::new();
    for feature in features {
        buckets.entry(feature.phase()).or_default().push(feature);
    }
    buckets
        .into_iter()
        .map(|(phase, features)| PhaseBucket { phase, features })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feature::{self, RpmActionKind};

    #[test]
    fn test_partition_orders_phases_and_keeps_declaration_order() {
        let features = vec![
            Feature::new("mk", feature::mkdir("/a")),
            Feature::new("gen", feature::genrule(["true"])),
            Feature::new("rpm", feature::rpm(RpmActionKind::Install, ["foo"])),
            Feature::new("mk2", feature::mkdir("/b")),
            Feature::new("stamp", feature::buildinfo_stamp(None)),
        ];
        let buckets = partition(features);
        let phases: Vec<Phase> = buckets.iter().map(|b| b.phase).collect();
        assert_eq!(
            phases,
            vec![
                Phase::PackageManager,
                Phase::Genrule,
                Phase::Compile,
                Phase::BuildinfoStamp
            ]
        );
        let compile: Vec<&str> = buckets[2]
            .features
            .iter()
            .map(|f| f.origin_label.as_str())
            .collect();
        assert_eq!(compile, vec!["mk", "mk2"]);
    }

    #[test]
    fn test_override_moves_feature() {
        let buckets = partition(vec![
            Feature::new("g", feature::genrule(["true"])).with_phase(Phase::ChefSetup)
        ]);
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].phase, Phase::ChefSetup);
    }

    #[test]
    fn test_empty_input_has_no_phases() {
        assert!(partition(Vec::new()).is_empty());
    }
}
