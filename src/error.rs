//! Error taxonomy for a layer build.
//!
//! Every variant is terminal for the layer being compiled. Messages name
//! the failure kind, the declaring feature labels and, where relevant, the
//! entity key involved.

use crate::entity::Requirement;
use crate::phase::Phase;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Unknown feature kind, malformed payload or disallowed phase override.
    #[error("configuration error in {target} (feature {label}): {message}")]
    Configuration {
        target: String,
        label: String,
        message: String,
    },

    #[error("unsatisfied requirement: {required_by} requires {requirement}{}", found_suffix(.found))]
    UnsatisfiedRequirement {
        required_by: String,
        requirement: Requirement,
        /// Kind of the entity that was found under the key, if any.
        found: Option<String>,
    },

    #[error("cycle in phase {phase}: {}", .cycle.join(" -> "))]
    Cycle { phase: Phase, cycle: Vec<String> },

    #[error("conflict on {key}: {}", .origins.join(", "))]
    Conflict { key: String, origins: Vec<String> },

    #[error("package resolution failed for {}: {message}", .origins.join(", "))]
    PackageResolution {
        origins: Vec<String>,
        message: String,
    },

    #[error("materialization of phase {phase} failed")]
    Materialization {
        phase: Phase,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("phase cache: {0}")]
    Cache(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

fn found_suffix(found: &Option<String>) -> String {
    match found {
        Some(kind) => format!(" (found {})", kind),
        None => String::new(),
    }
}

impl Error {
    pub fn configuration(
        target: impl Into<String>,
        label: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Error::Configuration {
            target: target.into(),
            label: label.into(),
            message: message.into(),
        }
    }

    pub fn conflict(key: impl ToString, origins: impl IntoIterator<Item = String>) -> Self {
        Error::Conflict {
            key: key.to_string(),
            origins: origins.into_iter().collect(),
        }
    }

    pub fn materialization(phase: Phase, source: anyhow::Error) -> Self {
        Error::Materialization {
            phase,
            source: source.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsatisfied_message_names_key() {
        let err = Error::UnsatisfiedRequirement {
            required_by: "//img:layer[0]".into(),
            requirement: Requirement::any_path("/nonexistent"),
            found: None,
        };
        assert_eq!(
            err.to_string(),
            "unsatisfied requirement: //img:layer[0] requires (any, \"/nonexistent\")"
        );
    }

    #[test]
    fn test_unsatisfied_message_names_found_type() {
        let err = Error::UnsatisfiedRequirement {
            required_by: "b".into(),
            requirement: Requirement::dir("/x"),
            found: Some("file".into()),
        };
        assert!(err.to_string().ends_with("(found file)"));
    }

    #[test]
    fn test_cycle_message_lists_members() {
        let err = Error::Cycle {
            phase: Phase::Compile,
            cycle: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "cycle in phase compile: a -> b -> a");
    }

    #[test]
    fn test_materialization_keeps_source() {
        use std::error::Error as _;
        let err = Error::materialization(Phase::Genrule, anyhow::anyhow!("exit status 2"));
        assert_eq!(
            err.source().map(|s| s.to_string()),
            Some("exit status 2".to_string())
        );
    }
}
