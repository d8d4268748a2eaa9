//! Package resolution for the `package_manager` phase.

use crate::feature::RpmItem;
use crate::layer::Layer;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::process::{Command, Stdio};

/// The resolved package-manager transaction of one phase.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub items: Vec<RpmItem>,
}

impl Transaction {
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Turns the reduced package actions of a phase into a transaction.
///
/// Called at most once per `package_manager` phase.
pub trait PackageResolver {
    fn resolve(&self, items: &[RpmItem], state: &Layer) -> Result<Transaction>;
}

/// Uses the requested items as the transaction, unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughResolver;

impl PackageResolver for PassthroughResolver {
    fn resolve(&self, items: &[RpmItem], _state: &Layer) -> Result<Transaction> {
        Ok(Transaction {
            items: items.to_vec(),
        })
    }
}

#[derive(Serialize)]
struct ResolveRequest<'a> {
    items: &'a [RpmItem],
    installed: Vec<&'a str>,
}

/// Runs an external resolver. The request is written to its stdin as
/// `{"items": [...], "installed": [...]}`; it must print a [`Transaction`]
/// as JSON on stdout.
#[derive(Debug, Clone)]
pub struct CommandResolver {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandResolver {
    pub fn new(program: impl Into<String>, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }
}

impl PackageResolver for CommandResolver {
    fn resolve(&self, items: &[RpmItem], state: &Layer) -> Result<Transaction> {
        let request = ResolveRequest {
            items,
            installed: state
                .records()
                .filter_map(|r| match &r.entity {
                    crate::entity::Entity::RpmUnit { name } => Some(name.as_str()),
                    _ => None,
                })
                .collect(),
        };
        let body = serde_json::to_vec(&request).context("Failed to encode resolve request")?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("Failed to run package resolver '{}'", self.program))?;
        // The pipe is closed at the end of the block so the resolver sees EOF.
        let written = match child.stdin.take() {
            Some(mut stdin) => stdin.write_all(&body),
            None => Ok(()),
        };
        let output = child
            .wait_with_output()
            .with_context(|| format!("Failed to wait for package resolver '{}'", self.program))?;
        if !output.status.success() {
            bail!(
                "package resolver '{}' failed (status {}): {}",
                self.program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        written.with_context(|| format!("Failed to send request to package resolver '{}'", self.program))?;
        serde_json::from_slice(&output.stdout)
            .with_context(|| format!("package resolver '{}' printed an invalid transaction", self.program))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feature::RpmActionKind;

    fn items() -> Vec<RpmItem> {
        vec![RpmItem {
            action: RpmActionKind::Install,
            subject: "foo".into(),
        }]
    }

    #[test]
    fn test_resolver_exiting_early_reports_stderr() {
        // Exits without reading the request; the write may hit a closed pipe.
        let resolver = CommandResolver::new("sh", ["-c", "echo 'repo unavailable' >&2; exit 4"]);
        let many: Vec<RpmItem> = (0..20_000)
            .map(|i| RpmItem {
                action: RpmActionKind::Install,
                subject: format!("package-with-a-long-name-{}", i),
            })
            .collect();
        let err = resolver.resolve(&many, &Layer::new("p")).unwrap_err();
        let message = format!("{:#}", err);
        assert!(message.contains("repo unavailable"), "stderr should be reported: {}", message);
        assert!(message.contains("status"), "{}", message);
    }

    #[test]
    fn test_passthrough_keeps_items() {
        let tx = PassthroughResolver.resolve(&items(), &Layer::new("p")).unwrap();
        assert_eq!(tx.items, items());
    }

    #[test]
    fn test_command_resolver_reads_stdout() {
        let resolver = CommandResolver::new(
            "sh",
            [
                "-c",
                r#"cat >/dev/null; echo '{"items":[{"action":"install","subject":"foo-1.0"}]}'"#,
            ],
        );
        let tx = resolver.resolve(&items(), &Layer::new("p")).unwrap();
        assert_eq!(tx.items[0].subject, "foo-1.0");
    }

    #[test]
    fn test_command_resolver_failure_carries_stderr() {
        let resolver = CommandResolver::new("sh", ["-c", "cat >/dev/null; echo 'no such package' >&2; exit 3"]);
        let err = resolver.resolve(&items(), &Layer::new("p")).unwrap_err();
        assert!(err.to_string().contains("no such package"), "{}", err);
    }
}
