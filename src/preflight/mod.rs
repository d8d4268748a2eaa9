//! Preflight checks for external commands.
//!
//! Genrules, chef runs and package transactions shell out to configured
//! programs. Checking them before compiling turns a failure deep inside a
//! phase into an early, readable error.
//!
//! # Example
//!
//! ```rust
//! use layer_compiler::preflight::{command_exists, check_required_tools};
//!
//! if !command_exists("sh") {
//!     println!("no shell");
//! }
//!
//! let tools = vec![("sh".to_string(), "genrule.shell")];
//! if let Err(e) = check_required_tools(&tools) {
//!     eprintln!("{}", e);
//! }
//! ```

use crate::config::Config;
use anyhow::{bail, Result};
use std::path::Path;

/// Whether `cmd` is an executable path or found in `PATH`.
pub fn command_exists(cmd: &str) -> bool {
    if cmd.contains('/') {
        return Path::new(cmd).is_file();
    }
    which::which(cmd).is_ok()
}

/// Check that every `(program, config key)` is available.
pub fn check_required_tools(tools: &[(String, &str)]) -> Result<()> {
    let missing: Vec<&(String, &str)> = tools
        .iter()
        .filter(|(tool, _)| !command_exists(tool))
        .collect();

    if !missing.is_empty() {
        let msg = missing
            .iter()
            .map(|(t, key)| format!("  {} (configured as {})", t, key))
            .collect::<Vec<_>>()
            .join("\n");
        bail!("Missing required host tools:\n{}", msg);
    }
    Ok(())
}

/// Check every program named by `config`.
pub fn check_config(config: &Config) -> Result<()> {
    check_required_tools(&config.required_programs())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_exists() {
        assert!(command_exists("sh"));
        assert!(command_exists("/bin/sh"));
        assert!(!command_exists("definitely_not_a_real_command_12345"));
    }

    #[test]
    fn test_check_required_tools_failure_names_key() {
        let tools = vec![("nonexistent_command_xyz".to_string(), "chef.command")];
        let err = check_required_tools(&tools).unwrap_err();
        assert!(err.to_string().contains("chef.command"));
    }

    #[test]
    fn test_default_config_passes() {
        check_config(&Config::default()).unwrap();
    }
}
