//! `layer-compiler.toml` configuration.
//!
//! ```toml
//! cache_dir = "/var/cache/layer-compiler"
//! parallel = true
//!
//! [package_manager]
//! resolve = ["dnf-resolve", "--json"]
//! install = ["dnf-install"]
//!
//! [genrule]
//! shell = "/bin/bash"
//!
//! [chef]
//! command = ["chef-solo", "--local-mode"]
//!
//! [logging]
//! level = "info"
//! json = false
//! ```
//!
//! Every key is optional. Unknown keys are rejected.

use crate::materialize::Commands;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

const APP_DIR: &str = "layer-compiler";
const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
    /// Extract feature contracts on all cores.
    #[serde(default = "default_true")]
    pub parallel: bool,
    #[serde(default)]
    pub package_manager: PackageManagerConfig,
    #[serde(default)]
    pub genrule: GenruleConfig,
    #[serde(default)]
    pub chef: ChefConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PackageManagerConfig {
    /// Resolver command; see [`crate::compiler::CommandResolver`].
    #[serde(default)]
    pub resolve: Option<Vec<String>>,
    /// Command that applies a transaction to the image root.
    #[serde(default)]
    pub install: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GenruleConfig {
    #[serde(default = "default_shell")]
    pub shell: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChefConfig {
    #[serde(default)]
    pub command: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    #[serde(default)]
    pub level: Option<String>,
    #[serde(default)]
    pub json: bool,
}

fn default_true() -> bool {
    true
}

fn default_shell() -> String {
    "/bin/sh".to_string()
}

impl Default for GenruleConfig {
    fn default() -> Self {
        Self {
            shell: default_shell(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache_dir: None,
            parallel: true,
            package_manager: PackageManagerConfig::default(),
            genrule: GenruleConfig::default(),
            chef: ChefConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading config '{}'", path.display()))?;
        toml::from_str(&content).with_context(|| format!("parsing config '{}'", path.display()))
    }

    /// Load `explicit` if given, else the per-user config file if it
    /// exists, else defaults.
    pub fn discover(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        match dirs::config_dir().map(|d| d.join(APP_DIR).join(CONFIG_FILE)) {
            Some(path) if path.is_file() => {
                tracing::debug!("using config {}", path.display());
                Self::load(&path)
            }
            _ => Ok(Self::default()),
        }
    }

    /// Configured cache directory, or the per-user cache directory.
    pub fn cache_dir(&self) -> PathBuf {
        if let Some(dir) = &self.cache_dir {
            return dir.clone();
        }
        dirs::cache_dir()
            .map(|d| d.join(APP_DIR))
            .unwrap_or_else(|| PathBuf::from(".layer-compiler-cache"))
    }

    /// External commands the filesystem materializer runs.
    pub fn commands(&self) -> Commands {
        Commands {
            package_install: self.package_manager.install.clone(),
            genrule_shell: self.genrule.shell.clone(),
            chef: self.chef.command.clone(),
        }
    }

    /// Programs named by the configuration, for preflight checks. Each
    /// entry is `(program, config key)`.
    pub fn required_programs(&self) -> Vec<(String, &'static str)> {
        let mut programs = vec![(self.genrule.shell.clone(), "genrule.shell")];
        let commands = [
            (&self.package_manager.resolve, "package_manager.resolve"),
            (&self.package_manager.install, "package_manager.install"),
            (&self.chef.command, "chef.command"),
        ];
        for (command, key) in commands {
            if let Some(program) = command.as_ref().and_then(|c| c.first()) {
                programs.push((program.clone(), key));
            }
        }
        programs
    }
}
