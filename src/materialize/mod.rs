//! Filesystem materializer: applies compiled phases to a root directory.
//!
//! Predictable features are performed directly. Genrules, chef runs and
//! package transactions are delegated to configured external commands,
//! run with the image root as working directory and these variables set:
//!
//! | Variable        | Value                     |
//! |-----------------|---------------------------|
//! | `LAYER_ROOT`    | image root on the host    |
//! | `LAYER_LABEL`   | label of the layer        |
//! | `LAYER_PHASE`   | phase being materialized  |
//!
//! After an unpredictable phase the root is crawled and diffed with the
//! state to find out what changed.

pub mod directories;
pub mod files;
pub mod users;

use crate::compiler::{declared_outcome, Materializer, PhaseInput};
use crate::feature::{BuildinfoStamp, Chef, Feature, FeatureData, Genrule, Mount};
use crate::layer::crawl::{self, MountRecord, META_DIR};
use crate::layer::PhaseOutcome;
use anyhow::{anyhow, bail, Context, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use time::OffsetDateTime;

/// External commands used for unpredictable features.
#[derive(Debug, Clone)]
pub struct Commands {
    /// Applies a package transaction, read as JSON from stdin.
    pub package_install: Option<Vec<String>>,
    /// Interpreter for `bash` genrules, called as `<shell> -c <script>`.
    pub genrule_shell: String,
    pub chef: Option<Vec<String>>,
}

impl Default for Commands {
    fn default() -> Self {
        Self {
            package_install: None,
            genrule_shell: "/bin/sh".to_string(),
            chef: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FsMaterializer {
    root: PathBuf,
    sources_dir: Option<PathBuf>,
    layer_roots: BTreeMap<String, PathBuf>,
    commands: Commands,
}

impl FsMaterializer {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            sources_dir: None,
            layer_roots: BTreeMap::new(),
            commands: Commands::default(),
        }
    }

    pub fn with_sources_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.sources_dir = Some(dir.into());
        self
    }

    /// Root directory of another layer, for `clone` features.
    pub fn with_layer_root(mut self, label: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        self.layer_roots.insert(label.into(), root.into());
        self
    }

    pub fn with_commands(mut self, commands: Commands) -> Self {
        self.commands = commands;
        self
    }

    fn apply(&self, feature: &Feature, input: &PhaseInput<'_>) -> Result<()> {
        let root = self.root.as_path();
        let state = input.state;
        match &feature.data {
            FeatureData::EnsureDirsExist(e) => directories::ensure_dirs(root, state, e),
            FeatureData::Mkdir(m) => directories::make_dir(root, state, m),
            FeatureData::InstallFiles(i) => {
                files::install(root, state, self.sources_dir.as_deref(), i)
            }
            FeatureData::Tarball(t) => {
                files::extract_tarball(root, state, self.sources_dir.as_deref(), t)
            }
            FeatureData::Symlink(s) => files::symlink(root, state, s),
            FeatureData::Hardlink(h) => files::hardlink(root, state, h),
            FeatureData::Clone(c) => {
                let source_root = self
                    .layer_roots
                    .get(&c.src_layer)
                    .ok_or_else(|| anyhow!("no root directory known for layer '{}'", c.src_layer))?;
                files::clone_path(source_root, root, state, c)
            }
            FeatureData::Remove(r) => files::remove(root, state, r),
            FeatureData::UserAdd(u) => users::add_user(root, u),
            FeatureData::GroupAdd(g) => users::add_group(root, g),
            FeatureData::Mount(m) => write_mount(root, m),
            FeatureData::Genrule(g) => self.run_genrule(g, input),
            FeatureData::Chef(c) => self.run_chef(c, input),
            FeatureData::RpmAction(_) => self.run_package_install(input),
            FeatureData::BuildinfoStamp(b) => write_buildinfo(root, input.layer_label, b),
        }
    }

    fn run_genrule(&self, g: &Genrule, input: &PhaseInput<'_>) -> Result<()> {
        let argv = match &g.bash {
            Some(script) => vec![self.commands.genrule_shell.clone(), "-c".into(), script.clone()],
            None => g.cmd.clone(),
        };
        let mut cmd = self.command(&argv, input)?;
        if g.user != "root" {
            if is_root() {
                cmd.uid(users::resolve_uid(&self.root, &g.user)?);
            } else {
                tracing::warn!(user = %g.user, "not running as root, genrule runs as the invoking user");
            }
        }
        run(cmd, None, &argv[0])
    }

    fn run_chef(&self, c: &Chef, input: &PhaseInput<'_>) -> Result<()> {
        let Some(base) = &self.commands.chef else {
            bail!("no chef command configured");
        };
        let mut argv = base.clone();
        argv.extend(["--root".to_string(), self.root.display().to_string()]);
        argv.extend(["--run-list".to_string(), c.run_list.join(",")]);
        if let Some(attrs) = &c.json_attributes {
            argv.extend(["--json-attributes".to_string(), attrs.display().to_string()]);
        }
        let cmd = self.command(&argv, input)?;
        run(cmd, None, &argv[0])
    }

    fn run_package_install(&self, input: &PhaseInput<'_>) -> Result<()> {
        let Some(transaction) = input.transaction else {
            return Ok(());
        };
        let Some(argv) = &self.commands.package_install else {
            bail!("no package install command configured");
        };
        let body = serde_json::to_vec(transaction)?;
        let cmd = self.command(argv, input)?;
        run(cmd, Some(&body), &argv[0])
    }

    fn command(&self, argv: &[String], input: &PhaseInput<'_>) -> Result<Command> {
        let Some((program, args)) = argv.split_first() else {
            bail!("empty command");
        };
        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(&self.root)
            .env("LAYER_ROOT", &self.root)
            .env("LAYER_LABEL", input.layer_label)
            .env("LAYER_PHASE", input.phase.phase.as_str());
        Ok(cmd)
    }
}

impl Materializer for FsMaterializer {
    fn materialize(&mut self, input: &PhaseInput<'_>) -> Result<PhaseOutcome> {
        fs::create_dir_all(&self.root)
            .with_context(|| format!("Failed to create root {}", self.root.display()))?;
        let phase = input.phase.phase;
        for step in &input.phase.steps {
            tracing::debug!(feature = %step.feature, "applying");
            self.apply(&step.feature, input)
                .with_context(|| format!("feature {}", step.feature.origin_label))?;
        }

        let declared = declared_outcome(input.phase, input.state);
        if phase.is_predictable() {
            return Ok(declared);
        }

        let origin = input.phase.labels().join(", ");
        let crawled = crawl::crawl(&self.root)?;
        let mut outcome = crawl::diff(input.state, crawled, &origin, phase);
        // Package units and stamps never show up in a crawl.
        outcome.provided.extend(
            declared
                .provided
                .into_iter()
                .filter(|r| !crawl::is_crawlable(&r.entity.key())),
        );
        outcome
            .removed
            .extend(declared.removed.into_iter().filter(|k| !crawl::is_crawlable(k)));
        Ok(outcome)
    }

    fn root(&self) -> Option<&Path> {
        Some(&self.root)
    }

    fn sources_dir(&self) -> Option<&Path> {
        self.sources_dir.as_deref()
    }
}

/// `path` inside the image at `root`.
pub(crate) fn host_path(root: &Path, path: &Path) -> PathBuf {
    root.join(path.strip_prefix("/").unwrap_or(path))
}

pub(crate) fn is_root() -> bool {
    // SAFETY: geteuid has no preconditions.
    unsafe { libc::geteuid() == 0 }
}

/// Change ownership to `user:group` as named in the image. Skipped unless
/// running as root.
pub(crate) fn set_owner(root: &Path, host: &Path, user: &str, group: &str) -> Result<()> {
    if !is_root() {
        return Ok(());
    }
    let uid = users::resolve_uid(root, user)?;
    let gid = users::resolve_gid(root, group)?;
    std::os::unix::fs::lchown(host, Some(uid), Some(gid))
        .with_context(|| format!("Failed to chown {}", host.display()))
}

fn write_mount(root: &Path, m: &Mount) -> Result<()> {
    let dir = root.join(META_DIR).join("mounts");
    fs::create_dir_all(&dir)?;
    let record = MountRecord {
        mountpoint: m.mountpoint.clone(),
        source: m.source.clone(),
    };
    let path = dir.join(crawl::mount_record_name(&m.mountpoint));
    fs::write(&path, serde_json::to_vec_pretty(&record)?)
        .with_context(|| format!("Failed to write {}", path.display()))?;

    // Placeholder the mount is attached to at runtime.
    let host = host_path(root, &m.mountpoint);
    if m.is_directory {
        fs::create_dir(&host)
    } else {
        fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&host)
            .map(drop)
    }
    .with_context(|| format!("Failed to create mountpoint {}", m.mountpoint.display()))
}

#[derive(Serialize)]
struct BuildInfo<'a> {
    layer: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    revision: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    package: Option<&'a str>,
    built_at: String,
}

fn write_buildinfo(root: &Path, label: &str, b: &BuildinfoStamp) -> Result<()> {
    let now = OffsetDateTime::now_utc();
    let info = BuildInfo {
        layer: label,
        revision: b.revision.as_deref(),
        package: b.package.as_deref(),
        built_at: format!(
            "{:04}{:02}{:02}T{:02}{:02}{:02}Z",
            now.year(),
            now.month() as u8,
            now.day(),
            now.hour(),
            now.minute(),
            now.second()
        ),
    };
    let dir = root.join(META_DIR);
    fs::create_dir_all(&dir)?;
    let path = dir.join("buildinfo.json");
    fs::write(&path, serde_json::to_vec_pretty(&info)?)
        .with_context(|| format!("Failed to write {}", path.display()))
}

fn run(mut cmd: Command, stdin: Option<&[u8]>, name: &str) -> Result<()> {
    cmd.stdin(if stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    })
    .stdout(Stdio::piped())
    .stderr(Stdio::piped());
    let mut child = cmd
        .spawn()
        .with_context(|| format!("Failed to run '{}'", name))?;
    let written = match (stdin, child.stdin.take()) {
        (Some(body), Some(mut pipe)) => pipe.write_all(body),
        _ => Ok(()),
    };
    let output = child
        .wait_with_output()
        .with_context(|| format!("Failed to wait for '{}'", name))?;
    let stdout = String::from_utf8_lossy(&output.stdout);
    if !stdout.trim().is_empty() {
        tracing::debug!("{}: {}", name, stdout.trim());
    }
    if !output.status.success() {
        bail!(
            "'{}' failed (status {}): {}",
            name,
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    written.with_context(|| format!("Failed to write input of '{}'", name))
}
