//! Declarative image features.
//!
//! A [`Feature`] describes WHAT a layer should contain (a directory, a
//! symlink, a user, a package transaction...), never HOW it is created. The
//! [`crate::compiler`] decides the order and a
//! [`crate::compiler::Materializer`] does the work.
//!
//! Features are parsed from JSON declarations:
//!
//! ```json
//! [
//!   {"kind": "ensure_dirs_exist", "payload": {"path": "/a/b"}},
//!   {"kind": "symlink", "payload": {"link": "/a/b/c", "target": "/a"}},
//!   {"kind": "genrule", "phase_override": "chef", "payload": {"cmd": ["true"]}}
//! ]
//! ```
//!
//! # Example
//!
//! ```rust
//! use layer_compiler::feature::{self, Feature};
//!
//! let features = vec![
//!     Feature::new("//img:base[0]", feature::ensure_dirs("/a/b")),
//!     Feature::new("//img:base[1]", feature::symlink("/a/b/c", "/a")),
//! ];
//! assert_eq!(features[0].kind().as_str(), "ensure_dirs_exist");
//! ```

pub mod registry;
pub mod requires_provides;
pub mod tarball;

pub use registry::{effective_phase, phase_for, validate_declarations, FeatureKind};
pub use requires_provides::{requires_provides, ExtractContext, RequiresProvides};

use crate::entity::normalize_path;
use crate::error::{Error, Result};
use crate::phase::Phase;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// One declared unit of image construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Feature {
    pub origin_label: String,
    pub data: FeatureData,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase_override: Option<Phase>,
    /// Labels of identical or reducible features folded into this one.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub merged_from: Vec<String>,
}

impl Feature {
    pub fn new(origin_label: impl Into<String>, data: FeatureData) -> Self {
        Self {
            origin_label: origin_label.into(),
            data,
            phase_override: None,
            merged_from: Vec::new(),
        }
    }

    /// Build a feature pinned to `phase`. Validity of the override is checked
    /// by [`Feature::validate`].
    pub fn with_phase(mut self, phase: Phase) -> Self {
        self.phase_override = Some(phase);
        self
    }

    pub fn kind(&self) -> FeatureKind {
        self.data.kind()
    }

    pub fn phase(&self) -> Phase {
        effective_phase(self)
    }

    /// Every label this feature stands for, its own first.
    pub fn origins(&self) -> Vec<String> {
        let mut origins = vec![self.origin_label.clone()];
        origins.extend(self.merged_from.iter().cloned());
        origins
    }

    /// Check the phase override and payload invariants that serde cannot
    /// express.
    pub fn validate(&self, target: &str) -> Result<()> {
        if let Some(phase) = self.phase_override {
            if !self.kind().allows_override(phase) {
                return Err(Error::configuration(
                    target,
                    &self.origin_label,
                    format!("kind '{}' cannot be moved to phase '{}'", self.kind(), phase),
                ));
            }
        }
        let invalid = |message: &str| Err(Error::configuration(target, &self.origin_label, message));
        match &self.data {
            FeatureData::Genrule(g) => match (g.cmd.is_empty(), &g.bash) {
                (true, None) => invalid("genrule needs one of 'cmd' or 'bash'"),
                (false, Some(_)) => invalid("genrule takes 'cmd' or 'bash', not both"),
                _ => Ok(()),
            },
            FeatureData::RpmAction(r) if r.items.iter().any(|i| i.subject.trim().is_empty()) => {
                invalid("empty package subject")
            }
            FeatureData::Remove(r) if r.path.as_os_str() == "/" => invalid("cannot remove '/'"),
            FeatureData::UserAdd(u) if u.name.is_empty() => invalid("empty user name"),
            FeatureData::GroupAdd(g) if g.name.is_empty() => invalid("empty group name"),
            FeatureData::Mount(m) if m.mountpoint.as_os_str() == "/" => {
                invalid("cannot mount over '/'")
            }
            FeatureData::Hardlink(h) if h.link == h.target => invalid("hardlink to itself"),
            _ => Ok(()),
        }
    }

    /// Parse a single declaration. `index` is its position in the layer's
    /// declaration list, used for the default label.
    pub fn from_decl(target: &str, index: usize, decl: FeatureDecl) -> Result<Self> {
        let label = decl
            .origin_label
            .unwrap_or_else(|| format!("{}[{}]", target, index));
        let kind: FeatureKind = decl.kind.parse().map_err(|_| {
            Error::configuration(target, &label, format!("unknown feature kind '{}'", decl.kind))
        })?;
        let phase_override = decl
            .phase_override
            .map(|p| p.parse::<Phase>())
            .transpose()
            .map_err(|e| Error::configuration(target, &label, e.to_string()))?;
        let mut data = FeatureData::from_payload(&decl.kind, kind, decl.payload)
            .map_err(|e| Error::configuration(target, &label, format!("malformed payload: {}", e)))?;
        data.normalize_paths();

        let feature = Feature {
            origin_label: label,
            data,
            phase_override,
            merged_from: Vec::new(),
        };
        feature.validate(target)?;
        Ok(feature)
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.origin_label, self.kind())
    }
}

/// A feature as written in a declaration file.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct FeatureDecl {
    pub kind: String,
    #[serde(default)]
    pub phase_override: Option<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub origin_label: Option<String>,
}

/// Parse a JSON list of declarations for the layer `target`.
pub fn parse_declarations(target: &str, json: &str) -> Result<Vec<Feature>> {
    let decls: Vec<FeatureDecl> = serde_json::from_str(json)
        .map_err(|e| Error::configuration(target, "<declarations>", e.to_string()))?;
    validate_declarations(target, decls)
}

/// File mode. Declared as an integer or an octal string (`"0755"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Mode(pub u32);

impl Serialize for Mode {
    fn serialize<S: serde::Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_str(&format!("{:04o}", self.0))
    }
}

impl<'de> Deserialize<'de> for Mode {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Int(u32),
            Str(String),
        }
        let mode = match Raw::deserialize(d)? {
            Raw::Int(m) => m,
            Raw::Str(s) => u32::from_str_radix(s.trim_start_matches("0o"), 8)
                .map_err(|_| serde::de::Error::custom(format!("invalid octal mode '{}'", s)))?,
        };
        if mode > 0o7777 {
            return Err(serde::de::Error::custom(format!("mode {:o} out of range", mode)));
        }
        Ok(Mode(mode))
    }
}

fn default_root() -> String {
    "root".to_string()
}

fn default_slash() -> PathBuf {
    PathBuf::from("/")
}

/// Host path of an `install_files` or `tarball` source. Relative sources
/// are taken from `sources_dir` when one is set.
pub fn source_path(source: &Path, sources_dir: Option<&Path>) -> PathBuf {
    match sources_dir {
        Some(dir) if source.is_relative() => dir.join(source),
        _ => source.to_path_buf(),
    }
}

fn default_true() -> bool {
    true
}

fn default_dir_mode() -> Mode {
    Mode(0o755)
}

fn default_shell() -> PathBuf {
    PathBuf::from("/sbin/nologin")
}

/// Kind-specific payload of a feature. The catalog is closed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum FeatureData {
    RpmAction(RpmAction),
    Chef(Chef),
    Genrule(Genrule),
    Remove(RemovePath),
    EnsureDirsExist(EnsureDirsExist),
    Mkdir(MakeDir),
    InstallFiles(InstallFiles),
    Tarball(Tarball),
    Symlink(Symlink),
    Hardlink(Hardlink),
    Clone(ClonePath),
    UserAdd(UserAdd),
    GroupAdd(GroupAdd),
    Mount(Mount),
    BuildinfoStamp(BuildinfoStamp),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RpmActionKind {
    Install,
    RemoveIfExists,
    Upgrade,
}

impl RpmActionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RpmActionKind::Install => "install",
            RpmActionKind::RemoveIfExists => "remove_if_exists",
            RpmActionKind::Upgrade => "upgrade",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpmItem {
    pub action: RpmActionKind,
    pub subject: String,
}

/// Package-manager transaction items. A declaration carries one action;
/// reduction folds all of a phase's declarations into one transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpmAction {
    pub items: Vec<RpmItem>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RpmActionDecl {
    #[serde(default)]
    action: Option<RpmActionKind>,
    subjects: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Chef {
    pub run_list: Vec<String>,
    #[serde(default)]
    pub json_attributes: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Genrule {
    /// Argument vector, executed directly.
    #[serde(default)]
    pub cmd: Vec<String>,
    /// Script, executed with the configured shell.
    #[serde(default)]
    pub bash: Option<String>,
    #[serde(default = "default_root")]
    pub user: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RemovePath {
    pub path: PathBuf,
    #[serde(default = "default_true")]
    pub must_exist: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EnsureDirsExist {
    pub path: PathBuf,
    #[serde(default = "default_slash")]
    pub into_dir: PathBuf,
    #[serde(default = "default_dir_mode")]
    pub mode: Mode,
    #[serde(default = "default_root")]
    pub user: String,
    #[serde(default = "default_root")]
    pub group: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MakeDir {
    pub path: PathBuf,
    #[serde(default = "default_dir_mode")]
    pub mode: Mode,
    #[serde(default = "default_root")]
    pub user: String,
    #[serde(default = "default_root")]
    pub group: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InstallFiles {
    /// Relative to the materializer's sources directory unless absolute.
    pub source: PathBuf,
    pub dest: PathBuf,
    #[serde(default)]
    pub mode: Option<Mode>,
    #[serde(default = "default_root")]
    pub user: String,
    #[serde(default = "default_root")]
    pub group: String,
    #[serde(default)]
    pub is_dir: bool,
}

/// A tar archive, optionally zstd-compressed, unpacked into `into_dir`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Tarball {
    /// Relative to the materializer's sources directory unless absolute.
    pub source: PathBuf,
    #[serde(default = "default_slash")]
    pub into_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Hardlink {
    pub link: PathBuf,
    /// Regular file inside the image the link shares its inode with.
    pub target: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Symlink {
    pub link: PathBuf,
    pub target: PathBuf,
    #[serde(default)]
    pub is_directory: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClonePath {
    pub src_layer: String,
    pub src_path: PathBuf,
    pub dst_path: PathBuf,
    #[serde(default)]
    pub omit_outer_dir: bool,
    #[serde(default)]
    pub pre_existing_dest: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UserAdd {
    pub name: String,
    pub primary_group: String,
    #[serde(default)]
    pub supplementary_groups: Vec<String>,
    pub home_dir: PathBuf,
    #[serde(default = "default_shell")]
    pub shell: PathBuf,
    #[serde(default)]
    pub uid: Option<u32>,
    #[serde(default)]
    pub comment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GroupAdd {
    pub name: String,
    #[serde(default)]
    pub gid: Option<u32>,
    #[serde(default)]
    pub members: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Mount {
    pub mountpoint: PathBuf,
    pub source: String,
    #[serde(default = "default_true")]
    pub is_directory: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BuildinfoStamp {
    #[serde(default)]
    pub revision: Option<String>,
    #[serde(default)]
    pub package: Option<String>,
}

impl FeatureData {
    pub fn kind(&self) -> FeatureKind {
        match self {
            FeatureData::RpmAction(_) => FeatureKind::RpmAction,
            FeatureData::Chef(_) => FeatureKind::Chef,
            FeatureData::Genrule(_) => FeatureKind::Genrule,
            FeatureData::Remove(_) => FeatureKind::Remove,
            FeatureData::EnsureDirsExist(_) => FeatureKind::EnsureDirsExist,
            FeatureData::Mkdir(_) => FeatureKind::Mkdir,
            FeatureData::InstallFiles(_) => FeatureKind::InstallFiles,
            FeatureData::Tarball(_) => FeatureKind::Tarball,
            FeatureData::Symlink(_) => FeatureKind::Symlink,
            FeatureData::Hardlink(_) => FeatureKind::Hardlink,
            FeatureData::Clone(_) => FeatureKind::Clone,
            FeatureData::UserAdd(_) => FeatureKind::UserAdd,
            FeatureData::GroupAdd(_) => FeatureKind::GroupAdd,
            FeatureData::Mount(_) => FeatureKind::Mount,
            FeatureData::BuildinfoStamp(_) => FeatureKind::BuildinfoStamp,
        }
    }

    fn from_payload(
        kind_name: &str,
        kind: FeatureKind,
        payload: serde_json::Value,
    ) -> std::result::Result<Self, serde_json::Error> {
        use serde_json::from_value;
        Ok(match kind {
            FeatureKind::RpmAction => {
                let decl: RpmActionDecl = from_value(payload)?;
                let action = match (kind_name, decl.action) {
                    ("rpms_install", _) => RpmActionKind::Install,
                    ("rpms_remove_if_exists", _) => RpmActionKind::RemoveIfExists,
                    ("rpms_upgrade", _) => RpmActionKind::Upgrade,
                    (_, Some(action)) => action,
                    (_, None) => {
                        return Err(serde::de::Error::missing_field("action"));
                    }
                };
                FeatureData::RpmAction(RpmAction {
                    items: decl
                        .subjects
                        .into_iter()
                        .map(|subject| RpmItem { action, subject })
                        .collect(),
                })
            }
            FeatureKind::Chef => FeatureData::Chef(from_value(payload)?),
            FeatureKind::Genrule => FeatureData::Genrule(from_value(payload)?),
            FeatureKind::Remove => FeatureData::Remove(from_value(payload)?),
            FeatureKind::EnsureDirsExist => FeatureData::EnsureDirsExist(from_value(payload)?),
            FeatureKind::Mkdir => FeatureData::Mkdir(from_value(payload)?),
            FeatureKind::InstallFiles => FeatureData::InstallFiles(from_value(payload)?),
            FeatureKind::Tarball => FeatureData::Tarball(from_value(payload)?),
            FeatureKind::Symlink => FeatureData::Symlink(from_value(payload)?),
            FeatureKind::Hardlink => FeatureData::Hardlink(from_value(payload)?),
            FeatureKind::Clone => FeatureData::Clone(from_value(payload)?),
            FeatureKind::UserAdd => FeatureData::UserAdd(from_value(payload)?),
            FeatureKind::GroupAdd => FeatureData::GroupAdd(from_value(payload)?),
            FeatureKind::Mount => FeatureData::Mount(from_value(payload)?),
            FeatureKind::BuildinfoStamp => {
                if payload.is_null() {
                    FeatureData::BuildinfoStamp(BuildinfoStamp::default())
                } else {
                    FeatureData::BuildinfoStamp(from_value(payload)?)
                }
            }
        })
    }

    /// Root every in-image path and collapse `.`/`..`. Symlink targets keep
    /// their relative form.
    fn normalize_paths(&mut self) {
        fn norm(p: &mut PathBuf) {
            *p = normalize_path(p);
        }
        match self {
            FeatureData::Remove(r) => norm(&mut r.path),
            FeatureData::EnsureDirsExist(e) => {
                norm(&mut e.path);
                norm(&mut e.into_dir);
            }
            FeatureData::Mkdir(m) => norm(&mut m.path),
            FeatureData::InstallFiles(i) => norm(&mut i.dest),
            FeatureData::Tarball(t) => norm(&mut t.into_dir),
            FeatureData::Symlink(s) => norm(&mut s.link),
            FeatureData::Hardlink(h) => {
                norm(&mut h.link);
                norm(&mut h.target);
            }
            FeatureData::Clone(c) => {
                norm(&mut c.src_path);
                norm(&mut c.dst_path);
            }
            FeatureData::UserAdd(u) => norm(&mut u.home_dir),
            FeatureData::Mount(m) => norm(&mut m.mountpoint),
            FeatureData::RpmAction(_)
            | FeatureData::Chef(_)
            | FeatureData::Genrule(_)
            | FeatureData::GroupAdd(_)
            | FeatureData::BuildinfoStamp(_) => {}
        }
    }
}

// Helper constructors for building features in code.

pub fn ensure_dirs(path: impl Into<PathBuf>) -> FeatureData {
    FeatureData::EnsureDirsExist(EnsureDirsExist {
        path: normalize_path(&path.into()),
        into_dir: default_slash(),
        mode: default_dir_mode(),
        user: default_root(),
        group: default_root(),
    })
}

pub fn ensure_dirs_into(into_dir: impl Into<PathBuf>, path: impl Into<PathBuf>) -> FeatureData {
    FeatureData::EnsureDirsExist(EnsureDirsExist {
        path: normalize_path(&path.into()),
        into_dir: normalize_path(&into_dir.into()),
        mode: default_dir_mode(),
        user: default_root(),
        group: default_root(),
    })
}

pub fn mkdir(path: impl Into<PathBuf>) -> FeatureData {
    FeatureData::Mkdir(MakeDir {
        path: normalize_path(&path.into()),
        mode: default_dir_mode(),
        user: default_root(),
        group: default_root(),
    })
}

pub fn install_file(source: impl Into<PathBuf>, dest: impl Into<PathBuf>) -> FeatureData {
    FeatureData::InstallFiles(InstallFiles {
        source: source.into(),
        dest: normalize_path(&dest.into()),
        mode: None,
        user: default_root(),
        group: default_root(),
        is_dir: false,
    })
}

pub fn tarball(source: impl Into<PathBuf>, into_dir: impl Into<PathBuf>) -> FeatureData {
    FeatureData::Tarball(Tarball {
        source: source.into(),
        into_dir: normalize_path(&into_dir.into()),
    })
}

pub fn hardlink(link: impl Into<PathBuf>, target: impl Into<PathBuf>) -> FeatureData {
    FeatureData::Hardlink(Hardlink {
        link: normalize_path(&link.into()),
        target: normalize_path(&target.into()),
    })
}

pub fn symlink(link: impl Into<PathBuf>, target: impl Into<PathBuf>) -> FeatureData {
    FeatureData::Symlink(Symlink {
        link: normalize_path(&link.into()),
        target: target.into(),
        is_directory: false,
    })
}

pub fn clone_path(
    src_layer: impl Into<String>,
    src_path: impl Into<PathBuf>,
    dst_path: impl Into<PathBuf>,
) -> FeatureData {
    FeatureData::Clone(ClonePath {
        src_layer: src_layer.into(),
        src_path: normalize_path(&src_path.into()),
        dst_path: normalize_path(&dst_path.into()),
        omit_outer_dir: false,
        pre_existing_dest: false,
    })
}

pub fn user_add(name: impl Into<String>, primary_group: impl Into<String>) -> FeatureData {
    let name = name.into();
    FeatureData::UserAdd(UserAdd {
        home_dir: PathBuf::from("/home").join(&name),
        name,
        primary_group: primary_group.into(),
        supplementary_groups: Vec::new(),
        shell: default_shell(),
        uid: None,
        comment: None,
    })
}

pub fn group_add(name: impl Into<String>) -> FeatureData {
    FeatureData::GroupAdd(GroupAdd {
        name: name.into(),
        gid: None,
        members: Vec::new(),
    })
}

pub fn mount(mountpoint: impl Into<PathBuf>, source: impl Into<String>) -> FeatureData {
    FeatureData::Mount(Mount {
        mountpoint: normalize_path(&mountpoint.into()),
        source: source.into(),
        is_directory: true,
    })
}

pub fn remove(path: impl Into<PathBuf>) -> FeatureData {
    FeatureData::Remove(RemovePath {
        path: normalize_path(&path.into()),
        must_exist: true,
    })
}

pub fn remove_if_exists(path: impl Into<PathBuf>) -> FeatureData {
    FeatureData::Remove(RemovePath {
        path: normalize_path(&path.into()),
        must_exist: false,
    })
}

pub fn rpm(action: RpmActionKind, subjects: impl IntoIterator<Item = impl Into<String>>) -> FeatureData {
    FeatureData::RpmAction(RpmAction {
        items: subjects
            .into_iter()
            .map(|s| RpmItem {
                action,
                subject: s.into(),
            })
            .collect(),
    })
}

pub fn genrule(cmd: impl IntoIterator<Item = impl Into<String>>) -> FeatureData {
    FeatureData::Genrule(Genrule {
        cmd: cmd.into_iter().map(Into::into).collect(),
        bash: None,
        user: default_root(),
    })
}

pub fn chef(run_list: impl IntoIterator<Item = impl Into<String>>) -> FeatureData {
    FeatureData::Chef(Chef {
        run_list: run_list.into_iter().map(Into::into).collect(),
        json_attributes: None,
    })
}

pub fn buildinfo_stamp(revision: Option<&str>) -> FeatureData {
    FeatureData::BuildinfoStamp(BuildinfoStamp {
        revision: revision.map(str::to_string),
        package: None,
    })
}
