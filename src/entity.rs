//! Entities are the addressable objects a layer is made of: paths, users,
//! groups, mounts, package-manager units and the build-info stamp.
//!
//! Features provide entities and require them. Requirements are matched by
//! [`EntityKey`]; an [`Expect`] adds the extra check that cannot be
//! expressed by the key alone (for example "this path is a directory").

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Component, Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileType {
    File,
    Directory,
    Symlink,
}

impl FileType {
    pub fn as_str(self) -> &'static str {
        match self {
            FileType::File => "file",
            FileType::Directory => "dir",
            FileType::Symlink => "symlink",
        }
    }
}

impl From<std::fs::FileType> for FileType {
    fn from(ft: std::fs::FileType) -> Self {
        if ft.is_symlink() {
            FileType::Symlink
        } else if ft.is_dir() {
            FileType::Directory
        } else {
            FileType::File
        }
    }
}

/// Identity of an entity. Files, directories and symlinks share the `Path`
/// namespace: one path is exactly one of them.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "key", rename_all = "snake_case")]
pub enum EntityKey {
    Path(PathBuf),
    User(String),
    Group(String),
    Mount(PathBuf),
    RpmUnit(String),
    Stamp(String),
}

impl EntityKey {
    pub fn path(p: impl Into<PathBuf>) -> Self {
        EntityKey::Path(p.into())
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            EntityKey::Path(_) => "path",
            EntityKey::User(_) => "user",
            EntityKey::Group(_) => "group",
            EntityKey::Mount(_) => "mount",
            EntityKey::RpmUnit(_) => "rpm-unit",
            EntityKey::Stamp(_) => "stamp",
        }
    }

    pub fn as_path(&self) -> Option<&Path> {
        match self {
            EntityKey::Path(p) | EntityKey::Mount(p) => Some(p),
            _ => None,
        }
    }

    fn key_string(&self) -> String {
        match self {
            EntityKey::Path(p) | EntityKey::Mount(p) => p.display().to_string(),
            EntityKey::User(s) | EntityKey::Group(s) | EntityKey::RpmUnit(s) | EntityKey::Stamp(s) => {
                s.clone()
            }
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {:?})", self.kind_name(), self.key_string())
    }
}

/// An entity together with its definition.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Entity {
    Path {
        path: PathBuf,
        file_type: FileType,
        mode: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<PathBuf>,
    },
    User {
        name: String,
    },
    Group {
        name: String,
    },
    Mount {
        mountpoint: PathBuf,
        source: String,
    },
    RpmUnit {
        name: String,
    },
    Stamp {
        label: String,
    },
}

impl Entity {
    pub fn dir(path: impl Into<PathBuf>, mode: u32) -> Self {
        Entity::Path {
            path: path.into(),
            file_type: FileType::Directory,
            mode,
            target: None,
        }
    }

    pub fn file(path: impl Into<PathBuf>, mode: u32) -> Self {
        Entity::Path {
            path: path.into(),
            file_type: FileType::File,
            mode,
            target: None,
        }
    }

    pub fn symlink(link: impl Into<PathBuf>, target: impl Into<PathBuf>) -> Self {
        Entity::Path {
            path: link.into(),
            file_type: FileType::Symlink,
            mode: 0o777,
            target: Some(target.into()),
        }
    }

    pub fn user(name: impl Into<String>) -> Self {
        Entity::User { name: name.into() }
    }

    pub fn group(name: impl Into<String>) -> Self {
        Entity::Group { name: name.into() }
    }

    pub fn key(&self) -> EntityKey {
        match self {
            Entity::Path { path, .. } => EntityKey::Path(path.clone()),
            Entity::User { name } => EntityKey::User(name.clone()),
            Entity::Group { name } => EntityKey::Group(name.clone()),
            Entity::Mount { mountpoint, .. } => EntityKey::Mount(mountpoint.clone()),
            Entity::RpmUnit { name } => EntityKey::RpmUnit(name.clone()),
            Entity::Stamp { label } => EntityKey::Stamp(label.clone()),
        }
    }

    pub fn file_type(&self) -> Option<FileType> {
        match self {
            Entity::Path { file_type, .. } => Some(*file_type),
            _ => None,
        }
    }

    /// Short kind name used in messages: `file`, `dir`, `symlink`, `user`...
    pub fn kind_name(&self) -> &'static str {
        match self {
            Entity::Path { file_type, .. } => file_type.as_str(),
            other => other.key().kind_name(),
        }
    }

    /// Symlink target resolved against the link's directory.
    pub fn absolute_symlink_target(&self) -> Option<PathBuf> {
        match self {
            Entity::Path {
                path,
                target: Some(target),
                ..
            } => Some(resolve_relative(path, target)),
            _ => None,
        }
    }
}

/// `(file, "/etc/motd")`, `(dir, "/etc")`, `(user, "alice")`.
impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {:?})", self.kind_name(), self.key().key_string())
    }
}

/// Extra check applied to the entity matched by a requirement's key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Expect {
    /// Anything at the key.
    Exists,
    FileType(FileType),
}

impl Expect {
    pub fn satisfied_by(&self, entity: &Entity) -> bool {
        match self {
            Expect::Exists => true,
            Expect::FileType(ft) => entity.file_type() == Some(*ft),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Ordering {
    /// Must exist strictly before the requiring feature runs.
    Before,
    /// Must exist by the end of the requiring feature's phase.
    Concurrent,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Requirement {
    pub key: EntityKey,
    pub expect: Expect,
    pub ordering: Ordering,
}

impl Requirement {
    /// Hard build dependency: the provider is built first.
    pub fn before(key: EntityKey, expect: Expect) -> Self {
        Self {
            key,
            expect,
            ordering: Ordering::Before,
        }
    }

    /// Logical dependency: satisfied by the end of the phase, in any order.
    pub fn concurrent(key: EntityKey, expect: Expect) -> Self {
        Self {
            key,
            expect,
            ordering: Ordering::Concurrent,
        }
    }

    pub fn dir(path: impl Into<PathBuf>) -> Self {
        Self::before(
            EntityKey::Path(path.into()),
            Expect::FileType(FileType::Directory),
        )
    }

    pub fn any_path(path: impl Into<PathBuf>) -> Self {
        Self::before(EntityKey::Path(path.into()), Expect::Exists)
    }

    pub fn user(name: impl Into<String>) -> Self {
        Self::before(EntityKey::User(name.into()), Expect::Exists)
    }

    pub fn group(name: impl Into<String>) -> Self {
        Self::before(EntityKey::Group(name.into()), Expect::Exists)
    }

    pub fn is_ordered(&self) -> bool {
        self.ordering == Ordering::Before
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match (&self.key, self.expect) {
            (EntityKey::Path(_), Expect::Exists) => "any",
            (EntityKey::Path(_), Expect::FileType(ft)) => ft.as_str(),
            (other, _) => other.kind_name(),
        };
        write!(f, "({}, {:?})", kind, self.key.key_string())
    }
}

/// Root a path and collapse `.`, `..` and repeated separators.
///
/// Relative paths are interpreted relative to the image root. `..` never
/// escapes the root.
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::from("/");
    for component in path.components() {
        match component {
            Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
            Component::ParentDir => {
                out.pop();
            }
            Component::Normal(c) => out.push(c),
        }
    }
    out
}

/// Parent directory inside the image; the parent of `/` is `/`.
pub fn parent_dir(path: &Path) -> PathBuf {
    path.parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("/"))
}

/// Resolve `target` against the directory containing `link`.
pub fn resolve_relative(link: &Path, target: &Path) -> PathBuf {
    if target.is_absolute() {
        normalize_path(target)
    } else {
        normalize_path(&parent_dir(link).join(target))
    }
}

/// Directories strictly below `base` down to and including `path`,
/// outermost first. Empty if `path` is not below `base`.
pub fn dirs_between(base: &Path, path: &Path) -> Vec<PathBuf> {
    let Ok(rel) = path.strip_prefix(base) else {
        return Vec::new();
    };
    let mut current = base.to_path_buf();
    let mut out = Vec::new();
    for component in rel.components() {
        if let Component::Normal(c) = component {
            current.push(c);
            out.push(current.clone());
        }
    }
    out
}

/// Whether `path` is `base` or lies below it.
pub fn is_within(path: &Path, base: &Path) -> bool {
    path.starts_with(base)
}
