//! Discover the entities of a root filesystem on disk.
//!
//! Used to scan an existing image into a [`super::Layer`] and to reconcile
//! unpredictable phases, whose effects are only known after they ran.

use super::{EntityRecord, Layer, PhaseOutcome, IMPLICIT_ORIGIN};
use crate::entity::{Entity, EntityKey, FileType};
use crate::phase::Phase;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Build metadata directory inside the image. Not part of the entity set.
pub const META_DIR: &str = ".meta";

/// Mount metadata as stored under `/.meta/mounts`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountRecord {
    pub mountpoint: PathBuf,
    pub source: String,
}

/// File name for a mountpoint's metadata: the path with `/` escaped.
pub fn mount_record_name(mountpoint: &Path) -> String {
    let escaped = mountpoint
        .to_string_lossy()
        .trim_start_matches('/')
        .replace('\\', "\\\\")
        .replace('/', "\\x2f");
    format!("{}.json", escaped)
}

/// Crawl `root` into entities: every path, users from `etc/passwd`,
/// groups from `etc/group` and mounts recorded under `/.meta/mounts`.
/// Mountpoint placeholders are represented by their mount, not as paths.
pub fn crawl(root: &Path) -> Result<Vec<Entity>> {
    let mut entities = Vec::new();
    let meta = root.join(META_DIR);
    let mounts = read_mounts(&meta.join("mounts"))?;
    let placeholders: BTreeSet<PathBuf> = mounts
        .iter()
        .filter_map(|m| match m {
            Entity::Mount { mountpoint, .. } => {
                Some(root.join(mountpoint.strip_prefix("/").unwrap_or(mountpoint)))
            }
            _ => None,
        })
        .collect();

    let walker = WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| e.path() != meta && !placeholders.contains(e.path()));

    for entry in walker {
        let entry = entry.with_context(|| format!("Failed to walk '{}'", root.display()))?;
        let rel = entry
            .path()
            .strip_prefix(root)
            .with_context(|| format!("'{}' escaped the root", entry.path().display()))?;
        let path = Path::new("/").join(rel);
        let metadata = entry
            .path()
            .symlink_metadata()
            .with_context(|| format!("Failed to stat '{}'", entry.path().display()))?;
        let file_type = FileType::from(metadata.file_type());
        let target = if file_type == FileType::Symlink {
            Some(fs::read_link(entry.path()).with_context(|| {
                format!("Failed to read symlink '{}'", entry.path().display())
            })?)
        } else {
            None
        };
        let mode = if file_type == FileType::Symlink {
            0o777
        } else {
            metadata.permissions().mode() & 0o7777
        };
        entities.push(Entity::Path {
            path,
            file_type,
            mode,
            target,
        });
    }

    for name in read_names(&root.join("etc/passwd"))? {
        entities.push(Entity::User { name });
    }
    for name in read_names(&root.join("etc/group"))? {
        entities.push(Entity::Group { name });
    }
    entities.extend(mounts);
    Ok(entities)
}

/// First field of each `name:...` line of a passwd-style database.
///
/// A missing file is an empty database. Malformed lines fail: a database
/// we cannot parse must not silently lose entries.
pub fn read_names(db: &Path) -> Result<Vec<String>> {
    if !db.exists() {
        return Ok(Vec::new());
    }
    let content = fs::read_to_string(db)
        .with_context(|| format!("Failed to read '{}'", db.display()))?;
    let mut names = Vec::new();
    for (lineno, line) in content.lines().enumerate() {
        if line.trim().is_empty() || line.starts_with('#') {
            continue;
        }
        let parts: Vec<&str> = line.split(':').collect();
        if parts.len() < 3 || parts[0].is_empty() {
            anyhow::bail!("Corrupted database '{}' at line {}", db.display(), lineno + 1);
        }
        names.push(parts[0].to_string());
    }
    Ok(names)
}

fn read_mounts(dir: &Path) -> Result<Vec<Entity>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut mounts = Vec::new();
    let mut entries: Vec<PathBuf> = fs::read_dir(dir)
        .with_context(|| format!("Failed to list '{}'", dir.display()))?
        .map(|e| e.map(|e| e.path()))
        .collect::<std::io::Result<_>>()
        .with_context(|| format!("Failed to list '{}'", dir.display()))?;
    entries.sort();
    for path in entries {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read mount record '{}'", path.display()))?;
        let record: MountRecord = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse mount record '{}'", path.display()))?;
        mounts.push(Entity::Mount {
            mountpoint: record.mountpoint,
            source: record.source,
        });
    }
    Ok(mounts)
}

/// Whether a crawl can see entities under `key`.
pub fn is_crawlable(key: &EntityKey) -> bool {
    matches!(
        key,
        EntityKey::Path(_) | EntityKey::User(_) | EntityKey::Group(_) | EntityKey::Mount(_)
    )
}

/// Difference between `state` and what was crawled after a phase ran.
///
/// New or redefined entities are attributed to `origin`. Keys the crawl no
/// longer sees are removed. Package units, stamps and the implicit root
/// entities are not reliably visible on disk and are left alone.
pub fn diff(state: &Layer, crawled: Vec<Entity>, origin: &str, phase: Phase) -> PhaseOutcome {
    let mut outcome = PhaseOutcome::default();
    let mut seen = BTreeSet::new();

    for entity in crawled {
        let key = entity.key();
        let unchanged = state.get(&key).map_or(false, |r| r.entity == entity);
        seen.insert(key);
        if !unchanged {
            outcome
                .provided
                .push(EntityRecord::new(entity, origin, Some(phase)));
        }
    }

    for record in state.records() {
        let key = record.entity.key();
        if is_crawlable(&key) && record.origin != IMPLICIT_ORIGIN && !seen.contains(&key) {
            outcome.removed.push(key);
        }
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;
    use tempfile::TempDir;

    fn rootfs() -> (TempDir, PathBuf) {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("root");
        fs::create_dir_all(root.join("etc")).unwrap();
        fs::create_dir_all(root.join("usr/bin")).unwrap();
        fs::write(
            root.join("etc/passwd"),
            "root:x:0:0:root:/root:/bin/bash\ndbus:x:81:81:System message bus:/:/sbin/nologin\n",
        )
        .unwrap();
        fs::write(root.join("etc/group"), "root:x:0:\nwheel:x:10:alice\n").unwrap();
        fs::write(root.join("usr/bin/tool"), "#!/bin/sh\n").unwrap();
        fs::set_permissions(root.join("usr/bin/tool"), fs::Permissions::from_mode(0o755)).unwrap();
        symlink("usr/bin", root.join("bin")).unwrap();
        (temp, root)
    }

    #[test]
    fn test_crawl_finds_paths_users_groups() {
        let (_temp, root) = rootfs();
        let entities = crawl(&root).unwrap();

        assert!(entities.contains(&Entity::file("/usr/bin/tool", 0o755)));
        assert!(entities.contains(&Entity::symlink("/bin", "usr/bin")));
        assert!(entities.contains(&Entity::user("dbus")));
        assert!(entities.contains(&Entity::group("wheel")));
        assert!(entities
            .iter()
            .any(|e| e.key() == EntityKey::path("/") && e.file_type() == Some(FileType::Directory)));
    }

    #[test]
    fn test_crawl_skips_meta_but_reads_mounts() {
        let (_temp, root) = rootfs();
        let mounts = root.join(META_DIR).join("mounts");
        fs::create_dir_all(&mounts).unwrap();
        let record = MountRecord {
            mountpoint: PathBuf::from("/mnt/data"),
            source: "//vol:data".into(),
        };
        fs::write(
            mounts.join(mount_record_name(&record.mountpoint)),
            serde_json::to_string(&record).unwrap(),
        )
        .unwrap();
        fs::create_dir_all(root.join("mnt/data")).unwrap();

        let entities = crawl(&root).unwrap();
        assert!(!entities
            .iter()
            .any(|e| matches!(e.key(), EntityKey::Path(p) if p.starts_with("/.meta"))));
        assert!(entities.iter().any(|e| e.key() == EntityKey::path("/mnt")));
        assert!(
            !entities.iter().any(|e| e.key() == EntityKey::path("/mnt/data")),
            "a mountpoint placeholder is not a path entity"
        );
        assert!(entities.contains(&Entity::Mount {
            mountpoint: "/mnt/data".into(),
            source: "//vol:data".into()
        }));
    }

    #[test]
    fn test_corrupted_passwd_fails() {
        let (_temp, root) = rootfs();
        fs::write(root.join("etc/passwd"), "garbage\n").unwrap();
        let err = crawl(&root).unwrap_err();
        assert!(err.to_string().contains("Corrupted"), "{}", err);
    }

    #[test]
    fn test_diff_reports_additions_and_removals() {
        let (_temp, root) = rootfs();
        let mut state = Layer::from_rootfs("before", &root).unwrap();
        state.insert(EntityRecord::new(Entity::RpmUnit { name: "foo".into() }, "x", None));

        fs::remove_file(root.join("usr/bin/tool")).unwrap();
        fs::create_dir(root.join("opt")).unwrap();

        let outcome = diff(&state, crawl(&root).unwrap(), "genrule", Phase::Genrule);
        let provided: Vec<EntityKey> = outcome.provided.iter().map(|r| r.entity.key()).collect();
        assert!(provided.contains(&EntityKey::path("/opt")));
        assert_eq!(outcome.removed, vec![EntityKey::path("/usr/bin/tool")]);
        assert!(outcome.provided.iter().all(|r| r.origin == "genrule"));
    }
}
