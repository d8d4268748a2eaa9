//! User and group database entries in `/etc/passwd` and `/etc/group`.

use crate::feature::{GroupAdd, UserAdd};
use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// First id handed out to users and groups declared without one.
const FIRST_DYNAMIC_ID: u32 = 1000;

fn passwd_path(root: &Path) -> PathBuf {
    root.join("etc/passwd")
}

fn group_path(root: &Path) -> PathBuf {
    root.join("etc/group")
}

/// Read a database, treating a missing file as empty.
fn read_db(path: &Path) -> Result<String> {
    if !path.exists() {
        return Ok(String::new());
    }
    fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))
}

fn write_db(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, content).with_context(|| format!("Failed to write {}", path.display()))
}

/// Numeric id in `field` of the entry named `name`.
fn lookup_id(db: &Path, name: &str, field: usize) -> Result<Option<u32>> {
    for line in read_db(db)?.lines() {
        let parts: Vec<&str> = line.split(':').collect();
        if parts.len() > field && parts[0] == name {
            let id = parts[field].parse().with_context(|| {
                format!(
                    "Corrupted database: invalid id '{}' for '{}' at {}",
                    parts[field],
                    name,
                    db.display()
                )
            })?;
            return Ok(Some(id));
        }
    }
    Ok(None)
}

pub fn lookup_uid(root: &Path, user: &str) -> Result<Option<u32>> {
    lookup_id(&passwd_path(root), user, 2)
}

pub fn lookup_gid(root: &Path, group: &str) -> Result<Option<u32>> {
    lookup_id(&group_path(root), group, 2)
}

/// Uid of `user` inside the image. Numeric names are taken as ids and
/// `root` is 0 even without a passwd file.
pub fn resolve_uid(root: &Path, user: &str) -> Result<u32> {
    if let Ok(id) = user.parse() {
        return Ok(id);
    }
    match lookup_uid(root, user)? {
        Some(id) => Ok(id),
        None if user == "root" => Ok(0),
        None => bail!("user '{}' not found in {}", user, passwd_path(root).display()),
    }
}

pub fn resolve_gid(root: &Path, group: &str) -> Result<u32> {
    if let Ok(id) = group.parse() {
        return Ok(id);
    }
    match lookup_gid(root, group)? {
        Some(id) => Ok(id),
        None if group == "root" => Ok(0),
        None => bail!("group '{}' not found in {}", group, group_path(root).display()),
    }
}

fn has_entry(content: &str, name: &str) -> bool {
    content
        .lines()
        .any(|line| line.split(':').next() == Some(name))
}

/// Smallest free id at or above [`FIRST_DYNAMIC_ID`].
fn next_id(content: &str) -> u32 {
    content
        .lines()
        .filter_map(|line| line.split(':').nth(2)?.parse::<u32>().ok())
        .filter(|&id| id >= FIRST_DYNAMIC_ID && id < 60000)
        .max()
        .map_or(FIRST_DYNAMIC_ID, |id| id + 1)
}

fn push_line(content: &mut String, line: &str) {
    if !content.is_empty() && !content.ends_with('\n') {
        content.push('\n');
    }
    content.push_str(line);
    content.push('\n');
}

pub fn add_group(root: &Path, group: &GroupAdd) -> Result<()> {
    let path = group_path(root);
    let mut content = read_db(&path)?;
    if has_entry(&content, &group.name) {
        bail!("group '{}' already exists in {}", group.name, path.display());
    }
    let gid = group.gid.unwrap_or_else(|| next_id(&content));
    push_line(
        &mut content,
        &format!("{}:x:{}:{}", group.name, gid, group.members.join(",")),
    );
    write_db(&path, &content)
}

pub fn add_user(root: &Path, user: &UserAdd) -> Result<()> {
    let path = passwd_path(root);
    let mut content = read_db(&path)?;
    if has_entry(&content, &user.name) {
        bail!("user '{}' already exists in {}", user.name, path.display());
    }
    let gid = resolve_gid(root, &user.primary_group)
        .with_context(|| format!("primary group of user '{}'", user.name))?;
    let uid = user.uid.unwrap_or_else(|| next_id(&content));
    push_line(
        &mut content,
        &format!(
            "{}:x:{}:{}:{}:{}:{}",
            user.name,
            uid,
            gid,
            user.comment.as_deref().unwrap_or(""),
            user.home_dir.display(),
            user.shell.display()
        ),
    );
    write_db(&path, &content)?;

    for group in &user.supplementary_groups {
        add_member(root, group, &user.name)?;
    }
    Ok(())
}

/// Append `user` to the member list of `group`.
fn add_member(root: &Path, group: &str, user: &str) -> Result<()> {
    let path = group_path(root);
    let content = read_db(&path)?;
    let mut found = false;
    let mut out = String::with_capacity(content.len() + user.len() + 1);
    for line in content.lines() {
        let mut parts: Vec<String> = line.split(':').map(str::to_string).collect();
        if parts.len() >= 4 && parts[0] == group {
            found = true;
            let mut members: Vec<&str> = parts[3].split(',').filter(|m| !m.is_empty()).collect();
            if !members.contains(&user) {
                members.push(user);
            }
            parts[3] = members.join(",");
        }
        push_line(&mut out, &parts.join(":"));
    }
    if !found {
        bail!("group '{}' not found in {}", group, path.display());
    }
    write_db(&path, &out)
}
