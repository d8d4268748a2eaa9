//! `ensure_dirs_exist` and `mkdir`.

use super::{host_path, set_owner};
use crate::entity::dirs_between;
use crate::feature::{EnsureDirsExist, MakeDir};
use crate::layer::Layer;
use anyhow::{bail, Context, Result};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

/// Create every missing directory from `into_dir` down to `path`.
/// Directories that already exist are left as they are.
pub fn ensure_dirs(root: &Path, state: &Layer, e: &EnsureDirsExist) -> Result<()> {
    for dir in dirs_between(&e.into_dir, &e.path) {
        let host = host_path(root, &state.resolve_path(&dir));
        match fs::symlink_metadata(&host) {
            Ok(md) if md.is_dir() => continue,
            Ok(_) => bail!("'{}' exists and is not a directory", dir.display()),
            Err(_) => {}
        }
        create_with_mode(&host, e.mode.0)?;
        set_owner(root, &host, &e.user, &e.group)?;
    }
    Ok(())
}

pub fn make_dir(root: &Path, state: &Layer, m: &MakeDir) -> Result<()> {
    let host = host_path(root, &state.resolve_path(&m.path));
    create_with_mode(&host, m.mode.0)?;
    set_owner(root, &host, &m.user, &m.group)
}

fn create_with_mode(host: &Path, mode: u32) -> Result<()> {
    fs::create_dir(host).with_context(|| format!("Failed to create {}", host.display()))?;
    fs::set_permissions(host, fs::Permissions::from_mode(mode))
        .with_context(|| format!("Failed to set mode of {}", host.display()))
}
