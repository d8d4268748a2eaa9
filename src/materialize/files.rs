//! File-level features: `install_files`, `tarball`, `symlink`, `hardlink`,
//! `clone` and `remove`.

use super::{host_path, set_owner};
use crate::feature::{self, tarball, ClonePath, Hardlink, InstallFiles, RemovePath, Symlink, Tarball};
use crate::layer::Layer;
use anyhow::{bail, Context, Result};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

const DEFAULT_FILE_MODE: u32 = 0o644;
const DEFAULT_DIR_MODE: u32 = 0o755;

pub fn install(
    root: &Path,
    state: &Layer,
    sources_dir: Option<&Path>,
    i: &InstallFiles,
) -> Result<()> {
    let source = feature::source_path(&i.source, sources_dir);
    let dest = host_path(root, &state.resolve_path(&i.dest));
    let file_mode = i.mode.map_or(DEFAULT_FILE_MODE, |m| m.0);

    if i.is_dir {
        if !source.is_dir() {
            bail!("directory not found: {}", source.display());
        }
        copy_tree(&source, &dest, Some(file_mode))?;
        for entry in walkdir::WalkDir::new(&dest).follow_links(false) {
            let entry = entry?;
            set_owner(root, entry.path(), &i.user, &i.group)?;
        }
        return Ok(());
    }

    if !source.is_file() {
        bail!("file not found: {}", source.display());
    }
    if dest.symlink_metadata().is_ok() {
        bail!("'{}' already exists", i.dest.display());
    }
    fs::copy(&source, &dest)
        .with_context(|| format!("Failed to copy {} to {}", source.display(), dest.display()))?;
    fs::set_permissions(&dest, fs::Permissions::from_mode(file_mode))?;
    set_owner(root, &dest, &i.user, &i.group)
}

/// Unpack the archive into `into_dir`. Existing files are never replaced.
pub fn extract_tarball(
    root: &Path,
    state: &Layer,
    sources_dir: Option<&Path>,
    t: &Tarball,
) -> Result<()> {
    let source = feature::source_path(&t.source, sources_dir);
    let mut archive = tarball::open(&source)
        .with_context(|| format!("Failed to open tarball {}", source.display()))?;
    archive.set_preserve_permissions(true);
    archive.set_preserve_ownerships(super::is_root());
    archive.set_overwrite(false);
    let dest = host_path(root, &state.resolve_path(&t.into_dir));
    archive
        .unpack(&dest)
        .with_context(|| format!("Failed to unpack {} into {}", source.display(), t.into_dir.display()))
}

pub fn hardlink(root: &Path, state: &Layer, h: &Hardlink) -> Result<()> {
    let target = host_path(root, &state.resolve_path(&h.target));
    let link = host_path(root, &state.resolve_path(&h.link));
    fs::hard_link(&target, &link)
        .with_context(|| format!("Failed to link {} to {}", h.link.display(), h.target.display()))
}

/// Create the link with its target exactly as declared.
pub fn symlink(root: &Path, state: &Layer, s: &Symlink) -> Result<()> {
    let link = host_path(root, &state.resolve_path(&s.link));
    std::os::unix::fs::symlink(&s.target, &link)
        .with_context(|| format!("Failed to create symlink {}", s.link.display()))
}

/// Copy from `source_root`, the root directory of `c.src_layer`.
pub fn clone_path(source_root: &Path, root: &Path, state: &Layer, c: &ClonePath) -> Result<()> {
    let src = host_path(source_root, &c.src_path);
    if src.symlink_metadata().is_err() {
        bail!("'{}' not found in layer '{}'", c.src_path.display(), c.src_layer);
    }
    let dst = host_path(root, &state.resolve_path(&c.dst_path));

    if c.omit_outer_dir {
        for entry in fs::read_dir(&src).with_context(|| format!("Failed to read {}", src.display()))? {
            let entry = entry?;
            copy_entry(&entry.path(), &dst.join(entry.file_name()), None)?;
        }
        return Ok(());
    }
    let dst = match (c.pre_existing_dest, src.file_name()) {
        (true, Some(name)) => dst.join(name),
        _ => dst,
    };
    copy_entry(&src, &dst, None)
}

pub fn remove(root: &Path, state: &Layer, r: &RemovePath) -> Result<()> {
    let host = host_path(root, &state.resolve_path(&r.path));
    let md = match fs::symlink_metadata(&host) {
        Ok(md) => md,
        Err(_) if !r.must_exist => return Ok(()),
        Err(e) => {
            return Err(e).with_context(|| format!("'{}' does not exist", r.path.display()));
        }
    };
    if md.is_dir() {
        fs::remove_dir_all(&host)
    } else {
        fs::remove_file(&host)
    }
    .with_context(|| format!("Failed to remove {}", r.path.display()))
}

/// Seed `dst` with the contents of `src`, typically a parent layer's root.
/// `dst` must be missing or empty.
pub fn copy_root(src: &Path, dst: &Path) -> Result<()> {
    fs::create_dir_all(dst).with_context(|| format!("Failed to create {}", dst.display()))?;
    if fs::read_dir(dst)?.next().is_some() {
        bail!("'{}' is not empty", dst.display());
    }
    let mut entries: Vec<_> = fs::read_dir(src)
        .with_context(|| format!("Failed to read {}", src.display()))?
        .collect::<std::io::Result<_>>()?;
    entries.sort_by_key(|e| e.file_name());
    for entry in entries {
        copy_entry(&entry.path(), &dst.join(entry.file_name()), None)?;
    }
    let mode = fs::metadata(src)?.permissions().mode() & 0o7777;
    fs::set_permissions(dst, fs::Permissions::from_mode(mode))?;
    Ok(())
}

/// Copy a file, link or tree. `file_mode` overrides file permissions and
/// resets directories to the default; `None` keeps the source modes.
fn copy_entry(src: &Path, dst: &Path, file_mode: Option<u32>) -> Result<()> {
    let md = fs::symlink_metadata(src).with_context(|| format!("Failed to stat {}", src.display()))?;
    if md.file_type().is_symlink() {
        let target = fs::read_link(src)?;
        std::os::unix::fs::symlink(target, dst)
            .with_context(|| format!("Failed to create symlink {}", dst.display()))?;
    } else if md.is_dir() {
        copy_tree(src, dst, file_mode)?;
    } else {
        if dst.symlink_metadata().is_ok() {
            bail!("'{}' already exists", dst.display());
        }
        fs::copy(src, dst)
            .with_context(|| format!("Failed to copy {} to {}", src.display(), dst.display()))?;
        let mode = file_mode.unwrap_or(md.permissions().mode() & 0o7777);
        fs::set_permissions(dst, fs::Permissions::from_mode(mode))?;
    }
    Ok(())
}

/// Recursively copy a directory tree.
fn copy_tree(src: &Path, dst: &Path, file_mode: Option<u32>) -> Result<()> {
    let dir_mode = match file_mode {
        Some(_) => DEFAULT_DIR_MODE,
        None => fs::metadata(src)?.permissions().mode() & 0o7777,
    };
    fs::create_dir(dst).with_context(|| format!("Failed to create {}", dst.display()))?;

    let mut entries: Vec<_> = fs::read_dir(src)?.collect::<std::io::Result<_>>()?;
    entries.sort_by_key(|e| e.file_name());
    for entry in entries {
        copy_entry(&entry.path(), &dst.join(entry.file_name()), file_mode)?;
    }
    fs::set_permissions(dst, fs::Permissions::from_mode(dir_mode))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feature::FeatureData;
    use std::os::unix::fs::MetadataExt;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn temp_dirs() -> (TempDir, PathBuf, PathBuf) {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("source");
        let root = temp.path().join("root");
        fs::create_dir_all(&source).unwrap();
        fs::create_dir_all(&root).unwrap();
        (temp, source, root)
    }

    fn install_data(data: FeatureData) -> InstallFiles {
        match data {
            FeatureData::InstallFiles(i) => i,
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_install_file_sets_default_mode() {
        let (_temp, source, root) = temp_dirs();
        fs::write(source.join("motd"), "hello\n").unwrap();
        let i = install_data(feature::install_file("motd", "/motd"));
        install(&root, &Layer::new("t"), Some(&source), &i).unwrap();

        assert_eq!(fs::read_to_string(root.join("motd")).unwrap(), "hello\n");
        let mode = fs::metadata(root.join("motd")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o644);
    }

    #[test]
    fn test_install_tree_copies_links() {
        let (_temp, source, root) = temp_dirs();
        fs::create_dir_all(source.join("tree/sub")).unwrap();
        fs::write(source.join("tree/sub/file"), "x").unwrap();
        std::os::unix::fs::symlink("sub/file", source.join("tree/link")).unwrap();

        let mut i = install_data(feature::install_file("tree", "/opt/tree"));
        i.is_dir = true;
        fs::create_dir_all(root.join("opt")).unwrap();
        install(&root, &Layer::new("t"), Some(&source), &i).unwrap();

        assert!(root.join("opt/tree/sub/file").is_file());
        assert_eq!(
            fs::read_link(root.join("opt/tree/link")).unwrap(),
            PathBuf::from("sub/file")
        );
    }

    #[test]
    fn test_install_missing_source_fails() {
        let (_temp, source, root) = temp_dirs();
        let i = install_data(feature::install_file("missing", "/x"));
        let err = install(&root, &Layer::new("t"), Some(&source), &i).unwrap_err();
        assert!(err.to_string().contains("file not found"));
    }

    #[test]
    fn test_symlink_keeps_declared_target() {
        let (_temp, _source, root) = temp_dirs();
        let s = match feature::symlink("/bin", "usr/bin") {
            FeatureData::Symlink(s) => s,
            _ => unreachable!(),
        };
        symlink(&root, &Layer::new("t"), &s).unwrap();
        assert_eq!(fs::read_link(root.join("bin")).unwrap(), PathBuf::from("usr/bin"));
    }

    #[test]
    fn test_clone_modes() {
        let (_temp, source, root) = temp_dirs();
        fs::create_dir_all(source.join("etc/app")).unwrap();
        fs::write(source.join("etc/app/a.conf"), "a").unwrap();
        fs::create_dir_all(root.join("srv")).unwrap();
        let state = Layer::new("t");

        let clone = |omit: bool, pre: bool, dst: &str| {
            let mut c = match feature::clone_path("//img:src", "/etc/app", dst) {
                FeatureData::Clone(c) => c,
                _ => unreachable!(),
            };
            c.omit_outer_dir = omit;
            c.pre_existing_dest = pre;
            c
        };

        clone_path(&source, &root, &state, &clone(false, false, "/srv/plain")).unwrap();
        assert!(root.join("srv/plain/a.conf").is_file());

        clone_path(&source, &root, &state, &clone(false, true, "/srv")).unwrap();
        assert!(root.join("srv/app/a.conf").is_file());

        fs::create_dir_all(root.join("flat")).unwrap();
        clone_path(&source, &root, &state, &clone(true, false, "/flat")).unwrap();
        assert!(root.join("flat/a.conf").is_file());
    }

    #[test]
    fn test_copy_root_keeps_modes_and_refuses_non_empty() {
        let (_temp, source, root) = temp_dirs();
        fs::create_dir_all(source.join("usr/bin")).unwrap();
        fs::write(source.join("usr/bin/tool"), "#!/bin/sh\n").unwrap();
        fs::set_permissions(source.join("usr/bin/tool"), fs::Permissions::from_mode(0o750)).unwrap();

        copy_root(&source, &root).unwrap();
        let mode = fs::metadata(root.join("usr/bin/tool")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o750, "file mode should be copied from the source");

        assert!(copy_root(&source, &root).is_err(), "a populated root must not be overwritten");
    }

    #[test]
    fn test_remove_tree_and_missing() {
        let (_temp, _source, root) = temp_dirs();
        fs::create_dir_all(root.join("a/b")).unwrap();
        fs::write(root.join("a/b/c"), "").unwrap();
        let state = Layer::new("t");

        let r = |data: FeatureData| match data {
            FeatureData::Remove(r) => r,
            _ => unreachable!(),
        };
        remove(&root, &state, &r(feature::remove("/a"))).unwrap();
        assert!(!root.join("a").exists());

        remove(&root, &state, &r(feature::remove_if_exists("/a"))).unwrap();
        assert!(remove(&root, &state, &r(feature::remove("/a"))).is_err());
    }

    #[test]
    fn test_extract_tarball_keeps_modes_and_refuses_overwrite() {
        let (_temp, source, root) = temp_dirs();
        tarball::tests::write_archive(&source.join("app.tar.zst"), true);
        fs::create_dir_all(root.join("opt")).unwrap();
        let t = match feature::tarball("app.tar.zst", "/opt") {
            FeatureData::Tarball(t) => t,
            _ => unreachable!(),
        };
        let state = Layer::new("t");
        extract_tarball(&root, &state, Some(&source), &t).unwrap();

        assert_eq!(fs::read_to_string(root.join("opt/dir/file")).unwrap(), "payload");
        let mode = fs::metadata(root.join("opt/dir/file")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o640, "archive modes should be kept");
        assert_eq!(fs::read_link(root.join("opt/dir/link")).unwrap(), PathBuf::from("file"));
        assert!(root.join("opt/loose/nested").is_file());

        assert!(
            extract_tarball(&root, &state, Some(&source), &t).is_err(),
            "unpacking over existing files must fail"
        );
    }

    #[test]
    fn test_hardlink_shares_inode() {
        let (_temp, _source, root) = temp_dirs();
        fs::write(root.join("a"), "same").unwrap();
        let h = match feature::hardlink("/b", "/a") {
            FeatureData::Hardlink(h) => h,
            _ => unreachable!(),
        };
        hardlink(&root, &Layer::new("t"), &h).unwrap();

        let a = fs::metadata(root.join("a")).unwrap();
        let b = fs::metadata(root.join("b")).unwrap();
        assert_eq!(a.ino(), b.ino(), "link and target should share an inode");
        assert_eq!(a.nlink(), 2);
    }
}
