//! Deterministic tar.zst snapshots of an image root.

use anyhow::{Context, Result};
use std::fs::{self, File};
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use tar::{Builder as TarBuilder, EntryType, Header};
use walkdir::WalkDir;

/// Replace `dest_dir` with the contents of `blob`.
pub(super) fn materialize_tar_zst_dir(blob: &Path, dest_dir: &Path) -> Result<()> {
    let parent = dest_dir.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;
    let tmp = parent.join(super::tmp_name(".restore"));
    fs::create_dir_all(&tmp)?;

    let f = File::open(blob).with_context(|| format!("Failed to open {}", blob.display()))?;
    let decoder = zstd::stream::Decoder::new(f)?;
    let mut archive = tar::Archive::new(decoder);
    archive.set_preserve_permissions(true);
    // SAFETY: geteuid has no preconditions.
    archive.set_preserve_ownerships(unsafe { libc::geteuid() } == 0);
    if let Err(e) = archive.unpack(&tmp) {
        let _ = fs::remove_dir_all(&tmp);
        return Err(e).with_context(|| format!("Failed to unpack {}", blob.display()));
    }

    if dest_dir.exists() {
        fs::remove_dir_all(dest_dir)
            .with_context(|| format!("Failed to remove {}", dest_dir.display()))?;
    }
    fs::rename(&tmp, dest_dir).with_context(|| {
        format!(
            "Failed to move extracted dir {} to {}",
            tmp.display(),
            dest_dir.display()
        )
    })?;
    Ok(())
}

/// Archive `src_dir` with sorted entries and zeroed mtimes. Modes and
/// numeric owners are kept since they are part of the image.
pub(super) fn create_tar_zst(src_dir: &Path, out_path: &Path) -> Result<()> {
    let out = File::create(out_path)
        .with_context(|| format!("Failed to create {}", out_path.display()))?;
    let encoder = zstd::stream::Encoder::new(out, 3)?;
    let mut builder = TarBuilder::new(encoder);

    let mut entries: Vec<PathBuf> = WalkDir::new(src_dir)
        .follow_links(false)
        .into_iter()
        .filter_map(Result::ok)
        .map(|e| e.into_path())
        .filter(|p| p != src_dir)
        .collect();
    entries.sort();

    for p in entries {
        let rel = p.strip_prefix(src_dir).unwrap_or(&p).to_path_buf();
        let md = fs::symlink_metadata(&p)?;
        let mut header = Header::new_gnu();
        header.set_mtime(0);
        header.set_uid(md.uid() as u64);
        header.set_gid(md.gid() as u64);
        header.set_mode(md.permissions().mode() & 0o7777);
        header.set_size(0);

        if md.file_type().is_symlink() {
            header.set_entry_type(EntryType::Symlink);
            header.set_link_name(fs::read_link(&p)?)?;
            header.set_cksum();
            builder.append_data(&mut header, &rel, std::io::empty())?;
        } else if md.is_dir() {
            header.set_entry_type(EntryType::Directory);
            header.set_cksum();
            builder.append_data(&mut header, &rel, std::io::empty())?;
        } else if md.is_file() {
            header.set_entry_type(EntryType::Regular);
            header.set_size(md.len());
            header.set_cksum();
            let mut f = File::open(&p)?;
            builder.append_data(&mut header, &rel, &mut f)?;
        } else {
            tracing::warn!("not snapshotting special file {}", p.display());
        }
    }

    let encoder = builder
        .into_inner()
        .with_context(|| "Failed to finalize tar builder")?;
    encoder.finish()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_archive_is_deterministic() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src");
        fs::create_dir_all(src.join("b")).unwrap();
        fs::write(src.join("a"), "1").unwrap();
        fs::write(src.join("b/c"), "2").unwrap();

        let one = tmp.path().join("one.tar.zst");
        let two = tmp.path().join("two.tar.zst");
        create_tar_zst(&src, &one).unwrap();
        create_tar_zst(&src, &two).unwrap();
        assert_eq!(fs::read(&one).unwrap(), fs::read(&two).unwrap());
    }

    #[test]
    fn test_modes_survive_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src");
        fs::create_dir_all(&src).unwrap();
        fs::write(src.join("run"), "#!/bin/sh\n").unwrap();
        fs::set_permissions(src.join("run"), fs::Permissions::from_mode(0o750)).unwrap();

        let blob = tmp.path().join("snap.tar.zst");
        create_tar_zst(&src, &blob).unwrap();
        let dest = tmp.path().join("dest");
        materialize_tar_zst_dir(&blob, &dest).unwrap();

        let mode = fs::metadata(dest.join("run")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o750, "mode must survive the snapshot");
    }
}
