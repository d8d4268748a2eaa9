//! Reading `tarball` sources: plain or zstd-compressed tar archives.

use crate::entity::{dirs_between, is_within, normalize_path, parent_dir, Entity};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use tar::EntryType;

const ZSTD_MAGIC: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];

/// Directories the archive implies but does not list.
const IMPLIED_DIR_MODE: u32 = 0o755;

/// Open `path` as a tar archive. zstd compression is detected from the
/// frame magic, not the file name.
pub fn open(path: &Path) -> io::Result<tar::Archive<Box<dyn Read>>> {
    let mut file = File::open(path)?;
    let mut head = Vec::with_capacity(ZSTD_MAGIC.len());
    (&mut file).take(ZSTD_MAGIC.len() as u64).read_to_end(&mut head)?;
    file.seek(SeekFrom::Start(0))?;

    let reader: Box<dyn Read> = if head == ZSTD_MAGIC {
        Box::new(zstd::stream::read::Decoder::new(file)?)
    } else {
        Box::new(BufReader::new(file))
    };
    Ok(tar::Archive::new(reader))
}

/// Entities the archive creates when unpacked into `into_dir`, sorted by
/// path. Parent directories missing from the archive are included.
pub fn entities(path: &Path, into_dir: &Path) -> io::Result<Vec<Entity>> {
    let mut archive = open(path)?;
    let mut by_path: BTreeMap<PathBuf, Entity> = BTreeMap::new();

    for entry in archive.entries()? {
        let entry = entry?;
        let rel = entry.path()?.into_owned();
        let dest = normalize_path(&into_dir.join(&rel));
        if !is_within(&dest, into_dir) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("entry '{}' escapes the destination", rel.display()),
            ));
        }
        if dest == into_dir {
            continue;
        }

        let header = entry.header();
        let mode = header.mode()? & 0o7777;
        let entity = match header.entry_type() {
            EntryType::Directory => Entity::dir(&dest, mode),
            EntryType::Regular | EntryType::Continuous | EntryType::GNUSparse | EntryType::Link => {
                Entity::file(&dest, mode)
            }
            EntryType::Symlink => {
                let target = entry.link_name()?.ok_or_else(|| {
                    io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("symlink '{}' has no target", rel.display()),
                    )
                })?;
                Entity::symlink(&dest, target.into_owned())
            }
            EntryType::XGlobalHeader | EntryType::XHeader => continue,
            other => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("unsupported entry type {:?} for '{}'", other, rel.display()),
                ));
            }
        };

        for dir in dirs_between(into_dir, &parent_dir(&dest)) {
            by_path
                .entry(dir.clone())
                .or_insert_with(|| Entity::dir(dir, IMPLIED_DIR_MODE));
        }
        by_path.insert(dest, entity);
    }
    Ok(by_path.into_values().collect())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tempfile::TempDir;

    /// Write a tar with `dir/`, `dir/file` (0640), `dir/link -> file` and a
    /// top-level `loose/nested` file whose parent is not listed.
    pub(crate) fn write_archive(path: &Path, compress: bool) {
        let out: Box<dyn io::Write> = if compress {
            Box::new(
                zstd::stream::write::Encoder::new(File::create(path).unwrap(), 3)
                    .unwrap()
                    .auto_finish(),
            )
        } else {
            Box::new(File::create(path).unwrap())
        };
        let mut builder = tar::Builder::new(out);

        let mut dir = tar::Header::new_gnu();
        dir.set_entry_type(EntryType::Directory);
        dir.set_mode(0o750);
        dir.set_size(0);
        builder.append_data(&mut dir, "dir/", io::empty()).unwrap();

        for (name, body) in [("dir/file", &b"payload"[..]), ("loose/nested", &b"x"[..])] {
            let mut file = tar::Header::new_gnu();
            file.set_entry_type(EntryType::Regular);
            file.set_mode(0o640);
            file.set_size(body.len() as u64);
            builder.append_data(&mut file, name, body).unwrap();
        }

        let mut link = tar::Header::new_gnu();
        link.set_entry_type(EntryType::Symlink);
        link.set_mode(0o777);
        link.set_size(0);
        builder.append_link(&mut link, "dir/link", "file").unwrap();

        builder.into_inner().unwrap();
    }

    #[test]
    fn test_entities_rerooted_under_into_dir() {
        let temp = TempDir::new().unwrap();
        for compress in [false, true] {
            let path = temp.path().join(format!("a-{}.tar", compress));
            write_archive(&path, compress);
            let found = entities(&path, Path::new("/opt/app")).unwrap();
            assert_eq!(
                found,
                vec![
                    Entity::dir("/opt/app/dir", 0o750),
                    Entity::file("/opt/app/dir/file", 0o640),
                    Entity::symlink("/opt/app/dir/link", "file"),
                    Entity::dir("/opt/app/loose", IMPLIED_DIR_MODE),
                    Entity::file("/opt/app/loose/nested", 0o640),
                ],
                "compressed: {}",
                compress
            );
        }
    }

    #[test]
    fn test_not_an_archive() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("junk.tar");
        std::fs::write(&path, vec![0xffu8; 1024]).unwrap();
        assert!(entities(&path, Path::new("/")).is_err());
    }
}
