//! Per-kind requires/provides contracts.
//!
//! Predictable kinds declare exactly what they create and what must exist
//! before they run. Unpredictable kinds (genrule, chef) declare nothing;
//! their effect is discovered after materialization.

use super::{
    tarball, ClonePath, EnsureDirsExist, Feature, FeatureData, GroupAdd, Hardlink, InstallFiles,
    MakeDir, Mode, Mount, RpmActionKind, Symlink, Tarball, UserAdd,
};
use crate::entity::{
    dirs_between, is_within, normalize_path, parent_dir, resolve_relative, Entity, EntityKey,
    Expect, FileType, Requirement,
};
use crate::error::{Error, Result};
use crate::layer::Layer;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

const DEFAULT_FILE_MODE: u32 = 0o644;
const DEFAULT_DIR_MODE: u32 = 0o755;

/// Everything extraction may look at besides the feature itself.
#[derive(Debug, Clone, Copy)]
pub struct ExtractContext<'a> {
    /// Label of the layer being built.
    pub layer_label: &'a str,
    /// Parent layer plus every phase applied so far.
    pub state: &'a Layer,
    /// Layers that `clone` features may copy from, by label.
    pub dependencies: &'a BTreeMap<String, Layer>,
    /// Base directory for relative `install_files` sources.
    pub sources_dir: Option<&'a Path>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequiresProvides {
    pub requires: Vec<Requirement>,
    pub provides: Vec<Entity>,
    /// Keys this feature deletes. A path key deletes its subtree.
    pub removes: Vec<EntityKey>,
}

impl RequiresProvides {
    fn require(&mut self, requirement: Requirement) {
        if !self.requires.contains(&requirement) {
            self.requires.push(requirement);
        }
    }

    /// Require the parent of `path` to be a directory. The root always is.
    fn require_parent_dir(&mut self, path: &Path) {
        let parent = parent_dir(path);
        if parent != Path::new("/") {
            self.require(Requirement::dir(parent));
        }
    }

    fn require_owner(&mut self, user: &str, group: &str) {
        self.require(Requirement::user(user));
        self.require(Requirement::group(group));
    }
}

/// Compute the contract of one feature against `ctx`.
pub fn requires_provides(feature: &Feature, ctx: &ExtractContext<'_>) -> Result<RequiresProvides> {
    let mut rp = RequiresProvides::default();
    let config_error =
        |message: String| Error::configuration(ctx.layer_label, &feature.origin_label, message);

    match &feature.data {
        FeatureData::EnsureDirsExist(e) => ensure_dirs_exist(e, ctx, &mut rp, config_error)?,
        FeatureData::Mkdir(m) => mkdir(m, &mut rp),
        FeatureData::InstallFiles(i) => install_files(i, ctx, &mut rp, config_error)?,
        FeatureData::Tarball(t) => unpack_tarball(t, ctx, &mut rp, config_error)?,
        FeatureData::Symlink(s) => symlink(s, &mut rp),
        FeatureData::Hardlink(h) => hardlink(h, ctx, &mut rp),
        FeatureData::Clone(c) => clone_path(c, ctx, &mut rp, config_error)?,
        FeatureData::UserAdd(u) => user_add(u, &mut rp),
        FeatureData::GroupAdd(g) => group_add(g, &mut rp),
        FeatureData::Mount(m) => mount(m, &mut rp),
        FeatureData::RpmAction(action) => {
            for item in &action.items {
                let key = EntityKey::RpmUnit(item.subject.clone());
                match item.action {
                    RpmActionKind::Install | RpmActionKind::Upgrade => {
                        // Already-installed units are upgraded in place.
                        if !ctx.state.contains(&key) {
                            rp.provides.push(Entity::RpmUnit {
                                name: item.subject.clone(),
                            });
                        }
                    }
                    RpmActionKind::RemoveIfExists => rp.removes.push(key),
                }
            }
        }
        FeatureData::Remove(r) => {
            if r.must_exist {
                rp.require(Requirement::any_path(&r.path));
            }
            rp.removes.push(EntityKey::Path(r.path.clone()));
        }
        FeatureData::BuildinfoStamp(_) => rp.provides.push(Entity::Stamp {
            label: ctx.layer_label.to_string(),
        }),
        FeatureData::Genrule(_) | FeatureData::Chef(_) => {}
    }
    Ok(rp)
}

/// Extract every feature of a phase. Runs in parallel with the `parallel`
/// cargo feature; results keep the input order.
pub fn extract_all(features: &[Feature], ctx: &ExtractContext<'_>) -> Result<Vec<RequiresProvides>> {
    #[cfg(feature = "parallel")]
    {
        use rayon::prelude::*;
        features
            .par_iter()
            .map(|f| requires_provides(f, ctx))
            .collect()
    }
    #[cfg(not(feature = "parallel"))]
    {
        features.iter().map(|f| requires_provides(f, ctx)).collect()
    }
}

fn ensure_dirs_exist(
    e: &EnsureDirsExist,
    ctx: &ExtractContext<'_>,
    rp: &mut RequiresProvides,
    config_error: impl Fn(String) -> Error,
) -> Result<()> {
    if !is_within(&e.path, &e.into_dir) {
        return Err(config_error(format!(
            "path '{}' is not inside into_dir '{}'",
            e.path.display(),
            e.into_dir.display()
        )));
    }
    if e.into_dir != Path::new("/") {
        rp.require(Requirement::dir(&e.into_dir));
    }
    rp.require_owner(&e.user, &e.group);

    for dir in dirs_between(&e.into_dir, &e.path) {
        let resolved = ctx.state.resolve_path(&dir);
        let wanted = Entity::dir(&resolved, e.mode.0);
        match ctx.state.get(&EntityKey::Path(resolved.clone())) {
            // Ensured, not provided.
            Some(existing) if existing.entity == wanted => {}
            _ => rp.provides.push(wanted),
        }
    }
    Ok(())
}

fn mkdir(m: &MakeDir, rp: &mut RequiresProvides) {
    rp.require_parent_dir(&m.path);
    rp.require_owner(&m.user, &m.group);
    rp.provides.push(Entity::dir(&m.path, m.mode.0));
}

fn resolve_source(source: &Path, ctx: &ExtractContext<'_>) -> PathBuf {
    super::source_path(source, ctx.sources_dir)
}

fn install_files(
    i: &InstallFiles,
    ctx: &ExtractContext<'_>,
    rp: &mut RequiresProvides,
    config_error: impl Fn(String) -> Error,
) -> Result<()> {
    rp.require_parent_dir(&i.dest);
    rp.require_owner(&i.user, &i.group);

    let file_mode = i.mode.map_or(DEFAULT_FILE_MODE, |Mode(m)| m);
    if !i.is_dir {
        rp.provides.push(Entity::file(&i.dest, file_mode));
        return Ok(());
    }

    let source = resolve_source(&i.source, ctx);
    if !source.is_dir() {
        return Err(config_error(format!(
            "install source '{}' is not a directory",
            source.display()
        )));
    }
    for entry in WalkDir::new(&source).follow_links(false).sort_by_file_name() {
        let entry = entry.map_err(|e| config_error(format!("cannot walk '{}': {}", source.display(), e)))?;
        let rel = entry.path().strip_prefix(&source).unwrap_or(Path::new(""));
        let dest = normalize_path(&i.dest.join(rel));
        let ft = FileType::from(entry.file_type());
        rp.provides.push(match ft {
            FileType::Directory => Entity::dir(dest, DEFAULT_DIR_MODE),
            FileType::File => Entity::file(dest, file_mode),
            FileType::Symlink => {
                let target = std::fs::read_link(entry.path()).map_err(|e| {
                    config_error(format!("cannot read link '{}': {}", entry.path().display(), e))
                })?;
                Entity::symlink(dest, target)
            }
        });
    }
    Ok(())
}

fn unpack_tarball(
    t: &Tarball,
    ctx: &ExtractContext<'_>,
    rp: &mut RequiresProvides,
    config_error: impl Fn(String) -> Error,
) -> Result<()> {
    if t.into_dir != Path::new("/") {
        rp.require(Requirement::dir(&t.into_dir));
    }
    let source = resolve_source(&t.source, ctx);
    let entities = tarball::entities(&source, &t.into_dir)
        .map_err(|e| config_error(format!("cannot read tarball '{}': {}", source.display(), e)))?;
    rp.provides.extend(entities);
    Ok(())
}

/// The link is a second name for the target's inode, so it takes the
/// target's mode when the state knows it.
fn hardlink(h: &Hardlink, ctx: &ExtractContext<'_>, rp: &mut RequiresProvides) {
    rp.require_parent_dir(&h.link);
    rp.require(Requirement::before(
        EntityKey::Path(h.target.clone()),
        Expect::FileType(FileType::File),
    ));
    let mode = match ctx.state.lookup(&EntityKey::Path(h.target.clone())) {
        Some(record) => match record.entity {
            Entity::Path { mode, .. } => mode,
            _ => DEFAULT_FILE_MODE,
        },
        None => DEFAULT_FILE_MODE,
    };
    rp.provides.push(Entity::file(&h.link, mode));
}

/// Symlink targets that need not exist in the image.
fn target_exempt(target: &Path) -> bool {
    target == Path::new("/dev/null") || is_within(target, Path::new("/run"))
}

fn symlink(s: &Symlink, rp: &mut RequiresProvides) {
    rp.require_parent_dir(&s.link);
    let target = resolve_relative(&s.link, &s.target);
    if !target_exempt(&target) {
        let expect = if s.is_directory {
            Expect::FileType(FileType::Directory)
        } else {
            Expect::Exists
        };
        rp.require(Requirement::before(EntityKey::Path(target), expect));
    }
    rp.provides.push(Entity::symlink(&s.link, &s.target));
}

fn clone_path(
    c: &ClonePath,
    ctx: &ExtractContext<'_>,
    rp: &mut RequiresProvides,
    config_error: impl Fn(String) -> Error,
) -> Result<()> {
    let source = ctx
        .dependencies
        .get(&c.src_layer)
        .ok_or_else(|| config_error(format!("unknown source layer '{}'", c.src_layer)))?;
    let src_path = source.resolve_path(&c.src_path);
    let Some(root_record) = source.get(&EntityKey::Path(src_path.clone())) else {
        return Err(config_error(format!(
            "'{}' does not exist in layer '{}'",
            c.src_path.display(),
            c.src_layer
        )));
    };

    let dest_root = if c.omit_outer_dir {
        if root_record.entity.file_type() != Some(FileType::Directory) {
            return Err(config_error(format!(
                "omit_outer_dir needs a directory, '{}' is a {}",
                c.src_path.display(),
                root_record.entity.kind_name()
            )));
        }
        rp.require(Requirement::dir(&c.dst_path));
        c.dst_path.clone()
    } else if c.pre_existing_dest {
        rp.require(Requirement::dir(&c.dst_path));
        match src_path.file_name() {
            Some(name) => c.dst_path.join(name),
            None => c.dst_path.clone(),
        }
    } else {
        rp.require_parent_dir(&c.dst_path);
        c.dst_path.clone()
    };

    for record in source.paths_under(&src_path) {
        let Entity::Path {
            path,
            file_type,
            mode,
            target,
        } = &record.entity
        else {
            continue;
        };
        if c.omit_outer_dir && path == &src_path {
            continue;
        }
        let rel = path.strip_prefix(&src_path).unwrap_or(Path::new(""));
        rp.provides.push(Entity::Path {
            path: normalize_path(&dest_root.join(rel)),
            file_type: *file_type,
            mode: *mode,
            target: target.clone(),
        });
    }
    Ok(())
}

fn user_add(u: &UserAdd, rp: &mut RequiresProvides) {
    rp.require(Requirement::group(&u.primary_group));
    for group in &u.supplementary_groups {
        rp.require(Requirement::group(group));
    }
    rp.provides.push(Entity::user(&u.name));
}

fn group_add(g: &GroupAdd, rp: &mut RequiresProvides) {
    for member in &g.members {
        rp.require(Requirement::concurrent(
            EntityKey::User(member.clone()),
            Expect::Exists,
        ));
    }
    rp.provides.push(Entity::group(&g.name));
}

fn mount(m: &Mount, rp: &mut RequiresProvides) {
    rp.require_parent_dir(&m.mountpoint);
    rp.provides.push(Entity::Mount {
        mountpoint: m.mountpoint.clone(),
        source: m.source.clone(),
    });
}
