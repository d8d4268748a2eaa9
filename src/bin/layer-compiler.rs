use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use layer_compiler::cache::PhaseCache;
use layer_compiler::compiler::{CommandResolver, PackageResolver, PassthroughResolver};
use layer_compiler::config::Config;
use layer_compiler::feature::parse_declarations;
use layer_compiler::logging::{self, LogSettings};
use layer_compiler::materialize::{files, FsMaterializer};
use layer_compiler::{preflight, Layer, LayerBuild, Phase};
use serde::Serialize;

/// Phase-ordered compiler for declarative image layers
#[derive(Parser, Debug)]
#[command(name = "layer-compiler", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[arg(long, global = true, value_name = "FILE", help = "Configuration file")]
    config: Option<PathBuf>,

    #[arg(long, global = true, value_name = "LEVEL", help = "Set logging level")]
    log_level: Option<String>,

    #[arg(
        short = 'v',
        long,
        global = true,
        action = clap::ArgAction::Count,
        help = "Increase verbosity (can be used multiple times)"
    )]
    verbose: u8,

    #[arg(
        short = 'q',
        long,
        global = true,
        conflicts_with = "verbose",
        help = "Only log errors"
    )]
    quiet: bool,

    #[arg(long, global = true, help = "Log JSON objects instead of text")]
    log_json: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    #[command(about = "Print the phase order")]
    Phases,

    #[command(
        about = "Plan a layer without touching the filesystem",
        long_about = "Partitions, checks and orders the declared features and prints the \
                      resulting plan as JSON.\n\n\
                      Examples:\n  \
                      layer-compiler depgraph --label //img:app --feature-json app.json\n  \
                      layer-compiler depgraph --label //img:app --feature-json app.json --parent base.json"
    )]
    Depgraph(PlanArgs),

    #[command(
        about = "Build a layer into a root directory",
        long_about = "Materializes every phase of the layer into --root and writes the \
                      resulting layer description as JSON.\n\n\
                      Examples:\n  \
                      layer-compiler compile --label //img:app --feature-json app.json --root out/app\n  \
                      layer-compiler compile --label //img:app --feature-json app.json --root out/app \\\n    \
                      --parent base.json --parent-root out/base"
    )]
    Compile(CompileArgs),

    #[command(about = "Describe an existing root directory as a layer")]
    Scan(ScanArgs),

    #[command(subcommand, about = "Phase cache maintenance")]
    Cache(CacheCommand),
}

#[derive(Args, Debug, Clone)]
struct PlanArgs {
    #[arg(long, value_name = "LABEL", help = "Label of the layer being built")]
    label: String,

    #[arg(
        long = "feature-json",
        value_name = "FILE",
        required = true,
        help = "JSON list of feature declarations (repeatable)"
    )]
    feature_json: Vec<PathBuf>,

    #[arg(long, value_name = "FILE", help = "Layer JSON of the parent layer")]
    parent: Option<PathBuf>,

    #[arg(
        long = "image-dependency",
        value_name = "FILE",
        help = "Layer JSON of a layer that features may clone from (repeatable)"
    )]
    image_dependency: Vec<PathBuf>,

    #[arg(long, value_name = "DIR", help = "Base directory for relative install sources")]
    sources: Option<PathBuf>,

    #[arg(
        short = 'o',
        long,
        value_name = "FILE",
        help = "Write output to file instead of stdout"
    )]
    out: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
struct CompileArgs {
    #[command(flatten)]
    plan: PlanArgs,

    #[arg(long, value_name = "DIR", help = "Root directory to build into")]
    root: PathBuf,

    #[arg(
        long,
        value_name = "DIR",
        requires = "parent",
        help = "Root directory of the parent, copied into --root first"
    )]
    parent_root: Option<PathBuf>,

    #[arg(
        long = "layer-root",
        value_name = "LABEL=DIR",
        value_parser = parse_layer_root,
        help = "Root directory of a dependency layer (repeatable)"
    )]
    layer_root: Vec<(String, PathBuf)>,

    #[arg(long, help = "Disable the phase cache")]
    no_cache: bool,
}

#[derive(Args, Debug, Clone)]
struct ScanArgs {
    #[arg(long, value_name = "LABEL")]
    label: String,

    #[arg(long, value_name = "DIR")]
    root: PathBuf,

    #[arg(short = 'o', long, value_name = "FILE")]
    out: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum CacheCommand {
    #[command(about = "Show cache location and size")]
    Status,

    #[command(about = "Remove unreferenced snapshots")]
    Gc {
        #[arg(long, value_name = "N", help = "First drop all but the newest N entries")]
        keep_last: Option<usize>,
    },
}

fn parse_layer_root(s: &str) -> std::result::Result<(String, PathBuf), String> {
    match s.split_once('=') {
        Some((label, dir)) if !label.is_empty() && !dir.is_empty() => {
            Ok((label.to_string(), PathBuf::from(dir)))
        }
        _ => Err(format!("expected LABEL=DIR, got '{}'", s)),
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::discover(cli.config.as_deref())?;

    let level = cli.log_level.as_deref().or(config.logging.level.as_deref());
    logging::init(&LogSettings::from_flags(
        level,
        cli.verbose,
        cli.quiet,
        cli.log_json || config.logging.json,
    ));
    tracing::debug!(?cli, "layer-compiler v{} starting", env!("CARGO_PKG_VERSION"));

    #[cfg(feature = "parallel")]
    {
        if !config.parallel {
            if let Err(e) = rayon::ThreadPoolBuilder::new().num_threads(1).build_global() {
                tracing::warn!("could not limit the thread pool: {}", e);
            }
        }
    }

    match cli.command {
        Command::Phases => print_phases(),
        Command::Depgraph(args) => depgraph(&args),
        Command::Compile(args) => compile(&args, &config),
        Command::Scan(args) => scan(&args),
        Command::Cache(cmd) => cache(cmd, &config),
    }
}

fn print_phases() -> Result<()> {
    for phase in Phase::ORDER {
        let class = if phase.is_predictable() {
            "predictable"
        } else {
            "unpredictable"
        };
        println!("{:<22} {}", phase, class);
    }
    Ok(())
}

fn load_build(args: &PlanArgs) -> Result<LayerBuild> {
    let parent = args.parent.as_deref().map(Layer::load).transpose()?;
    let mut build = LayerBuild::new(args.label.clone(), parent.as_ref());
    for path in &args.image_dependency {
        build.add_layer_dependency(Layer::load(path)?);
    }
    for path in &args.feature_json {
        let json = fs::read_to_string(path)
            .with_context(|| format!("Failed to read declarations '{}'", path.display()))?;
        let features = parse_declarations(&args.label, &json)
            .with_context(|| format!("Invalid declarations in '{}'", path.display()))?;
        build.add_features(features)?;
    }
    if let Some(dir) = &args.sources {
        build = build.with_sources_dir(dir);
    }
    Ok(build)
}

fn depgraph(args: &PlanArgs) -> Result<()> {
    let build = load_build(args)?;
    let compiled = build.plan()?;
    write_json(args.out.as_deref(), &compiled.steps)
}

fn compile(args: &CompileArgs, config: &Config) -> Result<()> {
    preflight::check_config(config)?;
    let build = load_build(&args.plan)?;

    if let Some(parent_root) = &args.parent_root {
        files::copy_root(parent_root, &args.root).with_context(|| {
            format!(
                "Failed to seed {} from parent root {}",
                args.root.display(),
                parent_root.display()
            )
        })?;
    } else {
        fs::create_dir_all(&args.root)
            .with_context(|| format!("Failed to create {}", args.root.display()))?;
    }

    let mut materializer = FsMaterializer::new(&args.root).with_commands(config.commands());
    if let Some(dir) = &args.plan.sources {
        materializer = materializer.with_sources_dir(dir);
    }
    if let (Some(parent), Some(parent_root)) = (&args.plan.parent, &args.parent_root) {
        let label = Layer::load(parent)?.label;
        materializer = materializer.with_layer_root(label, parent_root);
    }
    for (label, dir) in &args.layer_root {
        materializer = materializer.with_layer_root(label.clone(), dir);
    }

    let resolver: Box<dyn PackageResolver> = match &config.package_manager.resolve {
        Some(cmd) => match cmd.split_first() {
            Some((program, rest)) => Box::new(CommandResolver::new(program.clone(), rest.to_vec())),
            None => bail!("package_manager.resolve is empty"),
        },
        None => Box::new(PassthroughResolver),
    };

    let cache = if args.no_cache {
        None
    } else {
        Some(PhaseCache::open(&config.cache_dir())?)
    };

    let compiled = build.compile(&mut materializer, resolver.as_ref(), cache.as_ref())?;
    let cached = compiled.steps.iter().filter(|s| s.cached).count();
    tracing::info!(
        layer = %build.label(),
        phases = compiled.steps.len(),
        cached,
        entities = compiled.layer.len(),
        "layer compiled"
    );
    match &args.plan.out {
        Some(path) => compiled.layer.save(path),
        None => write_json(None, &compiled.layer),
    }
}

fn scan(args: &ScanArgs) -> Result<()> {
    let layer = Layer::from_rootfs(args.label.clone(), &args.root)?;
    match &args.out {
        Some(path) => layer.save(path),
        None => write_json(None, &layer),
    }
}

fn cache(cmd: CacheCommand, config: &Config) -> Result<()> {
    let cache = PhaseCache::open(&config.cache_dir())?;
    match cmd {
        CacheCommand::Status => {
            let status = cache.status()?;
            println!("root:    {}", status.root.display());
            println!("entries: {}", status.index_entries);
            println!(
                "blobs:   {} ({} bytes)",
                status.referenced_blobs, status.referenced_bytes
            );
        }
        CacheCommand::Gc { keep_last } => {
            if let Some(n) = keep_last {
                let pruned = cache.prune_keep_last(n)?;
                println!("pruned {} index entries", pruned);
            }
            let removed = cache.gc()?;
            println!("removed {} unreferenced blobs", removed);
        }
    }
    Ok(())
}

fn write_json<T: Serialize>(out: Option<&Path>, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("Failed to serialize output")?;
    match out {
        Some(path) => fs::write(path, json + "\n")
            .with_context(|| format!("Failed to write {}", path.display())),
        None => {
            let mut stdout = std::io::stdout().lock();
            writeln!(stdout, "{}", json)?;
            Ok(())
        }
    }
}
