//! Phase-ordered compiler for declarative image layers.
//!
//! A layer is described by an unordered list of features (directories,
//! files, symlinks, users, package actions, scripts...). The compiler
//! decides in which order they run:
//!
//! - **Partition** - every feature belongs to one of a fixed sequence of
//!   phases (see [`Phase::ORDER`]).
//! - **Contract** - each feature declares the entities it requires and
//!   provides.
//! - **Check** - duplicate providers, overwrites of earlier entities and
//!   writes under mounts are rejected.
//! - **Order** - inside a phase, providers run before the features that
//!   need them; ties keep declaration order.
//! - **Materialize** - a [`compiler::Materializer`] performs each phase, and
//!   the resulting [`Layer`] becomes the parent of the next build.
//!
//! # Architecture
//!
//! ```text
//! declarations (JSON)
//!     │
//!     ├── feature      parse, validate, kind registry, requires/provides
//!     ├── partition    bucket by phase
//!     ├── depgraph     reduce, conflict check, topological sort
//!     │
//!     └── compiler ──► Materializer (dry run | materialize::FsMaterializer)
//!             │    └─► PackageResolver
//!             └──────► cache (phase outputs, snapshots, locks)
//! ```
//!
//! # Example
//!
//! ```rust
//! use layer_compiler::{feature, Feature, LayerBuild, Phase};
//!
//! let mut build = LayerBuild::new("//img:base", None);
//! build.add_feature(Feature::new("dirs", feature::ensure_dirs("/etc/app"))).unwrap();
//! build.add_feature(Feature::new("conf", feature::install_file("app.conf", "/etc/app/app.conf"))).unwrap();
//!
//! let compiled = build.plan().unwrap();
//! assert_eq!(compiled.steps[0].phase, Phase::Compile);
//! assert_eq!(compiled.steps[0].order, vec!["dirs", "conf"]);
//! ```

pub mod cache;
pub mod compiler;
pub mod config;
pub mod depgraph;
pub mod entity;
pub mod error;
pub mod feature;
pub mod layer;
pub mod logging;
pub mod materialize;
pub mod partition;
pub mod phase;
pub mod preflight;

pub use compiler::{CompiledLayer, LayerBuild, Materializer, PackageResolver};
pub use entity::{Entity, EntityKey, Requirement};
pub use error::{Error, Result};
pub use feature::Feature;
pub use layer::Layer;
pub use phase::Phase;
