//! Dependency tree resolution and installation for `node_modules` style package layouts.
//!
//! # Usage
//! 1. Create [`ArborOptions`] pointing at a project directory.
//! 1. Load the actual tree with [`actual_tree::load_actual()`] or a virtual tree from a lockfile.
//! 1. Build the ideal tree with an [`ideal_tree::IdealTreeBuilder`].
//! 1. Preview the changes with [`diff::Diff::calculate()`], or apply them with
//!    [`reify::Reifier::reify()`] which diffs the two trees itself.

pub mod error;
pub use error::Result;
pub use error::Error;

pub mod config;
pub use config::ArborOptions;

pub mod version;
pub mod manifest;
pub use manifest::Manifest;

pub mod graph;
pub use graph::{Graph, NodeId, EdgeId};

pub mod placement;
pub mod ideal_tree;
pub mod diff;
pub mod reify;
pub mod lockfile;
pub mod actual_tree;
pub mod collaborators;
pub mod registry;
