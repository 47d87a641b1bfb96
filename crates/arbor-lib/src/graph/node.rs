use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use super::{EdgeId, Inventory, NodeId};
use crate::manifest::Manifest;
use crate::version::Version;

/// Classification of why a node is in the tree.
///
/// Every flag starts `true` and is cleared by [`fix_dep_flags`](crate::ideal_tree::fix_dep_flags)
/// once the node is reached through an edge that doesn't carry it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DepFlags {
	pub dev: bool,
	pub optional: bool,
	pub dev_optional: bool,
	pub peer: bool,
	pub extraneous: bool,
}

impl Default for DepFlags {
	fn default() -> Self {
		Self::all()
	}
}

impl DepFlags {
	pub fn all() -> Self {
		Self { dev: true, optional: true, dev_optional: true, peer: true, extraneous: true }
	}

	pub fn none() -> Self {
		Self { dev: false, optional: false, dev_optional: false, peer: false, extraneous: false }
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
	Package,
	/// A symlink, `target` may be outside of the tree or not loaded yet.
	Link { target: Option<NodeId> },
}

/// One package instance at one location.
#[derive(Debug, Clone)]
pub struct Node {
	pub(crate) name: String,
	pub(crate) package: Manifest,
	pub(crate) version: Option<Version>,
	pub(crate) resolved: Option<String>,
	pub(crate) integrity: Option<String>,
	pub(crate) path: PathBuf,
	pub(crate) realpath: PathBuf,
	pub(crate) location: String,
	pub flags: DepFlags,

	pub(crate) kind: NodeKind,
	pub(crate) parent: Option<NodeId>,
	pub(crate) fs_parent: Option<NodeId>,
	pub(crate) children: BTreeMap<String, NodeId>,
	pub(crate) fs_children: BTreeSet<NodeId>,
	pub(crate) edges_out: BTreeMap<String, EdgeId>,
	pub(crate) edges_in: BTreeSet<EdgeId>,
	pub(crate) links_in: BTreeSet<NodeId>,
	pub(crate) root: NodeId,
	pub(crate) inventory: Inventory,

	/// Set on peer set copies, points at the node they were loaded for.
	pub(crate) source_reference: Option<NodeId>,
	pub(crate) legacy_peer_deps: bool,
	pub(crate) has_shrinkwrap: bool,
	pub(crate) in_bundle: bool,
	/// Set when the manifest could not be fetched or read.
	pub(crate) error: Option<String>,
	pub(crate) deleted: bool,
}

impl Node {
	pub fn name(&self) -> &str {
		&self.name
	}

	/// The registry name, differs from [`name()`](Node::name) for aliased installs.
	pub fn package_name(&self) -> &str {
		self.package.name.as_deref().unwrap_or(&self.name)
	}

	pub fn package(&self) -> &Manifest {
		&self.package
	}

	pub fn version(&self) -> Option<&Version> {
		self.version.as_ref()
	}

	pub fn resolved(&self) -> Option<&str> {
		self.resolved.as_deref()
	}

	pub fn integrity(&self) -> Option<&str> {
		self.integrity.as_deref()
	}

	pub fn path(&self) -> &Path {
		&self.path
	}

	pub fn realpath(&self) -> &Path {
		&self.realpath
	}

	/// Location relative to the root, `""` for the root itself.
	pub fn location(&self) -> &str {
		&self.location
	}

	pub fn is_link(&self) -> bool {
		matches!(self.kind, NodeKind::Link { .. })
	}

	pub fn target(&self) -> Option<NodeId> {
		match self.kind {
			NodeKind::Link { target } => target,
			NodeKind::Package => None,
		}
	}

	pub fn parent(&self) -> Option<NodeId> {
		self.parent
	}

	pub fn fs_parent(&self) -> Option<NodeId> {
		self.fs_parent
	}

	/// Where name lookups continue when this node has no matching child.
	pub fn resolve_parent(&self) -> Option<NodeId> {
		self.parent.or(self.fs_parent)
	}

	pub fn children(&self) -> &BTreeMap<String, NodeId> {
		&self.children
	}

	pub fn fs_children(&self) -> &BTreeSet<NodeId> {
		&self.fs_children
	}

	pub fn child(&self, name: &str) -> Option<NodeId> {
		self.children.get(name).copied()
	}

	pub fn edges_out(&self) -> &BTreeMap<String, EdgeId> {
		&self.edges_out
	}

	pub fn edge_out(&self, name: &str) -> Option<EdgeId> {
		self.edges_out.get(name).copied()
	}

	pub fn edges_in(&self) -> &BTreeSet<EdgeId> {
		&self.edges_in
	}

	pub fn links_in(&self) -> &BTreeSet<NodeId> {
		&self.links_in
	}

	pub fn root(&self) -> NodeId {
		self.root
	}

	pub fn inventory(&self) -> &Inventory {
		&self.inventory
	}

	pub fn source_reference(&self) -> Option<NodeId> {
		self.source_reference
	}

	/// Nodes without a parent are tops, this includes workspaces and out-of-tree link targets.
	pub fn is_top(&self) -> bool {
		self.parent.is_none()
	}

	pub fn has_shrinkwrap(&self) -> bool {
		self.has_shrinkwrap
	}

	pub fn in_bundle(&self) -> bool {
		self.in_bundle
	}

	pub fn error(&self) -> Option<&str> {
		self.error.as_deref()
	}

	pub fn is_deleted(&self) -> bool {
		self.deleted
	}

	/// Paths the `bin` entries of this package would be linked at, relative to the parent's
	/// `node_modules/.bin`.
	pub fn bin_names(&self) -> Vec<String> {
		self.package.bin_map().into_keys().collect()
	}
}

impl std::fmt::Display for Node {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match &self.version {
			Some(v) => write!(f, "{}@{}", self.name, v),
			None => write!(f, "{}", self.name),
		}?;
		if !self.location.is_empty() {
			write!(f, " ({})", self.location)?;
		}
		Ok(())
	}
}
