//! In-memory dependency trees.
//!
//! All nodes of every tree live in one [`Graph`] arena and refer to each other by [`NodeId`].
//! A node whose `root` is itself is a tree root and is the only kind of node with a populated
//! [`Inventory`]. Peer sets are loaded into small throwaway trees in the same arena so they can be
//! compared against, and copied into, the real tree.
//!
//! Nodes are never freed, detaching a node makes it the root of its own tree and
//! [`delete()`](Graph::delete()) additionally marks the subtree dead.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::manifest::Manifest;
use crate::version::{parse_version, Specifier};

mod node;
pub use node::{Node, NodeKind, DepFlags};
mod edge;
pub use edge::{Edge, EdgeType, EdgeError};
pub(crate) use edge::normalize_path;
mod inventory;
pub use inventory::Inventory;
mod verify;
pub use verify::{Violation, TreeSnapshot, SnapshotEntry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EdgeId(usize);

#[derive(Debug, Error)]
pub enum GraphError {
	/// Neither the manifest nor the path gave the node a name.
	#[error("unable to determine a package name for node at \"{0}\"")]
	NameResolution(PathBuf),
	#[error("node {0} is not a tree root")]
	NotARoot(String),
}

/// Everything needed to create a [`Node`].
#[derive(Debug, Default, Clone)]
pub struct NodeOptions {
	manifest: Manifest,
	name: Option<String>,
	path: Option<PathBuf>,
	parent: Option<NodeId>,
	fs_parent: Option<NodeId>,
	resolved: Option<String>,
	integrity: Option<String>,
	flags: Option<DepFlags>,
	source_reference: Option<NodeId>,
	legacy_peer_deps: bool,
	error: Option<String>,
}

impl NodeOptions {
	pub fn new(manifest: Manifest) -> Self {
		Self { manifest, ..Default::default() }
	}

	/// Folder name, defaults to the manifest name.
	pub fn name(mut self, name: impl Into<String>) -> Self {
		self.name = Some(name.into());
		self
	}

	pub fn path(mut self, path: impl Into<PathBuf>) -> Self {
		self.path = Some(path.into());
		self
	}

	pub fn parent(mut self, parent: NodeId) -> Self {
		self.parent = Some(parent);
		self
	}

	pub fn fs_parent(mut self, fs_parent: NodeId) -> Self {
		self.fs_parent = Some(fs_parent);
		self
	}

	pub fn resolved(mut self, resolved: Option<String>) -> Self {
		self.resolved = resolved;
		self
	}

	pub fn integrity(mut self, integrity: Option<String>) -> Self {
		self.integrity = integrity;
		self
	}

	pub fn flags(mut self, flags: DepFlags) -> Self {
		self.flags = Some(flags);
		self
	}

	pub fn source_reference(mut self, source: NodeId) -> Self {
		self.source_reference = Some(source);
		self
	}

	pub fn legacy_peer_deps(mut self, legacy_peer_deps: bool) -> Self {
		self.legacy_peer_deps = legacy_peer_deps;
		self
	}

	pub fn error(mut self, error: impl Into<String>) -> Self {
		self.error = Some(error.into());
		self
	}

	pub fn manifest(&self) -> &Manifest {
		&self.manifest
	}
}

#[derive(Debug, Default, Clone)]
pub struct Graph {
	nodes: Vec<Node>,
	edges: Vec<Edge>,
	/// Every edge ever created, by dependency name.
	edges_by_name: BTreeMap<String, Vec<EdgeId>>,
}

impl Graph {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn node(&self, id: NodeId) -> &Node {
		&self.nodes[id.0]
	}

	pub(crate) fn node_mut(&mut self, id: NodeId) -> &mut Node {
		&mut self.nodes[id.0]
	}

	pub fn edge(&self, id: EdgeId) -> &Edge {
		&self.edges[id.0]
	}

	pub(crate) fn edge_mut(&mut self, id: EdgeId) -> &mut Edge {
		&mut self.edges[id.0]
	}

	/// Every node of the tree rooted at `root`, ordered by location.
	pub fn tree_nodes(&self, root: NodeId) -> Vec<NodeId> {
		self.node(root).inventory.ids()
	}

	/* Creation */

	/// Creates the root of a project tree at `path`.
	pub fn create_root(&mut self, manifest: Manifest, path: impl Into<PathBuf>) -> crate::Result<NodeId> {
		let path = path.into();
		let name = manifest.name.clone()
			.or_else(|| path.file_name().map(|n| n.to_string_lossy().to_string()));
		let mut options = NodeOptions::new(manifest).path(path);
		if let Some(name) = name {
			options = options.name(name);
		}
		self.create_node(options)
	}

	/// Builds a node from a manifest, places it and derives its dependency edges.
	///
	/// # Errors
	/// [`GraphError::NameResolution`] when no name can be derived from the manifest or path.
	pub fn create_node(&mut self, options: NodeOptions) -> crate::Result<NodeId> {
		let name = options.name.clone()
			.or_else(|| options.manifest.name.clone())
			.or_else(|| options.path.as_ref().and_then(|p| p.file_name()).map(|n| n.to_string_lossy().to_string()))
			.ok_or_else(|| GraphError::NameResolution(options.path.clone().unwrap_or_default()))?;

		let id = NodeId(self.nodes.len());
		let path = options.path.clone().unwrap_or_else(|| PathBuf::from(&name));
		let node = Node {
			version: options.manifest.version.as_deref().and_then(parse_version),
			resolved: options.resolved.clone().or_else(|| options.manifest.resolved().map(str::to_string)),
			integrity: options.integrity.clone().or_else(|| options.manifest.integrity().map(str::to_string)),
			has_shrinkwrap: options.manifest.has_shrinkwrap,
			name,
			package: options.manifest,
			realpath: path.clone(),
			path,
			location: String::new(),
			flags: options.flags.unwrap_or_default(),
			kind: NodeKind::Package,
			parent: None,
			fs_parent: None,
			children: BTreeMap::new(),
			fs_children: BTreeSet::new(),
			edges_out: BTreeMap::new(),
			edges_in: BTreeSet::new(),
			links_in: BTreeSet::new(),
			root: id,
			inventory: Inventory::default(),
			source_reference: options.source_reference,
			legacy_peer_deps: options.legacy_peer_deps,
			in_bundle: false,
			error: options.error,
			deleted: false,
		};
		self.nodes.push(node);
		self.index_self(id);

		if let Some(parent) = options.parent {
			self.set_parent(id, Some(parent));
		} else if let Some(fs_parent) = options.fs_parent {
			self.set_fs_parent(id, Some(fs_parent));
		}
		self.load_edges(id);
		Ok(id)
	}

	/// Creates a symlink node named `name`. `realpath` is where the link points on disk.
	pub fn create_link(&mut self, name: &str, parent: Option<NodeId>, path: Option<PathBuf>, realpath: PathBuf, target: Option<NodeId>) -> crate::Result<NodeId> {
		let manifest = target.map(|t| self.node(t).package.clone()).unwrap_or_default();
		let mut options = NodeOptions::new(manifest).name(name);
		if let Some(path) = path {
			options = options.path(path);
		}
		let id = self.create_node(options)?;
		{
			let node = self.node_mut(id);
			node.kind = NodeKind::Link { target: None };
			node.resolved = None;
			node.integrity = None;
		}
		self.load_edges(id);
		self.set_realpath(id, realpath);
		self.set_link_target(id, target);
		if let Some(parent) = parent {
			self.set_parent(id, Some(parent));
		}
		Ok(id)
	}

	pub fn set_link_target(&mut self, link: NodeId, target: Option<NodeId>) {
		if let Some(old) = self.node(link).target() {
			self.node_mut(old).links_in.remove(&link);
		}
		if let Some(t) = target {
			self.node_mut(t).links_in.insert(link);
			let (package, version, realpath) = {
				let t = self.node(t);
				(t.package.clone(), t.version.clone(), t.path.clone())
			};
			let node = self.node_mut(link);
			node.package = package;
			node.version = version;
			self.set_realpath(link, realpath);
		}
		self.node_mut(link).kind = NodeKind::Link { target };
		let resolved = self.link_resolved(link);
		self.node_mut(link).resolved = resolved;
		let edges_in: Vec<_> = self.node(link).edges_in.iter().copied().collect();
		for e in edges_in {
			self.reload_edge(e);
		}
	}

	/// `file:` locator of a link relative to its parent directory.
	fn link_resolved(&self, link: NodeId) -> Option<String> {
		let node = self.node(link);
		let from = node.path.parent()?;
		let rel = pathdiff::diff_paths(&node.realpath, from)?;
		Some(format!("file:{}", rel.to_string_lossy().replace('\\', "/")))
	}

	fn set_realpath(&mut self, id: NodeId, realpath: PathBuf) {
		let root = self.node(id).root;
		self.unindex(root, id);
		self.node_mut(id).realpath = realpath;
		self.index(root, id);
	}

	/// Adds `id`, as it is now, to the inventory of `root`.
	fn index(&mut self, root: NodeId, id: NodeId) {
		let mut inventory = std::mem::take(&mut self.node_mut(root).inventory);
		inventory.add(id, self.node(id));
		self.node_mut(root).inventory = inventory;
	}

	/// Removes `id` from the inventory of `root`, must run before the indexed fields change.
	fn unindex(&mut self, root: NodeId, id: NodeId) {
		let mut inventory = std::mem::take(&mut self.node_mut(root).inventory);
		inventory.remove(id, self.node(id));
		self.node_mut(root).inventory = inventory;
	}

	/// Assigns a new manifest and rederives the node's edges.
	pub fn set_package(&mut self, id: NodeId, manifest: Manifest) {
		let root = self.node(id).root;
		self.unindex(root, id);
		{
			let node = self.node_mut(id);
			node.version = manifest.version.as_deref().and_then(parse_version);
			node.has_shrinkwrap = manifest.has_shrinkwrap;
			node.package = manifest;
		}
		self.index(root, id);
		self.load_edges(id);
		let edges_in: Vec<_> = self.node(id).edges_in.iter().copied().collect();
		for e in edges_in {
			self.reload_edge(e);
		}
	}

	pub(crate) fn set_error(&mut self, id: NodeId, error: Option<String>) {
		self.node_mut(id).error = error;
	}

	pub(crate) fn set_in_bundle(&mut self, id: NodeId, in_bundle: bool) {
		self.node_mut(id).in_bundle = in_bundle;
	}

	pub(crate) fn set_resolved(&mut self, id: NodeId, resolved: Option<String>, integrity: Option<String>) {
		let node = self.node_mut(id);
		node.resolved = resolved;
		node.integrity = integrity;
	}

	/* Edges */

	/// Replaces the node's outgoing edges with ones derived from its manifest.
	///
	/// Dependency types are read peer, peer optional, production, optional and finally dev,
	/// the first declaration of a name wins. Names listed as optional are dropped from the
	/// production set first so they stay optional.
	fn load_edges(&mut self, id: NodeId) {
		let old: Vec<EdgeId> = self.node(id).edges_out.values().copied().collect();
		for e in old {
			self.detach_edge(e);
		}
		self.node_mut(id).edges_out.clear();

		if self.node(id).is_link() {
			return;
		}

		let package = self.node(id).package.clone();
		let mut new_edges = Vec::new();

		if self.is_root(id) && self.node(id).source_reference.is_none() {
			for ws in &package.workspaces {
				let ws_name = Path::new(ws).file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_else(|| ws.clone());
				let ws_path = self.node(id).realpath.join(ws);
				let name = Manifest::read_from_dir(&ws_path).ok().and_then(|m| m.name).unwrap_or(ws_name);
				new_edges.extend(self.add_edge(id, &name, &format!("file:{}", ws), EdgeType::Workspace));
			}
		}

		if !self.node(id).legacy_peer_deps {
			for (name, spec) in &package.peer_dependencies {
				let optional = package.peer_dependencies_meta.get(name).map(|m| m.optional).unwrap_or(false);
				if !optional {
					new_edges.extend(self.add_edge(id, name, spec, EdgeType::Peer));
				}
			}
			for (name, spec) in &package.peer_dependencies {
				let optional = package.peer_dependencies_meta.get(name).map(|m| m.optional).unwrap_or(false);
				if optional {
					new_edges.extend(self.add_edge(id, name, spec, EdgeType::PeerOptional));
				}
			}
		}
		for (name, spec) in &package.dependencies {
			if !package.optional_dependencies.contains_key(name) {
				new_edges.extend(self.add_edge(id, name, spec, EdgeType::Prod));
			}
		}
		for (name, spec) in &package.optional_dependencies {
			new_edges.extend(self.add_edge(id, name, spec, EdgeType::Optional));
		}
		if self.loads_dev_edges(id) {
			for (name, spec) in &package.dev_dependencies {
				new_edges.extend(self.add_edge(id, name, spec, EdgeType::Dev));
			}
		}

		for e in new_edges {
			self.reload_edge(e);
		}
	}

	/// Only the top of a project carries dev dependencies, copies made for peer sets
	/// inherit this from the node they were made for.
	fn loads_dev_edges(&self, id: NodeId) -> bool {
		let node = self.node(id);
		let this_dev = node.is_top() && !node.path.as_os_str().is_empty();
		let source_dev = match node.source_reference {
			None => true,
			Some(s) => self.node(s).is_top() && !self.node(s).path.as_os_str().is_empty(),
		};
		this_dev && source_dev
	}

	fn add_edge(&mut self, from: NodeId, name: &str, spec: &str, edge_type: EdgeType) -> Option<EdgeId> {
		if self.node(from).edges_out.contains_key(name) {
			return None;
		}
		Some(self.push_edge(from, name, spec, edge_type))
	}

	fn push_edge(&mut self, from: NodeId, name: &str, spec: &str, edge_type: EdgeType) -> EdgeId {
		let id = EdgeId(self.edges.len());
		self.edges.push(Edge {
			from,
			name: name.to_string(),
			spec: Specifier::parse_lossy(spec),
			edge_type,
			to: None,
			error: None,
			detached: false,
		});
		self.node_mut(from).edges_out.insert(name.to_string(), id);
		self.edges_by_name.entry(name.to_string()).or_default().push(id);
		id
	}

	/// Adds or overrides a single dependency of a node, used for explicit user requests.
	pub fn set_edge(&mut self, from: NodeId, name: &str, spec: &str, edge_type: EdgeType) -> EdgeId {
		if let Some(old) = self.node(from).edge_out(name) {
			self.detach_edge(old);
			self.node_mut(from).edges_out.remove(name);
		}
		let id = self.push_edge(from, name, spec, edge_type);
		self.reload_edge(id);
		id
	}

	fn detach_edge(&mut self, id: EdgeId) {
		if let Some(to) = self.edge(id).to {
			self.node_mut(to).edges_in.remove(&id);
		}
		let e = self.edge_mut(id);
		e.to = None;
		e.detached = true;
		e.error = Some(EdgeError::Detached);
	}

	/* Structure */

	pub fn is_root(&self, id: NodeId) -> bool {
		self.node(id).root == id
	}

	pub fn depth(&self, id: NodeId) -> usize {
		let mut depth = 0;
		let mut cur = id;
		while let Some(p) = self.node(cur).parent {
			depth += 1;
			cur = p;
		}
		depth
	}

	/// Root or workspace, the places peer dependencies may be satisfied locally.
	pub fn is_project_top(&self, id: NodeId) -> bool {
		self.node(id).is_top() && (self.is_root(id) || self.is_workspace(id))
	}

	pub fn is_workspace(&self, id: NodeId) -> bool {
		if self.is_root(id) {
			return false;
		}
		let root = self.node(id).root;
		let name = self.node(id).package_name().to_string();
		match self.node(root).edge_out(&name).map(|e| self.edge(e)) {
			Some(e) if e.edge_type == EdgeType::Workspace => match e.to {
				Some(to) => to == id || self.node(to).target() == Some(id),
				None => false,
			},
			_ => false,
		}
	}

	/// Whether `node` is `ancestor` or lives somewhere beneath it.
	pub fn is_descendant_of(&self, node: NodeId, ancestor: NodeId) -> bool {
		let mut cur = Some(node);
		while let Some(c) = cur {
			if c == ancestor {
				return true;
			}
			cur = self.node(c).resolve_parent();
		}
		false
	}

	/// Ancestors from the node itself up to its top, following `parent` then `fs_parent`.
	pub fn ancestry(&self, id: NodeId) -> Vec<NodeId> {
		let mut out = vec![id];
		let mut cur = id;
		while let Some(p) = self.node(cur).resolve_parent() {
			out.push(p);
			cur = p;
		}
		out
	}

	/// Node and everything placed beneath it, parents before children.
	pub fn subtree(&self, id: NodeId) -> Vec<NodeId> {
		let mut out = Vec::new();
		let mut stack = vec![id];
		while let Some(n) = stack.pop() {
			out.push(n);
			let node = self.node(n);
			for c in node.fs_children.iter().rev() {
				stack.push(*c);
			}
			for c in node.children.values().rev() {
				stack.push(*c);
			}
		}
		out
	}

	/// What `name` would resolve to if required from `from`, in the same way a module loader
	/// walks `node_modules` folders.
	pub fn resolve(&self, from: NodeId, name: &str) -> Option<NodeId> {
		let mut cur = from;
		loop {
			let node = self.node(cur);
			if let Some(c) = node.children.get(name) {
				return Some(*c);
			}
			cur = node.resolve_parent()?;
		}
	}

	/// Moves a node, and its subtree, under a new parent. `None` detaches it into a tree of its own.
	///
	/// A different node already occupying the name under the new parent is detached first.
	pub fn set_parent(&mut self, id: NodeId, parent: Option<NodeId>) {
		// links can't hold children, their target does
		let parent = parent.map(|p| self.node(p).target().unwrap_or(p));
		if parent.is_some() && self.node(id).parent == parent {
			return;
		}
		let name = self.node(id).name.clone();
		let old_root = self.node(id).root;

		if let Some(op) = self.node(id).parent {
			if self.node(op).children.get(&name) == Some(&id) {
				self.node_mut(op).children.remove(&name);
			}
		}
		if parent.is_some() {
			if let Some(fp) = self.node(id).fs_parent {
				self.node_mut(fp).fs_children.remove(&id);
				self.node_mut(id).fs_parent = None;
			}
		}
		if let Some(p) = parent {
			if let Some(existing) = self.node(p).children.get(&name).copied() {
				if existing != id {
					log::trace!("Displacing {} from {}", self.node(existing), self.node(p));
					self.set_parent(existing, None);
				}
			}
			self.node_mut(p).children.insert(name, id);
		}
		self.node_mut(id).parent = parent;

		let new_root = match (parent, self.node(id).fs_parent) {
			(Some(p), _) => self.node(p).root,
			(None, Some(fp)) => self.node(fp).root,
			(None, None) => id,
		};
		self.relocate(id, old_root, new_root);
	}

	/// Sets the directory-containing node for nodes that don't live in a `node_modules` folder.
	pub fn set_fs_parent(&mut self, id: NodeId, fs_parent: Option<NodeId>) {
		if self.node(id).parent.is_some() {
			self.set_parent(id, None);
		}
		let old_root = self.node(id).root;
		if let Some(old) = self.node(id).fs_parent {
			self.node_mut(old).fs_children.remove(&id);
		}
		if let Some(fp) = fs_parent {
			self.node_mut(fp).fs_children.insert(id);
		}
		self.node_mut(id).fs_parent = fs_parent;
		let new_root = fs_parent.map(|fp| self.node(fp).root).unwrap_or(id);
		self.relocate(id, old_root, new_root);
	}

	fn index_self(&mut self, id: NodeId) {
		self.index(id, id);
	}

	/// Re-roots a subtree: fixes paths and locations, moves inventory entries and reloads
	/// every edge that could resolve differently afterwards.
	fn relocate(&mut self, id: NodeId, old_root: NodeId, new_root: NodeId) {
		let members = self.subtree(id);

		for m in &members {
			let root = self.node(*m).root;
			self.unindex(root, *m);
		}
		if id != new_root {
			self.node_mut(id).inventory.clear();
		}

		for m in &members {
			let path = match self.node(*m).parent {
				Some(p) => self.node(p).path.join("node_modules").join(&self.node(*m).name),
				None => self.node(*m).path.clone(),
			};
			let is_link = self.node(*m).is_link();
			{
				let node = self.node_mut(*m);
				node.path = path.clone();
				if !is_link {
					node.realpath = path.clone();
				}
				node.root = new_root;
			}
			let location = if *m == new_root {
				String::new()
			} else {
				relative_location(&self.node(new_root).realpath, &path)
			};
			self.node_mut(*m).location = location;
			self.index(new_root, *m);
			if is_link {
				let resolved = self.link_resolved(*m);
				self.node_mut(*m).resolved = resolved;
			}

			let links: Vec<_> = self.node(*m).links_in.iter().copied().collect();
			for l in links {
				self.set_realpath(l, path.clone());
				let resolved = self.link_resolved(l);
				self.node_mut(l).resolved = resolved;
			}
		}

		let names: BTreeSet<String> = members.iter().map(|m| self.node(*m).name.clone()).collect();
		let mut reload = BTreeSet::new();
		for m in &members {
			reload.extend(self.node(*m).edges_out.values().copied());
			reload.extend(self.node(*m).edges_in.iter().copied());
		}
		for name in &names {
			for e in self.edges_by_name.get(name).into_iter().flatten() {
				let edge = &self.edges[e.0];
				let root = self.node(edge.from).root;
				if !edge.detached && (root == old_root || root == new_root) {
					reload.insert(*e);
				}
			}
		}
		for e in reload {
			self.reload_edge(e);
		}
	}

	/// Removes a node from its tree, the node keeps its subtree as a tree of its own.
	pub fn detach(&mut self, id: NodeId) {
		if self.node(id).parent.is_some() {
			self.set_parent(id, None);
		}
		if self.node(id).fs_parent.is_some() {
			self.set_fs_parent(id, None);
		}
	}

	/// Detaches a node and marks it and its subtree dead.
	pub fn delete(&mut self, id: NodeId) {
		self.detach(id);
		for m in self.subtree(id) {
			let edges: Vec<_> = self.node(m).edges_out.values().copied().collect();
			for e in edges {
				self.detach_edge(e);
			}
			if let Some(t) = self.node(m).target() {
				self.node_mut(t).links_in.remove(&m);
			}
			self.node_mut(m).deleted = true;
		}
		// dependents that pointed in from other trees
		let incoming: Vec<_> = self.subtree(id).iter().flat_map(|m| self.node(*m).edges_in.iter().copied().collect::<Vec<_>>()).collect();
		for e in incoming {
			self.reload_edge(e);
		}
	}

	/* Identity */

	/// Whether two nodes represent the same package content.
	pub fn matches(&self, a: NodeId, b: NodeId) -> bool {
		if a == b {
			return true;
		}
		let (na, nb) = (self.node(a), self.node(b));
		if na.name != nb.name {
			return false;
		}
		match (na.target(), nb.target(), na.is_link(), nb.is_link()) {
			(Some(ta), Some(tb), true, true) => return ta == tb || na.realpath == nb.realpath || self.matches(ta, tb),
			(_, _, true, true) => return na.realpath == nb.realpath,
			(_, _, true, false) | (_, _, false, true) => return false,
			_ => {},
		}
		if self.is_root(a) && self.is_root(b) && na.parent.is_none() && nb.parent.is_none() && na.source_reference.is_none() && nb.source_reference.is_none() {
			return na.path == nb.path;
		}
		if let (Some(ia), Some(ib)) = (&na.integrity, &nb.integrity) {
			return ia == ib;
		}
		if let (Some(ra), Some(rb)) = (&na.resolved, &nb.resolved) {
			return ra == rb;
		}
		match (&na.version, &nb.version) {
			(Some(va), Some(vb)) => na.package_name() == nb.package_name() && va == vb,
			_ => false,
		}
	}

	/// Whether `new` could take `old`'s place without breaking any of `old`'s dependents.
	///
	/// Dependents that are only there because of `old` don't count. Peer dependents sitting next
	/// to `old` whose names are in `ignore_peers` are skipped, they are being replaced as a group.
	pub fn can_replace_with(&self, old: NodeId, new: NodeId, ignore_peers: &BTreeSet<String>) -> bool {
		let (o, n) = (self.node(old), self.node(new));
		if o.name != n.name || o.package_name() != n.package_name() {
			return false;
		}
		let dep_set = self.gather_dep_set([old], |e| e.to != Some(old) && e.valid());
		o.edges_in.iter().all(|e| {
			let edge = self.edge(*e);
			let from = self.node(edge.from);
			if !o.is_top() && from.parent == o.parent && edge.peer() && ignore_peers.contains(&from.name) {
				return true;
			}
			dep_set.contains(&edge.from) || self.satisfied_by(*e, new)
		})
	}

	/// The given nodes plus all of their transitive dependencies, minus anything that is also
	/// depended upon from outside that set.
	pub fn gather_dep_set<F>(&self, start: impl IntoIterator<Item = NodeId>, filter: F) -> BTreeSet<NodeId>
	where F: Fn(&Edge) -> bool,
	{
		let mut deps: Vec<NodeId> = Vec::new();
		let mut seen = BTreeSet::new();
		for n in start {
			if seen.insert(n) {
				deps.push(n);
			}
		}
		let mut i = 0;
		while i < deps.len() {
			for e in self.node(deps[i]).edges_out.values() {
				let edge = self.edge(*e);
				if let Some(to) = edge.to {
					if filter(edge) && seen.insert(to) {
						deps.push(to);
					}
				}
			}
			i += 1;
		}

		let mut changed = true;
		while changed && !seen.is_empty() {
			changed = false;
			let current: Vec<NodeId> = seen.iter().copied().collect();
			for dep in current {
				let outside = self.node(dep).edges_in.iter().any(|e| {
					let edge = self.edge(*e);
					!seen.contains(&edge.from) && filter(edge)
				});
				if outside {
					seen.remove(&dep);
					changed = true;
				}
			}
		}
		seen
	}

	/// A failed optional node plus its non-optional dependents up to the optional boundary, and
	/// whatever only that group depends on.
	pub fn optional_set(&self, node: NodeId) -> BTreeSet<NodeId> {
		let root = self.node(node).root;
		let mut set = vec![node];
		let mut seen = BTreeSet::from([node]);
		let mut i = 0;
		while i < set.len() {
			for e in &self.node(set[i]).edges_in {
				let edge = self.edge(*e);
				if !edge.optional() && edge.from() != root && seen.insert(edge.from()) {
					set.push(edge.from());
				}
			}
			i += 1;
		}
		self.gather_dep_set(set, |e| e.to().map(|t| !seen.contains(&t)).unwrap_or(true))
	}

	/// Whether a node is a needless duplicate of something reachable higher in the tree.
	pub fn can_dedupe(&self, id: NodeId, prefer_dedupe: bool) -> bool {
		let node = self.node(id);
		if node.in_bundle || self.in_shrinkwrap(id) {
			return false;
		}
		let grand = match node.resolve_parent().and_then(|p| self.node(p).resolve_parent()) {
			Some(g) => g,
			None => return false,
		};
		if node.edges_in.is_empty() {
			return true;
		}
		let other = match self.resolve(grand, &node.name) {
			Some(o) => o,
			None => return false,
		};
		if self.matches(other, id) {
			return true;
		}
		if !self.can_replace_with(id, other, &BTreeSet::new()) {
			return false;
		}
		match (&self.node(other).version, &node.version) {
			_ if prefer_dedupe => true,
			(Some(ov), Some(nv)) => ov >= nv,
			_ => false,
		}
	}

	/// Whether any ancestor ships its own lockfile, which pins this node in place.
	pub fn in_shrinkwrap(&self, id: NodeId) -> bool {
		let mut cur = self.node(id).parent;
		while let Some(p) = cur {
			if self.node(p).has_shrinkwrap {
				return true;
			}
			cur = self.node(p).parent;
		}
		false
	}

	/// Puts `new` where `old` is, `new` adopts every child of `old` that it doesn't already have.
	pub fn replace(&mut self, old: NodeId, new: NodeId) {
		let parent = self.node(old).parent;
		let fs_parent = self.node(old).fs_parent;
		log::debug!("Replacing {} with {}", self.node(old), self.node(new));
		self.detach(old);
		match (parent, fs_parent) {
			(Some(p), _) => self.set_parent(new, Some(p)),
			(None, Some(fp)) => {
				self.node_mut(new).path = self.node(old).path.clone();
				self.set_fs_parent(new, Some(fp));
			},
			(None, None) => {},
		}
		if !self.node(new).is_link() {
			let kids: Vec<_> = self.node(old).children.values().copied().collect();
			for kid in kids {
				let kid_name = self.node(kid).name.clone();
				if !self.node(new).children.contains_key(&kid_name) {
					self.set_parent(kid, Some(new));
				}
			}
		}
	}

	/* Reporting */

	/// Chain of dependents from the tree root down to `id`, for error messages.
	pub fn explain(&self, id: NodeId) -> Vec<String> {
		let mut seen = BTreeSet::new();
		let mut queue = VecDeque::new();
		queue.push_back(vec![id]);
		while let Some(chain) = queue.pop_front() {
			let last = *chain.last().unwrap_or(&id);
			if self.is_root(last) || self.node(last).edges_in.is_empty() {
				return chain.iter().map(|n| self.node(*n).to_string()).collect();
			}
			for e in &self.node(last).edges_in {
				let from = self.edge(*e).from;
				if seen.insert(from) {
					let mut next = chain.clone();
					next.push(from);
					queue.push_back(next);
				}
			}
		}
		vec![self.node(id).to_string()]
	}
}

/// `/` delimited location of `path` relative to `root`.
pub(crate) fn relative_location(root: &Path, path: &Path) -> String {
	match pathdiff::diff_paths(path, root) {
		Some(rel) => rel.components()
			.map(|c| c.as_os_str().to_string_lossy().to_string())
			.collect::<Vec<_>>()
			.join("/"),
		None => path.to_string_lossy().replace('\\', "/"),
	}
}

#[cfg(test)]
mod test {
	use super::*;

	fn root_with(graph: &mut Graph, manifest: Manifest) -> NodeId {
		graph.create_root(manifest, "/project").unwrap()
	}

	fn child(graph: &mut Graph, parent: NodeId, name: &str, version: &str) -> NodeId {
		graph.create_node(NodeOptions::new(Manifest::new(name, version)).parent(parent)).unwrap()
	}

	#[test]
	fn locations_follow_parents() {
		let mut g = Graph::new();
		let root = root_with(&mut g, Manifest::new("root", "1.0.0"));
		let a = child(&mut g, root, "a", "1.0.0");
		let b = child(&mut g, a, "b", "1.0.0");
		assert_eq!(g.node(a).location(), "node_modules/a");
		assert_eq!(g.node(b).location(), "node_modules/a/node_modules/b");
		assert_eq!(g.node(b).path(), Path::new("/project/node_modules/a/node_modules/b"));
		assert_eq!(g.node(root).inventory().len(), 3);
	}

	#[test]
	fn reparenting_moves_subtree() {
		let mut g = Graph::new();
		let root = root_with(&mut g, Manifest::new("root", "1.0.0"));
		let a = child(&mut g, root, "a", "1.0.0");
		let b = child(&mut g, a, "b", "1.0.0");
		let c = child(&mut g, b, "c", "1.0.0");
		g.set_parent(b, Some(root));
		assert_eq!(g.node(c).location(), "node_modules/b/node_modules/c");
		assert_eq!(g.node(root).inventory().get("node_modules/b/node_modules/c"), Some(c));
		assert_eq!(g.node(root).inventory().get("node_modules/a/node_modules/b"), None);
	}

	#[test]
	fn hoisting_reloads_edges_across_the_tree() {
		let mut g = Graph::new();
		let root = root_with(&mut g, Manifest::new("root", "1.0.0").dep("a", "1").dep("x", "1"));
		let a = child(&mut g, root, "a", "1.0.0");
		let x = g.create_node(NodeOptions::new(Manifest::new("x", "1.0.0").dep("b", "1")).parent(root)).unwrap();
		let b = child(&mut g, a, "b", "1.0.0");
		let from_x = g.node(x).edge_out("b").unwrap();
		assert!(g.edge(from_x).missing());

		g.set_parent(b, Some(root));
		assert_eq!(g.edge(from_x).to(), Some(b));
		let inventory = g.node(root).inventory();
		assert_eq!(inventory.query_name("b").collect::<Vec<_>>(), vec![b]);
		assert_eq!(inventory.query_realpath(Path::new("/project/node_modules/b")).collect::<Vec<_>>(), vec![b]);
		assert_eq!(inventory.query_realpath(Path::new("/project/node_modules/a/node_modules/b")).count(), 0);
		assert!(g.verify_tree_invariants(root).is_empty());
	}

	#[test]
	fn detach_empties_old_inventory() {
		let mut g = Graph::new();
		let root = root_with(&mut g, Manifest::new("root", "1.0.0"));
		let a = child(&mut g, root, "a", "1.0.0");
		let b = child(&mut g, a, "b", "1.0.0");
		g.detach(a);
		assert_eq!(g.node(root).inventory().len(), 1);
		assert_eq!(g.node(b).root(), a);
		assert_eq!(g.node(a).inventory().len(), 2);
	}

	#[test]
	fn edges_follow_resolution() {
		let mut g = Graph::new();
		let root = root_with(&mut g, Manifest::new("root", "1.0.0").dep("a", "^1.0.0"));
		let e = g.node(root).edge_out("a").unwrap();
		assert!(g.edge(e).missing());
		let a = child(&mut g, root, "a", "1.2.0");
		assert_eq!(g.edge(e).to(), Some(a));
		assert!(g.edge(e).valid());
		let a2 = child(&mut g, root, "a", "2.0.0");
		assert_eq!(g.edge(e).to(), Some(a2));
		assert!(g.edge(e).invalid());
	}

	#[test]
	fn resolve_walks_up() {
		let mut g = Graph::new();
		let root = root_with(&mut g, Manifest::new("root", "1.0.0"));
		let a = child(&mut g, root, "a", "1.0.0");
		let b = child(&mut g, root, "b", "1.0.0");
		let nested_b = child(&mut g, a, "b", "2.0.0");
		let c = child(&mut g, a, "c", "1.0.0");
		assert_eq!(g.resolve(c, "b"), Some(nested_b));
		assert_eq!(g.resolve(root, "b"), Some(b));
		assert_eq!(g.resolve(c, "zzz"), None);
	}

	#[test]
	fn edge_order_first_wins() {
		let mut g = Graph::new();
		let manifest = Manifest::new("root", "1.0.0")
			.dep("a", "^1")
			.peer_dep("a", "^2")
			.optional_dep("b", "^1")
			.dep("b", "^1")
			.dev_dep("c", "^1");
		let root = root_with(&mut g, manifest);
		let a = g.node(root).edge_out("a").unwrap();
		assert_eq!(g.edge(a).edge_type(), EdgeType::Peer);
		let b = g.node(root).edge_out("b").unwrap();
		assert_eq!(g.edge(b).edge_type(), EdgeType::Optional);
		assert!(g.node(root).edge_out("c").is_some());
	}

	#[test]
	fn nested_nodes_skip_dev_edges() {
		let mut g = Graph::new();
		let root = root_with(&mut g, Manifest::new("root", "1.0.0"));
		let a = g.create_node(NodeOptions::new(Manifest::new("a", "1.0.0").dev_dep("x", "1")).parent(root)).unwrap();
		assert!(g.node(a).edge_out("x").is_none());
	}

	#[test]
	fn legacy_peer_deps_skips_peers() {
		let mut g = Graph::new();
		let root = root_with(&mut g, Manifest::new("root", "1.0.0"));
		let a = g.create_node(NodeOptions::new(Manifest::new("a", "1.0.0").peer_dep("p", "1")).parent(root).legacy_peer_deps(true)).unwrap();
		assert!(g.node(a).edges_out().is_empty());
	}

	#[test]
	fn name_resolution_error() {
		let mut g = Graph::new();
		let result = g.create_node(NodeOptions::new(Manifest::default()));
		assert!(matches!(result, Err(crate::Error::Graph(GraphError::NameResolution(_)))));
	}

	#[test]
	fn matches_prefers_integrity() {
		let mut g = Graph::new();
		let root = root_with(&mut g, Manifest::new("root", "1.0.0"));
		let a = g.create_node(NodeOptions::new(Manifest::new("a", "1.0.0").with_resolved("r1", Some("sha512-a"))).parent(root)).unwrap();
		let other = g.create_node(NodeOptions::new(Manifest::new("a", "1.0.0").with_resolved("r2", Some("sha512-a")))).unwrap();
		let different = g.create_node(NodeOptions::new(Manifest::new("a", "1.0.0").with_resolved("r1", Some("sha512-b")))).unwrap();
		assert!(g.matches(a, other));
		assert!(!g.matches(a, different));
	}

	#[test]
	fn replace_adopts_children() {
		let mut g = Graph::new();
		let root = root_with(&mut g, Manifest::new("root", "1.0.0").dep("a", "*"));
		let a1 = child(&mut g, root, "a", "1.0.0");
		let kid = child(&mut g, a1, "k", "1.0.0");
		let a2 = g.create_node(NodeOptions::new(Manifest::new("a", "2.0.0"))).unwrap();
		let ignore = BTreeSet::<String>::new();
		assert!(g.can_replace_with(a1, a2, &ignore));
		g.replace(a1, a2);
		assert_eq!(g.node(root).child("a"), Some(a2));
		assert_eq!(g.node(kid).parent(), Some(a2));
		assert_eq!(g.node(kid).location(), "node_modules/a/node_modules/k");
	}

	#[test]
	fn replacement_must_satisfy_dependents() {
		let mut g = Graph::new();
		let root = root_with(&mut g, Manifest::new("root", "1.0.0").dep("a", "^1"));
		let a1 = child(&mut g, root, "a", "1.0.0");
		let a2 = g.create_node(NodeOptions::new(Manifest::new("a", "2.0.0"))).unwrap();
		assert!(!g.can_replace_with(a1, a2, &BTreeSet::new()));
	}

	#[test]
	fn dep_set_excludes_shared_deps() {
		let mut g = Graph::new();
		let root = root_with(&mut g, Manifest::new("root", "1.0.0").dep("a", "1").dep("s", "1"));
		let a = g.create_node(NodeOptions::new(Manifest::new("a", "1.0.0").dep("only", "1").dep("s", "1")).parent(root)).unwrap();
		let only = child(&mut g, root, "only", "1.0.0");
		let s = child(&mut g, root, "s", "1.0.0");
		let set = g.gather_dep_set([a], |e| e.to() != Some(a) && e.valid());
		assert!(set.contains(&a));
		assert!(set.contains(&only));
		assert!(!set.contains(&s));
	}

	#[test]
	fn nested_duplicate_can_dedupe() {
		let mut g = Graph::new();
		let root = root_with(&mut g, Manifest::new("root", "1.0.0").dep("a", "1").dep("b", "^1"));
		let a = g.create_node(NodeOptions::new(Manifest::new("a", "1.0.0").dep("b", "^1")).parent(root)).unwrap();
		child(&mut g, root, "b", "1.2.0");
		let nested = child(&mut g, a, "b", "1.1.0");
		assert!(g.can_dedupe(nested, false));
	}

	#[test]
	fn links_resolve_through_target() {
		let mut g = Graph::new();
		let root = root_with(&mut g, Manifest::new("root", "1.0.0").dep("w", "file:packages/w"));
		let target = g.create_node(NodeOptions::new(Manifest::new("w", "1.0.0")).path("/project/packages/w").fs_parent(root)).unwrap();
		let link = g.create_link("w", Some(root), None, PathBuf::from("/project/packages/w"), Some(target)).unwrap();
		let e = g.node(root).edge_out("w").unwrap();
		assert_eq!(g.edge(e).to(), Some(link));
		assert!(g.edge(e).valid());
		assert_eq!(g.node(target).location(), "packages/w");
		assert_eq!(g.node(link).resolved(), Some("file:../packages/w"));
	}

	#[test]
	fn peer_local_is_flagged() {
		let mut g = Graph::new();
		let root = root_with(&mut g, Manifest::new("root", "1.0.0"));
		let a = g.create_node(NodeOptions::new(Manifest::new("a", "1.0.0").peer_dep("p", "1")).parent(root)).unwrap();
		child(&mut g, a, "p", "1.0.0");
		let e = g.node(a).edge_out("p").unwrap();
		assert!(g.edge(e).peer_local());
	}
}
