//! What has to happen on disk to turn one tree into another.
//!
//! Trees are compared location by location. Pairs that differ become [`DiffNode`]s, pairs that
//! don't are recorded as unchanged and their children are compared in place.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use crate::graph::{Graph, NodeId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
	Add,
	Change,
	Remove,
}

impl std::fmt::Display for Action {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(match self {
			Action::Add => "ADD",
			Action::Change => "CHANGE",
			Action::Remove => "REMOVE",
		})
	}
}

#[derive(Debug, Clone)]
pub struct DiffNode {
	/// `None` for the root, and for nested lockfile holders that still need inflating.
	pub action: Option<Action>,
	pub actual: Option<NodeId>,
	pub ideal: Option<NodeId>,
	pub path: PathBuf,
	pub parent: Option<usize>,
	pub children: Vec<usize>,
}

#[derive(Debug, Clone, Default)]
pub struct Diff {
	nodes: Vec<DiffNode>,
	/// Diff nodes with nothing differing beneath them, where unpacking and linking happens.
	pub leaves: Vec<usize>,
	/// Ideal nodes that are already present and identical on disk.
	pub unchanged: Vec<NodeId>,
	/// Actual nodes with no ideal counterpart.
	pub removed: Vec<NodeId>,
}

impl Diff {
	/// Compares the tree rooted at `actual` with the one rooted at `ideal`.
	///
	/// # Parameters
	/// - `shrinkwrap_inflated` - Ideal nodes whose own lockfile has already been loaded, any other
	/// ideal node with a lockfile becomes a leaf so it can be unpacked and inflated first.
	pub fn calculate(graph: &Graph, actual: NodeId, ideal: NodeId, shrinkwrap_inflated: &BTreeSet<NodeId>) -> Diff {
		let mut diff = Diff::default();
		let root = diff.push(None, Some(actual), Some(ideal), get_action(graph, Some(actual), Some(ideal)), graph.node(ideal).path().to_path_buf());
		diff.walk(graph, root, shrinkwrap_inflated);
		log::debug!(
			"Diff has {} changes, {} leaves, {} unchanged, {} removed",
			diff.nodes.len() - 1, diff.leaves.len(), diff.unchanged.len(), diff.removed.len()
		);
		diff
	}

	fn push(&mut self, parent: Option<usize>, actual: Option<NodeId>, ideal: Option<NodeId>, action: Option<Action>, path: PathBuf) -> usize {
		let idx = self.nodes.len();
		self.nodes.push(DiffNode { action, actual, ideal, path, parent, children: Vec::new() });
		if let Some(p) = parent {
			self.nodes[p].children.push(idx);
		}
		idx
	}

	fn walk(&mut self, graph: &Graph, idx: usize, inflated: &BTreeSet<NodeId>) {
		let (actual, ideal) = (self.nodes[idx].actual, self.nodes[idx].ideal);
		if let Some(i) = ideal {
			if idx != 0 && pending_shrinkwrap(graph, i, inflated) {
				self.leaves.push(idx);
				return;
			}
		}
		self.collect(graph, idx, actual, ideal, inflated);
		if self.nodes[idx].children.is_empty() && self.nodes[idx].action.is_some() {
			self.leaves.push(idx);
		}
	}

	/// Compares the children of a pair, attaching differences to the diff node at `idx`.
	fn collect(&mut self, graph: &Graph, idx: usize, actual: Option<NodeId>, ideal: Option<NodeId>, inflated: &BTreeSet<NodeId>) {
		let actual_kids = all_children(graph, actual);
		let ideal_kids = all_children(graph, ideal);
		let paths: BTreeSet<&PathBuf> = actual_kids.keys().chain(ideal_kids.keys()).collect();

		for path in paths {
			let a = actual_kids.get(path).copied();
			let i = ideal_kids.get(path).copied();
			let action = get_action(graph, a, i);
			let pending = i.map(|i| pending_shrinkwrap(graph, i, inflated)).unwrap_or(false);
			if action.is_some() || pending {
				if let (Some(Action::Remove), Some(a)) = (action, a) {
					self.removed.push(a);
				}
				log::trace!("{} {}", action.map(|a| a.to_string()).unwrap_or_else(|| String::from("INFLATE")), path.display());
				let child = self.push(Some(idx), a, i, action, path.clone());
				self.walk(graph, child, inflated);
			} else {
				if let Some(i) = i {
					self.unchanged.push(i);
				}
				self.collect(graph, idx, a, i, inflated);
			}
		}
	}

	pub fn root(&self) -> &DiffNode {
		&self.nodes[0]
	}

	pub fn node(&self, idx: usize) -> &DiffNode {
		&self.nodes[idx]
	}

	pub fn nodes(&self) -> &[DiffNode] {
		&self.nodes
	}

	/// Direct children of the root, the shallowest places anything differs.
	pub fn shallow(&self) -> impl Iterator<Item = &DiffNode> + '_ {
		self.nodes[0].children.iter().map(|c| &self.nodes[*c])
	}

	/// Every diff node beneath `idx`, parents first.
	pub fn descendants(&self, idx: usize) -> Vec<usize> {
		let mut out = Vec::new();
		let mut stack: Vec<usize> = self.nodes[idx].children.iter().rev().copied().collect();
		while let Some(n) = stack.pop() {
			out.push(n);
			stack.extend(self.nodes[n].children.iter().rev().copied());
		}
		out
	}

	pub fn is_empty(&self) -> bool {
		self.nodes.len() <= 1 && self.leaves.is_empty()
	}

	/// Leaves with the given action.
	pub fn leaves_with(&self, action: Action) -> impl Iterator<Item = &DiffNode> + '_ {
		self.leaves.iter().map(|l| &self.nodes[*l]).filter(move |n| n.action == Some(action))
	}
}

fn pending_shrinkwrap(graph: &Graph, ideal: NodeId, inflated: &BTreeSet<NodeId>) -> bool {
	graph.node(ideal).has_shrinkwrap() && !inflated.contains(&ideal)
}

/// Children of a node and of its directory children, by path.
fn all_children(graph: &Graph, node: Option<NodeId>) -> BTreeMap<PathBuf, NodeId> {
	let mut kids = BTreeMap::new();
	let node = match node {
		Some(n) => n,
		None => return kids,
	};
	let node = match graph.node(node).target() {
		Some(t) if graph.is_root(node) => t,
		_ => node,
	};
	let holders = std::iter::once(node).chain(graph.node(node).fs_children().iter().copied());
	for holder in holders {
		for kid in graph.node(holder).children().values() {
			kids.insert(graph.node(*kid).path().to_path_buf(), *kid);
		}
	}
	kids
}

/// Where the `bin` entries of a node are linked.
pub fn bin_paths(graph: &Graph, node: NodeId) -> Vec<PathBuf> {
	let n = graph.node(node);
	if n.parent().is_none() {
		return Vec::new();
	}
	match n.path().parent() {
		Some(dir) => n.bin_names().into_iter().map(|b| dir.join(".bin").join(b)).collect(),
		None => Vec::new(),
	}
}

fn get_action(graph: &Graph, actual: Option<NodeId>, ideal: Option<NodeId>) -> Option<Action> {
	let (actual, ideal) = match (actual, ideal) {
		(_, None) => return Some(Action::Remove),
		// bundled content arrives with its parent
		(None, Some(i)) => return if graph.node(i).in_bundle() { None } else { Some(Action::Add) },
		(Some(a), Some(i)) => (a, i),
	};
	if graph.is_root(actual) && graph.is_root(ideal) {
		return None;
	}

	let (a, i) = (graph.node(actual), graph.node(ideal));
	if a.is_link() != i.is_link() || a.version() != i.version() {
		return Some(Action::Change);
	}

	let bins_exist = bin_paths(graph, ideal).iter().all(|p| p.symlink_metadata().is_ok());
	let no_integrity = i.integrity().is_none() && a.integrity().is_none();
	let no_resolved = i.resolved().is_none() && a.resolved().is_none();
	let resolved_match = i.resolved().is_some() && i.resolved() == a.resolved();
	if no_integrity && bins_exist && (resolved_match || no_resolved) {
		return None;
	}

	// ideal integrity without actual integrity is refetched so it gets locked down
	let integrity_mismatch = match (i.integrity(), a.integrity()) {
		(Some(x), Some(y)) => x != y,
		_ => true,
	};
	if integrity_mismatch || !bins_exist {
		Some(Action::Change)
	} else {
		None
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::graph::NodeOptions;
	use crate::Manifest;

	fn tree(g: &mut Graph, kids: &[(&str, &str)]) -> NodeId {
		let root = g.create_root(Manifest::new("root", "1.0.0"), "/p").unwrap();
		for (name, version) in kids {
			g.create_node(NodeOptions::new(Manifest::new(*name, *version)).parent(root)).unwrap();
		}
		root
	}

	#[test]
	fn classifies_locations() {
		let mut g = Graph::new();
		let actual = tree(&mut g, &[("a", "1.0.0"), ("b", "1.0.0"), ("d", "1.0.0")]);
		let ideal = tree(&mut g, &[("a", "1.0.0"), ("b", "2.0.0"), ("c", "1.0.0")]);
		let diff = Diff::calculate(&g, actual, ideal, &BTreeSet::new());

		let action_at = |name: &str| diff.nodes().iter()
			.find(|n| n.path == PathBuf::from("/p/node_modules").join(name))
			.and_then(|n| n.action);
		assert_eq!(action_at("a"), None);
		assert_eq!(action_at("b"), Some(Action::Change));
		assert_eq!(action_at("c"), Some(Action::Add));
		assert_eq!(action_at("d"), Some(Action::Remove));
		assert_eq!(diff.unchanged, vec![g.node(ideal).child("a").unwrap()]);
		assert_eq!(diff.removed, vec![g.node(actual).child("d").unwrap()]);
		assert_eq!(diff.leaves.len(), 3);
	}

	#[test]
	fn unchanged_parents_are_compared_in_place() {
		let mut g = Graph::new();
		let actual = tree(&mut g, &[("a", "1.0.0")]);
		let ideal = tree(&mut g, &[("a", "1.0.0")]);
		let ideal_a = g.node(ideal).child("a").unwrap();
		g.create_node(NodeOptions::new(Manifest::new("x", "1.0.0")).parent(ideal_a)).unwrap();
		let diff = Diff::calculate(&g, actual, ideal, &BTreeSet::new());
		let shallow: Vec<&DiffNode> = diff.shallow().collect();
		assert_eq!(shallow.len(), 1);
		assert_eq!(shallow[0].path, PathBuf::from("/p/node_modules/a/node_modules/x"));
		assert_eq!(shallow[0].action, Some(Action::Add));
	}

	#[test]
	fn integrity_differences_are_changes() {
		let mut g = Graph::new();
		let actual = g.create_root(Manifest::new("root", "1.0.0"), "/p").unwrap();
		g.create_node(NodeOptions::new(Manifest::new("a", "1.0.0").with_resolved("r", Some("sha512-x"))).parent(actual)).unwrap();
		let ideal = g.create_root(Manifest::new("root", "1.0.0"), "/p").unwrap();
		g.create_node(NodeOptions::new(Manifest::new("a", "1.0.0").with_resolved("r", Some("sha512-y"))).parent(ideal)).unwrap();
		let diff = Diff::calculate(&g, actual, ideal, &BTreeSet::new());
		assert_eq!(diff.leaves_with(Action::Change).count(), 1);
	}

	#[test]
	fn identical_trees_have_no_diff() {
		let mut g = Graph::new();
		let actual = tree(&mut g, &[("a", "1.0.0")]);
		let ideal = tree(&mut g, &[("a", "1.0.0")]);
		assert!(Diff::calculate(&g, actual, ideal, &BTreeSet::new()).is_empty());
	}
}
