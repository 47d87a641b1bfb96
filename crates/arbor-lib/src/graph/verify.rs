//! Structural checks and snapshots of a tree.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use thiserror::Error;

use super::{Graph, NodeId};

/// A broken tree invariant, always an internal defect.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Violation {
	#[error("{location} is listed in the inventory of {root} but belongs to {actual_root}")]
	WrongRoot { location: String, root: String, actual_root: String },
	#[error("{node} is not a root but has {count} inventory entries")]
	NonRootInventory { node: String, count: usize },
	#[error("{node} is reachable from {root} but missing from its inventory")]
	MissingFromInventory { node: String, root: String },
	#[error("{node} is in the inventory of {root} but not reachable from it")]
	Unreachable { node: String, root: String },
	#[error("inventory key {key} does not match node location {location}")]
	LocationMismatch { key: String, location: String },
	#[error("{node} has path {path:?} but realpath {realpath:?}")]
	PathMismatch { node: String, path: PathBuf, realpath: PathBuf },
	#[error("{node} has path {path:?}, expected {expected:?} under its parent")]
	ChildPath { node: String, path: PathBuf, expected: PathBuf },
	#[error("edge {edge} is not registered on both of its ends")]
	EdgeMismatch { edge: String },
}

impl Graph {
	/// Checks the invariants the tree operations maintain, returns every violation found.
	///
	/// Called by tests and by strict mode, normal runs trust the construction.
	pub fn verify_tree_invariants(&self, root: NodeId) -> Vec<Violation> {
		let mut violations = Vec::new();
		let root_name = self.node(root).to_string();

		let mut reachable = BTreeSet::new();
		let mut stack = vec![root];
		while let Some(n) = stack.pop() {
			if !reachable.insert(n) {
				continue;
			}
			let node = self.node(n);
			stack.extend(node.children.values().copied());
			stack.extend(node.fs_children.iter().copied());
		}

		let inventory = &self.node(root).inventory;
		let listed: BTreeSet<NodeId> = inventory.iter().map(|(_, id)| id).collect();

		for (key, id) in inventory.iter() {
			let node = self.node(id);
			if node.root != root {
				violations.push(Violation::WrongRoot {
					location: key.to_string(),
					root: root_name.clone(),
					actual_root: self.node(node.root).to_string(),
				});
			}
			if key != node.location {
				violations.push(Violation::LocationMismatch { key: key.to_string(), location: node.location.clone() });
			}
			if !reachable.contains(&id) {
				violations.push(Violation::Unreachable { node: node.to_string(), root: root_name.clone() });
			}
		}

		for id in &reachable {
			let node = self.node(*id);
			if !listed.contains(id) {
				violations.push(Violation::MissingFromInventory { node: node.to_string(), root: root_name.clone() });
			}
			if *id != root && !node.inventory.is_empty() {
				violations.push(Violation::NonRootInventory { node: node.to_string(), count: node.inventory.len() });
			}
			match node.target() {
				Some(t) if node.realpath != self.node(t).path => {
					violations.push(Violation::PathMismatch { node: node.to_string(), path: self.node(t).path.clone(), realpath: node.realpath.clone() });
				},
				None if !node.is_link() && node.realpath != node.path => {
					violations.push(Violation::PathMismatch { node: node.to_string(), path: node.path.clone(), realpath: node.realpath.clone() });
				},
				_ => {},
			}
			if let Some(p) = node.parent {
				let expected = self.node(p).path.join("node_modules").join(&node.name);
				if node.path != expected {
					violations.push(Violation::ChildPath { node: node.to_string(), path: node.path.clone(), expected });
				}
			}
			for e in node.edges_out.values() {
				let edge = self.edge(*e);
				let ok_from = edge.from == *id;
				let ok_to = edge.to.map(|t| self.node(t).edges_in.contains(e)).unwrap_or(true);
				if !ok_from || !ok_to {
					violations.push(Violation::EdgeMismatch { edge: edge.to_string() });
				}
			}
		}

		violations
	}

	/// Strict mode helper, turns violations into an error.
	pub fn assert_tree_invariants(&self, root: NodeId) -> crate::Result<()> {
		let violations = self.verify_tree_invariants(root);
		if violations.is_empty() {
			Ok(())
		} else {
			for v in &violations {
				log::error!("Tree invariant violated: {}", v);
			}
			Err(crate::Error::Invariant(violations))
		}
	}

	/// Comparable summary of a tree, keyed by location.
	pub fn snapshot(&self, root: NodeId) -> TreeSnapshot {
		let mut entries = BTreeMap::new();
		for (location, id) in self.node(root).inventory.iter() {
			let node = self.node(id);
			let link_target = node.target().map(|t| self.node(t).location.clone());
			entries.insert(location.to_string(), SnapshotEntry {
				name: node.name.clone(),
				version: node.version.as_ref().map(|v| v.to_string()),
				resolved: if node.is_link() { None } else { node.resolved.clone() },
				link_target,
			});
		}
		TreeSnapshot { entries }
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotEntry {
	pub name: String,
	pub version: Option<String>,
	pub resolved: Option<String>,
	pub link_target: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeSnapshot {
	pub entries: BTreeMap<String, SnapshotEntry>,
}

impl TreeSnapshot {
	pub fn locations(&self) -> Vec<&str> {
		self.entries.keys().map(String::as_str).collect()
	}

	pub fn get(&self, location: &str) -> Option<&SnapshotEntry> {
		self.entries.get(location)
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::graph::NodeOptions;
	use crate::Manifest;

	#[test]
	fn built_trees_are_clean() {
		let mut g = Graph::new();
		let root = g.create_root(Manifest::new("root", "1.0.0").dep("a", "1"), "/p").unwrap();
		let a = g.create_node(NodeOptions::new(Manifest::new("a", "1.0.0")).parent(root)).unwrap();
		g.create_node(NodeOptions::new(Manifest::new("b", "1.0.0")).parent(a)).unwrap();
		assert!(g.verify_tree_invariants(root).is_empty());
	}

	#[test]
	fn corrupted_inventory_is_reported() {
		let mut g = Graph::new();
		let root = g.create_root(Manifest::new("root", "1.0.0"), "/p").unwrap();
		let a = g.create_node(NodeOptions::new(Manifest::new("a", "1.0.0")).parent(root)).unwrap();
		let snapshot = g.node(a).clone();
		g.node_mut(root).inventory.remove(a, &snapshot);
		g.node_mut(a).inventory.add(a, &snapshot);
		let violations = g.verify_tree_invariants(root);
		assert!(violations.iter().any(|v| matches!(v, Violation::MissingFromInventory { .. })));
		assert!(violations.iter().any(|v| matches!(v, Violation::NonRootInventory { .. })));
		assert!(g.assert_tree_invariants(root).is_err());
	}

	#[test]
	fn snapshot_keys_are_locations() {
		let mut g = Graph::new();
		let root = g.create_root(Manifest::new("root", "1.0.0"), "/p").unwrap();
		g.create_node(NodeOptions::new(Manifest::new("a", "1.0.0")).parent(root)).unwrap();
		let snap = g.snapshot(root);
		assert_eq!(snap.locations(), vec!["", "node_modules/a"]);
		assert_eq!(snap.get("node_modules/a").unwrap().version.as_deref(), Some("1.0.0"));
	}
}
