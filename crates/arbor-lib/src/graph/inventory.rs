//! Root-scoped index of every node in a tree.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use super::{Node, NodeId};

#[derive(Debug, Default, Clone)]
pub struct Inventory {
	by_location: BTreeMap<String, NodeId>,
	by_name: BTreeMap<String, BTreeSet<NodeId>>,
	by_license: BTreeMap<String, BTreeSet<NodeId>>,
	funded: BTreeSet<NodeId>,
	by_realpath: BTreeMap<PathBuf, BTreeSet<NodeId>>,
}

impl Inventory {
	pub(crate) fn add(&mut self, id: NodeId, node: &Node) {
		self.by_location.insert(node.location.clone(), id);
		self.by_name.entry(node.name.clone()).or_default().insert(id);
		if let Some(license) = &node.package.license {
			self.by_license.entry(license.clone()).or_default().insert(id);
		}
		if node.package.funding.is_some() {
			self.funded.insert(id);
		}
		self.by_realpath.entry(node.realpath.clone()).or_default().insert(id);
	}

	/// Must be called with the same node state that was used to [`add()`](Inventory::add()) it.
	pub(crate) fn remove(&mut self, id: NodeId, node: &Node) {
		if self.by_location.get(&node.location) == Some(&id) {
			self.by_location.remove(&node.location);
		}
		fn delist<K: Ord + Clone>(map: &mut BTreeMap<K, BTreeSet<NodeId>>, key: &K, id: NodeId) {
			if let Some(set) = map.get_mut(key) {
				set.remove(&id);
				if set.is_empty() {
					map.remove(key);
				}
			}
		}
		delist(&mut self.by_name, &node.name, id);
		if let Some(license) = &node.package.license {
			delist(&mut self.by_license, license, id);
		}
		self.funded.remove(&id);
		delist(&mut self.by_realpath, &node.realpath, id);
	}

	pub(crate) fn clear(&mut self) {
		*self = Default::default();
	}

	pub fn is_empty(&self) -> bool {
		self.by_location.is_empty()
	}

	pub fn len(&self) -> usize {
		self.by_location.len()
	}

	pub fn get(&self, location: &str) -> Option<NodeId> {
		self.by_location.get(location).copied()
	}

	pub fn contains(&self, id: NodeId) -> bool {
		self.by_location.values().any(|v| *v == id)
	}

	/// Every node, ordered by location.
	pub fn iter(&self) -> impl Iterator<Item = (&str, NodeId)> + '_ {
		self.by_location.iter().map(|(k, v)| (k.as_str(), *v))
	}

	pub fn ids(&self) -> Vec<NodeId> {
		self.by_location.values().copied().collect()
	}

	pub fn query_name(&self, name: &str) -> impl Iterator<Item = NodeId> + '_ {
		self.by_name.get(name).into_iter().flatten().copied()
	}

	pub fn query_license(&self, license: &str) -> impl Iterator<Item = NodeId> + '_ {
		self.by_license.get(license).into_iter().flatten().copied()
	}

	pub fn funded(&self) -> impl Iterator<Item = NodeId> + '_ {
		self.funded.iter().copied()
	}

	pub fn query_realpath(&self, realpath: &Path) -> impl Iterator<Item = NodeId> + '_ {
		self.by_realpath.get(realpath).into_iter().flatten().copied()
	}
}
