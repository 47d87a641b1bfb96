//! Deciding where in a tree a dependency may live, and putting it there.
//!
//! [`CanPlaceDep`] answers, without touching the tree, whether a candidate can be placed in a
//! given `node_modules` folder. [`place_dep()`] walks up from the dependent asking that question
//! at each ancestor and performs the mutation for the best answer.
//!
//! Candidates are always nodes inside a virtual root that also holds their resolved peer set,
//! placing a candidate copies it (and the peers it needs) into the real tree.

use std::collections::{BTreeMap, BTreeSet};

use thiserror::Error;

use crate::graph::{EdgeId, Graph, NodeId};

mod can_place;
pub use can_place::CanPlaceDep;
mod place_dep;
pub use place_dep::{place_dep, PlaceDep, PlaceOptions};

/// Peer sets nested deeper than this are treated as cyclic.
pub const MAX_PEER_DEPTH: usize = 64;

/// Outcome of asking whether a candidate can go in a target folder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Placement {
	/// Nothing is there, go ahead.
	Ok,
	/// Something already there is good enough.
	Keep,
	/// Something is there and the candidate should take its place.
	Replace,
	/// Not here.
	Conflict,
}

impl std::fmt::Display for Placement {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(match self {
			Placement::Ok => "OK",
			Placement::Keep => "KEEP",
			Placement::Replace => "REPLACE",
			Placement::Conflict => "CONFLICT",
		})
	}
}

/// Why a dependency could not be placed anywhere.
#[derive(Debug, Clone, Error)]
pub enum PlacementError {
	#[error("unable to resolve dependency tree: {requester} requires {edge}{}{}", occupant.as_ref().map(|o| format!(", found {}", o)).unwrap_or_default(), if *force_would_bypass { " (retry with force to accept an incorrect and potentially broken resolution)" } else { "" })]
	Unresolvable {
		edge: String,
		requester: String,
		occupant: Option<String>,
		/// Dependency chain from the root to the requester.
		explanation: Vec<String>,
		force_would_bypass: bool,
	},
	#[error("peer dependency set is cyclic or too deep: {}", .0.join(" -> "))]
	CyclicPeerSet(Vec<String>),
}

/// Vulnerable version ranges by package name.
pub type AdvisoryMap = BTreeMap<String, Vec<crate::version::VersionReq>>;

/// The deepest folder a dependency named `name` can be placed in when walking up from `start`.
///
/// Folders that declare a peer dependency on `name` are skipped unless they are a tree root,
/// a peer can't be nested under the thing that peer-depends on it.
pub fn deepest_nesting_target(graph: &Graph, start: NodeId, name: &str) -> NodeId {
	let ancestry = graph.ancestry(start);
	for target in &ancestry {
		let node = graph.node(*target);
		if graph.is_root(*target) || node.resolve_parent().is_none() {
			return *target;
		}
		match node.edge_out(name).map(|e| graph.edge(e)) {
			Some(e) if e.peer() => continue,
			_ => return *target,
		}
	}
	*ancestry.last().unwrap_or(&start)
}

/// Every edge that brings `node`'s peer group into the tree, with the subset of the group each
/// one brings in.
///
/// An entry edge is a valid non-peer edge, or any valid edge from a top node, into a member of the
/// union of peer groups `node` is part of.
pub fn peer_entry_sets(graph: &Graph, node: NodeId) -> Vec<(EdgeId, BTreeSet<NodeId>)> {
	let mut union = vec![node];
	let mut seen = BTreeSet::from([node]);
	let mut i = 0;
	while i < union.len() {
		let n = graph.node(union[i]);
		for e in n.edges_out().values() {
			let edge = graph.edge(*e);
			if let (true, true, Some(to)) = (edge.valid(), edge.peer(), edge.to()) {
				if seen.insert(to) {
					union.push(to);
				}
			}
		}
		for e in n.edges_in() {
			let edge = graph.edge(*e);
			if edge.valid() && edge.peer() && seen.insert(edge.from()) {
				union.push(edge.from());
			}
		}
		i += 1;
	}

	let mut entries = Vec::new();
	for peer in &union {
		for e in graph.node(*peer).edges_in() {
			let edge = graph.edge(*e);
			if !edge.valid() {
				continue;
			}
			if edge.peer() && !graph.node(edge.from()).is_top() {
				continue;
			}
			let mut sub = vec![*peer];
			let mut sub_seen = BTreeSet::from([*peer]);
			let mut j = 0;
			while j < sub.len() {
				for pe in graph.node(sub[j]).edges_out().values() {
					let pe = graph.edge(*pe);
					if let (true, true, Some(to)) = (pe.valid(), pe.peer(), pe.to()) {
						if sub_seen.insert(to) {
							sub.push(to);
						}
					}
				}
				j += 1;
			}
			if sub_seen.contains(&node) {
				entries.push((*e, sub_seen));
			}
		}
	}
	entries
}
