use std::collections::BTreeSet;

use super::*;

/// The answer to "can `dep` go in `target` to satisfy `edge`", together with the answers for
/// each of `dep`'s peers.
///
/// Construction only reads the graph, so asking the same question twice on an unchanged tree
/// gives the same answer.
#[derive(Debug, Clone)]
pub struct CanPlaceDep {
	pub dep: NodeId,
	pub target: NodeId,
	pub edge: EdgeId,
	/// Result for the whole peer group.
	pub can_place: Placement,
	/// Result for `dep` alone, which may be better than `can_place` when a peer conflicts.
	pub can_place_self: Placement,
	/// Checks made for the peers of `dep`.
	pub children: Vec<CanPlaceDep>,
}

/// What a peer check inherits from the check that triggered it.
struct ParentCheck {
	deepest: NodeId,
	entry_edge: EdgeId,
}

struct Check<'g> {
	graph: &'g Graph,
	dep: NodeId,
	target: NodeId,
	edge: EdgeId,
	name: String,
	current: Option<NodeId>,
	prefer_dedupe: bool,
	explicit_request: bool,
	edge_override: bool,
	peer_path: Vec<NodeId>,
	parent: Option<ParentCheck>,
	can_place_self: Option<Placement>,
	children: Vec<CanPlaceDep>,
}

impl CanPlaceDep {
	/// Checks whether `dep` may be placed in `target` for `edge`.
	///
	/// # Parameters
	/// - `prefer_dedupe` - keep an existing compatible occupant even if `dep` is newer.
	/// - `explicit_request` - `dep` was asked for by the user and should win ties.
	/// - `peer_path` - peers already being checked above this one.
	pub fn new(graph: &Graph, dep: NodeId, edge: EdgeId, target: NodeId, prefer_dedupe: bool, explicit_request: bool, peer_path: &[NodeId]) -> Self {
		Self::check(graph, dep, edge, target, prefer_dedupe, explicit_request, peer_path.to_vec(), None)
	}

	#[allow(clippy::too_many_arguments)]
	fn check(graph: &Graph, dep: NodeId, edge: EdgeId, target: NodeId, prefer_dedupe: bool, explicit_request: bool, peer_path: Vec<NodeId>, parent: Option<ParentCheck>) -> Self {
		let name = graph.edge(edge).name().to_string();
		let mut check = Check {
			graph,
			dep,
			target,
			edge,
			current: graph.node(target).child(&name),
			edge_override: !graph.satisfied_by(edge, dep),
			name,
			prefer_dedupe,
			explicit_request,
			peer_path,
			parent,
			can_place_self: None,
			children: Vec::new(),
		};
		let can_place = check.check_can_place();
		let can_place_self = check.can_place_self.unwrap_or(can_place);
		log::trace!(
			"can place {} at {} for {}: {} (self {})",
			graph.node(dep), graph.node(target), graph.edge(edge), can_place, can_place_self
		);
		CanPlaceDep {
			dep,
			target,
			edge,
			can_place,
			can_place_self,
			children: check.children,
		}
	}

	/// Every peer check below this one.
	pub fn all_children(&self) -> Vec<&CanPlaceDep> {
		let mut out: Vec<&CanPlaceDep> = self.children.iter().collect();
		let mut i = 0;
		while i < out.len() {
			let next: Vec<&CanPlaceDep> = out[i].children.iter().collect();
			out.extend(next);
			i += 1;
		}
		out
	}

	pub fn conflict_children(&self) -> Vec<&CanPlaceDep> {
		self.all_children().into_iter().filter(|c| c.can_place == Placement::Conflict).collect()
	}
}

impl<'g> Check<'g> {
	fn target_edge(&self) -> Option<EdgeId> {
		self.graph.node(self.target).edge_out(&self.name)
	}

	fn entry_edge(&self) -> EdgeId {
		self.parent.as_ref().map(|p| p.entry_edge).unwrap_or(self.edge)
	}

	fn deepest(&self) -> NodeId {
		let start = match &self.parent {
			Some(p) => p.deepest,
			None => self.graph.edge(self.edge).from(),
		};
		deepest_nesting_target(self.graph, start, &self.name)
	}

	fn check_can_place(&mut self) -> Placement {
		let graph = self.graph;
		if let Some(te) = self.target_edge() {
			// the target itself wants something else under this name
			if te != self.edge && !graph.edge(te).peer() && !graph.satisfied_by(te, self.dep) {
				return Placement::Conflict;
			}
			// a peer can't be shadowed below the thing that peer-depends on it
			if graph.edge(te).peer() && !graph.is_project_top(self.target) {
				return Placement::Conflict;
			}
			if te != self.edge && graph.edge(te).peer() && !graph.satisfied_by(te, self.dep) {
				return Placement::Conflict;
			}
		}

		match self.current {
			Some(current) => self.check_current(current),
			None => self.check_no_current(),
		}
	}

	fn check_current(&mut self, current: NodeId) -> Placement {
		let graph = self.graph;
		let edge = self.edge;

		if graph.matches(self.dep, current) && (graph.satisfied_by(edge, current) || self.edge_override) {
			return if self.explicit_request { Placement::Replace } else { Placement::Keep };
		}

		let try_replace = match (graph.node(current).version(), graph.node(self.dep).version()) {
			(Some(cur), Some(new)) => new >= cur,
			_ => false,
		};
		if try_replace && graph.can_replace_with(current, self.dep, &BTreeSet::new()) {
			let cpp = self.can_place_peers(Placement::Replace);
			if cpp != Placement::Conflict {
				return cpp;
			}
		}

		if graph.satisfied_by(edge, current) && (!self.explicit_request || self.prefer_dedupe) {
			return Placement::Keep;
		}

		if self.prefer_dedupe && !try_replace && graph.can_replace_with(current, self.dep, &BTreeSet::new()) {
			let cpp = self.can_place_peers(Placement::Replace);
			if cpp != Placement::Conflict {
				return cpp;
			}
		}

		// could go deeper, leave the current one alone
		if self.target != self.deepest() {
			return Placement::Conflict;
		}

		// a regular dependency must go in the folder of the node that depends on it
		if !graph.edge(edge).peer() && self.target == graph.edge(edge).from() {
			return self.can_place_peers(Placement::Replace);
		}

		if self.parent.is_none() && !graph.edge(edge).peer() {
			return Placement::Conflict;
		}

		// the current occupant's peer groups must either be replaceable by ours,
		// or able to move deeper
		let dep_parent = graph.node(self.dep).parent();
		let siblings: BTreeSet<String> = dep_parent
			.map(|p| graph.node(p).children().keys().cloned().collect())
			.unwrap_or_default();
		let mut can_replace = true;
		for (entry_edge, current_peers) in peer_entry_sets(graph, current) {
			if entry_edge == self.edge || entry_edge == self.entry_edge() {
				continue;
			}
			let entry_node = match graph.edge(entry_edge).to() {
				Some(n) => n,
				None => continue,
			};
			let entry_rep = dep_parent.and_then(|p| graph.node(p).child(graph.node(entry_node).name()));
			if let Some(rep) = entry_rep {
				if graph.can_replace_with(entry_node, rep, &siblings) {
					continue;
				}
			}

			let mut can_clobber = entry_rep.is_none();
			if entry_rep.is_none() {
				let mut walk = vec![entry_node];
				let mut walked = BTreeSet::from([entry_node]);
				let mut i = 0;
				'outer: while i < walk.len() {
					for e in graph.node(walk[i]).edges_out().values() {
						let pe = graph.edge(*e);
						if !pe.peer() || !pe.valid() {
							continue;
						}
						match dep_parent.and_then(|p| graph.node(p).child(pe.name())) {
							None => {
								if let Some(to) = pe.to() {
									if walked.insert(to) {
										walk.push(to);
									}
								}
							},
							Some(rep) => {
								if !graph.satisfied_by(*e, rep) {
									can_clobber = false;
									break 'outer;
								}
							},
						}
					}
					i += 1;
				}
			}
			if can_clobber {
				continue;
			}

			let from = graph.edge(entry_edge).from();
			for peer in current_peers {
				let cur_deep = deepest_nesting_target(graph, from, graph.node(peer).name());
				if cur_deep == self.target || graph.is_descendant_of(self.target, cur_deep) {
					can_replace = false;
					break;
				}
			}
		}

		if can_replace {
			return self.can_place_peers(Placement::Replace);
		}
		Placement::Conflict
	}

	fn check_no_current(&mut self) -> Placement {
		let graph = self.graph;
		let entry_from = graph.edge(self.entry_edge()).from();
		// something higher up may be relied on by nodes below the target
		let current = if self.target != entry_from { graph.resolve(self.target, &self.name) } else { None };
		if let Some(current) = current {
			for e in graph.node(current).edges_in() {
				let edge = graph.edge(*e);
				if graph.is_descendant_of(edge.from(), self.target) && edge.valid() && !edge.optional() && !graph.satisfied_by(*e, self.dep) {
					return Placement::Conflict;
				}
			}
		}
		self.can_place_peers(Placement::Ok)
	}

	fn can_place_peers(&mut self, state: Placement) -> Placement {
		self.can_place_self = Some(state);
		if !self.children.is_empty() {
			return if self.children.iter().any(|c| c.can_place == Placement::Conflict) { Placement::Conflict } else { state };
		}

		let graph = self.graph;
		let mut peer_path = self.peer_path.clone();
		peer_path.push(self.dep);
		let mut saw_conflict = false;
		for e in graph.node(self.dep).edges_out().values() {
			let pe = graph.edge(*e);
			let peer = match (pe.peer(), pe.to()) {
				(true, Some(to)) if !peer_path.contains(&to) => to,
				_ => continue,
			};
			let target = deepest_nesting_target(graph, self.target, graph.node(peer).name());
			let child = CanPlaceDep::check(
				graph,
				peer,
				*e,
				target,
				true,
				false,
				peer_path.clone(),
				Some(ParentCheck { deepest: self.deepest(), entry_edge: self.entry_edge() }),
			);
			if child.can_place == Placement::Conflict {
				saw_conflict = true;
			}
			self.children.push(child);
		}

		if saw_conflict { Placement::Conflict } else { state }
	}
}
