use std::collections::BTreeSet;

use super::*;
use crate::config::InstallStrategy;
use crate::graph::NodeOptions;

/// Settings for one placement, shared by the placements of its peers.
#[derive(Debug, Clone, Copy)]
pub struct PlaceOptions<'a> {
	pub prefer_dedupe: bool,
	pub force: bool,
	pub explicit_request: bool,
	pub strict_peer_deps: bool,
	pub legacy_peer_deps: bool,
	pub install_strategy: InstallStrategy,
	pub update_names: &'a BTreeSet<String>,
	pub advisories: &'a AdvisoryMap,
	/// Peer edges that were already allowed to stay broken.
	pub tolerated: &'a BTreeSet<EdgeId>,
}

/// What a placement did.
#[derive(Debug, Clone)]
pub struct PlaceDep {
	pub edge: EdgeId,
	pub dep: NodeId,
	pub target: Option<NodeId>,
	/// Result of the check the placement acted on, `None` when nothing needed doing.
	pub placement: Option<Placement>,
	/// The node created in the tree, if any.
	pub placed: Option<NodeId>,
	/// Placements made for the peers of the placed node.
	pub children: Vec<PlaceDep>,
	/// Nodes whose dependencies must be looked at again.
	pub need_evaluation: BTreeSet<NodeId>,
	/// Peer edges left invalid instead of failing.
	pub peer_conflicts: Vec<EdgeId>,
	/// Every target tried, with its result.
	pub checks: Vec<(NodeId, Placement)>,
}

impl PlaceDep {
	fn new(dep: NodeId, edge: EdgeId) -> Self {
		Self {
			edge,
			dep,
			target: None,
			placement: None,
			placed: None,
			children: Vec::new(),
			need_evaluation: BTreeSet::new(),
			peer_conflicts: Vec::new(),
			checks: Vec::new(),
		}
	}

	/// This placement and all peer placements below it.
	pub fn all(&self) -> Vec<&PlaceDep> {
		let mut out = vec![self];
		let mut i = 0;
		while i < out.len() {
			let next: Vec<&PlaceDep> = out[i].children.iter().collect();
			out.extend(next);
			i += 1;
		}
		out
	}
}

/// Places `dep`, a node in a virtual root, somewhere in the tree of `edge`'s dependent so that
/// `edge` is satisfied. Peers of `dep` that the placed copy still needs are placed too.
///
/// # Errors
/// - [`PlacementError::Unresolvable`] when no ancestor accepts the dependency and neither force
/// nor peer conflict tolerance applies.
/// - [`PlacementError::CyclicPeerSet`] when peers keep requiring peers past [`MAX_PEER_DEPTH`].
pub fn place_dep(graph: &mut Graph, dep: NodeId, edge: EdgeId, options: &PlaceOptions) -> crate::Result<PlaceDep> {
	let mut placer = Placer { graph, options, top_edge: edge };
	placer.place(dep, edge, None, Vec::new())
}

struct Placer<'g, 'o> {
	graph: &'g mut Graph,
	options: &'o PlaceOptions<'o>,
	top_edge: EdgeId,
}

impl<'g, 'o> Placer<'g, 'o> {
	fn is_vulnerable(&self, node: NodeId) -> bool {
		let node = self.graph.node(node);
		match (self.options.advisories.get(node.package_name()), node.version()) {
			(Some(ranges), Some(v)) => crate::version::is_vulnerable(v, ranges),
			_ => false,
		}
	}

	fn place(&mut self, dep: NodeId, edge: EdgeId, parent_start: Option<NodeId>, peer_path: Vec<NodeId>) -> crate::Result<PlaceDep> {
		let mut result = PlaceDep::new(dep, edge);
		let is_peer = !peer_path.is_empty();
		if peer_path.len() > MAX_PEER_DEPTH {
			let names = peer_path.iter().map(|n| self.graph.node(*n).to_string()).collect();
			return Err(PlacementError::CyclicPeerSet(names).into());
		}

		let name = self.graph.edge(edge).name().to_string();
		{
			let e = self.graph.edge(edge);
			if let Some(to) = e.to() {
				if e.valid() && !self.options.explicit_request && !self.options.update_names.contains(&name) && !self.is_vulnerable(to) {
					return Ok(result);
				}
			}
		}

		let from = parent_start.unwrap_or_else(|| self.graph.edge(edge).from());
		let start = deepest_nesting_target(self.graph, from, &name);

		let mut chosen: Option<CanPlaceDep> = None;
		let mut attempted = Vec::new();
		for target in self.graph.ancestry(start) {
			let node = self.graph.node(target);
			if let Some(te) = node.edge_out(&name) {
				if !node.is_top() && self.graph.edge(te).peer() {
					continue;
				}
			}

			let cpd = CanPlaceDep::new(
				self.graph,
				dep,
				edge,
				target,
				is_peer || self.options.prefer_dedupe,
				self.options.explicit_request,
				&peer_path,
			);
			attempted.push(target);
			result.checks.push((target, cpd.can_place));

			if cpd.can_place == Placement::Conflict {
				// anything above a conflict would be shadowed by it
				if chosen.is_some() {
					break;
				}
			} else {
				let keep = cpd.can_place == Placement::Keep;
				chosen = Some(cpd);
				if keep {
					break;
				}
			}

			match self.options.install_strategy {
				InstallStrategy::Nested => break,
				InstallStrategy::Shallow => {
					let rp = self.graph.node(target).resolve_parent();
					if rp.map(|p| self.graph.is_root(p)).unwrap_or(false) {
						break;
					}
				},
				InstallStrategy::Hoisted => {},
			}
		}

		let (target, placement) = match chosen {
			Some(cpd) => (cpd.target, cpd.can_place_self),
			None => {
				let top_from = self.graph.edge(self.top_edge).from();
				let is_mine = self.graph.is_project_top(top_from) || self.graph.is_workspace(top_from);
				let conflict_ok = self.options.force || (is_peer && !is_mine && !self.options.strict_peer_deps);
				let occupant = self.graph.resolve(self.graph.edge(edge).from(), &name).map(|o| self.graph.node(o).to_string());
				let requester = self.graph.node(self.graph.edge(edge).from()).to_string();

				if !conflict_ok {
					return Err(PlacementError::Unresolvable {
						edge: self.graph.edge(edge).to_string(),
						requester,
						occupant,
						explanation: self.graph.explain(self.graph.edge(edge).from()),
						force_would_bypass: true,
					}.into());
				}
				if !self.options.force {
					log::warn!("Conflicting peer dependency: {} wants {}, found {}", requester, self.graph.edge(edge), occupant.unwrap_or_else(|| "nothing".to_string()));
					result.peer_conflicts.push(edge);
					return Ok(result);
				}

				let target = attempted.last().copied().unwrap_or(start);
				log::warn!(
					"Forcing {} into {} for {} despite conflicts{}",
					self.graph.node(dep), self.graph.node(target), requester,
					occupant.map(|o| format!(" with {}", o)).unwrap_or_default()
				);
				let placement = if self.graph.node(target).child(&name).is_some() { Placement::Replace } else { Placement::Ok };
				(target, placement)
			},
		};
		result.target = Some(target);
		result.placement = Some(placement);

		if placement == Placement::Keep {
			let e = self.graph.edge(edge);
			if e.peer() && !e.valid() {
				log::warn!("Keeping {} in {} although it does not satisfy {}", name, self.graph.node(target), e);
				result.peer_conflicts.push(edge);
			}
			// a kept node may make deeper copies redundant
			self.prune_dedupable(target, true);
			return Ok(result);
		}

		// dependency loops nest forever, link back to the earlier copy instead
		let mut p = Some(target);
		while let Some(ancestor) = p {
			if self.graph.matches(ancestor, dep) && !self.graph.node(ancestor).is_top() {
				let realpath = self.graph.node(ancestor).path().to_path_buf();
				log::debug!("Linking {} back to {} to break a dependency loop", name, self.graph.node(ancestor));
				let link = self.graph.create_link(&name, Some(target), None, realpath, Some(ancestor))?;
				result.placed = Some(link);
				return Ok(result);
			}
			p = self.graph.node(ancestor).resolve_parent();
		}

		let virtual_root = self.graph.node(dep).parent().unwrap_or_else(|| self.graph.node(dep).root());
		let tree_root = self.graph.node(target).root();
		let placed = self.copy_into_tree(dep, &name, tree_root)?;
		log::debug!("Placing {} in {} ({})", self.graph.node(placed), self.graph.node(target), placement);
		match self.graph.node(target).child(&name) {
			Some(old) => self.replace_old_dep(old, placed, target, &mut result),
			None => self.graph.set_parent(placed, Some(target)),
		}
		result.placed = Some(placed);

		{
			let e = self.graph.edge(edge);
			if let (true, Some(to)) = (e.valid(), e.to()) {
				if to != placed {
					self.prune_dedupable(to, false);
				}
			}
		}

		let root = tree_root;
		let same_name: Vec<NodeId> = self.graph.node(root).inventory().query_name(&name).collect();
		for node in same_name {
			if self.graph.node(node).is_deleted() || self.graph.node(node).root() != root {
				continue;
			}
			if self.graph.is_descendant_of(node, target) && !self.graph.node(node).is_top() {
				self.prune_dedupable(node, false);
				if self.graph.node(node).root() == root && !self.graph.node(node).is_deleted() {
					let kids: Vec<NodeId> = self.graph.node(node).children().values().copied().collect();
					for kid in kids {
						self.prune_dedupable(kid, false);
					}
				}
			}
		}

		if self.graph.node(placed).is_deleted() {
			return Ok(result);
		}

		let peer_edges: Vec<(String, EdgeId)> = self.graph.node(placed).edges_out().iter().map(|(k, v)| (k.clone(), *v)).collect();
		let start_for_peers = start;
		for (peer_name, pe) in peer_edges {
			let pedge = self.graph.edge(pe);
			if pedge.valid() || !pedge.peer() || self.options.tolerated.contains(&pe) {
				continue;
			}
			// no copy in the peer set means an optional peer nobody provided
			let peer = match self.graph.node(virtual_root).child(&peer_name) {
				Some(p) => p,
				None => continue,
			};
			if !self.graph.satisfied_by(pe, peer) {
				continue;
			}
			let mut path = peer_path.clone();
			path.push(dep);
			let child = self.place(peer, pe, Some(start_for_peers), path)?;
			result.need_evaluation.extend(child.need_evaluation.iter().copied());
			result.children.push(child);
		}

		Ok(result)
	}

	fn copy_into_tree(&mut self, dep: NodeId, name: &str, tree_root: NodeId) -> crate::Result<NodeId> {
		let source = self.graph.node(dep).clone();
		if source.is_link() {
			// the link target joins the real tree too, unless it is already there
			let realpath = source.realpath().to_path_buf();
			let existing: Vec<NodeId> = self.graph.node(tree_root).inventory().query_realpath(&realpath).collect();
			let existing = existing.into_iter().find(|n| !self.graph.node(*n).is_link());
			let target = match (existing, source.target()) {
				(Some(t), _) => Some(t),
				(None, Some(t)) => {
					let t = self.graph.node(t).clone();
					let options = NodeOptions::new(t.package().clone())
						.name(t.name())
						.path(realpath.clone())
						.fs_parent(tree_root)
						.legacy_peer_deps(self.options.legacy_peer_deps);
					Some(self.graph.create_node(options)?)
				},
				(None, None) => None,
			};
			return self.graph.create_link(name, None, None, realpath, target);
		}
		let mut options = NodeOptions::new(source.package().clone())
			.name(name)
			.resolved(source.resolved().map(str::to_string))
			.integrity(source.integrity().map(str::to_string))
			.legacy_peer_deps(self.options.legacy_peer_deps);
		if let Some(err) = source.error() {
			options = options.error(err);
		}
		self.graph.create_node(options)
	}

	fn replace_old_dep(&mut self, old: NodeId, placed: NodeId, target: NodeId, result: &mut PlaceDep) {
		let mut old_deps = Vec::new();
		let old_edges: Vec<(String, EdgeId)> = self.graph.node(old).edges_out().iter().map(|(k, v)| (k.clone(), *v)).collect();
		for (name, e) in old_edges {
			if self.graph.node(placed).edge_out(&name).is_none() {
				if let Some(to) = self.graph.edge(e).to() {
					old_deps.extend(self.graph.gather_dep_set([to], |x| x.to() != Some(to)));
				}
			}
		}

		// peer groups at this level that the new node breaks either move deeper or get warned about
		let mut prune_peer_sets = BTreeSet::new();
		let incoming: Vec<EdgeId> = self.graph.node(old).edges_in().iter().copied().collect();
		for e in incoming {
			let edge = self.graph.edge(e);
			if self.graph.satisfied_by(e, placed)
				|| !edge.peer()
				|| self.graph.node(edge.from()).parent() != Some(target)
				|| self.options.tolerated.contains(&e)
			{
				continue;
			}
			for (entry_edge, _) in peer_entry_sets(self.graph, edge.from()) {
				let entry = self.graph.edge(entry_edge);
				let entry_node = match entry.to() {
					Some(n) => n,
					None => continue,
				};
				let entry_from = entry.from();
				let deepest = deepest_nesting_target(self.graph, entry_from, self.graph.node(entry_node).name());
				if deepest != target && !(self.graph.is_project_top(entry_from) || self.graph.is_workspace(entry_from)) {
					prune_peer_sets.extend(self.graph.gather_dep_set([entry_node], |x| x.to() != Some(entry_node)));
				} else {
					log::warn!("Replacing {} breaks peer dependency {}", self.graph.node(old), self.graph.edge(e));
					result.peer_conflicts.push(e);
				}
			}
		}

		self.graph.replace(old, placed);
		self.prune_for_replacement(placed, old_deps);
		for dep in prune_peer_sets {
			if self.graph.node(dep).is_deleted() {
				continue;
			}
			for e in self.graph.node(dep).edges_in().clone() {
				result.need_evaluation.insert(self.graph.edge(e).from());
			}
			self.graph.delete(dep);
		}
	}

	/// Removes what the replaced node needed and nothing else does.
	fn prune_for_replacement(&mut self, node: NodeId, old_deps: Vec<NodeId>) {
		let mut invalid: BTreeSet<NodeId> = self.graph.node(node).edges_out().values()
			.map(|e| self.graph.edge(*e))
			.filter(|e| !e.valid())
			.filter_map(|e| e.to())
			.collect();
		for dep in old_deps {
			if self.graph.node(dep).is_deleted() {
				continue;
			}
			invalid.extend(self.graph.gather_dep_set([dep], |e| e.to() != Some(dep) && e.valid()));
		}
		let deps = self.graph.gather_dep_set(invalid, |e| e.from() != node && e.to() != Some(node) && e.valid());
		for dep in deps {
			if !self.graph.node(dep).is_deleted() && !self.graph.is_root(dep) {
				log::trace!("Pruning {} left behind by replacement", self.graph.node(dep));
				self.graph.delete(dep);
			}
		}
	}

	fn prune_dedupable(&mut self, node: NodeId, descend: bool) {
		if self.graph.node(node).is_deleted() {
			return;
		}
		if self.graph.can_dedupe(node, self.options.prefer_dedupe) {
			let deps = self.graph.gather_dep_set([node], |e| e.to() != Some(node) && e.valid());
			for dep in deps {
				if !self.graph.node(dep).is_deleted() {
					log::trace!("Deduping {}", self.graph.node(dep));
					self.graph.delete(dep);
				}
			}
			return;
		}
		if descend {
			let mut children: Vec<NodeId> = self.graph.node(node).children().values().copied().collect();
			children.sort_by(|a, b| self.graph.node(*a).location().cmp(self.graph.node(*b).location()));
			for child in children {
				self.prune_dedupable(child, true);
			}
			let fs_children: Vec<NodeId> = self.graph.node(node).fs_children().iter().copied().collect();
			for top in fs_children {
				let kids: Vec<NodeId> = self.graph.node(top).children().values().copied().collect();
				for kid in kids {
					self.prune_dedupable(kid, true);
				}
			}
		}
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::Manifest;

	fn candidate(g: &mut Graph, manifest: Manifest) -> NodeId {
		let vr = g.create_root(Manifest::new("virtual", "0.0.0"), "/virtual").unwrap();
		g.create_node(NodeOptions::new(manifest).parent(vr)).unwrap()
	}

	struct Env {
		names: BTreeSet<String>,
		advisories: AdvisoryMap,
		tolerated: BTreeSet<EdgeId>,
	}

	impl Env {
		fn new() -> Self {
			Self { names: BTreeSet::new(), advisories: AdvisoryMap::new(), tolerated: BTreeSet::new() }
		}

		fn options(&self) -> PlaceOptions<'_> {
			PlaceOptions {
				prefer_dedupe: false,
				force: false,
				explicit_request: false,
				strict_peer_deps: false,
				legacy_peer_deps: false,
				install_strategy: InstallStrategy::Hoisted,
				update_names: &self.names,
				advisories: &self.advisories,
				tolerated: &self.tolerated,
			}
		}
	}

	#[test]
	fn hoists_to_root() {
		let env = Env::new();
		let mut g = Graph::new();
		let root = g.create_root(Manifest::new("root", "1.0.0").dep("a", "1"), "/p").unwrap();
		let a = g.create_node(NodeOptions::new(Manifest::new("a", "1.0.0").dep("b", "1")).parent(root)).unwrap();
		let dep = candidate(&mut g, Manifest::new("b", "1.0.0"));
		let edge = g.node(a).edge_out("b").unwrap();
		let placed = place_dep(&mut g, dep, edge, &env.options()).unwrap();
		assert_eq!(placed.target, Some(root));
		assert!(g.edge(edge).valid());
		assert!(g.verify_tree_invariants(root).is_empty());
	}

	#[test]
	fn nests_under_conflict() {
		let env = Env::new();
		let mut g = Graph::new();
		let root = g.create_root(Manifest::new("root", "1.0.0").dep("a", "1").dep("b", "2"), "/p").unwrap();
		let a = g.create_node(NodeOptions::new(Manifest::new("a", "1.0.0").dep("b", "1")).parent(root)).unwrap();
		g.create_node(NodeOptions::new(Manifest::new("b", "2.0.0")).parent(root)).unwrap();
		let dep = candidate(&mut g, Manifest::new("b", "1.0.0"));
		let edge = g.node(a).edge_out("b").unwrap();
		let placed = place_dep(&mut g, dep, edge, &env.options()).unwrap();
		assert_eq!(placed.target, Some(a));
		assert_eq!(g.node(g.edge(edge).to().unwrap()).location(), "node_modules/a/node_modules/b");
	}

	#[test]
	fn nested_strategy_never_climbs() {
		let env = Env::new();
		let mut options = env.options();
		options.install_strategy = InstallStrategy::Nested;
		let mut g = Graph::new();
		let root = g.create_root(Manifest::new("root", "1.0.0").dep("a", "1"), "/p").unwrap();
		let a = g.create_node(NodeOptions::new(Manifest::new("a", "1.0.0").dep("b", "1")).parent(root)).unwrap();
		let dep = candidate(&mut g, Manifest::new("b", "1.0.0"));
		let edge = g.node(a).edge_out("b").unwrap();
		assert_eq!(place_dep(&mut g, dep, edge, &options).unwrap().target, Some(a));
	}

	#[test]
	fn replacing_prunes_orphans() {
		let env = Env::new();
		let mut g = Graph::new();
		let root = g.create_root(Manifest::new("root", "1.0.0").dep("a", "^1").dep("b", "1"), "/p").unwrap();
		let b = g.create_node(NodeOptions::new(Manifest::new("b", "1.0.0").dep("a", "^1.1.0")).parent(root)).unwrap();
		let old = g.create_node(NodeOptions::new(Manifest::new("a", "1.0.0").dep("old-dep", "1")).parent(root)).unwrap();
		let orphan = g.create_node(NodeOptions::new(Manifest::new("old-dep", "1.0.0")).parent(root)).unwrap();
		let dep = candidate(&mut g, Manifest::new("a", "1.1.0"));
		let edge = g.node(b).edge_out("a").unwrap();
		let placed = place_dep(&mut g, dep, edge, &env.options()).unwrap();
		assert_eq!(placed.placement, Some(Placement::Replace));
		assert!(g.node(old).root() != root);
		assert!(g.node(orphan).is_deleted());
		assert!(g.verify_tree_invariants(root).is_empty());
	}

	#[test]
	fn unresolvable_without_force() {
		let env = Env::new();
		let mut g = Graph::new();
		let root = g.create_root(Manifest::new("root", "1.0.0").dep("a", "1").peer_dep("p", "1"), "/p").unwrap();
		let a = g.create_node(NodeOptions::new(Manifest::new("a", "1.0.0").peer_dep("p", "2")).parent(root)).unwrap();
		g.create_node(NodeOptions::new(Manifest::new("p", "1.0.0")).parent(root)).unwrap();
		let dep = candidate(&mut g, Manifest::new("p", "2.0.0"));
		let edge = g.node(a).edge_out("p").unwrap();
		let err = place_dep(&mut g, dep, edge, &env.options()).unwrap_err();
		assert!(matches!(err, crate::Error::Placement(PlacementError::Unresolvable { .. })));

		let mut options = env.options();
		options.force = true;
		let forced = place_dep(&mut g, dep, edge, &options).unwrap();
		assert_eq!(forced.target, Some(root));
	}

	#[test]
	fn places_peers_alongside() {
		let env = Env::new();
		let mut g = Graph::new();
		let root = g.create_root(Manifest::new("root", "1.0.0").dep("v", "1"), "/p").unwrap();
		let vr = g.create_root(Manifest::new("virtual", "0.0.0"), "/virtual").unwrap();
		let v = g.create_node(NodeOptions::new(Manifest::new("v", "1.0.0").peer_dep("a", "1")).parent(vr)).unwrap();
		g.create_node(NodeOptions::new(Manifest::new("a", "1.0.0")).parent(vr)).unwrap();
		let edge = g.node(root).edge_out("v").unwrap();
		let placed = place_dep(&mut g, v, edge, &PlaceOptions { ..env.options() }).unwrap();
		assert_eq!(placed.children.len(), 1);
		assert!(g.node(root).child("a").is_some());
		let new_v = g.node(root).child("v").unwrap();
		assert!(g.edge(g.node(new_v).edge_out("a").unwrap()).valid());
	}
}
