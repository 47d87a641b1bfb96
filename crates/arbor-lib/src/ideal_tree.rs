//! Building the tree that should exist.
//!
//! Starts from the lockfile, or what is on disk when there is none, and works through a queue of
//! nodes whose dependencies need looking at. Shallower nodes go first, ties are broken by path,
//! so that decisions made near the root are settled before anything beneath them.
//!
//! # Usage
//! ```no_run
//! # async fn example(fetcher: std::sync::Arc<dyn arbor::collaborators::ManifestFetcher>) -> arbor::Result<()> {
//! let options = arbor::ArborOptions::new("/path/to/project");
//! let mut graph = arbor::Graph::new();
//! let ideal = arbor::ideal_tree::IdealTreeBuilder::new(options, fetcher)
//! 	.add("left-pad", "^1.3.0", arbor::graph::EdgeType::Prod)
//! 	.build(&mut graph)
//! 	.await?;
//! println!("{} nodes", graph.tree_nodes(ideal.root).len());
//! # Ok(())
//! # }
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};

use crate::collaborators::{AdvisorySource, FetchError, FetchRequest, ManifestFetcher};
use crate::config::{ArborOptions, UpdateSelection};
use crate::graph::{normalize_path, EdgeId, EdgeType, Graph, NodeId, NodeOptions};
use crate::manifest::{Manifest, PeerMeta};
use crate::placement::{self, AdvisoryMap, PlaceDep, PlaceOptions, PlacementError, MAX_PEER_DEPTH};
use crate::version::{SpecKind, Specifier};

mod manifest_cache;
pub use manifest_cache::ManifestCache;
mod dep_flags;
pub use dep_flags::fix_dep_flags;

/// A finished ideal tree.
#[derive(Debug, Clone)]
pub struct IdealTree {
	pub root: NodeId,
	/// Peer edges left invalid because the conflict was tolerated.
	pub peer_conflicts: BTreeSet<EdgeId>,
	/// Whether the starting tree came from a lockfile.
	pub from_lockfile: bool,
	/// Whether anything was placed, replaced or pruned.
	pub mutated: bool,
}

pub struct IdealTreeBuilder {
	options: ArborOptions,
	cache: ManifestCache,
	advisory_source: Option<Arc<dyn AdvisorySource>>,
	advisories: AdvisoryMap,
	add: Vec<(String, String, EdgeType)>,
	remove: Vec<String>,
}

impl IdealTreeBuilder {
	pub fn new(options: ArborOptions, fetcher: Arc<dyn ManifestFetcher>) -> Self {
		Self {
			options,
			cache: ManifestCache::new(fetcher),
			advisory_source: None,
			advisories: AdvisoryMap::new(),
			add: Vec::new(),
			remove: Vec::new(),
		}
	}

	/// Requests a dependency of the project root, it is resolved even if something already satisfies it.
	pub fn add(mut self, name: impl Into<String>, spec: impl Into<String>, edge_type: EdgeType) -> Self {
		self.add.push((name.into(), spec.into(), edge_type));
		self
	}

	/// Drops a dependency of the project root.
	pub fn remove(mut self, name: impl Into<String>) -> Self {
		self.remove.push(name.into());
		self
	}

	/// Known vulnerable ranges, dependencies inside them are resolved again.
	pub fn advisories(mut self, advisories: AdvisoryMap) -> Self {
		for (name, ranges) in advisories {
			self.advisories.entry(name).or_default().extend(ranges);
		}
		self
	}

	/// Queried for advisories on every package in the starting tree when the build begins.
	pub fn advisory_source(mut self, source: Arc<dyn AdvisorySource>) -> Self {
		self.advisory_source = Some(source);
		self
	}

	pub fn cache(&self) -> &ManifestCache {
		&self.cache
	}

	pub fn options(&self) -> &ArborOptions {
		&self.options
	}

	/// Loads the starting tree for the project at [`ArborOptions::path()`] and builds on it.
	///
	/// The lockfile is used when there is one, otherwise the tree on disk.
	///
	/// # Errors
	/// - [`IO`](crate::Error::IO) or [`SerdeJSON`](crate::Error::SerdeJSON) reading the project manifest.
	/// - Everything [`build_from()`](IdealTreeBuilder::build_from()) returns.
	pub async fn build(&self, graph: &mut Graph) -> crate::Result<IdealTree> {
		let path = self.options.path().to_path_buf();
		let manifest = Manifest::read_from_dir(&path)?;
		let seed = match crate::lockfile::Lockfile::load(&path)? {
			Some(lockfile) => Some(lockfile.load_virtual(graph, manifest, &path)?),
			None => None,
		};
		match seed {
			Some(root) => self.build_from(graph, root, true).await,
			None => {
				log::debug!("No lockfile in {}, starting from the tree on disk", path.display());
				let root = crate::actual_tree::load_actual(graph, &path)?;
				self.build_from(graph, root, false).await
			},
		}
	}

	/// Resolves every dependency of the tree rooted at `root` in place.
	///
	/// A starting tree that already holds packages counts as seeded even when `from_lockfile` is
	/// false, a tree read from disk reflects the last install as much as a lockfile does. Packages
	/// nothing depends on are pruned from a seeded tree once the build changed it, a build that
	/// changed nothing leaves them alone.
	///
	/// # Errors
	/// - [`Placement`](crate::Error::Placement) when a dependency can't be placed anywhere.
	/// - [`Fetch`](crate::Error::Fetch) when a required dependency could not be fetched.
	/// - [`Invariant`](crate::Error::Invariant) in strict mode when the result is inconsistent.
	pub async fn build_from(&self, graph: &mut Graph, root: NodeId, from_lockfile: bool) -> crate::Result<IdealTree> {
		if !graph.is_root(root) {
			return Err(crate::graph::GraphError::NotARoot(graph.node(root).to_string()).into());
		}
		log::info!("Building ideal tree for {}", graph.node(root));

		let mut advisories = self.advisories.clone();
		if let Some(source) = &self.advisory_source {
			let names: BTreeSet<String> = graph.tree_nodes(root).iter()
				.map(|n| graph.node(*n).package_name().to_string())
				.chain(graph.node(root).edges_out().keys().cloned())
				.collect();
			let names: Vec<String> = names.into_iter().collect();
			match source.advisories(&names).await {
				Ok(found) => for (name, ranges) in found {
					advisories.entry(name).or_default().extend(ranges);
				},
				Err(e) => log::warn!("Unable to load advisories: {}", e),
			}
		}

		let seeded = from_lockfile || graph.node(root).inventory().len() > 1;
		let mut build = Build {
			builder: self,
			graph,
			root,
			advisories,
			queue: BTreeSet::new(),
			seen: BTreeSet::new(),
			explicit: BTreeSet::new(),
			update_names: BTreeSet::new(),
			updated: BTreeSet::new(),
			tolerated: BTreeSet::new(),
			link_nodes: BTreeSet::new(),
			mutated: false,
		};
		build.apply_user_requests();
		build.enqueue(root);

		loop {
			while let Some((_, _, node)) = build.queue.pop_first() {
				build.build_dep_step(node).await?;
			}
			build.resolve_links();
			if build.queue.is_empty() {
				break;
			}
		}

		fix_dep_flags(build.graph, root);
		if build.prune_failed_optional()? {
			fix_dep_flags(build.graph, root);
		}
		if seeded && build.mutated {
			build.prune_extraneous();
		}

		if self.options.strict() {
			build.graph.assert_tree_invariants(root)?;
		}
		log::info!("Ideal tree has {} nodes", build.graph.tree_nodes(root).len());

		Ok(IdealTree {
			root,
			peer_conflicts: build.tolerated,
			from_lockfile,
			mutated: build.mutated,
		})
	}
}

/// State of one build.
struct Build<'b> {
	builder: &'b IdealTreeBuilder,
	graph: &'b mut Graph,
	root: NodeId,
	advisories: AdvisoryMap,
	queue: BTreeSet<(usize, PathBuf, NodeId)>,
	seen: BTreeSet<NodeId>,
	explicit: BTreeSet<EdgeId>,
	update_names: BTreeSet<String>,
	/// Edges already re-resolved for an update or explicit request.
	updated: BTreeSet<EdgeId>,
	tolerated: BTreeSet<EdgeId>,
	link_nodes: BTreeSet<NodeId>,
	mutated: bool,
}

impl<'b> Build<'b> {
	fn options(&self) -> &ArborOptions {
		&self.builder.options
	}

	fn apply_user_requests(&mut self) {
		self.update_names = match self.options().update() {
			UpdateSelection::None => BTreeSet::new(),
			UpdateSelection::Names(names) => names.clone(),
			UpdateSelection::All => self.graph.tree_nodes(self.root).iter()
				.filter(|n| **n != self.root)
				.map(|n| self.graph.node(*n).name().to_string())
				.collect(),
		};

		let requests = self.builder;
		if requests.add.is_empty() && requests.remove.is_empty() {
			return;
		}
		let mut manifest = self.graph.node(self.root).package().clone();
		let names: Vec<&String> = requests.remove.iter().chain(requests.add.iter().map(|(n, _, _)| n)).collect();
		for name in names {
			manifest.dependencies.remove(name);
			manifest.optional_dependencies.remove(name);
			manifest.dev_dependencies.remove(name);
			manifest.peer_dependencies.remove(name);
			manifest.peer_dependencies_meta.remove(name);
		}
		for (name, spec, edge_type) in &requests.add {
			let map = match edge_type {
				EdgeType::Dev => &mut manifest.dev_dependencies,
				EdgeType::Optional => &mut manifest.optional_dependencies,
				EdgeType::Peer => &mut manifest.peer_dependencies,
				EdgeType::PeerOptional => {
					manifest.peer_dependencies_meta.insert(name.clone(), PeerMeta { optional: true });
					&mut manifest.peer_dependencies
				},
				EdgeType::Prod | EdgeType::Workspace => &mut manifest.dependencies,
			};
			map.insert(name.clone(), spec.clone());
		}
		self.graph.set_package(self.root, manifest);
		for (name, _, _) in &requests.add {
			if let Some(e) = self.graph.node(self.root).edge_out(name) {
				self.explicit.insert(e);
			}
		}
		self.mutated = true;
	}

	fn enqueue(&mut self, node: NodeId) {
		let n = self.graph.node(node);
		if n.is_deleted() || n.root() != self.root || self.seen.contains(&node) {
			return;
		}
		self.queue.insert((self.graph.depth(node), n.path().to_path_buf(), node));
	}

	fn requeue(&mut self, node: NodeId) {
		self.seen.remove(&node);
		self.enqueue(node);
	}

	/// The node a peer set copy stands in for, or the node itself.
	fn real_node(&self, node: NodeId) -> NodeId {
		let root = self.graph.node(node).root();
		self.graph.node(root).source_reference().unwrap_or(node)
	}

	fn is_vulnerable(&self, node: NodeId) -> bool {
		let n = self.graph.node(node);
		match (self.advisories.get(n.package_name()), n.version()) {
			(Some(ranges), Some(v)) => crate::version::is_vulnerable(v, ranges),
			_ => false,
		}
	}

	/// Outgoing edges of `node` that need resolving.
	fn problem_edges(&self, node: NodeId) -> Vec<EdgeId> {
		let n = self.graph.node(node);
		if n.has_shrinkwrap() && !self.graph.is_project_top(node) {
			// its own lockfile supplies these when unpacked
			return Vec::new();
		}
		let bundled: BTreeSet<String> = if self.graph.is_project_top(node) {
			BTreeSet::new()
		} else {
			n.package().bundled_names().into_iter().collect()
		};

		n.edges_out().iter().filter(|(name, e)| {
			if bundled.contains(*name) {
				return false;
			}
			self.is_problem(**e)
		}).map(|(_, e)| *e).collect()
	}

	fn is_problem(&self, id: EdgeId) -> bool {
		let edge = self.graph.edge(id);
		if edge.error() == Some(crate::graph::EdgeError::Detached) {
			return false;
		}
		match edge.to() {
			None => edge.edge_type() != EdgeType::PeerOptional || self.explicit.contains(&id),
			Some(to) => {
				let t = self.graph.node(to);
				// already failed, or pinned by a lockfile or bundle of something above
				if t.error().is_some() || t.in_bundle() || self.graph.in_shrinkwrap(to) {
					return false;
				}
				if !edge.valid() {
					return true;
				}
				let requested = self.explicit.contains(&id) || self.update_names.contains(edge.name());
				(requested && !self.updated.contains(&id)) || self.is_vulnerable(to)
			},
		}
	}

	fn fetch_request(&self, real_from: NodeId, name: &str, spec: &Specifier) -> FetchRequest {
		let avoid = self.advisories.get(spec.fetch_name(name)).cloned().unwrap_or_default();
		FetchRequest::new(name, spec.clone(), self.graph.node(real_from).realpath()).avoid(avoid)
	}

	async fn build_dep_step(&mut self, node: NodeId) -> crate::Result<()> {
		if self.graph.node(node).is_deleted() || self.graph.node(node).root() != self.root || !self.seen.insert(node) {
			return Ok(());
		}
		if self.graph.node(node).is_link() {
			if let Some(target) = self.graph.node(node).target() {
				self.link_nodes.insert(node);
				self.enqueue(target);
			}
			return Ok(());
		}
		if self.graph.node(node).error().is_some() {
			return Ok(());
		}

		let problems = self.problem_edges(node);
		log::debug!("Resolving {} ({} problem edges)", self.graph.node(node), problems.len());

		let requests: Vec<FetchRequest> = problems.iter()
			.map(|e| self.graph.edge(*e))
			.filter(|e| !is_directory_spec(e.spec()))
			.map(|e| self.fetch_request(node, e.name(), e.spec()))
			.collect();
		self.builder.cache.prefetch(&requests, self.options().max_concurrency()).await;

		for edge in problems {
			if self.graph.node(node).is_deleted() || self.graph.node(node).root() != self.root {
				break;
			}
			// earlier placements may have fixed it
			if !self.is_problem(edge) {
				continue;
			}
			self.updated.insert(edge);

			let mut visiting = Vec::new();
			let dep = self.node_from_edge(edge, None, None, &mut visiting).await?;
			let options = PlaceOptions {
				prefer_dedupe: self.builder.options.prefer_dedupe(),
				force: self.builder.options.force(),
				explicit_request: self.explicit.contains(&edge),
				strict_peer_deps: self.builder.options.strict_peer_deps(),
				legacy_peer_deps: self.builder.options.legacy_peer_deps(),
				install_strategy: self.builder.options.install_strategy(),
				update_names: &self.update_names,
				advisories: &self.advisories,
				tolerated: &self.tolerated,
			};
			let result = placement::place_dep(self.graph, dep, edge, &options)?;
			self.absorb(&result);
		}

		let deps: Vec<NodeId> = self.graph.node(node).edges_out().values()
			.filter_map(|e| self.graph.edge(*e).to())
			.collect();
		for dep in deps {
			if self.graph.node(dep).is_link() {
				self.link_nodes.insert(dep);
			}
			self.enqueue(dep);
		}
		Ok(())
	}

	fn absorb(&mut self, result: &PlaceDep) {
		for pd in result.all() {
			self.tolerated.extend(pd.peer_conflicts.iter().copied());
			for n in &pd.need_evaluation {
				self.requeue(*n);
			}
			let placed = match pd.placed {
				Some(p) if !self.graph.node(p).is_deleted() => p,
				_ => continue,
			};
			self.mutated = true;
			self.enqueue(placed);
			if let Some(target) = self.graph.node(placed).target() {
				self.link_nodes.insert(placed);
				self.enqueue(target);
			}
			// dependents that the new node doesn't satisfy have to look again
			let dependents: Vec<NodeId> = self.graph.node(placed).edges_in().iter()
				.map(|e| self.graph.edge(*e))
				.filter(|e| !e.valid())
				.map(|e| e.from())
				.collect();
			for d in dependents {
				self.requeue(d);
			}
		}
	}

	/// Queues link targets that haven't been resolved yet.
	///
	/// Targets outside the project are only followed when asked to, they then join the tree with
	/// the root as their directory parent.
	fn resolve_links(&mut self) {
		let root_path = self.graph.node(self.root).realpath().to_path_buf();
		let links: Vec<NodeId> = self.link_nodes.iter().copied().collect();
		for link in links {
			if self.graph.node(link).is_deleted() || self.graph.node(link).root() != self.root {
				continue;
			}
			let target = match self.graph.node(link).target() {
				Some(t) => t,
				None => continue,
			};
			let external = !self.graph.node(target).realpath().starts_with(&root_path);
			if external && !self.options().follow_links() {
				continue;
			}
			if self.graph.node(target).root() != self.root {
				log::debug!("Following link {} to {}", self.graph.node(link), self.graph.node(target).realpath().display());
				self.graph.set_fs_parent(target, Some(self.root));
			}
			self.enqueue(target);
		}
	}

	/// Creates the candidate for `edge` in a virtual root, together with the peers it needs.
	///
	/// `parent` is an existing virtual root to load into, `second` an edge the result should also satisfy.
	async fn node_from_edge(&mut self, edge: EdgeId, parent: Option<NodeId>, second: Option<EdgeId>, visiting: &mut Vec<NodeId>) -> crate::Result<NodeId> {
		let (from, name, spec) = {
			let e = self.graph.edge(edge);
			(e.from(), e.name().to_string(), e.spec().clone())
		};
		let real_from = self.real_node(from);

		let virtual_root = match parent {
			Some(p) => p,
			None => {
				let f = self.graph.node(from);
				let options = NodeOptions::new(f.package().clone())
					.name(f.name())
					.path(f.path())
					.source_reference(real_from)
					.legacy_peer_deps(self.options().legacy_peer_deps());
				self.graph.create_node(options)?
			},
		};

		let dep = if is_directory_spec(&spec) {
			self.link_from_spec(real_from, &name, &spec, virtual_root)?
		} else {
			let mut options = match self.manifest_for(real_from, &name, &spec, edge).await {
				Ok((manifest, resolved, integrity)) => NodeOptions::new(manifest).resolved(resolved).integrity(integrity),
				Err(reason) => {
					log::warn!("Unable to fetch {}@{}: {}", name, spec, reason);
					NodeOptions::new(Manifest { name: Some(spec.fetch_name(&name).to_string()), ..Default::default() }).error(reason)
				},
			};
			if let Some(second) = second {
				if let Ok((manifest, resolved, integrity)) = self.second_choice(real_from, second, &options).await {
					options = NodeOptions::new(manifest).resolved(resolved).integrity(integrity);
				}
			}
			let options = options
				.name(name.as_str())
				.parent(virtual_root)
				.legacy_peer_deps(self.options().legacy_peer_deps());
			self.graph.create_node(options)?
		};

		if self.graph.node(dep).error().is_none() && !self.graph.node(dep).is_link() {
			self.load_peer_set(dep, visiting).await?;
		}
		Ok(dep)
	}

	/// Manifest for a registry or remote specifier, preferring what the tree already has.
	async fn manifest_for(&self, real_from: NodeId, name: &str, spec: &Specifier, edge: EdgeId) -> Result<(Manifest, Option<String>, Option<String>), String> {
		let requested = self.explicit.contains(&edge) || self.update_names.contains(name);
		if !requested {
			if let Some(existing) = self.graph.resolve(real_from, name) {
				let e = self.graph.node(existing);
				if e.error().is_none() && !e.is_link() && !self.is_vulnerable(existing) && self.graph.spec_satisfied_by(real_from, name, spec, existing) {
					log::trace!("Reusing {} for {}@{}", e, name, spec);
					return Ok((e.package().clone(), e.resolved().map(str::to_string), e.integrity().map(str::to_string)));
				}
			}
		}
		let request = self.fetch_request(real_from, name, spec);
		self.builder.cache.get(&request).await.map(|m| {
			let (r, i) = (m.resolved().map(str::to_string), m.integrity().map(str::to_string));
			(m, r, i)
		})
	}

	/// When the first choice doesn't satisfy `second`, the manifest `second` asks for.
	async fn second_choice(&self, real_from: NodeId, second: EdgeId, first: &NodeOptions) -> Result<(Manifest, Option<String>, Option<String>), String> {
		let (name, spec) = {
			let e = self.graph.edge(second);
			(e.name().to_string(), e.spec().clone())
		};
		let version = first.manifest().version.as_deref().and_then(crate::version::parse_version);
		if version.map(|v| spec.matches_version(&v)).unwrap_or(false) {
			return Err(String::from("first choice already satisfies"));
		}
		self.manifest_for(real_from, &name, &spec, second).await
	}

	/// Directory dependencies become links to a node read from that directory.
	fn link_from_spec(&mut self, real_from: NodeId, name: &str, spec: &Specifier, virtual_root: NodeId) -> crate::Result<NodeId> {
		let rel = match spec.kind() {
			SpecKind::File(p) | SpecKind::Link(p) => p.clone(),
			_ => return Err(crate::Error::Parse(format!("{} is not a directory specifier", spec))),
		};
		let realpath = normalize_path(&self.graph.node(real_from).realpath().join(rel));
		let target = match Manifest::read_from_dir(&realpath) {
			Ok(manifest) => Some(self.graph.create_node(NodeOptions::new(manifest).name(name).path(&realpath))?),
			Err(e) => {
				log::warn!("Unable to read {}: {}", realpath.display(), e);
				None
			},
		};
		let link = self.graph.create_link(name, Some(virtual_root), None, realpath, target)?;
		if target.is_none() {
			self.graph.set_error(link, Some(String::from("link target has no readable package.json")));
		}
		Ok(link)
	}

	/// Loads the peers of `node` into its virtual root, recursing into their peers.
	///
	/// A peer the dependent also depends on directly is loaded through the dependent's edge, with
	/// the peer edge as a hint. Conflicts inside the set are fatal unless forced, or tolerated
	/// because the set isn't loaded on behalf of the project itself.
	fn load_peer_set<'s>(&'s mut self, node: NodeId, visiting: &'s mut Vec<NodeId>) -> BoxFuture<'s, crate::Result<()>> {
		async move {
			if visiting.len() >= MAX_PEER_DEPTH {
				let names = visiting.iter().map(|n| self.graph.node(*n).to_string()).collect();
				return Err(PlacementError::CyclicPeerSet(names).into());
			}
			visiting.push(node);

			let virtual_root = match self.graph.node(node).parent() {
				Some(p) => p,
				None => {
					visiting.pop();
					return Ok(());
				},
			};
			let peer_edges: Vec<EdgeId> = self.graph.node(node).edges_out().values().copied()
				.filter(|e| self.graph.edge(*e).peer())
				.collect();

			for pe in peer_edges {
				let (valid, to, edge_type, name) = {
					let e = self.graph.edge(pe);
					(e.valid(), e.to(), e.edge_type(), e.name().to_string())
				};
				if valid && to.is_some() {
					continue;
				}
				if to.is_none() && edge_type == EdgeType::PeerOptional {
					continue;
				}

				let parent_edge = self.graph.node(virtual_root).edge_out(&name);
				let source = self.graph.node(virtual_root).source_reference().unwrap_or(virtual_root);
				let is_mine = self.graph.is_project_top(source) || self.graph.is_workspace(source);
				let force = self.options().force();
				let conflict_ok = force || (!is_mine && !self.options().strict_peer_deps());

				match (to, parent_edge) {
					(None, None) => {
						self.node_from_edge(pe, Some(virtual_root), None, visiting).await?;
					},
					(None, Some(parent_edge)) => {
						self.node_from_edge(parent_edge, Some(virtual_root), Some(pe), visiting).await?;
						if !self.graph.edge(pe).valid() {
							self.peer_conflict(pe, conflict_ok, source)?;
						}
					},
					(Some(current), _) => {
						// something in the set wants a different version, see if one copy works for both
						let replacement = self.candidate_manifest(pe).await;
						let replaceable = match replacement {
							Some(manifest) => {
								let candidate = self.graph.create_node(NodeOptions::new(manifest).name(name.as_str()))?;
								self.graph.can_replace_with(current, candidate, &BTreeSet::new())
							},
							None => false,
						};
						if replaceable {
							self.node_from_edge(pe, Some(virtual_root), None, visiting).await?;
						} else {
							self.peer_conflict(pe, conflict_ok, source)?;
						}
					},
				}
			}
			visiting.pop();
			Ok(())
		}.boxed()
	}

	async fn candidate_manifest(&self, edge: EdgeId) -> Option<Manifest> {
		let (from, name, spec) = {
			let e = self.graph.edge(edge);
			(e.from(), e.name().to_string(), e.spec().clone())
		};
		if is_directory_spec(&spec) {
			return None;
		}
		let real_from = self.real_node(from);
		self.manifest_for(real_from, &name, &spec, edge).await.ok().map(|(m, _, _)| m)
	}

	fn peer_conflict(&mut self, edge: EdgeId, conflict_ok: bool, source: NodeId) -> crate::Result<()> {
		let e = self.graph.edge(edge);
		let requester = self.graph.node(e.from()).to_string();
		let occupant = e.to().map(|t| self.graph.node(t).to_string());
		if conflict_ok {
			log::warn!("Conflicting peer dependency: {} wants {}, found {}", requester, e, occupant.as_deref().unwrap_or("nothing"));
			self.tolerated.insert(edge);
			return Ok(());
		}
		Err(PlacementError::Unresolvable {
			edge: e.to_string(),
			requester,
			occupant,
			explanation: self.graph.explain(source),
			force_would_bypass: true,
		}.into())
	}

	/// Removes nodes whose fetch failed, along with everything only they needed.
	///
	/// Returns whether anything was removed.
	///
	/// # Errors
	/// [`FetchError::Failed`] when a failed node is not optional.
	fn prune_failed_optional(&mut self) -> crate::Result<bool> {
		let mut pruned = false;
		for id in self.graph.tree_nodes(self.root) {
			let node = self.graph.node(id);
			if node.is_deleted() || node.root() != self.root {
				continue;
			}
			let reason = match node.error() {
				Some(r) => r.to_string(),
				None => continue,
			};
			if !node.flags.optional {
				let spec = node.edges_in().iter().next()
					.map(|e| self.graph.edge(*e).spec().to_string())
					.unwrap_or_else(|| String::from("*"));
				log::error!("Required dependency {} failed: {}", node, reason);
				return Err(FetchError::Failed { name: node.name().to_string(), spec, reason }.into());
			}
			for n in self.graph.optional_set(id) {
				if n != self.root && !self.graph.node(n).is_deleted() {
					log::warn!("Skipping optional dependency {}", self.graph.node(n));
					self.graph.delete(n);
					pruned = true;
				}
			}
		}
		self.mutated |= pruned;
		Ok(pruned)
	}

	fn prune_extraneous(&mut self) {
		let extraneous: Vec<NodeId> = self.graph.tree_nodes(self.root).into_iter()
			.filter(|n| *n != self.root && self.graph.node(*n).flags.extraneous)
			.collect();
		for n in extraneous {
			if !self.graph.node(n).is_deleted() && self.graph.node(n).root() == self.root {
				log::debug!("Pruning extraneous {}", self.graph.node(n));
				self.graph.delete(n);
			}
		}
	}
}

/// Directory specifiers resolve to links, tarball paths are fetched like anything else.
fn is_directory_spec(spec: &Specifier) -> bool {
	match spec.kind() {
		SpecKind::Link(_) => true,
		SpecKind::File(p) => !(p.ends_with(".tgz") || p.ends_with(".tar.gz") || p.ends_with(".tar")),
		_ => false,
	}
}

/// Version each package name resolved to, for logging and tests.
pub fn resolved_versions(graph: &Graph, root: NodeId) -> BTreeMap<String, Vec<String>> {
	let mut out: BTreeMap<String, Vec<String>> = BTreeMap::new();
	for n in graph.tree_nodes(root) {
		if n == root {
			continue;
		}
		let node = graph.node(n);
		if let Some(v) = node.version() {
			out.entry(node.package_name().to_string()).or_default().push(v.to_string());
		}
	}
	out
}

#[cfg(test)]
mod test {
	use super::*;
	use async_trait::async_trait;

	/// Serves one version per name, failing names that start with `broken`.
	struct Fixed(BTreeMap<String, Manifest>);

	#[async_trait]
	impl ManifestFetcher for Fixed {
		async fn fetch(&self, request: &FetchRequest) -> Result<Manifest, FetchError> {
			if request.name.starts_with("broken") {
				return Err(FetchError::NotFound(request.name.clone()));
			}
			self.0.get(&request.name).cloned().ok_or_else(|| FetchError::NotFound(request.name.clone()))
		}
	}

	fn fetcher(manifests: Vec<Manifest>) -> Arc<dyn ManifestFetcher> {
		Arc::new(Fixed(manifests.into_iter().map(|m| (m.name.clone().unwrap_or_default(), m)).collect()))
	}

	#[tokio::test]
	async fn resolves_transitive_dependencies() {
		let mut graph = Graph::new();
		let root = graph.create_root(Manifest::new("root", "1.0.0").dep("a", "^1"), "/p").unwrap();
		let builder = IdealTreeBuilder::new(ArborOptions::new("/p"), fetcher(vec![
			Manifest::new("a", "1.0.0").dep("b", "^2"),
			Manifest::new("b", "2.1.0"),
		]));
		let ideal = builder.build_from(&mut graph, root, false).await.unwrap();
		assert!(graph.node(root).inventory().get("node_modules/a").is_some());
		assert!(graph.node(root).inventory().get("node_modules/b").is_some());
		assert!(graph.verify_tree_invariants(ideal.root).is_empty());
		assert!(ideal.mutated);
	}

	#[tokio::test]
	async fn optional_failures_are_pruned() {
		let mut graph = Graph::new();
		let root = graph.create_root(Manifest::new("root", "1.0.0").dep("a", "1"), "/p").unwrap();
		let builder = IdealTreeBuilder::new(ArborOptions::new("/p"), fetcher(vec![
			Manifest::new("a", "1.0.0").optional_dep("broken-native", "1"),
		]));
		builder.build_from(&mut graph, root, false).await.unwrap();
		assert!(graph.node(root).inventory().get("node_modules/a").is_some());
		assert!(graph.node(root).inventory().get("node_modules/broken-native").is_none());
	}

	#[tokio::test]
	async fn required_failures_abort() {
		let mut graph = Graph::new();
		let root = graph.create_root(Manifest::new("root", "1.0.0").dep("broken-native", "1"), "/p").unwrap();
		let builder = IdealTreeBuilder::new(ArborOptions::new("/p"), fetcher(vec![]));
		let err = builder.build_from(&mut graph, root, false).await.unwrap_err();
		assert!(matches!(err, crate::Error::Fetch(FetchError::Failed { .. })));
	}

	#[tokio::test]
	async fn added_requests_replace_satisfying_nodes() {
		let mut graph = Graph::new();
		let root = graph.create_root(Manifest::new("root", "1.0.0"), "/p").unwrap();
		let builder = IdealTreeBuilder::new(ArborOptions::new("/p"), fetcher(vec![Manifest::new("a", "1.0.0")]))
			.add("a", "^1", EdgeType::Dev);
		builder.build_from(&mut graph, root, false).await.unwrap();
		assert_eq!(graph.node(root).package().dev_dependencies.get("a").map(String::as_str), Some("^1"));
		let a = graph.node(root).child("a").unwrap();
		assert!(graph.node(a).flags.dev);
	}

	#[tokio::test]
	async fn not_a_root_is_rejected() {
		let mut graph = Graph::new();
		let root = graph.create_root(Manifest::new("root", "1.0.0"), "/p").unwrap();
		let a = graph.create_node(NodeOptions::new(Manifest::new("a", "1.0.0")).parent(root)).unwrap();
		let builder = IdealTreeBuilder::new(ArborOptions::new("/p"), fetcher(vec![]));
		assert!(builder.build_from(&mut graph, a, false).await.is_err());
	}
}
