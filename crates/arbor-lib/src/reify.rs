//! Applying an ideal tree to disk.
//!
//! [`Reifier::reify()`] works through the [`Stage`]s in order. Everything done to the filesystem is
//! journaled, when one of the first five stages fails, or a termination signal arrives, the journal
//! is undone in reverse and the error returned. The tree is live once trash removal starts so
//! failures there only warn.
//!
//! # Usage
//! ```no_run
//! # async fn f(graph: &mut arbor::Graph, actual: arbor::NodeId, ideal: arbor::NodeId) -> arbor::Result<()> {
//! use std::sync::Arc;
//! let options = arbor::ArborOptions::new("./project");
//! let reifier = arbor::reify::Reifier::new(
//! 	options.clone(),
//! 	Arc::new(arbor::registry::TarballExtractor::new(&options)?),
//! 	Arc::new(arbor::registry::NoopScripts),
//! );
//! let outcome = reifier.reify(graph, actual, ideal).await?;
//! println!("{} changes", outcome.diff.leaves.len());
//! # Ok(())
//! # }
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use petgraph::graph::{DiGraph, NodeIndex};
use thiserror::Error;

use crate::collaborators::{BuildTarget, ExtractError, Extractor, LockfileStore, ScriptError, ScriptRunner, BUILD_EVENTS};
use crate::config::ArborOptions;
use crate::diff::{bin_paths, Action, Diff};
use crate::graph::{DepFlags, EdgeType, Graph, NodeId};
use crate::lockfile::{JsonLockfileStore, Lockfile};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
	/// Changed and removed top level folders are moved aside.
	Retire,
	/// Folders are created for everything being added, nested lockfiles and bundles are read.
	SparseTree,
	Unpack,
	/// Unchanged packages that lived in a retired folder are moved into the new tree.
	MoveBack,
	/// Lifecycle scripts and binary links, then the project's `package.json` when saving.
	Build,
	RemoveTrash,
}

impl Stage {
	pub const ALL: [Stage; 6] = [Stage::Retire, Stage::SparseTree, Stage::Unpack, Stage::MoveBack, Stage::Build, Stage::RemoveTrash];
}

impl std::fmt::Display for Stage {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(match self {
			Stage::Retire => "retire",
			Stage::SparseTree => "sparse tree",
			Stage::Unpack => "unpack",
			Stage::MoveBack => "move back",
			Stage::Build => "build",
			Stage::RemoveTrash => "remove trash",
		})
	}
}

/// How undoing a failed reify went.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rollback {
	Complete,
	/// Descriptions of the steps that could not be undone.
	Incomplete(Vec<String>),
}

impl std::fmt::Display for Rollback {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Rollback::Complete => write!(f, "changes were rolled back"),
			Rollback::Incomplete(failed) => write!(f, "rollback incomplete ({})", failed.join("; ")),
		}
	}
}

#[derive(Debug, Error)]
pub enum ReifyError {
	#[error("{stage} stage failed, {rollback}: {source}")]
	StageFailed { stage: Stage, source: Box<crate::Error>, rollback: Rollback },
	/// A termination signal arrived, `stage` was the last one to complete.
	#[error("interrupted after the {stage} stage, {rollback}")]
	Interrupted { stage: Stage, rollback: Rollback },
}

#[derive(Debug)]
pub struct ReifyOutcome {
	/// The final diff that was applied.
	pub diff: Diff,
	/// Optional packages left out because they failed to unpack or build.
	pub failed_optional: Vec<String>,
	/// Trash that could not be removed.
	pub leftover_trash: Vec<PathBuf>,
	/// `name@version: message` of every added package marked deprecated.
	pub deprecated: Vec<String>,
}

pub struct Reifier {
	options: ArborOptions,
	extractor: Arc<dyn Extractor>,
	scripts: Arc<dyn ScriptRunner>,
	lockfile_store: Arc<dyn LockfileStore>,
	interrupted: Arc<AtomicBool>,
	handle_signals: bool,
	stop_after: Option<Stage>,
}

impl Reifier {
	pub fn new(options: ArborOptions, extractor: Arc<dyn Extractor>, scripts: Arc<dyn ScriptRunner>) -> Self {
		Self {
			options,
			extractor,
			scripts,
			lockfile_store: Arc::new(JsonLockfileStore),
			interrupted: Arc::new(AtomicBool::new(false)),
			handle_signals: true,
			stop_after: None,
		}
	}

	pub fn lockfile_store(mut self, store: Arc<dyn LockfileStore>) -> Self {
		self.lockfile_store = store;
		self
	}

	/// Behaves as if a termination signal arrived during `stage`.
	pub fn stop_after(mut self, stage: Stage) -> Self {
		self.stop_after = Some(stage);
		self
	}

	/// Whether [`reify()`](Reifier::reify()) listens for Ctrl-C itself, on by default.
	///
	/// The listener is aborted when the reify returns, but tokio keeps its SIGINT handler registered
	/// for the rest of the process, so Ctrl-C no longer terminates it by default. Long lived
	/// processes should turn this off and raise [`interrupt_flag()`](Reifier::interrupt_flag())
	/// from their own handler instead.
	pub fn handle_signals(mut self, handle_signals: bool) -> Self {
		self.handle_signals = handle_signals;
		self
	}

	/// Setting the flag stops the reify once the current stage completes.
	///
	/// The flag is cleared when a reify starts.
	pub fn interrupt_flag(&self) -> Arc<AtomicBool> {
		self.interrupted.clone()
	}

	/// Makes the disk match the tree rooted at `ideal`, given it currently holds the tree rooted at `actual`.
	///
	/// # Errors
	/// - [`GraphError::NotARoot`](crate::graph::GraphError::NotARoot) when either node isn't a tree root.
	/// - [`ReifyError::StageFailed`] wrapping the original error once the rollback finished.
	/// - [`ReifyError::Interrupted`] when stopped by a termination signal.
	/// - [`IO`](crate::Error::IO) when writing lockfiles after the tree is in place fails.
	pub async fn reify(&self, graph: &mut Graph, actual: NodeId, ideal: NodeId) -> crate::Result<ReifyOutcome> {
		for root in [actual, ideal] {
			if !graph.is_root(root) {
				return Err(crate::graph::GraphError::NotARoot(graph.node(root).to_string()).into());
			}
		}
		self.interrupted.store(false, Ordering::SeqCst);
		let listener = self.handle_signals.then(|| self.listen_for_interrupt());
		let result = self.run(graph, actual, ideal).await;
		if let Some(listener) = listener {
			listener.abort();
		}
		result
	}

	fn listen_for_interrupt(&self) -> tokio::task::JoinHandle<()> {
		let flag = self.interrupted.clone();
		tokio::spawn(async move {
			if tokio::signal::ctrl_c().await.is_ok() {
				log::warn!("Interrupted, stopping once the current stage completes");
				flag.store(true, Ordering::SeqCst);
			}
		})
	}

	async fn run(&self, graph: &mut Graph, actual: NodeId, ideal: NodeId) -> crate::Result<ReifyOutcome> {
		let diff = Diff::calculate(graph, actual, ideal, &BTreeSet::new());
		let mut run = Run {
			reifier: self,
			graph,
			actual,
			ideal,
			diff,
			stage: Stage::Retire,
			journal: Vec::new(),
			retired: Vec::new(),
			trash: BTreeSet::new(),
			omitted: BTreeSet::new(),
			inflated: BTreeSet::new(),
			bundles_loaded: BTreeSet::new(),
			unpacked: BTreeSet::new(),
			bundled: BTreeSet::new(),
			moved_back: BTreeSet::new(),
			failed_optional: Vec::new(),
			deprecated: Vec::new(),
		};
		run.add_omits_to_trash();

		for stage in Stage::ALL {
			if stage == Stage::RemoveTrash {
				break;
			}
			log::info!("Reify: {}", stage);
			run.stage = stage;
			let result = match stage {
				Stage::Retire => run.retire_shallow().await,
				Stage::SparseTree => run.create_sparse_tree().await,
				Stage::Unpack => run.unpack().await,
				Stage::MoveBack => run.move_back_unchanged().await,
				Stage::Build => run.build().await,
				Stage::RemoveTrash => Ok(()),
			};
			if let Err(e) = result {
				log::error!("Reify {} stage failed: {}", stage, e);
				let rollback = run.rollback().await;
				return Err(ReifyError::StageFailed { stage, source: Box::new(e), rollback }.into());
			}
			if self.interrupted.load(Ordering::SeqCst) || self.stop_after == Some(stage) {
				let rollback = run.rollback().await;
				return Err(ReifyError::Interrupted { stage, rollback }.into());
			}
		}

		log::info!("Reify: {}", Stage::RemoveTrash);
		let leftover_trash = run.remove_trash().await;
		run.save()?;
		Ok(ReifyOutcome {
			diff: run.diff,
			failed_optional: run.failed_optional,
			leftover_trash,
			deprecated: run.deprecated,
		})
	}
}

/// How to undo one filesystem change.
#[derive(Debug)]
enum Undo {
	/// Something was created at this path.
	Remove(PathBuf),
	/// `from` was renamed to `to`.
	Rename { from: PathBuf, to: PathBuf },
	/// The file at `path` was overwritten, `contents` is what it held before.
	Restore { path: PathBuf, contents: Vec<u8> },
}

impl std::fmt::Display for Undo {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Undo::Remove(path) => write!(f, "remove {}", path.display()),
			Undo::Rename { from, to } => write!(f, "move {} back to {}", to.display(), from.display()),
			Undo::Restore { path, .. } => write!(f, "restore {}", path.display()),
		}
	}
}

/// State of one reify.
struct Run<'r> {
	reifier: &'r Reifier,
	graph: &'r mut Graph,
	actual: NodeId,
	ideal: NodeId,
	diff: Diff,
	stage: Stage,
	journal: Vec<(Stage, Undo)>,
	/// Original and retired path of everything moved aside.
	retired: Vec<(PathBuf, PathBuf)>,
	trash: BTreeSet<PathBuf>,
	omitted: BTreeSet<NodeId>,
	inflated: BTreeSet<NodeId>,
	bundles_loaded: BTreeSet<NodeId>,
	/// Unpacked before the unpack stage.
	unpacked: BTreeSet<NodeId>,
	/// Came out of another package's bundle.
	bundled: BTreeSet<NodeId>,
	moved_back: BTreeSet<NodeId>,
	failed_optional: Vec<String>,
	deprecated: Vec<String>,
}

impl Run<'_> {
	fn options(&self) -> &ArborOptions {
		&self.reifier.options
	}

	fn skipped(&self, id: NodeId) -> bool {
		self.graph.node(id).is_deleted() || self.omitted.contains(&id)
	}

	fn add_omits_to_trash(&mut self) {
		let omit = self.options().omit().clone();
		if omit.is_empty() {
			return;
		}
		for id in self.graph.tree_nodes(self.ideal) {
			if id != self.ideal && should_omit(self.graph.node(id).flags, &omit) && self.omitted.insert(id) {
				log::debug!("Omitting {}", self.graph.node(id));
				self.trash.insert(self.graph.node(id).path().to_path_buf());
			}
		}
	}

	fn rediff(&mut self) {
		self.diff = Diff::calculate(self.graph, self.actual, self.ideal, &self.inflated);
	}

	/* Stages */

	async fn retire_shallow(&mut self) -> crate::Result<()> {
		let shallow: Vec<PathBuf> = self.diff.shallow()
			.filter(|d| matches!(d.action, Some(Action::Change) | Some(Action::Remove)))
			.filter_map(|d| d.actual)
			.map(|a| self.graph.node(a).path().to_path_buf())
			.collect();
		for from in shallow {
			if tokio::fs::symlink_metadata(&from).await.is_err() {
				continue;
			}
			let to = retire_path(&from);
			log::debug!("Retiring {} to {}", from.display(), to.display());
			tokio::fs::rename(&from, &to).await?;
			self.journal.push((self.stage, Undo::Rename { from: from.clone(), to: to.clone() }));
			self.retired.push((from, to.clone()));
			self.trash.insert(to);
		}
		Ok(())
	}

	/// Creates folders for every added or changed leaf, then unpacks packages whose own lockfile
	/// or bundle changes the tree below them and starts over until nothing like that is left.
	async fn create_sparse_tree(&mut self) -> crate::Result<()> {
		loop {
			let dirs: Vec<PathBuf> = self.diff.leaves.iter()
				.map(|l| self.diff.node(*l))
				.filter(|d| matches!(d.action, Some(Action::Add) | Some(Action::Change)))
				.filter_map(|d| d.ideal)
				.filter(|i| !self.skipped(*i))
				.filter_map(|i| {
					let n = self.graph.node(i);
					if n.is_link() { n.path().parent().map(Path::to_path_buf) } else { Some(n.path().to_path_buf()) }
				})
				.collect();
			for dir in dirs {
				self.make_dir(&dir).await?;
			}

			let pending: Vec<(NodeId, bool)> = self.diff.nodes().iter()
				.filter_map(|d| d.ideal.map(|i| (i, d.action)))
				.filter(|(i, _)| *i != self.ideal && !self.skipped(*i) && !self.graph.node(*i).is_link())
				.filter(|(i, action)| {
					let n = self.graph.node(*i);
					let shrinkwrap = n.has_shrinkwrap() && !self.inflated.contains(i);
					let bundle = action.is_some() && !n.package().bundled_names().is_empty() && !self.bundles_loaded.contains(i);
					shrinkwrap || bundle
				})
				.map(|(i, action)| (i, action.is_some()))
				.collect();
			if pending.is_empty() {
				return Ok(());
			}

			for (id, changing) in pending {
				let path = self.graph.node(id).path().to_path_buf();
				if changing || !path.exists() {
					self.extract(id).await?;
					self.unpacked.insert(id);
				}
				if self.graph.node(id).has_shrinkwrap() && self.inflated.insert(id) {
					if let Some(lockfile) = Lockfile::load_shrinkwrap(&path)? {
						log::debug!("Inflating lockfile of {}", self.graph.node(id));
						lockfile.populate(self.graph, id)?;
					}
				}
				if !self.graph.node(id).package().bundled_names().is_empty() && self.bundles_loaded.insert(id) {
					let added = crate::actual_tree::load_bundled(self.graph, id)?;
					self.bundled.extend(added);
				}
			}
			crate::ideal_tree::fix_dep_flags(self.graph, self.ideal);
			self.rediff();
			self.add_omits_to_trash();
		}
	}

	async fn unpack(&mut self) -> crate::Result<()> {
		let mut links = Vec::new();
		let mut packages = Vec::new();
		for idx in self.diff.descendants(0) {
			let d = self.diff.node(idx);
			let added = d.action == Some(Action::Add);
			let id = match (d.action, d.ideal) {
				(Some(Action::Add) | Some(Action::Change), Some(id)) => id,
				_ => continue,
			};
			if id == self.ideal || self.skipped(id) {
				continue;
			}
			let n = self.graph.node(id);
			if added && !n.is_link() {
				if let Some(message) = &n.package().deprecated {
					let version = n.package().version.as_deref().unwrap_or_default();
					log::warn!("deprecated {}@{}: {}", n.package_name(), version, message);
					self.deprecated.push(format!("{}@{}: {}", n.package_name(), version, message));
				}
			}
			if self.unpacked.contains(&id) {
				continue;
			}
			if n.in_bundle() && n.path().exists() {
				continue;
			}
			if n.is_link() {
				links.push(id);
			} else {
				packages.push(id);
			}
		}

		for link in links {
			self.create_link(link).await?;
		}

		let mut jobs = Vec::new();
		for id in &packages {
			let n = self.graph.node(*id);
			let resolved = n.resolved()
				.ok_or_else(|| ExtractError::UnsupportedLocator(n.to_string()))?
				.to_string();
			let integrity = n.integrity().map(str::to_string);
			let path = n.path().to_path_buf();
			self.make_dir(&path).await?;
			jobs.push((*id, resolved, integrity, path));
		}

		let width = self.options().max_concurrency().max(1);
		let extractor = self.reifier.extractor.clone();
		let results: Vec<(NodeId, Result<(), ExtractError>)> = stream::iter(jobs)
			.map(|(id, resolved, integrity, path)| {
				let extractor = extractor.clone();
				async move {
					log::debug!("Unpacking {} into {}", resolved, path.display());
					(id, extractor.extract(&resolved, integrity.as_deref(), &path).await)
				}
			})
			.buffer_unordered(width)
			.collect()
			.await;

		let mut first_error = None;
		for (id, result) in results {
			if let Err(e) = result {
				if self.graph.node(id).flags.optional {
					log::warn!("Optional dependency {} failed to unpack: {}", self.graph.node(id), e);
					self.fail_optional(id);
				} else if first_error.is_none() {
					first_error = Some(e);
				}
			}
		}
		match first_error {
			Some(e) => Err(e.into()),
			None => Ok(()),
		}
	}

	async fn move_back_unchanged(&mut self) -> crate::Result<()> {
		let mut unchanged: Vec<NodeId> = self.diff.unchanged.iter().copied()
			.filter(|id| !self.skipped(*id) && !self.graph.node(*id).in_bundle())
			.collect();
		unchanged.sort_by_key(|id| self.graph.node(*id).path().components().count());

		for id in unchanged {
			let path = self.graph.node(id).path().to_path_buf();
			let (original, retired) = match self.retired.iter().find(|(o, _)| path.starts_with(o) && path != *o) {
				Some((o, r)) => (o.clone(), r.clone()),
				None => continue,
			};
			self.moved_back.insert(id);
			if self.graph.node(id).is_link() {
				self.create_link(id).await?;
				continue;
			}

			let from = match path.strip_prefix(&original) {
				Ok(rel) => retired.join(rel),
				Err(_) => continue,
			};
			log::debug!("Moving {} back from {}", path.display(), from.display());
			self.make_dir(&path).await?;
			let mut entries = tokio::fs::read_dir(&from).await?;
			while let Some(entry) = entries.next_entry().await? {
				if entry.file_name() == "node_modules" {
					continue;
				}
				let to = path.join(entry.file_name());
				tokio::fs::rename(entry.path(), &to).await?;
				self.journal.push((self.stage, Undo::Rename { from: entry.path(), to }));
			}
		}
		Ok(())
	}

	async fn build(&mut self) -> crate::Result<()> {
		let mut targets: BTreeSet<NodeId> = self.diff.nodes().iter()
			.filter(|d| matches!(d.action, Some(Action::Add) | Some(Action::Change)))
			.filter_map(|d| d.ideal)
			.collect();
		targets.extend(self.bundled.iter().copied());
		targets.extend(self.moved_back.iter().copied());
		targets.retain(|id| *id != self.ideal && !self.skipped(*id));

		for id in build_order(self.graph, &targets) {
			if self.skipped(id) {
				continue;
			}
			let target = self.build_target(id);
			let bins_only = self.moved_back.contains(&id);
			if let Err(e) = self.build_one(id, &target, bins_only).await {
				if target.optional {
					log::warn!("Optional dependency {} failed to build: {}", target.name, e);
					self.fail_optional(id);
				} else {
					return Err(e.into());
				}
			}
		}
		self.save_manifest().await
	}

	/// Writes the project's dependency tables into its `package.json` when requests changed them.
	///
	/// Other fields are kept, the old contents are journaled.
	async fn save_manifest(&mut self) -> crate::Result<()> {
		if !self.options().save() {
			return Ok(());
		}
		let path = self.graph.node(self.ideal).path().join("package.json");
		let original = match tokio::fs::read(&path).await {
			Ok(bytes) => bytes,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
			Err(e) => return Err(e.into()),
		};
		let mut json: serde_json::Map<String, serde_json::Value> = serde_json::from_slice(&original)?;

		let wanted = self.graph.node(self.ideal).package();
		let tables = [
			("dependencies", wanted.dependencies.is_empty(), serde_json::to_value(&wanted.dependencies)?),
			("optionalDependencies", wanted.optional_dependencies.is_empty(), serde_json::to_value(&wanted.optional_dependencies)?),
			("devDependencies", wanted.dev_dependencies.is_empty(), serde_json::to_value(&wanted.dev_dependencies)?),
			("peerDependencies", wanted.peer_dependencies.is_empty(), serde_json::to_value(&wanted.peer_dependencies)?),
			("peerDependenciesMeta", wanted.peer_dependencies_meta.is_empty(), serde_json::to_value(&wanted.peer_dependencies_meta)?),
		];
		let mut changed = false;
		for (key, empty, value) in tables {
			let unchanged = match json.get(key) {
				Some(current) => *current == value,
				None => empty,
			};
			if unchanged {
				continue;
			}
			if empty {
				json.remove(key);
			} else {
				json.insert(key.to_string(), value);
			}
			changed = true;
		}
		if !changed {
			return Ok(());
		}

		let mut text = serde_json::to_string_pretty(&json)?;
		text.push('\n');
		self.journal.push((self.stage, Undo::Restore { path: path.clone(), contents: original }));
		tokio::fs::write(&path, text).await?;
		log::info!("Saved dependencies to {}", path.display());
		Ok(())
	}

	fn build_target(&self, id: NodeId) -> BuildTarget {
		let n = self.graph.node(id);
		let path = n.path().to_path_buf();
		let bin_dir = path.parent().map(|p| p.join(".bin")).unwrap_or_else(|| path.join(".bin"));
		BuildTarget {
			name: n.name().to_string(),
			path,
			manifest: n.package().clone(),
			bin_dir,
			optional: n.flags.optional,
		}
	}

	async fn build_one(&mut self, id: NodeId, target: &BuildTarget, bins_only: bool) -> Result<(), ScriptError> {
		if !bins_only {
			for event in BUILD_EVENTS {
				if target.manifest.scripts.contains_key(event) {
					log::debug!("Running {} for {}", event, target.name);
					self.reifier.scripts.run_lifecycle(target, event).await?;
				}
			}
		}
		if target.manifest.bin_map().is_empty() {
			return Ok(());
		}
		if tokio::fs::symlink_metadata(&target.bin_dir).await.is_err() {
			self.journal.push((self.stage, Undo::Remove(target.bin_dir.clone())));
		}
		for bin in bin_paths(self.graph, id) {
			if tokio::fs::symlink_metadata(&bin).await.is_err() {
				self.journal.push((self.stage, Undo::Remove(bin)));
			}
		}
		self.reifier.scripts.link_binaries(target).await
	}

	/// Deletes everything retired or left out, failures only warn.
	async fn remove_trash(&mut self) -> Vec<PathBuf> {
		let mut leftover = Vec::new();
		for path in &self.trash {
			if let Err(e) = remove_path(path).await {
				log::warn!("Unable to remove {}: {}", path.display(), e);
				leftover.push(path.clone());
			}
		}
		leftover
	}

	fn save(&self) -> crate::Result<()> {
		let path = self.graph.node(self.ideal).path().to_path_buf();
		let lockfile = Lockfile::commit(self.graph, self.ideal);
		if path.join("node_modules").is_dir() {
			let mut installed = lockfile.clone();
			for id in &self.omitted {
				installed.packages.remove(self.graph.node(*id).location());
			}
			installed.save_hidden(&path)?;
		}
		if self.options().save() {
			self.reifier.lockfile_store.save(&path, &lockfile)?;
		}
		Ok(())
	}

	/* Helpers */

	async fn extract(&mut self, id: NodeId) -> crate::Result<()> {
		let (resolved, integrity, path) = {
			let n = self.graph.node(id);
			let resolved = n.resolved().ok_or_else(|| ExtractError::UnsupportedLocator(n.to_string()))?;
			(resolved.to_string(), n.integrity().map(str::to_string), n.path().to_path_buf())
		};
		self.make_dir(&path).await?;
		self.reifier.extractor.extract(&resolved, integrity.as_deref(), &path).await?;
		Ok(())
	}

	/// Creates `dir` and its missing parents, journaling the outermost created folder.
	async fn make_dir(&mut self, dir: &Path) -> crate::Result<()> {
		let mut outermost = None;
		for ancestor in dir.ancestors() {
			if tokio::fs::symlink_metadata(ancestor).await.is_ok() {
				break;
			}
			outermost = Some(ancestor.to_path_buf());
		}
		if let Some(outermost) = outermost {
			tokio::fs::create_dir_all(dir).await?;
			self.journal.push((self.stage, Undo::Remove(outermost)));
		}
		Ok(())
	}

	async fn create_link(&mut self, id: NodeId) -> crate::Result<()> {
		let (path, realpath) = {
			let n = self.graph.node(id);
			(n.path().to_path_buf(), n.realpath().to_path_buf())
		};
		let dir = match path.parent() {
			Some(d) => d.to_path_buf(),
			None => return Ok(()),
		};
		self.make_dir(&dir).await?;
		let target = pathdiff::diff_paths(&realpath, &dir).unwrap_or(realpath);
		log::debug!("Linking {} to {}", path.display(), target.display());
		symlink_dir(&target, &path).await?;
		self.journal.push((self.stage, Undo::Remove(path)));
		Ok(())
	}

	/// Leaves a failed optional package, and what only it needed, out of the tree.
	fn fail_optional(&mut self, id: NodeId) {
		for n in self.graph.optional_set(id) {
			if self.graph.node(n).is_deleted() || n == self.ideal {
				continue;
			}
			self.failed_optional.push(self.graph.node(n).to_string());
			self.trash.insert(self.graph.node(n).path().to_path_buf());
			self.graph.delete(n);
		}
	}

	/// Undoes the journal, latest change first.
	async fn rollback(&mut self) -> Rollback {
		let mut failed = Vec::new();
		while let Some((stage, undo)) = self.journal.pop() {
			let result = match &undo {
				Undo::Remove(path) => remove_path(path).await,
				Undo::Rename { from, to } => tokio::fs::rename(to, from).await,
				Undo::Restore { path, contents } => tokio::fs::write(path, contents).await,
			};
			if let Err(e) = result {
				log::error!("Unable to {} from the {} stage: {}", undo, stage, e);
				failed.push(format!("{}: {}", undo, e));
			}
		}
		if failed.is_empty() {
			log::info!("Rolled back");
			Rollback::Complete
		} else {
			Rollback::Incomplete(failed)
		}
	}
}

fn should_omit(flags: DepFlags, omit: &BTreeSet<EdgeType>) -> bool {
	(flags.dev && omit.contains(&EdgeType::Dev))
		|| (flags.optional && omit.contains(&EdgeType::Optional))
		|| (flags.dev_optional && omit.contains(&EdgeType::Dev) && omit.contains(&EdgeType::Optional))
		|| (flags.peer && omit.contains(&EdgeType::Peer))
}

/// Hidden sibling a folder is moved to while its replacement is put in place.
pub fn retire_path(path: &Path) -> PathBuf {
	let name = path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
	let hash = sha256::digest(path.to_string_lossy().as_bytes());
	path.with_file_name(format!(".{}-{}", name, &hash[..8]))
}

/// Dependencies before dependents, members of a cycle in location order.
fn build_order(graph: &Graph, targets: &BTreeSet<NodeId>) -> Vec<NodeId> {
	let mut deps: DiGraph<NodeId, ()> = DiGraph::new();
	let index: BTreeMap<NodeId, NodeIndex> = targets.iter().map(|t| (*t, deps.add_node(*t))).collect();
	for (id, from) in &index {
		for e in graph.node(*id).edges_out().values() {
			let to = match graph.edge(*e).to() {
				Some(to) => to,
				None => continue,
			};
			let candidates = [Some(to), graph.node(to).target()];
			for c in candidates.into_iter().flatten() {
				if let Some(to) = index.get(&c) {
					if to != from {
						deps.add_edge(*from, *to, ());
					}
				}
			}
		}
		// a link is built after what it points at
		if let Some(to) = graph.node(*id).target().and_then(|t| index.get(&t)) {
			deps.add_edge(*from, *to, ());
		}
	}

	let mut order = Vec::new();
	for mut component in petgraph::algo::tarjan_scc(&deps) {
		component.sort_by(|a, b| graph.node(deps[*a]).location().cmp(graph.node(deps[*b]).location()));
		order.extend(component.into_iter().map(|n| deps[n]));
	}
	order
}

async fn remove_path(path: &Path) -> std::io::Result<()> {
	match tokio::fs::symlink_metadata(path).await {
		Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(path).await,
		Ok(_) => tokio::fs::remove_file(path).await,
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
		Err(e) => Err(e),
	}
}

#[cfg(unix)]
async fn symlink_dir(target: &Path, path: &Path) -> std::io::Result<()> {
	tokio::fs::symlink(target, path).await
}

#[cfg(windows)]
async fn symlink_dir(target: &Path, path: &Path) -> std::io::Result<()> {
	tokio::fs::symlink_dir(target, path).await
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::graph::NodeOptions;
	use crate::Manifest;

	#[test]
	fn retired_paths_are_hidden_siblings() {
		let retired = retire_path(Path::new("/p/node_modules/a"));
		assert_eq!(retired.parent(), Some(Path::new("/p/node_modules")));
		let name = retired.file_name().unwrap().to_string_lossy().to_string();
		assert!(name.starts_with(".a-"));
		assert_eq!(name.len(), ".a-".len() + 8);
		assert_eq!(retired, retire_path(Path::new("/p/node_modules/a")));
	}

	#[test]
	fn dependencies_build_first() {
		let mut g = Graph::new();
		let root = g.create_root(Manifest::new("root", "1.0.0").dep("a", "1"), "/p").unwrap();
		let a = g.create_node(NodeOptions::new(Manifest::new("a", "1.0.0").dep("b", "1")).parent(root)).unwrap();
		let b = g.create_node(NodeOptions::new(Manifest::new("b", "1.0.0").dep("c", "1")).parent(root)).unwrap();
		let c = g.create_node(NodeOptions::new(Manifest::new("c", "1.0.0")).parent(root)).unwrap();
		let order = build_order(&g, &BTreeSet::from([a, b, c]));
		assert_eq!(order, vec![c, b, a]);
	}

	#[test]
	fn cycles_build_together() {
		let mut g = Graph::new();
		let root = g.create_root(Manifest::new("root", "1.0.0"), "/p").unwrap();
		let a = g.create_node(NodeOptions::new(Manifest::new("a", "1.0.0").dep("b", "1")).parent(root)).unwrap();
		let b = g.create_node(NodeOptions::new(Manifest::new("b", "1.0.0").dep("a", "1")).parent(root)).unwrap();
		let order = build_order(&g, &BTreeSet::from([a, b]));
		assert_eq!(order, vec![a, b]);
	}

	#[test]
	fn omission_follows_flags() {
		let dev = DepFlags { dev: true, dev_optional: true, ..DepFlags::none() };
		let dev_optional = DepFlags { dev_optional: true, ..DepFlags::none() };
		assert!(should_omit(dev, &BTreeSet::from([EdgeType::Dev])));
		assert!(!should_omit(dev, &BTreeSet::from([EdgeType::Optional])));
		assert!(!should_omit(dev_optional, &BTreeSet::from([EdgeType::Dev])));
		assert!(should_omit(dev_optional, &BTreeSet::from([EdgeType::Dev, EdgeType::Optional])));
		assert!(!should_omit(DepFlags::none(), &BTreeSet::from([EdgeType::Dev, EdgeType::Optional, EdgeType::Peer])));
	}
}
