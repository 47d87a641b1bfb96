//! Reading what is installed on disk.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::graph::{Graph, NodeId, NodeOptions};
use crate::lockfile::{LockEntry, Lockfile};
use crate::manifest::Manifest;

/// Loads the tree installed in `path`.
///
/// Every folder in a `node_modules` folder becomes a node, symlinks become links to a node for
/// their target. Targets inside the project are part of the tree, targets outside of it are loaded
/// as trees of their own. Folders without a readable `package.json` become nodes with an error.
///
/// Where the hidden lockfile left by the last install agrees on the version, resolved and integrity
/// values are taken from it.
///
/// # Errors
/// - [`IO`](crate::Error::IO) when the project's own `package.json` can't be read.
/// - [`Graph`](crate::Error::Graph) when a node name can't be determined.
pub fn load_actual(graph: &mut Graph, path: &Path) -> crate::Result<NodeId> {
	let manifest = match Manifest::read_from_dir(path) {
		Ok(m) => m,
		Err(crate::Error::IO(e)) if e.kind() == std::io::ErrorKind::NotFound => Manifest::default(),
		Err(e) => return Err(e),
	};
	let root = graph.create_root(manifest, path)?;
	let hidden = match Lockfile::load_hidden(path) {
		Ok(h) => h.map(|h| h.packages).unwrap_or_default(),
		Err(e) => {
			log::warn!("Ignoring hidden lockfile in {}: {}", path.display(), e);
			BTreeMap::new()
		},
	};

	let mut loader = Loader {
		graph,
		root,
		root_path: path.to_path_buf(),
		root_real: std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf()),
		hidden,
		keep_existing: false,
	};
	loader.load_children(root, path)?;
	log::debug!("Loaded {} nodes from {}", loader.graph.tree_nodes(root).len(), path.display());
	Ok(root)
}

/// Adds what an unpacked package brought along in its own `node_modules` to the tree, flagged
/// as bundled. Returns the added nodes.
pub fn load_bundled(graph: &mut Graph, node: NodeId) -> crate::Result<Vec<NodeId>> {
	let root = graph.node(node).root();
	let before = graph.subtree(node);
	let dir = graph.node(node).path().to_path_buf();
	let root_path = graph.node(root).path().to_path_buf();
	let mut loader = Loader {
		graph,
		root,
		root_real: std::fs::canonicalize(&root_path).unwrap_or_else(|_| root_path.clone()),
		root_path,
		hidden: BTreeMap::new(),
		keep_existing: true,
	};
	loader.load_children(node, &dir)?;
	let added: Vec<NodeId> = loader.graph.subtree(node).into_iter().filter(|n| !before.contains(n)).collect();
	for n in &added {
		loader.graph.set_in_bundle(*n, true);
	}
	log::debug!("{} brought {} bundled packages", loader.graph.node(node), added.len());
	Ok(added)
}

struct Loader<'g> {
	graph: &'g mut Graph,
	root: NodeId,
	root_path: PathBuf,
	root_real: PathBuf,
	hidden: BTreeMap<String, LockEntry>,
	/// Leave names the tree already has alone instead of reading them from disk.
	keep_existing: bool,
}

impl Loader<'_> {
	fn load_children(&mut self, parent: NodeId, dir: &Path) -> crate::Result<()> {
		let node_modules = dir.join("node_modules");
		if !node_modules.is_dir() {
			return Ok(());
		}

		let mut walk = WalkDir::new(&node_modules).min_depth(1).max_depth(2).sort_by_file_name().into_iter();
		while let Some(entry) = walk.next() {
			let entry = match entry {
				Ok(e) => e,
				Err(e) => {
					log::warn!("Unable to read {}: {}", node_modules.display(), e);
					continue;
				},
			};
			let file_name = entry.file_name().to_string_lossy().to_string();
			let is_dir = entry.file_type().is_dir();
			// only folders above the depth limit were descended into
			let descended = is_dir && entry.depth() == 1;
			if file_name.starts_with('.') {
				// .bin, the hidden lockfile and anything retired
				if descended {
					walk.skip_current_dir();
				}
				continue;
			}
			if descended && file_name.starts_with('@') {
				continue;
			}
			if descended {
				walk.skip_current_dir();
			} else if !is_dir && !entry.file_type().is_symlink() {
				continue;
			}

			let name = match entry.path().strip_prefix(&node_modules) {
				Ok(rel) => rel.components().map(|c| c.as_os_str().to_string_lossy().to_string()).collect::<Vec<_>>().join("/"),
				Err(_) => continue,
			};
			if self.keep_existing && self.graph.node(parent).child(&name).is_some() {
				continue;
			}
			if entry.file_type().is_symlink() {
				self.load_link(parent, &name, entry.path())?;
			} else {
				let id = self.load_package(Some(parent), &name, entry.path())?;
				self.load_children(id, entry.path())?;
			}
		}
		Ok(())
	}

	fn load_package(&mut self, parent: Option<NodeId>, name: &str, path: &Path) -> crate::Result<NodeId> {
		let options = match Manifest::read_from_dir(path) {
			Ok(manifest) => NodeOptions::new(manifest),
			Err(e) => {
				log::debug!("No usable package.json in {}: {}", path.display(), e);
				NodeOptions::new(Manifest { name: Some(name.to_string()), ..Default::default() }).error(e.to_string())
			},
		};
		let options = options.name(name).path(path);
		let id = match parent {
			Some(p) => self.graph.create_node(options.parent(p))?,
			None if self.inside(path) => self.graph.create_node(options.fs_parent(self.root))?,
			None => self.graph.create_node(options)?,
		};
		self.apply_hidden(id);
		log::trace!("Loaded {} from {}", self.graph.node(id), path.display());
		Ok(id)
	}

	fn load_link(&mut self, parent: NodeId, name: &str, path: &Path) -> crate::Result<NodeId> {
		let realpath = match std::fs::canonicalize(path) {
			Ok(real) => self.project_path(&real),
			Err(_) => {
				// dangling, keep where it claims to point
				let link = std::fs::read_link(path)?;
				crate::graph::normalize_path(&path.parent().unwrap_or(path).join(link))
			},
		};

		let existing = self.graph.node(self.root).inventory().query_realpath(&realpath)
			.find(|n| !self.graph.node(*n).is_link());
		let target = match existing {
			Some(t) => Some(t),
			None if realpath.is_dir() => {
				let target = self.load_package(None, name, &realpath)?;
				self.load_children(target, &realpath)?;
				Some(target)
			},
			None => None,
		};
		let link = self.graph.create_link(name, Some(parent), None, realpath, target)?;
		if target.is_none() {
			self.graph.set_error(link, Some(String::from("link target does not exist")));
		}
		Ok(link)
	}

	/// Maps a canonical path back under the project path as given.
	fn project_path(&self, real: &Path) -> PathBuf {
		match real.strip_prefix(&self.root_real) {
			Ok(rel) => self.root_path.join(rel),
			Err(_) => real.to_path_buf(),
		}
	}

	fn inside(&self, path: &Path) -> bool {
		path.starts_with(&self.root_path)
	}

	fn apply_hidden(&mut self, id: NodeId) {
		let node = self.graph.node(id);
		let entry = match self.hidden.get(node.location()) {
			Some(e) => e,
			None => return,
		};
		let version = node.package().version.as_deref();
		if entry.link || entry.version.as_deref() != version {
			return;
		}
		let resolved = node.resolved().map(str::to_string).or_else(|| entry.resolved.clone());
		let integrity = node.integrity().map(str::to_string).or_else(|| entry.integrity.clone());
		self.graph.set_resolved(id, resolved, integrity);
		if entry.in_bundle {
			self.graph.set_in_bundle(id, true);
		}
	}
}

#[cfg(test)]
mod test {
	use super::*;

	fn write(dir: &Path, name: &str, version: &str) {
		std::fs::create_dir_all(dir).unwrap();
		Manifest::new(name, version).write_to_dir(dir).unwrap();
	}

	#[test]
	fn loads_nested_and_scoped_packages() {
		let tmp = tempfile::tempdir().unwrap();
		let root = tmp.path();
		write(root, "root", "1.0.0");
		write(&root.join("node_modules/a"), "a", "1.0.0");
		write(&root.join("node_modules/a/node_modules/b"), "b", "2.0.0");
		write(&root.join("node_modules/@s/c"), "@s/c", "1.0.0");
		std::fs::create_dir_all(root.join("node_modules/.bin")).unwrap();

		let mut g = Graph::new();
		let id = load_actual(&mut g, root).unwrap();
		assert_eq!(
			g.snapshot(id).locations(),
			vec!["", "node_modules/@s/c", "node_modules/a", "node_modules/a/node_modules/b"]
		);
		assert!(g.verify_tree_invariants(id).is_empty());
	}

	#[cfg(unix)]
	#[test]
	fn symlinks_become_links() {
		let tmp = tempfile::tempdir().unwrap();
		let root = tmp.path();
		write(root, "root", "1.0.0");
		write(&root.join("packages/w"), "w", "1.0.0");
		std::fs::create_dir_all(root.join("node_modules")).unwrap();
		std::os::unix::fs::symlink("../packages/w", root.join("node_modules/w")).unwrap();

		let mut g = Graph::new();
		let id = load_actual(&mut g, root).unwrap();
		let link = g.node(id).child("w").unwrap();
		assert!(g.node(link).is_link());
		let target = g.node(link).target().unwrap();
		assert_eq!(g.node(target).location(), "packages/w");
		assert_eq!(g.node(link).resolved(), Some("file:../packages/w"));
	}

	#[test]
	fn missing_manifests_are_errors_on_nodes() {
		let tmp = tempfile::tempdir().unwrap();
		write(tmp.path(), "root", "1.0.0");
		std::fs::create_dir_all(tmp.path().join("node_modules/broken")).unwrap();
		let mut g = Graph::new();
		let id = load_actual(&mut g, tmp.path()).unwrap();
		let broken = g.node(id).child("broken").unwrap();
		assert!(g.node(broken).error().is_some());
	}
}
