//! Tree metadata persisted between runs.
//!
//! A lockfile records every location of a tree with where its content came from and why it is
//! there. Loading one gives a virtual tree without looking at `node_modules`.

use std::collections::BTreeMap;
use std::path::Path;

use thiserror::Error;

use crate::collaborators::LockfileStore;
use crate::graph::{normalize_path, DepFlags, Graph, NodeId, NodeOptions};
use crate::manifest::{Bin, Bundled, Manifest, PeerMeta};

pub const LOCKFILE_NAME: &str = "package-lock.json";
/// Lockfile shipped inside a published package.
pub const SHRINKWRAP_NAME: &str = "npm-shrinkwrap.json";
/// Kept in `node_modules`, describes what the last install put there.
pub const HIDDEN_LOCKFILE_NAME: &str = ".package-lock.json";
pub const LOCKFILE_VERSION: u32 = 3;

#[derive(Debug, Error)]
pub enum LockfileError {
	#[error("lockfile version {0} is not supported")]
	UnsupportedVersion(u32),
	/// A location whose containing package isn't in the lockfile.
	#[error("no parent for location \"{0}\"")]
	MissingParent(String),
	#[error("invalid location \"{0}\"")]
	InvalidLocation(String),
}

/// Metadata of one location.
#[derive(Debug, Default, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockEntry {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub name: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub version: Option<String>,
	/// For links, the target relative to the lockfile's directory.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub resolved: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub integrity: Option<String>,
	#[serde(default, skip_serializing_if = "std::ops::Not::not")]
	pub link: bool,
	#[serde(default, skip_serializing_if = "std::ops::Not::not")]
	pub dev: bool,
	#[serde(default, skip_serializing_if = "std::ops::Not::not")]
	pub optional: bool,
	#[serde(default, skip_serializing_if = "std::ops::Not::not")]
	pub dev_optional: bool,
	#[serde(default, skip_serializing_if = "std::ops::Not::not")]
	pub peer: bool,
	#[serde(default, skip_serializing_if = "std::ops::Not::not")]
	pub extraneous: bool,
	#[serde(default, skip_serializing_if = "std::ops::Not::not")]
	pub in_bundle: bool,
	#[serde(default, skip_serializing_if = "std::ops::Not::not")]
	pub has_shrinkwrap: bool,
	#[serde(default, skip_serializing_if = "std::ops::Not::not")]
	pub has_install_script: bool,
	#[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
	pub dependencies: BTreeMap<String, String>,
	#[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
	pub optional_dependencies: BTreeMap<String, String>,
	#[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
	pub dev_dependencies: BTreeMap<String, String>,
	#[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
	pub peer_dependencies: BTreeMap<String, String>,
	#[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
	pub peer_dependencies_meta: BTreeMap<String, PeerMeta>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub bundle_dependencies: Option<Bundled>,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub workspaces: Vec<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub bin: Option<Bin>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub license: Option<String>,
	#[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
	pub engines: BTreeMap<String, String>,
}

impl LockEntry {
	fn from_node(graph: &Graph, id: NodeId, base: &Path) -> LockEntry {
		let node = graph.node(id);
		if node.is_link() {
			return LockEntry {
				resolved: pathdiff::diff_paths(node.realpath(), base).map(|p| p.to_string_lossy().replace('\\', "/")),
				link: true,
				..Default::default()
			};
		}

		let pkg = node.package();
		let mut entry = LockEntry {
			version: pkg.version.clone(),
			resolved: node.resolved().map(str::to_string),
			integrity: node.integrity().map(str::to_string),
			in_bundle: node.in_bundle(),
			has_shrinkwrap: node.has_shrinkwrap(),
			has_install_script: pkg.has_install_script(),
			dependencies: pkg.dependencies.clone(),
			optional_dependencies: pkg.optional_dependencies.clone(),
			peer_dependencies: pkg.peer_dependencies.clone(),
			peer_dependencies_meta: pkg.peer_dependencies_meta.clone(),
			bundle_dependencies: pkg.bundle_dependencies.clone(),
			workspaces: pkg.workspaces.clone(),
			bin: pkg.bin.clone(),
			license: pkg.license.clone(),
			engines: pkg.engines.clone(),
			..Default::default()
		};
		if graph.is_root(id) || node.package_name() != node.name() {
			entry.name = Some(node.package_name().to_string());
		}
		if node.is_top() {
			entry.dev_dependencies = pkg.dev_dependencies.clone();
		}
		if !graph.is_root(id) {
			let flags = node.flags;
			if flags.extraneous {
				entry.extraneous = true;
			} else {
				entry.peer = flags.peer;
				entry.dev = flags.dev;
				entry.optional = flags.optional;
				entry.dev_optional = flags.dev_optional && !flags.dev && !flags.optional;
			}
		}
		entry
	}

	fn manifest(&self, name: &str) -> Manifest {
		Manifest {
			name: Some(self.name.clone().unwrap_or_else(|| name.to_string())),
			version: self.version.clone(),
			dependencies: self.dependencies.clone(),
			optional_dependencies: self.optional_dependencies.clone(),
			dev_dependencies: self.dev_dependencies.clone(),
			peer_dependencies: self.peer_dependencies.clone(),
			peer_dependencies_meta: self.peer_dependencies_meta.clone(),
			bundle_dependencies: self.bundle_dependencies.clone(),
			workspaces: self.workspaces.clone(),
			bin: self.bin.clone(),
			license: self.license.clone(),
			engines: self.engines.clone(),
			resolved: self.resolved.clone(),
			integrity: self.integrity.clone(),
			has_shrinkwrap: self.has_shrinkwrap,
			..Default::default()
		}
	}

	fn flags(&self) -> DepFlags {
		DepFlags {
			dev: self.dev,
			optional: self.optional,
			dev_optional: self.dev_optional || self.dev || self.optional,
			peer: self.peer,
			extraneous: self.extraneous,
		}
	}
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lockfile {
	pub lockfile_version: u32,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub name: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub version: Option<String>,
	/// Keyed by location, the root is `""`.
	#[serde(default)]
	pub packages: BTreeMap<String, LockEntry>,
}

impl Lockfile {
	/// Reads the lockfile of the project in `dir`.
	///
	/// # Errors
	/// - [`IO`](crate::Error::IO) when the lockfile exists but can't be read.
	/// - [`SerdeJSON`](crate::Error::SerdeJSON) when it isn't valid.
	/// - [`LockfileError::UnsupportedVersion`] for lockfiles without a `packages` section.
	///
	/// `Ok(None)` when there is no lockfile.
	pub fn load(dir: &Path) -> crate::Result<Option<Lockfile>> {
		Self::load_named(dir, LOCKFILE_NAME)
	}

	/// Reads the lockfile a package was published with, if it has one.
	pub fn load_shrinkwrap(dir: &Path) -> crate::Result<Option<Lockfile>> {
		Self::load_named(dir, SHRINKWRAP_NAME)
	}

	/// Reads the record of what was last installed into `dir/node_modules`.
	pub fn load_hidden(dir: &Path) -> crate::Result<Option<Lockfile>> {
		Self::load_named(&dir.join("node_modules"), HIDDEN_LOCKFILE_NAME)
	}

	fn load_named(dir: &Path, file_name: &str) -> crate::Result<Option<Lockfile>> {
		let path = dir.join(file_name);
		let text = match std::fs::read_to_string(&path) {
			Ok(text) => text,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
			Err(e) => return Err(e.into()),
		};
		let lockfile: Lockfile = serde_json::from_str(&text)?;
		if lockfile.lockfile_version < 2 {
			return Err(LockfileError::UnsupportedVersion(lockfile.lockfile_version).into());
		}
		log::debug!("Loaded {} with {} locations", path.display(), lockfile.packages.len());
		Ok(Some(lockfile))
	}

	/// Records the tree rooted at `root`.
	pub fn commit(graph: &Graph, root: NodeId) -> Lockfile {
		let base = graph.node(root).realpath().to_path_buf();
		let packages = graph.tree_nodes(root).into_iter()
			.filter(|id| !graph.node(*id).is_deleted())
			.map(|id| (graph.node(id).location().to_string(), LockEntry::from_node(graph, id, &base)))
			.collect();
		let pkg = graph.node(root).package();
		Lockfile {
			lockfile_version: LOCKFILE_VERSION,
			name: pkg.name.clone(),
			version: pkg.version.clone(),
			packages,
		}
	}

	/// Writes the lockfile into `dir`.
	pub fn save(&self, dir: &Path) -> crate::Result<()> {
		self.save_named(dir, LOCKFILE_NAME)
	}

	/// Writes the record of what is installed into `dir/node_modules`.
	pub fn save_hidden(&self, dir: &Path) -> crate::Result<()> {
		self.save_named(&dir.join("node_modules"), HIDDEN_LOCKFILE_NAME)
	}

	fn save_named(&self, dir: &Path, file_name: &str) -> crate::Result<()> {
		let path = dir.join(file_name);
		let mut text = serde_json::to_string_pretty(self)?;
		text.push('\n');
		std::fs::write(&path, text)?;
		log::debug!("Saved {}", path.display());
		Ok(())
	}

	/// Builds the virtual tree for the project at `path`.
	///
	/// `manifest` is the project's own manifest, it takes precedence over the lockfile's root entry
	/// so changed requirements show up as problem edges.
	///
	/// # Errors
	/// [`LockfileError`] when a location can't be placed in the tree.
	pub fn load_virtual(&self, graph: &mut Graph, manifest: Manifest, path: &Path) -> crate::Result<NodeId> {
		let root = graph.create_root(manifest, path)?;
		self.populate(graph, root)?;
		Ok(root)
	}

	/// Adds every non-root location beneath `top`, locations are relative to its directory.
	pub fn populate(&self, graph: &mut Graph, top: NodeId) -> crate::Result<()> {
		let base = graph.node(top).realpath().to_path_buf();
		let mut locations: Vec<&String> = self.packages.keys().filter(|l| !l.is_empty()).collect();
		locations.sort_by_key(|l| (l.matches("node_modules/").count(), l.as_str()));

		let mut created: BTreeMap<String, NodeId> = BTreeMap::new();
		created.insert(String::new(), top);
		let mut links = Vec::new();

		for location in locations {
			let entry = &self.packages[location];
			let (parent_location, name) = split_location(location)?;
			if entry.link {
				links.push((location.clone(), parent_location, name, entry));
				continue;
			}
			let options = NodeOptions::new(entry.manifest(&name))
				.name(&name)
				.flags(entry.flags());
			let id = match parent_location {
				Some(p) => {
					let parent = *created.get(&p).ok_or_else(|| LockfileError::MissingParent(location.clone()))?;
					graph.create_node(options.parent(parent))?
				},
				None => graph.create_node(options.path(base.join(location)).fs_parent(top))?,
			};
			if entry.in_bundle {
				graph.set_in_bundle(id, true);
			}
			created.insert(location.clone(), id);
		}

		for (location, parent_location, name, entry) in links {
			let rel = entry.resolved.as_deref().ok_or_else(|| LockfileError::InvalidLocation(location.clone()))?;
			let realpath = normalize_path(&base.join(rel));
			let target = match created.get(rel) {
				Some(t) => Some(*t),
				None => match Manifest::read_from_dir(&realpath) {
					Ok(manifest) => Some(graph.create_node(NodeOptions::new(manifest).name(&name).path(&realpath))?),
					Err(e) => {
						log::warn!("Link target {} of {} is unreadable: {}", realpath.display(), location, e);
						None
					},
				},
			};
			let parent = match parent_location {
				Some(p) => *created.get(&p).ok_or_else(|| LockfileError::MissingParent(location.clone()))?,
				None => return Err(LockfileError::InvalidLocation(location).into()),
			};
			let link = graph.create_link(&name, Some(parent), None, realpath, target)?;
			created.insert(location, link);
		}
		Ok(())
	}
}

/// Splits a location into the location of the package holding it and its folder name.
///
/// Locations outside of any `node_modules` folder have no parent package.
fn split_location(location: &str) -> crate::Result<(Option<String>, String)> {
	match location.rfind("node_modules/") {
		Some(i) => {
			let name = &location[i + "node_modules/".len()..];
			if name.is_empty() || name.starts_with('/') {
				return Err(LockfileError::InvalidLocation(location.to_string()).into());
			}
			let parent = location[..i].trim_end_matches('/').to_string();
			Ok((Some(parent), name.to_string()))
		},
		None => {
			let name = Path::new(location).file_name()
				.map(|n| n.to_string_lossy().to_string())
				.ok_or_else(|| LockfileError::InvalidLocation(location.to_string()))?;
			Ok((None, name))
		},
	}
}

/// [`LockfileStore`] keeping `package-lock.json` next to the project manifest.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonLockfileStore;

impl LockfileStore for JsonLockfileStore {
	fn load(&self, dir: &Path) -> crate::Result<Option<Lockfile>> {
		Lockfile::load(dir)
	}

	fn save(&self, dir: &Path, lockfile: &Lockfile) -> crate::Result<()> {
		lockfile.save(dir)
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::graph::EdgeType;

	fn tree(graph: &mut Graph) -> NodeId {
		let root = graph.create_root(Manifest::new("root", "1.0.0").dep("a", "^1.0.0").dev_dep("d", "^1.0.0"), "/p").unwrap();
		let a = graph.create_node(NodeOptions::new(Manifest::new("a", "1.0.0").dep("b", "1.0.0").with_resolved("https://r/a-1.0.0.tgz", Some("sha512-a"))).parent(root)).unwrap();
		graph.create_node(NodeOptions::new(Manifest::new("b", "1.0.0")).parent(a)).unwrap();
		graph.create_node(NodeOptions::new(Manifest::new("d", "1.2.0")).parent(root)).unwrap();
		crate::ideal_tree::fix_dep_flags(graph, root);
		root
	}

	#[test]
	fn splits_locations() {
		assert_eq!(split_location("node_modules/a").unwrap(), (Some(String::new()), String::from("a")));
		assert_eq!(split_location("node_modules/a/node_modules/@s/b").unwrap(), (Some(String::from("node_modules/a")), String::from("@s/b")));
		assert_eq!(split_location("packages/w").unwrap(), (None, String::from("w")));
		assert!(split_location("node_modules/").is_err());
	}

	#[test]
	fn commit_records_every_location() {
		let mut g = Graph::new();
		let root = tree(&mut g);
		let lock = Lockfile::commit(&g, root);
		assert_eq!(
			lock.packages.keys().map(String::as_str).collect::<Vec<_>>(),
			vec!["", "node_modules/a", "node_modules/a/node_modules/b", "node_modules/d"]
		);
		assert_eq!(lock.packages[""].name.as_deref(), Some("root"));
		assert_eq!(lock.packages["node_modules/a"].integrity.as_deref(), Some("sha512-a"));
		assert!(lock.packages["node_modules/d"].dev);
		assert!(!lock.packages["node_modules/a"].dev);
	}

	#[test]
	fn virtual_tree_matches_committed_tree() {
		let mut g = Graph::new();
		let root = tree(&mut g);
		let lock = Lockfile::commit(&g, root);
		let text = serde_json::to_string(&lock).unwrap();
		let lock: Lockfile = serde_json::from_str(&text).unwrap();

		let manifest = g.node(root).package().clone();
		let virtual_root = lock.load_virtual(&mut g, manifest, Path::new("/p")).unwrap();
		assert_eq!(g.snapshot(root), g.snapshot(virtual_root));
		let a = g.node(virtual_root).child("a").unwrap();
		let b_edge = g.node(a).edge_out("b").unwrap();
		assert!(g.edge(b_edge).valid());
		assert_eq!(g.edge(g.node(virtual_root).edge_out("d").unwrap()).edge_type(), EdgeType::Dev);
	}

	#[test]
	fn orphaned_locations_are_rejected() {
		let mut lock = Lockfile { lockfile_version: 3, name: None, version: None, packages: BTreeMap::new() };
		lock.packages.insert(String::from("node_modules/a/node_modules/b"), LockEntry::default());
		let mut g = Graph::new();
		assert!(lock.load_virtual(&mut g, Manifest::new("root", "1.0.0"), Path::new("/p")).is_err());
	}
}
