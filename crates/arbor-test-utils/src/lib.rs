//! Various helpers for testing trees and installs.
//!
//! functions in this module should use results and not use any panics to avoid confusion in callers

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use arbor::collaborators::{
	AdvisorySource, BuildTarget, ExtractError, Extractor, FetchError, FetchRequest, ManifestFetcher, ScriptError, ScriptRunner,
};
use arbor::ideal_tree::{IdealTree, IdealTreeBuilder};
use arbor::manifest::Dist;
use arbor::placement::AdvisoryMap;
use arbor::registry::{fetch_local, with_dist, Packument};
use arbor::reify::{ReifyOutcome, Reifier};
use arbor::version::SpecKind;
use arbor::{ArborOptions, Graph, Manifest, NodeId};

/// Tarball url a package published to a [`MemoryRegistry`] resolves to.
pub fn tarball_url(name: &str, version: &str) -> String {
	let short = name.rsplit('/').next().unwrap_or(name);
	format!("https://registry.test/{}/-/{}-{}.tgz", name, short, version)
}

/// A registry held in memory, serving both manifests and package content.
#[derive(Default)]
pub struct MemoryRegistry {
	packuments: BTreeMap<String, Packument>,
	tarballs: BTreeMap<String, Manifest>,
	fail_fetch: BTreeSet<String>,
	fail_extract: BTreeSet<String>,
	fetches: AtomicUsize,
	extracts: AtomicUsize,
}

impl MemoryRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	/// Publishes a version, its dist fields are filled in.
	pub fn publish(mut self, manifest: Manifest) -> Self {
		let name = manifest.name.clone().unwrap_or_default();
		let version = manifest.version.clone().unwrap_or_default();
		let tarball = tarball_url(&name, &version);
		let manifest = Manifest {
			dist: Some(Dist {
				tarball: Some(tarball.clone()),
				integrity: Some(format!("sha512-{}@{}", name, version)),
			}),
			..manifest
		};
		self.tarballs.insert(tarball, manifest.clone());
		self.packuments.entry(name.clone()).or_insert_with(|| Packument::new(name)).add(manifest);
		self
	}

	pub fn tag(mut self, name: &str, tag: &str, version: &str) -> Self {
		if let Some(p) = self.packuments.get_mut(name) {
			p.tag(tag, version);
		}
		self
	}

	/// Fetching `name` fails from now on.
	pub fn fail_fetch(mut self, name: &str) -> Self {
		self.fail_fetch.insert(name.to_string());
		self
	}

	/// Extracting any version of `name` fails from now on.
	pub fn fail_extract(mut self, name: &str) -> Self {
		self.fail_extract.insert(name.to_string());
		self
	}

	pub fn fetch_count(&self) -> usize {
		self.fetches.load(Ordering::SeqCst)
	}

	pub fn extract_count(&self) -> usize {
		self.extracts.load(Ordering::SeqCst)
	}
}

#[async_trait]
impl ManifestFetcher for MemoryRegistry {
	async fn fetch(&self, request: &FetchRequest) -> Result<Manifest, FetchError> {
		self.fetches.fetch_add(1, Ordering::SeqCst);
		let name = request.spec.fetch_name(&request.name).to_string();
		if self.fail_fetch.contains(&name) {
			return Err(FetchError::NotFound(name));
		}
		match request.spec.kind() {
			SpecKind::File(path) | SpecKind::Link(path) => fetch_local(&request.base, path),
			SpecKind::Remote(raw) => Err(FetchError::Unsupported(raw.clone())),
			_ => {
				let packument = self.packuments.get(&name).ok_or_else(|| FetchError::NotFound(name.clone()))?;
				packument.pick(&request.spec, &request.avoid)
					.cloned()
					.map(with_dist)
					.ok_or_else(|| FetchError::NoMatchingVersion { name, spec: request.spec.to_string() })
			},
		}
	}
}

#[async_trait]
impl Extractor for MemoryRegistry {
	async fn extract(&self, resolved: &str, _integrity: Option<&str>, destination: &Path) -> Result<(), ExtractError> {
		self.extracts.fetch_add(1, Ordering::SeqCst);
		let manifest = self.tarballs.get(resolved).ok_or_else(|| ExtractError::NotFound(resolved.to_string()))?;
		let name = manifest.name.clone().unwrap_or_default();
		if self.fail_extract.contains(&name) {
			return Err(ExtractError::NotFound(resolved.to_string()));
		}

		std::fs::create_dir_all(destination)?;
		with_dist(manifest.clone()).write_to_dir(destination).map_err(|e| match e {
			arbor::Error::IO(e) => ExtractError::IO(e),
			other => ExtractError::IO(std::io::Error::new(std::io::ErrorKind::Other, other.to_string())),
		})?;
		for rel in manifest.bin_map().values() {
			let file = destination.join(rel);
			if let Some(parent) = file.parent() {
				std::fs::create_dir_all(parent)?;
			}
			std::fs::write(file, "#!/usr/bin/env node\n")?;
		}
		Ok(())
	}
}

/// Script runner that records what ran and fails for chosen packages.
#[derive(Default)]
pub struct TestScripts {
	fail: BTreeSet<String>,
	ran: Mutex<Vec<(String, String)>>,
}

impl TestScripts {
	pub fn new() -> Self {
		Self::default()
	}

	/// The install script of `name` exits with an error.
	pub fn fail(mut self, name: &str) -> Self {
		self.fail.insert(name.to_string());
		self
	}

	/// Package name and event of every script run so far, in order.
	pub fn ran(&self) -> Vec<(String, String)> {
		self.ran.lock().map(|r| r.clone()).unwrap_or_default()
	}
}

#[async_trait]
impl ScriptRunner for TestScripts {
	async fn run_lifecycle(&self, target: &BuildTarget, event: &str) -> Result<(), ScriptError> {
		if let Ok(mut ran) = self.ran.lock() {
			ran.push((target.name.clone(), event.to_string()));
		}
		if event == "install" && self.fail.contains(&target.name) {
			return Err(ScriptError::Failed {
				name: target.name.clone(),
				event: event.to_string(),
				message: String::from("exit code 1"),
			});
		}
		Ok(())
	}

	async fn link_binaries(&self, target: &BuildTarget) -> Result<(), ScriptError> {
		arbor::registry::link_bins(target).await
	}
}

/// Advisories known up front.
pub struct StaticAdvisories(pub AdvisoryMap);

#[async_trait]
impl AdvisorySource for StaticAdvisories {
	async fn advisories(&self, names: &[String]) -> Result<AdvisoryMap, FetchError> {
		Ok(self.0.iter().filter(|(k, _)| names.contains(k)).map(|(k, v)| (k.clone(), v.clone())).collect())
	}
}

/// Creates a temporary project holding `manifest` as its `package.json`.
pub fn project(manifest: &Manifest) -> arbor::Result<tempfile::TempDir> {
	let dir = tempfile::tempdir()?;
	manifest.write_to_dir(dir.path())?;
	Ok(dir)
}

/// Writes a package folder at `location` under `root`, as if it had been installed.
pub fn write_package(root: &Path, location: &str, manifest: &Manifest) -> arbor::Result<PathBuf> {
	let dir = root.join(location);
	std::fs::create_dir_all(&dir)?;
	manifest.write_to_dir(&dir)?;
	Ok(dir)
}

/// Every path under `dir`, mapped to its file contents, `/` for folders or `-> target` for symlinks.
pub fn snapshot_dir(dir: &Path) -> std::io::Result<BTreeMap<String, String>> {
	let mut out = BTreeMap::new();
	for entry in walkdir::WalkDir::new(dir).min_depth(1).sort_by_file_name() {
		let entry = entry?;
		let rel = entry.path().strip_prefix(dir)
			.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?
			.to_string_lossy()
			.replace('\\', "/");
		let value = if entry.path_is_symlink() {
			format!("-> {}", std::fs::read_link(entry.path())?.display())
		} else if entry.file_type().is_dir() {
			String::from("/")
		} else {
			String::from_utf8_lossy(&std::fs::read(entry.path())?).to_string()
		};
		out.insert(rel, value);
	}
	Ok(out)
}

/// Options for a project at `dir` that leave the real registry alone.
pub fn options(dir: &Path) -> ArborOptions {
	let mut options = ArborOptions::new(dir);
	options.set_registry("https://registry.test/");
	options
}

/// Builds the ideal tree for the project in `options`.
pub async fn build_ideal(registry: &Arc<MemoryRegistry>, options: &ArborOptions, graph: &mut Graph) -> arbor::Result<IdealTree> {
	IdealTreeBuilder::new(options.clone(), registry.clone()).build(graph).await
}

pub fn reifier(registry: &Arc<MemoryRegistry>, scripts: Arc<dyn ScriptRunner>, options: &ArborOptions) -> Reifier {
	Reifier::new(options.clone(), registry.clone(), scripts)
}

/// Result of [`install()`].
pub struct Installed {
	pub graph: Graph,
	pub actual: NodeId,
	pub ideal: NodeId,
	pub outcome: ReifyOutcome,
}

/// Builds the ideal tree, loads what is on disk and reifies.
pub async fn install(registry: &Arc<MemoryRegistry>, scripts: Arc<dyn ScriptRunner>, options: &ArborOptions) -> arbor::Result<Installed> {
	let mut graph = Graph::new();
	let ideal = build_ideal(registry, options, &mut graph).await?.root;
	let actual = arbor::actual_tree::load_actual(&mut graph, options.path())?;
	let outcome = reifier(registry, scripts, options).reify(&mut graph, actual, ideal).await?;
	Ok(Installed { graph, actual, ideal, outcome })
}
