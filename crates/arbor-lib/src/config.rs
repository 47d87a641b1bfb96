//! Options shared by the tree builders and the reifier.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use crate::graph::EdgeType;

/// How far up the tree a dependency may be hoisted.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstallStrategy {
	/// Place each dependency as shallow as it legally fits.
	#[default]
	Hoisted,
	/// Never climb, every dependency is nested under its dependent.
	Nested,
	/// Only direct dependencies of the project are placed at the top level.
	Shallow,
}

/// Packages selected for update.
#[derive(Debug, Default, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum UpdateSelection {
	#[default]
	None,
	All,
	Names(BTreeSet<String>),
}

/// Unset fields in a loaded file take their default value.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct ArborOptions {
	path: PathBuf,
	cache_dir: PathBuf,
	registry: String,
	https_only: bool,
	force: bool,
	strict_peer_deps: bool,
	legacy_peer_deps: bool,
	prefer_dedupe: bool,
	install_strategy: InstallStrategy,
	follow_links: bool,
	omit: BTreeSet<EdgeType>,
	strict: bool,
	max_concurrency: usize,
	update: UpdateSelection,
	save: bool,
}

impl Default for ArborOptions {
	fn default() -> Self {
		Self {
			path: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
			cache_dir: {
				#[cfg(target_os = "windows")]
				let path = std::env::var("LOCALAPPDATA").map(PathBuf::from).unwrap_or_else(|_| std::env::temp_dir());

				#[cfg(not(target_os = "windows"))]
				let path = if let Ok(e) = std::env::var("XDG_CACHE_HOME") {
					PathBuf::from(e)
				} else if let Ok(home) = std::env::var("HOME") {
					PathBuf::from(home).join(".cache")
				} else {
					std::env::temp_dir()
				};

				path.join("arbor").join("tarballs")
			},
			registry: "https://registry.npmjs.org/".to_string(),
			https_only: true,
			force: false,
			strict_peer_deps: false,
			legacy_peer_deps: false,
			prefer_dedupe: false,
			install_strategy: InstallStrategy::Hoisted,
			follow_links: false,
			omit: BTreeSet::new(),
			strict: false,
			max_concurrency: 16,
			update: UpdateSelection::None,
			save: true,
		}
	}
}

impl ArborOptions {
	/// Default options rooted at `path`.
	pub fn new(path: impl Into<PathBuf>) -> Self {
		Self {
			path: path.into(),
			..Default::default()
		}
	}

	/// Reads options from a JSON file.
	///
	/// # Errors
	/// - [`IO`](crate::error::Error::IO) when opening the file.
	/// - [`SerdeJSON`](crate::error::Error::SerdeJSON) when the contents are not valid options.
	pub fn load_from_file(path: impl AsRef<Path>) -> crate::Result<Self> {
		let file = std::fs::File::open(path)?;
		Ok(serde_json::from_reader(file)?)
	}

	pub fn save_to_file(&self, path: impl AsRef<Path>) -> crate::Result<()> {
		let file = std::fs::File::create(path)?;
		serde_json::to_writer_pretty(file, self)?;
		Ok(())
	}

	pub fn path(&self) -> &Path {
		&self.path
	}
	pub fn set_path(&mut self, path: PathBuf) {
		self.path = path;
	}

	pub fn cache_dir(&self) -> &Path {
		&self.cache_dir
	}
	/// returns if the directory is valid or not.
	pub fn set_cache_dir(&mut self, cache_dir: PathBuf) -> bool {
		if cache_dir.is_dir() {
			self.cache_dir = cache_dir;
			true
		} else {
			false
		}
	}

	pub fn registry(&self) -> &str {
		&self.registry
	}
	pub fn set_registry(&mut self, registry: impl Into<String>) {
		self.registry = registry.into();
	}

	pub fn https_only(&self) -> bool {
		self.https_only
	}
	pub fn set_https_only(&mut self, https_only: bool) {
		self.https_only = https_only;
	}

	pub fn force(&self) -> bool {
		self.force
	}
	pub fn set_force(&mut self, force: bool) {
		self.force = force;
	}

	pub fn strict_peer_deps(&self) -> bool {
		self.strict_peer_deps
	}
	pub fn set_strict_peer_deps(&mut self, strict_peer_deps: bool) {
		self.strict_peer_deps = strict_peer_deps;
	}

	pub fn legacy_peer_deps(&self) -> bool {
		self.legacy_peer_deps
	}
	pub fn set_legacy_peer_deps(&mut self, legacy_peer_deps: bool) {
		self.legacy_peer_deps = legacy_peer_deps;
	}

	pub fn prefer_dedupe(&self) -> bool {
		self.prefer_dedupe
	}
	pub fn set_prefer_dedupe(&mut self, prefer_dedupe: bool) {
		self.prefer_dedupe = prefer_dedupe;
	}

	pub fn install_strategy(&self) -> InstallStrategy {
		self.install_strategy
	}
	pub fn set_install_strategy(&mut self, install_strategy: InstallStrategy) {
		self.install_strategy = install_strategy;
	}

	pub fn follow_links(&self) -> bool {
		self.follow_links
	}
	pub fn set_follow_links(&mut self, follow_links: bool) {
		self.follow_links = follow_links;
	}

	pub fn omit(&self) -> &BTreeSet<EdgeType> {
		&self.omit
	}
	pub fn set_omit(&mut self, omit: impl IntoIterator<Item = EdgeType>) {
		self.omit = omit.into_iter().collect();
	}

	pub fn strict(&self) -> bool {
		self.strict
	}
	pub fn set_strict(&mut self, strict: bool) {
		self.strict = strict;
	}

	pub fn max_concurrency(&self) -> usize {
		self.max_concurrency
	}
	/// Values below one are clamped to one.
	pub fn set_max_concurrency(&mut self, max_concurrency: usize) {
		self.max_concurrency = max_concurrency.max(1);
	}

	pub fn update(&self) -> &UpdateSelection {
		&self.update
	}
	pub fn set_update(&mut self, update: UpdateSelection) {
		self.update = update;
	}

	pub fn save(&self) -> bool {
		self.save
	}
	pub fn set_save(&mut self, save: bool) {
		self.save = save;
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn concurrency_is_clamped() {
		let mut options = ArborOptions::new("/tmp/project");
		options.set_max_concurrency(0);
		assert_eq!(options.max_concurrency(), 1);
	}

	#[test]
	fn missing_cache_dir_is_rejected() {
		let mut options = ArborOptions::default();
		assert!(!options.set_cache_dir(PathBuf::from("/definitely/not/a/dir")));
	}

	#[test]
	fn options_survive_json() {
		let mut options = ArborOptions::new("/tmp/project");
		options.set_install_strategy(InstallStrategy::Nested);
		options.set_omit([EdgeType::Dev]);
		let text = serde_json::to_string(&options).unwrap();
		let back: ArborOptions = serde_json::from_str(&text).unwrap();
		assert_eq!(back.install_strategy(), InstallStrategy::Nested);
		assert!(back.omit().contains(&EdgeType::Dev));
	}

	#[test]
	fn partial_files_fill_in_defaults() {
		let options: ArborOptions = serde_json::from_str(r#"{"path": "/tmp/project", "force": true}"#).unwrap();
		assert!(options.force());
		assert!(options.save());
		assert_eq!(options.install_strategy(), InstallStrategy::Hoisted);
	}
}
