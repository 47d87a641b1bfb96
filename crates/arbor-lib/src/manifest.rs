//! Package manifests, as read from `package.json` or returned by a registry.

use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(untagged)]
pub enum Bin {
	Single(String),
	Map(BTreeMap<String, String>),
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(untagged)]
pub enum Bundled {
	All(bool),
	Names(Vec<String>),
}

#[derive(Debug, Default, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PeerMeta {
	#[serde(default)]
	pub optional: bool,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Dist {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub tarball: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub integrity: Option<String>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub name: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub version: Option<String>,
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
	#[serde(default, alias = "bundledDependencies", skip_serializing_if = "Option::is_none")]
	pub bundle_dependencies: Option<Bundled>,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub workspaces: Vec<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub bin: Option<Bin>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub license: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub funding: Option<serde_json::Value>,
	#[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
	pub scripts: BTreeMap<String, String>,
	#[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
	pub engines: BTreeMap<String, String>,
	/// Set by the registry on versions that should no longer be used.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub deprecated: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub dist: Option<Dist>,
	#[serde(default, rename = "_resolved", skip_serializing_if = "Option::is_none")]
	pub resolved: Option<String>,
	#[serde(default, rename = "_integrity", skip_serializing_if = "Option::is_none")]
	pub integrity: Option<String>,
	#[serde(default, rename = "_hasShrinkwrap", skip_serializing_if = "std::ops::Not::not")]
	pub has_shrinkwrap: bool,
}

impl Manifest {
	pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
		Self {
			name: Some(name.into()),
			version: Some(version.into()),
			..Default::default()
		}
	}

	/// Reads `package.json` from a package directory.
	pub fn read_from_dir(dir: impl AsRef<Path>) -> crate::Result<Self> {
		let file = std::fs::File::open(dir.as_ref().join("package.json"))?;
		Ok(serde_json::from_reader(std::io::BufReader::new(file))?)
	}

	pub fn write_to_dir(&self, dir: impl AsRef<Path>) -> crate::Result<()> {
		let file = std::fs::File::create(dir.as_ref().join("package.json"))?;
		serde_json::to_writer_pretty(file, self)?;
		Ok(())
	}

	/// Where the content comes from: `_resolved`, then `dist.tarball`.
	pub fn resolved(&self) -> Option<&str> {
		self.resolved.as_deref()
			.or_else(|| self.dist.as_ref().and_then(|d| d.tarball.as_deref()))
	}

	pub fn integrity(&self) -> Option<&str> {
		self.integrity.as_deref()
			.or_else(|| self.dist.as_ref().and_then(|d| d.integrity.as_deref()))
	}

	pub fn has_install_script(&self) -> bool {
		["preinstall", "install", "postinstall"].iter().any(|s| self.scripts.contains_key(*s))
	}

	/// Names of bundled dependencies, `true` bundles every production dependency.
	pub fn bundled_names(&self) -> Vec<String> {
		match &self.bundle_dependencies {
			Some(Bundled::All(true)) => self.dependencies.keys().cloned().collect(),
			Some(Bundled::Names(names)) => names.clone(),
			_ => Vec::new(),
		}
	}

	/// Binary name to relative script path.
	pub fn bin_map(&self) -> BTreeMap<String, String> {
		match &self.bin {
			Some(Bin::Map(m)) => m.clone(),
			Some(Bin::Single(path)) => {
				let mut m = BTreeMap::new();
				if let Some(name) = &self.name {
					let short = name.rsplit('/').next().unwrap_or(name).to_string();
					m.insert(short, path.clone());
				}
				m
			},
			None => BTreeMap::new(),
		}
	}

	// builder helpers, mostly used when constructing trees by hand

	pub fn dep(mut self, name: &str, spec: &str) -> Self {
		self.dependencies.insert(name.to_string(), spec.to_string());
		self
	}

	pub fn optional_dep(mut self, name: &str, spec: &str) -> Self {
		self.optional_dependencies.insert(name.to_string(), spec.to_string());
		self
	}

	pub fn dev_dep(mut self, name: &str, spec: &str) -> Self {
		self.dev_dependencies.insert(name.to_string(), spec.to_string());
		self
	}

	pub fn peer_dep(mut self, name: &str, spec: &str) -> Self {
		self.peer_dependencies.insert(name.to_string(), spec.to_string());
		self
	}

	pub fn peer_optional_dep(mut self, name: &str, spec: &str) -> Self {
		self.peer_dependencies.insert(name.to_string(), spec.to_string());
		self.peer_dependencies_meta.insert(name.to_string(), PeerMeta { optional: true });
		self
	}

	pub fn with_resolved(mut self, resolved: &str, integrity: Option<&str>) -> Self {
		self.resolved = Some(resolved.to_string());
		self.integrity = integrity.map(str::to_string);
		self
	}
}
