//! Interfaces to the outside world.
//!
//! Trees are built and applied against these traits so fetching, unpacking and script running can
//! be swapped out. [`crate::registry`] has the implementations used against a real registry.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;

use crate::manifest::Manifest;
use crate::placement::AdvisoryMap;
use crate::version::{Specifier, VersionReq};

#[derive(Debug, Error)]
pub enum FetchError {
	#[error("no package named {0} could be found")]
	NotFound(String),
	#[error("no version of {name} satisfies {spec}")]
	NoMatchingVersion { name: String, spec: String },
	/// The specifier kind can't be fetched by this fetcher.
	#[error("unsupported specifier {0}")]
	Unsupported(String),
	/// A fetch failed earlier, recorded on the node and surfaced when the node turned out to be required.
	#[error("failed to fetch {name}@{spec}: {reason}")]
	Failed { name: String, spec: String, reason: String },
	#[error("reqwest error: {0}")]
	Reqwest(#[from] reqwest::Error),
	#[error("IO error: {0}")]
	IO(#[from] std::io::Error),
	#[error("JSON error: {0}")]
	SerdeJSON(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum ExtractError {
	/// Nothing is known about how to get content for this locator.
	#[error("cannot extract {0}")]
	UnsupportedLocator(String),
	#[error("no content available for {0}")]
	NotFound(String),
	#[error("reqwest error: {0}")]
	Reqwest(#[from] reqwest::Error),
	#[error("IO error: {0}")]
	IO(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum ScriptError {
	#[error("{name} failed running {event}: {message}")]
	Failed { name: String, event: String, message: String },
	#[error("IO error: {0}")]
	IO(#[from] std::io::Error),
}

/// A request for the manifest of one dependency.
#[derive(Debug, Clone)]
pub struct FetchRequest {
	pub name: String,
	pub spec: Specifier,
	/// Directory relative `file:` specifiers are resolved against.
	pub base: PathBuf,
	/// Ranges to stay out of when something else satisfies the specifier.
	pub avoid: Vec<VersionReq>,
}

impl FetchRequest {
	pub fn new(name: impl Into<String>, spec: Specifier, base: impl Into<PathBuf>) -> Self {
		Self { name: name.into(), spec, base: base.into(), avoid: Vec::new() }
	}

	pub fn avoid(mut self, ranges: Vec<VersionReq>) -> Self {
		self.avoid = ranges;
		self
	}

	/// Key used to share fetch results within a build.
	pub fn cache_key(&self) -> String {
		match self.spec.kind() {
			crate::version::SpecKind::File(_) | crate::version::SpecKind::Link(_) => {
				format!("{}@{}#{}", self.name, self.spec.raw(), self.base.display())
			},
			_ => format!("{}@{}", self.name, self.spec.raw()),
		}
	}
}

/// Turns specifiers into manifests.
///
/// The returned manifest should carry where its content comes from in `_resolved`, and
/// `_integrity` when known. Identical requests within a build must give identical answers.
#[async_trait]
pub trait ManifestFetcher: Send + Sync {
	async fn fetch(&self, request: &FetchRequest) -> Result<Manifest, FetchError>;
}

/// Puts a package's content on disk.
#[async_trait]
pub trait Extractor: Send + Sync {
	/// Fully populates `destination` from `resolved` or fails, siblings of `destination` must not be touched.
	async fn extract(&self, resolved: &str, integrity: Option<&str>, destination: &Path) -> Result<(), ExtractError>;
}

/// The node handed to a [`ScriptRunner`].
#[derive(Debug, Clone)]
pub struct BuildTarget {
	pub name: String,
	pub path: PathBuf,
	pub manifest: Manifest,
	/// `node_modules/.bin` folder the package's binaries belong in.
	pub bin_dir: PathBuf,
	pub optional: bool,
}

#[async_trait]
pub trait ScriptRunner: Send + Sync {
	async fn run_lifecycle(&self, target: &BuildTarget, event: &str) -> Result<(), ScriptError>;
	async fn link_binaries(&self, target: &BuildTarget) -> Result<(), ScriptError>;
}

/// Source of known vulnerable version ranges.
#[async_trait]
pub trait AdvisorySource: Send + Sync {
	async fn advisories(&self, names: &[String]) -> Result<AdvisoryMap, FetchError>;
}

/// Persistence of tree metadata between runs.
pub trait LockfileStore: Send + Sync {
	/// `Ok(None)` when there is no lockfile to load.
	fn load(&self, dir: &Path) -> crate::Result<Option<crate::lockfile::Lockfile>>;
	fn save(&self, dir: &Path, lockfile: &crate::lockfile::Lockfile) -> crate::Result<()>;
}

/// Lifecycle events run, in order, for each built node.
pub const BUILD_EVENTS: [&str; 3] = ["preinstall", "install", "postinstall"];

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn file_specs_key_by_base() {
		let a = FetchRequest::new("x", Specifier::parse_lossy("file:../x"), "/one");
		let b = FetchRequest::new("x", Specifier::parse_lossy("file:../x"), "/two");
		assert_ne!(a.cache_key(), b.cache_key());
		let c = FetchRequest::new("x", Specifier::parse_lossy("^1"), "/one");
		let d = FetchRequest::new("x", Specifier::parse_lossy("^1"), "/two");
		assert_eq!(c.cache_key(), d.cache_key());
	}
}
