//! Collaborators for working against a real registry and filesystem.

use std::collections::{BTreeMap, HashMap};
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

use crate::collaborators::{BuildTarget, ExtractError, Extractor, FetchError, FetchRequest, ManifestFetcher, ScriptError, ScriptRunner};
use crate::config::ArborOptions;
use crate::graph::normalize_path;
use crate::manifest::Manifest;
use crate::version::{is_vulnerable, parse_version, SpecKind, Specifier, Version, VersionReq};

/// Every published version of a package.
#[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
pub struct Packument {
	pub name: String,
	#[serde(default, rename = "dist-tags")]
	pub dist_tags: BTreeMap<String, String>,
	#[serde(default)]
	pub versions: BTreeMap<String, Manifest>,
}

impl Packument {
	pub fn new(name: impl Into<String>) -> Self {
		Self { name: name.into(), ..Default::default() }
	}

	/// Adds a version, the highest one added becomes `latest` unless tagged otherwise.
	pub fn add(&mut self, manifest: Manifest) {
		let version = manifest.version.clone().unwrap_or_default();
		let newer = match (self.dist_tags.get("latest").and_then(|l| parse_version(l)), parse_version(&version)) {
			(Some(latest), Some(v)) => v > latest,
			_ => true,
		};
		if newer {
			self.dist_tags.insert(String::from("latest"), version.clone());
		}
		self.versions.insert(version, manifest);
	}

	pub fn tag(&mut self, tag: &str, version: &str) {
		self.dist_tags.insert(tag.to_string(), version.to_string());
	}

	/// Chooses the version a specifier resolves to.
	///
	/// Tags resolve directly. For ranges the `latest` tag wins when it satisfies, otherwise the
	/// highest satisfying version. Versions inside `avoid` are passed over while there is any
	/// alternative.
	pub fn pick(&self, spec: &Specifier, avoid: &[VersionReq]) -> Option<&Manifest> {
		if let SpecKind::Tag(tag) = spec.kind() {
			return self.dist_tags.get(tag).and_then(|v| self.versions.get(v));
		}
		let range = spec.range()?;
		let mut candidates: Vec<(Version, &Manifest)> = self.versions.iter()
			.filter_map(|(v, m)| parse_version(v).map(|v| (v, m)))
			.filter(|(v, _)| range.matches(v))
			.collect();
		candidates.sort_by(|a, b| b.0.cmp(&a.0));

		let latest = self.dist_tags.get("latest").and_then(|l| parse_version(l));
		let safe = |v: &Version| !is_vulnerable(v, avoid);
		if let Some(latest) = latest {
			if let Some((_, m)) = candidates.iter().find(|(v, _)| *v == latest && safe(v)) {
				return Some(m);
			}
		}
		candidates.iter()
			.find(|(v, _)| safe(v))
			.or_else(|| candidates.first())
			.map(|(_, m)| *m)
	}
}

/// Copies the `dist` location of a registry manifest into its resolved fields.
pub fn with_dist(mut manifest: Manifest) -> Manifest {
	if let Some(dist) = manifest.dist.clone() {
		if manifest.resolved.is_none() {
			manifest.resolved = dist.tarball;
		}
		if manifest.integrity.is_none() {
			manifest.integrity = dist.integrity;
		}
	}
	manifest
}

/// Reads the manifest of a `file:` specifier, either a folder or a tarball.
pub fn fetch_local(base: &Path, path: &str) -> Result<Manifest, FetchError> {
	let path = normalize_path(&base.join(path));
	if path.is_file() {
		let mut manifest = read_tarball_manifest(&path)?;
		manifest.resolved = Some(format!("file:{}", path.display()));
		return Ok(manifest);
	}
	match Manifest::read_from_dir(&path) {
		Ok(manifest) => Ok(manifest),
		Err(crate::Error::IO(e)) if e.kind() == std::io::ErrorKind::NotFound => Err(FetchError::NotFound(path.display().to_string())),
		Err(crate::Error::IO(e)) => Err(e.into()),
		Err(crate::Error::SerdeJSON(e)) => Err(e.into()),
		Err(e) => Err(FetchError::Failed { name: path.display().to_string(), spec: String::from("file:"), reason: e.to_string() }),
	}
}

/// The `package.json` inside a `.tgz`.
pub fn read_tarball_manifest(path: &Path) -> Result<Manifest, FetchError> {
	let file = std::fs::File::open(path)?;
	let mut archive = tar::Archive::new(flate2::read::GzDecoder::new(file));
	for entry in archive.entries()? {
		let mut entry = entry?;
		let is_manifest = strip_package_dir(&entry.path()?).map(|p| p == Path::new("package.json")).unwrap_or(false);
		if is_manifest {
			let mut text = String::new();
			entry.read_to_string(&mut text)?;
			return Ok(serde_json::from_str(&text)?);
		}
	}
	Err(FetchError::NotFound(format!("package.json in {}", path.display())))
}

/// Drops the leading folder every entry of a package tarball sits in, rejecting entries that
/// would escape the destination.
fn strip_package_dir(path: &Path) -> Option<PathBuf> {
	let mut components = path.components();
	components.next()?;
	let rest: PathBuf = components.collect();
	if rest.as_os_str().is_empty() || rest.components().any(|c| !matches!(c, Component::Normal(_))) {
		return None;
	}
	Some(rest)
}

/// Unpacks a gzipped package tarball into `destination`.
pub fn unpack_tarball(reader: impl Read, destination: &Path) -> std::io::Result<()> {
	let mut archive = tar::Archive::new(flate2::read::GzDecoder::new(reader));
	for entry in archive.entries()? {
		let mut entry = entry?;
		let rel = match strip_package_dir(&entry.path()?) {
			Some(rel) => rel,
			None => continue,
		};
		let target = destination.join(rel);
		if let Some(parent) = target.parent() {
			std::fs::create_dir_all(parent)?;
		}
		entry.unpack(&target)?;
	}
	Ok(())
}

/// Fetches manifests from an npm compatible registry.
pub struct RegistryFetcher {
	client: reqwest::Client,
	registry: String,
	packuments: tokio::sync::Mutex<HashMap<String, Arc<Packument>>>,
}

impl RegistryFetcher {
	/// # Errors
	/// [`FetchError::Reqwest`] when the http client can't be created.
	pub fn new(options: &ArborOptions) -> Result<Self, FetchError> {
		let client = reqwest::Client::builder()
			.https_only(options.https_only())
			.build()?;
		Ok(Self {
			client,
			registry: options.registry().trim_end_matches('/').to_string(),
			packuments: tokio::sync::Mutex::new(HashMap::new()),
		})
	}

	async fn packument(&self, name: &str) -> Result<Arc<Packument>, FetchError> {
		if let Some(p) = self.packuments.lock().await.get(name) {
			return Ok(p.clone());
		}
		let url = format!("{}/{}", self.registry, name.replace('/', "%2f"));
		log::debug!("Fetching packument {}", url);
		let response = self.client.get(&url)
			.header(reqwest::header::ACCEPT, "application/vnd.npm.install-v1+json; q=1.0, application/json; q=0.8")
			.send()
			.await?;
		if response.status() == reqwest::StatusCode::NOT_FOUND {
			return Err(FetchError::NotFound(name.to_string()));
		}
		let packument: Arc<Packument> = Arc::new(response.error_for_status()?.json().await?);
		self.packuments.lock().await.insert(name.to_string(), packument.clone());
		Ok(packument)
	}
}

#[async_trait]
impl ManifestFetcher for RegistryFetcher {
	async fn fetch(&self, request: &FetchRequest) -> Result<Manifest, FetchError> {
		match request.spec.kind() {
			SpecKind::Range(_) | SpecKind::Tag(_) | SpecKind::Alias { .. } => {
				let name = request.spec.fetch_name(&request.name);
				let packument = self.packument(name).await?;
				let manifest = packument.pick(&request.spec, &request.avoid)
					.ok_or_else(|| FetchError::NoMatchingVersion { name: name.to_string(), spec: request.spec.to_string() })?;
				Ok(with_dist(manifest.clone()))
			},
			SpecKind::File(path) | SpecKind::Link(path) => fetch_local(&request.base, path),
			SpecKind::Remote(raw) => Err(FetchError::Unsupported(raw.clone())),
		}
	}
}

/// Extracts package tarballs, downloaded ones are cached by url.
pub struct TarballExtractor {
	client: reqwest::Client,
	cache_dir: PathBuf,
}

impl TarballExtractor {
	/// # Errors
	/// [`ExtractError::Reqwest`] when the http client can't be created.
	pub fn new(options: &ArborOptions) -> Result<Self, ExtractError> {
		let client = reqwest::Client::builder()
			.https_only(options.https_only())
			.build()?;
		Ok(Self { client, cache_dir: options.cache_dir().to_path_buf() })
	}

	fn cache_path(&self, url: &str) -> PathBuf {
		self.cache_dir.join(sha256::digest(url.as_bytes()) + ".tgz")
	}

	async fn download(&self, url: &str) -> Result<PathBuf, ExtractError> {
		let path = self.cache_path(url);
		if path.exists() {
			log::trace!("Using cached {}", url);
			return Ok(path);
		}
		log::info!("Downloading {}", url);
		let content = self.client.get(url)
			.send()
			.await?
			.error_for_status()?
			.bytes()
			.await?;
		tokio::fs::create_dir_all(&self.cache_dir).await?;
		let partial = path.with_extension("part");
		tokio::fs::write(&partial, &content).await?;
		tokio::fs::rename(&partial, &path).await?;
		Ok(path)
	}
}

#[async_trait]
impl Extractor for TarballExtractor {
	async fn extract(&self, resolved: &str, _integrity: Option<&str>, destination: &Path) -> Result<(), ExtractError> {
		let tarball = if let Some(path) = resolved.strip_prefix("file:") {
			let path = PathBuf::from(path);
			if !path.is_file() {
				return Err(ExtractError::UnsupportedLocator(resolved.to_string()));
			}
			path
		} else if resolved.starts_with("https://") || resolved.starts_with("http://") {
			self.download(resolved).await?
		} else {
			return Err(ExtractError::UnsupportedLocator(resolved.to_string()));
		};

		let destination = destination.to_path_buf();
		tokio::task::spawn_blocking(move || {
			let file = std::fs::File::open(&tarball)?;
			std::fs::create_dir_all(&destination)?;
			unpack_tarball(file, &destination)
		})
		.await
		.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))??;
		Ok(())
	}
}

/// Runs no lifecycle scripts, only links binaries.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopScripts;

#[async_trait]
impl ScriptRunner for NoopScripts {
	async fn run_lifecycle(&self, target: &BuildTarget, event: &str) -> Result<(), ScriptError> {
		log::debug!("Not running {} script of {}", event, target.name);
		Ok(())
	}

	async fn link_binaries(&self, target: &BuildTarget) -> Result<(), ScriptError> {
		link_bins(target).await
	}
}

/// Links each `bin` entry of the target's manifest into its `.bin` folder.
pub async fn link_bins(target: &BuildTarget) -> Result<(), ScriptError> {
	let bins = target.manifest.bin_map();
	if bins.is_empty() {
		return Ok(());
	}
	tokio::fs::create_dir_all(&target.bin_dir).await?;
	for (name, rel) in bins {
		let file = normalize_path(&target.path.join(&rel));
		if !file.starts_with(&target.path) {
			return Err(ScriptError::Failed {
				name: target.name.clone(),
				event: String::from("bin"),
				message: format!("{} points outside of the package", rel),
			});
		}
		let link = target.bin_dir.join(&name);
		if tokio::fs::symlink_metadata(&link).await.is_ok() {
			tokio::fs::remove_file(&link).await?;
		}
		let relative = pathdiff::diff_paths(&file, &target.bin_dir).unwrap_or_else(|| file.clone());
		symlink_file(&relative, &link).await?;
		make_executable(&file).await;
		log::trace!("Linked {} to {}", link.display(), relative.display());
	}
	Ok(())
}

#[cfg(unix)]
async fn symlink_file(target: &Path, link: &Path) -> std::io::Result<()> {
	tokio::fs::symlink(target, link).await
}

#[cfg(windows)]
async fn symlink_file(target: &Path, link: &Path) -> std::io::Result<()> {
	tokio::fs::symlink_file(target, link).await
}

#[cfg(unix)]
async fn make_executable(file: &Path) {
	use std::os::unix::fs::PermissionsExt;
	if let Ok(meta) = tokio::fs::metadata(file).await {
		let mut permissions = meta.permissions();
		permissions.set_mode(permissions.mode() | 0o111);
		if let Err(e) = tokio::fs::set_permissions(file, permissions).await {
			log::debug!("Unable to make {} executable: {}", file.display(), e);
		}
	}
}

#[cfg(windows)]
async fn make_executable(_file: &Path) {}

#[cfg(test)]
mod test {
	use super::*;

	fn packument() -> Packument {
		let mut p = Packument::new("b");
		for v in ["1.0.0", "1.1.0", "1.2.0", "2.0.0"] {
			p.add(Manifest::new("b", v));
		}
		p
	}

	fn picked(p: &Packument, spec: &str, avoid: &[VersionReq]) -> Option<String> {
		p.pick(&Specifier::parse(spec).unwrap(), avoid).and_then(|m| m.version.clone())
	}

	#[test]
	fn prefers_latest_then_highest() {
		let mut p = packument();
		assert_eq!(picked(&p, "^1.0.0", &[]).as_deref(), Some("1.2.0"));
		assert_eq!(picked(&p, "*", &[]).as_deref(), Some("2.0.0"));
		p.tag("latest", "1.1.0");
		assert_eq!(picked(&p, "*", &[]).as_deref(), Some("1.1.0"));
		assert_eq!(picked(&p, "^2", &[]).as_deref(), Some("2.0.0"));
		assert_eq!(picked(&p, "^3", &[]), None);
	}

	#[test]
	fn tags_resolve_directly() {
		let mut p = packument();
		p.tag("next", "2.0.0");
		assert_eq!(picked(&p, "next", &[]).as_deref(), Some("2.0.0"));
		assert_eq!(picked(&p, "beta", &[]), None);
	}

	#[test]
	fn vulnerable_versions_are_avoided_when_possible() {
		let p = packument();
		let avoid = vec![VersionReq::parse_from_npm(">=1.2.0 <2.0.0").unwrap()];
		assert_eq!(picked(&p, "^1.0.0", &avoid).as_deref(), Some("1.1.0"));
		let all = vec![VersionReq::parse_from_npm("*").unwrap()];
		assert_eq!(picked(&p, "^1.0.0", &all).as_deref(), Some("1.2.0"));
	}

	#[test]
	fn package_dir_is_stripped() {
		assert_eq!(strip_package_dir(Path::new("package/lib/index.js")), Some(PathBuf::from("lib/index.js")));
		assert_eq!(strip_package_dir(Path::new("package")), None);
		assert_eq!(strip_package_dir(Path::new("package/../../etc/passwd")), None);
	}

	#[test]
	fn tarballs_round_trip_through_the_extractor_format() {
		let tmp = tempfile::tempdir().unwrap();
		let tgz = tmp.path().join("a.tgz");
		{
			let file = std::fs::File::create(&tgz).unwrap();
			let mut builder = tar::Builder::new(flate2::write::GzEncoder::new(file, flate2::Compression::default()));
			let manifest = serde_json::to_vec(&Manifest::new("a", "1.0.0")).unwrap();
			let mut header = tar::Header::new_gnu();
			header.set_size(manifest.len() as u64);
			header.set_mode(0o644);
			header.set_cksum();
			builder.append_data(&mut header, "package/package.json", manifest.as_slice()).unwrap();
			builder.into_inner().unwrap().finish().unwrap();
		}

		let manifest = fetch_local(tmp.path(), "./a.tgz").unwrap();
		assert_eq!(manifest.version.as_deref(), Some("1.0.0"));
		assert!(manifest.resolved.as_deref().unwrap().starts_with("file:"));

		let out = tmp.path().join("out");
		unpack_tarball(std::fs::File::open(&tgz).unwrap(), &out).unwrap();
		assert_eq!(Manifest::read_from_dir(&out).unwrap().name.as_deref(), Some("a"));
	}
}
