//! Dependency specifiers and version comparisons.
//!
//! Ranges, tags and versions are parsed with npm semantics through `deno_semver`.

use std::sync::OnceLock;

pub use deno_semver::Version;
pub use deno_semver::VersionReq;
use regex::Regex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpecKind {
	/// A semver range such as `^1.2.0` or `1 || 2`.
	Range(VersionReq),
	/// A dist-tag such as `latest`.
	Tag(String),
	/// `npm:<name>@<range>`, installs `name` under a different folder name.
	Alias { name: String, range: VersionReq },
	/// A local directory or tarball.
	File(String),
	/// A local directory that must be symlinked.
	Link(String),
	/// Git and url specifiers, compared by their resolved string only.
	Remote(String),
}

/// What a dependent wrote for one dependency.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Specifier {
	raw: String,
	kind: SpecKind,
}

fn alias_regex() -> &'static Regex {
	static RE: OnceLock<Regex> = OnceLock::new();
	RE.get_or_init(|| Regex::new(r"^npm:(@?[^@]+)(?:@(.*))?$").expect("alias regex is valid"))
}

fn remote_regex() -> &'static Regex {
	static RE: OnceLock<Regex> = OnceLock::new();
	RE.get_or_init(|| {
		Regex::new(r"^(?:git\+[a-z]+://|git://|github:|gitlab:|bitbucket:|https?://|[A-Za-z0-9_.-]+/[A-Za-z0-9_.-]+(?:#.*)?$)")
			.expect("remote regex is valid")
	})
}

fn path_regex() -> &'static Regex {
	static RE: OnceLock<Regex> = OnceLock::new();
	RE.get_or_init(|| Regex::new(r"^(?:\.{1,2}/|/|~/|\.{1,2}$)").expect("path regex is valid"))
}

fn parse_req(text: &str) -> crate::Result<VersionReq> {
	let text = if text.trim().is_empty() { "*" } else { text.trim() };
	VersionReq::parse_from_npm(text)
		.map_err(|e| crate::Error::Parse(format!("invalid version range \"{}\": {}", text, e)))
}

impl Specifier {
	/// Classifies a raw dependency specifier.
	///
	/// # Errors
	/// [`Parse`](crate::Error::Parse) when it looks like a range but is not one.
	pub fn parse(raw: &str) -> crate::Result<Self> {
		let trimmed = raw.trim();
		let kind = if let Some(caps) = alias_regex().captures(trimmed) {
			let name = caps[1].to_string();
			let range = parse_req(caps.get(2).map(|m| m.as_str()).unwrap_or("*"))?;
			SpecKind::Alias { name, range }
		} else if let Some(path) = trimmed.strip_prefix("file:") {
			SpecKind::File(path.to_string())
		} else if let Some(path) = trimmed.strip_prefix("link:") {
			SpecKind::Link(path.to_string())
		} else if path_regex().is_match(trimmed) {
			SpecKind::File(trimmed.to_string())
		} else if remote_regex().is_match(trimmed) {
			SpecKind::Remote(trimmed.to_string())
		} else {
			let req = parse_req(trimmed)?;
			match req.tag() {
				Some(tag) => SpecKind::Tag(tag.to_string()),
				None => SpecKind::Range(req),
			}
		};
		Ok(Self { raw: raw.to_string(), kind })
	}

	/// Never fails, unparsable specifiers become opaque remote specifiers.
	pub fn parse_lossy(raw: &str) -> Self {
		Self::parse(raw).unwrap_or_else(|_| Self { raw: raw.to_string(), kind: SpecKind::Remote(raw.to_string()) })
	}

	pub fn raw(&self) -> &str {
		&self.raw
	}

	pub fn kind(&self) -> &SpecKind {
		&self.kind
	}

	/// Ranges, tags and aliases are fetched from a registry.
	pub fn is_registry(&self) -> bool {
		matches!(self.kind, SpecKind::Range(_) | SpecKind::Tag(_) | SpecKind::Alias { .. })
	}

	/// The package name to fetch, which differs from the folder name for aliases.
	pub fn fetch_name<'a>(&'a self, name: &'a str) -> &'a str {
		match &self.kind {
			SpecKind::Alias { name, .. } => name,
			_ => name,
		}
	}

	/// Version range this specifier constrains to, if any.
	pub fn range(&self) -> Option<&VersionReq> {
		match &self.kind {
			SpecKind::Range(r) | SpecKind::Alias { range: r, .. } => Some(r),
			_ => None,
		}
	}

	/// Whether a version is acceptable, ignoring package identity.
	/// Tags accept anything, the registry already chose for them.
	pub fn matches_version(&self, version: &Version) -> bool {
		match &self.kind {
			SpecKind::Range(r) | SpecKind::Alias { range: r, .. } => r.matches(version),
			SpecKind::Tag(_) => true,
			_ => false,
		}
	}
}

impl std::fmt::Display for Specifier {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(&self.raw)
	}
}

pub fn parse_version(text: &str) -> Option<Version> {
	Version::parse_from_npm(text).ok()
}

/// Whether `version` falls inside any of the given vulnerable ranges.
pub fn is_vulnerable(version: &Version, ranges: &[VersionReq]) -> bool {
	ranges.iter().any(|r| r.matches(version))
}

#[cfg(test)]
mod test {
	use super::*;

	fn v(s: &str) -> Version {
		Version::parse_from_npm(s).unwrap()
	}

	#[test]
	fn classifies_ranges() {
		assert!(matches!(Specifier::parse("^1.0.0").unwrap().kind(), SpecKind::Range(_)));
		assert!(matches!(Specifier::parse("1 || 2").unwrap().kind(), SpecKind::Range(_)));
		assert!(matches!(Specifier::parse("").unwrap().kind(), SpecKind::Range(_)));
	}

	#[test]
	fn classifies_tags() {
		assert_eq!(Specifier::parse("latest").unwrap().kind(), &SpecKind::Tag("latest".into()));
	}

	#[test]
	fn classifies_alias() {
		let s = Specifier::parse("npm:real-name@^2").unwrap();
		assert_eq!(s.fetch_name("folder"), "real-name");
		assert!(s.matches_version(&v("2.3.0")));
		assert!(!s.matches_version(&v("3.0.0")));
	}

	#[test]
	fn classifies_paths_and_remotes() {
		assert_eq!(Specifier::parse("file:../x").unwrap().kind(), &SpecKind::File("../x".into()));
		assert_eq!(Specifier::parse("./x").unwrap().kind(), &SpecKind::File("./x".into()));
		assert_eq!(Specifier::parse("link:../y").unwrap().kind(), &SpecKind::Link("../y".into()));
		assert!(matches!(Specifier::parse("user/repo#main").unwrap().kind(), SpecKind::Remote(_)));
		assert!(matches!(Specifier::parse("https://x.org/a.tgz").unwrap().kind(), SpecKind::Remote(_)));
	}

	#[test]
	fn range_matching() {
		let s = Specifier::parse("1.x").unwrap();
		assert!(s.matches_version(&v("1.2.0")));
		assert!(!s.matches_version(&v("2.0.0")));
		assert!(Specifier::parse("1.0.0").unwrap().matches_version(&v("1.0.0")));
		assert!(!Specifier::parse("1.0.0").unwrap().matches_version(&v("1.2.0")));
	}

	#[test]
	fn vulnerable_ranges() {
		let ranges = vec![VersionReq::parse_from_npm("<1.1.0").unwrap()];
		assert!(is_vulnerable(&v("1.0.5"), &ranges));
		assert!(!is_vulnerable(&v("1.1.0"), &ranges));
	}
}
