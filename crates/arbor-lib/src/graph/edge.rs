use std::path::{Component, Path, PathBuf};

use super::{Graph, NodeId, EdgeId};
use crate::version::{SpecKind, Specifier};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EdgeType {
	Prod,
	Dev,
	Optional,
	Peer,
	PeerOptional,
	Workspace,
}

impl EdgeType {
	pub fn is_peer(self) -> bool {
		matches!(self, EdgeType::Peer | EdgeType::PeerOptional)
	}

	/// A missing target is not an error for these.
	pub fn is_optional(self) -> bool {
		matches!(self, EdgeType::Optional | EdgeType::PeerOptional)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EdgeError {
	Missing,
	Invalid,
	/// A peer dependency resolved to a copy nested inside its own dependent.
	PeerLocal,
	/// The originating node is no longer part of any tree.
	Detached,
}

/// `from` requires `name` at `spec`.
#[derive(Debug, Clone)]
pub struct Edge {
	pub(crate) from: NodeId,
	pub(crate) name: String,
	pub(crate) spec: Specifier,
	pub(crate) edge_type: EdgeType,
	pub(crate) to: Option<NodeId>,
	pub(crate) error: Option<EdgeError>,
	pub(crate) detached: bool,
}

impl Edge {
	pub fn from(&self) -> NodeId {
		self.from
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	pub fn spec(&self) -> &Specifier {
		&self.spec
	}

	pub fn edge_type(&self) -> EdgeType {
		self.edge_type
	}

	pub fn to(&self) -> Option<NodeId> {
		self.to
	}

	pub fn error(&self) -> Option<EdgeError> {
		self.error
	}

	pub fn valid(&self) -> bool {
		self.error.is_none()
	}

	pub fn missing(&self) -> bool {
		self.error == Some(EdgeError::Missing)
	}

	pub fn invalid(&self) -> bool {
		self.error == Some(EdgeError::Invalid)
	}

	pub fn peer_local(&self) -> bool {
		self.error == Some(EdgeError::PeerLocal)
	}

	pub fn peer(&self) -> bool {
		self.edge_type.is_peer()
	}

	pub fn optional(&self) -> bool {
		self.edge_type.is_optional()
	}

	pub fn dev(&self) -> bool {
		self.edge_type == EdgeType::Dev
	}

	pub fn workspace(&self) -> bool {
		self.edge_type == EdgeType::Workspace
	}
}

impl std::fmt::Display for Edge {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{:?} {}@{}", self.edge_type, self.name, self.spec)
	}
}

/// Lexically removes `.` and `..` segments.
pub(crate) fn normalize_path(path: &Path) -> PathBuf {
	let mut out = PathBuf::new();
	for c in path.components() {
		match c {
			Component::CurDir => {},
			Component::ParentDir => { out.pop(); },
			other => out.push(other.as_os_str()),
		}
	}
	out
}

impl Graph {
	/// Whether `node` would satisfy `edge` if it were its target.
	pub fn satisfied_by(&self, edge: EdgeId, node: NodeId) -> bool {
		let edge = self.edge(edge);
		self.spec_satisfied_by(edge.from, &edge.name, &edge.spec, node)
	}

	/// The check behind [`satisfied_by()`](Graph::satisfied_by()) for edges that don't exist yet.
	pub fn spec_satisfied_by(&self, from: NodeId, name: &str, spec: &Specifier, node: NodeId) -> bool {
		let candidate = self.node(node);
		if candidate.name != name {
			return false;
		}

		// version checks look through links
		let content = match candidate.target() {
			Some(t) => self.node(t),
			None => candidate,
		};

		match spec.kind() {
			SpecKind::Range(range) => content.version.as_ref().map(|v| range.matches(v)).unwrap_or(false),
			SpecKind::Tag(_) => !candidate.is_link() || candidate.target().is_some(),
			SpecKind::Alias { name: real, range } => {
				content.package_name() == real && content.version.as_ref().map(|v| range.matches(v)).unwrap_or(false)
			},
			SpecKind::File(p) | SpecKind::Link(p) => {
				let wanted = normalize_path(&self.node(from).realpath.join(p));
				if candidate.is_link() {
					normalize_path(&candidate.realpath) == wanted
				} else {
					match candidate.resolved.as_deref() {
						Some(r) => {
							let r = r.strip_prefix("file:").unwrap_or(r);
							normalize_path(&self.node(from).realpath.join(r)) == wanted || r == spec.raw()
						},
						None => false,
					}
				}
			},
			SpecKind::Remote(raw) => candidate.resolved.as_deref().map(|r| r == raw || r.starts_with(raw.as_str())).unwrap_or(false),
		}
	}

	/// Recomputes the target and validity of an edge.
	pub fn reload_edge(&mut self, id: EdgeId) {
		let (from, name, detached, old_to) = {
			let e = self.edge(id);
			(e.from, e.name.clone(), e.detached, e.to)
		};
		let new_to = if detached || self.node(from).deleted {
			None
		} else {
			self.resolve(from, &name)
		};

		if new_to != old_to {
			if let Some(old) = old_to {
				self.node_mut(old).edges_in.remove(&id);
			}
			if let Some(new) = new_to {
				self.node_mut(new).edges_in.insert(id);
			}
			self.edge_mut(id).to = new_to;
		}

		let error = if detached {
			Some(EdgeError::Detached)
		} else {
			self.edge_error(id)
		};
		self.edge_mut(id).error = error;
	}

	fn edge_error(&self, id: EdgeId) -> Option<EdgeError> {
		let e = self.edge(id);
		match e.to {
			None if e.edge_type.is_optional() => None,
			None => Some(EdgeError::Missing),
			Some(to) => {
				let from = self.node(e.from);
				if e.edge_type.is_peer() && self.node(to).parent == Some(e.from) && !from.is_top() {
					Some(EdgeError::PeerLocal)
				} else if !self.satisfied_by(id, to) {
					Some(EdgeError::Invalid)
				} else {
					None
				}
			},
		}
	}
}
