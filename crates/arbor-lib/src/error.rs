//! Library error type.

pub type Result<T> = std::result::Result<T, Error>;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
	#[error("IO error: {0}")]
	IO(#[from] std::io::Error),
	#[error("JSON error: {0}")]
	SerdeJSON(#[from] serde_json::Error),
	#[error("parsing error: {0}")]
	Parse(String),
	#[error("graph error: {0}")]
	Graph(#[from] crate::graph::GraphError),
	#[error("placement error: {0}")]
	Placement(#[from] crate::placement::PlacementError),
	#[error("fetch error: {0}")]
	Fetch(#[from] crate::collaborators::FetchError),
	#[error("extract error: {0}")]
	Extract(#[from] crate::collaborators::ExtractError),
	#[error("script error: {0}")]
	Script(#[from] crate::collaborators::ScriptError),
	#[error("lockfile error: {0}")]
	Lockfile(#[from] crate::lockfile::LockfileError),
	#[error("reify error: {0}")]
	Reify(#[from] crate::reify::ReifyError),
	#[error("tree invariants violated: {}", .0.iter().map(|v| v.to_string()).collect::<Vec<_>>().join("; "))]
	Invariant(Vec<crate::graph::Violation>),
}
