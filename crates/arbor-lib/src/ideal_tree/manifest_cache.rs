//! Shared manifest fetches for one build.

use std::collections::HashMap;
use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::{Mutex, OnceCell};

use crate::collaborators::{FetchRequest, ManifestFetcher};
use crate::manifest::Manifest;

type Slot = Arc<OnceCell<Result<Manifest, String>>>;

/// Caches fetch results by [`FetchRequest::cache_key()`].
///
/// Concurrent requests for the same key wait on a single fetch. Failures are cached as their
/// message, a failed fetch is not retried within a build.
pub struct ManifestCache {
	fetcher: Arc<dyn ManifestFetcher>,
	slots: Mutex<HashMap<String, Slot>>,
}

impl ManifestCache {
	pub fn new(fetcher: Arc<dyn ManifestFetcher>) -> Self {
		Self { fetcher, slots: Mutex::new(HashMap::new()) }
	}

	pub async fn get(&self, request: &FetchRequest) -> Result<Manifest, String> {
		let slot = {
			let mut slots = self.slots.lock().await;
			slots.entry(request.cache_key()).or_default().clone()
		};
		slot.get_or_init(|| async {
			log::trace!("Fetching manifest for {}@{}", request.name, request.spec);
			self.fetcher.fetch(request).await.map_err(|e| e.to_string())
		}).await.clone()
	}

	/// Fetches everything in `requests` with at most `width` fetches in flight.
	pub async fn prefetch(&self, requests: &[FetchRequest], width: usize) {
		futures::stream::iter(requests)
			.map(|r| self.get(r))
			.buffer_unordered(width.max(1))
			.for_each(|_| async {})
			.await;
	}

	/// Number of distinct requests seen so far.
	pub async fn len(&self) -> usize {
		self.slots.lock().await.len()
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use std::sync::atomic::{AtomicUsize, Ordering};
	use async_trait::async_trait;
	use crate::collaborators::FetchError;
	use crate::version::Specifier;

	struct Counting(AtomicUsize);

	#[async_trait]
	impl ManifestFetcher for Counting {
		async fn fetch(&self, request: &FetchRequest) -> Result<Manifest, FetchError> {
			self.0.fetch_add(1, Ordering::SeqCst);
			tokio::task::yield_now().await;
			if request.name == "missing" {
				return Err(FetchError::NotFound(request.name.clone()));
			}
			Ok(Manifest::new(&request.name, "1.0.0"))
		}
	}

	#[tokio::test]
	async fn duplicate_fetches_collapse() {
		let fetcher = Arc::new(Counting(AtomicUsize::new(0)));
		let cache = ManifestCache::new(fetcher.clone());
		let request = FetchRequest::new("a", Specifier::parse_lossy("^1"), "/p");
		let requests = vec![request.clone(), request.clone(), request.clone()];
		cache.prefetch(&requests, 3).await;
		assert_eq!(cache.get(&request).await.unwrap().name.as_deref(), Some("a"));
		assert_eq!(fetcher.0.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn failures_are_cached() {
		let fetcher = Arc::new(Counting(AtomicUsize::new(0)));
		let cache = ManifestCache::new(fetcher.clone());
		let request = FetchRequest::new("missing", Specifier::parse_lossy("^1"), "/p");
		assert!(cache.get(&request).await.is_err());
		assert!(cache.get(&request).await.is_err());
		assert_eq!(fetcher.0.load(Ordering::SeqCst), 1);
		assert_eq!(cache.len().await, 1);
	}
}
