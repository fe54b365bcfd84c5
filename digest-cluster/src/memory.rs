// ---------------------------------------------------------------------------
// InMemoryStore — process-local implementation of every port
// ---------------------------------------------------------------------------
//
// Backs the operator binary and the tests. State sits behind one mutex; a
// poisoned lock is recovered since every write leaves the state consistent.
// ---------------------------------------------------------------------------

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::deduplication::{best_match, content_hash};
use crate::error::ClusterError;
use crate::evidence::EvidenceMap;
use crate::ports::{ClusterRepository, DedupStore, ItemEmbeddings};
use crate::types::{
	Cluster, ClusterMembership, ClusterSource, EvidenceSource, RawMessage, SimilarMessage,
};

struct StoredMessage {
	message: RawMessage,
	hash: String,
}

#[derive(Default)]
struct State {
	clusters: Vec<Cluster>,
	memberships: Vec<ClusterMembership>,
	settings: HashMap<String, serde_json::Value>,
	evidence: EvidenceMap,
	embeddings: HashMap<String, Vec<f32>>,
	messages: Vec<StoredMessage>,
}

#[derive(Default)]
pub struct InMemoryStore {
	state: Mutex<State>,
}

impl InMemoryStore {
	pub fn new() -> Self {
		Self::default()
	}

	fn lock(&self) -> MutexGuard<'_, State> {
		self.state.lock().unwrap_or_else(|e| e.into_inner())
	}

	// -- Seeding -------------------------------------------------------------

	pub fn set_setting(&self, key: &str, value: serde_json::Value) {
		self.lock().settings.insert(key.to_string(), value);
	}

	pub fn set_evidence(&self, item_id: &str, sources: Vec<EvidenceSource>) {
		self.lock().evidence.insert(item_id.to_string(), sources);
	}

	pub fn set_item_embedding(&self, item_id: &str, embedding: Vec<f32>) {
		self.lock().embeddings.insert(item_id.to_string(), embedding);
	}

	/// Record an accepted message for later duplicate checks.
	pub fn record_message(&self, message: RawMessage) {
		let hash = content_hash(&message.text);
		self.lock().messages.push(StoredMessage { message, hash });
	}

	// -- Inspection ----------------------------------------------------------

	pub fn clusters(&self) -> Vec<Cluster> {
		self.lock().clusters.clone()
	}

	pub fn memberships(&self) -> Vec<ClusterMembership> {
		self.lock().memberships.clone()
	}

	/// Member item ids of a cluster, in insertion order.
	pub fn members_of(&self, cluster_id: &str) -> Vec<String> {
		self.lock()
			.memberships
			.iter()
			.filter(|m| m.cluster_id == cluster_id)
			.map(|m| m.item_id.clone())
			.collect()
	}

	fn retain_clusters<F>(&self, mut keep: F)
	where
		F: FnMut(&Cluster) -> bool,
	{
		let mut state = self.lock();
		let (kept, removed): (Vec<Cluster>, Vec<Cluster>) =
			state.clusters.drain(..).partition(|c| keep(c));
		state.clusters = kept;
		if !removed.is_empty() {
			state
				.memberships
				.retain(|m| !removed.iter().any(|c| c.id == m.cluster_id));
		}
	}
}

#[async_trait]
impl ClusterRepository for InMemoryStore {
	async fn delete_clusters_for_window(
		&self,
		start: DateTime<Utc>,
		end: DateTime<Utc>,
	) -> Result<(), ClusterError> {
		self.retain_clusters(|c| !(c.start == start && c.end == end));
		Ok(())
	}

	async fn delete_clusters_for_window_and_source(
		&self,
		start: DateTime<Utc>,
		end: DateTime<Utc>,
		source: ClusterSource,
	) -> Result<(), ClusterError> {
		self.retain_clusters(|c| !(c.start == start && c.end == end && c.source == source));
		Ok(())
	}

	async fn create_cluster_with_source(
		&self,
		start: DateTime<Utc>,
		end: DateTime<Utc>,
		topic: &str,
		source: ClusterSource,
	) -> Result<String, ClusterError> {
		let id = Uuid::new_v4().to_string();
		self.lock().clusters.push(Cluster {
			id: id.clone(),
			start,
			end,
			topic: topic.to_string(),
			source,
			created_at: Utc::now(),
		});
		Ok(id)
	}

	async fn add_to_cluster(&self, cluster_id: &str, item_id: &str) -> Result<(), ClusterError> {
		let mut state = self.lock();
		if !state.clusters.iter().any(|c| c.id == cluster_id) {
			return Err(ClusterError::Storage(format!(
				"cluster not found: {}",
				cluster_id
			)));
		}
		let membership = ClusterMembership {
			cluster_id: cluster_id.to_string(),
			item_id: item_id.to_string(),
		};
		if !state.memberships.contains(&membership) {
			state.memberships.push(membership);
		}
		Ok(())
	}

	async fn get_setting(&self, key: &str) -> Result<Option<serde_json::Value>, ClusterError> {
		Ok(self.lock().settings.get(key).cloned())
	}

	async fn get_evidence_for_items(
		&self,
		item_ids: &[String],
	) -> Result<EvidenceMap, ClusterError> {
		let state = self.lock();
		Ok(item_ids
			.iter()
			.filter_map(|id| state.evidence.get(id).map(|e| (id.clone(), e.clone())))
			.collect())
	}
}

#[async_trait]
impl ItemEmbeddings for InMemoryStore {
	async fn get_item_embedding(&self, item_id: &str) -> Result<Option<Vec<f32>>, ClusterError> {
		Ok(self
			.lock()
			.embeddings
			.get(item_id)
			.filter(|e| !e.is_empty())
			.cloned())
	}
}

#[async_trait]
impl DedupStore for InMemoryStore {
	async fn find_by_content_hash(
		&self,
		hash: &str,
		exclude_id: &str,
	) -> Result<Option<String>, ClusterError> {
		Ok(self
			.lock()
			.messages
			.iter()
			.find(|m| m.hash == hash && m.message.id != exclude_id)
			.map(|m| m.message.id.clone()))
	}

	async fn find_similar_message(
		&self,
		embedding: &[f32],
		threshold: f64,
		since: DateTime<Utc>,
		exclude_id: &str,
	) -> Result<Option<SimilarMessage>, ClusterError> {
		let state = self.lock();
		let candidates = state
			.messages
			.iter()
			.filter(|m| m.message.id != exclude_id)
			.filter(|m| m.message.tg_date.is_none_or(|d| d >= since))
			.map(|m| (m.message.id.as_str(), m.message.embedding.as_slice()));
		Ok(best_match(embedding, candidates, threshold))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use chrono::TimeZone;

	fn window() -> (DateTime<Utc>, DateTime<Utc>) {
		(
			Utc.with_ymd_and_hms(2026, 6, 1, 0, 0, 0).unwrap(),
			Utc.with_ymd_and_hms(2026, 6, 1, 6, 0, 0).unwrap(),
		)
	}

	#[tokio::test]
	async fn delete_by_source_keeps_other_sources() {
		let store = InMemoryStore::new();
		let (start, end) = window();
		let digest = store.create_cluster(start, end, "A").await.unwrap();
		let research = store
			.create_cluster_with_source(start, end, "B", ClusterSource::Research)
			.await
			.unwrap();
		store.add_to_cluster(&digest, "i1").await.unwrap();
		store.add_to_cluster(&research, "i2").await.unwrap();

		store
			.delete_clusters_for_window_and_source(start, end, ClusterSource::Digest)
			.await
			.unwrap();
		let remaining = store.clusters();
		assert_eq!(remaining.len(), 1);
		assert_eq!(remaining[0].source, ClusterSource::Research);
		assert_eq!(store.memberships().len(), 1);

		store.delete_clusters_for_window(start, end).await.unwrap();
		assert!(store.clusters().is_empty());
		assert!(store.memberships().is_empty());
	}

	#[tokio::test]
	async fn delete_on_empty_window_is_ok() {
		let store = InMemoryStore::new();
		let (start, end) = window();
		assert!(store.delete_clusters_for_window(start, end).await.is_ok());
	}

	#[tokio::test]
	async fn membership_requires_cluster() {
		let store = InMemoryStore::new();
		let err = store.add_to_cluster("nope", "i1").await.unwrap_err();
		assert_eq!(err.code(), "CLUSTER_STORAGE");
	}

	#[tokio::test]
	async fn settings_and_evidence_lookups() {
		let store = InMemoryStore::new();
		store.set_setting("k", serde_json::json!(1));
		assert_eq!(store.get_setting("k").await.unwrap(), Some(serde_json::json!(1)));
		assert_eq!(store.get_setting("missing").await.unwrap(), None);

		store.set_evidence(
			"i1",
			vec![EvidenceSource {
				url: "https://x.com".into(),
				agreement_score: 0.9,
				is_contradiction: false,
			}],
		);
		let ev = store
			.get_evidence_for_items(&["i1".to_string(), "i2".to_string()])
			.await
			.unwrap();
		assert_eq!(ev.len(), 1);
		assert!(ev.contains_key("i1"));
	}

	#[tokio::test]
	async fn empty_stored_embedding_is_none() {
		let store = InMemoryStore::new();
		store.set_item_embedding("a", vec![]);
		store.set_item_embedding("b", vec![1.0]);
		assert_eq!(store.get_item_embedding("a").await.unwrap(), None);
		assert_eq!(store.get_item_embedding("b").await.unwrap(), Some(vec![1.0]));
		assert_eq!(store.get_item_embedding("c").await.unwrap(), None);
	}
}
