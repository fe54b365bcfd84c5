//! Collaborators the engine talks to. Implementations live elsewhere (the
//! relational store, the embedding service, the LLM gateway); `memory`
//! provides an in-process one for every trait here.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::ClusterError;
use crate::types::{ClusterSource, EvidenceSource, Item, Link, SimilarMessage};

#[async_trait]
pub trait ClusterRepository: Send + Sync {
	/// Delete every cluster for the window regardless of source. Must
	/// succeed on an empty window.
	async fn delete_clusters_for_window(
		&self,
		start: DateTime<Utc>,
		end: DateTime<Utc>,
	) -> Result<(), ClusterError>;

	/// Delete clusters for exactly this window and source.
	async fn delete_clusters_for_window_and_source(
		&self,
		start: DateTime<Utc>,
		end: DateTime<Utc>,
		source: ClusterSource,
	) -> Result<(), ClusterError>;

	async fn create_cluster_with_source(
		&self,
		start: DateTime<Utc>,
		end: DateTime<Utc>,
		topic: &str,
		source: ClusterSource,
	) -> Result<String, ClusterError>;

	/// Create a digest cluster.
	async fn create_cluster(
		&self,
		start: DateTime<Utc>,
		end: DateTime<Utc>,
		topic: &str,
	) -> Result<String, ClusterError> {
		self.create_cluster_with_source(start, end, topic, ClusterSource::Digest)
			.await
	}

	async fn add_to_cluster(&self, cluster_id: &str, item_id: &str) -> Result<(), ClusterError>;

	/// `Ok(None)` for a missing key.
	async fn get_setting(&self, key: &str) -> Result<Option<serde_json::Value>, ClusterError>;

	/// Items without evidence are simply absent from the map.
	async fn get_evidence_for_items(
		&self,
		item_ids: &[String],
	) -> Result<HashMap<String, Vec<EvidenceSource>>, ClusterError>;
}

#[async_trait]
pub trait ItemEmbeddings: Send + Sync {
	/// Fetch a stored embedding for an item whose vector was not loaded with
	/// it. `Ok(None)` when the item has none.
	async fn get_item_embedding(&self, item_id: &str) -> Result<Option<Vec<f32>>, ClusterError>;
}

#[async_trait]
pub trait LlmClient: Send + Sync {
	async fn generate_cluster_topic(
		&self,
		items: &[Item],
		language: &str,
		model: &str,
	) -> Result<String, ClusterError>;

	async fn get_links_for_message(&self, raw_message_id: &str) -> Result<Vec<Link>, ClusterError>;
}

#[async_trait]
pub trait DedupStore: Send + Sync {
	/// Id of an accepted message with the same content hash and a different
	/// id, if any.
	async fn find_by_content_hash(
		&self,
		hash: &str,
		exclude_id: &str,
	) -> Result<Option<String>, ClusterError>;

	/// Most similar accepted message since `since`, other than
	/// `exclude_id`, whose similarity exceeds `threshold`.
	async fn find_similar_message(
		&self,
		embedding: &[f32],
		threshold: f64,
		since: DateTime<Utc>,
		exclude_id: &str,
	) -> Result<Option<SimilarMessage>, ClusterError>;
}
