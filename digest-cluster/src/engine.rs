// ---------------------------------------------------------------------------
// ClusterEngine — one clustering run per digest window
// ---------------------------------------------------------------------------
//
// Run order:
//
//   1. load the run's config (static defaults + dynamic settings)
//   2. drop repeated item ids, cap the item count
//   3. delete stale clusters for [window, source]
//   4. canonical topic groups, embedding and evidence pre-passes
//   5. greedy build + coherence per anchor
//   6. persist clusters that meet the source's minimum size
//
// Every collaborator call is raced against the caller's cancellation token.
// Clusters already persisted when cancellation lands stay; the next run for
// the same window deletes and rebuilds them.
// ---------------------------------------------------------------------------

use std::collections::HashSet;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use futures::FutureExt;
use tokio_util::sync::CancellationToken;

use crate::builder::{BuiltCluster, ClusterBuilder, EmbeddingTable};
use crate::coherence::enforce_coherence;
use crate::config::{load_clustering_config, ClusteringConfig, ClusteringDefaults};
use crate::error::ClusterError;
use crate::evidence::EvidenceMap;
use crate::labeling::{label_cluster, order_members};
use crate::ports::{ClusterRepository, ItemEmbeddings, LlmClient};
use crate::topic::TopicGroups;
use crate::types::{ClusterRunSummary, ClusterSource, Item, PersistedCluster, RunWindow};

/// Await `fut` unless `cancel` fires first.
async fn until_cancelled<F: Future>(
	cancel: &CancellationToken,
	fut: F,
) -> Result<F::Output, ClusterError> {
	tokio::select! {
		biased;
		_ = cancel.cancelled() => Err(ClusterError::Cancelled),
		out = fut => Ok(out),
	}
}

struct Persisted {
	cluster: PersistedCluster,
	memberships_failed: usize,
	label_generated: bool,
}

#[derive(Default)]
struct BuildOutcome {
	clusters: Vec<BuiltCluster>,
	demoted: usize,
}

pub struct ClusterEngine {
	repo: Arc<dyn ClusterRepository>,
	embeddings: Option<Arc<dyn ItemEmbeddings>>,
	llm: Option<Arc<dyn LlmClient>>,
	defaults: ClusteringDefaults,
}

impl ClusterEngine {
	pub fn new(repo: Arc<dyn ClusterRepository>, defaults: ClusteringDefaults) -> Self {
		Self {
			repo,
			embeddings: None,
			llm: None,
			defaults,
		}
	}

	/// Fetch embeddings for items that arrive without one.
	pub fn with_embeddings(mut self, embeddings: Arc<dyn ItemEmbeddings>) -> Self {
		self.embeddings = Some(embeddings);
		self
	}

	/// Generate topic labels for multi-member clusters.
	pub fn with_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
		self.llm = Some(llm);
		self
	}

	// -- Run -----------------------------------------------------------------

	/// Cluster `items` for `window` and replace any clusters previously
	/// persisted for `[window, source]`.
	///
	/// Only cancellation, an empty or inverted window, and a failed
	/// cluster-row insert surface as errors. Lookup failures, a failed
	/// stale-cluster delete and failed membership writes are logged and
	/// skipped.
	pub async fn cluster_window(
		&self,
		window: RunWindow,
		source: ClusterSource,
		items: &[Item],
		cancel: &CancellationToken,
	) -> Result<ClusterRunSummary, ClusterError> {
		if cancel.is_cancelled() {
			return Err(ClusterError::Cancelled);
		}
		if window.end <= window.start {
			return Err(ClusterError::InvalidConfig(format!(
				"window end {} is not after start {}",
				window.end, window.start
			)));
		}

		let cfg = until_cancelled(
			cancel,
			load_clustering_config(self.repo.as_ref(), &self.defaults),
		)
		.await?;

		let mut summary = ClusterRunSummary::default();
		let mut items = unique_items(items);
		if items.len() > cfg.max_items {
			summary.items_truncated = items.len() - cfg.max_items;
			tracing::warn!(
				total = items.len(),
				limit = cfg.max_items,
				dropped = summary.items_truncated,
				"Too many items for one window, truncating"
			);
			items.truncate(cfg.max_items);
		}
		summary.items_considered = items.len();

		tracing::info!(
			start = %window.start,
			end = %window.end,
			source = %source,
			items = items.len(),
			"Clustering window"
		);

		match until_cancelled(
			cancel,
			self.repo
				.delete_clusters_for_window_and_source(window.start, window.end, source),
		)
		.await?
		{
			Ok(()) => {}
			Err(e) if e.is_cancelled() => return Err(e),
			Err(e) => {
				tracing::warn!(error = %e, source = %source, "Failed to delete stale clusters, continuing");
			}
		}

		if items.is_empty() {
			tracing::info!(source = %source, "No items in window");
			return Ok(summary);
		}

		let groups = TopicGroups::build(&items);
		summary.topic_groups = groups.len();

		let embeddings = self.load_embeddings(&items, cancel).await?;
		let evidence = if cfg.evidence_boost_enabled {
			self.load_evidence(&items, cancel).await?
		} else {
			EvidenceMap::new()
		};

		let built = build_clusters(&items, &groups, &embeddings, &evidence, &cfg);
		summary.clusters_demoted = built.demoted;

		for cluster in &built.clusters {
			if cluster.len() < source.min_cluster_size() {
				summary.clusters_below_min_size += 1;
				continue;
			}

			let attempt = AssertUnwindSafe(self.persist_cluster(
				window, source, &items, cluster, &cfg, cancel,
			))
			.catch_unwind()
			.await;

			match attempt {
				Ok(Ok(persisted)) => {
					summary.memberships_failed += persisted.memberships_failed;
					if persisted.label_generated {
						summary.labels_generated += 1;
					}
					summary.clusters.push(persisted.cluster);
				}
				Ok(Err(e)) => return Err(e),
				Err(_) => {
					tracing::error!(
						anchor = %items[cluster.anchor].id,
						topic = %cluster.topic,
						"Panic while persisting cluster, skipping"
					);
				}
			}
		}

		tracing::info!(
			source = %source,
			clusters = summary.clusters.len(),
			clustered_items = summary.clustered_item_count(),
			demoted = summary.clusters_demoted,
			below_min_size = summary.clusters_below_min_size,
			"Clustering window complete"
		);
		Ok(summary)
	}

	// -- Pre-passes ----------------------------------------------------------

	async fn load_embeddings(
		&self,
		items: &[Item],
		cancel: &CancellationToken,
	) -> Result<EmbeddingTable, ClusterError> {
		let mut vectors = Vec::with_capacity(items.len());
		for item in items {
			if !item.embedding.is_empty() {
				vectors.push(Some(item.embedding.clone()));
				continue;
			}
			let Some(source) = &self.embeddings else {
				vectors.push(None);
				continue;
			};
			match until_cancelled(cancel, source.get_item_embedding(&item.id)).await? {
				Ok(found) => vectors.push(found),
				Err(e) if e.is_cancelled() => return Err(e),
				Err(e) => {
					tracing::warn!(item_id = %item.id, error = %e, "Embedding lookup failed");
					vectors.push(None);
				}
			}
		}

		let table = EmbeddingTable::from_vectors(vectors);
		if table.present_count() < table.len() {
			tracing::debug!(
				missing = table.len() - table.present_count(),
				"Items without embeddings will stay singletons"
			);
		}
		Ok(table)
	}

	async fn load_evidence(
		&self,
		items: &[Item],
		cancel: &CancellationToken,
	) -> Result<EvidenceMap, ClusterError> {
		let ids: Vec<String> = items.iter().map(|i| i.id.clone()).collect();
		match until_cancelled(cancel, self.repo.get_evidence_for_items(&ids)).await? {
			Ok(map) => Ok(map),
			Err(e) if e.is_cancelled() => Err(e),
			Err(e) => {
				tracing::warn!(error = %e, "Evidence lookup failed, clustering without boost");
				Ok(EvidenceMap::new())
			}
		}
	}

	// -- Persistence ---------------------------------------------------------

	async fn persist_cluster(
		&self,
		window: RunWindow,
		source: ClusterSource,
		items: &[Item],
		cluster: &BuiltCluster,
		cfg: &ClusteringConfig,
		cancel: &CancellationToken,
	) -> Result<Persisted, ClusterError> {
		let members: Vec<Item> = order_members(items, &cluster.members)
			.into_iter()
			.map(|idx| items[idx].clone())
			.collect();

		let label = until_cancelled(
			cancel,
			label_cluster(self.llm.as_deref(), &members, &cluster.topic, cfg),
		)
		.await?;

		let cluster_id = until_cancelled(
			cancel,
			self.repo
				.create_cluster_with_source(window.start, window.end, &label.topic, source),
		)
		.await??;

		let mut memberships_failed = 0;
		for member in &members {
			match until_cancelled(cancel, self.repo.add_to_cluster(&cluster_id, &member.id)).await? {
				Ok(()) => {}
				Err(e) if e.is_cancelled() => return Err(e),
				Err(e) => {
					memberships_failed += 1;
					tracing::error!(
						cluster_id = %cluster_id,
						item_id = %member.id,
						error = %e,
						"Failed to add item to cluster"
					);
				}
			}
		}

		tracing::info!(
			cluster_id = %cluster_id,
			topic = %label.topic,
			canonical = %cluster.topic,
			members = members.len(),
			"Persisted cluster"
		);

		Ok(Persisted {
			cluster: PersistedCluster {
				id: cluster_id,
				topic: label.topic,
				canonical_topic: cluster.topic.clone(),
				representative_id: members[0].id.clone(),
				member_ids: members.into_iter().map(|m| m.id).collect(),
				source,
			},
			memberships_failed,
			label_generated: label.generated,
		})
	}
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// First occurrence of each id wins.
fn unique_items(items: &[Item]) -> Vec<Item> {
	let mut seen: HashSet<&str> = HashSet::with_capacity(items.len());
	let mut out = Vec::with_capacity(items.len());
	for item in items {
		if seen.insert(item.id.as_str()) {
			out.push(item.clone());
		} else {
			tracing::warn!(item_id = %item.id, "Duplicate item id in window, ignoring repeat");
		}
	}
	out
}

/// Anchor every item in group order. Members released by a demotion are
/// anchored again on a later sweep until nothing is left unassigned.
fn build_clusters(
	items: &[Item],
	groups: &TopicGroups,
	embeddings: &EmbeddingTable,
	evidence: &EvidenceMap,
	cfg: &ClusteringConfig,
) -> BuildOutcome {
	let mut builder = ClusterBuilder::new(items, groups, embeddings, evidence, cfg);
	let mut outcome = BuildOutcome::default();
	let mut tried = vec![false; items.len()];

	loop {
		let mut progressed = false;
		for group in groups.groups() {
			for &anchor in &group.members {
				if tried[anchor] || builder.is_assigned(anchor) {
					continue;
				}
				tried[anchor] = true;
				progressed = true;

				let attempt = panic::catch_unwind(AssertUnwindSafe(|| {
					let mut cluster = builder.build_from(group, anchor)?;
					let verdict =
						enforce_coherence(&mut cluster, &mut builder, embeddings, cfg.coherence_threshold);
					Some((cluster, verdict.passed))
				}));

				match attempt {
					Ok(Some((cluster, passed))) => {
						if !passed {
							outcome.demoted += 1;
						}
						outcome.clusters.push(cluster);
					}
					Ok(None) => {}
					Err(_) => {
						tracing::error!(
							item_id = %items[anchor].id,
							"Panic while building cluster, skipping anchor"
						);
					}
				}
			}
		}
		if !progressed {
			break;
		}
	}

	outcome
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
	use super::*;
	use crate::memory::InMemoryStore;
	use chrono::{TimeZone, Utc};

	fn item(id: &str, topic: &str, embedding: Vec<f32>) -> Item {
		Item {
			id: id.to_string(),
			topic: topic.to_string(),
			summary: format!("summary {}", id),
			importance_score: 0.5,
			embedding,
			..Default::default()
		}
	}

	fn window() -> RunWindow {
		RunWindow::new(
			Utc.with_ymd_and_hms(2026, 6, 1, 0, 0, 0).unwrap(),
			Utc.with_ymd_and_hms(2026, 6, 1, 12, 0, 0).unwrap(),
		)
	}

	fn defaults() -> ClusteringDefaults {
		ClusteringDefaults {
			similarity_threshold: 0.8,
			evidence_boost_enabled: false,
			..Default::default()
		}
	}

	#[test]
	fn unique_items_keeps_first() {
		let mut dup = item("a", "Other", vec![]);
		dup.summary = "second".into();
		let out = unique_items(&[item("a", "T", vec![]), item("b", "T", vec![]), dup]);
		assert_eq!(out.len(), 2);
		assert_eq!(out[0].topic, "T");
	}

	#[test]
	fn released_members_are_reanchored() {
		// a pulls in b and c, the trio is incoherent at 0.7, b and c are
		// released and anchor their own clusters.
		let items = vec![
			item("a", "T", vec![1.0, 0.0, 0.0]),
			item("b", "T", vec![0.8, 0.6, 0.0]),
			item("c", "T", vec![0.8, -0.6, 0.0]),
		];
		let groups = TopicGroups::build(&items);
		let table =
			EmbeddingTable::from_vectors(items.iter().map(|i| Some(i.embedding.clone())).collect());
		let cfg = ClusteringConfig {
			similarity_threshold: 0.75,
			coherence_threshold: 0.7,
			cluster_window: None,
			evidence_boost_enabled: false,
			..Default::default()
		};
		let out = build_clusters(&items, &groups, &table, &EvidenceMap::new(), &cfg);
		assert_eq!(out.demoted, 1);
		let members: Vec<Vec<usize>> = out.clusters.iter().map(|c| c.members.clone()).collect();
		assert_eq!(members, vec![vec![0], vec![1], vec![2]]);
	}

	#[tokio::test]
	async fn digest_run_persists_pairs_only() {
		let store = Arc::new(InMemoryStore::new());
		let engine = ClusterEngine::new(store.clone(), defaults());
		let items = vec![
			item("a", "Energy", vec![1.0, 0.0]),
			item("b", "energy", vec![1.0, 0.0]),
			item("c", "Sports", vec![0.0, 1.0]),
		];
		let summary = engine
			.cluster_window(window(), ClusterSource::Digest, &items, &CancellationToken::new())
			.await
			.unwrap();
		assert_eq!(summary.clusters.len(), 1);
		assert_eq!(summary.clusters_below_min_size, 1);
		assert_eq!(summary.topic_groups, 2);
		assert_eq!(store.clusters().len(), 1);
		assert_eq!(store.clusters()[0].topic, "Energy");
	}

	#[tokio::test]
	async fn missing_embeddings_are_fetched() {
		let store = Arc::new(InMemoryStore::new());
		store.set_item_embedding("b", vec![1.0, 0.0]);
		let engine = ClusterEngine::new(store.clone(), defaults()).with_embeddings(store.clone());
		let items = vec![item("a", "T", vec![1.0, 0.0]), item("b", "T", vec![])];
		let summary = engine
			.cluster_window(window(), ClusterSource::Digest, &items, &CancellationToken::new())
			.await
			.unwrap();
		assert_eq!(summary.clusters.len(), 1);
		assert_eq!(summary.clusters[0].member_ids.len(), 2);
	}

	#[tokio::test]
	async fn max_items_truncates() {
		let store = Arc::new(InMemoryStore::new());
		store.set_setting(crate::config::keys::MAX_ITEMS, serde_json::json!(2));
		let engine = ClusterEngine::new(store.clone(), defaults());
		let items: Vec<Item> = (0..5)
			.map(|i| item(&format!("i{}", i), "T", vec![1.0, 0.0]))
			.collect();
		let summary = engine
			.cluster_window(window(), ClusterSource::Digest, &items, &CancellationToken::new())
			.await
			.unwrap();
		assert_eq!(summary.items_considered, 2);
		assert_eq!(summary.items_truncated, 3);
		assert_eq!(summary.clusters[0].member_ids, vec!["i0", "i1"]);
	}

	#[tokio::test]
	async fn inverted_window_is_rejected() {
		let store = Arc::new(InMemoryStore::new());
		let engine = ClusterEngine::new(store.clone(), defaults());
		let w = window();
		let err = engine
			.cluster_window(RunWindow::new(w.end, w.start), ClusterSource::Digest, &[], &CancellationToken::new())
			.await
			.unwrap_err();
		assert_eq!(err.code(), "CLUSTER_INVALID_CONFIG");
	}

	#[tokio::test]
	async fn cancelled_before_start() {
		let store = Arc::new(InMemoryStore::new());
		let engine = ClusterEngine::new(store.clone(), defaults());
		let cancel = CancellationToken::new();
		cancel.cancel();
		let err = engine
			.cluster_window(window(), ClusterSource::Digest, &[], &cancel)
			.await
			.unwrap_err();
		assert!(err.is_cancelled());
	}
}
