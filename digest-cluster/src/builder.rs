// ---------------------------------------------------------------------------
// Cluster builder — greedy single-pass clustering
// ---------------------------------------------------------------------------
//
// For each canonical topic group, every still-unassigned item anchors a new
// cluster and pulls in every candidate whose boosted similarity to the
// anchor beats the threshold. Joined items are claimed immediately, so the
// outcome depends on input order: this is single-linkage from the anchor's
// point of view, not a transitive closure.
// ---------------------------------------------------------------------------

use chrono::{DateTime, Utc};

use crate::config::ClusteringConfig;
use crate::cosine::{compute_magnitude, cosine_similarity_with_magnitude};
use crate::evidence::{calculate_evidence_boost, EvidenceMap};
use crate::topic::{TopicGroup, TopicGroups};
use crate::types::Item;

// ---------------------------------------------------------------------------
// EmbeddingTable
// ---------------------------------------------------------------------------

struct Embedded {
	vector: Vec<f32>,
	magnitude: f64,
}

/// Embeddings of a run's items by index, with magnitudes computed once.
#[derive(Default)]
pub struct EmbeddingTable {
	entries: Vec<Option<Embedded>>,
}

impl EmbeddingTable {
	/// Empty vectors count as missing.
	pub fn from_vectors(vectors: Vec<Option<Vec<f32>>>) -> Self {
		let entries = vectors
			.into_iter()
			.map(|v| {
				v.filter(|v| !v.is_empty()).map(|vector| Embedded {
					magnitude: compute_magnitude(&vector),
					vector,
				})
			})
			.collect();
		Self { entries }
	}

	pub fn get(&self, idx: usize) -> Option<&[f32]> {
		self.entries
			.get(idx)
			.and_then(Option::as_ref)
			.map(|e| e.vector.as_slice())
	}

	pub fn has(&self, idx: usize) -> bool {
		self.get(idx).is_some()
	}

	/// Unboosted cosine similarity, `None` when either side has no embedding.
	pub fn similarity(&self, a: usize, b: usize) -> Option<f64> {
		let ea = self.entries.get(a)?.as_ref()?;
		let eb = self.entries.get(b)?.as_ref()?;
		Some(cosine_similarity_with_magnitude(
			&ea.vector,
			&eb.vector,
			ea.magnitude,
			eb.magnitude,
		))
	}

	pub fn len(&self) -> usize {
		self.entries.len()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}

	pub fn present_count(&self) -> usize {
		self.entries.iter().filter(|e| e.is_some()).count()
	}
}

// ---------------------------------------------------------------------------
// BuiltCluster
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct BuiltCluster {
	/// Canonical topic of the anchor's group.
	pub topic: String,
	pub anchor: usize,
	/// Item indices, anchor first, then in join order.
	pub members: Vec<usize>,
}

impl BuiltCluster {
	pub fn len(&self) -> usize {
		self.members.len()
	}

	pub fn is_empty(&self) -> bool {
		self.members.is_empty()
	}

	/// Collapse to the anchor alone, returning the dropped members.
	pub fn collapse_to_anchor(&mut self) -> Vec<usize> {
		self.members.split_off(1.min(self.members.len()))
	}
}

// ---------------------------------------------------------------------------
// ClusterBuilder
// ---------------------------------------------------------------------------

pub struct ClusterBuilder<'a> {
	items: &'a [Item],
	groups: &'a TopicGroups,
	embeddings: &'a EmbeddingTable,
	evidence: &'a EvidenceMap,
	cfg: &'a ClusteringConfig,
	assigned: Vec<bool>,
}

impl<'a> ClusterBuilder<'a> {
	pub fn new(
		items: &'a [Item],
		groups: &'a TopicGroups,
		embeddings: &'a EmbeddingTable,
		evidence: &'a EvidenceMap,
		cfg: &'a ClusteringConfig,
	) -> Self {
		Self {
			items,
			groups,
			embeddings,
			evidence,
			cfg,
			assigned: vec![false; items.len()],
		}
	}

	pub fn is_assigned(&self, idx: usize) -> bool {
		self.assigned.get(idx).copied().unwrap_or(true)
	}

	/// Return items to the unassigned pool.
	pub fn release(&mut self, indices: &[usize]) {
		for &idx in indices {
			if let Some(slot) = self.assigned.get_mut(idx) {
				*slot = false;
			}
		}
	}

	/// Build the cluster anchored at `anchor`, a member of `group`. `None`
	/// when the anchor was already claimed.
	pub fn build_from(&mut self, group: &TopicGroup, anchor: usize) -> Option<BuiltCluster> {
		if self.is_assigned(anchor) {
			return None;
		}
		self.assigned[anchor] = true;

		let mut members = vec![anchor];
		if !self.embeddings.has(anchor) {
			tracing::debug!(
				item_id = %self.items[anchor].id,
				"Anchor has no embedding, keeping it as a singleton"
			);
			return Some(BuiltCluster {
				topic: group.topic.clone(),
				anchor,
				members,
			});
		}

		let pool: Vec<usize> = if self.cfg.cross_topic_enabled {
			(0..self.items.len()).collect()
		} else {
			group.members.clone()
		};

		for candidate in pool {
			if candidate == anchor || self.is_assigned(candidate) {
				continue;
			}
			if self.joins(anchor, candidate) {
				self.assigned[candidate] = true;
				members.push(candidate);
			}
		}

		Some(BuiltCluster {
			topic: group.topic.clone(),
			anchor,
			members,
		})
	}

	/// Boosted similarity of `candidate` to `anchor` against the threshold
	/// for their topic relation, gated by the time window.
	fn joins(&self, anchor: usize, candidate: usize) -> bool {
		let Some(similarity) = self.embeddings.similarity(anchor, candidate) else {
			return false;
		};
		if !self.within_window(anchor, candidate) {
			return false;
		}

		let same_topic = self.groups.topic_of(anchor) == self.groups.topic_of(candidate);
		let threshold = self.cfg.threshold_for(same_topic);
		let boost = calculate_evidence_boost(
			&self.items[anchor].id,
			&self.items[candidate].id,
			self.evidence,
			self.cfg,
		);

		similarity + boost > threshold
	}

	fn within_window(&self, a: usize, b: usize) -> bool {
		let Some(window) = self.cfg.cluster_window else {
			return true;
		};
		match (
			effective_time(&self.items[a]),
			effective_time(&self.items[b]),
		) {
			(Some(ta), Some(tb)) => (ta - tb).abs() <= window,
			_ => true,
		}
	}
}

/// Missing and epoch-zero timestamps both mean "unknown".
fn effective_time(item: &Item) -> Option<DateTime<Utc>> {
	item.tg_date.filter(|t| t.timestamp() != 0)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
