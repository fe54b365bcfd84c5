// ---------------------------------------------------------------------------
// Coherence check
// ---------------------------------------------------------------------------
//
// A greedy anchor can pull in members that match the anchor but not each
// other. Clusters above two members must keep an average pairwise
// (unboosted) similarity at or above the coherence threshold, otherwise
// they collapse to the anchor and the rest go back to the pool.
// ---------------------------------------------------------------------------

use crate::builder::{BuiltCluster, ClusterBuilder, EmbeddingTable};

/// Clusters at or below this size always pass.
const MIN_CHECKED_SIZE: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CoherenceVerdict {
	/// Average over measurable pairs; `None` when nothing was measured.
	pub average: Option<f64>,
	/// Pairs where both members had embeddings.
	pub pairs: usize,
	pub passed: bool,
}

/// Average pairwise similarity among members with embeddings. Pairs with a
/// missing embedding are skipped rather than counted as zero.
pub fn average_pairwise_similarity(
	members: &[usize],
	embeddings: &EmbeddingTable,
) -> Option<(f64, usize)> {
	let mut total = 0.0;
	let mut pairs = 0usize;
	for (i, &a) in members.iter().enumerate() {
		for &b in &members[i + 1..] {
			if let Some(sim) = embeddings.similarity(a, b) {
				total += sim;
				pairs += 1;
			}
		}
	}
	(pairs > 0).then(|| (total / pairs as f64, pairs))
}

/// Judge a member list without changing anything.
pub fn check_coherence(
	members: &[usize],
	embeddings: &EmbeddingTable,
	threshold: f64,
) -> CoherenceVerdict {
	if members.len() < MIN_CHECKED_SIZE {
		return CoherenceVerdict {
			average: None,
			pairs: 0,
			passed: true,
		};
	}
	match average_pairwise_similarity(members, embeddings) {
		Some((average, pairs)) => CoherenceVerdict {
			average: Some(average),
			pairs,
			passed: average >= threshold,
		},
		None => CoherenceVerdict {
			average: None,
			pairs: 0,
			passed: true,
		},
	}
}

/// Check `cluster` and demote it to a singleton when incoherent, releasing
/// every non-anchor member back to `builder`.
pub fn enforce_coherence(
	cluster: &mut BuiltCluster,
	builder: &mut ClusterBuilder<'_>,
	embeddings: &EmbeddingTable,
	threshold: f64,
) -> CoherenceVerdict {
	let verdict = check_coherence(&cluster.members, embeddings, threshold);
	if !verdict.passed {
		let released = cluster.collapse_to_anchor();
		tracing::debug!(
			topic = %cluster.topic,
			released = released.len(),
			average = verdict.average.unwrap_or_default(),
			threshold,
			"Demoting incoherent cluster to its anchor"
		);
		builder.release(&released);
	}
	verdict
}
