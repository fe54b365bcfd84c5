// ---------------------------------------------------------------------------
// Deduplication — gate newly ingested messages before clustering
// ---------------------------------------------------------------------------
//
// Two strategies, one per deployment:
//
// - Strict: identical normalized content hash, different id.
// - Semantic: best embedding match above a threshold inside a trailing
//   window. Missing embeddings fail open.
//
// Lookups are delegated to a `DedupStore`; storage errors propagate.
// ---------------------------------------------------------------------------

use std::sync::Arc;

use chrono::{Duration, Utc};
use sha2::{Digest, Sha256};

use crate::config::{DedupConfig, DedupMode};
use crate::cosine::cosine_similarity;
use crate::error::ClusterError;
use crate::ports::DedupStore;
use crate::text::collapse_whitespace;
use crate::types::{DuplicateCheckResult, RawMessage, SimilarMessage};

// ---------------------------------------------------------------------------
// Content hashing
// ---------------------------------------------------------------------------

/// SHA-256 hex of the lowercased, whitespace-collapsed text, so reposts that
/// differ only in case or spacing hash equal.
pub fn content_hash(text: &str) -> String {
	let normalized = collapse_whitespace(&text.to_lowercase());
	format!("{:x}", Sha256::digest(normalized.as_bytes()))
}

// ---------------------------------------------------------------------------
// Best-match scan
// ---------------------------------------------------------------------------

/// Closest candidate whose similarity exceeds `threshold`. Candidates with a
/// different dimension are skipped. Linear scan; O(N).
pub fn best_match<'a, I>(embedding: &[f32], candidates: I, threshold: f64) -> Option<SimilarMessage>
where
	I: IntoIterator<Item = (&'a str, &'a [f32])>,
{
	if embedding.is_empty() {
		return None;
	}

	let mut best: Option<SimilarMessage> = None;
	for (id, candidate) in candidates {
		if candidate.len() != embedding.len() {
			continue;
		}
		let sim = cosine_similarity(embedding, candidate);
		if sim > threshold && best.as_ref().is_none_or(|b| sim > b.similarity) {
			best = Some(SimilarMessage {
				id: id.to_string(),
				similarity: sim,
			});
		}
	}
	best
}

// ---------------------------------------------------------------------------
// Deduplicator
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub enum Deduplicator {
	Strict {
		store: Arc<dyn DedupStore>,
	},
	Semantic {
		store: Arc<dyn DedupStore>,
		threshold: f64,
		window: Duration,
	},
}

impl Deduplicator {
	pub fn strict(store: Arc<dyn DedupStore>) -> Self {
		Self::Strict { store }
	}

	pub fn semantic(store: Arc<dyn DedupStore>, threshold: f64, window: Duration) -> Self {
		Self::Semantic {
			store,
			threshold,
			window,
		}
	}

	pub fn from_config(store: Arc<dyn DedupStore>, cfg: &DedupConfig) -> Self {
		match cfg.mode {
			DedupMode::Strict => Self::strict(store),
			DedupMode::Semantic => Self::semantic(store, cfg.effective_threshold(), cfg.window()),
		}
	}

	pub fn mode(&self) -> DedupMode {
		match self {
			Self::Strict { .. } => DedupMode::Strict,
			Self::Semantic { .. } => DedupMode::Semantic,
		}
	}

	/// Decide whether `message` duplicates something already accepted.
	///
	/// The strict strategy ignores `embedding`; the semantic one reports
	/// "not a duplicate" when it is empty.
	pub async fn is_duplicate(
		&self,
		message: &RawMessage,
		embedding: &[f32],
	) -> Result<DuplicateCheckResult, ClusterError> {
		match self {
			Self::Strict { store } => {
				let hash = content_hash(&message.text);
				let found = store.find_by_content_hash(&hash, &message.id).await?;
				Ok(match found {
					Some(original) => {
						tracing::debug!(
							message_id = %message.id,
							original_id = %original,
							"Exact duplicate by content hash"
						);
						DuplicateCheckResult::duplicate_of(original, None)
					}
					None => DuplicateCheckResult::unique(),
				})
			}
			Self::Semantic {
				store,
				threshold,
				window,
			} => {
				if embedding.is_empty() {
					return Ok(DuplicateCheckResult::unique());
				}
				let reference = message.tg_date.unwrap_or_else(Utc::now);
				let since = reference - *window;
				let found = store
					.find_similar_message(embedding, *threshold, since, &message.id)
					.await?;
				Ok(match found {
					Some(m) => {
						tracing::debug!(
							message_id = %message.id,
							original_id = %m.id,
							similarity = m.similarity,
							"Semantic duplicate"
						);
						DuplicateCheckResult::duplicate_of(m.id, Some(m.similarity))
					}
					None => DuplicateCheckResult::unique(),
				})
			}
		}
	}
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
