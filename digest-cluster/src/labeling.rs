// ---------------------------------------------------------------------------
// Representative selection and topic labeling
// ---------------------------------------------------------------------------
//
// Labeling is best effort. Every failure path ends in the canonical topic,
// so a missing or broken LLM never blocks persistence.
// ---------------------------------------------------------------------------

use std::cmp::Ordering;

use crate::config::ClusteringConfig;
use crate::ports::LlmClient;
use crate::text::{collapse_whitespace, truncate_chars};
use crate::types::Item;

/// Summaries shorter than this (in chars) get link context before labeling.
pub const SHORT_SUMMARY_CHARS: usize = 100;

/// Most members sent to the labeler per cluster.
pub const MAX_LABEL_ITEMS: usize = 15;

/// Longest label kept, in chars.
const MAX_LABEL_CHARS: usize = 120;

const QUOTES: &[char] = &['"', '\'', '`', '«', '»', '“', '”', '„', '‘', '’'];

// ---------------------------------------------------------------------------
// Representative
// ---------------------------------------------------------------------------

fn rank(a: &Item, b: &Item) -> Ordering {
	b.importance_score
		.total_cmp(&a.importance_score)
		.then_with(|| b.summary.chars().count().cmp(&a.summary.chars().count()))
}

/// Member indices ordered by importance, then longer summary first. Full
/// ties keep their cluster order. The first entry is the representative.
pub fn order_members(items: &[Item], members: &[usize]) -> Vec<usize> {
	let mut ordered = members.to_vec();
	ordered.sort_by(|&a, &b| rank(&items[a], &items[b]));
	ordered
}

pub fn select_representative(items: &[Item], members: &[usize]) -> Option<usize> {
	members
		.iter()
		.copied()
		.reduce(|best, idx| {
			if rank(&items[idx], &items[best]) == Ordering::Less {
				idx
			} else {
				best
			}
		})
}

// ---------------------------------------------------------------------------
// Label cleanup
// ---------------------------------------------------------------------------

/// Strip surrounding whitespace and quotes; `None` when nothing is left.
pub fn clean_label(raw: &str) -> Option<String> {
	let trimmed = raw.trim().trim_matches(|c: char| c.is_whitespace() || QUOTES.contains(&c));
	let first_line = trimmed.lines().next().unwrap_or_default();
	let label = collapse_whitespace(first_line);
	if label.is_empty() {
		None
	} else {
		Some(truncate_chars(&label, MAX_LABEL_CHARS).trim_end().to_string())
	}
}

// ---------------------------------------------------------------------------
// Enrichment
// ---------------------------------------------------------------------------

/// Append the first link with a title or description to summaries that are
/// too short to label from. Lookup failures leave the summary untouched.
pub async fn enrich_summaries(llm: &dyn LlmClient, items: &mut [Item]) {
	for item in items.iter_mut() {
		if item.summary.chars().count() >= SHORT_SUMMARY_CHARS {
			continue;
		}
		let Some(raw_id) = item.raw_message_id.as_deref().filter(|id| !id.is_empty()) else {
			continue;
		};

		let links = match llm.get_links_for_message(raw_id).await {
			Ok(links) => links,
			Err(e) => {
				tracing::debug!(item_id = %item.id, error = %e, "Link lookup failed");
				continue;
			}
		};

		let context = links.iter().find_map(|link| {
			let title = link.title.trim();
			let description = link.description.trim();
			match (title.is_empty(), description.is_empty()) {
				(true, true) => None,
				(false, true) => Some(title.to_string()),
				(true, false) => Some(description.to_string()),
				(false, false) => Some(format!("{}. {}", title, description)),
			}
		});
		if let Some(context) = context {
			item.summary = if item.summary.trim().is_empty() {
				context
			} else {
				format!("{}\n{}", item.summary.trim_end(), context)
			};
		}
	}
}

// ---------------------------------------------------------------------------
// Labeling
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelOutcome {
	pub topic: String,
	/// False when the canonical topic was kept.
	pub generated: bool,
}

impl LabelOutcome {
	pub fn fallback(canonical: &str) -> Self {
		Self {
			topic: canonical.to_string(),
			generated: false,
		}
	}
}

/// Topic for a cluster whose `members` are already in representative order.
///
/// Single-member clusters and runs without an LLM keep `canonical`; so do
/// labeler errors and empty answers.
pub async fn label_cluster(
	llm: Option<&dyn LlmClient>,
	members: &[Item],
	canonical: &str,
	cfg: &ClusteringConfig,
) -> LabelOutcome {
	let Some(llm) = llm else {
		return LabelOutcome::fallback(canonical);
	};
	if members.len() <= 1 {
		return LabelOutcome::fallback(canonical);
	}

	let mut batch: Vec<Item> = members.iter().take(MAX_LABEL_ITEMS).cloned().collect();
	enrich_summaries(llm, &mut batch).await;

	match llm
		.generate_cluster_topic(&batch, &cfg.topic_language, &cfg.topic_model)
		.await
	{
		Ok(raw) => match clean_label(&raw) {
			Some(topic) => LabelOutcome {
				topic,
				generated: true,
			},
			None => {
				tracing::warn!(canonical, "Labeler returned an empty topic, keeping canonical");
				LabelOutcome::fallback(canonical)
			}
		},
		Err(e) => {
			tracing::warn!(canonical, error = %e, "Topic generation failed, keeping canonical");
			LabelOutcome::fallback(canonical)
		}
	}
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
