use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A scored, embedded unit of content. Read-only to the engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Item {
	pub id: String,
	#[serde(default)]
	pub topic: String,
	#[serde(default)]
	pub summary: String,
	#[serde(rename = "importanceScore", default)]
	pub importance_score: f64,
	/// Empty when the embedding has not been computed. Accepts a float array
	/// or base64 of little-endian f32 bytes.
	#[serde(default, deserialize_with = "crate::snapshot::deserialize_embedding")]
	pub embedding: Vec<f32>,
	#[serde(rename = "tgDate", default)]
	pub tg_date: Option<DateTime<Utc>>,
	#[serde(rename = "rawMessageId", default)]
	pub raw_message_id: Option<String>,
	#[serde(default)]
	pub language: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceSource {
	pub url: String,
	#[serde(rename = "agreementScore")]
	pub agreement_score: f64,
	#[serde(rename = "isContradiction", default)]
	pub is_contradiction: bool,
}

/// Which pipeline produced a cluster. Research clusters feed trend analysis
/// and accept singletons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterSource {
	#[default]
	Digest,
	Research,
}

impl ClusterSource {
	pub fn as_str(&self) -> &'static str {
		match self {
			Self::Digest => "digest",
			Self::Research => "research",
		}
	}

	/// Smallest member count that gets persisted.
	pub fn min_cluster_size(&self) -> usize {
		match self {
			Self::Digest => 2,
			Self::Research => 1,
		}
	}
}

impl std::fmt::Display for ClusterSource {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.as_str())
	}
}

impl std::str::FromStr for ClusterSource {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.trim().to_lowercase().as_str() {
			"digest" => Ok(Self::Digest),
			"research" => Ok(Self::Research),
			other => Err(format!("unknown cluster source: {}", other)),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
	pub id: String,
	pub start: DateTime<Utc>,
	pub end: DateTime<Utc>,
	pub topic: String,
	pub source: ClusterSource,
	#[serde(rename = "createdAt")]
	pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterMembership {
	#[serde(rename = "clusterId")]
	pub cluster_id: String,
	#[serde(rename = "itemId")]
	pub item_id: String,
}

/// The `[start, end)` digest window a run covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunWindow {
	pub start: DateTime<Utc>,
	pub end: DateTime<Utc>,
}

impl RunWindow {
	pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
		Self { start, end }
	}
}

/// A newly ingested message awaiting the duplicate gate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawMessage {
	pub id: String,
	pub text: String,
	#[serde(default)]
	pub embedding: Vec<f32>,
	#[serde(rename = "tgDate", default)]
	pub tg_date: Option<DateTime<Utc>>,
}

/// Resolved content of a link found in a raw message.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Link {
	pub url: String,
	#[serde(default)]
	pub title: String,
	#[serde(default)]
	pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuplicateCheckResult {
	#[serde(rename = "isDuplicate")]
	pub is_duplicate: bool,
	#[serde(rename = "originalId")]
	pub original_id: Option<String>,
	/// Only set by the semantic strategy.
	pub similarity: Option<f64>,
}

impl DuplicateCheckResult {
	pub fn unique() -> Self {
		Self {
			is_duplicate: false,
			original_id: None,
			similarity: None,
		}
	}

	pub fn duplicate_of(original_id: impl Into<String>, similarity: Option<f64>) -> Self {
		Self {
			is_duplicate: true,
			original_id: Some(original_id.into()),
			similarity,
		}
	}
}

/// A previously accepted message close enough to count as the original.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarMessage {
	pub id: String,
	pub similarity: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedCluster {
	pub id: String,
	pub topic: String,
	#[serde(rename = "canonicalTopic")]
	pub canonical_topic: String,
	#[serde(rename = "representativeId")]
	pub representative_id: String,
	/// Representative first, then by importance.
	#[serde(rename = "memberIds")]
	pub member_ids: Vec<String>,
	pub source: ClusterSource,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterRunSummary {
	pub clusters: Vec<PersistedCluster>,
	#[serde(rename = "itemsConsidered")]
	pub items_considered: usize,
	#[serde(rename = "itemsTruncated")]
	pub items_truncated: usize,
	#[serde(rename = "topicGroups")]
	pub topic_groups: usize,
	#[serde(rename = "clustersDemoted")]
	pub clusters_demoted: usize,
	#[serde(rename = "clustersBelowMinSize")]
	pub clusters_below_min_size: usize,
	#[serde(rename = "membershipsFailed")]
	pub memberships_failed: usize,
	#[serde(rename = "labelsGenerated")]
	pub labels_generated: usize,
}

impl ClusterRunSummary {
	pub fn clustered_item_count(&self) -> usize {
		self.clusters.iter().map(|c| c.member_ids.len()).sum()
	}
}
