// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------
//
// Static defaults come from CLI flags / environment (clap). Each run then
// overlays dynamic settings read through the repository, and finally
// re-defaults anything that ended up zero or out of range. The result is a
// plain value threaded through the run; nothing here is global.
// ---------------------------------------------------------------------------

use clap::{ArgAction, Args, Parser, ValueEnum};
use serde::de::DeserializeOwned;

use crate::ports::ClusterRepository;

pub const DEFAULT_SIMILARITY_THRESHOLD: f64 = 0.75;
pub const DEFAULT_COHERENCE_THRESHOLD: f64 = 0.7;
pub const DEFAULT_CLUSTER_WINDOW_HOURS: f64 = 36.0;
pub const DEFAULT_EVIDENCE_BOOST: f64 = 0.15;
pub const DEFAULT_EVIDENCE_MIN_AGREEMENT: f64 = 0.6;
pub const DEFAULT_MAX_ITEMS: usize = 500;
pub const DEFAULT_TOPIC_LANGUAGE: &str = "en";

pub const DEFAULT_DEDUP_THRESHOLD: f64 = 0.92;
pub const DEFAULT_DEDUP_WINDOW_DAYS: i64 = 7;

/// Dynamic setting keys.
pub mod keys {
	pub const SIMILARITY_THRESHOLD: &str = "cluster_similarity_threshold";
	pub const CROSS_TOPIC_THRESHOLD: &str = "cross_topic_similarity_threshold";
	pub const COHERENCE_THRESHOLD: &str = "cluster_coherence_threshold";
	pub const CROSS_TOPIC_ENABLED: &str = "cross_topic_clustering_enabled";
	pub const WINDOW_HOURS: &str = "cluster_time_window_hours";
	pub const EVIDENCE_BOOST_ENABLED: &str = "cluster_evidence_boost_enabled";
	pub const EVIDENCE_BOOST: &str = "cluster_evidence_boost";
	pub const EVIDENCE_MIN_AGREEMENT: &str = "cluster_evidence_min_agreement";
	pub const MAX_ITEMS: &str = "cluster_max_items_limit";
	pub const TOPIC_LANGUAGE: &str = "digest_language";
	pub const TOPIC_MODEL: &str = "cluster_topic_model";
}

// ---------------------------------------------------------------------------
// Static defaults
// ---------------------------------------------------------------------------

#[derive(Args, Debug, Clone)]
pub struct ClusteringDefaults {
	/// Similarity an item needs to join a cluster anchored in its own topic
	#[arg(long, default_value_t = DEFAULT_SIMILARITY_THRESHOLD, env = "DIGEST_CLUSTER_SIMILARITY_THRESHOLD")]
	pub similarity_threshold: f64,

	/// Threshold for joining across topics (0 = same as --similarity-threshold)
	#[arg(long, default_value_t = 0.0, env = "DIGEST_CLUSTER_CROSS_TOPIC_THRESHOLD")]
	pub cross_topic_threshold: f64,

	/// Minimum average pairwise similarity for clusters above two members
	#[arg(long, default_value_t = DEFAULT_COHERENCE_THRESHOLD, env = "DIGEST_CLUSTER_COHERENCE_THRESHOLD")]
	pub coherence_threshold: f64,

	/// Let items join clusters anchored in a different topic
	#[arg(long, default_value_t = false, action = ArgAction::Set, env = "DIGEST_CLUSTER_CROSS_TOPIC_ENABLED")]
	pub cross_topic_enabled: bool,

	/// Maximum distance between anchor and candidate timestamps (0 disables)
	#[arg(long, default_value_t = DEFAULT_CLUSTER_WINDOW_HOURS, env = "DIGEST_CLUSTER_WINDOW_HOURS")]
	pub cluster_window_hours: f64,

	/// Add a similarity bonus for shared corroborating sources
	#[arg(long, default_value_t = true, action = ArgAction::Set, env = "DIGEST_CLUSTER_EVIDENCE_BOOST_ENABLED")]
	pub evidence_boost_enabled: bool,

	/// Upper bound of the evidence bonus
	#[arg(long, default_value_t = DEFAULT_EVIDENCE_BOOST, env = "DIGEST_CLUSTER_EVIDENCE_BOOST")]
	pub evidence_boost: f64,

	/// Agreement score an evidence source needs to count
	#[arg(long, default_value_t = DEFAULT_EVIDENCE_MIN_AGREEMENT, env = "DIGEST_CLUSTER_EVIDENCE_MIN_AGREEMENT")]
	pub evidence_min_agreement: f64,

	/// Items beyond this many in one window are ignored
	#[arg(long, default_value_t = DEFAULT_MAX_ITEMS, env = "DIGEST_CLUSTER_MAX_ITEMS")]
	pub max_items: usize,

	/// Language requested for generated cluster topics
	#[arg(long, default_value = DEFAULT_TOPIC_LANGUAGE, env = "DIGEST_CLUSTER_TOPIC_LANGUAGE")]
	pub topic_language: String,

	/// Model requested for generated cluster topics (empty = provider default)
	#[arg(long, default_value = "", env = "DIGEST_CLUSTER_TOPIC_MODEL")]
	pub topic_model: String,
}

#[derive(Parser)]
struct EnvOnly {
	#[command(flatten)]
	defaults: ClusteringDefaults,
}

impl ClusteringDefaults {
	/// Read defaults from `DIGEST_CLUSTER_*` environment variables only.
	pub fn from_env() -> Result<Self, clap::Error> {
		EnvOnly::try_parse_from(["digest-cluster"]).map(|p| p.defaults)
	}
}

impl Default for ClusteringDefaults {
	fn default() -> Self {
		Self {
			similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
			cross_topic_threshold: 0.0,
			coherence_threshold: DEFAULT_COHERENCE_THRESHOLD,
			cross_topic_enabled: false,
			cluster_window_hours: DEFAULT_CLUSTER_WINDOW_HOURS,
			evidence_boost_enabled: true,
			evidence_boost: DEFAULT_EVIDENCE_BOOST,
			evidence_min_agreement: DEFAULT_EVIDENCE_MIN_AGREEMENT,
			max_items: DEFAULT_MAX_ITEMS,
			topic_language: DEFAULT_TOPIC_LANGUAGE.to_string(),
			topic_model: String::new(),
		}
	}
}

// ---------------------------------------------------------------------------
// Run-scoped config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct ClusteringConfig {
	pub similarity_threshold: f64,
	pub cross_topic_threshold: f64,
	pub coherence_threshold: f64,
	pub cross_topic_enabled: bool,
	/// `None` disables the time gate.
	pub cluster_window: Option<chrono::Duration>,
	pub evidence_boost_enabled: bool,
	pub evidence_boost: f64,
	pub evidence_min_agreement: f64,
	pub max_items: usize,
	pub topic_language: String,
	pub topic_model: String,
}

impl ClusteringConfig {
	pub fn from_defaults(defaults: &ClusteringDefaults) -> Self {
		let mut cfg = Self {
			similarity_threshold: defaults.similarity_threshold,
			cross_topic_threshold: defaults.cross_topic_threshold,
			coherence_threshold: defaults.coherence_threshold,
			cross_topic_enabled: defaults.cross_topic_enabled,
			cluster_window: window_from_hours(defaults.cluster_window_hours),
			evidence_boost_enabled: defaults.evidence_boost_enabled,
			evidence_boost: defaults.evidence_boost,
			evidence_min_agreement: defaults.evidence_min_agreement,
			max_items: defaults.max_items,
			topic_language: defaults.topic_language.clone(),
			topic_model: defaults.topic_model.clone(),
		};
		cfg.sanitize();
		cfg
	}

	/// Threshold a candidate must beat, depending on whether it shares the
	/// anchor's canonical topic.
	pub fn threshold_for(&self, same_topic: bool) -> f64 {
		if same_topic {
			self.similarity_threshold
		} else {
			self.cross_topic_threshold
		}
	}

	/// Replace zero, non-finite and out-of-range values with defaults.
	pub fn sanitize(&mut self) {
		if !in_unit_interval(self.similarity_threshold) {
			self.similarity_threshold = DEFAULT_SIMILARITY_THRESHOLD;
		}
		if !in_unit_interval(self.cross_topic_threshold) {
			self.cross_topic_threshold = self.similarity_threshold;
		}
		if !in_unit_interval(self.coherence_threshold) {
			self.coherence_threshold = DEFAULT_COHERENCE_THRESHOLD;
		}
		if self.cluster_window.is_some_and(|w| w <= chrono::Duration::zero()) {
			self.cluster_window = None;
		}
		if !in_unit_interval(self.evidence_boost) {
			self.evidence_boost = DEFAULT_EVIDENCE_BOOST;
		}
		if !in_unit_interval(self.evidence_min_agreement) {
			self.evidence_min_agreement = DEFAULT_EVIDENCE_MIN_AGREEMENT;
		}
		if self.max_items == 0 {
			self.max_items = DEFAULT_MAX_ITEMS;
		}
		if self.topic_language.trim().is_empty() {
			self.topic_language = DEFAULT_TOPIC_LANGUAGE.to_string();
		}
	}
}

impl Default for ClusteringConfig {
	fn default() -> Self {
		Self::from_defaults(&ClusteringDefaults::default())
	}
}

fn in_unit_interval(v: f64) -> bool {
	v.is_finite() && v > 0.0 && v <= 1.0
}

fn window_from_hours(hours: f64) -> Option<chrono::Duration> {
	if !hours.is_finite() || hours <= 0.0 {
		return None;
	}
	Some(chrono::Duration::milliseconds((hours * 3_600_000.0).round() as i64))
}

/// Build the run's config: static defaults, then dynamic settings, then
/// re-defaulting. Lookup misses and unparsable values are logged at debug
/// level and never surface to the caller.
pub async fn load_clustering_config(
	repo: &dyn ClusterRepository,
	defaults: &ClusteringDefaults,
) -> ClusteringConfig {
	let mut cfg = ClusteringConfig::from_defaults(defaults);
	// Cross-topic threshold defaults to the same-topic one only when unset.
	cfg.cross_topic_threshold = defaults.cross_topic_threshold;

	if let Some(v) = setting::<f64>(repo, keys::SIMILARITY_THRESHOLD).await {
		cfg.similarity_threshold = v;
	}
	if let Some(v) = setting::<f64>(repo, keys::CROSS_TOPIC_THRESHOLD).await {
		cfg.cross_topic_threshold = v;
	}
	if let Some(v) = setting::<f64>(repo, keys::COHERENCE_THRESHOLD).await {
		cfg.coherence_threshold = v;
	}
	if let Some(v) = setting::<bool>(repo, keys::CROSS_TOPIC_ENABLED).await {
		cfg.cross_topic_enabled = v;
	}
	if let Some(v) = setting::<f64>(repo, keys::WINDOW_HOURS).await {
		cfg.cluster_window = window_from_hours(v);
	}
	if let Some(v) = setting::<bool>(repo, keys::EVIDENCE_BOOST_ENABLED).await {
		cfg.evidence_boost_enabled = v;
	}
	if let Some(v) = setting::<f64>(repo, keys::EVIDENCE_BOOST).await {
		cfg.evidence_boost = v;
	}
	if let Some(v) = setting::<f64>(repo, keys::EVIDENCE_MIN_AGREEMENT).await {
		cfg.evidence_min_agreement = v;
	}
	if let Some(v) = setting::<usize>(repo, keys::MAX_ITEMS).await {
		cfg.max_items = v;
	}
	if let Some(v) = setting::<String>(repo, keys::TOPIC_LANGUAGE).await {
		cfg.topic_language = v;
	}
	if let Some(v) = setting::<String>(repo, keys::TOPIC_MODEL).await {
		cfg.topic_model = v;
	}

	cfg.sanitize();
	cfg
}

/// Fetch and decode one dynamic setting. Values stored as JSON strings
/// ("0.8", "true") are decoded from their contents as a second attempt.
async fn setting<T: DeserializeOwned>(repo: &dyn ClusterRepository, key: &str) -> Option<T> {
	let value = match repo.get_setting(key).await {
		Ok(Some(value)) => value,
		Ok(None) => {
			tracing::debug!(key, "Setting not found, using default");
			return None;
		}
		Err(e) => {
			tracing::debug!(key, error = %e, "Setting lookup failed, using default");
			return None;
		}
	};

	if let Ok(parsed) = serde_json::from_value::<T>(value.clone()) {
		return Some(parsed);
	}
	if let Some(Ok(parsed)) = value.as_str().map(|s| serde_json::from_str::<T>(s.trim())) {
		return Some(parsed);
	}
	tracing::debug!(key, value = %value, "Unparsable setting, using default");
	None
}

// ---------------------------------------------------------------------------
// Deduplication
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DedupMode {
	Strict,
	Semantic,
}

#[derive(Args, Debug, Clone)]
pub struct DedupConfig {
	/// Duplicate detection strategy
	#[arg(long = "dedup-mode", value_enum, default_value_t = DedupMode::Semantic, env = "DIGEST_DEDUP_MODE")]
	pub mode: DedupMode,

	/// Similarity above which a message is a semantic duplicate
	#[arg(long = "dedup-threshold", default_value_t = DEFAULT_DEDUP_THRESHOLD, env = "DIGEST_DEDUP_THRESHOLD")]
	pub threshold: f64,

	/// How far back the semantic strategy searches
	#[arg(long = "dedup-window-days", default_value_t = DEFAULT_DEDUP_WINDOW_DAYS, env = "DIGEST_DEDUP_WINDOW_DAYS")]
	pub window_days: i64,
}

impl Default for DedupConfig {
	fn default() -> Self {
		Self {
			mode: DedupMode::Semantic,
			threshold: DEFAULT_DEDUP_THRESHOLD,
			window_days: DEFAULT_DEDUP_WINDOW_DAYS,
		}
	}
}

impl DedupConfig {
	pub fn window(&self) -> chrono::Duration {
		let days = if self.window_days > 0 {
			self.window_days
		} else {
			DEFAULT_DEDUP_WINDOW_DAYS
		};
		chrono::Duration::days(days)
	}

	pub fn effective_threshold(&self) -> f64 {
		if in_unit_interval(self.threshold) {
			self.threshold
		} else {
			DEFAULT_DEDUP_THRESHOLD
		}
	}
}
