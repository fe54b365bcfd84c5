use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClusterError {
	#[error("Storage error: {0}")]
	Storage(String),
	#[error("Embedding lookup failed: {0}")]
	Embedding(String),
	#[error("LLM error: {0}")]
	Llm(String),
	#[error("Clustering run cancelled")]
	Cancelled,
	#[error("Invalid configuration: {0}")]
	InvalidConfig(String),
	#[error("Snapshot error: {0}")]
	Snapshot(String),
	#[error("IO error: {0}")]
	Io(#[from] std::io::Error),
	#[error("JSON error: {0}")]
	Json(#[from] serde_json::Error),
}

impl ClusterError {
	pub fn code(&self) -> &str {
		match self {
			Self::Storage(_) => "CLUSTER_STORAGE",
			Self::Embedding(_) => "CLUSTER_EMBEDDING",
			Self::Llm(_) => "CLUSTER_LLM",
			Self::Cancelled => "CLUSTER_CANCELLED",
			Self::InvalidConfig(_) => "CLUSTER_INVALID_CONFIG",
			Self::Snapshot(_) => "CLUSTER_SNAPSHOT",
			Self::Io(_) => "CLUSTER_IO",
			Self::Json(_) => "CLUSTER_JSON",
		}
	}

	/// Cancellation must reach the caller; everything else may be tolerated
	/// at per-item boundaries.
	pub fn is_cancelled(&self) -> bool {
		matches!(self, Self::Cancelled)
	}

	pub fn to_json(&self) -> serde_json::Value {
		serde_json::json!({
			"code": self.code(),
			"message": self.to_string(),
		})
	}
}
