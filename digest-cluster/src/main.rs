use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use digest_cluster_engine::config::ClusteringDefaults;
use digest_cluster_engine::engine::ClusterEngine;
use digest_cluster_engine::error::ClusterError;
use digest_cluster_engine::snapshot::load_snapshot;
use digest_cluster_engine::types::{ClusterSource, PersistedCluster};

#[derive(Parser, Debug)]
#[command(
	name = "digest-cluster-engine",
	version,
	about = "Cluster one digest window from a snapshot file"
)]
struct Cli {
	/// Snapshot to cluster (JSON, optionally gzipped)
	#[arg(long, env = "DIGEST_CLUSTER_SNAPSHOT")]
	snapshot: PathBuf,

	/// Override the snapshot's cluster source: "digest" or "research"
	#[arg(long)]
	source: Option<ClusterSource>,

	/// Log filter used when RUST_LOG is unset
	#[arg(long, default_value = "info", env = "DIGEST_CLUSTER_LOG_LEVEL")]
	log_level: String,

	#[command(flatten)]
	clustering: ClusteringDefaults,
}

/// One NDJSON line on stdout.
#[derive(Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum OutputLine<'a> {
	Cluster(&'a PersistedCluster),
	Summary {
		source: ClusterSource,
		clusters: usize,
		#[serde(rename = "clusteredItems")]
		clustered_items: usize,
		#[serde(rename = "itemsConsidered")]
		items_considered: usize,
		#[serde(rename = "itemsTruncated")]
		items_truncated: usize,
		#[serde(rename = "topicGroups")]
		topic_groups: usize,
		#[serde(rename = "clustersDemoted")]
		clusters_demoted: usize,
		#[serde(rename = "clustersBelowMinSize")]
		clusters_below_min_size: usize,
		#[serde(rename = "membershipsFailed")]
		memberships_failed: usize,
	},
	Error {
		error: serde_json::Value,
	},
}

fn emit(out: &mut impl Write, line: &OutputLine<'_>) -> Result<()> {
	serde_json::to_writer(&mut *out, line)?;
	out.write_all(b"\n")?;
	Ok(())
}

async fn run(cli: Cli, cancel: CancellationToken) -> Result<()> {
	let snapshot = load_snapshot(&cli.snapshot)
		.map_err(ClusterError::from)
		.with_context(|| format!("loading snapshot {}", cli.snapshot.display()))?;
	let source = cli.source.unwrap_or(snapshot.source);

	let store = Arc::new(snapshot.to_store());
	let engine = ClusterEngine::new(store.clone(), cli.clustering).with_embeddings(store);

	let summary = engine
		.cluster_window(snapshot.window, source, &snapshot.items, &cancel)
		.await?;

	let stdout = std::io::stdout();
	let mut out = stdout.lock();
	for cluster in &summary.clusters {
		emit(&mut out, &OutputLine::Cluster(cluster))?;
	}
	emit(
		&mut out,
		&OutputLine::Summary {
			source,
			clusters: summary.clusters.len(),
			clustered_items: summary.clustered_item_count(),
			items_considered: summary.items_considered,
			items_truncated: summary.items_truncated,
			topic_groups: summary.topic_groups,
			clusters_demoted: summary.clusters_demoted,
			clusters_below_min_size: summary.clusters_below_min_size,
			memberships_failed: summary.memberships_failed,
		},
	)?;
	out.flush()?;
	Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
	let cli = Cli::parse();

	// Logs go to stderr; stdout carries only NDJSON results
	tracing_subscriber::fmt()
		.with_writer(std::io::stderr)
		.with_env_filter(
			tracing_subscriber::EnvFilter::try_from_default_env()
				.unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level)),
		)
		.init();

	let cancel = CancellationToken::new();
	let on_signal = cancel.clone();
	tokio::spawn(async move {
		if tokio::signal::ctrl_c().await.is_ok() {
			tracing::warn!("Interrupted, cancelling run");
			on_signal.cancel();
		}
	});

	if let Err(e) = run(cli, cancel).await {
		tracing::error!("Clustering failed: {:#}", e);
		let error = match e.downcast_ref::<ClusterError>() {
			Some(cluster_err) => cluster_err.to_json(),
			None => serde_json::json!({ "code": "CLUSTER_INTERNAL", "message": format!("{:#}", e) }),
		};
		let mut out = std::io::stdout().lock();
		emit(&mut out, &OutputLine::Error { error })?;
		out.flush()?;
		std::process::exit(1);
	}
	Ok(())
}
