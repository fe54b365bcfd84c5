pub mod builder;
pub mod coherence;
pub mod config;
pub mod cosine;
pub mod deduplication;
pub mod engine;
pub mod error;
pub mod evidence;
pub mod labeling;
pub mod memory;
pub mod ports;
pub mod snapshot;
pub mod text;
pub mod topic;
pub mod types;
