use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::{Map, Value};

#[derive(Debug, Deserialize)]
pub struct Config {
	pub service: Service,
	pub storage: Storage,
	pub providers: Providers,
	pub retrieval: Retrieval,
	pub prompt: Prompt,
	pub fallback: Fallback,
	/// Named pipelines. Filled with the built-in table when left empty.
	#[serde(default)]
	pub pipelines: BTreeMap<String, PipelineDefinition>,
}

#[derive(Debug, Deserialize)]
pub struct Service {
	pub http_bind: String,
	pub log_level: String,
}

#[derive(Debug, Deserialize)]
pub struct Storage {
	/// One of `qdrant`, `postgres`, or `memory`.
	pub backend: String,
	pub qdrant: Option<Qdrant>,
	pub postgres: Option<Postgres>,
}

#[derive(Debug, Deserialize)]
pub struct Postgres {
	pub dsn: String,
	pub pool_max_conns: u32,
	pub vector_dim: u32,
}

#[derive(Debug, Deserialize)]
pub struct Qdrant {
	pub url: String,
	pub collection: String,
	pub vector_dim: u32,
}

#[derive(Debug, Deserialize)]
pub struct Providers {
	pub embedding: EmbeddingProviderConfig,
	pub rerank: ProviderConfig,
	pub chat: LlmProviderConfig,
	pub web_search: Option<ProviderConfig>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct EmbeddingProviderConfig {
	pub provider_id: String,
	pub api_base: String,
	pub api_key: String,
	pub path: String,
	pub model: String,
	pub dimensions: u32,
	pub timeout_ms: u64,
	#[serde(default)]
	pub default_headers: Map<String, Value>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ProviderConfig {
	pub provider_id: String,
	pub api_base: String,
	pub api_key: String,
	pub path: String,
	pub model: String,
	pub timeout_ms: u64,
	#[serde(default)]
	pub default_headers: Map<String, Value>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct LlmProviderConfig {
	pub provider_id: String,
	pub api_base: String,
	pub api_key: String,
	pub path: String,
	pub model: String,
	pub temperature: f32,
	pub timeout_ms: u64,
	#[serde(default)]
	pub default_headers: Map<String, Value>,
}

/// Per-request defaults; a request may override any of them.
#[derive(Clone, Debug, Deserialize)]
pub struct Retrieval {
	pub vector_threshold: f32,
	pub keyword_threshold: f32,
	pub rerank_threshold: f32,
	pub embedding_top_k: usize,
	pub rerank_top_k: usize,
	#[serde(default = "default_true")]
	pub enable_query_expansion: bool,
	#[serde(default)]
	pub enable_rewrite: bool,
	#[serde(default)]
	pub web_search_enabled: bool,
	#[serde(default = "default_max_history_turns")]
	pub max_history_turns: usize,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Prompt {
	pub system: String,
	/// Rendered with `{{query}}` and `{{contexts}}`.
	pub context_template: String,
	#[serde(default = "default_rewrite_prompt")]
	pub rewrite: String,
	pub no_match_prefix: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Fallback {
	/// One of `fixed` or `model`.
	pub strategy: String,
	pub response: String,
	/// Used by the `model` strategy. Rendered with `{{query}}`.
	pub prompt: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct PipelineDefinition {
	pub stages: Vec<String>,
	pub fallback: Option<String>,
}

pub const DEFAULT_PIPELINES: [(&str, &[&str], Option<&str>); 4] = [
	("chat", &["complete"], None),
	("chat_stream", &["complete_stream", "stream_filter"], None),
	("rag", &["hybrid_search", "rerank", "merge", "build_prompt", "complete"], Some("fallback")),
	(
		"rag_stream",
		&[
			"rewrite_query",
			"hybrid_search",
			"rerank",
			"merge",
			"filter_top_k",
			"build_prompt",
			"complete_stream",
			"stream_filter",
		],
		Some("fallback"),
	),
];

pub fn default_pipelines() -> BTreeMap<String, PipelineDefinition> {
	DEFAULT_PIPELINES
		.iter()
		.map(|(name, stages, fallback)| {
			(
				name.to_string(),
				PipelineDefinition {
					stages: stages.iter().map(|stage| stage.to_string()).collect(),
					fallback: fallback.map(str::to_string),
				},
			)
		})
		.collect()
}

fn default_true() -> bool {
	true
}

fn default_max_history_turns() -> usize {
	5
}

fn default_rewrite_prompt() -> String {
	"Rewrite the last user question into a standalone question using the conversation so far. \
Reply with the rewritten question only.\n\n{{history}}\n\nQuestion: {{query}}"
		.to_string()
}
