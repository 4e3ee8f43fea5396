use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Score assigned to converted web results; the engines never rank them directly.
pub const WEB_RESULT_SCORE: f32 = 0.6;

/// How a result was found.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
	Vector,
	Keyword,
	History,
	Web,
}
impl MatchType {
	pub fn as_str(self) -> &'static str {
		match self {
			Self::Vector => "vector",
			Self::Keyword => "keyword",
			Self::History => "history",
			Self::Web => "web",
		}
	}
}

/// The match-type selector of a single retrieval call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrieverType {
	Vector,
	Keyword,
}
impl RetrieverType {
	pub fn as_str(self) -> &'static str {
		match self {
			Self::Vector => "vector",
			Self::Keyword => "keyword",
		}
	}
}
impl From<RetrieverType> for MatchType {
	fn from(value: RetrieverType) -> Self {
		match value {
			RetrieverType::Vector => Self::Vector,
			RetrieverType::Keyword => Self::Keyword,
		}
	}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineType {
	Qdrant,
	Postgres,
	Memory,
}
impl EngineType {
	pub fn as_str(self) -> &'static str {
		match self {
			Self::Qdrant => "qdrant",
			Self::Postgres => "postgres",
			Self::Memory => "memory",
		}
	}
}

/// What an indexed unit was cut from. Persisted as an integer tag.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
	#[default]
	Chunk,
	Question,
	WebPage,
}
impl SourceType {
	pub fn as_i64(self) -> i64 {
		match self {
			Self::Chunk => 1,
			Self::Question => 2,
			Self::WebPage => 3,
		}
	}

	pub fn from_i64(value: i64) -> Option<Self> {
		match value {
			1 => Some(Self::Chunk),
			2 => Some(Self::Question),
			3 => Some(Self::WebPage),
			_ => None,
		}
	}
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
	pub id: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub parent_chunk_id: Option<String>,
	pub collection_id: String,
	pub knowledge_id: String,
	#[serde(default)]
	pub knowledge_title: String,
	pub content: String,
	#[serde(default)]
	pub chunk_index: i32,
	#[serde(default)]
	pub start_at: i32,
	#[serde(default)]
	pub end_at: i32,
	pub score: f32,
	pub match_type: MatchType,
	#[serde(default, skip_serializing_if = "HashMap::is_empty")]
	pub metadata: HashMap<String, String>,
}
impl SearchResult {
	/// Character offsets are known only when the range is non-empty.
	pub fn has_position(&self) -> bool {
		self.end_at > self.start_at
	}
}

/// Arguments of one hybrid search against a single collection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SearchParams {
	pub query_text: String,
	pub vector_threshold: f32,
	pub keyword_threshold: f32,
	pub match_count: usize,
	#[serde(default)]
	pub disable_vector_match: bool,
	#[serde(default)]
	pub disable_keywords_match: bool,
}

/// The indexed unit.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IndexInfo {
	pub source_id: String,
	pub source_type: SourceType,
	pub chunk_id: String,
	pub knowledge_id: String,
	pub collection_id: String,
	#[serde(default)]
	pub parent_chunk_id: Option<String>,
	pub content: String,
	#[serde(default)]
	pub chunk_index: i32,
	#[serde(default)]
	pub start_at: i32,
	#[serde(default)]
	pub end_at: i32,
	#[serde(default = "default_enabled")]
	pub is_enabled: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IndexWithScore {
	pub index: IndexInfo,
	/// Raw backend score, not comparable across match types.
	pub score: f32,
	pub match_type: MatchType,
}
impl IndexWithScore {
	pub fn into_search_result(self) -> SearchResult {
		let IndexWithScore { index, score, match_type } = self;

		SearchResult {
			id: index.chunk_id,
			parent_chunk_id: index.parent_chunk_id,
			collection_id: index.collection_id,
			knowledge_id: index.knowledge_id,
			knowledge_title: String::new(),
			content: index.content,
			chunk_index: index.chunk_index,
			start_at: index.start_at,
			end_at: index.end_at,
			score,
			match_type,
			metadata: HashMap::new(),
		}
	}
}

#[derive(Clone, Debug, PartialEq)]
pub struct RetrieveParams {
	pub retriever_type: RetrieverType,
	pub query: String,
	/// Required for vector retrieval, ignored otherwise.
	pub embedding: Vec<f32>,
	pub collection_ids: Vec<String>,
	pub exclude_collection_ids: Vec<String>,
	pub exclude_knowledge_ids: Vec<String>,
	pub exclude_chunk_ids: Vec<String>,
	pub top_k: usize,
	pub threshold: f32,
}
impl RetrieveParams {
	pub fn vector(
		embedding: Vec<f32>,
		collection_ids: Vec<String>,
		top_k: usize,
		threshold: f32,
	) -> Self {
		Self {
			retriever_type: RetrieverType::Vector,
			query: String::new(),
			embedding,
			collection_ids,
			exclude_collection_ids: Vec::new(),
			exclude_knowledge_ids: Vec::new(),
			exclude_chunk_ids: Vec::new(),
			top_k,
			threshold,
		}
	}

	pub fn keyword(query: impl Into<String>, collection_ids: Vec<String>, top_k: usize) -> Self {
		Self {
			retriever_type: RetrieverType::Keyword,
			query: query.into(),
			embedding: Vec::new(),
			collection_ids,
			exclude_collection_ids: Vec::new(),
			exclude_knowledge_ids: Vec::new(),
			exclude_chunk_ids: Vec::new(),
			top_k,
			threshold: 0.0,
		}
	}
}

/// One prior exchange of a session, oldest first in a history list.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoryTurn {
	pub query: String,
	pub answer: String,
	#[serde(default)]
	pub knowledge_references: Vec<SearchResult>,
}

/// Tenant web search settings carried by a request.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct WebSearchConfig {
	pub provider: String,
	#[serde(default)]
	pub api_key: String,
	#[serde(default = "default_max_results")]
	pub max_results: usize,
	#[serde(default)]
	pub include_date: bool,
	/// `none` or `rag`.
	#[serde(default = "default_compression_method")]
	pub compression_method: String,
	#[serde(default)]
	pub blacklist: Vec<String>,
	/// Passages kept per web page after compression.
	#[serde(default = "default_document_fragments")]
	pub document_fragments: usize,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct WebSearchResult {
	pub title: String,
	pub url: String,
	#[serde(default)]
	pub snippet: String,
	#[serde(default)]
	pub content: String,
	#[serde(default)]
	pub source: String,
	#[serde(default)]
	pub published_at: Option<String>,
}
impl WebSearchResult {
	pub fn into_search_result(self) -> SearchResult {
		let body = if self.content.trim().is_empty() { self.snippet } else { self.content };
		let content =
			if self.title.is_empty() { body } else { format!("{}\n{}", self.title, body) };
		let mut metadata = HashMap::new();

		metadata.insert("url".to_string(), self.url.clone());

		if !self.source.is_empty() {
			metadata.insert("source".to_string(), self.source);
		}
		if let Some(published_at) = self.published_at {
			metadata.insert("published_at".to_string(), published_at);
		}

		SearchResult {
			id: format!("web:{}", blake3::hash(self.url.as_bytes()).to_hex()),
			parent_chunk_id: None,
			collection_id: String::new(),
			knowledge_id: self.url,
			knowledge_title: self.title,
			content,
			chunk_index: 0,
			start_at: 0,
			end_at: 0,
			score: WEB_RESULT_SCORE,
			match_type: MatchType::Web,
			metadata,
		}
	}
}

fn default_enabled() -> bool {
	true
}

fn default_max_results() -> usize {
	5
}

fn default_compression_method() -> String {
	"none".to_string()
}

fn default_document_fragments() -> usize {
	3
}
