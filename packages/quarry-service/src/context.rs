use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use quarry_domain::{HistoryTurn, SearchResult, WebSearchConfig};

use crate::{
	event::{Event, EventBus},
	stream::StreamResponse,
};

/// Mutable state threaded through one pipeline run.
///
/// Stages run one at a time and take the context by exclusive reference. Any task spawned
/// inside a stage receives a clone, never a shared reference.
#[derive(Clone)]
pub struct RequestContext {
	pub session_id: String,
	pub request_id: String,
	pub tenant_id: String,
	pub query: String,
	/// Standalone form of `query`; equals `query` when no rewrite happened.
	pub rewrite_query: String,
	/// Oldest first.
	pub history: Vec<HistoryTurn>,
	/// Single-collection form kept for callers that predate `collection_ids`.
	pub collection_id: Option<String>,
	pub collection_ids: Vec<String>,
	pub vector_threshold: f32,
	pub keyword_threshold: f32,
	pub rerank_threshold: f32,
	pub embedding_top_k: usize,
	pub rerank_top_k: usize,
	pub max_history_turns: usize,
	pub enable_rewrite: bool,
	pub enable_query_expansion: bool,
	pub web_search_enabled: bool,
	pub web_search: Option<WebSearchConfig>,
	pub search_results: Vec<SearchResult>,
	pub rerank_results: Vec<SearchResult>,
	pub merge_results: Vec<SearchResult>,
	pub user_content: String,
	pub chat_response: String,
	/// Set when retrieval found nothing and the fallback stage answered instead.
	pub no_results: bool,
	pub event_bus: Arc<EventBus>,
	pub cancel: CancellationToken,
}
impl RequestContext {
	pub fn new(query: impl Into<String>, event_bus: Arc<EventBus>) -> Self {
		let query = query.into();

		Self {
			session_id: String::new(),
			request_id: Uuid::new_v4().to_string(),
			tenant_id: String::new(),
			rewrite_query: query.clone(),
			query,
			history: Vec::new(),
			collection_id: None,
			collection_ids: Vec::new(),
			vector_threshold: 0.0,
			keyword_threshold: 0.0,
			rerank_threshold: 0.0,
			embedding_top_k: 10,
			rerank_top_k: 5,
			max_history_turns: 5,
			enable_rewrite: false,
			enable_query_expansion: true,
			web_search_enabled: false,
			web_search: None,
			search_results: Vec::new(),
			rerank_results: Vec::new(),
			merge_results: Vec::new(),
			user_content: String::new(),
			chat_response: String::new(),
			no_results: false,
			event_bus,
			cancel: CancellationToken::new(),
		}
	}

	/// Copies the configured retrieval defaults onto the context.
	pub fn with_retrieval(mut self, retrieval: &quarry_config::Retrieval) -> Self {
		self.vector_threshold = retrieval.vector_threshold;
		self.keyword_threshold = retrieval.keyword_threshold;
		self.rerank_threshold = retrieval.rerank_threshold;
		self.embedding_top_k = retrieval.embedding_top_k;
		self.rerank_top_k = retrieval.rerank_top_k;
		self.max_history_turns = retrieval.max_history_turns;
		self.enable_rewrite = retrieval.enable_rewrite;
		self.enable_query_expansion = retrieval.enable_query_expansion;
		self.web_search_enabled = retrieval.web_search_enabled;

		self
	}

	/// Plural collection IDs, falling back to the single legacy field.
	pub fn target_collection_ids(&self) -> Vec<String> {
		if !self.collection_ids.is_empty() {
			return self.collection_ids.clone();
		}

		self.collection_id.iter().filter(|id| !id.is_empty()).cloned().collect()
	}

	/// The query retrieval should use.
	pub fn search_query(&self) -> &str {
		if self.rewrite_query.trim().is_empty() { &self.query } else { &self.rewrite_query }
	}

	/// Stamps the event with this request's identity before emitting it.
	pub fn event(&self, event: Event) -> Event {
		event.with_session_id(self.session_id.clone()).with_request_id(self.request_id.clone())
	}

	/// Emits a client-facing record. Delivery failures are logged, not propagated: a stage
	/// must not fail because a consumer went away.
	pub async fn emit_response(&self, record: StreamResponse) {
		let response_type = record.response_type;

		if let Err(err) = self.event_bus.emit(self.event(record.into_event())).await {
			tracing::warn!(
				request_id = %self.request_id,
				response_type = response_type.as_str(),
				error = %err,
				"Stream record was not delivered."
			);
		}
	}

	pub async fn emit_telemetry(&self, event: Event) {
		if let Err(err) = self.event_bus.emit(self.event(event)).await {
			tracing::debug!(
				request_id = %self.request_id,
				error = %err,
				"Telemetry event dropped."
			);
		}
	}

	/// ID shared by every answer fragment of this request.
	pub fn answer_id(&self) -> String {
		format!("{}:answer", self.request_id)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn legacy_collection_id_is_the_fallback_target() {
		let mut ctx = RequestContext::new("q", Arc::new(EventBus::default()));

		assert!(ctx.target_collection_ids().is_empty());

		ctx.collection_id = Some("legacy".to_string());

		assert_eq!(ctx.target_collection_ids(), vec!["legacy"]);

		ctx.collection_ids = vec!["a".to_string(), "b".to_string()];

		assert_eq!(ctx.target_collection_ids(), vec!["a", "b"]);
	}

	#[test]
	fn clones_do_not_share_result_lists() {
		let ctx = RequestContext::new("q", Arc::new(EventBus::default()));
		let mut copy = ctx.clone();

		copy.collection_ids.push("kb".to_string());
		copy.rewrite_query = "other".to_string();

		assert!(ctx.collection_ids.is_empty());
		assert_eq!(ctx.search_query(), "q");
	}
}
