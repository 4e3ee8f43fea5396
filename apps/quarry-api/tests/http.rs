use std::{collections::BTreeMap, sync::Arc};

use axum::{
	Router,
	body::{self, Body},
	http::{Request, StatusCode, header},
};
use serde_json::{Map, Value, json};
use tokio::sync::mpsc::UnboundedSender;
use tower::util::ServiceExt;

use quarry_api::{routes, state::AppState};
use quarry_config::{
	Config, EmbeddingProviderConfig, Fallback, LlmProviderConfig, Prompt, ProviderConfig,
	Providers, Retrieval, Service, Storage,
};
use quarry_domain::{IndexInfo, SourceType};
use quarry_providers::ChatMessage;
use quarry_service::{
	BoxFuture, ChatProvider, EmbeddingProvider, RerankProvider, ResponseType, StreamAssembler,
	StreamResponse,
};
use quarry_storage::{IndexParams, RetrievalBackend, memory::MemoryBackend};

const ANSWER: &str = "Refunds are issued within 30 days.";
const FALLBACK_RESPONSE: &str = "No matching documents were found.";

struct TopicEmbedding;
impl EmbeddingProvider for TopicEmbedding {
	fn embed<'a>(
		&'a self,
		_: &'a EmbeddingProviderConfig,
		texts: &'a [String],
	) -> BoxFuture<'a, quarry_providers::Result<Vec<Vec<f32>>>> {
		Box::pin(async move {
			Ok(texts
				.iter()
				.map(|text| {
					let text = text.to_lowercase();

					vec![if text.contains("refund") { 1.0 } else { 0.0 }, 0.1]
				})
				.collect())
		})
	}
}

struct KeepAll;
impl RerankProvider for KeepAll {
	fn rerank<'a>(
		&'a self,
		_: &'a ProviderConfig,
		_: &'a str,
		docs: &'a [String],
	) -> BoxFuture<'a, quarry_providers::Result<Vec<f32>>> {
		Box::pin(async move { Ok(vec![1.0; docs.len()]) })
	}
}

struct CannedChat;
impl ChatProvider for CannedChat {
	fn complete<'a>(
		&'a self,
		_: &'a LlmProviderConfig,
		_: &'a [ChatMessage],
	) -> BoxFuture<'a, quarry_providers::Result<String>> {
		Box::pin(async move { Ok(ANSWER.to_string()) })
	}

	fn complete_stream<'a>(
		&'a self,
		_: &'a LlmProviderConfig,
		_: &'a [ChatMessage],
		tx: UnboundedSender<String>,
	) -> BoxFuture<'a, quarry_providers::Result<String>> {
		Box::pin(async move {
			for piece in ANSWER.split_inclusive(' ') {
				let _ = tx.send(piece.to_string());
			}

			Ok(ANSWER.to_string())
		})
	}
}

fn provider() -> ProviderConfig {
	ProviderConfig {
		provider_id: "test".to_string(),
		api_base: "http://127.0.0.1:1".to_string(),
		api_key: "key".to_string(),
		path: "/".to_string(),
		model: "test".to_string(),
		timeout_ms: 1_000,
		default_headers: Map::new(),
	}
}

fn test_config() -> Config {
	Config {
		service: Service { http_bind: "127.0.0.1:0".to_string(), log_level: "info".to_string() },
		storage: Storage { backend: "memory".to_string(), qdrant: None, postgres: None },
		providers: Providers {
			embedding: EmbeddingProviderConfig {
				provider_id: "test".to_string(),
				api_base: "http://127.0.0.1:1".to_string(),
				api_key: "key".to_string(),
				path: "/embeddings".to_string(),
				model: "test".to_string(),
				dimensions: 2,
				timeout_ms: 1_000,
				default_headers: Map::new(),
			},
			rerank: provider(),
			chat: LlmProviderConfig {
				provider_id: "test".to_string(),
				api_base: "http://127.0.0.1:1".to_string(),
				api_key: "key".to_string(),
				path: "/chat/completions".to_string(),
				model: "test".to_string(),
				temperature: 0.0,
				timeout_ms: 1_000,
				default_headers: Map::new(),
			},
			web_search: None,
		},
		retrieval: Retrieval {
			vector_threshold: 0.5,
			keyword_threshold: 0.1,
			rerank_threshold: 0.5,
			embedding_top_k: 4,
			rerank_top_k: 3,
			enable_query_expansion: true,
			enable_rewrite: false,
			web_search_enabled: false,
			max_history_turns: 5,
		},
		prompt: Prompt {
			system: "Answer from the context only.".to_string(),
			context_template: "{{contexts}}\n\nQuestion: {{query}}".to_string(),
			rewrite: "{{history}}\n{{query}}".to_string(),
			no_match_prefix: None,
		},
		fallback: Fallback {
			strategy: "fixed".to_string(),
			response: FALLBACK_RESPONSE.to_string(),
			prompt: None,
		},
		pipelines: BTreeMap::new(),
	}
}

async fn app() -> Router {
	let backend = Arc::new(MemoryBackend::new());
	let item = IndexInfo {
		source_id: "c1".to_string(),
		source_type: SourceType::Chunk,
		chunk_id: "c1".to_string(),
		knowledge_id: "policy".to_string(),
		collection_id: "kb".to_string(),
		parent_chunk_id: None,
		content: "Refunds are issued within 30 days of purchase.".to_string(),
		chunk_index: 0,
		start_at: 0,
		end_at: 47,
		is_enabled: true,
	};
	let params = IndexParams { embeddings: [("c1".to_string(), vec![1.0, 0.1])].into() };

	backend.batch_save(&[item], &params).await.expect("Seeding should succeed.");

	let providers = quarry_service::Providers::new(
		Arc::new(TopicEmbedding),
		Arc::new(KeepAll),
		Arc::new(CannedChat),
	);
	let state =
		AppState::from_parts(test_config(), backend, providers).expect("State should build.");

	routes::router(state)
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
	Request::builder()
		.method("POST")
		.uri(uri)
		.header(header::CONTENT_TYPE, "application/json")
		.body(Body::from(body.to_string()))
		.expect("Request should build.")
}

async fn json_body(response: axum::response::Response) -> Value {
	let bytes =
		body::to_bytes(response.into_body(), usize::MAX).await.expect("Body should be readable.");

	serde_json::from_slice(&bytes).expect("Body should be JSON.")
}

async fn sse_records(response: axum::response::Response) -> Vec<StreamResponse> {
	let bytes =
		body::to_bytes(response.into_body(), usize::MAX).await.expect("Body should be readable.");
	let text = String::from_utf8(bytes.to_vec()).expect("Body should be UTF-8.");

	text.lines()
		.filter_map(|line| line.strip_prefix("data: "))
		.map(|data| serde_json::from_str(data).expect("Every record should be JSON."))
		.collect()
}

#[tokio::test]
async fn health_is_ok() {
	let response = app()
		.await
		.oneshot(Request::builder().uri("/health").body(Body::empty()).expect("Request."))
		.await
		.expect("Router should respond.");

	assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn sync_query_returns_the_answer_and_its_references() {
	let response = app()
		.await
		.oneshot(post_json(
			"/v1/query/sync",
			json!({ "query": "How do refunds work?", "collection_ids": ["kb"] }),
		))
		.await
		.expect("Router should respond.");

	assert_eq!(response.status(), StatusCode::OK);

	let body = json_body(response).await;

	assert_eq!(body["answer"], ANSWER);
	assert_eq!(body["no_results"], false);
	assert_eq!(body["references"][0]["id"], "c1");
}

#[tokio::test]
async fn sync_query_without_hits_answers_with_the_fallback() {
	let response = app()
		.await
		.oneshot(post_json(
			"/v1/query/sync",
			json!({ "query": "opening hours", "collection_ids": ["kb"] }),
		))
		.await
		.expect("Router should respond.");

	assert_eq!(response.status(), StatusCode::OK);

	let body = json_body(response).await;

	assert_eq!(body["answer"], FALLBACK_RESPONSE);
	assert_eq!(body["no_results"], true);
	assert_eq!(body["references"], json!([]));
}

#[tokio::test]
async fn request_errors_are_coded() {
	let cases = [
		(
			json!({ "query": "  ", "collection_ids": ["kb"] }),
			StatusCode::BAD_REQUEST,
			"INVALID_REQUEST",
		),
		(
			json!({ "query": "refunds", "collection_ids": ["kb"], "pipeline": "missing" }),
			StatusCode::NOT_FOUND,
			"NOT_FOUND",
		),
		(json!({ "query": "refunds" }), StatusCode::BAD_REQUEST, "SEARCH_UNAVAILABLE"),
	];

	for (payload, status, code) in cases {
		let response = app()
			.await
			.oneshot(post_json("/v1/query/sync", payload))
			.await
			.expect("Router should respond.");

		assert_eq!(response.status(), status);
		assert_eq!(json_body(response).await["error_code"], code);
	}
}

#[tokio::test]
async fn streamed_query_sends_references_then_answer_fragments() {
	let response = app()
		.await
		.oneshot(post_json(
			"/v1/query",
			json!({ "query": "How do refunds work?", "collection_ids": ["kb"] }),
		))
		.await
		.expect("Router should respond.");

	assert_eq!(response.status(), StatusCode::OK);

	let records = sse_records(response).await;

	assert_eq!(records[0].response_type, ResponseType::References);
	assert_eq!(records[0].knowledge_references[0].id, "c1");
	assert!(records.iter().filter(|r| r.response_type == ResponseType::Answer).count() > 2);

	let mut assembler = StreamAssembler::default();
	let answers = records
		.into_iter()
		.filter(|r| r.response_type == ResponseType::Answer)
		.filter_map(|r| assembler.push(r))
		.collect::<Vec<_>>();

	assert_eq!(answers.len(), 1);
	assert_eq!(answers[0].content, ANSWER);
	assert!(!assembler.has_pending());
}

#[tokio::test]
async fn streamed_pipeline_failure_arrives_as_an_error_record() {
	let response = app()
		.await
		.oneshot(post_json("/v1/query", json!({ "query": "How do refunds work?" })))
		.await
		.expect("Router should respond.");

	assert_eq!(response.status(), StatusCode::OK);

	let records = sse_records(response).await;
	let last = records.last().expect("An error record should be sent.");

	assert_eq!(last.response_type, ResponseType::Error);
	assert!(last.done);
	assert_eq!(last.data["error_code"], "SEARCH_UNAVAILABLE");
}

#[tokio::test]
async fn ending_a_session_reports_released_passages() {
	let request = Request::builder()
		.method("DELETE")
		.uri("/v1/sessions/session-1")
		.body(Body::empty())
		.expect("Request should build.");
	let response = app().await.oneshot(request).await.expect("Router should respond.");

	assert_eq!(response.status(), StatusCode::OK);

	let body = json_body(response).await;

	assert_eq!(body["session_id"], "session-1");
	assert_eq!(body["released"], 0);
}
