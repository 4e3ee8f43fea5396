use axum::{Json, Router, http::header, response::IntoResponse, routing::post};
use reqwest::header::AUTHORIZATION;
use serde_json::{Map, Value};
use tokio::{net::TcpListener, sync::mpsc};

use quarry_config::{EmbeddingProviderConfig, LlmProviderConfig, ProviderConfig};
use quarry_domain::WebSearchConfig;
use quarry_providers::ChatMessage;

async fn serve(router: Router) -> String {
	let listener = TcpListener::bind("127.0.0.1:0").await.expect("Failed to bind mock server.");
	let addr = listener.local_addr().expect("Failed to read mock server address.");

	tokio::spawn(async move {
		let _ = axum::serve(listener, router).await;
	});

	format!("http://{addr}")
}

fn chat_cfg(api_base: &str) -> LlmProviderConfig {
	LlmProviderConfig {
		provider_id: "mock".to_string(),
		api_base: api_base.to_string(),
		api_key: "secret".to_string(),
		path: "/chat/completions".to_string(),
		model: "mock-chat".to_string(),
		temperature: 0.1,
		timeout_ms: 5_000,
		default_headers: Map::new(),
	}
}

fn provider_cfg(api_base: &str, path: &str) -> ProviderConfig {
	ProviderConfig {
		provider_id: "mock".to_string(),
		api_base: api_base.to_string(),
		api_key: "secret".to_string(),
		path: path.to_string(),
		model: "mock".to_string(),
		timeout_ms: 5_000,
		default_headers: Map::new(),
	}
}

#[test]
fn builds_bearer_auth_header() {
	let headers =
		quarry_providers::auth_headers("secret", &Map::new()).expect("Failed to build headers.");
	let value = headers.get(AUTHORIZATION).expect("Missing authorization header.");

	assert_eq!(value, "Bearer secret");
}

#[tokio::test]
async fn embeddings_are_requested_with_configured_dimensions() {
	let router = Router::new().route(
		"/embeddings",
		post(|Json(body): Json<Value>| async move {
			let dims = body["dimensions"].as_u64().unwrap_or(0) as usize;
			let count = body["input"].as_array().map(Vec::len).unwrap_or(0);
			let data = (0..count)
				.map(|idx| serde_json::json!({ "index": idx, "embedding": vec![idx as f32; dims] }))
				.collect::<Vec<_>>();

			Json(serde_json::json!({ "data": data }))
		}),
	);
	let api_base = serve(router).await;
	let cfg = EmbeddingProviderConfig {
		provider_id: "mock".to_string(),
		api_base,
		api_key: "secret".to_string(),
		path: "embeddings".to_string(),
		model: "mock-embed".to_string(),
		dimensions: 3,
		timeout_ms: 5_000,
		default_headers: Map::new(),
	};
	let vectors = quarry_providers::embedding::embed(&cfg, &["a".to_string(), "b".to_string()])
		.await
		.expect("Embedding request failed.");

	assert_eq!(vectors, vec![vec![0.0; 3], vec![1.0; 3]]);
}

#[tokio::test]
async fn streamed_completion_forwards_each_delta() {
	let router = Router::new().route(
		"/chat/completions",
		post(|| async {
			let body = [
				r#"data: {"choices":[{"delta":{"role":"assistant"}}]}"#,
				r#"data: {"choices":[{"delta":{"content":"Refunds "}}]}"#,
				r#"data: {"choices":[{"delta":{"content":"take 14 days."}}]}"#,
				"data: [DONE]",
			]
			.join("\n\n");

			([(header::CONTENT_TYPE, "text/event-stream")], body + "\n\n").into_response()
		}),
	);
	let cfg = chat_cfg(&serve(router).await);
	let (tx, mut rx) = mpsc::unbounded_channel();
	let answer = quarry_providers::chat::complete_stream(
		&cfg,
		&[ChatMessage::user("How long do refunds take?")],
		&tx,
	)
	.await
	.expect("Streamed completion failed.");

	drop(tx);

	let mut deltas = Vec::new();

	while let Some(delta) = rx.recv().await {
		deltas.push(delta);
	}

	assert_eq!(answer, "Refunds take 14 days.");
	assert_eq!(deltas, vec!["Refunds ", "take 14 days."]);
}

#[tokio::test]
async fn blocking_completion_returns_message_content() {
	let router = Router::new().route(
		"/chat/completions",
		post(|Json(body): Json<Value>| async move {
			assert_eq!(body["stream"], Value::Bool(false));

			Json(serde_json::json!({ "choices": [{ "message": { "content": "Done." } }] }))
		}),
	);
	let cfg = chat_cfg(&serve(router).await);
	let answer = quarry_providers::chat::complete(&cfg, &[ChatMessage::user("Hi")])
		.await
		.expect("Completion failed.");

	assert_eq!(answer, "Done.");
}

#[tokio::test]
async fn rerank_scores_align_with_documents() {
	let router = Router::new().route(
		"/rerank",
		post(|| async {
			Json(serde_json::json!({
				"results": [
					{ "index": 1, "relevance_score": 0.9 },
					{ "index": 0, "relevance_score": 0.1 }
				]
			}))
		}),
	);
	let cfg = provider_cfg(&serve(router).await, "/rerank");
	let scores =
		quarry_providers::rerank::rerank(&cfg, "refund", &["a".to_string(), "b".to_string()])
			.await
			.expect("Rerank failed.");

	assert_eq!(scores, vec![0.1, 0.9]);
}

#[tokio::test]
async fn web_search_applies_blacklist_and_limit() {
	let router = Router::new().route(
		"/search",
		post(|| async {
			Json(serde_json::json!({
				"results": [
					{ "title": "Spam", "url": "https://ads.spam.example/x" },
					{ "title": "One", "url": "https://one.example", "content": "1" },
					{ "title": "Two", "url": "https://two.example", "snippet": "2" },
					{ "title": "Three", "url": "https://three.example", "snippet": "3" }
				]
			}))
		}),
	);
	let cfg = provider_cfg(&serve(router).await, "/search");
	let tenant = WebSearchConfig {
		provider: "mock".to_string(),
		max_results: 2,
		blacklist: vec!["spam.example".to_string()],
		..Default::default()
	};
	let results = quarry_providers::web_search::search(&cfg, &tenant, "refund")
		.await
		.expect("Web search failed.");
	let titles = results.iter().map(|result| result.title.as_str()).collect::<Vec<_>>();

	assert_eq!(titles, vec!["One", "Two"]);
}
