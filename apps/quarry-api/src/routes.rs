use std::{
	convert::Infallible,
	sync::{Arc, Mutex},
};

use axum::{
	Json, Router,
	extract::{Path, State},
	http::StatusCode,
	response::{
		IntoResponse, Response,
		sse::{Event as SseEvent, KeepAlive, Sse},
	},
	routing::{delete, get, post},
};
use futures::{Stream, stream};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, UnboundedSender};

use quarry_domain::{HistoryTurn, SearchResult, WebSearchConfig};
use quarry_service::{
	Event, EventBus, EventType, RequestContext, ResponseType, StreamAssembler, StreamResponse,
	event::{HandlerResult, handler_fn},
};

use crate::state::AppState;

pub const STREAM_PIPELINE: &str = "rag_stream";
pub const SYNC_PIPELINE: &str = "rag";

const CLIENT_EVENT_TYPES: [EventType; 7] = [
	EventType::Thinking,
	EventType::ToolCall,
	EventType::ToolResult,
	EventType::References,
	EventType::Answer,
	EventType::Reflection,
	EventType::Error,
];

pub fn router(state: AppState) -> Router {
	Router::new()
		.route("/health", get(health))
		.route("/v1/query", post(query_stream))
		.route("/v1/query/sync", post(query_sync))
		.route("/v1/sessions/{session_id}", delete(end_session))
		.with_state(state)
}

/// A query plus optional overrides of the configured retrieval defaults.
#[derive(Debug, Deserialize)]
pub struct QueryRequest {
	pub query: String,
	pub pipeline: Option<String>,
	#[serde(default)]
	pub session_id: String,
	#[serde(default)]
	pub tenant_id: String,
	#[serde(default)]
	pub collection_ids: Vec<String>,
	#[serde(default)]
	pub history: Vec<HistoryTurn>,
	pub vector_threshold: Option<f32>,
	pub keyword_threshold: Option<f32>,
	pub rerank_threshold: Option<f32>,
	pub embedding_top_k: Option<usize>,
	pub rerank_top_k: Option<usize>,
	pub enable_query_expansion: Option<bool>,
	pub web_search_enabled: Option<bool>,
	pub web_search: Option<WebSearchConfig>,
}

#[derive(Debug, Serialize)]
pub struct QueryResponse {
	pub request_id: String,
	pub answer: String,
	pub references: Vec<SearchResult>,
	pub no_results: bool,
}

#[derive(Debug, Serialize)]
pub struct EndSessionResponse {
	pub session_id: String,
	/// Web search passages deleted from the backend.
	pub released: usize,
}

async fn health() -> StatusCode {
	StatusCode::OK
}

async fn end_session(
	State(state): State<AppState>,
	Path(session_id): Path<String>,
) -> Result<Json<EndSessionResponse>, ApiError> {
	let released = quarry_service::end_session(
		state.sessions.as_ref(),
		state.web_search.as_deref(),
		&session_id,
	)
	.await
	.map_err(|err| {
		tracing::warn!(session_id = %session_id, error = %err, "Ending a session failed.");

		ApiError::from(err)
	})?;

	Ok(Json(EndSessionResponse { session_id, released }))
}

async fn query_stream(
	State(state): State<AppState>,
	Json(payload): Json<QueryRequest>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, ApiError> {
	let pipeline = resolve_pipeline(&state, payload.pipeline.as_deref(), STREAM_PIPELINE)?;
	let (tx, rx) = mpsc::unbounded_channel();
	let mut ctx = request_context(&state, payload, forwarding_bus(&tx))?;
	let disconnect = ctx.cancel.clone().drop_guard();
	let engine = state.engine.clone();

	tokio::spawn(async move {
		if let Err(err) = engine.run(&pipeline, &mut ctx).await {
			tracing::warn!(
				request_id = %ctx.request_id,
				pipeline = %pipeline,
				code = err.code(),
				error = %err,
				"Streamed query failed."
			);

			let mut record = StreamResponse::new(
				format!("{}:error", ctx.request_id),
				ResponseType::Error,
				err.to_string(),
				true,
			);

			record.data = serde_json::json!({ "error_code": err.code() });

			let _ = tx.send(record);
		}
	});

	// Dropping the stream (client gone) drops the guard, which cancels the run.
	let events = stream::unfold((rx, disconnect), |(mut rx, guard)| async move {
		let record = rx.recv().await?;

		Some((Ok(sse_event(&record)), (rx, guard)))
	});

	Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

async fn query_sync(
	State(state): State<AppState>,
	Json(payload): Json<QueryRequest>,
) -> Result<Json<QueryResponse>, ApiError> {
	let pipeline = resolve_pipeline(&state, payload.pipeline.as_deref(), SYNC_PIPELINE)?;
	let records = Arc::new(Mutex::new(Vec::new()));
	let bus = Arc::new(EventBus::default());

	for event_type in [EventType::Answer, EventType::References] {
		let records = records.clone();

		bus.on(
			event_type,
			handler_fn(move |event: Event| {
				let records = records.clone();

				async move {
					if let Some(record) = StreamResponse::from_event(&event) {
						records.lock().unwrap_or_else(|err| err.into_inner()).push(record);
					}

					HandlerResult::Ok(())
				}
			}),
		);
	}

	let mut ctx = request_context(&state, payload, bus)?;

	state.engine.run(&pipeline, &mut ctx).await.map_err(|err| {
		tracing::warn!(
			request_id = %ctx.request_id,
			pipeline = %pipeline,
			code = err.code(),
			error = %err,
			"Query failed."
		);

		ApiError::from(err)
	})?;

	let records = std::mem::take(&mut *records.lock().unwrap_or_else(|err| err.into_inner()));
	let mut assembler = StreamAssembler::default();
	let mut answer = String::new();
	let mut references = Vec::new();

	for message in records.into_iter().filter_map(|record| assembler.push(record)) {
		match message.response_type {
			ResponseType::Answer => answer.push_str(&message.content),
			ResponseType::References => references.extend(message.knowledge_references),
			_ => {},
		}
	}

	if answer.is_empty() {
		answer = ctx.chat_response.clone();
	}

	Ok(Json(QueryResponse {
		request_id: ctx.request_id,
		answer,
		references,
		no_results: ctx.no_results,
	}))
}

fn resolve_pipeline(
	state: &AppState,
	requested: Option<&str>,
	default: &str,
) -> Result<String, ApiError> {
	let name = requested.filter(|name| !name.trim().is_empty()).unwrap_or(default);

	if state.engine.pipeline(name).is_none() {
		return Err(json_error(
			StatusCode::NOT_FOUND,
			"NOT_FOUND",
			format!("Pipeline {name} is not configured."),
		));
	}

	Ok(name.to_string())
}

fn request_context(
	state: &AppState,
	payload: QueryRequest,
	bus: Arc<EventBus>,
) -> Result<RequestContext, ApiError> {
	if payload.query.trim().is_empty() {
		return Err(json_error(
			StatusCode::BAD_REQUEST,
			"INVALID_REQUEST",
			"query must be non-empty.",
		));
	}

	let mut ctx = RequestContext::new(payload.query, bus).with_retrieval(&state.retrieval);

	ctx.session_id = payload.session_id;
	ctx.tenant_id = payload.tenant_id;
	ctx.collection_ids = payload.collection_ids;
	ctx.history = payload.history;
	ctx.web_search = payload.web_search;

	if let Some(value) = payload.vector_threshold {
		ctx.vector_threshold = value;
	}
	if let Some(value) = payload.keyword_threshold {
		ctx.keyword_threshold = value;
	}
	if let Some(value) = payload.rerank_threshold {
		ctx.rerank_threshold = value;
	}
	if let Some(value) = payload.embedding_top_k {
		ctx.embedding_top_k = value;
	}
	if let Some(value) = payload.rerank_top_k {
		ctx.rerank_top_k = value;
	}
	if let Some(value) = payload.enable_query_expansion {
		ctx.enable_query_expansion = value;
	}
	if let Some(value) = payload.web_search_enabled {
		ctx.web_search_enabled = value;
	}

	Ok(ctx)
}

/// A per-request bus that forwards every client-facing record to `tx`.
fn forwarding_bus(tx: &UnboundedSender<StreamResponse>) -> Arc<EventBus> {
	let bus = Arc::new(EventBus::default());

	for event_type in CLIENT_EVENT_TYPES {
		let tx = tx.clone();

		bus.on(
			event_type,
			handler_fn(move |event: Event| {
				// A closed channel means the client left; the run is being cancelled.
				if let Some(record) = StreamResponse::from_event(&event) {
					let _ = tx.send(record);
				}

				async { HandlerResult::Ok(()) }
			}),
		);
	}

	bus
}

fn sse_event(record: &StreamResponse) -> SseEvent {
	let event = SseEvent::default().event(record.response_type.as_str());

	match serde_json::to_string(record) {
		Ok(data) => event.data(data),
		Err(err) => {
			tracing::error!(error = %err, "Stream record could not be serialized.");

			SseEvent::default().event(ResponseType::Error.as_str()).data(err.to_string())
		},
	}
}

#[derive(Debug, Serialize)]
struct ErrorBody {
	error_code: String,
	message: String,
}

#[derive(Debug)]
pub struct ApiError {
	status: StatusCode,
	error_code: String,
	message: String,
}
impl ApiError {
	fn new(status: StatusCode, error_code: impl Into<String>, message: impl Into<String>) -> Self {
		Self { status, error_code: error_code.into(), message: message.into() }
	}
}
impl From<quarry_service::Error> for ApiError {
	fn from(err: quarry_service::Error) -> Self {
		let code = err.code();
		let status = match code {
			"INVALID_REQUEST" | "VALIDATION_ERROR" | "SEARCH_UNAVAILABLE" =>
				StatusCode::BAD_REQUEST,
			"NOT_FOUND" | "SEARCH_NOTHING" => StatusCode::NOT_FOUND,
			"CANCELLED" => StatusCode::REQUEST_TIMEOUT,
			"PROVIDER_ERROR" | "MODEL_ERROR" | "STORAGE_ERROR" | "BACKEND_ERROR" =>
				StatusCode::BAD_GATEWAY,
			_ => StatusCode::INTERNAL_SERVER_ERROR,
		};

		json_error(status, code, err.to_string())
	}
}
impl IntoResponse for ApiError {
	fn into_response(self) -> Response {
		let body = ErrorBody { error_code: self.error_code, message: self.message };

		(self.status, Json(body)).into_response()
	}
}

pub fn json_error(status: StatusCode, code: &str, message: impl Into<String>) -> ApiError {
	ApiError::new(status, code, message)
}
