//! Query pipeline: request context, event bus, pipeline engine, and the stage plugins.

pub mod context;
pub mod event;
pub mod knowledge;
pub mod pipeline;
pub mod plugins;
pub mod stream;
pub mod web;

mod error;

pub use context::RequestContext;
pub use error::{Error, Result};
pub use event::{DispatchMode, Event, EventBus, EventHandler, EventType};
pub use knowledge::BackendKnowledgeBase;
pub use pipeline::{
	Next, PipelineEngine, PipelineEngineBuilder, PipelineSpec, Plugin, PluginError,
	PluginErrorKind, PluginResult, Stage,
};
pub use stream::{AssembledMessage, ResponseType, StreamAssembler, StreamResponse};
pub use web::{
	CompressOutcome, CompressRequest, DefaultWebSearch, InMemorySessionStore, RagCompressor,
	SessionStore, TempKbState, WebSearchService, end_session,
};

use std::{future::Future, pin::Pin, sync::Arc};

use tokio::sync::mpsc::UnboundedSender;

use quarry_config::{EmbeddingProviderConfig, LlmProviderConfig, ProviderConfig};
use quarry_domain::{SearchParams, SearchResult};
use quarry_providers::{ChatMessage, chat, embedding, rerank};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub trait EmbeddingProvider
where
	Self: Send + Sync,
{
	fn embed<'a>(
		&'a self,
		cfg: &'a EmbeddingProviderConfig,
		texts: &'a [String],
	) -> BoxFuture<'a, quarry_providers::Result<Vec<Vec<f32>>>>;
}

pub trait RerankProvider
where
	Self: Send + Sync,
{
	fn rerank<'a>(
		&'a self,
		cfg: &'a ProviderConfig,
		query: &'a str,
		docs: &'a [String],
	) -> BoxFuture<'a, quarry_providers::Result<Vec<f32>>>;
}

pub trait ChatProvider
where
	Self: Send + Sync,
{
	fn complete<'a>(
		&'a self,
		cfg: &'a LlmProviderConfig,
		messages: &'a [ChatMessage],
	) -> BoxFuture<'a, quarry_providers::Result<String>>;

	/// Sends each content delta on `tx`; the sender is dropped when the call returns.
	fn complete_stream<'a>(
		&'a self,
		cfg: &'a LlmProviderConfig,
		messages: &'a [ChatMessage],
		tx: UnboundedSender<String>,
	) -> BoxFuture<'a, quarry_providers::Result<String>>;
}

/// Collection-scoped hybrid search. The fusion stage depends only on this signature.
pub trait KnowledgeBaseService
where
	Self: Send + Sync,
{
	fn hybrid_search<'a>(
		&'a self,
		collection_id: &'a str,
		params: &'a SearchParams,
	) -> BoxFuture<'a, Result<Vec<SearchResult>>>;
}

#[derive(Clone)]
pub struct Providers {
	pub embedding: Arc<dyn EmbeddingProvider>,
	pub rerank: Arc<dyn RerankProvider>,
	pub chat: Arc<dyn ChatProvider>,
}
impl Providers {
	pub fn new(
		embedding: Arc<dyn EmbeddingProvider>,
		rerank: Arc<dyn RerankProvider>,
		chat: Arc<dyn ChatProvider>,
	) -> Self {
		Self { embedding, rerank, chat }
	}
}
impl Default for Providers {
	fn default() -> Self {
		let provider = Arc::new(DefaultProviders);

		Self { embedding: provider.clone(), rerank: provider.clone(), chat: provider }
	}
}

struct DefaultProviders;
impl EmbeddingProvider for DefaultProviders {
	fn embed<'a>(
		&'a self,
		cfg: &'a EmbeddingProviderConfig,
		texts: &'a [String],
	) -> BoxFuture<'a, quarry_providers::Result<Vec<Vec<f32>>>> {
		Box::pin(embedding::embed(cfg, texts))
	}
}
impl RerankProvider for DefaultProviders {
	fn rerank<'a>(
		&'a self,
		cfg: &'a ProviderConfig,
		query: &'a str,
		docs: &'a [String],
	) -> BoxFuture<'a, quarry_providers::Result<Vec<f32>>> {
		Box::pin(rerank::rerank(cfg, query, docs))
	}
}
impl ChatProvider for DefaultProviders {
	fn complete<'a>(
		&'a self,
		cfg: &'a LlmProviderConfig,
		messages: &'a [ChatMessage],
	) -> BoxFuture<'a, quarry_providers::Result<String>> {
		Box::pin(chat::complete(cfg, messages))
	}

	fn complete_stream<'a>(
		&'a self,
		cfg: &'a LlmProviderConfig,
		messages: &'a [ChatMessage],
		tx: UnboundedSender<String>,
	) -> BoxFuture<'a, quarry_providers::Result<String>> {
		Box::pin(async move { chat::complete_stream(cfg, messages, &tx).await })
	}
}
