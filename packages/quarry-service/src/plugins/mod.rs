//! Stage plugins of the default pipelines.

pub mod completion;
pub mod fallback;
pub mod merge;
pub mod prompt;
pub mod rerank;
pub mod rewrite;
pub mod search;
pub mod timer;

pub use completion::{Completion, StreamFilter};
pub use fallback::FallbackResponder;
pub use merge::{FilterTopK, MergeResults};
pub use prompt::BuildPrompt;
pub use rerank::Rerank;
pub use rewrite::RewriteQuery;
pub use search::SearchFusion;
pub use timer::StageTimer;

use std::sync::Arc;

use quarry_config::{Fallback, LlmProviderConfig, Prompt, ProviderConfig};

use crate::{
	KnowledgeBaseService, PipelineEngineBuilder, Providers, SessionStore, WebSearchService,
};

/// Everything the default plugins need from the composition root.
#[derive(Clone)]
pub struct PluginDeps {
	pub providers: Providers,
	pub knowledge: Arc<dyn KnowledgeBaseService>,
	/// `None` when no web search provider is configured.
	pub web_search: Option<Arc<dyn WebSearchService>>,
	pub sessions: Arc<dyn SessionStore>,
	pub rerank_cfg: ProviderConfig,
	pub chat_cfg: LlmProviderConfig,
	pub prompt: Prompt,
	pub fallback: Fallback,
}

/// Registers the stage timer first so it wraps every functional plugin, then one functional
/// plugin per stage.
pub fn register_defaults(
	builder: PipelineEngineBuilder,
	deps: &PluginDeps,
) -> PipelineEngineBuilder {
	let no_match_prefix = deps.prompt.no_match_prefix.clone().filter(|prefix| !prefix.is_empty());

	builder
		.register(Arc::new(StageTimer))
		.register(Arc::new(RewriteQuery::new(
			deps.providers.chat.clone(),
			deps.chat_cfg.clone(),
			deps.prompt.rewrite.clone(),
		)))
		.register(Arc::new(SearchFusion::new(
			deps.knowledge.clone(),
			deps.web_search.clone(),
			deps.sessions.clone(),
		)))
		.register(Arc::new(Rerank::new(deps.providers.rerank.clone(), deps.rerank_cfg.clone())))
		.register(Arc::new(MergeResults))
		.register(Arc::new(FilterTopK))
		.register(Arc::new(BuildPrompt::new(deps.prompt.context_template.clone())))
		.register(Arc::new(Completion::new(
			deps.providers.chat.clone(),
			deps.chat_cfg.clone(),
			deps.prompt.system.clone(),
			no_match_prefix.clone(),
			deps.fallback.response.clone(),
		)))
		.register(Arc::new(StreamFilter::new(no_match_prefix, deps.fallback.response.clone())))
		.register(Arc::new(FallbackResponder::new(
			deps.providers.chat.clone(),
			deps.chat_cfg.clone(),
			deps.fallback.clone(),
		)))
}
