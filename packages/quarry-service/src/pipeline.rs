//! Named pipelines: fixed stage sequences, each stage a chain of plugins.
//!
//! Every stage of a pipeline runs in order. Inside a stage the first registered plugin is
//! invoked with a [`Next`] continuation; calling it runs the rest of that stage's chain.
//!
//! - Calling `next` and returning its result proceeds normally.
//! - Returning an error aborts the stage and the whole run.
//! - Returning `Ok` without calling `next` skips the remaining plugins of that stage only.
//!
//! A [`PluginErrorKind::SearchNothing`] error is not an abort: the engine routes the run to the
//! pipeline's fallback stage instead.

use std::{
	collections::{BTreeMap, HashMap},
	fmt,
	str::FromStr,
	sync::Arc,
};

use crate::{BoxFuture, Error, Result, context::RequestContext};

pub type PluginResult = std::result::Result<(), PluginError>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Stage {
	RewriteQuery,
	HybridSearch,
	Rerank,
	Merge,
	FilterTopK,
	BuildPrompt,
	Complete,
	CompleteStream,
	StreamFilter,
	Fallback,
}
impl Stage {
	pub const ALL: [Stage; 10] = [
		Self::RewriteQuery,
		Self::HybridSearch,
		Self::Rerank,
		Self::Merge,
		Self::FilterTopK,
		Self::BuildPrompt,
		Self::Complete,
		Self::CompleteStream,
		Self::StreamFilter,
		Self::Fallback,
	];

	pub fn as_str(self) -> &'static str {
		match self {
			Self::RewriteQuery => "rewrite_query",
			Self::HybridSearch => "hybrid_search",
			Self::Rerank => "rerank",
			Self::Merge => "merge",
			Self::FilterTopK => "filter_top_k",
			Self::BuildPrompt => "build_prompt",
			Self::Complete => "complete",
			Self::CompleteStream => "complete_stream",
			Self::StreamFilter => "stream_filter",
			Self::Fallback => "fallback",
		}
	}
}
impl FromStr for Stage {
	type Err = Error;

	fn from_str(value: &str) -> Result<Self> {
		Self::ALL.into_iter().find(|stage| stage.as_str() == value.trim()).ok_or_else(|| {
			Error::Config { message: format!("Unknown pipeline stage {value:?}.") }
		})
	}
}
impl fmt::Display for Stage {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PluginErrorKind {
	Validation,
	SearchUnavailable,
	/// Retrieval produced nothing. Routed to the fallback stage rather than failing.
	SearchNothing,
	Backend,
	Model,
	Cancelled,
	Internal,
}
impl PluginErrorKind {
	pub fn code(self) -> &'static str {
		match self {
			Self::Validation => "VALIDATION_ERROR",
			Self::SearchUnavailable => "SEARCH_UNAVAILABLE",
			Self::SearchNothing => "SEARCH_NOTHING",
			Self::Backend => "BACKEND_ERROR",
			Self::Model => "MODEL_ERROR",
			Self::Cancelled => "CANCELLED",
			Self::Internal => "INTERNAL_ERROR",
		}
	}
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct PluginError {
	pub kind: PluginErrorKind,
	pub message: String,
}
impl PluginError {
	pub fn new(kind: PluginErrorKind, message: impl Into<String>) -> Self {
		Self { kind, message: message.into() }
	}

	pub fn validation(message: impl Into<String>) -> Self {
		Self::new(PluginErrorKind::Validation, message)
	}

	pub fn search_nothing() -> Self {
		Self::new(PluginErrorKind::SearchNothing, "No relevant content was found.")
	}

	pub fn model(message: impl Into<String>) -> Self {
		Self::new(PluginErrorKind::Model, message)
	}

	pub fn cancelled() -> Self {
		Self::new(PluginErrorKind::Cancelled, "The request was cancelled.")
	}
}

pub trait Plugin
where
	Self: Send + Sync,
{
	fn name(&self) -> &'static str;

	/// Stages this plugin is registered for.
	fn stages(&self) -> &'static [Stage];

	fn on_stage<'a>(
		&'a self,
		stage: Stage,
		ctx: &'a mut RequestContext,
		next: Next<'a>,
	) -> BoxFuture<'a, PluginResult>;
}

/// Continuation over the rest of a stage's chain.
pub struct Next<'a> {
	stage: Stage,
	chain: &'a [Arc<dyn Plugin>],
}
impl<'a> Next<'a> {
	pub fn run<'b>(self, ctx: &'b mut RequestContext) -> BoxFuture<'b, PluginResult>
	where
		'a: 'b,
	{
		match self.chain.split_first() {
			Some((plugin, rest)) =>
				plugin.on_stage(self.stage, ctx, Next { stage: self.stage, chain: rest }),
			None => Box::pin(async { Ok(()) }),
		}
	}
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PipelineSpec {
	pub stages: Vec<Stage>,
	pub fallback: Option<Stage>,
}
impl PipelineSpec {
	pub fn parse(definition: &quarry_config::PipelineDefinition) -> Result<Self> {
		let stages = definition
			.stages
			.iter()
			.map(|stage| stage.parse::<Stage>())
			.collect::<Result<Vec<_>>>()?;
		let fallback = definition.fallback.as_deref().map(str::parse::<Stage>).transpose()?;

		Ok(Self { stages, fallback })
	}
}

#[derive(Default)]
pub struct PipelineEngineBuilder {
	chains: HashMap<Stage, Vec<Arc<dyn Plugin>>>,
	pipelines: BTreeMap<String, PipelineSpec>,
}
impl PipelineEngineBuilder {
	/// Appends `plugin` to the chain of every stage it declares. Registration order is chain
	/// order.
	pub fn register(mut self, plugin: Arc<dyn Plugin>) -> Self {
		for stage in plugin.stages() {
			self.chains.entry(*stage).or_default().push(plugin.clone());
		}

		self
	}

	pub fn pipeline(mut self, name: impl Into<String>, spec: PipelineSpec) -> Self {
		self.pipelines.insert(name.into(), spec);

		self
	}

	pub fn pipelines_from_config(
		mut self,
		definitions: &BTreeMap<String, quarry_config::PipelineDefinition>,
	) -> Result<Self> {
		for (name, definition) in definitions {
			self.pipelines.insert(name.clone(), PipelineSpec::parse(definition)?);
		}

		Ok(self)
	}

	pub fn build(self) -> PipelineEngine {
		for (name, spec) in &self.pipelines {
			for stage in spec.stages.iter().chain(spec.fallback.iter()) {
				if !self.chains.contains_key(stage) {
					tracing::warn!(
						pipeline = %name,
						stage = stage.as_str(),
						"Pipeline stage has no registered plugins."
					);
				}
			}
		}

		PipelineEngine { chains: self.chains, pipelines: self.pipelines }
	}
}

/// Immutable once built; shared by every request.
pub struct PipelineEngine {
	chains: HashMap<Stage, Vec<Arc<dyn Plugin>>>,
	pipelines: BTreeMap<String, PipelineSpec>,
}
impl PipelineEngine {
	pub fn builder() -> PipelineEngineBuilder {
		PipelineEngineBuilder::default()
	}

	pub fn pipeline(&self, name: &str) -> Option<&PipelineSpec> {
		self.pipelines.get(name)
	}

	pub fn pipeline_names(&self) -> impl Iterator<Item = &str> {
		self.pipelines.keys().map(String::as_str)
	}

	pub fn plugin_names(&self, stage: Stage) -> Vec<&'static str> {
		self.chains
			.get(&stage)
			.map(|chain| chain.iter().map(|plugin| plugin.name()).collect())
			.unwrap_or_default()
	}

	pub async fn run(&self, name: &str, ctx: &mut RequestContext) -> Result<()> {
		let Some(spec) = self.pipelines.get(name) else {
			return Err(Error::NotFound { message: format!("Unknown pipeline {name:?}.") });
		};

		for stage in &spec.stages {
			match self.run_stage(*stage, ctx).await {
				Ok(()) => {},
				Err(err) if err.kind == PluginErrorKind::SearchNothing => {
					ctx.no_results = true;

					let Some(fallback) = spec.fallback else {
						return Err(Error::Pipeline { stage: stage.as_str(), source: err });
					};

					tracing::info!(
						pipeline = name,
						stage = stage.as_str(),
						request_id = %ctx.request_id,
						"No results; running fallback stage."
					);

					return self.run_stage(fallback, ctx).await.map_err(|err| wrap(fallback, err));
				},
				Err(err) => {
					tracing::warn!(
						pipeline = name,
						stage = stage.as_str(),
						request_id = %ctx.request_id,
						code = err.kind.code(),
						error = %err,
						"Pipeline aborted."
					);

					return Err(wrap(*stage, err));
				},
			}
		}

		Ok(())
	}

	/// Runs one stage's chain, racing it against the request's cancellation token.
	pub async fn run_stage(&self, stage: Stage, ctx: &mut RequestContext) -> PluginResult {
		let cancel = ctx.cancel.clone();

		if cancel.is_cancelled() {
			return Err(PluginError::cancelled());
		}

		let chain = self.chains.get(&stage).map(Vec::as_slice).unwrap_or_default();

		tracing::debug!(stage = stage.as_str(), plugins = chain.len(), "Stage started.");

		let result = tokio::select! {
			biased;
			_ = cancel.cancelled() => Err(PluginError::cancelled()),
			result = Next { stage, chain }.run(ctx) => result,
		};

		tracing::debug!(stage = stage.as_str(), ok = result.is_ok(), "Stage finished.");

		result
	}
}

fn wrap(stage: Stage, err: PluginError) -> Error {
	if err.kind == PluginErrorKind::Cancelled {
		return Error::Cancelled { stage: stage.as_str() };
	}

	Error::Pipeline { stage: stage.as_str(), source: err }
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn stage_names_parse_back() {
		for stage in Stage::ALL {
			assert_eq!(stage.as_str().parse::<Stage>().ok(), Some(stage));
		}

		assert!(matches!("chunk_search".parse::<Stage>(), Err(Error::Config { .. })));
	}

	#[test]
	fn default_pipeline_table_parses() {
		for (name, definition) in quarry_config::default_pipelines() {
			let spec = PipelineSpec::parse(&definition).expect("Default pipeline must parse.");

			assert!(!spec.stages.is_empty(), "Pipeline {name} has no stages.");
		}
	}
}
