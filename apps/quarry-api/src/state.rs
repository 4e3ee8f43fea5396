use std::sync::Arc;

use color_eyre::eyre;

use quarry_config::{Config, Retrieval, Storage, default_pipelines};
use quarry_service::{
	BackendKnowledgeBase, DefaultWebSearch, InMemorySessionStore, PipelineEngine, Providers,
	RagCompressor, SessionStore, WebSearchService,
	plugins::{PluginDeps, register_defaults},
};
use quarry_storage::{
	RetrievalBackend, memory::MemoryBackend, postgres::PgBackend, qdrant::QdrantBackend,
};

#[derive(Clone)]
pub struct AppState {
	pub engine: Arc<PipelineEngine>,
	/// Defaults copied onto every request before its own overrides.
	pub retrieval: Retrieval,
	pub sessions: Arc<dyn SessionStore>,
	pub web_search: Option<Arc<dyn WebSearchService>>,
}
impl AppState {
	pub async fn new(config: Config) -> color_eyre::Result<Self> {
		let backend = connect_backend(&config.storage).await?;

		Self::from_parts(config, backend, Providers::default())
	}

	/// Wires the engine over an already connected backend.
	pub fn from_parts(
		config: Config,
		backend: Arc<dyn RetrievalBackend>,
		providers: Providers,
	) -> color_eyre::Result<Self> {
		let embedding_cfg = config.providers.embedding.clone();
		let knowledge = BackendKnowledgeBase::new(
			backend.clone(),
			providers.embedding.clone(),
			embedding_cfg.clone(),
		);
		let web_search = config.providers.web_search.clone().map(|cfg| {
			let compressor =
				RagCompressor::new(backend, providers.embedding.clone(), embedding_cfg);

			Arc::new(DefaultWebSearch::new(cfg, compressor)) as Arc<dyn WebSearchService>
		});
		let sessions: Arc<dyn SessionStore> = Arc::new(InMemorySessionStore::new());
		let deps = PluginDeps {
			providers,
			knowledge: Arc::new(knowledge),
			web_search: web_search.clone(),
			sessions: sessions.clone(),
			rerank_cfg: config.providers.rerank,
			chat_cfg: config.providers.chat,
			prompt: config.prompt,
			fallback: config.fallback,
		};
		let pipelines =
			if config.pipelines.is_empty() { default_pipelines() } else { config.pipelines };
		let engine =
			register_defaults(PipelineEngine::builder(), &deps).pipelines_from_config(&pipelines)?;

		Ok(Self {
			engine: Arc::new(engine.build()),
			retrieval: config.retrieval,
			sessions,
			web_search,
		})
	}
}

async fn connect_backend(storage: &Storage) -> color_eyre::Result<Arc<dyn RetrievalBackend>> {
	match storage.backend.as_str() {
		"qdrant" => {
			let Some(cfg) = storage.qdrant.as_ref() else {
				return Err(eyre::eyre!("storage.qdrant is required for the qdrant backend."));
			};
			let backend = QdrantBackend::new(cfg)?;

			backend.ensure_collection().await?;

			tracing::info!(collection = %cfg.collection, "Qdrant backend ready.");

			Ok(Arc::new(backend))
		},
		"postgres" => {
			let Some(cfg) = storage.postgres.as_ref() else {
				return Err(eyre::eyre!("storage.postgres is required for the postgres backend."));
			};
			let backend = PgBackend::connect(cfg).await?;

			backend.ensure_schema().await?;

			tracing::info!("Postgres backend ready.");

			Ok(Arc::new(backend))
		},
		"memory" => {
			tracing::warn!("Using the in-memory backend. Indexed data is lost on restart.");

			Ok(Arc::new(MemoryBackend::new()))
		},
		other => Err(eyre::eyre!("Unsupported storage backend {other}.")),
	}
}
