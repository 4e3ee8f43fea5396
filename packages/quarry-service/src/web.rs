//! Web search, retrieval-based compression of web pages, and the per-session state that lets
//! follow-up turns reuse already indexed pages.

use std::{
	collections::{HashMap, HashSet},
	sync::{Arc, Mutex},
};

use uuid::Uuid;

use quarry_config::{EmbeddingProviderConfig, ProviderConfig};
use quarry_domain::{IndexInfo, RetrieveParams, SourceType, WebSearchConfig, WebSearchResult};
use quarry_storage::{IndexParams, RetrievalBackend};

use crate::{BoxFuture, EmbeddingProvider, Result};

/// Longest passage a web page is cut into, in characters.
pub const PASSAGE_CHARS: usize = 600;

/// Cross-turn state of a session's temporary web collection.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TempKbState {
	pub collection_id: Option<String>,
	/// Page URLs already indexed into the collection.
	pub seen_urls: HashSet<String>,
	/// Source IDs written to the collection. [`end_session`] deletes them.
	pub source_ids: Vec<String>,
}

pub struct CompressRequest<'a> {
	pub session_id: &'a str,
	pub questions: &'a [String],
	pub results: Vec<WebSearchResult>,
	pub config: &'a WebSearchConfig,
	pub state: TempKbState,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CompressOutcome {
	pub results: Vec<WebSearchResult>,
	pub state: TempKbState,
}

pub trait WebSearchService
where
	Self: Send + Sync,
{
	fn search<'a>(
		&'a self,
		config: &'a WebSearchConfig,
		query: &'a str,
	) -> BoxFuture<'a, Result<Vec<WebSearchResult>>>;

	/// Rewrites each result's content to the passages that best answer `questions`.
	fn compress_with_rag<'a>(
		&'a self,
		req: CompressRequest<'a>,
	) -> BoxFuture<'a, Result<CompressOutcome>>;

	/// Drops whatever `compress_with_rag` persisted for a session.
	fn release_temp_kb<'a>(&'a self, _: &'a TempKbState) -> BoxFuture<'a, Result<()>> {
		Box::pin(async { Ok(()) })
	}
}

pub trait SessionStore
where
	Self: Send + Sync,
{
	fn web_search_temp_state<'a>(&'a self, session_id: &'a str)
	-> BoxFuture<'a, Result<TempKbState>>;

	fn save_web_search_temp_state<'a>(
		&'a self,
		session_id: &'a str,
		state: TempKbState,
	) -> BoxFuture<'a, Result<()>>;

	/// Removes and returns the session's state, if any.
	fn clear_web_search_temp_state<'a>(
		&'a self,
		session_id: &'a str,
	) -> BoxFuture<'a, Result<Option<TempKbState>>>;
}

#[derive(Debug, Default)]
pub struct InMemorySessionStore {
	states: Mutex<HashMap<String, TempKbState>>,
}
impl InMemorySessionStore {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn len(&self) -> usize {
		self.states.lock().unwrap_or_else(|err| err.into_inner()).len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}
impl SessionStore for InMemorySessionStore {
	fn web_search_temp_state<'a>(
		&'a self,
		session_id: &'a str,
	) -> BoxFuture<'a, Result<TempKbState>> {
		let state = self
			.states
			.lock()
			.unwrap_or_else(|err| err.into_inner())
			.get(session_id)
			.cloned()
			.unwrap_or_default();

		Box::pin(async move { Ok(state) })
	}

	fn save_web_search_temp_state<'a>(
		&'a self,
		session_id: &'a str,
		state: TempKbState,
	) -> BoxFuture<'a, Result<()>> {
		self.states
			.lock()
			.unwrap_or_else(|err| err.into_inner())
			.insert(session_id.to_string(), state);

		Box::pin(async { Ok(()) })
	}

	fn clear_web_search_temp_state<'a>(
		&'a self,
		session_id: &'a str,
	) -> BoxFuture<'a, Result<Option<TempKbState>>> {
		let state =
			self.states.lock().unwrap_or_else(|err| err.into_inner()).remove(session_id);

		Box::pin(async move { Ok(state) })
	}
}

/// Ends a session: deletes the passages indexed for it, then forgets its web search state.
///
/// Returns the number of indexed passages released.
pub async fn end_session(
	sessions: &dyn SessionStore,
	web: Option<&dyn WebSearchService>,
	session_id: &str,
) -> Result<usize> {
	let state = sessions.web_search_temp_state(session_id).await?;

	let released = match web {
		Some(web) => {
			web.release_temp_kb(&state).await?;

			state.source_ids.len()
		},
		None => 0,
	};

	sessions.clear_web_search_temp_state(session_id).await?;

	tracing::info!(
		session_id,
		collection_id = state.collection_id.as_deref().unwrap_or_default(),
		passages = released,
		"Session web search state released."
	);

	Ok(released)
}

/// Indexes web pages into a session-scoped collection and keeps, per page, the passages
/// closest to the questions.
pub struct RagCompressor {
	backend: Arc<dyn RetrievalBackend>,
	embedding: Arc<dyn EmbeddingProvider>,
	embedding_cfg: EmbeddingProviderConfig,
}
impl RagCompressor {
	pub fn new(
		backend: Arc<dyn RetrievalBackend>,
		embedding: Arc<dyn EmbeddingProvider>,
		embedding_cfg: EmbeddingProviderConfig,
	) -> Self {
		Self { backend, embedding, embedding_cfg }
	}

	pub async fn compress(&self, req: CompressRequest<'_>) -> Result<CompressOutcome> {
		let CompressRequest { session_id, questions, results, config, mut state } = req;
		let collection_id = state
			.collection_id
			.get_or_insert_with(|| format!("web-tmp-{}", Uuid::new_v4()))
			.clone();

		self.index_new_pages(&collection_id, &results, &mut state).await?;

		let fragments = config.document_fragments.max(1);
		let passages = self.best_passages(&collection_id, questions, &results, fragments).await?;
		let results = results
			.into_iter()
			.map(|mut result| {
				if let Some(kept) = passages.get(&result.url) {
					result.content = kept.join("\n\n");
				}

				result
			})
			.collect::<Vec<_>>();

		tracing::debug!(
			session_id,
			collection_id = %collection_id,
			pages = results.len(),
			compressed = passages.len(),
			"Web results compressed."
		);

		Ok(CompressOutcome { results, state })
	}

	/// Deletes every passage recorded in `state`.
	pub async fn release(&self, state: &TempKbState) -> Result<()> {
		if state.source_ids.is_empty() {
			return Ok(());
		}

		self.backend.delete_by_source_ids(&state.source_ids).await?;

		Ok(())
	}

	async fn index_new_pages(
		&self,
		collection_id: &str,
		results: &[WebSearchResult],
		state: &mut TempKbState,
	) -> Result<()> {
		let mut items = Vec::new();

		for result in results {
			if state.seen_urls.contains(&result.url) {
				continue;
			}

			let body =
				if result.content.trim().is_empty() { &result.snippet } else { &result.content };
			let page_key = blake3::hash(result.url.as_bytes()).to_hex();

			for (chunk_index, (start_at, end_at, passage)) in
				split_passages(body, PASSAGE_CHARS).into_iter().enumerate()
			{
				// Scoped by collection so releasing one session never touches another's copy.
				let chunk_id = format!("{collection_id}:{}:{chunk_index}", &page_key[..16]);

				items.push(IndexInfo {
					source_id: chunk_id.clone(),
					source_type: SourceType::WebPage,
					chunk_id,
					knowledge_id: result.url.clone(),
					collection_id: collection_id.to_string(),
					parent_chunk_id: None,
					content: passage,
					chunk_index: chunk_index as i32,
					start_at: start_at as i32,
					end_at: end_at as i32,
					is_enabled: true,
				});
			}

			state.seen_urls.insert(result.url.clone());
		}

		if items.is_empty() {
			return Ok(());
		}

		let texts = items.iter().map(|item| item.content.clone()).collect::<Vec<_>>();
		let vectors = self.embedding.embed(&self.embedding_cfg, &texts).await?;
		let params = IndexParams {
			embeddings: items.iter().map(|item| item.source_id.clone()).zip(vectors).collect(),
		};

		self.backend.batch_save(&items, &params).await?;

		state.source_ids.extend(items.into_iter().map(|item| item.source_id));

		Ok(())
	}

	async fn best_passages(
		&self,
		collection_id: &str,
		questions: &[String],
		results: &[WebSearchResult],
		fragments: usize,
	) -> Result<HashMap<String, Vec<String>>> {
		let questions = questions
			.iter()
			.map(|question| question.trim().to_string())
			.filter(|question| !question.is_empty())
			.collect::<Vec<_>>();

		if questions.is_empty() || results.is_empty() {
			return Ok(HashMap::new());
		}

		let urls = results.iter().map(|result| result.url.as_str()).collect::<HashSet<_>>();
		let vectors = self.embedding.embed(&self.embedding_cfg, &questions).await?;
		let top_k = fragments * results.len();
		let mut scored: HashMap<String, Vec<(f32, i32, String)>> = HashMap::new();

		for vector in vectors {
			let params =
				RetrieveParams::vector(vector, vec![collection_id.to_string()], top_k, 0.0);

			for hit in self.backend.retrieve(&params).await? {
				if urls.contains(hit.index.knowledge_id.as_str()) {
					scored.entry(hit.index.knowledge_id.clone()).or_default().push((
						hit.score,
						hit.index.chunk_index,
						hit.index.content,
					));
				}
			}
		}

		Ok(scored
			.into_iter()
			.map(|(url, mut hits)| {
				hits.sort_by(|a, b| b.0.total_cmp(&a.0));

				let mut taken = HashSet::new();
				let mut kept = hits
					.into_iter()
					.filter(|(_, chunk_index, _)| taken.insert(*chunk_index))
					.take(fragments)
					.map(|(_, chunk_index, content)| (chunk_index, content))
					.collect::<Vec<_>>();

				kept.sort_by_key(|(chunk_index, _)| *chunk_index);

				(url, kept.into_iter().map(|(_, content)| content).collect())
			})
			.collect())
	}
}

/// Default web search: the configured HTTP provider plus [`RagCompressor`].
pub struct DefaultWebSearch {
	cfg: ProviderConfig,
	compressor: RagCompressor,
}
impl DefaultWebSearch {
	pub fn new(cfg: ProviderConfig, compressor: RagCompressor) -> Self {
		Self { cfg, compressor }
	}
}
impl WebSearchService for DefaultWebSearch {
	fn search<'a>(
		&'a self,
		config: &'a WebSearchConfig,
		query: &'a str,
	) -> BoxFuture<'a, Result<Vec<WebSearchResult>>> {
		Box::pin(async move {
			Ok(quarry_providers::web_search::search(&self.cfg, config, query).await?)
		})
	}

	fn compress_with_rag<'a>(
		&'a self,
		req: CompressRequest<'a>,
	) -> BoxFuture<'a, Result<CompressOutcome>> {
		Box::pin(self.compressor.compress(req))
	}

	fn release_temp_kb<'a>(&'a self, state: &'a TempKbState) -> BoxFuture<'a, Result<()>> {
		Box::pin(self.compressor.release(state))
	}
}

/// Cuts whitespace-normalized `text` into passages of at most `max_chars` characters at word
/// boundaries. Offsets are character positions in the normalized text.
pub fn split_passages(text: &str, max_chars: usize) -> Vec<(usize, usize, String)> {
	let mut passages = Vec::new();
	let mut current = String::new();
	let mut current_chars = 0;
	let mut start = 0;
	let mut offset = 0;

	for word in text.split_whitespace() {
		let word_chars = word.chars().count();

		if current_chars > 0 && current_chars + 1 + word_chars > max_chars {
			passages.push((start, start + current_chars, std::mem::take(&mut current)));

			// Skip the separating space.
			offset += 1;
			start = offset;
			current_chars = 0;
		} else if current_chars > 0 {
			current.push(' ');

			current_chars += 1;
			offset += 1;
		}

		current.push_str(word);

		current_chars += word_chars;
		offset += word_chars;
	}

	if current_chars > 0 {
		passages.push((start, start + current_chars, current));
	}

	passages
}
