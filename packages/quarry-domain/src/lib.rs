pub mod dedup;
pub mod expansion;
pub mod model;
pub mod normalize;
pub mod signature;

pub use model::{
	EngineType, HistoryTurn, IndexInfo, IndexWithScore, MatchType, RetrieveParams, RetrieverType,
	SearchParams, SearchResult, SourceType, WebSearchConfig, WebSearchResult,
};
