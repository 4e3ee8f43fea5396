use crate::pipeline::PluginError;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("Invalid request: {message}")]
	InvalidRequest { message: String },
	#[error("Not found: {message}")]
	NotFound { message: String },
	#[error("Invalid configuration: {message}")]
	Config { message: String },
	#[error("Provider error: {0}")]
	Provider(#[from] quarry_providers::Error),
	#[error("Storage error: {0}")]
	Storage(#[from] quarry_storage::Error),
	#[error("Stage {stage} failed: {source}")]
	Pipeline { stage: &'static str, source: PluginError },
	#[error("Pipeline cancelled during stage {stage}.")]
	Cancelled { stage: &'static str },
	#[error("Event handler failed for {event_type}: {message}")]
	EventHandler { event_type: &'static str, message: String },
}
impl Error {
	/// Stable machine-readable code for callers.
	pub fn code(&self) -> &'static str {
		match self {
			Self::InvalidRequest { .. } => "INVALID_REQUEST",
			Self::NotFound { .. } => "NOT_FOUND",
			Self::Config { .. } => "INVALID_CONFIG",
			Self::Provider(_) => "PROVIDER_ERROR",
			Self::Storage(_) => "STORAGE_ERROR",
			Self::Pipeline { source, .. } => source.kind.code(),
			Self::Cancelled { .. } => "CANCELLED",
			Self::EventHandler { .. } => "EVENT_HANDLER_ERROR",
		}
	}
}
