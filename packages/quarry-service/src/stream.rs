//! Client-facing stream records and their reassembly.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use quarry_domain::SearchResult;

use crate::event::{Event, EventType};

/// The closed set of record types a streaming client can receive.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseType {
	Thinking,
	ToolCall,
	ToolResult,
	References,
	Answer,
	Reflection,
	Error,
}
impl ResponseType {
	pub fn as_str(self) -> &'static str {
		match self {
			Self::Thinking => "thinking",
			Self::ToolCall => "tool_call",
			Self::ToolResult => "tool_result",
			Self::References => "references",
			Self::Answer => "answer",
			Self::Reflection => "reflection",
			Self::Error => "error",
		}
	}

	pub fn event_type(self) -> EventType {
		match self {
			Self::Thinking => EventType::Thinking,
			Self::ToolCall => EventType::ToolCall,
			Self::ToolResult => EventType::ToolResult,
			Self::References => EventType::References,
			Self::Answer => EventType::Answer,
			Self::Reflection => EventType::Reflection,
			Self::Error => EventType::Error,
		}
	}

	/// Telemetry event types have no client-facing counterpart.
	pub fn from_event_type(event_type: EventType) -> Option<Self> {
		Some(match event_type {
			EventType::Thinking => Self::Thinking,
			EventType::ToolCall => Self::ToolCall,
			EventType::ToolResult => Self::ToolResult,
			EventType::References => Self::References,
			EventType::Answer => Self::Answer,
			EventType::Reflection => Self::Reflection,
			EventType::Error => Self::Error,
			EventType::SearchHits | EventType::StageTiming => return None,
		})
	}
}

/// One record of a streamed reply. Records with `done = false` are fragments of the message
/// identified by `(response_type, id)`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StreamResponse {
	pub id: String,
	pub response_type: ResponseType,
	pub content: String,
	pub done: bool,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub knowledge_references: Vec<SearchResult>,
	#[serde(default, skip_serializing_if = "Value::is_null")]
	pub data: Value,
}
impl StreamResponse {
	pub fn new(
		id: impl Into<String>,
		response_type: ResponseType,
		content: impl Into<String>,
		done: bool,
	) -> Self {
		Self {
			id: id.into(),
			response_type,
			content: content.into(),
			done,
			knowledge_references: Vec::new(),
			data: Value::Null,
		}
	}

	pub fn with_references(mut self, references: Vec<SearchResult>) -> Self {
		self.knowledge_references = references;

		self
	}

	pub fn into_event(self) -> Event {
		let event_type = self.response_type.event_type();
		let data = serde_json::to_value(&self).unwrap_or(Value::Null);

		Event::new(event_type, data)
	}

	pub fn from_event(event: &Event) -> Option<Self> {
		ResponseType::from_event_type(event.event_type)?;

		serde_json::from_value(event.data.clone()).ok()
	}
}

#[derive(Clone, Debug, PartialEq)]
pub struct AssembledMessage {
	pub id: String,
	pub response_type: ResponseType,
	pub content: String,
	pub knowledge_references: Vec<SearchResult>,
}

/// Concatenates fragments by arrival order until the closing `done = true` record.
#[derive(Debug, Default)]
pub struct StreamAssembler {
	pending: HashMap<(ResponseType, String), AssembledMessage>,
}
impl StreamAssembler {
	pub fn push(&mut self, record: StreamResponse) -> Option<AssembledMessage> {
		let key = (record.response_type, record.id.clone());
		let message = self.pending.entry(key.clone()).or_insert_with(|| AssembledMessage {
			id: record.id.clone(),
			response_type: record.response_type,
			content: String::new(),
			knowledge_references: Vec::new(),
		});

		message.content.push_str(&record.content);
		message.knowledge_references.extend(record.knowledge_references);

		if record.done { self.pending.remove(&key) } else { None }
	}

	pub fn has_pending(&self) -> bool {
		!self.pending.is_empty()
	}
}
