//! Publish/subscribe for progress and telemetry events.
//!
//! The bus is constructed by the composition root and injected into every request context.
//! It never persists events and never feeds back into pipeline control flow.

use std::{
	collections::HashMap,
	future::Future,
	sync::{Arc, RwLock},
};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::{BoxFuture, Error, Result};

pub type HandlerResult = std::result::Result<(), HandlerError>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
	Thinking,
	ToolCall,
	ToolResult,
	References,
	Answer,
	Reflection,
	Error,
	SearchHits,
	StageTiming,
}
impl EventType {
	pub fn as_str(self) -> &'static str {
		match self {
			Self::Thinking => "thinking",
			Self::ToolCall => "tool_call",
			Self::ToolResult => "tool_result",
			Self::References => "references",
			Self::Answer => "answer",
			Self::Reflection => "reflection",
			Self::Error => "error",
			Self::SearchHits => "search_hits",
			Self::StageTiming => "stage_timing",
		}
	}
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
	/// Assigned on emission when left empty.
	pub id: String,
	pub event_type: EventType,
	pub session_id: String,
	/// Correlation ID of the request that produced the event.
	pub request_id: String,
	pub data: Value,
	pub metadata: HashMap<String, String>,
}
impl Event {
	pub fn new(event_type: EventType, data: Value) -> Self {
		Self {
			id: String::new(),
			event_type,
			session_id: String::new(),
			request_id: String::new(),
			data,
			metadata: HashMap::new(),
		}
	}

	pub fn with_id(mut self, id: impl Into<String>) -> Self {
		self.id = id.into();

		self
	}

	pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
		self.session_id = session_id.into();

		self
	}

	pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
		self.request_id = request_id.into();

		self
	}

	pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
		self.metadata.insert(key.into(), value.into());

		self
	}
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

pub trait EventHandler
where
	Self: Send + Sync,
{
	fn handle(&self, event: Event) -> BoxFuture<'_, HandlerResult>;
}

struct FnHandler<F>(F);
impl<F, Fut> EventHandler for FnHandler<F>
where
	F: Fn(Event) -> Fut + Send + Sync,
	Fut: Future<Output = HandlerResult> + Send + 'static,
{
	fn handle(&self, event: Event) -> BoxFuture<'_, HandlerResult> {
		Box::pin((self.0)(event))
	}
}

/// Wraps a closure as a handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn EventHandler>
where
	F: Fn(Event) -> Fut + Send + Sync + 'static,
	Fut: Future<Output = HandlerResult> + Send + 'static,
{
	Arc::new(FnHandler(f))
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DispatchMode {
	/// Handlers run in registration order on the emitting task. The first error stops dispatch
	/// and is returned.
	#[default]
	Sync,
	/// Each handler runs on its own task. Errors never reach the emitter, so handlers must log
	/// their own failures.
	FireAndForget,
}

#[derive(Default)]
pub struct EventBus {
	mode: DispatchMode,
	handlers: RwLock<HashMap<EventType, Vec<Arc<dyn EventHandler>>>>,
}
impl EventBus {
	pub fn new(mode: DispatchMode) -> Self {
		Self { mode, handlers: RwLock::new(HashMap::new()) }
	}

	pub fn mode(&self) -> DispatchMode {
		self.mode
	}

	pub fn on(&self, event_type: EventType, handler: Arc<dyn EventHandler>) {
		self.handlers
			.write()
			.unwrap_or_else(|err| err.into_inner())
			.entry(event_type)
			.or_default()
			.push(handler);
	}

	/// Removes every handler registered for `event_type`.
	pub fn off(&self, event_type: EventType) {
		self.handlers.write().unwrap_or_else(|err| err.into_inner()).remove(&event_type);
	}

	pub fn has_handlers(&self, event_type: EventType) -> bool {
		self.handler_count(event_type) > 0
	}

	pub fn handler_count(&self, event_type: EventType) -> usize {
		self.handlers
			.read()
			.unwrap_or_else(|err| err.into_inner())
			.get(&event_type)
			.map(Vec::len)
			.unwrap_or(0)
	}

	pub fn clear(&self) {
		self.handlers.write().unwrap_or_else(|err| err.into_inner()).clear();
	}

	pub async fn emit(&self, event: Event) -> Result<()> {
		let event = assign_id(event);
		let handlers = self.snapshot(event.event_type);

		if handlers.is_empty() {
			return Ok(());
		}

		match self.mode {
			DispatchMode::Sync =>
				for handler in handlers {
					if let Err(err) = handler.handle(event.clone()).await {
						return Err(handler_error(&event, err));
					}
				},
			DispatchMode::FireAndForget =>
				for handler in handlers {
					let event = event.clone();

					tokio::spawn(async move {
						let event_type = event.event_type;

						if let Err(err) = handler.handle(event).await {
							tracing::debug!(
								event_type = event_type.as_str(),
								error = %err,
								"Detached event handler failed."
							);
						}
					});
				},
		}

		Ok(())
	}

	/// Runs every handler concurrently and waits for all of them, regardless of the dispatch
	/// mode. Returns the first error observed.
	pub async fn emit_and_wait(&self, event: Event) -> Result<()> {
		let event = assign_id(event);
		let mut tasks = JoinSet::new();

		for handler in self.snapshot(event.event_type) {
			let event = event.clone();

			tasks.spawn(async move { handler.handle(event).await });
		}

		let mut first_error = None;

		while let Some(joined) = tasks.join_next().await {
			let outcome = match joined {
				Ok(outcome) => outcome,
				Err(err) => Err(HandlerError(format!("Handler task failed: {err}."))),
			};

			if let Err(err) = outcome
				&& first_error.is_none()
			{
				first_error = Some(handler_error(&event, err));
			}
		}

		match first_error {
			Some(err) => Err(err),
			None => Ok(()),
		}
	}

	fn snapshot(&self, event_type: EventType) -> Vec<Arc<dyn EventHandler>> {
		self.handlers
			.read()
			.unwrap_or_else(|err| err.into_inner())
			.get(&event_type)
			.cloned()
			.unwrap_or_default()
	}
}

fn assign_id(mut event: Event) -> Event {
	if event.id.is_empty() {
		event.id = Uuid::new_v4().to_string();
	}

	event
}

fn handler_error(event: &Event, err: HandlerError) -> Error {
	Error::EventHandler { event_type: event.event_type.as_str(), message: err.0 }
}

#[cfg(test)]
mod tests {
	use std::{
		sync::{
			Mutex,
			atomic::{AtomicBool, Ordering},
		},
		time::Duration,
	};

	use tokio::sync::mpsc;

	use super::*;

	#[tokio::test]
	async fn sync_dispatch_runs_in_order_and_stops_at_first_error() {
		let bus = EventBus::new(DispatchMode::Sync);
		let seen = Arc::new(Mutex::new(Vec::new()));

		for (label, fail) in [("first", false), ("second", true), ("third", false)] {
			let seen = seen.clone();

			bus.on(
				EventType::Answer,
				handler_fn(move |_event| {
					let seen = seen.clone();

					async move {
						seen.lock().unwrap_or_else(|err| err.into_inner()).push(label);

						if fail { Err(HandlerError("boom".to_string())) } else { Ok(()) }
					}
				}),
			);
		}

		let err = bus
			.emit(Event::new(EventType::Answer, Value::Null))
			.await
			.expect_err("Expected the second handler to fail.");

		assert!(matches!(err, Error::EventHandler { event_type: "answer", .. }));
		assert_eq!(*seen.lock().unwrap_or_else(|err| err.into_inner()), vec!["first", "second"]);
	}

	#[tokio::test]
	async fn detached_handler_errors_never_reach_the_emitter() {
		let bus = EventBus::new(DispatchMode::FireAndForget);
		let (tx, mut rx) = mpsc::unbounded_channel::<String>();

		bus.on(
			EventType::StageTiming,
			handler_fn(move |event| {
				let _ = tx.send(event.id);

				async { Err(HandlerError("boom".to_string())) }
			}),
		);
		bus.emit(Event::new(EventType::StageTiming, Value::Null).with_id("timing-1"))
			.await
			.expect("Detached failures must not reach the emitter.");

		let handled = tokio::time::timeout(Duration::from_secs(1), rx.recv())
			.await
			.expect("The detached handler should run.");

		assert_eq!(handled.as_deref(), Some("timing-1"));
	}

	#[tokio::test]
	async fn emit_and_wait_waits_for_every_handler_and_returns_the_failure() {
		let bus = EventBus::new(DispatchMode::FireAndForget);
		let finished = Arc::new(AtomicBool::new(false));
		let flag = finished.clone();

		bus.on(
			EventType::Reflection,
			handler_fn(move |_event| {
				let flag = flag.clone();

				async move {
					tokio::time::sleep(Duration::from_millis(20)).await;

					flag.store(true, Ordering::SeqCst);

					Ok(())
				}
			}),
		);
		bus.on(
			EventType::Reflection,
			handler_fn(|_event| async { Err(HandlerError("reflection failed".to_string())) }),
		);

		let err = bus
			.emit_and_wait(Event::new(EventType::Reflection, Value::Null))
			.await
			.expect_err("Expected the failing handler's error.");

		let Error::EventHandler { event_type, message } = &err else {
			panic!("Unexpected error: {err:?}.");
		};

		assert!(finished.load(Ordering::SeqCst));
		assert_eq!(*event_type, "reflection");
		assert_eq!(message, "reflection failed");
	}

	#[tokio::test]
	async fn emitted_events_get_an_id() {
		let bus = EventBus::default();
		let ids = Arc::new(Mutex::new(Vec::new()));
		let sink = ids.clone();

		bus.on(
			EventType::Thinking,
			handler_fn(move |event| {
				let sink = sink.clone();

				async move {
					sink.lock().unwrap_or_else(|err| err.into_inner()).push(event.id);

					Ok(())
				}
			}),
		);
		bus.emit(Event::new(EventType::Thinking, Value::Null)).await.expect("Emit failed.");
		bus.emit(Event::new(EventType::Thinking, Value::Null).with_id("fixed"))
			.await
			.expect("Emit failed.");

		let ids = ids.lock().unwrap_or_else(|err| err.into_inner()).clone();

		assert_eq!(ids.len(), 2);
		assert!(!ids[0].is_empty());
		assert_eq!(ids[1], "fixed");
	}

	#[test]
	fn registration_bookkeeping() {
		let bus = EventBus::default();
		let noop = handler_fn(|_event| async { Ok(()) });

		bus.on(EventType::Answer, noop.clone());
		bus.on(EventType::Answer, noop.clone());
		bus.on(EventType::Error, noop);

		assert_eq!(bus.handler_count(EventType::Answer), 2);

		bus.off(EventType::Answer);

		assert!(!bus.has_handlers(EventType::Answer));
		assert!(bus.has_handlers(EventType::Error));

		bus.clear();

		assert_eq!(bus.handler_count(EventType::Error), 0);
	}
}
