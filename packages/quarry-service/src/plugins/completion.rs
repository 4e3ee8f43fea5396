//! Model answers, blocking and streamed, plus the no-match filter applied to them.

use std::sync::Arc;

use tokio::sync::mpsc;

use quarry_config::LlmProviderConfig;
use quarry_providers::ChatMessage;

use crate::{
	BoxFuture, ChatProvider, Next, Plugin, PluginError, PluginResult, RequestContext,
	ResponseType, Stage, StreamResponse, plugins::rewrite,
};

/// History turns replayed to the model ahead of the user message.
pub const HISTORY_TURNS_IN_PROMPT: usize = 2;

pub struct Completion {
	chat: Arc<dyn ChatProvider>,
	cfg: LlmProviderConfig,
	system: String,
	no_match_prefix: Option<String>,
	fallback_response: String,
}
impl Completion {
	pub fn new(
		chat: Arc<dyn ChatProvider>,
		cfg: LlmProviderConfig,
		system: String,
		no_match_prefix: Option<String>,
		fallback_response: String,
	) -> Self {
		Self { chat, cfg, system, no_match_prefix, fallback_response }
	}

	async fn complete(&self, ctx: &mut RequestContext) -> PluginResult {
		let messages = chat_messages(&self.system, ctx);
		let text = self
			.chat
			.complete(&self.cfg, &messages)
			.await
			.map_err(|err| PluginError::model(format!("Chat completion failed: {err}.")))?;
		let answer = if is_no_match(self.no_match_prefix.as_deref(), &text) {
			self.fallback_response.clone()
		} else {
			text
		};

		ctx.chat_response = answer.clone();

		ctx.emit_response(StreamResponse::new(ctx.answer_id(), ResponseType::Answer, answer, true))
			.await;

		Ok(())
	}

	/// Forwards deltas as answer fragments while the provider streams.
	///
	/// Deltas that could still turn out to be the no-match prefix are held back. An answer that
	/// does start with the prefix is never forwarded and gets no closing record here; the
	/// stream filter stage replaces it.
	async fn complete_stream(&self, ctx: &mut RequestContext) -> PluginResult {
		let messages = chat_messages(&self.system, ctx);
		let (tx, mut rx) = mpsc::unbounded_channel::<String>();
		let prefix = self.no_match_prefix.as_deref();
		let reader: &RequestContext = ctx;
		let answer_id = reader.answer_id();
		let forward = async {
			let mut gate = PrefixGate::new(prefix);

			while let Some(delta) = rx.recv().await {
				if let Some(ready) = gate.push(delta.as_str()) {
					reader
						.emit_response(StreamResponse::new(
							answer_id.clone(),
							ResponseType::Answer,
							ready,
							false,
						))
						.await;
				}
			}

			match gate.finish() {
				Some(rest) => {
					if !rest.is_empty() {
						reader
							.emit_response(StreamResponse::new(
								answer_id.clone(),
								ResponseType::Answer,
								rest,
								false,
							))
							.await;
					}

					false
				},
				None => true,
			}
		};
		let (outcome, suppressed) =
			tokio::join!(self.chat.complete_stream(&self.cfg, &messages, tx), forward);
		let text =
			outcome.map_err(|err| PluginError::model(format!("Chat stream failed: {err}.")))?;

		ctx.chat_response = text;

		if !suppressed {
			ctx.emit_response(StreamResponse::new(ctx.answer_id(), ResponseType::Answer, "", true))
				.await;
		}

		Ok(())
	}
}
impl Plugin for Completion {
	fn name(&self) -> &'static str {
		"completion"
	}

	fn stages(&self) -> &'static [Stage] {
		&[Stage::Complete, Stage::CompleteStream]
	}

	fn on_stage<'a>(
		&'a self,
		stage: Stage,
		ctx: &'a mut RequestContext,
		next: Next<'a>,
	) -> BoxFuture<'a, PluginResult> {
		Box::pin(async move {
			match stage {
				Stage::CompleteStream => self.complete_stream(ctx).await?,
				_ => self.complete(ctx).await?,
			}

			next.run(ctx).await
		})
	}
}

/// Replaces a streamed answer that opens with the no-match prefix by the fallback response.
pub struct StreamFilter {
	no_match_prefix: Option<String>,
	fallback_response: String,
}
impl StreamFilter {
	pub fn new(no_match_prefix: Option<String>, fallback_response: String) -> Self {
		Self { no_match_prefix, fallback_response }
	}
}
impl Plugin for StreamFilter {
	fn name(&self) -> &'static str {
		"stream_filter"
	}

	fn stages(&self) -> &'static [Stage] {
		&[Stage::StreamFilter]
	}

	fn on_stage<'a>(
		&'a self,
		_: Stage,
		ctx: &'a mut RequestContext,
		next: Next<'a>,
	) -> BoxFuture<'a, PluginResult> {
		Box::pin(async move {
			if is_no_match(self.no_match_prefix.as_deref(), &ctx.chat_response) {
				tracing::info!(
					request_id = %ctx.request_id,
					"Model reported no match; sending the fallback response."
				);

				ctx.chat_response = self.fallback_response.clone();

				let record = StreamResponse::new(
					ctx.answer_id(),
					ResponseType::Answer,
					self.fallback_response.clone(),
					true,
				);

				ctx.emit_response(record).await;
			}

			next.run(ctx).await
		})
	}
}

/// System prompt, the last two history turns, then the rendered user content (or the bare
/// query when no prompt was built).
pub fn chat_messages(system: &str, ctx: &RequestContext) -> Vec<ChatMessage> {
	let mut messages = vec![ChatMessage::system(system)];

	for turn in rewrite::recent_turns(&ctx.history, HISTORY_TURNS_IN_PROMPT) {
		messages.push(ChatMessage::user(turn.query.clone()));
		messages.push(ChatMessage::assistant(turn.answer.clone()));
	}

	let content = if ctx.user_content.trim().is_empty() { &ctx.query } else { &ctx.user_content };

	messages.push(ChatMessage::user(content.clone()));

	messages
}

pub fn is_no_match(prefix: Option<&str>, answer: &str) -> bool {
	prefix.is_some_and(|prefix| !prefix.is_empty() && answer.trim_start().starts_with(prefix))
}

/// Holds streamed text back while it is still a possible start of the no-match prefix.
#[derive(Debug)]
pub struct PrefixGate<'a> {
	prefix: Option<&'a str>,
	held: String,
	open: bool,
}
impl<'a> PrefixGate<'a> {
	pub fn new(prefix: Option<&'a str>) -> Self {
		let prefix = prefix.filter(|prefix| !prefix.is_empty());

		Self { prefix, held: String::new(), open: prefix.is_none() }
	}

	/// Text that may be forwarded now, if any.
	pub fn push(&mut self, delta: &str) -> Option<String> {
		if self.open {
			return Some(delta.to_string());
		}

		self.held.push_str(delta);

		let prefix = self.prefix?;
		let head = self.held.trim_start();

		if head.starts_with(prefix) || prefix.starts_with(head) {
			return None;
		}

		self.open = true;

		Some(std::mem::take(&mut self.held))
	}

	/// Remaining held text, or `None` when the answer opened with the prefix.
	pub fn finish(self) -> Option<String> {
		let Some(prefix) = self.prefix else {
			return Some(self.held);
		};

		let swallowed = !self.open && self.held.trim_start().starts_with(prefix);

		if swallowed { None } else { Some(self.held) }
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn gate_releases_once_the_prefix_is_ruled_out() {
		let mut gate = PrefixGate::new(Some("NO_MATCH"));

		assert_eq!(gate.push("NO"), None);
		assert_eq!(gate.push("pe, refunds"), Some("NOpe, refunds".to_string()));
		assert_eq!(gate.push(" take 30 days"), Some(" take 30 days".to_string()));
		assert_eq!(gate.finish(), Some(String::new()));
	}

	#[test]
	fn gate_swallows_a_prefixed_answer() {
		let mut gate = PrefixGate::new(Some("NO_MATCH"));

		assert_eq!(gate.push(" NO_"), None);
		assert_eq!(gate.push("MATCH: nothing relevant"), None);
		assert_eq!(gate.finish(), None);
	}

	#[test]
	fn a_short_answer_that_matches_part_of_the_prefix_is_released_at_the_end() {
		let mut gate = PrefixGate::new(Some("NO_MATCH"));

		assert_eq!(gate.push("NO"), None);
		assert_eq!(gate.finish(), Some("NO".to_string()));
	}

	#[test]
	fn without_a_prefix_everything_passes() {
		let mut gate = PrefixGate::new(None);

		assert_eq!(gate.push("a"), Some("a".to_string()));
		assert_eq!(gate.finish(), Some(String::new()));
		assert!(!is_no_match(None, "NO_MATCH"));
		assert!(is_no_match(Some("NO_MATCH"), "  NO_MATCH here"));
	}
}
