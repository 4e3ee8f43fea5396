use std::sync::Arc;

use quarry_config::LlmProviderConfig;
use quarry_domain::HistoryTurn;
use quarry_providers::ChatMessage;

use crate::{BoxFuture, ChatProvider, Next, Plugin, PluginResult, RequestContext, Stage};

/// Turns a follow-up question into a standalone one using recent history.
///
/// Never fails the stage: without history, with rewriting disabled, or when the model call
/// fails, `rewrite_query` is the original query.
pub struct RewriteQuery {
	chat: Arc<dyn ChatProvider>,
	cfg: LlmProviderConfig,
	template: String,
}
impl RewriteQuery {
	pub fn new(chat: Arc<dyn ChatProvider>, cfg: LlmProviderConfig, template: String) -> Self {
		Self { chat, cfg, template }
	}

	async fn rewrite(&self, ctx: &mut RequestContext) {
		ctx.rewrite_query = ctx.query.clone();

		if !ctx.enable_rewrite || ctx.history.is_empty() || ctx.max_history_turns == 0 {
			return;
		}

		let prompt = render_rewrite_prompt(
			&self.template,
			recent_turns(&ctx.history, ctx.max_history_turns),
			&ctx.query,
		);
		let messages = [ChatMessage::user(prompt)];

		match self.chat.complete(&self.cfg, &messages).await {
			Ok(text) if !text.trim().is_empty() => {
				tracing::debug!(
					request_id = %ctx.request_id,
					rewritten = %text.trim(),
					"Query rewritten."
				);

				ctx.rewrite_query = text.trim().to_string();
			},
			Ok(_) => {},
			Err(err) => {
				tracing::warn!(
					request_id = %ctx.request_id,
					error = %err,
					"Query rewrite failed; using the original query."
				);
			},
		}
	}
}
impl Plugin for RewriteQuery {
	fn name(&self) -> &'static str {
		"rewrite_query"
	}

	fn stages(&self) -> &'static [Stage] {
		&[Stage::RewriteQuery]
	}

	fn on_stage<'a>(
		&'a self,
		_: Stage,
		ctx: &'a mut RequestContext,
		next: Next<'a>,
	) -> BoxFuture<'a, PluginResult> {
		Box::pin(async move {
			self.rewrite(ctx).await;

			next.run(ctx).await
		})
	}
}

/// The last `limit` turns, oldest first.
pub fn recent_turns(history: &[HistoryTurn], limit: usize) -> &[HistoryTurn] {
	&history[history.len().saturating_sub(limit)..]
}

pub fn render_rewrite_prompt(template: &str, turns: &[HistoryTurn], query: &str) -> String {
	let history = turns
		.iter()
		.map(|turn| format!("User: {}\nAssistant: {}", turn.query.trim(), turn.answer.trim()))
		.collect::<Vec<_>>()
		.join("\n");

	template.replace("{{history}}", &history).replace("{{query}}", query)
}

#[cfg(test)]
mod tests {
	use super::*;

	fn turn(query: &str, answer: &str) -> HistoryTurn {
		HistoryTurn { query: query.to_string(), answer: answer.to_string(), ..Default::default() }
	}

	#[test]
	fn only_the_most_recent_turns_are_kept() {
		let history = vec![turn("a", "1"), turn("b", "2"), turn("c", "3")];
		let kept = recent_turns(&history, 2);

		assert_eq!(kept.iter().map(|turn| turn.query.as_str()).collect::<Vec<_>>(), vec!["b", "c"]);
		assert_eq!(recent_turns(&history, 10).len(), 3);
	}

	#[test]
	fn prompt_lists_history_before_the_question() {
		let rendered = render_rewrite_prompt(
			"{{history}}\nQ: {{query}}",
			&[turn("What is the refund policy?", "30 days.")],
			"And for gifts?",
		);

		assert_eq!(
			rendered,
			"User: What is the refund policy?\nAssistant: 30 days.\nQ: And for gifts?"
		);
	}
}
