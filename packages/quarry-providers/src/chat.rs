use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;

use crate::{Error, Result};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
	pub role: String,
	pub content: String,
}
impl ChatMessage {
	pub fn system(content: impl Into<String>) -> Self {
		Self { role: "system".to_string(), content: content.into() }
	}

	pub fn user(content: impl Into<String>) -> Self {
		Self { role: "user".to_string(), content: content.into() }
	}

	pub fn assistant(content: impl Into<String>) -> Self {
		Self { role: "assistant".to_string(), content: content.into() }
	}
}

pub async fn complete(
	cfg: &quarry_config::LlmProviderConfig,
	messages: &[ChatMessage],
) -> Result<String> {
	let res = crate::client(cfg.timeout_ms)?
		.post(crate::endpoint(&cfg.api_base, &cfg.path))
		.headers(crate::auth_headers(&cfg.api_key, &cfg.default_headers)?)
		.json(&request_body(cfg, messages, false))
		.send()
		.await?;
	let json: Value = res.error_for_status()?.json().await?;

	parse_completion(&json)
}

/// Streams a completion, forwarding every content delta to `tx` as it arrives. Returns the
/// concatenated answer.
///
/// A closed receiver does not stop the request; the remaining deltas are still collected.
pub async fn complete_stream(
	cfg: &quarry_config::LlmProviderConfig,
	messages: &[ChatMessage],
	tx: &UnboundedSender<String>,
) -> Result<String> {
	let mut res = crate::client(cfg.timeout_ms)?
		.post(crate::endpoint(&cfg.api_base, &cfg.path))
		.headers(crate::auth_headers(&cfg.api_key, &cfg.default_headers)?)
		.json(&request_body(cfg, messages, true))
		.send()
		.await?
		.error_for_status()?;
	let mut decoder = SseDecoder::default();
	let mut answer = String::new();

	'read: while let Some(chunk) = res.chunk().await? {
		for data in decoder.push(&chunk) {
			if data == "[DONE]" {
				break 'read;
			}

			let json: Value = serde_json::from_str(&data)?;

			if let Some(delta) = parse_delta(&json)
				&& !delta.is_empty()
			{
				answer.push_str(delta);

				let _ = tx.send(delta.to_string());
			}
		}
	}

	tracing::debug!(model = %cfg.model, chars = answer.chars().count(), "Completion streamed.");

	Ok(answer)
}

fn request_body(
	cfg: &quarry_config::LlmProviderConfig,
	messages: &[ChatMessage],
	stream: bool,
) -> Value {
	serde_json::json!({
		"model": cfg.model,
		"temperature": cfg.temperature,
		"messages": messages,
		"stream": stream,
	})
}

fn parse_completion(json: &Value) -> Result<String> {
	json.get("choices")
		.and_then(Value::as_array)
		.and_then(|choices| choices.first())
		.and_then(|choice| choice.get("message"))
		.and_then(|message| message.get("content"))
		.and_then(Value::as_str)
		.map(str::to_string)
		.ok_or_else(|| Error::response("Completion response is missing message content."))
}

fn parse_delta(json: &Value) -> Option<&str> {
	json.get("choices")?.as_array()?.first()?.get("delta")?.get("content")?.as_str()
}

/// Splits a server-sent event byte stream into `data:` payloads.
///
/// Lines may be split across chunks at any byte, including inside a UTF-8 sequence.
#[derive(Debug, Default)]
pub struct SseDecoder {
	buffer: Vec<u8>,
}
impl SseDecoder {
	pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
		self.buffer.extend_from_slice(bytes);

		let mut out = Vec::new();

		while let Some(pos) = self.buffer.iter().position(|byte| *byte == b'\n') {
			let line = self.buffer.drain(..=pos).collect::<Vec<_>>();
			let line = String::from_utf8_lossy(&line);
			let line = line.trim_end_matches(['\r', '\n']);

			if let Some(data) = line.strip_prefix("data:") {
				out.push(data.trim_start().to_string());
			}
		}

		out
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn decoder_handles_split_lines_and_comments() {
		let mut decoder = SseDecoder::default();

		assert!(decoder.push(b": keep-alive\n\ndata: {\"a\"").is_empty());
		assert_eq!(decoder.push(b":1}\r\n\ndata: [DONE]\n"), vec!["{\"a\":1}", "[DONE]"]);
	}

	#[test]
	fn decoder_keeps_multibyte_characters_intact_across_chunks() {
		let mut decoder = SseDecoder::default();
		let line = "data: 退款\n".as_bytes();
		let (head, tail) = line.split_at(8);

		assert!(decoder.push(head).is_empty());
		assert_eq!(decoder.push(tail), vec!["退款"]);
	}

	#[test]
	fn parses_message_content_and_deltas() {
		let full = serde_json::json!({ "choices": [{ "message": { "content": "Hi." } }] });
		let delta = serde_json::json!({ "choices": [{ "delta": { "content": "H" } }] });

		assert_eq!(parse_completion(&full).expect("Failed to parse completion."), "Hi.");
		assert_eq!(parse_delta(&delta), Some("H"));
		assert_eq!(parse_delta(&serde_json::json!({ "choices": [] })), None);
	}
}
