//! Local query variants for low-recall searches, derived without a model call.

use std::{collections::HashSet, sync::LazyLock};

use regex::Regex;
use unicode_script::{Script, UnicodeScript};

pub const MAX_VARIANTS: usize = 5;

const MIN_VARIANT_CHARS: usize = 3;
const MIN_PHRASE_CHARS: usize = 3;
const MIN_SEGMENT_CHARS: usize = 6;
const STOPWORDS: &[&str] = &[
	"的", "是", "在", "了", "和", "与", "或", "a", "an", "the", "is", "are", "was", "were", "be",
	"been", "being", "have", "has", "had", "do", "does", "did", "will", "would", "could",
	"should", "may", "might", "must", "can", "to", "of", "in", "for", "on", "with", "at", "by",
	"from", "as", "into", "through", "about", "what", "how", "why", "when", "where", "which",
	"who", "whom", "whose",
];

static QUOTED_PHRASE: LazyLock<Option<Regex>> = LazyLock::new(|| {
	Regex::new(r#"["'“”‘’「」『』]([^"'“”‘’「」『』]+)["'“”‘’「」『』]"#).ok()
});
static DELIMITERS: LazyLock<Option<Regex>> =
	LazyLock::new(|| Regex::new(r"[,，;；、。！？!?\s]+").ok());
static QUESTION_PREFIX: LazyLock<Option<Regex>> = LazyLock::new(|| {
	Regex::new(
		r"(?i)^(?:什么是|什么|如何|怎么|怎样|为什么|为何|哪个|哪些|谁|何时|何地|请问|请告诉我|帮我|我想知道|我想了解|(?:what\s+is|what\s+are|what|how\s+do\s+i|how\s+to|how|why|which|who|when|where|please\s+tell\s+me|tell\s+me\s+about)\b)\s*",
	)
	.ok()
});

/// Derives up to [`MAX_VARIANTS`] query variants from `rewrite_query`.
///
/// Variants are compared case-insensitively against each other and against both queries, so
/// neither query is ever returned as its own variant.
pub fn expand_query(rewrite_query: &str, original_query: &str) -> Vec<String> {
	let query = rewrite_query.trim();

	if query.is_empty() {
		return Vec::new();
	}

	let mut collector = VariantCollector::new(query, original_query);
	let keywords = extract_keywords(query);

	if keywords.len() >= 2 {
		collector.add(&keywords.join(" "));
	}

	for phrase in extract_phrases(query) {
		collector.add(&phrase);
	}
	for segment in split_by_delimiters(query) {
		if segment.chars().count() >= MIN_SEGMENT_CHARS {
			collector.add(&segment);
		}
	}

	let cleaned = strip_question_words(query);

	if cleaned != query {
		collector.add(&cleaned);
	}

	collector.finish()
}

/// Splits on anything that is not a letter or digit. Every Han character is a token by itself.
pub fn tokenize(text: &str) -> Vec<String> {
	let mut tokens = Vec::new();
	let mut current = String::new();

	for ch in text.chars() {
		if ch.script() == Script::Han {
			if !current.is_empty() {
				tokens.push(std::mem::take(&mut current));
			}

			tokens.push(ch.to_string());
		} else if ch.is_alphanumeric() {
			current.push(ch);
		} else if !current.is_empty() {
			tokens.push(std::mem::take(&mut current));
		}
	}

	if !current.is_empty() {
		tokens.push(current);
	}

	tokens
}

pub fn extract_keywords(text: &str) -> Vec<String> {
	tokenize(text)
		.into_iter()
		.filter(|token| {
			let lower = token.to_lowercase();

			!STOPWORDS.contains(&lower.as_str()) && (token.chars().count() > 1 || is_han(token))
		})
		.collect()
}

pub fn extract_phrases(text: &str) -> Vec<String> {
	let Some(re) = QUOTED_PHRASE.as_ref() else {
		return Vec::new();
	};

	re.captures_iter(text)
		.filter_map(|captures| captures.get(1))
		.map(|phrase| phrase.as_str().to_string())
		.filter(|phrase| phrase.chars().count() >= MIN_PHRASE_CHARS)
		.collect()
}

pub fn split_by_delimiters(text: &str) -> Vec<String> {
	let Some(re) = DELIMITERS.as_ref() else {
		return vec![text.trim().to_string()];
	};

	re.split(text)
		.map(str::trim)
		.filter(|segment| !segment.is_empty())
		.map(str::to_string)
		.collect()
}

pub fn strip_question_words(text: &str) -> String {
	match QUESTION_PREFIX.as_ref() {
		Some(re) => re.replace(text, "").trim().to_string(),
		None => text.trim().to_string(),
	}
}

fn is_han(token: &str) -> bool {
	token.chars().all(|ch| ch.script() == Script::Han)
}

struct VariantCollector {
	seen: HashSet<String>,
	variants: Vec<String>,
}
impl VariantCollector {
	fn new(query: &str, original_query: &str) -> Self {
		let mut seen = HashSet::new();

		seen.insert(query.to_lowercase());

		let original = original_query.trim().to_lowercase();

		if !original.is_empty() {
			seen.insert(original);
		}

		Self { seen, variants: Vec::with_capacity(MAX_VARIANTS) }
	}

	fn add(&mut self, candidate: &str) {
		let candidate = candidate.trim();

		if candidate.chars().count() < MIN_VARIANT_CHARS {
			return;
		}
		if !self.seen.insert(candidate.to_lowercase()) {
			return;
		}

		self.variants.push(candidate.to_string());
	}

	fn finish(mut self) -> Vec<String> {
		self.variants.truncate(MAX_VARIANTS);

		self.variants
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn han_characters_are_single_tokens() {
		assert_eq!(tokenize("退款policy v2"), vec!["退", "款", "policy", "v2"]);
	}

	#[test]
	fn question_prefixes_are_stripped() {
		assert_eq!(strip_question_words("What is the refund policy?"), "the refund policy?");
		assert_eq!(strip_question_words("如何申请退款"), "申请退款");
		assert_eq!(strip_question_words("Whatever happened"), "Whatever happened");
	}

	#[test]
	fn quoted_phrases_are_extracted() {
		assert_eq!(extract_phrases(r#"find "late fee" rules"#), vec!["late fee"]);
		assert!(extract_phrases(r#"a "ab" b"#).is_empty());
	}
}
