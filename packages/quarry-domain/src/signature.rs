//! Content signatures for duplicate detection independent of result identity.

/// Canonicalizes `content` and hashes it.
///
/// Canonical form is lowercase, trimmed, with internal whitespace runs collapsed to one space.
/// Blank input yields an empty signature, so blank passages never collide with each other.
pub fn content_signature(content: &str) -> String {
	let lowered = content.trim().to_lowercase();

	if lowered.is_empty() {
		return String::new();
	}

	let canonical = lowered.split_whitespace().collect::<Vec<_>>().join(" ");

	blake3::hash(canonical.as_bytes()).to_hex().to_string()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn case_and_whitespace_do_not_change_the_signature() {
		assert_eq!(content_signature("Hello   World"), content_signature("hello world"));
		assert_eq!(
			content_signature("  line one\n\tline two "),
			content_signature("LINE ONE LINE TWO")
		);
	}

	#[test]
	fn blank_input_has_an_empty_signature() {
		assert_eq!(content_signature(""), "");
		assert_eq!(content_signature(" \n\t "), "");
		assert_ne!(content_signature("a"), "");
	}

	#[test]
	fn different_text_differs() {
		assert_ne!(content_signature("refund policy"), content_signature("return policy"));
	}
}
