//! Reading the active question and its options out of the quiz widget.
//!
//! The widget library keeps neighbouring items rendered off-screen, so the page script first
//! picks the one container that is actually visible. It hands back raw texts; choosing the
//! question paragraph and cleaning the options happens here, on the Rust side.

use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;

use crate::MAX_OPTIONS;

/// Below this many characters a "question" is a page in some other state
pub const MIN_QUESTION_CHARS: usize = 10;
pub const MIN_ANSWERS: usize = 2;
/// Paragraphs this long are considered question candidates
const LONG_PARAGRAPH_CHARS: usize = 20;
/// Cap on the stimulus fallback
const STIMULUS_CAP_CHARS: usize = 500;

pub const EXTRACT_SCRIPT: &str = r#"
	(function() {
		const result = { container_found: false, total_containers: 0, page_number: null, paragraphs: [], stimulus_text: '', answers: [] };

		const containers = document.querySelectorAll('.learnosity-item, [class*="question"], .lrn-assessment-wrapper, .lrn_assessment');
		result.total_containers = containers.length;

		let active = null;
		for (const container of containers) {
			const style = window.getComputedStyle(container);
			const rect = container.getBoundingClientRect();
			const visible = style.display !== 'none' &&
				style.visibility !== 'hidden' &&
				style.opacity !== '0' &&
				rect.width > 100 &&
				rect.height > 100 &&
				rect.top >= 0 &&
				rect.top < window.innerHeight;
			if (!visible) continue;
			if (container.querySelector('.lrn_stimulus_content') || container.querySelector('input[type="radio"]')) {
				active = container;
				break;
			}
		}
		if (!active) return JSON.stringify(result);
		result.container_found = true;

		const stimulus = active.querySelector('.lrn_stimulus_content');
		if (stimulus) {
			for (const p of stimulus.querySelectorAll('p')) {
				result.paragraphs.push((p.innerText || p.textContent || '').trim());
			}
			result.stimulus_text = (stimulus.innerText || stimulus.textContent || '').trim();
		}

		for (const input of active.querySelectorAll('input[type="radio"]')) {
			const texts = [];
			const label = input.id ? document.querySelector('label[for="' + CSS.escape(input.id) + '"]') : input.closest('label');
			const possible = label ? label.querySelector('.lrn-possible-answer') : null;
			if (possible) {
				for (const wrapper of possible.querySelectorAll('.lrn_contentWrapper')) {
					if (wrapper.closest('.sr-only')) continue;
					const p = wrapper.querySelector('p');
					if (p) texts.push((p.innerText || p.textContent || '').trim());
				}
			} else if (label) {
				texts.push((label.innerText || label.textContent || '').trim());
			}
			result.answers.push(texts);
		}

		const num = active.querySelector('.item-number');
		if (num) {
			const parsed = parseInt(num.innerText.trim(), 10);
			if (!isNaN(parsed)) result.page_number = parsed;
		}

		return JSON.stringify(result);
	})()
"#;

/// What [`EXTRACT_SCRIPT`] reports
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct RawQuestion {
	pub container_found: bool,
	pub total_containers: u32,
	pub page_number: Option<u32>,
	/// Stimulus paragraphs in document order
	pub paragraphs: Vec<String>,
	pub stimulus_text: String,
	/// Per answer input, the candidate texts of its label
	pub answers: Vec<Vec<String>>,
}

/// A page state that looks like a real question
#[derive(Clone, Debug, PartialEq)]
pub struct Extracted {
	pub page_number: Option<u32>,
	pub question: String,
	pub answers: Vec<String>,
}

static OPTION_PREFIX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)^Option\s+[A-E],?\s*").expect("static regex"));
static LETTER_PREFIX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[A-E]\.\s*").expect("static regex"));
static BARE_LETTER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[A-E]$").expect("static regex"));

/// Remove screen-reader style prefixes like "Option A, " and "A. "
pub fn strip_option_prefix(text: &str) -> String {
	let text = OPTION_PREFIX.replace(text.trim(), "");
	LETTER_PREFIX.replace(&text, "").trim().to_string()
}

/// Question paragraph: first long one that asks something, else first long one, else the capped stimulus
pub fn select_question(paragraphs: &[String], stimulus_text: &str) -> String {
	let mut first_long = None;
	for p in paragraphs.iter().map(|p| p.trim()) {
		if p.chars().count() <= LONG_PARAGRAPH_CHARS {
			continue;
		}
		if p.contains('?') || p.contains("following") {
			return p.to_string();
		}
		first_long.get_or_insert(p);
	}
	match first_long {
		Some(p) => p.to_string(),
		None => stimulus_text.trim().chars().take(STIMULUS_CAP_CHARS).collect(),
	}
}

/// One text per input, first usable candidate wins; unique, at most [`MAX_OPTIONS`]
pub fn select_answers(per_input: &[Vec<String>]) -> Vec<String> {
	let mut answers: Vec<String> = Vec::new();
	for candidates in per_input {
		for raw in candidates {
			let text = strip_option_prefix(raw);
			if text.chars().count() > 2 && !BARE_LETTER.is_match(&text) && !answers.contains(&text) {
				answers.push(text);
				break;
			}
		}
		if answers.len() == MAX_OPTIONS {
			break;
		}
	}
	answers
}

impl RawQuestion {
	/// `None` when the page is not showing a usable question
	pub fn validate(self) -> Option<Extracted> {
		if !self.container_found {
			tracing::debug!("No active container among {}", self.total_containers);
			return None;
		}
		let question = select_question(&self.paragraphs, &self.stimulus_text);
		let answers = select_answers(&self.answers);
		tracing::debug!("Question #{:?}: {} chars, {} answer(s)", self.page_number, question.chars().count(), answers.len());

		if question.chars().count() < MIN_QUESTION_CHARS {
			tracing::debug!("Question too short");
			return None;
		}
		if answers.len() < MIN_ANSWERS {
			tracing::debug!("Not enough answers");
			return None;
		}
		Some(Extracted {
			page_number: self.page_number,
			question,
			answers,
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn strings(items: &[&str]) -> Vec<String> {
		items.iter().map(|s| s.to_string()).collect()
	}

	fn raw(question: &str, answers: &[&str]) -> RawQuestion {
		RawQuestion {
			container_found: true,
			total_containers: 3,
			page_number: Some(4),
			paragraphs: Vec::new(),
			stimulus_text: question.to_string(),
			answers: answers.iter().map(|a| vec![a.to_string()]).collect(),
		}
	}

	#[test]
	fn prefixes_are_stripped() {
		assert_eq!(strip_option_prefix("Option A, The Treaty of Paris"), "The Treaty of Paris");
		assert_eq!(strip_option_prefix("option c The Treaty"), "The Treaty");
		assert_eq!(strip_option_prefix("B. Mercantilism"), "Mercantilism");
		assert_eq!(strip_option_prefix("Mercantilism"), "Mercantilism");
		assert_eq!(strip_option_prefix("Economic growth"), "Economic growth");
	}

	#[test]
	fn question_prefers_asking_paragraph() {
		let paragraphs = strings(&["short", "The passage above was written in 1776 by a colonist.", "Which of the following best describes the author's view?"]);
		assert_eq!(select_question(&paragraphs, "ignored"), "Which of the following best describes the author's view?");
	}

	#[test]
	fn question_falls_back_to_first_long_then_stimulus() {
		let paragraphs = strings(&["tiny", "A long paragraph with no question mark in it."]);
		assert_eq!(select_question(&paragraphs, "ignored"), "A long paragraph with no question mark in it.");

		let stimulus = "x".repeat(800);
		assert_eq!(select_question(&strings(&["tiny"]), &stimulus).len(), 500);
	}

	#[test]
	fn answers_are_unique_and_capped() {
		let per_input: Vec<Vec<String>> = ["A. One", "One", "B", "Option C, Three", "Four", "Five", "Six", "Seven"].iter().map(|s| vec![s.to_string()]).collect();
		let answers = select_answers(&per_input);
		assert_eq!(answers, strings(&["One", "Three", "Four", "Five", "Six"]));
	}

	#[test]
	fn later_candidate_of_same_input_is_used() {
		let per_input = vec![strings(&["A", "Option A, Photosynthesis"]), strings(&["Respiration"])];
		assert_eq!(select_answers(&per_input), strings(&["Photosynthesis", "Respiration"]));
	}

	#[test]
	fn nine_char_question_is_rejected() {
		assert_eq!(raw("123456789", &["first", "second"]).validate(), None);
	}

	#[test]
	fn single_answer_is_rejected() {
		assert_eq!(raw("What is the capital of France?", &["Paris", "Paris"]).validate(), None);
	}

	#[test]
	fn valid_question_passes() {
		let extracted = raw("What is the capital of France?", &["London", "Paris", "Berlin"]).validate().unwrap();
		assert_eq!(extracted.page_number, Some(4));
		assert_eq!(extracted.answers.len(), 3);
	}

	#[test]
	fn missing_container_is_no_data() {
		assert_eq!(RawQuestion::default().validate(), None);
	}

	#[test]
	fn script_output_deserializes() {
		let json = r#"{"container_found":true,"total_containers":2,"page_number":null,"paragraphs":["p"],"stimulus_text":"s","answers":[["a","b"]]}"#;
		let parsed: RawQuestion = serde_json::from_str(json).unwrap();
		assert_eq!(parsed.answers, vec![strings(&["a", "b"])]);
	}
}
