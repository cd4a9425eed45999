use std::fmt;

use derive_new::new;
use serde::{Deserialize, Serialize};

pub mod capture;
pub mod config;
pub mod export;
pub mod extract;
pub mod llm;
pub mod locator;
pub mod runner;
pub mod session;
pub mod stop;
pub mod upload;

/// Most answer options a quiz-import row can hold
pub const MAX_OPTIONS: usize = 5;

/// A captured passage image on disk
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize, new)]
pub struct ScreenshotRecord {
	/// File name inside the images folder, e.g. `Q3_passage_panel.png`
	pub filename: String,
	/// Which locator strategy produced it
	pub description: String,
}

/// One step of the quiz sequence, filled in as the run progresses
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct QuestionRecord {
	/// 1-based position in the run
	pub number: u32,
	/// Number the page itself shows for this item, when it exposes one
	pub page_number: Option<u32>,
	pub text: String,
	/// Display order, at most [`MAX_OPTIONS`], no duplicates
	pub options: Vec<String>,
	pub screenshots: Vec<ScreenshotRecord>,
	/// Inferred correct option, 1-based. `None` is "uncertain / not asked".
	pub answer: Option<u8>,
	/// Public URL of the first uploaded screenshot
	pub image_url: Option<String>,
	pub failed: bool,
}

impl QuestionRecord {
	/// Texts are cleaned before repeats are dropped, options differing only by encoding artifacts collapse into one
	pub fn extracted(number: u32, page_number: Option<u32>, text: &str, options: &[String]) -> Self {
		let mut cleaned: Vec<String> = Vec::with_capacity(MAX_OPTIONS);
		for option in options.iter().map(|o| clean_text(o)) {
			if cleaned.len() == MAX_OPTIONS {
				break;
			}
			if !cleaned.contains(&option) {
				cleaned.push(option);
			}
		}
		Self {
			number,
			page_number,
			text: clean_text(text),
			options: cleaned,
			screenshots: Vec::new(),
			answer: None,
			image_url: None,
			failed: false,
		}
	}

	/// Placeholder kept in place of a question that could not be read, so positions stay aligned
	pub fn failed(number: u32) -> Self {
		Self {
			number,
			page_number: None,
			text: format!("[Question {number} - Failed]"),
			options: Vec::new(),
			screenshots: Vec::new(),
			answer: None,
			image_url: None,
			failed: true,
		}
	}

	/// Options padded with empty strings to exactly [`MAX_OPTIONS`] entries
	pub fn padded_options(&self) -> [&str; MAX_OPTIONS] {
		let mut out = [""; MAX_OPTIONS];
		for (slot, option) in out.iter_mut().zip(self.options.iter()) {
			*slot = option.as_str();
		}
		out
	}
}

impl fmt::Display for QuestionRecord {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		writeln!(f, "Q{}: {}", self.number, self.text)?;
		for (i, option) in self.options.iter().enumerate() {
			let marker = if self.answer == Some(i as u8 + 1) { '*' } else { ' ' };
			writeln!(f, " {marker} {}. {}", i + 1, option)?;
		}
		for shot in &self.screenshots {
			writeln!(f, "   [{}: {}]", shot.description, shot.filename)?;
		}
		if let Some(url) = &self.image_url {
			writeln!(f, "   Image: {url}")?;
		}
		Ok(())
	}
}

/// UTF-8 text that was decoded as cp1252 somewhere upstream
const MOJIBAKE: &[(&str, &str)] = &[
	("â€™", "'"),
	("â€œ", "\""),
	("â€\u{9d}", "\""),
	("â€˜", "'"),
	("â€¦", "..."),
	("â€“", "–"),
	("â€”", "—"),
	// bare prefix left over once the third byte was dropped
	("â€", "\""),
];

/// Repair common encoding artifacts in scraped text
pub fn clean_text(text: &str) -> String {
	let mut out = text.to_string();
	for (bad, good) in MOJIBAKE {
		if out.contains(bad) {
			out = out.replace(bad, good);
		}
	}
	out
}
