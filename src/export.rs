use std::path::{Path, PathBuf};

use color_eyre::{
	Result,
	eyre::{bail, eyre},
};
use v_utils::log;

use crate::{MAX_OPTIONS, QuestionRecord};

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";
const QUESTION_TYPE: &str = "Multiple Choice";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OutputFormat {
	/// Quiz-import sheet
	Quiz,
	/// Quiz-import sheet with a per-question time limit column
	QuizTimed,
	/// Flashcard-import sheet, correct answer left for manual fill-in
	Flashcard,
	/// Plain text dump, failed placeholders included
	Txt,
}

impl OutputFormat {
	pub fn parse(s: &str) -> Result<Self> {
		match s.trim().to_ascii_lowercase().as_str() {
			"quiz" | "csv" => Ok(OutputFormat::Quiz),
			"quiz_timed" => Ok(OutputFormat::QuizTimed),
			"flashcard" => Ok(OutputFormat::Flashcard),
			"txt" | "text" => Ok(OutputFormat::Txt),
			other => bail!("Unknown output format '{other}' (expected quiz, quiz_timed, flashcard or txt)"),
		}
	}

	pub fn name(&self) -> &'static str {
		match self {
			OutputFormat::Quiz => "quiz",
			OutputFormat::QuizTimed => "quiz_timed",
			OutputFormat::Flashcard => "flashcard",
			OutputFormat::Txt => "txt",
		}
	}

	pub fn extension(&self) -> &'static str {
		match self {
			OutputFormat::Txt => "txt",
			_ => "csv",
		}
	}

	/// File contents for `records`. Pure: same records, same bytes.
	pub fn render(&self, records: &[QuestionRecord], question_time_secs: u32) -> Result<Vec<u8>> {
		match self {
			OutputFormat::Txt => Ok(render_txt(records).into_bytes()),
			csv_format => render_csv(*csv_format, records, question_time_secs),
		}
	}
}

fn header(format: OutputFormat) -> Vec<String> {
	let options = (1..=MAX_OPTIONS).map(|i| format!("Option {i}"));
	match format {
		OutputFormat::Flashcard => std::iter::once("Question".to_string())
			.chain((1..=MAX_OPTIONS).map(|i| format!("Answer{i}")))
			.chain(std::iter::once("CorrectAnswer".to_string()))
			.collect(),
		OutputFormat::QuizTimed => ["Question", "Question Type"]
			.into_iter()
			.map(String::from)
			.chain(options)
			.chain(["Correct Answer", "Time in seconds", "Image Link"].into_iter().map(String::from))
			.collect(),
		_ => ["Question", "Question Type"]
			.into_iter()
			.map(String::from)
			.chain(options)
			.chain(["Correct Answer", "Image Link"].into_iter().map(String::from))
			.collect(),
	}
}

fn row(format: OutputFormat, record: &QuestionRecord, question_time_secs: u32) -> Vec<String> {
	let options = record.padded_options().map(String::from);
	let answer = record.answer.map(|a| a.to_string()).unwrap_or_default();
	let image = record.image_url.clone().unwrap_or_default();
	let mut out = vec![record.text.clone()];
	match format {
		OutputFormat::Flashcard => {
			out.extend(options);
			out.push(String::new());
		}
		_ => {
			out.push(QUESTION_TYPE.to_string());
			out.extend(options);
			out.push(answer);
			if format == OutputFormat::QuizTimed {
				out.push(question_time_secs.to_string());
			}
			out.push(image);
		}
	}
	out
}

fn render_csv(format: OutputFormat, records: &[QuestionRecord], question_time_secs: u32) -> Result<Vec<u8>> {
	let mut writer = csv::Writer::from_writer(UTF8_BOM.to_vec());
	writer.write_record(header(format)).map_err(|e| eyre!("Failed to write CSV header: {e}"))?;
	for record in records.iter().filter(|r| !r.failed) {
		writer
			.write_record(row(format, record, question_time_secs))
			.map_err(|e| eyre!("Failed to write CSV row for Q{}: {e}", record.number))?;
	}
	writer.into_inner().map_err(|e| eyre!("Failed to flush CSV: {e}"))
}

fn render_txt(records: &[QuestionRecord]) -> String {
	let mut out = String::from("QUIZ QUESTIONS AND ANSWERS\n");
	out.push_str(&"=".repeat(80));
	out.push_str("\n\n");
	for record in records {
		out.push_str(&record.to_string());
		out.push('\n');
	}
	out
}

/// `{base}_{format}_{stamp}.{ext}`, next to `base`
pub fn output_path(base: &Path, format: OutputFormat, stamp: &str) -> PathBuf {
	let stem = base.file_name().map(|s| s.to_string_lossy().to_string()).unwrap_or_else(|| "results".to_string());
	base.with_file_name(format!("{stem}_{}_{stamp}.{}", format.name(), format.extension()))
}

pub fn run_stamp() -> String {
	chrono::Local::now().format("%Y%m%d_%H%M%S").to_string()
}

/// Write every requested format, returning the paths written
pub fn write_all(records: &[QuestionRecord], formats: &[OutputFormat], base: &Path, stamp: &str, question_time_secs: u32) -> Result<Vec<PathBuf>> {
	if let Some(parent) = base.parent().filter(|p| !p.as_os_str().is_empty()) {
		std::fs::create_dir_all(parent).map_err(|e| eyre!("Failed to create {}: {e}", parent.display()))?;
	}
	let mut written = Vec::with_capacity(formats.len());
	for format in formats {
		let path = output_path(base, *format, stamp);
		let bytes = format.render(records, question_time_secs)?;
		std::fs::write(&path, bytes).map_err(|e| eyre!("Failed to write {}: {e}", path.display()))?;
		log!("Saved {} results to {}", format.name(), path.display());
		written.push(path);
	}
	Ok(written)
}

#[cfg(test)]
mod tests {
	use super::*;

	fn records() -> Vec<QuestionRecord> {
		let mut q1 = QuestionRecord::extracted(1, Some(1), "Which of the following, \"best\" fits?", &["Yes, mostly".into(), "No".into()]);
		q1.answer = Some(2);
		q1.image_url = Some("https://i.ibb.co/a/Q1.png".into());
		let q3 = QuestionRecord::extracted(3, None, "What is the capital of France?", &["London".into(), "Paris".into(), "Berlin".into()]);
		vec![q1, QuestionRecord::failed(2), q3]
	}

	fn body(bytes: &[u8]) -> &str {
		std::str::from_utf8(bytes.strip_prefix(UTF8_BOM).expect("bom")).unwrap()
	}

	#[test]
	fn quiz_csv_pads_options_and_skips_failed() {
		let bytes = OutputFormat::Quiz.render(&records(), 30).unwrap();
		let mut reader = csv::Reader::from_reader(body(&bytes).as_bytes());

		let headers = reader.headers().unwrap().clone();
		assert_eq!(headers.len(), 9);
		assert_eq!(&headers[2], "Option 1");
		assert_eq!(&headers[8], "Image Link");

		let rows: Vec<csv::StringRecord> = reader.records().map(|r| r.unwrap()).collect();
		assert_eq!(rows.len(), 2);
		assert!(rows.iter().all(|r| r.len() == 9));
		assert_eq!(&rows[0][0], "Which of the following, \"best\" fits?");
		assert_eq!(&rows[0][2], "Yes, mostly");
		assert_eq!(&rows[0][4], "");
		assert_eq!(&rows[0][7], "2");
		assert_eq!(&rows[1][7], "");
		assert_eq!(&rows[1][8], "");
	}

	#[test]
	fn timed_column_sits_before_image_link() {
		let bytes = OutputFormat::QuizTimed.render(&records(), 45).unwrap();
		let mut reader = csv::Reader::from_reader(body(&bytes).as_bytes());
		assert_eq!(&reader.headers().unwrap()[8], "Time in seconds");
		let first = reader.records().next().unwrap().unwrap();
		assert_eq!(&first[8], "45");
		assert_eq!(&first[9], "https://i.ibb.co/a/Q1.png");
	}

	#[test]
	fn flashcard_leaves_answer_blank() {
		let bytes = OutputFormat::Flashcard.render(&records(), 30).unwrap();
		let mut reader = csv::Reader::from_reader(body(&bytes).as_bytes());
		assert_eq!(&reader.headers().unwrap()[6], "CorrectAnswer");
		for row in reader.records() {
			let row = row.unwrap();
			assert_eq!(row.len(), 7);
			assert_eq!(&row[6], "");
		}
	}

	#[test]
	fn rendering_is_repeatable() {
		let records = records();
		for format in [OutputFormat::Quiz, OutputFormat::Flashcard, OutputFormat::Txt] {
			assert_eq!(format.render(&records, 30).unwrap(), format.render(&records, 30).unwrap());
		}
	}

	#[test]
	fn txt_keeps_failed_placeholders() {
		let text = String::from_utf8(OutputFormat::Txt.render(&records(), 30).unwrap()).unwrap();
		assert!(text.contains("[Question 2 - Failed]"));
		assert!(text.contains(" * 2. No"));
	}

	#[test]
	fn files_are_suffixed_per_format() {
		let dir = tempfile::tempdir().unwrap();
		let base = dir.path().join("out").join("results");

		let written = write_all(&records(), &[OutputFormat::Quiz, OutputFormat::Txt], &base, "20250101_120000", 30).unwrap();

		assert_eq!(written, vec![dir.path().join("out/results_quiz_20250101_120000.csv"), dir.path().join("out/results_txt_20250101_120000.txt")]);
		assert!(std::fs::read(&written[0]).unwrap().starts_with(UTF8_BOM));
	}

	#[test]
	fn format_names_parse() {
		assert_eq!(OutputFormat::parse(" Quiz_Timed ").unwrap(), OutputFormat::QuizTimed);
		assert!(OutputFormat::parse("pdf").is_err());
	}
}
