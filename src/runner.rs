//! Run orchestration: step through the quiz, then upload, infer and export what was collected

use std::{fmt, path::PathBuf, time::Duration};

use color_eyre::Result;
use v_utils::{elog, log};

use crate::{
	QuestionRecord, ScreenshotRecord,
	config::{InferenceMode, RunSettings},
	export,
	extract::Extracted,
	llm::{AnswerClient, Prompted, Transport},
	stop::StopFlag,
	upload::{ImageHost, upload_all},
};

/// Everything the loop needs from the live quiz page
#[allow(async_fn_in_trait)]
pub trait QuizDriver {
	/// Block until the page reports it is loaded and widgets had time to render
	async fn wait_until_ready(&self) -> Result<()>;
	/// `Ok(None)` when the page is not showing a usable question
	async fn extract(&self) -> Result<Option<Extracted>>;
	async fn capture_passage(&self, number: u32) -> Vec<ScreenshotRecord>;
	/// Click the "next" control. `Ok(false)` if it never became clickable.
	async fn advance(&self) -> Result<bool>;
	/// Keep a copy of the page for looking into a failed extraction
	async fn dump_page(&self, _number: u32) {}
}

/// Why the loop ended
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LoopEnd {
	Completed,
	/// Stop requested; carries the number of questions processed
	Stopped(u32),
	/// The next control could not be clicked after this question
	NextUnreachable(u32),
}

pub async fn run_loop<D: QuizDriver>(driver: &D, question_count: u32, wait: Duration, stop: &StopFlag) -> (Vec<QuestionRecord>, LoopEnd) {
	let mut records = Vec::with_capacity(question_count as usize);

	for number in 1..=question_count {
		if stop.is_requested() {
			log!("Stopped after {} questions", number - 1);
			return (records, LoopEnd::Stopped(number - 1));
		}

		log!("{}", "=".repeat(70));
		log!("QUESTION {number}/{question_count}");

		if let Err(e) = driver.wait_until_ready().await {
			tracing::warn!("Page did not report ready: {e}");
		}
		tokio::time::sleep(wait).await;

		let extracted = match driver.extract().await {
			Ok(found) => found,
			Err(e) => {
				elog!("Extraction errored: {e}");
				None
			}
		};

		let record = match extracted {
			Some(ex) => {
				let mut record = QuestionRecord::extracted(number, ex.page_number, &ex.question, &ex.answers);
				record.screenshots = driver.capture_passage(number).await;
				let preview: String = record.text.chars().take(60).collect();
				log!("Extracted: {preview}... ({} answers, {} screenshots)", record.options.len(), record.screenshots.len());
				record
			}
			None => {
				elog!("Extraction failed for question {number}");
				driver.dump_page(number).await;
				QuestionRecord::failed(number)
			}
		};
		records.push(record);

		if number == question_count {
			break;
		}
		if stop.is_requested() {
			log!("Stopped after {number} questions");
			return (records, LoopEnd::Stopped(number));
		}
		match driver.advance().await {
			Ok(true) => log!("Next loaded"),
			Ok(false) => {
				elog!("Cannot click Next: control not found");
				return (records, LoopEnd::NextUnreachable(number));
			}
			Err(e) => {
				elog!("Cannot click Next: {e}");
				return (records, LoopEnd::NextUnreachable(number));
			}
		}
	}

	(records, LoopEnd::Completed)
}

/// Fill in answers for every successfully extracted record
pub async fn infer_answers<T: Transport>(client: &AnswerClient<T>, mode: InferenceMode, records: &mut [QuestionRecord]) {
	match mode {
		InferenceMode::Off => {}
		InferenceMode::PerQuestion =>
			for record in records.iter_mut().filter(|r| !r.failed) {
				let prompted = Prompted {
					question: &record.text,
					options: &record.options,
				};
				record.answer = client.answer_one(prompted, record.image_url.as_deref()).await;
				match record.answer {
					Some(n) => log!("Q{}: Answer = Option {n}", record.number),
					None => log!("Q{}: Uncertain", record.number),
				}
			},
		InferenceMode::Batch => {
			let answers = {
				let prompted: Vec<Prompted<'_>> = records
					.iter()
					.filter(|r| !r.failed)
					.map(|r| Prompted {
						question: &r.text,
						options: &r.options,
					})
					.collect();
				client.answer_batch(&prompted).await
			};
			for (record, answer) in records.iter_mut().filter(|r| !r.failed).zip(answers) {
				record.answer = answer;
			}
		}
	}
}

/// Counts reported at the end of a run
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Summary {
	pub attempted: usize,
	pub extracted: usize,
	pub failed: usize,
	pub captured: usize,
	pub uploaded: usize,
	/// `None` when no inference was run
	pub detected: Option<usize>,
	pub written: Vec<PathBuf>,
}

impl Summary {
	pub fn tally(records: &[QuestionRecord], uploaded: usize, inferred: bool) -> Self {
		let extracted = records.iter().filter(|r| !r.failed).count();
		Self {
			attempted: records.len(),
			extracted,
			failed: records.len() - extracted,
			captured: records.iter().map(|r| r.screenshots.len()).sum(),
			uploaded,
			detected: inferred.then(|| records.iter().filter(|r| !r.failed && r.answer.is_some()).count()),
			written: Vec::new(),
		}
	}

	pub fn uncertain(&self) -> Option<usize> {
		self.detected.map(|d| self.extracted - d)
	}

	/// Share of extracted questions that got an answer, in percent
	pub fn success_rate(&self) -> Option<f64> {
		let detected = self.detected?;
		(self.extracted > 0).then(|| detected as f64 * 100.0 / self.extracted as f64)
	}
}

impl fmt::Display for Summary {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{} questions: {} extracted, {} failed; {} images captured, {} uploaded", self.attempted, self.extracted, self.failed, self.captured, self.uploaded)?;
		if let (Some(detected), Some(uncertain), Some(rate)) = (self.detected, self.uncertain(), self.success_rate()) {
			write!(f, "; {detected} answers detected, {uncertain} uncertain ({rate:.1}%)")?;
		}
		Ok(())
	}
}

/// Upload, infer, export. Only writing the result files can fail.
pub async fn finish<H: ImageHost, T: Transport>(records: &mut [QuestionRecord], host: Option<&H>, client: Option<&AnswerClient<T>>, settings: &RunSettings, stamp: &str) -> Result<Summary> {
	let uploaded = match host {
		Some(host) => {
			log!("Uploading images...");
			upload_all(host, records, &settings.images_dir).await
		}
		None => {
			tracing::info!("Image upload disabled");
			0
		}
	};

	let inferred = match client {
		Some(client) if settings.inference != InferenceMode::Off => {
			log!("Analyzing answers...");
			infer_answers(client, settings.inference, records).await;
			true
		}
		_ => false,
	};

	let mut summary = Summary::tally(records, uploaded, inferred);
	summary.written = export::write_all(records, &settings.formats, &settings.results_base, stamp, settings.question_time_secs)?;
	Ok(summary)
}

/// Run the stop hook with a message if configured
pub fn run_stop_hook(hook: Option<&str>, message: &str) {
	if let Some(hook) = hook {
		log!("Running stop hook: {} {:?}", hook, message);
		// single quotes for the shell: ' becomes '\''
		let escaped = message.replace('\'', "'\\''");
		if let Err(e) = tokio::process::Command::new("sh").arg("-c").arg(format!("{hook} '{escaped}'")).spawn() {
			elog!("Failed to run stop hook: {e}");
		}
	}
}
