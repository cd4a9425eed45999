use std::{path::PathBuf, time::Duration};

use color_eyre::{
	Result,
	eyre::{bail, eyre},
};
use v_utils::macros::{MyConfigPrimitives, Settings};

use crate::{capture::OverflowCapture, export::OutputFormat, llm::Provider};

const DEFAULT_NEXT_SELECTOR: &str = "[data-test-id='next-button']";
const DEFAULT_SELECTOR_TYPE: &str = "css";
const DEFAULT_OUTPUT_DIR: &str = "quizshot_output";
const DEFAULT_RESULTS_FILE: &str = "quizshot_output/results";
const DEFAULT_OUTPUT_FORMATS: &str = "quiz";
const DEFAULT_OVERFLOW_CAPTURE: &str = "zoom";
const DEFAULT_LLM_PROVIDER: &str = "gemini";
const DEFAULT_INFERENCE_MODE: &str = "batch";
const DEFAULT_RATE_LIMIT_BACKOFF: &str = "linear";

#[derive(Clone, Debug, Default, MyConfigPrimitives, Settings)]
pub struct AppConfig {
	/// Quiz page to open before the start prompt
	pub target_url: String,
	/// Selector of the control that advances to the next question (default: [data-test-id='next-button'])
	#[serde(default)]
	pub next_selector: Option<String>,
	/// How `next_selector` is interpreted: css, xpath, id or class (default: css)
	#[serde(default)]
	pub selector_type: Option<String>,
	/// Number of questions to step through (default: 78)
	#[serde(default = "default_question_count")]
	pub question_count: u32,
	/// Seconds to wait on each question before reading it (default: 3)
	#[serde(default = "default_wait_secs")]
	pub wait_secs: u64,
	/// Pause after document.readyState is complete, for widget rendering (default: 1500)
	#[serde(default = "default_settle_ms")]
	pub settle_ms: u64,
	/// Seconds to keep looking for the next control before giving up (default: 5)
	#[serde(default = "default_next_timeout_secs")]
	pub next_timeout_secs: u64,
	/// Body zoom applied after navigation, in percent. 0 or 100 leaves it alone (default: 50)
	#[serde(default = "default_page_zoom")]
	pub page_zoom: u32,
	/// Folder for screenshots (default: quizshot_output)
	#[serde(default)]
	pub output_dir: Option<String>,
	/// Base path of result files; format and timestamp get appended (default: quizshot_output/results)
	#[serde(default)]
	pub results_file: Option<String>,
	/// Comma separated list of quiz, quiz_timed, flashcard, txt (default: quiz)
	#[serde(default)]
	pub output_formats: Option<String>,
	/// Value of the `Time in seconds` column of quiz_timed (default: 30)
	#[serde(default = "default_question_time_secs")]
	pub question_time_secs: u32,
	/// What to do with passages taller than their box: zoom, stitch or adaptive (default: zoom)
	#[serde(default)]
	pub overflow_capture: Option<String>,
	/// Overlap between consecutive stitched captures, px (default: 100)
	#[serde(default = "default_stitch_overlap_px")]
	pub stitch_overlap_px: u32,
	/// Run with visible browser window (default: true, the start prompt expects a manual login)
	#[serde(default = "default_true")]
	pub visible: bool,
	/// Upload captured passages to the image host (default: true)
	#[serde(default = "default_true")]
	pub upload_images: bool,
	/// Falls back to IMGBB_API_KEY
	#[serde(default)]
	pub imgbb_api_key: Option<String>,
	/// gemini or openrouter (default: gemini)
	#[serde(default)]
	pub llm_provider: Option<String>,
	/// Overrides the provider's default model
	#[serde(default)]
	pub llm_model: Option<String>,
	/// Overrides the provider's default endpoint
	#[serde(default)]
	pub llm_base_url: Option<String>,
	/// Falls back to GEMINI_API_KEY / OPENROUTER_API_KEY depending on the provider
	#[serde(default)]
	pub llm_api_key: Option<String>,
	/// off, per_question or batch (default: batch)
	#[serde(default)]
	pub inference_mode: Option<String>,
	/// Max requests per LLM call when rate limited (default: 3)
	#[serde(default = "default_api_retries")]
	pub api_retries: u32,
	/// linear (delay * attempt) or fixed (default: linear)
	#[serde(default)]
	pub rate_limit_backoff: Option<String>,
	/// Base delay between rate-limited LLM requests, seconds (default: 15)
	#[serde(default = "default_api_retry_delay_secs")]
	pub api_retry_delay_secs: u64,
	/// Listen for `q` + Enter on stdin to stop after the current question (default: true)
	#[serde(default = "default_true")]
	pub stop_key: bool,
	/// Command to run on completion/error (receives message as argument)
	#[serde(default)]
	pub stop_hook: Option<String>,
}

fn default_question_count() -> u32 {
	78
}

fn default_wait_secs() -> u64 {
	3
}

fn default_settle_ms() -> u64 {
	1500
}

fn default_next_timeout_secs() -> u64 {
	5
}

fn default_page_zoom() -> u32 {
	50
}

fn default_question_time_secs() -> u32 {
	30
}

fn default_stitch_overlap_px() -> u32 {
	100
}

fn default_true() -> bool {
	true
}

fn default_api_retries() -> u32 {
	3
}

fn default_api_retry_delay_secs() -> u64 {
	15
}

/// How the "next" control is looked up
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum NextControl {
	Css(String),
	XPath(String),
}

impl NextControl {
	pub fn parse(kind: &str, selector: &str) -> Result<Self> {
		let selector = selector.trim();
		if selector.is_empty() {
			bail!("next_selector is empty");
		}
		Ok(match kind.trim().to_ascii_lowercase().as_str() {
			"css" => NextControl::Css(selector.to_string()),
			"xpath" => NextControl::XPath(selector.to_string()),
			"id" => NextControl::Css(format!("#{selector}")),
			// class names may come space separated, css wants them chained
			"class" => NextControl::Css(selector.split_whitespace().map(|c| format!(".{c}")).collect()),
			other => bail!("Unknown selector_type '{other}' (expected css, xpath, id or class)"),
		})
	}
}

/// When to consult the LLM
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum InferenceMode {
	Off,
	PerQuestion,
	Batch,
}

impl InferenceMode {
	pub fn parse(s: &str) -> Result<Self> {
		match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
			"off" | "none" => Ok(InferenceMode::Off),
			"per_question" | "single" => Ok(InferenceMode::PerQuestion),
			"batch" => Ok(InferenceMode::Batch),
			other => bail!("Unknown inference_mode '{other}' (expected off, per_question or batch)"),
		}
	}
}

/// Wait schedule between rate-limited requests
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Backoff {
	/// `step * attempt`
	Linear(Duration),
	Fixed(Duration),
}

impl Backoff {
	pub fn parse(s: &str, base: Duration) -> Result<Self> {
		match s.trim().to_ascii_lowercase().as_str() {
			"linear" => Ok(Backoff::Linear(base)),
			"fixed" => Ok(Backoff::Fixed(base)),
			other => bail!("Unknown rate_limit_backoff '{other}' (expected linear or fixed)"),
		}
	}

	/// Delay after the `attempt`-th (1-based) rate-limited request
	pub fn delay(&self, attempt: u32) -> Duration {
		match self {
			Backoff::Linear(step) => *step * attempt,
			Backoff::Fixed(d) => *d,
		}
	}
}

/// Everything the LLM client needs, with the key already resolved
#[derive(Clone, Debug)]
pub struct LlmSettings {
	pub provider: Provider,
	pub api_key: String,
	pub model: String,
	pub base_url: String,
	pub max_attempts: u32,
	pub backoff: Backoff,
}

/// Typed view of [`AppConfig`], built once at startup
#[derive(Clone, Debug)]
pub struct RunSettings {
	pub target_url: String,
	pub next_control: NextControl,
	pub question_count: u32,
	pub wait: Duration,
	pub settle: Duration,
	pub next_timeout: Duration,
	pub page_zoom: u32,
	pub images_dir: PathBuf,
	pub results_base: PathBuf,
	pub formats: Vec<OutputFormat>,
	pub question_time_secs: u32,
	pub overflow: OverflowCapture,
	pub stitch_overlap: u32,
	pub imgbb_api_key: Option<String>,
	pub inference: InferenceMode,
	/// `None` when no key could be found; inference is then skipped
	pub llm: Option<LlmSettings>,
}

impl AppConfig {
	/// Parse the string-typed settings and resolve secrets from the environment
	pub fn resolve(&self) -> Result<RunSettings> {
		if self.target_url.trim().is_empty() {
			bail!("target_url is not set");
		}
		if self.question_count == 0 {
			bail!("question_count must be at least 1");
		}

		let formats = or_default(&self.output_formats, DEFAULT_OUTPUT_FORMATS)
			.split(',')
			.map(str::trim)
			.filter(|s| !s.is_empty())
			.map(OutputFormat::parse)
			.collect::<Result<Vec<_>>>()?;
		if formats.is_empty() {
			bail!("output_formats lists no format");
		}

		let provider = Provider::parse(or_default(&self.llm_provider, DEFAULT_LLM_PROVIDER))?;
		let inference = InferenceMode::parse(or_default(&self.inference_mode, DEFAULT_INFERENCE_MODE))?;
		let backoff = Backoff::parse(or_default(&self.rate_limit_backoff, DEFAULT_RATE_LIMIT_BACKOFF), Duration::from_secs(self.api_retry_delay_secs))?;
		let llm = self.llm_api_key.clone().or_else(|| std::env::var(provider.key_env()).ok()).filter(|k| !k.trim().is_empty()).map(|api_key| LlmSettings {
			provider,
			api_key,
			model: self.llm_model.clone().unwrap_or_else(|| provider.default_model().to_string()),
			base_url: self.llm_base_url.clone().unwrap_or_else(|| provider.default_base_url().to_string()),
			max_attempts: self.api_retries.max(1),
			backoff,
		});

		Ok(RunSettings {
			target_url: self.target_url.trim().to_string(),
			next_control: NextControl::parse(or_default(&self.selector_type, DEFAULT_SELECTOR_TYPE), or_default(&self.next_selector, DEFAULT_NEXT_SELECTOR))?,
			question_count: self.question_count,
			wait: Duration::from_secs(self.wait_secs),
			settle: Duration::from_millis(self.settle_ms),
			next_timeout: Duration::from_secs(self.next_timeout_secs),
			page_zoom: self.page_zoom,
			images_dir: PathBuf::from(or_default(&self.output_dir, DEFAULT_OUTPUT_DIR)).join("quiz_images"),
			results_base: PathBuf::from(or_default(&self.results_file, DEFAULT_RESULTS_FILE)),
			formats,
			question_time_secs: self.question_time_secs,
			overflow: OverflowCapture::parse(or_default(&self.overflow_capture, DEFAULT_OVERFLOW_CAPTURE))?,
			stitch_overlap: self.stitch_overlap_px,
			imgbb_api_key: if self.upload_images {
				self.imgbb_api_key.clone().or_else(|| std::env::var("IMGBB_API_KEY").ok()).filter(|k| !k.trim().is_empty())
			} else {
				None
			},
			inference,
			llm,
		})
	}
}

/// Unset and blank string settings fall back to their default
fn or_default<'a>(value: &'a Option<String>, default: &'a str) -> &'a str {
	value.as_deref().map(str::trim).filter(|v| !v.is_empty()).unwrap_or(default)
}

impl RunSettings {
	pub fn ai_enabled(&self) -> bool {
		self.inference != InferenceMode::Off && self.llm.is_some()
	}
}

/// Rejects obviously broken URLs before a browser is launched
pub fn check_target_url(url: &str) -> Result<()> {
	if url.starts_with("http://") || url.starts_with("https://") || url.starts_with("file://") {
		Ok(())
	} else {
		Err(eyre!("target_url must be an http(s) or file URL, got '{url}'"))
	}
}
