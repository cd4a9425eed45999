//! Asking a language model which option is correct.
//!
//! Every failure mode here degrades to "uncertain" (`None`); nothing in this module can end a run.

use std::{sync::LazyLock, time::Duration};

use color_eyre::{
	Result,
	eyre::{bail, eyre},
};
use regex::Regex;
use serde_json::{Value, json};
use v_utils::{elog, log};

use crate::{MAX_OPTIONS, config::LlmSettings};

const TEMPERATURE: f64 = 0.1;
const RATE_LIMITED: u16 = 429;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Provider {
	/// Google `generateContent`
	Gemini,
	/// OpenAI-compatible chat completions, vision capable
	OpenRouter,
}

impl Provider {
	pub fn parse(s: &str) -> Result<Self> {
		match s.trim().to_ascii_lowercase().as_str() {
			"gemini" => Ok(Provider::Gemini),
			"openrouter" | "openai" => Ok(Provider::OpenRouter),
			other => bail!("Unknown llm_provider '{other}' (expected gemini or openrouter)"),
		}
	}

	pub fn key_env(&self) -> &'static str {
		match self {
			Provider::Gemini => "GEMINI_API_KEY",
			Provider::OpenRouter => "OPENROUTER_API_KEY",
		}
	}

	pub fn default_model(&self) -> &'static str {
		match self {
			Provider::Gemini => "gemini-2.5-flash",
			Provider::OpenRouter => "meta-llama/llama-4-scout:free",
		}
	}

	pub fn default_base_url(&self) -> &'static str {
		match self {
			Provider::Gemini => "https://generativelanguage.googleapis.com/v1beta",
			Provider::OpenRouter => "https://openrouter.ai/api/v1",
		}
	}
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HttpReply {
	pub status: u16,
	pub body: String,
}

/// One JSON POST. Split out so the retry policy can be exercised without a network.
#[allow(async_fn_in_trait)]
pub trait Transport {
	async fn post_json(&self, url: &str, headers: &[(&str, String)], body: &Value) -> Result<HttpReply>;
}

pub struct HttpTransport {
	http: reqwest::Client,
}

impl HttpTransport {
	pub fn new() -> Result<Self> {
		let http = reqwest::Client::builder()
			.timeout(Duration::from_secs(60))
			.build()
			.map_err(|e| eyre!("Failed to build HTTP client: {e}"))?;
		Ok(Self { http })
	}
}

impl Transport for HttpTransport {
	async fn post_json(&self, url: &str, headers: &[(&str, String)], body: &Value) -> Result<HttpReply> {
		let mut request = self.http.post(url).json(body);
		for (name, value) in headers {
			request = request.header(*name, value);
		}
		let response = request.send().await.map_err(|e| eyre!("Request failed: {e}"))?;
		let status = response.status().as_u16();
		let body = response.text().await.map_err(|e| eyre!("Failed to read response: {e}"))?;
		Ok(HttpReply { status, body })
	}
}

/// A question as sent to the model
#[derive(Clone, Copy, Debug)]
pub struct Prompted<'a> {
	pub question: &'a str,
	pub options: &'a [String],
}

fn options_block(options: &[String]) -> String {
	options
		.iter()
		.take(MAX_OPTIONS)
		.enumerate()
		.filter(|(_, o)| !o.trim().is_empty())
		.map(|(i, o)| format!("{}. {}\n", i + 1, o))
		.collect()
}

pub fn single_prompt(q: Prompted<'_>, image_url: Option<&str>) -> String {
	let image = match image_url {
		Some(url) => format!("\nA supporting passage/image for this question is at: {url}\n"),
		None => String::new(),
	};
	format!(
		"You are an expert exam test-taker. Pick the ONE correct answer.\n{image}\nQuestion:\n{}\n\nOptions:\n{}\nAnswer with ONLY the number (1-5). No explanation.",
		q.question,
		options_block(q.options)
	)
}

pub fn batch_prompt(questions: &[Prompted<'_>]) -> String {
	let mut prompt = String::from(
		"You are an expert exam test-taker. I will give you multiple questions.\nFor each question, determine the correct answer (1-5).\nRespond with ONLY a JSON array of numbers, like: [3, 1, 4, 2, 5]\nUse 0 if uncertain. No explanations, just the JSON array.\n\n=== QUESTIONS ===\n",
	);
	for (i, q) in questions.iter().enumerate() {
		prompt.push_str(&format!("\nQUESTION {}:\n{}\nOptions:\n", i + 1, q.question));
		for line in options_block(q.options).lines() {
			prompt.push_str(&format!("  {line}\n"));
		}
	}
	prompt.push_str("\nRespond with ONLY the JSON array of answers: [answer1, answer2, ...]");
	prompt
}

fn strip_fences(reply: &str) -> &str {
	let s = reply.trim();
	let s = s.strip_prefix("```json").or_else(|| s.strip_prefix("```")).unwrap_or(s);
	s.strip_suffix("```").unwrap_or(s).trim()
}

/// Option number out of a free-form reply, `None` if the model was unsure or off-script
pub fn parse_single_answer(reply: &str) -> Option<u8> {
	let text = strip_fences(reply);
	if let Ok(n) = text.parse::<i64>() {
		return (1..=MAX_OPTIONS as i64).contains(&n).then_some(n as u8);
	}
	text.chars().find(|c| ('1'..='5').contains(c)).and_then(|c| c.to_digit(10)).map(|d| d as u8)
}

/// First bracketed list holding at least one number; empty brackets in surrounding prose are skipped
static DIGIT_ARRAY: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\[\s*\d[\d,\s]*\]").expect("static regex"));

/// Positional answers out of a batched reply. Missing, zero and out-of-range entries are `None`.
pub fn parse_batch_answers(reply: &str, expected: usize) -> Vec<Option<u8>> {
	let mut out = vec![None; expected];
	let Some(m) = DIGIT_ARRAY.find(strip_fences(reply)) else {
		elog!("No JSON array found in LLM reply");
		return out;
	};
	let parsed: Vec<i64> = match serde_json::from_str(m.as_str()) {
		Ok(v) => v,
		Err(e) => {
			elog!("Could not parse LLM answer array: {e}");
			return out;
		}
	};
	if parsed.len() != expected {
		tracing::warn!("LLM returned {} answers for {expected} questions", parsed.len());
	}
	for (slot, n) in out.iter_mut().zip(parsed) {
		if (1..=MAX_OPTIONS as i64).contains(&n) {
			*slot = Some(n as u8);
		}
	}
	out
}

pub struct AnswerClient<T: Transport> {
	transport: T,
	settings: LlmSettings,
}

impl AnswerClient<HttpTransport> {
	pub fn http(settings: LlmSettings) -> Result<Self> {
		Ok(Self::new(HttpTransport::new()?, settings))
	}
}

impl<T: Transport> AnswerClient<T> {
	pub fn new(transport: T, settings: LlmSettings) -> Self {
		Self { transport, settings }
	}

	fn request(&self, prompt: &str, image_url: Option<&str>, max_tokens: u32) -> (String, Vec<(&'static str, String)>, Value) {
		let s = &self.settings;
		let base = s.base_url.trim_end_matches('/');
		match s.provider {
			Provider::Gemini => (
				format!("{base}/models/{}:generateContent", s.model),
				vec![("x-goog-api-key", s.api_key.clone())],
				json!({
					"contents": [{ "parts": [{ "text": prompt }] }],
					"generationConfig": { "temperature": TEMPERATURE, "maxOutputTokens": max_tokens, "topP": 0.8, "topK": 10 }
				}),
			),
			Provider::OpenRouter => {
				let mut content = vec![json!({ "type": "text", "text": prompt })];
				if let Some(url) = image_url {
					content.push(json!({ "type": "image_url", "image_url": { "url": url } }));
				}
				(
					format!("{base}/chat/completions"),
					vec![("Authorization", format!("Bearer {}", s.api_key))],
					json!({
						"model": s.model,
						"messages": [{ "role": "user", "content": content }],
						"max_tokens": max_tokens,
						"temperature": TEMPERATURE
					}),
				)
			}
		}
	}

	fn reply_text(&self, body: &str) -> Result<String> {
		let v: Value = serde_json::from_str(body).map_err(|e| eyre!("Failed to parse LLM response: {e}"))?;
		let text = match self.settings.provider {
			Provider::Gemini => v["candidates"][0]["content"]["parts"][0]["text"].as_str(),
			Provider::OpenRouter => v["choices"][0]["message"]["content"].as_str(),
		};
		text.map(|t| t.trim().to_string()).ok_or_else(|| eyre!("LLM response has no text: {body}"))
	}

	/// Send with bounded retries on rate limiting. `None` for anything but a readable 2xx reply.
	async fn complete(&self, prompt: &str, image_url: Option<&str>, max_tokens: u32) -> Option<String> {
		let (url, headers, body) = self.request(prompt, image_url, max_tokens);
		let max_attempts = self.settings.max_attempts;

		for attempt in 1..=max_attempts {
			let reply = match self.transport.post_json(&url, &headers, &body).await {
				Ok(r) => r,
				Err(e) => {
					elog!("LLM request failed: {e}");
					return None;
				}
			};
			tracing::debug!("LLM status {}", reply.status);

			match reply.status {
				RATE_LIMITED => {
					if attempt == max_attempts {
						break;
					}
					let wait = self.settings.backoff.delay(attempt);
					log!("Rate limited, waiting {}s (attempt {attempt}/{max_attempts})...", wait.as_secs());
					tokio::time::sleep(wait).await;
				}
				200..=299 => {
					return match self.reply_text(&reply.body) {
						Ok(text) => {
							tracing::debug!("LLM raw reply: {text}");
							Some(text)
						}
						Err(e) => {
							elog!("{e}");
							None
						}
					};
				}
				status => {
					let message = serde_json::from_str::<Value>(&reply.body)
						.ok()
						.and_then(|v| v["error"]["message"].as_str().map(str::to_string))
						.unwrap_or_else(|| "Unknown".to_string());
					elog!("LLM API error {status}: {message}");
					return None;
				}
			}
		}

		elog!("Still rate limited after {max_attempts} attempts, skipping");
		None
	}

	/// One request per question; the image link, if any, goes along
	pub async fn answer_one(&self, q: Prompted<'_>, image_url: Option<&str>) -> Option<u8> {
		let reply = self.complete(&single_prompt(q, image_url), image_url, 10).await?;
		parse_single_answer(&reply)
	}

	/// All questions in one request, answers matched back by position
	pub async fn answer_batch(&self, questions: &[Prompted<'_>]) -> Vec<Option<u8>> {
		if questions.is_empty() {
			return Vec::new();
		}
		log!("Sending {} questions in one request...", questions.len());
		let max_tokens = 32 + 8 * questions.len() as u32;
		match self.complete(&batch_prompt(questions), None, max_tokens).await {
			Some(reply) => parse_batch_answers(&reply, questions.len()),
			None => vec![None; questions.len()],
		}
	}
}

#[cfg(test)]
mod tests {
	use std::{collections::VecDeque, sync::Mutex};

	use super::*;
	use crate::config::Backoff;

	struct ScriptedTransport {
		replies: Mutex<VecDeque<Result<HttpReply>>>,
		requests: Mutex<Vec<(String, Value)>>,
	}

	impl ScriptedTransport {
		fn new(replies: Vec<Result<HttpReply>>) -> Self {
			Self {
				replies: Mutex::new(replies.into()),
				requests: Mutex::new(Vec::new()),
			}
		}

		fn count(&self) -> usize {
			self.requests.lock().unwrap().len()
		}
	}

	impl Transport for ScriptedTransport {
		async fn post_json(&self, url: &str, _headers: &[(&str, String)], body: &Value) -> Result<HttpReply> {
			self.requests.lock().unwrap().push((url.to_string(), body.clone()));
			self.replies.lock().unwrap().pop_front().unwrap_or_else(|| Err(eyre!("no scripted reply")))
		}
	}

	fn settings(provider: Provider) -> LlmSettings {
		LlmSettings {
			provider,
			api_key: "test-key".into(),
			model: provider.default_model().into(),
			base_url: provider.default_base_url().into(),
			max_attempts: 3,
			backoff: Backoff::Linear(Duration::from_secs(15)),
		}
	}

	fn reply(status: u16, body: &str) -> Result<HttpReply> {
		Ok(HttpReply { status, body: body.into() })
	}

	fn gemini_text(text: &str) -> String {
		json!({ "candidates": [{ "content": { "parts": [{ "text": text }] } }] }).to_string()
	}

	fn options() -> Vec<String> {
		["London", "Paris", "Berlin", "Madrid", "Rome"].iter().map(|s| s.to_string()).collect()
	}

	fn question(options: &[String]) -> Prompted<'_> {
		Prompted {
			question: "What is the capital of France?",
			options,
		}
	}

	#[test]
	fn single_answer_parsing() {
		assert_eq!(parse_single_answer("2"), Some(2));
		assert_eq!(parse_single_answer("```\n4\n```"), Some(4));
		assert_eq!(parse_single_answer("The answer is 3."), Some(3));
		assert_eq!(parse_single_answer("7"), None);
		assert_eq!(parse_single_answer("0"), None);
		assert_eq!(parse_single_answer("not sure"), None);
	}

	#[test]
	fn batch_answer_parsing() {
		assert_eq!(parse_batch_answers("```json\n[3, 0, 5]\n```", 3), vec![Some(3), None, Some(5)]);
		assert_eq!(parse_batch_answers("Answers: [1,9]", 3), vec![Some(1), None, None]);
		assert_eq!(parse_batch_answers("no idea", 2), vec![None, None]);
	}

	#[test]
	fn empty_brackets_before_the_answers_are_skipped() {
		assert_eq!(parse_batch_answers("Unanswered: [] so here you go: [2, 3]", 2), vec![Some(2), Some(3)]);
		assert_eq!(parse_batch_answers("[ ]\n[4]", 1), vec![Some(4)]);
	}

	#[test]
	fn batch_prompt_numbers_questions_and_skips_blank_options() {
		let opts = vec!["Yes".to_string(), "No".to_string(), String::new()];
		let prompt = batch_prompt(&[Prompted { question: "Q one?", options: &opts }, Prompted { question: "Q two?", options: &opts }]);
		assert!(prompt.contains("QUESTION 2:\nQ two?"));
		assert!(prompt.contains("  2. No\n"));
		assert!(!prompt.contains("  3. "));
	}

	#[tokio::test(start_paused = true)]
	async fn three_rate_limits_give_up_without_fourth_request() {
		let transport = ScriptedTransport::new(vec![reply(429, "{}"), reply(429, "{}"), reply(429, "{}"), reply(200, &gemini_text("2"))]);
		let client = AnswerClient::new(transport, settings(Provider::Gemini));
		let opts = options();

		assert_eq!(client.answer_one(question(&opts), None).await, None);
		assert_eq!(client.transport.count(), 3);
	}

	#[tokio::test(start_paused = true)]
	async fn recovers_after_rate_limit() {
		let transport = ScriptedTransport::new(vec![reply(429, "{}"), reply(200, &gemini_text("```2```"))]);
		let client = AnswerClient::new(transport, settings(Provider::Gemini));
		let opts = options();

		let started = tokio::time::Instant::now();
		assert_eq!(client.answer_one(question(&opts), None).await, Some(2));
		assert_eq!(started.elapsed(), Duration::from_secs(15));
	}

	#[tokio::test]
	async fn server_error_is_uncertain() {
		let transport = ScriptedTransport::new(vec![reply(500, r#"{"error":{"message":"boom"}}"#)]);
		let client = AnswerClient::new(transport, settings(Provider::Gemini));
		let opts = options();
		assert_eq!(client.answer_one(question(&opts), None).await, None);
		assert_eq!(client.transport.count(), 1);
	}

	#[tokio::test]
	async fn transport_error_is_uncertain() {
		let transport = ScriptedTransport::new(vec![Err(eyre!("connection reset"))]);
		let client = AnswerClient::new(transport, settings(Provider::Gemini));
		let opts = options();
		assert_eq!(client.answer_one(question(&opts), None).await, None);
	}

	#[tokio::test]
	async fn openrouter_sends_image_part() {
		let body = json!({ "choices": [{ "message": { "content": "1" } }] }).to_string();
		let transport = ScriptedTransport::new(vec![reply(200, &body)]);
		let client = AnswerClient::new(transport, settings(Provider::OpenRouter));
		let opts = options();

		assert_eq!(client.answer_one(question(&opts), Some("https://i.ibb.co/x.png")).await, Some(1));

		let requests = client.transport.requests.lock().unwrap();
		let (url, sent) = &requests[0];
		assert_eq!(url, "https://openrouter.ai/api/v1/chat/completions");
		assert_eq!(sent["messages"][0]["content"][1]["image_url"]["url"], "https://i.ibb.co/x.png");
		assert_eq!(sent["temperature"], 0.1);
	}

	#[tokio::test]
	async fn batch_matches_positions() {
		let transport = ScriptedTransport::new(vec![reply(200, &gemini_text("[2, 0]"))]);
		let client = AnswerClient::new(transport, settings(Provider::Gemini));
		let opts = options();

		let answers = client.answer_batch(&[question(&opts), question(&opts)]).await;

		assert_eq!(answers, vec![Some(2), None]);
		let requests = client.transport.requests.lock().unwrap();
		assert!(requests[0].0.ends_with("/models/gemini-2.5-flash:generateContent"));
	}

	#[tokio::test]
	async fn batch_failure_keeps_length() {
		let transport = ScriptedTransport::new(vec![reply(403, "{}")]);
		let client = AnswerClient::new(transport, settings(Provider::Gemini));
		let opts = options();
		assert_eq!(client.answer_batch(&[question(&opts); 3]).await, vec![None; 3]);
	}
}
