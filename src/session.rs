//! The controlled browser, and the quiz page it shows

#[cfg(feature = "xdg")]
use std::path::PathBuf;
use std::{future::Future, time::Duration};

use chromiumoxide::{
	Page,
	browser::{Browser, BrowserConfig},
	cdp::browser_protocol::page::CaptureScreenshotFormat,
};
use color_eyre::{
	Result,
	eyre::{bail, eyre},
};
use futures::StreamExt;
use serde::de::DeserializeOwned;
use tokio::{task::JoinHandle, time::Instant};
use v_utils::{elog, log};
#[cfg(feature = "xdg")]
use v_utils::xdg_state_dir;

use crate::{
	ScreenshotRecord,
	config::{NextControl, RunSettings},
	extract::{EXTRACT_SCRIPT, Extracted, RawQuestion},
	locator::{self, Candidate, Locator, PageSurface, Probe, Viewport},
	runner::QuizDriver,
};

const WINDOW: (u32, u32) = (1920, 1080);
const POLL: Duration = Duration::from_millis(250);
const READY_TIMEOUT: Duration = Duration::from_secs(10);
/// Pause after a successful click on the next control
const AFTER_NEXT: Duration = Duration::from_secs(2);
/// Marks elements measured by the last probe, so follow-up calls can find them again
const CANDIDATE_ATTR: &str = "data-quizshot-candidate";

/// Outcome of one try at the next control
enum ClickAttempt {
	Clicked,
	Missing,
	/// Found, but the click itself was rejected (covered, detached mid-render, ...)
	Failed(color_eyre::Report),
}

/// Repeat `attempt` every [`POLL`] until it clicks or `timeout` passes.
/// Failed clicks are retried like missing controls; if the last try before the deadline failed, its error is returned.
async fn retry_click<F, Fut>(timeout: Duration, mut attempt: F) -> Result<bool>
where
	F: FnMut() -> Fut,
	Fut: Future<Output = ClickAttempt>,
{
	let started = Instant::now();
	let mut last_error = None;
	loop {
		match attempt().await {
			ClickAttempt::Clicked => return Ok(true),
			ClickAttempt::Missing => last_error = None,
			ClickAttempt::Failed(e) => {
				tracing::debug!("Click on next control failed, retrying: {e}");
				last_error = Some(e);
			}
		}
		if started.elapsed() > timeout {
			return match last_error {
				Some(e) => Err(e),
				None => Ok(false),
			};
		}
		tokio::time::sleep(POLL).await;
	}
}

pub struct Session {
	browser: Browser,
	handler: JoinHandle<()>,
	page: Page,
	/// Groups debug dumps of one run
	pub session_id: String,
}

impl Session {
	pub async fn launch(visible: bool) -> Result<Self> {
		let builder = BrowserConfig::builder().window_size(WINDOW.0, WINDOW.1).viewport(None);
		let config = if visible { builder.with_head() } else { builder };
		let config = config.build().map_err(|e| eyre!("Failed to build browser config: {e}"))?;

		let (browser, mut handler) = Browser::launch(config).await.map_err(|e| eyre!("Failed to launch browser: {e}"))?;
		// events have to be drained or the browser hangs; individual errors are noise
		let handler = tokio::spawn(async move { while let Some(_event) = handler.next().await {} });

		let page = browser.new_page("about:blank").await.map_err(|e| eyre!("Failed to create new page: {e}"))?;
		Ok(Self {
			browser,
			handler,
			page,
			session_id: chrono::Local::now().format("%Y%m%d_%H%M%S").to_string(),
		})
	}

	pub fn page(&self) -> &Page {
		&self.page
	}

	pub async fn open(&self, url: &str) -> Result<()> {
		log!("Navigating to {url}");
		self.page.goto(url).await.map_err(|e| eyre!("Failed to navigate to {url}: {e}"))?;
		Ok(())
	}

	async fn eval_json<T: DeserializeOwned>(&self, script: &str) -> Result<T> {
		let result = self.page.evaluate(script).await.map_err(|e| eyre!("Script failed: {e}"))?;
		let json = result.value().and_then(|v| v.as_str()).ok_or_else(|| eyre!("Script returned no JSON string"))?;
		serde_json::from_str(json).map_err(|e| eyre!("Failed to parse script result: {e}"))
	}

	/// Poll `document.readyState` until complete, then give widgets `settle` to render
	pub async fn wait_until_ready(&self, settle: Duration) -> Result<()> {
		let started = Instant::now();
		loop {
			let state = self.page.evaluate("document.readyState").await.map_err(|e| eyre!("Failed to read readyState: {e}"))?;
			if state.value().and_then(|v| v.as_str()) == Some("complete") {
				break;
			}
			if started.elapsed() > READY_TIMEOUT {
				bail!("Page not ready after {}s", READY_TIMEOUT.as_secs());
			}
			tokio::time::sleep(POLL).await;
		}
		tokio::time::sleep(settle).await;
		Ok(())
	}

	/// Body zoom in percent; 0 and 100 leave the page alone
	pub async fn set_page_zoom(&self, percent: u32) -> Result<()> {
		if percent == 0 || percent == 100 {
			return Ok(());
		}
		self.page
			.evaluate(format!("document.body.style.zoom = '{percent}%'"))
			.await
			.map_err(|e| eyre!("Failed to set page zoom: {e}"))?;
		tracing::debug!("Page zoom set to {percent}%");
		Ok(())
	}

	/// Find and click the next control, polling until `timeout`. `Ok(false)` if it never showed up.
	pub async fn click_next(&self, control: &NextControl, timeout: Duration) -> Result<bool> {
		let page = &self.page;
		let clicked = retry_click(timeout, move || async move {
			let found = match control {
				NextControl::Css(selector) => page.find_element(selector.as_str()).await,
				NextControl::XPath(xpath) => page.find_xpath(xpath.as_str()).await,
			};
			match found {
				Ok(element) => match element.click().await {
					Ok(_) => ClickAttempt::Clicked,
					Err(e) => ClickAttempt::Failed(eyre!("Failed to click next control: {e}")),
				},
				Err(_) => ClickAttempt::Missing,
			}
		})
		.await?;
		if clicked {
			tokio::time::sleep(AFTER_NEXT).await;
		}
		Ok(clicked)
	}

	/// Save the current page's HTML to disk for debugging
	#[cfg(feature = "xdg")]
	pub async fn save_page_html(&self, label: &str) -> Result<PathBuf> {
		let html_dir = xdg_state_dir!("persist_htmls").join(&self.session_id);
		std::fs::create_dir_all(&html_dir).map_err(|e| eyre!("Failed to create HTML dir: {e}"))?;

		let html = self.page.evaluate("document.documentElement.outerHTML").await.map_err(|e| eyre!("Failed to get page HTML: {e}"))?;
		let html_str = html.value().and_then(|v| v.as_str()).unwrap_or("<html></html>");

		let safe_label: String = label.chars().map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' }).collect();
		let filepath = html_dir.join(format!("{}_{safe_label}.html", chrono::Local::now().format("%H%M%S")));

		std::fs::write(&filepath, html_str).map_err(|e| eyre!("Failed to write HTML file: {e}"))?;
		log!("Saved page HTML to: {}", filepath.display());
		Ok(filepath)
	}

	pub async fn close(self) -> Result<()> {
		let Self { mut browser, handler, page, .. } = self;
		drop(page);
		let closed = browser.close().await.map(|_| ()).map_err(|e| eyre!("Failed to close browser: {e}"));
		if let Err(e) = browser.wait().await {
			tracing::debug!("Browser process wait failed: {e}");
		}
		handler.abort();
		closed
	}
}

fn probe_script(probe: &Probe) -> Result<String> {
	let selector = serde_json::to_string(&probe.selector).map_err(|e| eyre!("Failed to quote selector: {e}"))?;
	Ok(format!(
		r#"
		(function() {{
			for (const el of document.querySelectorAll('[{CANDIDATE_ATTR}]')) el.removeAttribute('{CANDIDATE_ATTR}');
			const seen = new Set();
			const out = [];
			for (let el of document.querySelectorAll({selector})) {{
				for (let i = 0; i < {levels} && el.parentElement; i++) el = el.parentElement;
				if (seen.has(el)) continue;
				seen.add(el);
				const id = out.length;
				el.setAttribute('{CANDIDATE_ATTR}', String(id));
				const style = window.getComputedStyle(el);
				const r = el.getBoundingClientRect();
				out.push({{
					id: id,
					displayed: style.display !== 'none' && style.visibility !== 'hidden' && r.width > 0 && r.height > 0,
					rect: {{ x: r.left, y: r.top, width: r.width, height: r.height }},
					scroll_height: el.scrollHeight,
					client_height: el.clientHeight || r.height
				}});
			}}
			return JSON.stringify(out);
		}})()
		"#,
		levels = probe.ancestor_levels,
	))
}

fn candidate_selector(id: u32) -> String {
	format!(r#"[{CANDIDATE_ATTR}="{id}"]"#)
}

impl PageSurface for Session {
	async fn viewport(&self) -> Result<Viewport> {
		self.eval_json("JSON.stringify({ width: window.innerWidth, height: window.innerHeight })").await
	}

	async fn probe(&self, probe: &Probe) -> Result<Vec<Candidate>> {
		self.eval_json(&probe_script(probe)?).await
	}

	async fn scroll_to(&self, id: u32, top: f64) -> Result<f64> {
		let script = format!(
			r#"(function() {{
				const el = document.querySelector('{}');
				if (!el) return JSON.stringify(null);
				el.scrollTop = {top};
				return JSON.stringify(el.scrollTop);
			}})()"#,
			candidate_selector(id)
		);
		let applied: Option<f64> = self.eval_json(&script).await?;
		applied.ok_or_else(|| eyre!("Candidate {id} is gone"))
	}

	async fn set_zoom(&self, id: u32, factor: f64) -> Result<()> {
		let zoom = if factor == 1.0 { String::new() } else { factor.to_string() };
		let script = format!(
			r#"(function() {{
				const el = document.querySelector('{}');
				if (!el) return JSON.stringify(false);
				for (const child of el.children) child.style.zoom = '{zoom}';
				return JSON.stringify(true);
			}})()"#,
			candidate_selector(id)
		);
		match self.eval_json::<bool>(&script).await? {
			true => Ok(()),
			false => Err(eyre!("Candidate {id} is gone")),
		}
	}

	async fn capture(&self, id: u32) -> Result<Vec<u8>> {
		let element = self.page.find_element(candidate_selector(id)).await.map_err(|e| eyre!("Candidate {id} not found: {e}"))?;
		element.screenshot(CaptureScreenshotFormat::Png).await.map_err(|e| eyre!("Failed to screenshot candidate {id}: {e}"))
	}
}

/// A [`Session`] showing the quiz, with the settings that drive it
pub struct QuizPage<'a> {
	pub session: &'a Session,
	pub settings: &'a RunSettings,
	pub locator: Locator,
}

impl<'a> QuizPage<'a> {
	pub fn new(session: &'a Session, settings: &'a RunSettings) -> Self {
		Self {
			session,
			settings,
			locator: Locator::default(),
		}
	}
}

impl QuizDriver for QuizPage<'_> {
	async fn wait_until_ready(&self) -> Result<()> {
		self.session.wait_until_ready(self.settings.settle).await
	}

	async fn extract(&self) -> Result<Option<Extracted>> {
		let raw: RawQuestion = self.session.eval_json(EXTRACT_SCRIPT).await?;
		Ok(raw.validate())
	}

	async fn capture_passage(&self, number: u32) -> Vec<ScreenshotRecord> {
		let s = self.settings;
		locator::capture_passage(self.session, &self.locator, number, &s.images_dir, s.overflow, s.stitch_overlap).await
	}

	async fn advance(&self) -> Result<bool> {
		self.session.click_next(&self.settings.next_control, self.settings.next_timeout).await
	}

	async fn dump_page(&self, number: u32) {
		#[cfg(feature = "xdg")]
		if let Err(e) = self.session.save_page_html(&format!("q{number}")).await {
			elog!("Failed to save page HTML: {e}");
		}
		#[cfg(not(feature = "xdg"))]
		let _ = number;
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn probe_script_quotes_selector() {
		let script = probe_script(&Probe::css(r#"[data-lrn-widget-type="feature"]"#)).unwrap();
		assert!(script.contains(r#"querySelectorAll("[data-lrn-widget-type=\"feature\"]")"#));
		assert!(script.contains("i < 0 &&"));
	}

	#[test]
	fn probe_script_walks_ancestors() {
		let script = probe_script(&Probe {
			selector: ".lrn_sharedpassage".into(),
			ancestor_levels: 2,
		})
		.unwrap();
		assert!(script.contains("i < 2 &&"));
	}

	#[test]
	fn candidates_are_addressed_by_marker() {
		assert_eq!(candidate_selector(3), r#"[data-quizshot-candidate="3"]"#);
	}

	#[tokio::test(start_paused = true)]
	async fn rejected_click_is_retried_until_it_lands() {
		let tries = std::cell::Cell::new(0);
		let clicked = retry_click(Duration::from_secs(5), || {
			tries.set(tries.get() + 1);
			let n = tries.get();
			async move { if n < 3 { ClickAttempt::Failed(eyre!("element is covered")) } else { ClickAttempt::Clicked } }
		})
		.await
		.unwrap();
		assert!(clicked);
		assert_eq!(tries.get(), 3);
	}

	#[tokio::test(start_paused = true)]
	async fn click_failing_until_timeout_is_an_error() {
		let started = Instant::now();
		let err = retry_click(Duration::from_secs(2), || async { ClickAttempt::Failed(eyre!("element is covered")) }).await.unwrap_err();
		assert!(err.to_string().contains("covered"));
		assert!(started.elapsed() >= Duration::from_secs(2));
	}

	#[tokio::test(start_paused = true)]
	async fn missing_control_gives_up_quietly() {
		let tries = std::cell::Cell::new(0);
		let clicked = retry_click(Duration::from_secs(1), || {
			tries.set(tries.get() + 1);
			async { ClickAttempt::Missing }
		})
		.await
		.unwrap();
		assert!(!clicked);
		assert!(tries.get() > 1);
	}
}
