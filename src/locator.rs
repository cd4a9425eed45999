//! Finds the on-screen region holding a question's supporting passage or source image.
//!
//! Page layouts on the target site are inconsistent, so the lookup is an ordered chain of
//! [`LocateStrategy`]s. The first strategy that yields a qualifying element, and whose element
//! can actually be captured, wins; the rest are never queried.

use std::path::Path;

use color_eyre::{Result, eyre::eyre};
use derive_new::new;
use serde::Deserialize;
use v_utils::{elog, log};

use crate::{
	ScreenshotRecord,
	capture::{OverflowCapture, capture_element},
};

/// Both sides must exceed this for a panel to count as passage content
pub const MIN_PANEL_PX: f64 = 200.0;
/// Panels found by loose class match must start left of this fraction of the viewport width
pub const LEFT_PORTION: f64 = 0.5;
/// Images below this fraction of the viewport height are treated as page chrome
pub const CONTENT_BAND: f64 = 2.0 / 3.0;

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq)]
pub struct Rect {
	pub x: f64,
	pub y: f64,
	pub width: f64,
	pub height: f64,
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, new)]
pub struct Viewport {
	pub width: f64,
	pub height: f64,
}

/// An element matched by a [`Probe`], as measured in the live page
#[derive(Clone, Debug, Deserialize, PartialEq, new)]
pub struct Candidate {
	/// Handle for follow-up calls on the same [`PageSurface`], valid until the next probe
	pub id: u32,
	pub displayed: bool,
	pub rect: Rect,
	/// Full content height, including what is scrolled out of view
	pub scroll_height: f64,
	/// Height of the visible box
	pub client_height: f64,
}

impl Candidate {
	pub fn exceeds(&self, min_width: f64, min_height: f64) -> bool {
		self.rect.width > min_width && self.rect.height > min_height
	}
}

/// DOM query a strategy wants answered
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Probe {
	pub selector: String,
	/// Walk this many parents up from every match before measuring
	pub ancestor_levels: u8,
}

impl Probe {
	pub fn css(selector: &str) -> Self {
		Self {
			selector: selector.to_string(),
			ancestor_levels: 0,
		}
	}
}

/// What the locator and capture code need from a rendered page
#[allow(async_fn_in_trait)]
pub trait PageSurface {
	async fn viewport(&self) -> Result<Viewport>;
	/// Measure every element matching `probe`, in document order
	async fn probe(&self, probe: &Probe) -> Result<Vec<Candidate>>;
	/// Set the element's scrollTop, returns the value the browser actually applied
	async fn scroll_to(&self, id: u32, top: f64) -> Result<f64>;
	/// Scale the element's content; 1.0 restores it
	async fn set_zoom(&self, id: u32, factor: f64) -> Result<()>;
	/// PNG of the element's visible box
	async fn capture(&self, id: u32) -> Result<Vec<u8>>;
}

pub trait LocateStrategy: Send + Sync {
	/// Goes into the output filename
	fn tag(&self) -> &'static str;
	/// Human readable, goes into the record description
	fn label(&self) -> &'static str;
	fn probe(&self) -> Probe;
	fn accepts(&self, candidate: &Candidate, viewport: &Viewport) -> bool;
}

/// Panel identified by a selector alone, qualified by size
pub struct PanelSelector {
	tag: &'static str,
	label: &'static str,
	selector: &'static str,
}

impl LocateStrategy for PanelSelector {
	fn tag(&self) -> &'static str {
		self.tag
	}

	fn label(&self) -> &'static str {
		self.label
	}

	fn probe(&self) -> Probe {
		Probe::css(self.selector)
	}

	fn accepts(&self, candidate: &Candidate, _viewport: &Viewport) -> bool {
		candidate.displayed && candidate.exceeds(MIN_PANEL_PX, MIN_PANEL_PX)
	}
}

/// Any element whose class mentions the left column, as long as it really sits on the left
pub struct LeftColumn;

impl LocateStrategy for LeftColumn {
	fn tag(&self) -> &'static str {
		"left_column"
	}

	fn label(&self) -> &'static str {
		"Left column class"
	}

	fn probe(&self) -> Probe {
		Probe::css(r#"[class*="left-column"]"#)
	}

	fn accepts(&self, candidate: &Candidate, viewport: &Viewport) -> bool {
		candidate.displayed && candidate.rect.x < viewport.width * LEFT_PORTION && candidate.exceeds(MIN_PANEL_PX, MIN_PANEL_PX)
	}
}

/// Layout wrapper two levels above the shared-passage marker
pub struct SharedPassage;

impl LocateStrategy for SharedPassage {
	fn tag(&self) -> &'static str {
		"shared_passage"
	}

	fn label(&self) -> &'static str {
		"Shared passage"
	}

	fn probe(&self) -> Probe {
		Probe {
			selector: ".lrn_sharedpassage".to_string(),
			ancestor_levels: 2,
		}
	}

	fn accepts(&self, candidate: &Candidate, _viewport: &Viewport) -> bool {
		candidate.displayed && candidate.exceeds(MIN_PANEL_PX, MIN_PANEL_PX)
	}
}

/// Last resort: a large visible image inside the main content band
pub struct ContentImage {
	pub min_px: f64,
}

impl LocateStrategy for ContentImage {
	fn tag(&self) -> &'static str {
		"image_only"
	}

	fn label(&self) -> &'static str {
		"Content image"
	}

	fn probe(&self) -> Probe {
		Probe::css("img")
	}

	fn accepts(&self, candidate: &Candidate, viewport: &Viewport) -> bool {
		let top = candidate.rect.y;
		candidate.displayed && candidate.exceeds(self.min_px, self.min_px) && top >= 0.0 && top < viewport.height * CONTENT_BAND
	}
}

/// The passage chain, most specific first
pub fn default_chain() -> Vec<Box<dyn LocateStrategy>> {
	vec![
		Box::new(PanelSelector {
			tag: "passage_panel",
			label: "Class combo",
			selector: ".two-columns.left-column.question-content",
		}),
		Box::new(PanelSelector {
			tag: "feature_panel",
			label: "Data attribute",
			selector: r#"[data-lrn-widget-type="feature"][class*="column"]"#,
		}),
		Box::new(LeftColumn),
		Box::new(PanelSelector {
			tag: "stimulus",
			label: "Stimulus id",
			selector: r#"[id$="_stimulus"][data-lrn-widget-type="feature"]"#,
		}),
		Box::new(SharedPassage),
		Box::new(ContentImage { min_px: 150.0 }),
	]
}

/// Element chosen by one strategy of the chain
#[derive(Clone, Debug, PartialEq)]
pub struct Located {
	/// Position of the winning strategy in the chain
	pub index: usize,
	pub tag: &'static str,
	pub label: &'static str,
	pub candidate: Candidate,
}

pub struct Locator {
	strategies: Vec<Box<dyn LocateStrategy>>,
}

impl Default for Locator {
	fn default() -> Self {
		Self::new(default_chain())
	}
}

impl Locator {
	pub fn new(strategies: Vec<Box<dyn LocateStrategy>>) -> Self {
		Self { strategies }
	}

	/// Run the chain starting at strategy `from`. A strategy whose probe errors counts as not matching.
	pub async fn locate_from<S: PageSurface>(&self, surface: &S, viewport: &Viewport, from: usize) -> Option<Located> {
		for (index, strategy) in self.strategies.iter().enumerate().skip(from) {
			tracing::debug!("Trying strategy {}: {}", index + 1, strategy.label());
			let candidates = match surface.probe(&strategy.probe()).await {
				Ok(c) => c,
				Err(e) => {
					tracing::warn!("{} failed: {e}", strategy.label());
					continue;
				}
			};
			tracing::debug!("  {} candidate(s)", candidates.len());

			if let Some(candidate) = candidates.into_iter().find(|c| strategy.accepts(c, viewport)) {
				return Some(Located {
					index,
					tag: strategy.tag(),
					label: strategy.label(),
					candidate,
				});
			}
		}
		None
	}

	pub async fn locate<S: PageSurface>(&self, surface: &S) -> Option<Located> {
		let viewport = surface.viewport().await.ok()?;
		self.locate_from(surface, &viewport, 0).await
	}
}

/// Filename for a capture of question `number` made by the strategy tagged `tag`
pub fn screenshot_filename(number: u32, tag: &str) -> String {
	format!("Q{number}_{tag}.png")
}

/// Locate and capture the passage for question `number` into `images_dir`.
///
/// Returns at most one record. Nothing found is a normal outcome and yields an empty list.
pub async fn capture_passage<S: PageSurface>(surface: &S, locator: &Locator, number: u32, images_dir: &Path, overflow: OverflowCapture, overlap: u32) -> Vec<ScreenshotRecord> {
	let viewport = match surface.viewport().await {
		Ok(v) => v,
		Err(e) => {
			elog!("Could not measure viewport: {e}");
			return Vec::new();
		}
	};

	let mut from = 0;
	while let Some(found) = locator.locate_from(surface, &viewport, from).await {
		let c = &found.candidate;
		tracing::debug!(
			"{} matched {:.0}x{:.0} at ({:.0}, {:.0}), content {:.0}/{:.0}",
			found.label,
			c.rect.width,
			c.rect.height,
			c.rect.x,
			c.rect.y,
			c.client_height,
			c.scroll_height
		);

		match capture_element(surface, c, overflow, overlap).await {
			Ok(png) => {
				let filename = screenshot_filename(number, found.tag);
				let path = images_dir.join(&filename);
				if let Err(e) = write_png(&path, &png).await {
					elog!("Failed to write {}: {e}", path.display());
					return Vec::new();
				}
				log!("Saved {filename} ({})", found.label);
				return vec![ScreenshotRecord::new(filename, format!("{} panel", found.label))];
			}
			Err(e) => {
				tracing::warn!("{} matched but capture failed: {e}", found.label);
				from = found.index + 1;
			}
		}
	}

	log!("No passage content found for question {number}");
	Vec::new()
}

async fn write_png(path: &Path, png: &[u8]) -> Result<()> {
	if let Some(dir) = path.parent() {
		tokio::fs::create_dir_all(dir).await.map_err(|e| eyre!("Failed to create {}: {e}", dir.display()))?;
	}
	tokio::fs::write(path, png).await.map_err(|e| eyre!("{e}"))
}

#[cfg(test)]
pub(crate) mod tests {
	use std::{collections::HashMap, io::Cursor, sync::Mutex};

	use image::{ImageFormat, Rgba, RgbaImage};

	use super::*;

	pub(crate) fn png(width: u32, height: u32) -> Vec<u8> {
		let img = RgbaImage::from_pixel(width, height, Rgba([10, 20, 30, 255]));
		let mut buf = Cursor::new(Vec::new());
		image::DynamicImage::ImageRgba8(img).write_to(&mut buf, ImageFormat::Png).unwrap();
		buf.into_inner()
	}

	/// In-memory page: canned probe answers and a log of every call
	#[derive(Default)]
	pub(crate) struct FakeSurface {
		pub matches: HashMap<String, Vec<Candidate>>,
		pub failing_captures: Vec<u32>,
		pub fail_zoom: bool,
		pub probes: Mutex<Vec<String>>,
		pub calls: Mutex<Vec<String>>,
	}

	impl FakeSurface {
		pub fn with(mut self, selector: &str, candidates: Vec<Candidate>) -> Self {
			self.matches.insert(selector.to_string(), candidates);
			self
		}

		pub fn probed(&self) -> Vec<String> {
			self.probes.lock().unwrap().clone()
		}

		pub fn calls(&self) -> Vec<String> {
			self.calls.lock().unwrap().clone()
		}

		fn candidate(&self, id: u32) -> Option<Candidate> {
			self.matches.values().flatten().find(|c| c.id == id).cloned()
		}
	}

	impl PageSurface for FakeSurface {
		async fn viewport(&self) -> Result<Viewport> {
			Ok(Viewport::new(1920.0, 1080.0))
		}

		async fn probe(&self, probe: &Probe) -> Result<Vec<Candidate>> {
			self.probes.lock().unwrap().push(probe.selector.clone());
			Ok(self.matches.get(&probe.selector).cloned().unwrap_or_default())
		}

		async fn scroll_to(&self, id: u32, top: f64) -> Result<f64> {
			self.calls.lock().unwrap().push(format!("scroll {id} {top}"));
			let c = self.candidate(id).ok_or_else(|| eyre!("no element {id}"))?;
			Ok(top.min((c.scroll_height - c.client_height).max(0.0)))
		}

		async fn set_zoom(&self, id: u32, factor: f64) -> Result<()> {
			self.calls.lock().unwrap().push(format!("zoom {id} {factor}"));
			if self.fail_zoom && factor != 1.0 {
				return Err(eyre!("zoom unsupported"));
			}
			Ok(())
		}

		async fn capture(&self, id: u32) -> Result<Vec<u8>> {
			self.calls.lock().unwrap().push(format!("capture {id}"));
			if self.failing_captures.contains(&id) {
				return Err(eyre!("element detached"));
			}
			let c = self.candidate(id).ok_or_else(|| eyre!("no element {id}"))?;
			Ok(png(c.rect.width as u32, c.client_height as u32))
		}
	}

	pub(crate) fn panel(id: u32, x: f64, y: f64, w: f64, h: f64) -> Candidate {
		Candidate::new(id, true, Rect { x, y, width: w, height: h }, h, h)
	}

	const CLASS_COMBO: &str = ".two-columns.left-column.question-content";

	#[tokio::test]
	async fn first_strategy_short_circuits_the_chain() {
		let surface = FakeSurface::default().with(CLASS_COMBO, vec![panel(1, 0.0, 100.0, 800.0, 600.0)]).with("img", vec![panel(2, 0.0, 100.0, 400.0, 400.0)]);

		let found = Locator::default().locate(&surface).await.unwrap();

		assert_eq!(found.index, 0);
		assert_eq!(found.tag, "passage_panel");
		assert_eq!(surface.probed(), vec![CLASS_COMBO.to_string()]);
	}

	#[tokio::test]
	async fn small_or_hidden_panels_fall_through() {
		let mut hidden = panel(1, 0.0, 0.0, 900.0, 900.0);
		hidden.displayed = false;
		let surface = FakeSurface::default().with(CLASS_COMBO, vec![hidden, panel(2, 0.0, 0.0, 150.0, 900.0)]).with("img", vec![panel(3, 10.0, 200.0, 300.0, 300.0)]);

		let found = Locator::default().locate(&surface).await.unwrap();

		assert_eq!(found.tag, "image_only");
		assert_eq!(found.candidate.id, 3);
		assert_eq!(surface.probed().len(), default_chain().len());
	}

	#[test]
	fn left_column_must_be_on_the_left() {
		let viewport = Viewport::new(1000.0, 800.0);
		assert!(LeftColumn.accepts(&panel(1, 100.0, 0.0, 400.0, 400.0), &viewport));
		assert!(!LeftColumn.accepts(&panel(1, 600.0, 0.0, 400.0, 400.0), &viewport));
	}

	#[test]
	fn images_outside_content_band_are_chrome() {
		let viewport = Viewport::new(1000.0, 900.0);
		let strategy = ContentImage { min_px: 150.0 };
		assert!(strategy.accepts(&panel(1, 0.0, 100.0, 300.0, 300.0), &viewport));
		assert!(!strategy.accepts(&panel(1, 0.0, 700.0, 300.0, 300.0), &viewport));
		assert!(!strategy.accepts(&panel(1, 0.0, -20.0, 300.0, 300.0), &viewport));
		assert!(!strategy.accepts(&panel(1, 0.0, 100.0, 100.0, 300.0), &viewport));
	}

	#[test]
	fn shared_passage_walks_up_two_levels() {
		assert_eq!(SharedPassage.probe().ancestor_levels, 2);
	}

	#[tokio::test]
	async fn nothing_found_is_not_an_error() {
		let surface = FakeSurface::default();
		assert!(Locator::default().locate(&surface).await.is_none());
	}

	#[tokio::test(start_paused = true)]
	async fn capture_writes_deterministic_filename() {
		let dir = tempfile::tempdir().unwrap();
		let surface = FakeSurface::default().with(CLASS_COMBO, vec![panel(1, 0.0, 100.0, 800.0, 500.0)]);

		let records = capture_passage(&surface, &Locator::default(), 7, dir.path(), OverflowCapture::Zoom, 100).await;

		assert_eq!(records, vec![ScreenshotRecord::new("Q7_passage_panel.png".into(), "Class combo panel".into())]);
		assert!(dir.path().join("Q7_passage_panel.png").exists());
	}

	#[tokio::test(start_paused = true)]
	async fn failed_capture_moves_to_next_strategy() {
		let dir = tempfile::tempdir().unwrap();
		let mut surface = FakeSurface::default().with(CLASS_COMBO, vec![panel(1, 0.0, 100.0, 800.0, 500.0)]).with("img", vec![panel(2, 0.0, 100.0, 300.0, 300.0)]);
		surface.failing_captures.push(1);

		let records = capture_passage(&surface, &Locator::default(), 2, dir.path(), OverflowCapture::Zoom, 100).await;

		assert_eq!(records.len(), 1);
		assert_eq!(records[0].filename, "Q2_image_only.png");
	}

	#[tokio::test(start_paused = true)]
	async fn middle_strategies_capture_when_earlier_ones_miss() {
		let chain = default_chain();
		let selectors: Vec<String> = chain.iter().map(|s| s.probe().selector).collect();
		for (index, tag, label) in [(1, "feature_panel", "Data attribute"), (3, "stimulus", "Stimulus id"), (4, "shared_passage", "Shared passage")] {
			let dir = tempfile::tempdir().unwrap();
			let surface = FakeSurface::default().with(&selectors[index], vec![panel(5, 0.0, 120.0, 700.0, 500.0)]);

			let records = capture_passage(&surface, &Locator::default(), 4, dir.path(), OverflowCapture::Zoom, 100).await;

			let filename = format!("Q4_{tag}.png");
			assert_eq!(records, vec![ScreenshotRecord::new(filename.clone(), format!("{label} panel"))]);
			assert!(dir.path().join(&filename).exists());
			assert_eq!(surface.probed(), selectors[..=index].to_vec());
		}
	}
}
