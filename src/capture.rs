//! Turning a located element into one flat PNG, even when its content scrolls.

use std::{io::Cursor, time::Duration};

use color_eyre::{
	Result,
	eyre::{bail, eyre},
};
use image::{DynamicImage, ImageFormat, Rgba, RgbaImage, imageops};

use crate::locator::{Candidate, PageSurface};

/// Content this much taller than its box still counts as fitting
pub const FIT_TOLERANCE_PX: f64 = 50.0;
pub const MIN_ZOOM: f64 = 0.25;
pub const MAX_ZOOM: f64 = 0.5;

const SCROLL_SETTLE: Duration = Duration::from_millis(300);
const STEP_SETTLE: Duration = Duration::from_millis(200);

/// How to handle content taller than its visible box
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum OverflowCapture {
	/// Shrink the content until it fits, one shot
	#[default]
	Zoom,
	/// Scroll in steps and paste the shots onto one canvas
	Stitch,
	/// Zoom, and stitch if zooming fails
	Adaptive,
}

impl OverflowCapture {
	pub fn parse(s: &str) -> Result<Self> {
		match s.trim().to_ascii_lowercase().as_str() {
			"zoom" => Ok(OverflowCapture::Zoom),
			"stitch" => Ok(OverflowCapture::Stitch),
			"adaptive" => Ok(OverflowCapture::Adaptive),
			other => bail!("Unknown overflow_capture '{other}' (expected zoom, stitch or adaptive)"),
		}
	}
}

#[derive(Clone, Debug, PartialEq)]
pub enum CapturePlan {
	Direct,
	Zoom(f64),
	/// scrollTop values to visit, ascending
	Stitch(Vec<f64>),
}

/// Scale at which `full` px of content fit into `visible` px, kept within [MIN_ZOOM, MAX_ZOOM]
pub fn zoom_factor(visible: f64, full: f64) -> f64 {
	if full <= 0.0 {
		return MAX_ZOOM;
	}
	(visible / full).clamp(MIN_ZOOM, MAX_ZOOM)
}

/// Scroll offsets covering `full` px of content through a `visible` px window, consecutive windows overlapping by `overlap`.
/// Overlap is capped at half the window, every step advances at least that far.
pub fn stitch_offsets(visible: f64, full: f64, overlap: f64) -> Vec<f64> {
	let max_top = (full - visible).max(0.0);
	let overlap = overlap.clamp(0.0, visible / 2.0);
	let step = (visible - overlap).max(1.0);
	let mut tops = Vec::new();
	let mut top: f64 = 0.0;
	loop {
		tops.push(top.min(max_top));
		if top >= max_top {
			break;
		}
		top += step;
	}
	tops
}

pub fn plan(candidate: &Candidate, overflow: OverflowCapture, overlap: u32) -> CapturePlan {
	let visible = candidate.client_height;
	let full = candidate.scroll_height;
	if full - visible <= FIT_TOLERANCE_PX {
		return CapturePlan::Direct;
	}
	match overflow {
		OverflowCapture::Zoom | OverflowCapture::Adaptive => CapturePlan::Zoom(zoom_factor(visible, full)),
		OverflowCapture::Stitch => CapturePlan::Stitch(stitch_offsets(visible, full, overlap as f64)),
	}
}

pub async fn capture_element<S: PageSurface>(surface: &S, candidate: &Candidate, overflow: OverflowCapture, overlap: u32) -> Result<Vec<u8>> {
	match plan(candidate, overflow, overlap) {
		CapturePlan::Direct => capture_direct(surface, candidate.id).await,
		CapturePlan::Zoom(factor) => {
			tracing::debug!("Content {:.0}px in {:.0}px box, zooming to {factor:.2}", candidate.scroll_height, candidate.client_height);
			let zoomed = capture_zoomed(surface, candidate.id, factor).await;
			match (zoomed, overflow) {
				(Err(e), OverflowCapture::Adaptive) => {
					tracing::warn!("Zoom capture failed ({e}), stitching instead");
					let offsets = stitch_offsets(candidate.client_height, candidate.scroll_height, overlap as f64);
					capture_stitched(surface, candidate, &offsets).await
				}
				(result, _) => result,
			}
		}
		CapturePlan::Stitch(offsets) => {
			tracing::debug!("Content {:.0}px in {:.0}px box, stitching {} shots", candidate.scroll_height, candidate.client_height, offsets.len());
			capture_stitched(surface, candidate, &offsets).await
		}
	}
}

async fn capture_direct<S: PageSurface>(surface: &S, id: u32) -> Result<Vec<u8>> {
	surface.scroll_to(id, 0.0).await?;
	tokio::time::sleep(SCROLL_SETTLE).await;
	surface.capture(id).await
}

async fn capture_zoomed<S: PageSurface>(surface: &S, id: u32, factor: f64) -> Result<Vec<u8>> {
	surface.scroll_to(id, 0.0).await?;
	surface.set_zoom(id, factor).await?;
	tokio::time::sleep(SCROLL_SETTLE).await;
	let shot = surface.capture(id).await;
	// restore even when the shot failed, the page is reused for the next question
	surface.set_zoom(id, 1.0).await?;
	shot
}

async fn capture_stitched<S: PageSurface>(surface: &S, candidate: &Candidate, offsets: &[f64]) -> Result<Vec<u8>> {
	let mut tiles = Vec::with_capacity(offsets.len());
	for &top in offsets {
		let actual = surface.scroll_to(candidate.id, top).await?;
		tokio::time::sleep(STEP_SETTLE).await;
		tiles.push((actual, surface.capture(candidate.id).await?));
	}
	surface.scroll_to(candidate.id, 0.0).await?;
	stitch(&tiles, candidate.client_height, candidate.scroll_height)
}

/// Paste PNG `tiles`, each taken at the given scrollTop, onto one canvas of the full content height
pub fn stitch(tiles: &[(f64, Vec<u8>)], visible: f64, full: f64) -> Result<Vec<u8>> {
	if tiles.is_empty() {
		bail!("No tiles to stitch");
	}
	if visible <= 0.0 {
		bail!("Element has no visible height");
	}

	let decoded = tiles
		.iter()
		.map(|(top, png)| {
			image::load_from_memory_with_format(png, ImageFormat::Png)
				.map(|img| (*top, img.to_rgba8()))
				.map_err(|e| eyre!("Failed to decode tile at {top}: {e}"))
		})
		.collect::<Result<Vec<_>>>()?;

	// screenshots are in device pixels, scroll offsets in css pixels
	let scale = decoded[0].1.height() as f64 / visible;
	let width = decoded.iter().map(|(_, img)| img.width()).max().unwrap_or(0);
	let height = (full * scale).round().max(1.0) as u32;

	let mut canvas = RgbaImage::from_pixel(width, height, Rgba([255, 255, 255, 255]));
	for (top, tile) in &decoded {
		imageops::overlay(&mut canvas, tile, 0, (top * scale).round() as i64);
	}

	let mut buf = Cursor::new(Vec::new());
	DynamicImage::ImageRgba8(canvas).write_to(&mut buf, ImageFormat::Png).map_err(|e| eyre!("Failed to encode stitched image: {e}"))?;
	Ok(buf.into_inner())
}
