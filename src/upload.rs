use std::{path::Path, time::Duration};

use base64::Engine;
use color_eyre::{Result, eyre::eyre};
use serde::Deserialize;
use v_utils::{elog, log};

use crate::QuestionRecord;

pub const IMGBB_ENDPOINT: &str = "https://api.imgbb.com/1/upload";

/// Somewhere captured images can be published
#[allow(async_fn_in_trait)]
pub trait ImageHost {
	/// Public URL of the uploaded file, `None` when the host refused it
	async fn upload(&self, path: &Path) -> Option<String>;
}

#[derive(Debug, Deserialize)]
struct ImgBbResponse {
	#[serde(default)]
	success: bool,
	data: Option<ImgBbData>,
}

#[derive(Debug, Deserialize)]
struct ImgBbData {
	url: String,
}

/// Pull the public URL out of an upload response body
pub fn parse_upload_response(body: &str) -> Result<String> {
	let parsed: ImgBbResponse = serde_json::from_str(body).map_err(|e| eyre!("Failed to parse upload response: {e}"))?;
	match (parsed.success, parsed.data) {
		(true, Some(data)) => Ok(data.url),
		_ => Err(eyre!("Upload rejected: {body}")),
	}
}

pub struct ImgBb {
	http: reqwest::Client,
	api_key: String,
	endpoint: String,
}

impl ImgBb {
	pub fn new(api_key: String) -> Result<Self> {
		let http = reqwest::Client::builder()
			.timeout(Duration::from_secs(60))
			.user_agent(concat!("quizshot/", env!("CARGO_PKG_VERSION")))
			.build()
			.map_err(|e| eyre!("Failed to build HTTP client: {e}"))?;
		Ok(Self {
			http,
			api_key,
			endpoint: IMGBB_ENDPOINT.to_string(),
		})
	}

	async fn try_upload(&self, path: &Path) -> Result<String> {
		let bytes = tokio::fs::read(path).await.map_err(|e| eyre!("Failed to read {}: {e}", path.display()))?;
		let encoded = base64::engine::general_purpose::STANDARD.encode(&bytes);

		let response = self
			.http
			.post(&self.endpoint)
			.form(&[("key", self.api_key.as_str()), ("image", encoded.as_str())])
			.send()
			.await
			.map_err(|e| eyre!("Upload request failed: {e}"))?;

		let status = response.status();
		let body = response.text().await.map_err(|e| eyre!("Failed to read upload response: {e}"))?;
		if !status.is_success() {
			return Err(eyre!("Upload failed with status {status}"));
		}
		parse_upload_response(&body)
	}
}

impl ImageHost for ImgBb {
	async fn upload(&self, path: &Path) -> Option<String> {
		match self.try_upload(path).await {
			Ok(url) => Some(url),
			Err(e) => {
				elog!("Upload of {} failed: {e}", path.display());
				None
			}
		}
	}
}

/// Upload every record's screenshots, the first URL that comes back becomes the record's image link.
/// No retries: a failed upload just leaves the link empty.
pub async fn upload_all<H: ImageHost>(host: &H, records: &mut [QuestionRecord], images_dir: &Path) -> usize {
	let mut uploaded = 0;
	for record in records.iter_mut() {
		for shot in &record.screenshots {
			let path = images_dir.join(&shot.filename);
			if !path.exists() {
				elog!("File not found: {}", path.display());
				continue;
			}
			log!("Uploading {}...", shot.filename);
			if let Some(url) = host.upload(&path).await {
				uploaded += 1;
				if record.image_url.is_none() {
					record.image_url = Some(url);
				}
			}
		}
	}
	uploaded
}
