use crate::recognition::{PlateReading, PlateRecognizer, RecognitionError, RecognitionFuture};
use reqwest::header::AUTHORIZATION;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use std::fmt;
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_ENDPOINT: &str = "https://api.platerecognizer.com/v1/plate-reader/";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Client for a Plate Recognizer compatible `plate-reader` endpoint.
pub struct PlateRecognizerClient {
    client: reqwest::Client,
    endpoint: String,
    token: String,
    regions: Vec<String>,
    camera_id: Option<String>,
}

impl PlateRecognizerClient {
    pub fn new(
        endpoint: String,
        token: String,
        regions: Vec<String>,
        camera_id: Option<String>,
        timeout: Duration,
    ) -> Result<Self, RecognitionError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint,
            token,
            regions,
            camera_id,
        })
    }

    async fn call_remote(&self, image: &[u8]) -> Result<Option<PlateReading>, RecognitionError> {
        if image.is_empty() {
            return Err(RecognitionError::InvalidImage("empty image data".to_string()));
        }

        let upload = Part::bytes(image.to_vec())
            .file_name("image.jpg")
            .mime_str("image/jpeg")?;
        let mut form = Form::new().part("upload", upload);
        for region in &self.regions {
            form = form.text("regions", region.clone());
        }
        if let Some(camera_id) = &self.camera_id {
            form = form.text("camera_id", camera_id.clone());
        }

        let response = self
            .client
            .post(&self.endpoint)
            .header(AUTHORIZATION, format!("Token {}", self.token))
            .multipart(form)
            .send()
            .await?;

        let status = response.status();
        debug!(status = status.as_u16(), "Plate reader responded");
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(map_error_status(status.as_u16(), body));
        }

        let body: PlateReaderResponse = response.json().await?;
        Ok(best_reading(body.results))
    }
}

impl fmt::Debug for PlateRecognizerClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlateRecognizerClient")
            .field("endpoint", &self.endpoint)
            .field("regions", &self.regions)
            .field("camera_id", &self.camera_id)
            .finish_non_exhaustive()
    }
}

impl PlateRecognizer for PlateRecognizerClient {
    fn recognize<'a>(&'a self, image: &'a [u8]) -> RecognitionFuture<'a> {
        Box::pin(self.call_remote(image))
    }
}

#[derive(Debug, Deserialize)]
struct PlateReaderResponse {
    #[serde(default)]
    results: Vec<PlateReaderResult>,
}

#[derive(Debug, Deserialize)]
struct PlateReaderResult {
    plate: String,
    score: f64,
}

fn best_reading(results: Vec<PlateReaderResult>) -> Option<PlateReading> {
    results
        .into_iter()
        .filter(|result| !result.plate.trim().is_empty() && result.score.is_finite())
        .max_by(|a, b| a.score.total_cmp(&b.score))
        .map(|result| PlateReading {
            plate: result.plate.trim().to_uppercase(),
            confidence: (result.score * 100.0).round(),
        })
}

fn map_error_status(status: u16, body: String) -> RecognitionError {
    match status {
        401 => RecognitionError::Unauthorized,
        429 => RecognitionError::RateLimited,
        400 => RecognitionError::InvalidImage(body.trim().to_string()),
        other => RecognitionError::Http(other, body.trim().to_string()),
    }
}
