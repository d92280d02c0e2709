//! Vehicle detection behind a single capability interface.
//!
//! [`Detector`] is the seam for model backends; [`DetectionAdapter`] wraps
//! any backend with a per-call timeout and bounded retries so that a slow or
//! failing model only ever costs the pipeline a single frame.

use async_trait::async_trait;
use base64::Engine;
use image::RgbImage;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::io::Cursor;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::DetectionConfig;
use crate::models::detection::{BoundingBox, ObjectDetection};
use crate::services::retry::backoff_delay;

/// Upper bound for the pause between detection retries.
const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(5);

/// A vehicle-detection backend.
#[async_trait]
pub trait Detector: Send + Sync {
    /// Backend name for logs.
    fn name(&self) -> &str;

    async fn detect(&self, frame: &RgbImage) -> Result<Vec<ObjectDetection>, DetectorError>;
}

/// Timeout and retry wrapper around a [`Detector`].
#[derive(Clone)]
pub struct DetectionAdapter {
    detector: Arc<dyn Detector>,
    config: DetectionConfig,
}

impl DetectionAdapter {
    pub fn new(detector: Arc<dyn Detector>, config: DetectionConfig) -> Self {
        Self { detector, config }
    }

    /// Detect objects in one frame, retrying transient failures with backoff.
    pub async fn detect(&self, frame: &RgbImage) -> Result<Vec<ObjectDetection>, DetectionUnavailable> {
        let mut attempt = 0u32;

        loop {
            let start = Instant::now();
            let result = tokio::time::timeout(self.config.timeout, self.detector.detect(frame)).await;
            metrics::histogram!("detection_call_seconds").record(start.elapsed().as_secs_f64());

            let error = match result {
                Ok(Ok(detections)) => return Ok(detections),
                Ok(Err(e)) => e,
                Err(_) => DetectorError::Timeout(self.config.timeout),
            };

            if !error.is_transient() || attempt >= self.config.max_retries {
                return Err(DetectionUnavailable {
                    attempts: attempt + 1,
                    reason: error.to_string(),
                });
            }

            attempt += 1;
            metrics::counter!("detection_retries_total").increment(1);
            let delay = backoff_delay(self.config.base_backoff, MAX_RETRY_BACKOFF, attempt);
            tracing::debug!(
                detector = self.detector.name(),
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Detection failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

/// Client for an HTTP model-serving endpoint.
pub struct HttpDetector {
    http: Client,
    url: String,
    api_token: Option<String>,
}

#[derive(Deserialize)]
struct DetectResponse {
    #[serde(default)]
    detections: Vec<DetectedBox>,
    /// Set by the model server when it accepted the request but could not
    /// run inference (model loading, out of memory).
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct DetectedBox {
    x1: f64,
    y1: f64,
    x2: f64,
    y2: f64,
    #[serde(default)]
    class_id: i32,
    label: String,
    confidence: f64,
    #[serde(default)]
    track_id: Option<i64>,
}

impl HttpDetector {
    pub fn new(url: impl Into<String>, api_token: Option<String>) -> Self {
        Self {
            http: Client::new(),
            url: url.into(),
            api_token,
        }
    }
}

#[async_trait]
impl Detector for HttpDetector {
    fn name(&self) -> &str {
        "http"
    }

    /// Send a JPEG-encoded frame and parse the returned boxes.
    async fn detect(&self, frame: &RgbImage) -> Result<Vec<ObjectDetection>, DetectorError> {
        let mut jpeg = Cursor::new(Vec::new());
        frame
            .write_to(&mut jpeg, image::ImageFormat::Jpeg)
            .map_err(DetectorError::Encode)?;

        let request_body = serde_json::json!({
            "image": base64::engine::general_purpose::STANDARD.encode(jpeg.get_ref()),
            "width": frame.width(),
            "height": frame.height(),
        });

        let mut request = self.http.post(&self.url).json(&request_body);
        if let Some(token) = &self.api_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(DetectorError::Http)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DetectorError::Status { status, body });
        }

        let parsed: DetectResponse = response.json().await.map_err(DetectorError::Http)?;
        if let Some(message) = parsed.error {
            return Err(DetectorError::Backend(message));
        }

        Ok(parsed
            .detections
            .into_iter()
            .map(|d| ObjectDetection {
                bbox: BoundingBox::new(d.x1, d.y1, d.x2, d.y2).normalized_corners(),
                class_id: d.class_id,
                label: d.label.to_lowercase(),
                confidence: d.confidence,
                track_id: d.track_id,
            })
            .collect())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DetectorError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Detector returned {status}: {body}")]
    Status { status: StatusCode, body: String },

    #[error("Failed to encode frame: {0}")]
    Encode(#[from] image::ImageError),

    #[error("Detection timed out after {0:?}")]
    Timeout(Duration),

    #[error("Detector error: {0}")]
    Backend(String),
}

impl DetectorError {
    /// Whether another attempt could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http(e) => !e.is_decode() && !e.is_builder(),
            Self::Status { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            Self::Encode(_) => false,
            Self::Timeout(_) | Self::Backend(_) => true,
        }
    }
}

/// Detection could not be obtained for a frame after all retries.
#[derive(Debug, thiserror::Error)]
#[error("Detection unavailable after {attempts} attempt(s): {reason}")]
pub struct DetectionUnavailable {
    pub attempts: u32,
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails the first `failures` calls, then returns one car.
    struct FlakyDetector {
        failures: u32,
        calls: AtomicU32,
        transient: bool,
    }

    #[async_trait]
    impl Detector for FlakyDetector {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn detect(&self, _frame: &RgbImage) -> Result<Vec<ObjectDetection>, DetectorError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(if self.transient {
                    DetectorError::Backend("model busy".to_string())
                } else {
                    DetectorError::Status {
                        status: StatusCode::BAD_REQUEST,
                        body: "bad frame".to_string(),
                    }
                });
            }
            Ok(vec![ObjectDetection {
                bbox: BoundingBox::new(0.0, 0.0, 1.0, 1.0),
                class_id: 3,
                label: "car".to_string(),
                confidence: 0.9,
                track_id: None,
            }])
        }
    }

    struct SlowDetector;

    #[async_trait]
    impl Detector for SlowDetector {
        fn name(&self) -> &str {
            "slow"
        }

        async fn detect(&self, _frame: &RgbImage) -> Result<Vec<ObjectDetection>, DetectorError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(Vec::new())
        }
    }

    fn fast_config(max_retries: u32) -> DetectionConfig {
        DetectionConfig {
            timeout: Duration::from_millis(50),
            max_retries,
            base_backoff: Duration::from_millis(1),
        }
    }

    fn frame() -> RgbImage {
        RgbImage::new(4, 4)
    }

    #[test]
    fn server_side_failure_in_body_is_reported() {
        let parsed: DetectResponse = serde_json::from_str(r#"{"error": "model loading"}"#).unwrap();
        assert!(parsed.detections.is_empty());
        assert_eq!(parsed.error.as_deref(), Some("model loading"));
        assert!(DetectorError::Backend("model loading".to_string()).is_transient());
    }

    #[tokio::test]
    async fn retries_transient_failures() {
        let detector = Arc::new(FlakyDetector {
            failures: 2,
            calls: AtomicU32::new(0),
            transient: true,
        });
        let adapter = DetectionAdapter::new(detector.clone(), fast_config(2));
        let detections = adapter.detect(&frame()).await.unwrap();
        assert_eq!(detections.len(), 1);
        assert_eq!(detector.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_retry_bound() {
        let detector = Arc::new(FlakyDetector {
            failures: 10,
            calls: AtomicU32::new(0),
            transient: true,
        });
        let adapter = DetectionAdapter::new(detector.clone(), fast_config(2));
        let err = adapter.detect(&frame()).await.unwrap_err();
        assert_eq!(err.attempts, 3);
        assert_eq!(detector.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let detector = Arc::new(FlakyDetector {
            failures: 1,
            calls: AtomicU32::new(0),
            transient: false,
        });
        let adapter = DetectionAdapter::new(detector.clone(), fast_config(3));
        let err = adapter.detect(&frame()).await.unwrap_err();
        assert_eq!(err.attempts, 1);
        assert_eq!(detector.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn slow_calls_time_out() {
        let adapter = DetectionAdapter::new(Arc::new(SlowDetector), fast_config(1));
        let err = adapter.detect(&frame()).await.unwrap_err();
        assert_eq!(err.attempts, 2);
        assert!(err.reason.contains("timed out"));
    }
}
