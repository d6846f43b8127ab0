#![cfg(feature = "api-detection")]

//! Remote detection over HTTP: the frame goes out as a JPEG in a
//! `multipart/form-data` POST and comes back as a JSON list of boxes.

use std::io::Cursor;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;
use serde::Deserialize;

use crate::detect::backend::{DetectionCapability, DetectorBackend, InputSpec};
use crate::detect::model::{ModelLoader, ModelSpec};
use crate::detect::result::{Detection, DetectionResult};
use crate::error::NvrError;

pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const JPEG_QUALITY: u8 = 85;
const BOUNDARY: &str = "----nvr-core-frame-boundary";

#[derive(Debug, Deserialize)]
struct ApiResponse {
    #[serde(default)]
    detections: Vec<ApiDetection>,
}

#[derive(Debug, Deserialize)]
struct ApiDetection {
    label: String,
    confidence: f32,
    x_min: f32,
    y_min: f32,
    x_max: f32,
    y_max: f32,
}

pub struct ApiBackend {
    url: String,
    threshold: f32,
    agent: ureq::Agent,
}

impl ApiBackend {
    pub fn new(url: &str, threshold: f32) -> Result<Self> {
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(NvrError::config(format!(
                "detection api url '{}' must start with http:// or https://",
                url
            )));
        }
        let agent = ureq::AgentBuilder::new().timeout(REQUEST_TIMEOUT).build();
        Ok(Self {
            url: url.to_string(),
            threshold,
            agent,
        })
    }

    pub fn request_url(&self) -> String {
        format!(
            "{}?backend=tflite&confidence_threshold={}&return_image=false",
            self.url, self.threshold
        )
    }
}

fn encode_jpeg(pixels: &[u8], width: u32, height: u32) -> Result<Vec<u8>> {
    let mut jpeg = Cursor::new(Vec::new());
    JpegEncoder::new_with_quality(&mut jpeg, JPEG_QUALITY)
        .encode(pixels, width, height, ExtendedColorType::Rgb8)
        .context("jpeg encode failed")?;
    Ok(jpeg.into_inner())
}

fn multipart_body(jpeg: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(jpeg.len() + 256);
    body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
    body.extend_from_slice(
        b"Content-Disposition: form-data; name=\"file\"; filename=\"frame.jpg\"\r\n",
    );
    body.extend_from_slice(b"Content-Type: image/jpeg\r\n\r\n");
    body.extend_from_slice(jpeg);
    body.extend_from_slice(format!("\r\n--{}--\r\n", BOUNDARY).as_bytes());
    body
}

fn parse_response(body: &str) -> Result<DetectionResult> {
    let response: ApiResponse =
        serde_json::from_str(body).context("detection api returned invalid json")?;
    let mut result = DetectionResult::empty();
    for d in response.detections {
        result.push(
            Detection::new(&d.label, d.confidence).with_corners(d.x_min, d.y_min, d.x_max, d.y_max),
        );
    }
    Ok(result)
}

impl DetectorBackend for ApiBackend {
    fn name(&self) -> &'static str {
        "api"
    }

    fn supports(&self, capability: DetectionCapability) -> bool {
        matches!(capability, DetectionCapability::ObjectDetection)
    }

    fn input(&self) -> Option<InputSpec> {
        Some(InputSpec::rgb())
    }

    fn detect(&mut self, pixels: &[u8], width: u32, height: u32) -> Result<DetectionResult> {
        let jpeg = encode_jpeg(pixels, width, height)?;
        let url = self.request_url();
        let response = self
            .agent
            .post(&url)
            .set(
                "Content-Type",
                &format!("multipart/form-data; boundary={}", BOUNDARY),
            )
            .set("accept", "application/json")
            .send_bytes(&multipart_body(&jpeg))
            .map_err(|e| NvrError::transport(format!("detection api {}: {}", self.url, e)))?;
        let body = response
            .into_string()
            .map_err(|e| anyhow!("detection api {}: read body: {}", self.url, e))?;
        parse_response(&body)
    }
}

/// Loader for `http(s)://` model strings; `location` is the endpoint.
#[derive(Clone, Copy, Debug, Default)]
pub struct ApiLoader;

impl ModelLoader for ApiLoader {
    fn load(&self, spec: &ModelSpec) -> Result<Box<dyn DetectorBackend>> {
        Ok(Box::new(ApiBackend::new(&spec.location, spec.threshold)?))
    }
}
