use super::{Candidate, Detector, TransformError};
use crate::{codec, codec::ImageHandle, http::build_client};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

/// Product categories the zero-shot detector is prompted with.
pub const DETECTION_VOCABULARY: &[&str] = &[
    "clothing",
    "topwear",
    "bottomwear",
    "outerwear",
    "apparel",
    "sportswear",
    "uniform",
    "underwear",
    "dress",
    "outfit",
    "footwear",
    "shoes",
    "boots",
    "sneakers",
    "accessory",
    "bag",
    "backpack",
    "handbag",
    "wallet",
    "belt",
    "hat",
    "cap",
    "scarf",
    "glasses",
    "watch",
    "jewel",
    "electronics",
    "device",
    "gadget",
    "smartphone",
    "laptop",
    "tablet",
    "headphones",
    "smartwatch",
    "cosmetics",
    "beauty product",
    "skincare",
    "makeup",
    "perfume",
    "hair product",
    "baby product",
    "baby clothes",
    "toy",
    "stroller",
    "pacifier",
    "home item",
    "furniture",
    "appliance",
    "decor",
    "kitchenware",
    "bedding",
    "cleaning tool",
    "sports gear",
    "fitness equipment",
    "gym accessory",
    "camping gear",
    "bicycle equipment",
];

/// Zero-shot detector served over HTTP (an OWL-ViT style inference endpoint).
pub struct RemoteDetector {
    http: Client,
    url: String,
    threshold: f32,
}

impl RemoteDetector {
    pub fn new(url: String, threshold: f32) -> Self {
        Self {
            http: build_client(),
            url,
            threshold,
        }
    }
}

#[derive(Debug, Serialize)]
struct DetectRequest<'a> {
    image: String,
    labels: &'a [&'a str],
    threshold: f32,
}

#[derive(Debug, Deserialize)]
struct DetectResponse {
    #[serde(default)]
    detections: Vec<Candidate>,
}

#[async_trait]
impl Detector for RemoteDetector {
    fn name(&self) -> &'static str {
        "remote_detector"
    }

    async fn detect(
        &self,
        image: &ImageHandle,
        labels: &[&str],
    ) -> Result<Vec<Candidate>, TransformError> {
        let encoded =
            codec::jpeg_base64(image).map_err(|err| TransformError::Processing(err.to_string()))?;
        let body = DetectRequest {
            image: encoded,
            labels,
            threshold: self.threshold,
        };
        let response = self
            .http
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|err| TransformError::Remote(err.to_string()))?;
        if !response.status().is_success() {
            return Err(TransformError::Remote(format!(
                "HTTP {}",
                response.status()
            )));
        }
        let payload: DetectResponse = response
            .json()
            .await
            .map_err(|err| TransformError::InvalidOutput(err.to_string()))?;
        Ok(payload.detections)
    }
}

/// Used when no detector is deployed: reports nothing, so the whole frame is
/// used as the crop.
pub struct NoopDetector;

#[async_trait]
impl Detector for NoopDetector {
    fn name(&self) -> &'static str {
        "noop_detector"
    }

    async fn detect(
        &self,
        _image: &ImageHandle,
        _labels: &[&str],
    ) -> Result<Vec<Candidate>, TransformError> {
        Ok(Vec::new())
    }
}
