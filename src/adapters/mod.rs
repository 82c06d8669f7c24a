//! Contracts for the black-box collaborators the pipeline calls.
//!
//! The controller only relies on the result types declared here: a transform
//! either yields an image or a [`TransformError`], the detector yields
//! candidates, and the description generator yields a [`ListingDescription`].
//! Concrete implementations live in the submodules and are chosen from
//! [`ServiceConfig`] at startup.

pub mod background;
pub mod describe;
pub mod detector;
pub mod enhance;
#[cfg(test)]
pub mod testing;

use crate::{codec::ImageHandle, config::ServiceConfig, llm::LlmClient};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::{sync::Arc, time::Duration};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransformError {
    /// The strategy has no backing service in this deployment.
    #[error("not configured: {0}")]
    Unavailable(String),
    #[error("remote call failed: {0}")]
    Remote(String),
    #[error("invalid output: {0}")]
    InvalidOutput(String),
    #[error("processing failed: {0}")]
    Processing(String),
    #[error("timed out after {0:?}")]
    TimedOut(Duration),
    #[error("adapter panicked")]
    Panicked,
}

/// Pixel-space box as reported by a detector, `(x_min, y_min)` inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x_min: f32,
    pub y_min: f32,
    pub x_max: f32,
    pub y_max: f32,
}

/// Integer crop rectangle inside an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CropRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl BoundingBox {
    /// Clamp to `width x height`; `None` when nothing of the box remains.
    pub fn clamp_to(&self, width: u32, height: u32) -> Option<CropRect> {
        let clamp = |v: f32, max: u32| -> u32 {
            if v.is_nan() {
                0
            } else {
                v.max(0.0).min(max as f32) as u32
            }
        };
        let x0 = clamp(self.x_min, width);
        let y0 = clamp(self.y_min, height);
        let x1 = clamp(self.x_max, width);
        let y1 = clamp(self.y_max, height);
        if x1 <= x0 || y1 <= y0 {
            return None;
        }
        Some(CropRect {
            x: x0,
            y: y0,
            width: x1 - x0,
            height: y1 - y0,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub label: String,
    pub confidence: f32,
    #[serde(rename = "box")]
    pub bbox: BoundingBox,
}

#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuredListing {
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub features: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub language: Option<String>,
}

/// What a description generator produced: parsed listing copy, or the model's
/// text verbatim when it was not well-formed JSON.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ListingDescription {
    Structured(StructuredListing),
    RawText { text: String },
}

#[async_trait]
pub trait Detector: Send + Sync {
    fn name(&self) -> &'static str;

    async fn detect(
        &self,
        image: &ImageHandle,
        labels: &[&str],
    ) -> Result<Vec<Candidate>, TransformError>;
}

/// Background removal and the three enhancement strategies share this
/// capability.
#[async_trait]
pub trait ImageTransform: Send + Sync {
    fn name(&self) -> &'static str;

    async fn transform(&self, image: &ImageHandle) -> Result<ImageHandle, TransformError>;
}

#[async_trait]
pub trait DescriptionGenerator: Send + Sync {
    fn name(&self) -> &'static str;

    async fn describe(
        &self,
        image: &ImageHandle,
        tone: &str,
        lang: &str,
    ) -> Result<ListingDescription, TransformError>;
}

#[derive(Clone)]
pub struct Adapters {
    pub detector: Arc<dyn Detector>,
    pub background: Arc<dyn ImageTransform>,
    pub enhancers: [Arc<dyn ImageTransform>; 3],
    pub describer: Arc<dyn DescriptionGenerator>,
}

impl Adapters {
    pub fn from_config(config: &ServiceConfig) -> Self {
        let llm = Arc::new(LlmClient::new(config.llm.clone()));

        let detector: Arc<dyn Detector> = match &config.detector_url {
            Some(url) => Arc::new(detector::RemoteDetector::new(
                url.clone(),
                config.detector_threshold,
            )),
            None => Arc::new(detector::NoopDetector),
        };

        let background: Arc<dyn ImageTransform> = match &config.background_remover_url {
            Some(url) => Arc::new(background::RemoteBackgroundRemover::new(url.clone())),
            None => Arc::new(background::BorderKeyRemover::default()),
        };

        let enhancers: [Arc<dyn ImageTransform>; 3] = [
            Arc::new(enhance::GentleEnhancer::default()),
            Arc::new(enhance::RemoteUpscaler::new(
                config.upscaler_url.clone(),
                config.upscale_factor,
            )),
            Arc::new(enhance::LlmRetoucher::new(
                llm.clone(),
                config.retouch_enabled,
            )),
        ];

        Self {
            detector,
            background,
            enhancers,
            describer: Arc::new(describe::LlmDescriptionGenerator::new(llm)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn box_clamped_to_image() {
        let bbox = BoundingBox {
            x_min: -10.0,
            y_min: 5.0,
            x_max: 120.0,
            y_max: 40.5,
        };
        assert_eq!(
            bbox.clamp_to(100, 50),
            Some(CropRect {
                x: 0,
                y: 5,
                width: 100,
                height: 35,
            })
        );
    }

    #[test]
    fn degenerate_box_dropped() {
        let inverted = BoundingBox {
            x_min: 30.0,
            y_min: 10.0,
            x_max: 20.0,
            y_max: 40.0,
        };
        assert_eq!(inverted.clamp_to(100, 100), None);

        let outside = BoundingBox {
            x_min: 200.0,
            y_min: 200.0,
            x_max: 300.0,
            y_max: 300.0,
        };
        assert_eq!(outside.clamp_to(100, 100), None);
    }

    #[test]
    fn raw_text_description_tagged() {
        let value = serde_json::to_value(ListingDescription::RawText {
            text: "just words".into(),
        })
        .expect("serialize");
        assert_eq!(value["kind"], "raw_text");
        assert_eq!(value["text"], "just words");
    }
}
