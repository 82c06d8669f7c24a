//! Scripted adapters for controller and router tests.

use super::{
    Adapters, BoundingBox, Candidate, DescriptionGenerator, Detector, ImageTransform,
    ListingDescription, StructuredListing, TransformError,
};
use crate::codec::{self, ImageHandle};
use async_trait::async_trait;
use image::{DynamicImage, GenericImageView, Rgb, RgbImage, Rgba, RgbaImage};
use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

pub fn jpeg_upload(width: u32, height: u32) -> Vec<u8> {
    let img = RgbImage::from_fn(width, height, |x, y| {
        Rgb([(x % 256) as u8, (y % 256) as u8, 128])
    });
    codec::encode_jpeg(&ImageHandle::new(DynamicImage::ImageRgb8(img))).expect("jpeg fixture")
}

pub fn candidate(label: &str, confidence: f32, bbox: [f32; 4]) -> Candidate {
    Candidate {
        label: label.into(),
        confidence,
        bbox: BoundingBox {
            x_min: bbox[0],
            y_min: bbox[1],
            x_max: bbox[2],
            y_max: bbox[3],
        },
    }
}

pub struct ScriptedDetector(pub Result<Vec<Candidate>, String>);

#[async_trait]
impl Detector for ScriptedDetector {
    fn name(&self) -> &'static str {
        "scripted_detector"
    }

    async fn detect(
        &self,
        _image: &ImageHandle,
        _labels: &[&str],
    ) -> Result<Vec<Candidate>, TransformError> {
        self.0.clone().map_err(TransformError::Remote)
    }
}

/// Returns a fresh RGBA image with the input's geometry; counts invocations.
pub struct Tint {
    pub name: &'static str,
    pub calls: AtomicUsize,
}

impl Tint {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ImageTransform for Tint {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn transform(&self, image: &ImageHandle) -> Result<ImageHandle, TransformError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let (w, h) = image.image().dimensions();
        Ok(ImageHandle::new(DynamicImage::ImageRgba8(
            RgbaImage::from_pixel(w, h, Rgba([10, 200, 10, 255])),
        )))
    }
}

pub enum Misbehave {
    Fail,
    Unavailable,
    Hang,
    Panic,
}

pub struct Broken {
    pub name: &'static str,
    pub how: Misbehave,
}

#[async_trait]
impl ImageTransform for Broken {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn transform(&self, _image: &ImageHandle) -> Result<ImageHandle, TransformError> {
        self.how.act().await
    }
}

impl Misbehave {
    async fn act<T>(&self) -> Result<T, TransformError> {
        match self {
            Misbehave::Fail => Err(TransformError::Remote("HTTP 503".into())),
            Misbehave::Unavailable => Err(TransformError::Unavailable("not deployed".into())),
            Misbehave::Hang => {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Err(TransformError::Remote("woke up".into()))
            }
            Misbehave::Panic => panic!("adapter exploded"),
        }
    }
}

pub struct BrokenDetector(pub Misbehave);

#[async_trait]
impl Detector for BrokenDetector {
    fn name(&self) -> &'static str {
        "broken_detector"
    }

    async fn detect(
        &self,
        _image: &ImageHandle,
        _labels: &[&str],
    ) -> Result<Vec<Candidate>, TransformError> {
        self.0.act().await
    }
}

pub struct BrokenDescriber(pub Misbehave);

#[async_trait]
impl DescriptionGenerator for BrokenDescriber {
    fn name(&self) -> &'static str {
        "broken_describer"
    }

    async fn describe(
        &self,
        _image: &ImageHandle,
        _tone: &str,
        _lang: &str,
    ) -> Result<ListingDescription, TransformError> {
        self.0.act().await
    }
}

/// Fails on the first call, then behaves like [`Tint`].
pub struct FailFirst {
    inner: Tint,
}

impl FailFirst {
    pub fn new(name: &'static str) -> Self {
        Self {
            inner: Tint::new(name),
        }
    }
}

#[async_trait]
impl ImageTransform for FailFirst {
    fn name(&self) -> &'static str {
        self.inner.name
    }

    async fn transform(&self, image: &ImageHandle) -> Result<ImageHandle, TransformError> {
        if self.inner.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            return Err(TransformError::Remote("model warming up".into()));
        }
        self.inner.transform(image).await
    }
}

pub struct ScriptedDescriber(pub Result<ListingDescription, String>);

impl ScriptedDescriber {
    pub fn structured() -> Self {
        Self(Ok(ListingDescription::Structured(StructuredListing {
            title: "Red Sneaker".into(),
            description: "Lightweight everyday sneaker.".into(),
            features: vec!["mesh upper".into()],
            tags: vec!["shoes".into()],
            language: Some("en".into()),
        })))
    }
}

#[async_trait]
impl DescriptionGenerator for ScriptedDescriber {
    fn name(&self) -> &'static str {
        "scripted_describer"
    }

    async fn describe(
        &self,
        _image: &ImageHandle,
        _tone: &str,
        _lang: &str,
    ) -> Result<ListingDescription, TransformError> {
        self.0.clone().map_err(TransformError::Remote)
    }
}

/// Healthy adapters everywhere; tests swap individual slots.
pub fn healthy() -> Adapters {
    Adapters {
        detector: Arc::new(ScriptedDetector(Ok(Vec::new()))),
        background: Arc::new(Tint::new("background")),
        enhancers: [
            Arc::new(Tint::new("gentle")),
            Arc::new(Tint::new("upscale")),
            Arc::new(Tint::new("retouch")),
        ],
        describer: Arc::new(ScriptedDescriber::structured()),
    }
}
