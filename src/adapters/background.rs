use super::{ImageTransform, TransformError};
use crate::{codec, codec::ImageHandle, http::build_client};
use async_trait::async_trait;
use image::{DynamicImage, GenericImageView, Rgba, RgbaImage};
use reqwest::Client;

/// Segmentation service that accepts a PNG body and answers with a PNG whose
/// background is transparent (the `rembg` server contract).
pub struct RemoteBackgroundRemover {
    http: Client,
    url: String,
}

impl RemoteBackgroundRemover {
    pub fn new(url: String) -> Self {
        Self {
            http: build_client(),
            url,
        }
    }
}

#[async_trait]
impl ImageTransform for RemoteBackgroundRemover {
    fn name(&self) -> &'static str {
        "remote_background_remover"
    }

    async fn transform(&self, image: &ImageHandle) -> Result<ImageHandle, TransformError> {
        let png =
            codec::encode_png(image).map_err(|err| TransformError::Processing(err.to_string()))?;
        let response = self
            .http
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, "image/png")
            .body(png)
            .send()
            .await
            .map_err(|err| TransformError::Remote(err.to_string()))?;
        if !response.status().is_success() {
            return Err(TransformError::Remote(format!(
                "HTTP {}",
                response.status()
            )));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|err| TransformError::Remote(err.to_string()))?;
        codec::decode_any(&bytes).map_err(|err| TransformError::InvalidOutput(err.to_string()))
    }
}

/// Local stand-in for a segmentation model: estimates the backdrop colour from
/// the image border and keys every pixel close to it out to transparent.
/// Works for studio-style shots on a plain backdrop.
pub struct BorderKeyRemover {
    tolerance: u8,
}

impl Default for BorderKeyRemover {
    fn default() -> Self {
        Self { tolerance: 40 }
    }
}

impl BorderKeyRemover {
    pub fn with_tolerance(tolerance: u8) -> Self {
        Self { tolerance }
    }
}

#[async_trait]
impl ImageTransform for BorderKeyRemover {
    fn name(&self) -> &'static str {
        "border_key_remover"
    }

    async fn transform(&self, image: &ImageHandle) -> Result<ImageHandle, TransformError> {
        let source = image.clone();
        let tolerance = self.tolerance;
        tokio::task::spawn_blocking(move || key_out_border(source.image(), tolerance))
            .await
            .map_err(|err| TransformError::Processing(err.to_string()))?
            .map(|keyed| ImageHandle::new(DynamicImage::ImageRgba8(keyed)))
    }
}

fn key_out_border(image: &DynamicImage, tolerance: u8) -> Result<RgbaImage, TransformError> {
    let (w, h) = image.dimensions();
    if w == 0 || h == 0 {
        return Err(TransformError::Processing("empty image".into()));
    }
    let mut rgba = image.to_rgba8();
    let backdrop = border_mean(&rgba);

    let mut kept = 0u64;
    for pixel in rgba.pixels_mut() {
        if distance(pixel, &backdrop) <= tolerance {
            pixel.0[3] = 0;
        } else {
            kept += 1;
        }
    }
    if kept == 0 {
        return Err(TransformError::Processing(
            "no foreground left after keying".into(),
        ));
    }
    Ok(rgba)
}

fn border_mean(rgba: &RgbaImage) -> [u8; 3] {
    let (w, h) = rgba.dimensions();
    let mut sum = [0u64; 3];
    let mut count = 0u64;
    let mut add = |p: &Rgba<u8>| {
        for (acc, channel) in sum.iter_mut().zip(p.0.iter()) {
            *acc += u64::from(*channel);
        }
        count += 1;
    };
    for x in 0..w {
        add(rgba.get_pixel(x, 0));
        if h > 1 {
            add(rgba.get_pixel(x, h - 1));
        }
    }
    for y in 1..h.saturating_sub(1) {
        add(rgba.get_pixel(0, y));
        if w > 1 {
            add(rgba.get_pixel(w - 1, y));
        }
    }
    let count = count.max(1);
    [
        (sum[0] / count) as u8,
        (sum[1] / count) as u8,
        (sum[2] / count) as u8,
    ]
}

fn distance(pixel: &Rgba<u8>, backdrop: &[u8; 3]) -> u8 {
    pixel.0[..3]
        .iter()
        .zip(backdrop.iter())
        .map(|(a, b)| a.abs_diff(*b))
        .max()
        .unwrap_or(0)
}
