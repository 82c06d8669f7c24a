//! The three enhancement strategies offered to the client side by side.
//!
//! - [`GentleEnhancer`]: local, small corrections plus a 1.5x Lanczos upscale.
//! - [`RemoteUpscaler`]: a hosted diffusion upscaler reached over HTTP.
//! - [`LlmRetoucher`]: the LLM inspects the photo and picks correction
//!   factors, which are then applied locally.

use super::{ImageTransform, TransformError};
use crate::{
    codec,
    codec::ImageHandle,
    http::build_client,
    llm::{LlmClient, LlmContent, LlmMessage, strip_markdown_fence},
};
use async_trait::async_trait;
use image::{DynamicImage, GenericImageView, imageops::FilterType};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub struct GentleEnhancer {
    scale: f32,
}

impl Default for GentleEnhancer {
    fn default() -> Self {
        Self { scale: 1.5 }
    }
}

#[async_trait]
impl ImageTransform for GentleEnhancer {
    fn name(&self) -> &'static str {
        "gentle"
    }

    async fn transform(&self, image: &ImageHandle) -> Result<ImageHandle, TransformError> {
        let source = image.clone();
        let scale = self.scale;
        let enhanced = tokio::task::spawn_blocking(move || gentle(source.image(), scale))
            .await
            .map_err(|err| TransformError::Processing(err.to_string()))?;
        Ok(ImageHandle::new(enhanced))
    }
}

fn gentle(image: &DynamicImage, scale: f32) -> DynamicImage {
    let sharpened = image.unsharpen(1.0, 1);
    let contrasted = sharpened.adjust_contrast(10.0);
    let brightened = scale_brightness(&contrasted, 1.02);
    let saturated = saturate(&brightened, 1.05);
    let denoised = bilateral(&saturated, 10.0, 10.0);
    let (w, h) = denoised.dimensions();
    let nw = ((w as f32) * scale).round().max(1.0) as u32;
    let nh = ((h as f32) * scale).round().max(1.0) as u32;
    denoised.resize_exact(nw, nh, FilterType::Lanczos3)
}

/// 3x3 bilateral filter over RGB. Colour distance is the L1 norm across
/// channels, so hard edges keep their weight near zero. Alpha is copied.
fn bilateral(image: &DynamicImage, sigma_color: f32, sigma_space: f32) -> DynamicImage {
    let src = image.to_rgba8();
    let mut out = src.clone();
    let (w, h) = src.dimensions();
    let color_coeff = -0.5 / (sigma_color * sigma_color);
    let space_coeff = -0.5 / (sigma_space * sigma_space);

    for y in 0..h {
        for x in 0..w {
            let center = src.get_pixel(x, y).0;
            let mut acc = [0.0f32; 3];
            let mut total = 0.0f32;
            for dy in -1i64..=1 {
                for dx in -1i64..=1 {
                    let nx = i64::from(x) + dx;
                    let ny = i64::from(y) + dy;
                    if nx < 0 || ny < 0 || nx >= i64::from(w) || ny >= i64::from(h) {
                        continue;
                    }
                    let px = src.get_pixel(nx as u32, ny as u32).0;
                    let distance: f32 = (0..3)
                        .map(|c| (f32::from(px[c]) - f32::from(center[c])).abs())
                        .sum();
                    let weight = (space_coeff * (dx * dx + dy * dy) as f32).exp()
                        * (color_coeff * distance * distance).exp();
                    for c in 0..3 {
                        acc[c] += weight * f32::from(px[c]);
                    }
                    total += weight;
                }
            }
            let pixel = out.get_pixel_mut(x, y);
            for c in 0..3 {
                pixel.0[c] = (acc[c] / total).round().clamp(0.0, 255.0) as u8;
            }
        }
    }
    DynamicImage::ImageRgba8(out)
}

/// Multiply RGB by `factor`, leaving alpha untouched.
fn scale_brightness(image: &DynamicImage, factor: f32) -> DynamicImage {
    let mut rgba = image.to_rgba8();
    for pixel in rgba.pixels_mut() {
        for channel in pixel.0[..3].iter_mut() {
            *channel = (f32::from(*channel) * factor).round().clamp(0.0, 255.0) as u8;
        }
    }
    DynamicImage::ImageRgba8(rgba)
}

/// Push each pixel away from (factor > 1) or toward its luma.
fn saturate(image: &DynamicImage, factor: f32) -> DynamicImage {
    let mut rgba = image.to_rgba8();
    for pixel in rgba.pixels_mut() {
        let [r, g, b, _] = pixel.0;
        let luma = 0.299 * f32::from(r) + 0.587 * f32::from(g) + 0.114 * f32::from(b);
        for channel in pixel.0[..3].iter_mut() {
            let value = luma + (f32::from(*channel) - luma) * factor;
            *channel = value.round().clamp(0.0, 255.0) as u8;
        }
    }
    DynamicImage::ImageRgba8(rgba)
}

pub struct RemoteUpscaler {
    http: Client,
    url: Option<String>,
    factor: f32,
}

impl RemoteUpscaler {
    pub fn new(url: Option<String>, factor: f32) -> Self {
        Self {
            http: build_client(),
            url,
            factor,
        }
    }
}

#[derive(Debug, Serialize)]
struct UpscaleRequest {
    image: String,
    upscale_factor: f32,
    seed: u64,
    prompt: String,
    negative_prompt: String,
}

#[derive(Debug, Deserialize)]
struct UpscaleResponse {
    image: String,
}

#[async_trait]
impl ImageTransform for RemoteUpscaler {
    fn name(&self) -> &'static str {
        "upscale"
    }

    async fn transform(&self, image: &ImageHandle) -> Result<ImageHandle, TransformError> {
        let Some(url) = &self.url else {
            return Err(TransformError::Unavailable("UPSCALER_URL is not set".into()));
        };
        let png =
            codec::encode_png(image).map_err(|err| TransformError::Processing(err.to_string()))?;
        let body = UpscaleRequest {
            image: base64::Engine::encode(&base64::engine::general_purpose::STANDARD, png),
            upscale_factor: self.factor,
            seed: 0,
            prompt: String::new(),
            negative_prompt: String::new(),
        };
        let response = self
            .http
            .post(url)
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
        let payload: UpscaleResponse = response
            .json()
            .await
            .map_err(|err| TransformError::InvalidOutput(err.to_string()))?;
        codec::decode_base64(&payload.image)
            .map_err(|err| TransformError::InvalidOutput(err.to_string()))
    }
}

const RETOUCH_PROMPT: &str = r#"
You retouch e-commerce product photos. Inspect the attached image and choose corrections.
Respond ONLY with strict JSON: {"brightness": f, "contrast": f, "sharpness": f, "denoise": f}.
- brightness: 1.0 keeps the image as is, 1.1-1.3 if it looks dim
- contrast: 1.0 keeps the image as is, 1.1-1.2 if it looks flat
- sharpness: 1.0 keeps the image as is, 1.2-1.5 if it looks soft
- denoise: 0 for none, 0.5-1.5 if it shows grain
"#;

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct RetouchPlan {
    #[serde(default = "unit")]
    pub brightness: f32,
    #[serde(default = "unit")]
    pub contrast: f32,
    #[serde(default = "unit")]
    pub sharpness: f32,
    #[serde(default)]
    pub denoise: f32,
}

fn unit() -> f32 {
    1.0
}

impl RetouchPlan {
    fn clamped(self) -> Self {
        let bound = |v: f32, lo: f32, hi: f32, fallback: f32| {
            if v.is_finite() { v.clamp(lo, hi) } else { fallback }
        };
        Self {
            brightness: bound(self.brightness, 1.0, 1.3, 1.0),
            contrast: bound(self.contrast, 1.0, 1.2, 1.0),
            sharpness: bound(self.sharpness, 1.0, 1.5, 1.0),
            denoise: bound(self.denoise, 0.0, 1.5, 0.0),
        }
    }
}

pub fn parse_plan(text: &str) -> Result<RetouchPlan, TransformError> {
    let cleaned = strip_markdown_fence(text);
    serde_json::from_str::<RetouchPlan>(&cleaned)
        .map(RetouchPlan::clamped)
        .map_err(|err| TransformError::InvalidOutput(format!("retouch plan: {err}")))
}

fn apply_plan(image: &DynamicImage, plan: RetouchPlan) -> DynamicImage {
    let mut out = if plan.denoise > 0.0 {
        image.blur(plan.denoise)
    } else {
        image.clone()
    };
    if plan.brightness != 1.0 {
        out = scale_brightness(&out, plan.brightness);
    }
    if plan.contrast != 1.0 {
        out = out.adjust_contrast((plan.contrast - 1.0) * 100.0);
    }
    if plan.sharpness > 1.0 {
        out = out.unsharpen(plan.sharpness, 1);
    }
    out
}

pub struct LlmRetoucher {
    llm: Arc<LlmClient>,
    enabled: bool,
}

impl LlmRetoucher {
    pub fn new(llm: Arc<LlmClient>, enabled: bool) -> Self {
        Self { llm, enabled }
    }
}

#[async_trait]
impl ImageTransform for LlmRetoucher {
    fn name(&self) -> &'static str {
        "retouch"
    }

    async fn transform(&self, image: &ImageHandle) -> Result<ImageHandle, TransformError> {
        if !self.enabled {
            return Err(TransformError::Unavailable("RETOUCH_ENABLED is off".into()));
        }
        let encoded =
            codec::jpeg_base64(image).map_err(|err| TransformError::Processing(err.to_string()))?;
        let messages = [
            LlmMessage::system(RETOUCH_PROMPT.trim()),
            LlmMessage::user(vec![
                LlmContent::jpeg(encoded),
                LlmContent::text("Plan the retouch for this product photo."),
            ]),
        ];
        let response = self
            .llm
            .chat("image_retouch_plan", &messages)
            .await
            .map_err(|err| TransformError::Remote(err.to_string()))?;
        let plan = parse_plan(&response.text)?;

        let source = image.clone();
        let retouched = tokio::task::spawn_blocking(move || apply_plan(source.image(), plan))
            .await
            .map_err(|err| TransformError::Processing(err.to_string()))?;
        Ok(ImageHandle::new(retouched))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::LlmConfig;
    use image::{Rgba, RgbaImage};

    fn swatch(w: u32, h: u32) -> ImageHandle {
        ImageHandle::new(DynamicImage::ImageRgba8(RgbaImage::from_fn(w, h, |x, _| {
            Rgba([(x * 20) as u8, 90, 160, 255])
        })))
    }

    #[tokio::test]
    async fn gentle_upscales_by_half() {
        let out = GentleEnhancer::default()
            .transform(&swatch(10, 8))
            .await
            .expect("enhanced");
        assert_eq!(out.dimensions(), (15, 12));
    }

    #[test]
    fn bilateral_smooths_grain_but_keeps_edges() {
        let mut img = RgbaImage::from_fn(6, 4, |x, _| {
            if x < 3 {
                Rgba([20, 20, 20, 255])
            } else {
                Rgba([230, 230, 230, 128])
            }
        });
        img.put_pixel(1, 1, Rgba([26, 26, 26, 255]));
        let out = bilateral(&DynamicImage::ImageRgba8(img), 10.0, 10.0).to_rgba8();

        let speck = out.get_pixel(1, 1).0[0];
        assert!(speck < 26 && speck >= 20, "grain softened, got {speck}");
        assert!(out.get_pixel(2, 2).0[0] <= 22, "dark side of edge kept");
        assert!(out.get_pixel(3, 2).0[0] >= 228, "light side of edge kept");
        assert_eq!(out.get_pixel(4, 0).0[3], 128);
    }

    #[test]
    fn saturation_keeps_grey_grey() {
        let grey = DynamicImage::ImageRgba8(RgbaImage::from_pixel(2, 2, Rgba([128, 128, 128, 7])));
        let out = saturate(&grey, 1.5).to_rgba8();
        assert_eq!(out.get_pixel(0, 0).0, [128, 128, 128, 7]);
    }

    #[test]
    fn brightness_preserves_alpha() {
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(1, 1, Rgba([100, 200, 250, 0])));
        let out = scale_brightness(&img, 1.2).to_rgba8();
        assert_eq!(out.get_pixel(0, 0).0, [120, 240, 255, 0]);
    }

    #[tokio::test]
    async fn upscaler_without_endpoint_is_unavailable() {
        let err = RemoteUpscaler::new(None, 2.6)
            .transform(&swatch(4, 4))
            .await
            .expect_err("no url");
        assert!(matches!(err, TransformError::Unavailable(_)));
    }

    #[tokio::test]
    async fn disabled_retoucher_is_unavailable() {
        let llm = Arc::new(LlmClient::new(LlmConfig::from_env()));
        let err = LlmRetoucher::new(llm, false)
            .transform(&swatch(4, 4))
            .await
            .expect_err("disabled");
        assert!(matches!(err, TransformError::Unavailable(_)));
    }

    #[test]
    fn plan_parsed_and_clamped() {
        let plan = parse_plan("```json\n{\"brightness\": 3.0, \"contrast\": 1.1, \"denoise\": -2}\n```")
            .expect("plan");
        assert_eq!(plan.brightness, 1.3);
        assert_eq!(plan.contrast, 1.1);
        assert_eq!(plan.sharpness, 1.0);
        assert_eq!(plan.denoise, 0.0);
    }

    #[test]
    fn prose_plan_rejected() {
        let err = parse_plan("Looks great, no changes needed.").expect_err("not json");
        assert!(matches!(err, TransformError::InvalidOutput(_)));
    }

    #[test]
    fn identity_plan_keeps_geometry() {
        let plan = RetouchPlan {
            brightness: 1.0,
            contrast: 1.0,
            sharpness: 1.0,
            denoise: 0.0,
        };
        let src = swatch(6, 3);
        let out = apply_plan(src.image(), plan);
        assert_eq!(out.dimensions(), (6, 3));
    }
}
