//! Image handles and the transport encoding used at the HTTP boundary.
//!
//! Stages pass [`ImageHandle`]s around by reference count; nothing inside the
//! pipeline re-encodes an image. Encoding to JPEG/PNG and base64 happens only
//! when a response is built or an adapter needs bytes on the wire.

use base64::{Engine as _, engine::general_purpose::STANDARD};
use image::{DynamicImage, GenericImageView, ImageFormat, codecs::jpeg::JpegEncoder};
use std::{fmt, io::Cursor, sync::Arc};
use thiserror::Error;

const JPEG_QUALITY: u8 = 95;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("empty image payload")]
    Empty,
    #[error("unsupported or corrupt image: {0}")]
    Decode(#[from] image::ImageError),
    #[error("encode failed: {0}")]
    Encode(String),
    #[error("invalid base64 payload: {0}")]
    Base64(String),
}

/// Cheaply clonable, immutable decoded raster.
#[derive(Clone)]
pub struct ImageHandle(Arc<DynamicImage>);

impl ImageHandle {
    pub fn new(image: DynamicImage) -> Self {
        Self(Arc::new(image))
    }

    pub fn image(&self) -> &DynamicImage {
        &self.0
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.0.dimensions()
    }

    pub fn has_alpha(&self) -> bool {
        self.0.color().has_alpha()
    }

    pub fn same_as(&self, other: &ImageHandle) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for ImageHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (w, h) = self.dimensions();
        write!(f, "ImageHandle({w}x{h})")
    }
}

/// Decode uploaded bytes into an RGB raster.
pub fn decode(bytes: &[u8]) -> Result<ImageHandle, CodecError> {
    if bytes.is_empty() {
        return Err(CodecError::Empty);
    }
    let img = image::load_from_memory(bytes)?;
    Ok(ImageHandle::new(DynamicImage::ImageRgb8(img.to_rgb8())))
}

/// Decode bytes keeping whatever channels they carry (adapters return RGBA).
pub fn decode_any(bytes: &[u8]) -> Result<ImageHandle, CodecError> {
    if bytes.is_empty() {
        return Err(CodecError::Empty);
    }
    Ok(ImageHandle::new(image::load_from_memory(bytes)?))
}

/// Accepts either bare base64 or a `data:<mime>;base64,` URL.
pub fn decode_base64(payload: &str) -> Result<ImageHandle, CodecError> {
    let body = match payload.split_once(";base64,") {
        Some((prefix, rest)) if prefix.starts_with("data:") => rest,
        _ => payload,
    };
    let bytes = STANDARD
        .decode(body.trim())
        .map_err(|err| CodecError::Base64(err.to_string()))?;
    decode_any(&bytes)
}

pub fn encode_png(handle: &ImageHandle) -> Result<Vec<u8>, CodecError> {
    let mut buf = Vec::new();
    handle
        .image()
        .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
        .map_err(|err| CodecError::Encode(err.to_string()))?;
    Ok(buf)
}

pub fn encode_jpeg(handle: &ImageHandle) -> Result<Vec<u8>, CodecError> {
    let mut buf = Vec::new();
    let rgb = DynamicImage::ImageRgb8(handle.image().to_rgb8());
    rgb.write_with_encoder(JpegEncoder::new_with_quality(&mut buf, JPEG_QUALITY))
        .map_err(|err| CodecError::Encode(err.to_string()))?;
    Ok(buf)
}

/// Bare base64 JPEG, the form LLM gateways accept for inline images.
pub fn jpeg_base64(handle: &ImageHandle) -> Result<String, CodecError> {
    Ok(STANDARD.encode(encode_jpeg(handle)?))
}

/// Data URL for API responses. Images with alpha are sent as PNG so a removed
/// background stays transparent; everything else as JPEG.
pub fn to_data_url(handle: &ImageHandle) -> Result<String, CodecError> {
    if handle.has_alpha() {
        let png = encode_png(handle)?;
        Ok(format!("data:image/png;base64,{}", STANDARD.encode(png)))
    } else {
        let jpeg = encode_jpeg(handle)?;
        Ok(format!("data:image/jpeg;base64,{}", STANDARD.encode(jpeg)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage, Rgba, RgbaImage};

    fn rgb(w: u32, h: u32) -> ImageHandle {
        ImageHandle::new(DynamicImage::ImageRgb8(RgbImage::from_pixel(
            w,
            h,
            Rgb([120, 80, 40]),
        )))
    }

    #[test]
    fn empty_bytes_rejected() {
        assert!(matches!(decode(&[]), Err(CodecError::Empty)));
    }

    #[test]
    fn garbage_bytes_rejected() {
        let err = decode(b"definitely not an image").expect_err("garbage");
        assert!(matches!(err, CodecError::Decode(_)));
    }

    #[test]
    fn decode_normalizes_to_rgb() {
        let rgba = ImageHandle::new(DynamicImage::ImageRgba8(RgbaImage::from_pixel(
            3,
            2,
            Rgba([1, 2, 3, 0]),
        )));
        let png = encode_png(&rgba).expect("png");
        let decoded = decode(&png).expect("decode");
        assert!(!decoded.has_alpha());
        assert_eq!(decoded.dimensions(), (3, 2));
    }

    #[test]
    fn data_url_picks_format_by_alpha() {
        let opaque = to_data_url(&rgb(4, 4)).expect("jpeg url");
        assert!(opaque.starts_with("data:image/jpeg;base64,"));

        let clear = ImageHandle::new(DynamicImage::ImageRgba8(RgbaImage::from_pixel(
            4,
            4,
            Rgba([0, 0, 0, 0]),
        )));
        let url = to_data_url(&clear).expect("png url");
        assert!(url.starts_with("data:image/png;base64,"));
        let back = decode_base64(&url).expect("decode data url");
        assert!(back.has_alpha());
    }

    #[test]
    fn invalid_base64_reported() {
        let err = decode_base64("data:image/png;base64,@@@").expect_err("bad b64");
        assert!(matches!(err, CodecError::Base64(_)));
    }
}
