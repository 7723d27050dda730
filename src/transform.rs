use image::codecs::avif::AvifEncoder;
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ExtendedColorType, GenericImageView, ImageEncoder};
use std::io::Cursor;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransformError {
    #[error("decode error: {0}")]
    Decode(String),
    #[error("encode error: {0}")]
    Encode(String),
    #[error("unsupported output format: {0}")]
    UnsupportedFormat(String),
}

/// What a [`Transformer`] should produce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformOptions {
    /// Requested width, > 0.
    pub width: u32,
    /// Requested height; 0 keeps the aspect ratio.
    pub height: u32,
    /// 0..=100.
    pub quality: u8,
    /// Target MIME type.
    pub target: String,
}

/// Resizes and re-encodes image bytes.
///
/// Implementations are CPU bound; callers run them off the async executor.
pub trait Transformer: Send + Sync {
    fn transform(&self, source: &[u8], opts: &TransformOptions) -> Result<Vec<u8>, TransformError>;
}

/// Output dimensions for a source of `src_w` x `src_h`.
///
/// Width and height are each capped to the native size before the scale is
/// computed, so images are never upscaled. A height of 0 reuses the horizontal
/// scale.
pub fn target_dimensions(src_w: u32, src_h: u32, width: u32, height: u32) -> (u32, u32) {
    if src_w == 0 || src_h == 0 {
        return (src_w.max(1), src_h.max(1));
    }
    let w = width.min(src_w);
    let h_scale = w as f64 / src_w as f64;
    let v_scale = if height == 0 {
        h_scale
    } else {
        height.min(src_h) as f64 / src_h as f64
    };
    let out_w = (src_w as f64 * h_scale).round() as u32;
    let out_h = (src_h as f64 * v_scale).round() as u32;
    (out_w.max(1), out_h.max(1))
}

/// [`Transformer`] backed by the `image` crate, with lossy WebP through libwebp.
#[derive(Debug, Default, Clone, Copy)]
pub struct ImageTransformer;

impl Transformer for ImageTransformer {
    fn transform(&self, source: &[u8], opts: &TransformOptions) -> Result<Vec<u8>, TransformError> {
        let img = decode_image(source)?;
        let (src_w, src_h) = img.dimensions();
        let (w, h) = target_dimensions(src_w, src_h, opts.width, opts.height);
        let resized = if (w, h) == (src_w, src_h) {
            img
        } else {
            // Lanczos3 provides best quality for downsampling
            img.resize_exact(w, h, image::imageops::FilterType::Lanczos3)
        };
        encode_image(&resized, &opts.target, opts.quality)
    }
}

pub fn decode_image(bytes: &[u8]) -> Result<DynamicImage, TransformError> {
    let guessed = image::guess_format(bytes).map_err(|e| TransformError::Decode(e.to_string()))?;
    image::load_from_memory_with_format(bytes, guessed)
        .map_err(|e| TransformError::Decode(e.to_string()))
}

/// Encodes `img` as `mime`. Quality is clamped to 1..=100 and ignored by the
/// lossless formats.
pub fn encode_image(img: &DynamicImage, mime: &str, quality: u8) -> Result<Vec<u8>, TransformError> {
    let q = quality.clamp(1, 100);
    let mut out = Vec::new();

    match mime {
        "image/jpeg" => {
            let rgb = img.to_rgb8();
            let (w, h) = rgb.dimensions();
            JpegEncoder::new_with_quality(&mut out, q)
                .write_image(rgb.as_raw(), w, h, ExtendedColorType::Rgb8)
                .map_err(|e| TransformError::Encode(e.to_string()))?;
        }
        "image/webp" => {
            let rgba = img.to_rgba8();
            let (w, h) = rgba.dimensions();
            let encoded = webp::Encoder::from_rgba(rgba.as_raw(), w, h).encode(q as f32);
            out.extend_from_slice(&encoded);
        }
        "image/avif" => {
            let rgba = img.to_rgba8();
            let (w, h) = rgba.dimensions();
            // Speed 4 balances encoding time and compression ratio
            AvifEncoder::new_with_speed_quality(&mut out, 4, q)
                .write_image(rgba.as_raw(), w, h, ExtendedColorType::Rgba8)
                .map_err(|e| TransformError::Encode(e.to_string()))?;
        }
        "image/png" | "image/gif" => {
            let format = if mime == "image/png" {
                image::ImageFormat::Png
            } else {
                image::ImageFormat::Gif
            };
            img.write_to(&mut Cursor::new(&mut out), format)
                .map_err(|e| TransformError::Encode(e.to_string()))?;
        }
        "image/bmp" | "image/tiff" | "image/x-icon" => {
            let format = match mime {
                "image/bmp" => image::ImageFormat::Bmp,
                "image/tiff" => image::ImageFormat::Tiff,
                _ => image::ImageFormat::Ico,
            };
            // These encoders only take 8-bit layouts.
            DynamicImage::ImageRgba8(img.to_rgba8())
                .write_to(&mut Cursor::new(&mut out), format)
                .map_err(|e| TransformError::Encode(e.to_string()))?;
        }
        other => return Err(TransformError::UnsupportedFormat(other.to_string())),
    }

    Ok(out)
}
