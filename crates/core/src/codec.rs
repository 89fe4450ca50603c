//! Image (de)serialization for staged inputs and streamed outputs.
//!
//! Inputs travel to backends either as raw encoded bytes (multipart
//! upload) or as base64 text embedded in a JSON payload. Outputs come
//! back the same way.

use std::io::Cursor;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use image::{DynamicImage, ImageFormat};

use crate::error::{ExecutorError, ExecutorResult};

/// Encode an image into the bytes of `format`.
///
/// JPEG has no alpha channel, so images are flattened to RGB first.
pub fn encode_image(image: &DynamicImage, format: ImageFormat) -> ExecutorResult<Vec<u8>> {
    let mut buffer = Cursor::new(Vec::new());
    let result = if format == ImageFormat::Jpeg {
        DynamicImage::ImageRgb8(image.to_rgb8()).write_to(&mut buffer, format)
    } else {
        image.write_to(&mut buffer, format)
    };
    result.map_err(|e| ExecutorError::ImageCodec(format!("encode {format:?}: {e}")))?;
    Ok(buffer.into_inner())
}

/// Encode an image as base64 text of `format`.
pub fn encode_base64(image: &DynamicImage, format: ImageFormat) -> ExecutorResult<String> {
    Ok(STANDARD.encode(encode_image(image, format)?))
}

/// Decode an image from encoded bytes, guessing the format.
pub fn decode_image(bytes: &[u8]) -> ExecutorResult<DynamicImage> {
    image::load_from_memory(bytes).map_err(|e| ExecutorError::ImageCodec(format!("decode: {e}")))
}

/// Decode an image from base64 text.
pub fn decode_base64(text: &str) -> ExecutorResult<DynamicImage> {
    let bytes = STANDARD
        .decode(text.trim())
        .map_err(|e| ExecutorError::ImageCodec(format!("invalid base64: {e}")))?;
    decode_image(&bytes)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use image::{Rgba, RgbaImage};

    use super::*;

    fn sample_image() -> DynamicImage {
        DynamicImage::ImageRgba8(RgbaImage::from_pixel(8, 6, Rgba([200, 10, 10, 128])))
    }

    #[test]
    fn png_base64_preserves_dimensions_and_pixels() {
        let original = sample_image();
        let text = encode_base64(&original, ImageFormat::Png).unwrap();
        let decoded = decode_base64(&text).unwrap();
        assert_eq!(decoded.to_rgba8(), original.to_rgba8());
    }

    #[test]
    fn jpeg_encoding_accepts_alpha_images() {
        let bytes = encode_image(&sample_image(), ImageFormat::Jpeg).unwrap();
        // JPEG SOI marker.
        assert_eq!(&bytes[..2], &[0xFF, 0xD8]);
        let decoded = decode_image(&bytes).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (8, 6));
    }

    #[test]
    fn invalid_base64_is_codec_error() {
        assert_matches!(decode_base64("%%%"), Err(ExecutorError::ImageCodec(_)));
    }

    #[test]
    fn non_image_bytes_are_codec_error() {
        let text = STANDARD.encode(b"definitely not an image");
        assert_matches!(decode_base64(&text), Err(ExecutorError::ImageCodec(_)));
    }
}
