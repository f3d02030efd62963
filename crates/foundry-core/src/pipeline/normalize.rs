//! Normalisation of provider output: decode, RGBA8, resize to target.

use std::io::Cursor;

use image::imageops::{self, FilterType};
use image::{ImageFormat, RgbaImage};

use crate::domain::TargetSize;
use crate::error::ProviderError;

/// Decode whatever a provider returned and bring it to `size`.
///
/// Undecodable bytes are the provider's fault, so the error is attributed to
/// `provider` as a malformed response.
pub fn normalize(bytes: &[u8], size: TargetSize, provider: &str) -> Result<RgbaImage, ProviderError> {
    let decoded = image::load_from_memory(bytes).map_err(|e| ProviderError::MalformedResponse {
        provider: provider.to_string(),
        message: format!("undecodable image: {e}"),
    })?;
    let rgba = decoded.to_rgba8();
    if rgba.dimensions() == (size.width, size.height) {
        return Ok(rgba);
    }
    Ok(imageops::resize(&rgba, size.width, size.height, FilterType::Lanczos3))
}

pub fn encode_png(image: &RgbaImage) -> Result<Vec<u8>, image::ImageError> {
    let mut bytes = Vec::new();
    image.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)?;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    #[test]
    fn resizes_to_target() {
        let source = RgbaImage::from_pixel(256, 256, Rgba([10, 20, 30, 255]));
        let png = encode_png(&source).unwrap();

        let out = normalize(&png, TargetSize::new(64, 64), "fake").unwrap();
        assert_eq!(out.dimensions(), (64, 64));
        let px = out.get_pixel(10, 10).0;
        for (got, want) in px.iter().zip([10u8, 20, 30, 255]) {
            assert!(got.abs_diff(want) <= 1, "{px:?}");
        }
    }

    #[test]
    fn matching_size_is_kept() {
        let source = RgbaImage::from_pixel(32, 32, Rgba([1, 2, 3, 4]));
        let png = encode_png(&source).unwrap();
        assert_eq!(normalize(&png, TargetSize::new(32, 32), "fake").unwrap(), source);
    }

    #[test]
    fn garbage_is_a_malformed_response() {
        let err = normalize(b"<html>nope</html>", TargetSize::new(8, 8), "fake").unwrap_err();
        assert!(matches!(err, ProviderError::MalformedResponse { ref provider, .. } if provider == "fake"));
    }
}
