//! CPU-bound image work. Call [`render_all_blocking`] from async code so
//! resizing runs on the blocking pool.

use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::DynamicImage;

use crate::artwork::SizeVariant;
use crate::error::{ArtworkError, Result};

/// Every variant is encoded as JPEG.
pub const OUTPUT_CONTENT_TYPE: &str = "image/jpeg";
/// File extension of encoded variants.
pub const OUTPUT_EXTENSION: &str = "jpg";

/// One encoded variant ready to be written.
#[derive(Debug, Clone)]
pub struct RenderedVariant {
    /// Target variant.
    pub variant: SizeVariant,
    /// Encoded JPEG.
    pub bytes: Vec<u8>,
    /// Rendered width.
    pub width: u32,
    /// Rendered height.
    pub height: u32,
}

/// Decodes any supported format.
pub fn decode(bytes: &[u8]) -> Result<DynamicImage> {
    image::load_from_memory(bytes)
        .map_err(|e| ArtworkError::Fetch(format!("Unreadable image payload: {e}")))
}

/// Center-crops sized variants to a square; the original keeps its aspect
/// ratio and is only shrunk when it exceeds the maximum dimension.
pub fn render(image: &DynamicImage, variant: SizeVariant) -> Result<RenderedVariant> {
    let resized = match variant.dimension() {
        Some(edge) => image.resize_to_fill(edge, edge, FilterType::Lanczos3),
        None => {
            let max = SizeVariant::MAX_DIMENSION;
            if image.width() > max || image.height() > max {
                image.resize(max, max, FilterType::Lanczos3)
            } else {
                image.clone()
            }
        }
    };

    let rgb = resized.to_rgb8();
    let mut bytes = Vec::new();
    JpegEncoder::new_with_quality(&mut bytes, variant.jpeg_quality()).encode_image(&rgb)?;

    Ok(RenderedVariant {
        variant,
        bytes,
        width: rgb.width(),
        height: rgb.height(),
    })
}

/// Decodes once and renders every requested variant.
pub fn render_all(source: &[u8], variants: &[SizeVariant]) -> Result<Vec<RenderedVariant>> {
    let image = decode(source)?;
    variants.iter().map(|variant| render(&image, *variant)).collect()
}

/// [`render_all`] on the blocking pool.
pub async fn render_all_blocking(
    source: Vec<u8>,
    variants: Vec<SizeVariant>,
) -> Result<Vec<RenderedVariant>> {
    tokio::task::spawn_blocking(move || render_all(&source, &variants))
        .await
        .map_err(|e| ArtworkError::Internal(format!("Image task failed: {e}")))?
}

/// Solid-colour PNG used by tests and demos.
pub fn sample_png(width: u32, height: u32) -> Vec<u8> {
    let image = image::RgbImage::from_pixel(width, height, image::Rgb([200, 40, 90]));
    let mut bytes = std::io::Cursor::new(Vec::new());
    // Encoding an in-memory RGB buffer to PNG cannot fail.
    let _ = DynamicImage::ImageRgb8(image).write_to(&mut bytes, image::ImageFormat::Png);
    bytes.into_inner()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_square_variants_and_caps_original() {
        let source = sample_png(300, 200);
        let rendered = render_all(&source, &SizeVariant::ALL).unwrap();
        assert_eq!(rendered.len(), 5);

        for variant in rendered {
            match variant.variant.dimension() {
                Some(edge) => {
                    assert_eq!((variant.width, variant.height), (edge, edge));
                }
                None => assert_eq!((variant.width, variant.height), (300, 200)),
            }
            assert_eq!(&variant.bytes[..2], &[0xFF, 0xD8]);
        }
    }

    #[test]
    fn undecodable_payload_is_a_fetch_error() {
        let err = render_all(b"<html>nope</html>", &[SizeVariant::Small]).unwrap_err();
        assert_eq!(err.kind(), "fetch");
    }
}
