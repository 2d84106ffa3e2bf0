/// Client-side image recompression
///
/// Large photos are downscaled to a maximum dimension and re-encoded as
/// JPEG. The result is only used when it is actually smaller, and images
/// with an alpha channel are never converted.
use image::{codecs::jpeg::JpegEncoder, imageops::FilterType, GenericImageView};

/// Types the decoder handles
const COMPRESSIBLE: [&str; 3] = ["image/jpeg", "image/png", "image/webp"];

/// Compressed output
#[derive(Debug, Clone, PartialEq)]
pub struct Compressed {
    pub data: Vec<u8>,
    pub mime_type: String,
}

pub fn is_compressible(mime_type: &str) -> bool {
    COMPRESSIBLE.contains(&mime_type.to_ascii_lowercase().as_str())
}

/// Downscale and re-encode; `None` when the original should be kept
pub fn compress_image(data: &[u8], mime_type: &str, max_dimension: u32, quality: u8) -> Option<Compressed> {
    if !is_compressible(mime_type) {
        return None;
    }

    let img = match image::load_from_memory(data) {
        Ok(img) => img,
        Err(e) => {
            tracing::warn!("Failed to decode image for compression: {}", e);
            return None;
        }
    };

    // JPEG has no alpha channel
    if img.color().has_alpha() {
        tracing::debug!("Keeping original image with transparency");
        return None;
    }

    let (width, height) = img.dimensions();
    let img = if width > max_dimension || height > max_dimension {
        img.resize(max_dimension, max_dimension, FilterType::Lanczos3)
    } else {
        img
    };

    let mut buf = Vec::new();
    let encoder = JpegEncoder::new_with_quality(&mut buf, quality.clamp(1, 100));
    if let Err(e) = img.to_rgb8().write_with_encoder(encoder) {
        tracing::warn!("Failed to encode compressed image: {}", e);
        return None;
    }

    if buf.len() >= data.len() {
        return None;
    }

    Some(Compressed {
        data: buf,
        mime_type: "image/jpeg".to_string(),
    })
}
