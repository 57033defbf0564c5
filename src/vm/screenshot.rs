//! Screendump post-processing.
//!
//! The emulator writes raw PPM; callers want a bounded PNG. Resizing is a
//! nearest-neighbour thumbnail that preserves aspect ratio within
//! `max_dim`; a `max_dim` of zero keeps the decoded dimensions.

use image::imageops::FilterType;
use image::ImageFormat;

use crate::{Error, Result};

/// Convert a PPM screendump into PNG bytes, thumbnailed within `max_dim`.
pub fn ppm_to_png(ppm: &[u8], max_dim: u32) -> Result<Vec<u8>> {
    let decoded = image::load_from_memory(ppm)
        .map_err(|e| Error::Validation(format!("bad screendump: {}", e)))?;

    let img = if max_dim > 0 && (decoded.width() > max_dim || decoded.height() > max_dim) {
        decoded.resize(max_dim, max_dim, FilterType::Nearest)
    } else {
        decoded
    };

    let mut png = std::io::Cursor::new(Vec::new());
    img.write_to(&mut png, ImageFormat::Png)
        .map_err(|e| Error::Validation(format!("png encode: {}", e)))?;
    Ok(png.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A synthetic P6 PPM of the given size.
    fn ppm(width: u32, height: u32) -> Vec<u8> {
        let mut data = format!("P6\n{} {}\n255\n", width, height).into_bytes();
        data.extend(std::iter::repeat(0x7fu8).take((width * height * 3) as usize));
        data
    }

    fn png_dims(png: &[u8]) -> (u32, u32) {
        let img = image::load_from_memory(png).unwrap();
        (img.width(), img.height())
    }

    #[test]
    fn zero_max_dim_keeps_native_size() {
        let png = ppm_to_png(&ppm(64, 48), 0).unwrap();
        assert_eq!(png_dims(&png), (64, 48));
    }

    #[test]
    fn thumbnail_preserves_aspect_ratio() {
        let png = ppm_to_png(&ppm(640, 480), 100).unwrap();
        assert_eq!(png_dims(&png), (100, 75));
    }

    #[test]
    fn small_images_are_not_upscaled() {
        let png = ppm_to_png(&ppm(32, 32), 100).unwrap();
        assert_eq!(png_dims(&png), (32, 32));
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(ppm_to_png(b"not a ppm", 0).is_err());
    }
}
