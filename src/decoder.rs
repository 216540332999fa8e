//! Icon bitmap decoding
//!
//! Default `IconDecoder` backed by the `image` crate, plus generation of the
//! process-placeholder default icon.

use image::imageops::FilterType;
use image::{Rgba, RgbaImage};
use tracing::debug;

use crate::interface::IconDecoder;

/// Decoder using `image::load_from_memory`, resized to the requested
/// dimensions when they differ from the source.
pub struct ImageCrateDecoder;

impl IconDecoder for ImageCrateDecoder {
    fn decode(&self, data: &[u8], size: (u32, u32)) -> Option<RgbaImage> {
        if data.is_empty() || size.0 == 0 || size.1 == 0 {
            return None;
        }
        let decoded = match image::load_from_memory(data) {
            Ok(decoded) => decoded.to_rgba8(),
            Err(err) => {
                debug!("icon bytes failed to decode: {}", err);
                return None;
            }
        };
        if decoded.dimensions() == size {
            return Some(decoded);
        }
        Some(image::imageops::resize(
            &decoded,
            size.0,
            size.1,
            FilterType::Triangle,
        ))
    }
}

const DEFAULT_FILL: Rgba<u8> = Rgba([0xc8, 0xc8, 0xc8, 0xff]);
const DEFAULT_BORDER: Rgba<u8> = Rgba([0x8c, 0x8c, 0x8c, 0xff]);

/// Placeholder returned whenever no real icon is known: a light-gray square
/// with a darker one-pixel border.
pub(crate) fn generate_default_icon(size: (u32, u32)) -> RgbaImage {
    let (width, height) = (size.0.max(1), size.1.max(1));
    let mut image = RgbaImage::from_pixel(width, height, DEFAULT_FILL);
    for x in 0..width {
        image.put_pixel(x, 0, DEFAULT_BORDER);
        image.put_pixel(x, height - 1, DEFAULT_BORDER);
    }
    for y in 0..height {
        image.put_pixel(0, y, DEFAULT_BORDER);
        image.put_pixel(width - 1, y, DEFAULT_BORDER);
    }
    image
}
