use std::io::Cursor;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;

use crate::error::PreviewError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreviewOptions {
    pub max_width: u32,
    pub max_height: u32,
}

impl Default for PreviewOptions {
    fn default() -> Self {
        Self {
            max_width: 100,
            max_height: 100,
        }
    }
}

/// A thumbnail of an upload, PNG encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Preview {
    pub width: u32,
    pub height: u32,
    pub png: Bytes,
}

impl Preview {
    pub fn data_uri(&self) -> String {
        format!("data:image/png;base64,{}", STANDARD.encode(&self.png))
    }
}

/// Decodes `bytes` and renders a thumbnail that fits the bounds while keeping
/// the aspect ratio. The source bytes are only read.
pub fn render_preview(bytes: &[u8], options: PreviewOptions) -> Result<Preview, PreviewError> {
    let decoded =
        image::load_from_memory(bytes).map_err(|err| PreviewError::Decode(err.to_string()))?;
    let thumbnail =
        if decoded.width() <= options.max_width && decoded.height() <= options.max_height {
            decoded
        } else {
            decoded.thumbnail(options.max_width, options.max_height)
        };

    let mut out = Cursor::new(Vec::new());
    thumbnail
        .write_to(&mut out, image::ImageFormat::Png)
        .map_err(|err| PreviewError::Encode(err.to_string()))?;

    Ok(Preview {
        width: thumbnail.width(),
        height: thumbnail.height(),
        png: Bytes::from(out.into_inner()),
    })
}

#[cfg(test)]
pub(crate) fn sample_png(width: u32, height: u32) -> Vec<u8> {
    let image = image::RgbaImage::from_pixel(width, height, image::Rgba([200, 40, 40, 255]));
    let mut out = Cursor::new(Vec::new());
    image::DynamicImage::ImageRgba8(image)
        .write_to(&mut out, image::ImageFormat::Png)
        .expect("encode sample png");
    out.into_inner()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thumbnail_keeps_aspect_ratio_within_bounds() {
        let preview = render_preview(&sample_png(400, 200), PreviewOptions::default())
            .expect("preview");
        assert_eq!((preview.width, preview.height), (100, 50));
        assert!(image::load_from_memory(&preview.png).is_ok());
    }

    #[test]
    fn small_images_are_not_upscaled() {
        let preview = render_preview(&sample_png(20, 10), PreviewOptions::default())
            .expect("preview");
        assert_eq!((preview.width, preview.height), (20, 10));
    }

    #[test]
    fn data_uri_is_png_base64() {
        let preview = render_preview(&sample_png(8, 8), PreviewOptions::default()).expect("preview");
        assert!(preview.data_uri().starts_with("data:image/png;base64,iVBOR"));
    }

    #[test]
    fn garbage_is_a_decode_error() {
        let err = render_preview(b"definitely not an image", PreviewOptions::default())
            .expect_err("should fail");
        assert!(matches!(err, PreviewError::Decode(_)));
    }
}
