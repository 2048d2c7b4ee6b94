use std::path::Path;

use anyhow::{Context, Result};
use image::imageops::{self, FilterType};
use image::{ImageReader, RgbaImage};
use sha2::{Digest, Sha256};

pub fn load_image(path: impl AsRef<Path>) -> Result<RgbaImage> {
    let path = path.as_ref();
    let img = ImageReader::open(path)
        .with_context(|| format!("opening {path:?}"))?
        .decode()
        .with_context(|| format!("decoding {path:?}"))?;
    Ok(img.into_rgba8())
}

pub fn save_image(img: &RgbaImage, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    img.save_with_format(path, image::ImageFormat::Png)
        .with_context(|| format!("saving {path:?}"))
}

/// Copies a region that may extend past the image, outside pixels stay
/// transparent black.
pub fn crop_image(img: &RgbaImage, x: i32, y: i32, w: i32, h: i32) -> RgbaImage {
    let mut out = RgbaImage::new(w.max(0) as u32, h.max(0) as u32);
    let (iw, ih) = (img.width() as i32, img.height() as i32);

    for (ox, oy, pixel) in out.enumerate_pixels_mut() {
        let sx = x + ox as i32;
        let sy = y + oy as i32;
        if sx >= 0 && sy >= 0 && sx < iw && sy < ih {
            *pixel = *img.get_pixel(sx as u32, sy as u32);
        }
    }

    out
}

pub fn resize_image(img: &RgbaImage, w: u32, h: u32) -> RgbaImage {
    imageops::resize(img, w, h, FilterType::Triangle)
}

/// Hex sha256 of the raw pixel bytes.
pub fn image_digest(img: &RgbaImage) -> String {
    let hash = Sha256::digest(img.as_raw());
    hash.iter().map(|b| format!("{b:02x}")).collect()
}
