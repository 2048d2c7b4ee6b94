//! Pixel buffer (de)serialization.
//!
//! Images cross the bridge as row-major `row x col x depth` byte buffers,
//! either base64 encoded or as JSON arrays.

use anyhow::Result;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use image::{RgbImage, RgbaImage};
use ndarray::{Array3, s};
use serde_json::Value;

use crate::error::BridgeError;

pub type PixelArray = Array3<u8>;

pub fn base64_to_image(text: &str, row: usize, col: usize, depth: usize) -> Result<PixelArray> {
    let bytes = BASE64.decode(text.trim()).map_err(BridgeError::from)?;
    reshape(bytes, row, col, depth)
}

pub fn image_to_base64(image: &PixelArray) -> String {
    // iter() walks in logical order, so non-standard layouts still flatten row-major
    let bytes: Vec<u8> = image.iter().copied().collect();
    BASE64.encode(bytes)
}

/// Accepts a flat `[v, v, ...]` array or a nested `[row][col][depth]` one.
pub fn json_to_image(text: &str, row: usize, col: usize, depth: usize) -> Result<PixelArray> {
    let value: Value = serde_json::from_str(text).map_err(BridgeError::from)?;
    json_value_to_image(&value, row, col, depth)
}

/// [`json_to_image`] on an already parsed value.
pub fn json_value_to_image(
    value: &Value,
    row: usize,
    col: usize,
    depth: usize,
) -> Result<PixelArray> {
    let items = match value {
        Value::Array(items) => items,
        other => {
            return Err(BridgeError::Json(serde::de::Error::custom(format!(
                "expected an array, got {other}"
            )))
            .into());
        }
    };

    // nested input only has `row` entries at the top
    let nested = !items.is_empty() && items.iter().all(Value::is_array);
    let top = if nested { row } else { expected_len(row, col, depth, items.len())? };
    if items.len() != top {
        return Err(shape_error(row, col, depth, items.len()).into());
    }

    let mut bytes = Vec::new();
    if nested {
        for line in items {
            let pixels = as_array(line, col, (row, col, depth))?;
            for pixel in pixels {
                let channels = as_array(pixel, depth, (row, col, depth))?;
                for c in channels {
                    bytes.push(to_byte(c)?);
                }
            }
        }
    } else {
        bytes.reserve_exact(items.len());
        for v in items {
            bytes.push(to_byte(v)?);
        }
    }

    reshape(bytes, row, col, depth)
}

pub fn rgba_to_array(img: &RgbaImage) -> PixelArray {
    let (w, h) = img.dimensions();
    Array3::from_shape_vec((h as usize, w as usize, 4), img.as_raw().clone())
        .unwrap_or_else(|_| Array3::zeros((h as usize, w as usize, 4)))
}

pub fn rgb_to_array(img: &RgbImage) -> PixelArray {
    let (w, h) = img.dimensions();
    Array3::from_shape_vec((h as usize, w as usize, 3), img.as_raw().clone())
        .unwrap_or_else(|_| Array3::zeros((h as usize, w as usize, 3)))
}

pub fn array_to_rgb(image: &PixelArray) -> Result<RgbImage> {
    let (h, w, _) = image.dim();
    let rgb = to_rgb(image)?;
    RgbImage::from_raw(w as u32, h as u32, rgb.iter().copied().collect())
        .ok_or_else(|| shape_error(h, w, 3, rgb.len()).into())
}

/// Converts any supported depth to an RGBA image, gray and RGB get an opaque alpha.
pub fn array_to_rgba(image: &PixelArray) -> Result<RgbaImage> {
    let (h, w, depth) = image.dim();
    let rgb = to_rgb(image)?;
    let mut out = RgbaImage::new(w as u32, h as u32);
    for (x, y, pixel) in out.enumerate_pixels_mut() {
        let (r, c) = (y as usize, x as usize);
        let alpha = if depth == 4 { image[[r, c, 3]] } else { 255 };
        *pixel = image::Rgba([rgb[[r, c, 0]], rgb[[r, c, 1]], rgb[[r, c, 2]], alpha]);
    }
    Ok(out)
}

/// Gray is replicated into 3 channels, alpha is dropped.
pub fn to_rgb(image: &PixelArray) -> Result<PixelArray> {
    let (h, w, depth) = image.dim();
    match depth {
        1 => Ok(Array3::from_shape_fn((h, w, 3), |(y, x, _)| image[[y, x, 0]])),
        3 | 4 => Ok(image.slice(s![.., .., 0..3]).to_owned()),
        d => Err(BridgeError::UnsupportedDepth(d).into()),
    }
}

fn reshape(bytes: Vec<u8>, row: usize, col: usize, depth: usize) -> Result<PixelArray> {
    let actual = bytes.len();
    if actual != expected_len(row, col, depth, actual)? {
        return Err(shape_error(row, col, depth, actual).into());
    }
    Array3::from_shape_vec((row, col, depth), bytes)
        .map_err(|_| shape_error(row, col, depth, actual).into())
}

/// `row * col * depth`, a product too large for memory is a shape error.
fn expected_len(
    row: usize,
    col: usize,
    depth: usize,
    actual: usize,
) -> Result<usize, BridgeError> {
    row.checked_mul(col)
        .and_then(|n| n.checked_mul(depth))
        .ok_or_else(|| shape_error(row, col, depth, actual))
}

fn shape_error(row: usize, col: usize, depth: usize, actual: usize) -> BridgeError {
    BridgeError::Shape {
        expected: (row, col, depth),
        actual,
    }
}

fn as_array(
    value: &Value,
    len: usize,
    expected: (usize, usize, usize),
) -> Result<&Vec<Value>, BridgeError> {
    match value {
        Value::Array(items) if items.len() == len => Ok(items),
        Value::Array(items) => Err(BridgeError::Shape {
            expected,
            actual: items.len(),
        }),
        _ => Err(BridgeError::Shape {
            expected,
            actual: 1,
        }),
    }
}

fn to_byte(value: &Value) -> Result<u8, BridgeError> {
    let v = value
        .as_f64()
        .ok_or_else(|| BridgeError::Json(serde::de::Error::custom(format!("{value} is not a number"))))?;
    if v.fract() != 0. || !(0. ..=255.).contains(&v) {
        return Err(BridgeError::PixelRange(v));
    }
    Ok(v as u8)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> PixelArray {
        Array3::from_shape_fn((2, 3, 4), |(y, x, c)| (y * 12 + x * 4 + c) as u8)
    }

    #[test]
    fn base64_round_trip_keeps_layout() {
        let image = sample();
        let text = image_to_base64(&image);
        let decoded = base64_to_image(&text, 2, 3, 4).unwrap();
        assert_eq!(decoded, image);
        assert_eq!(decoded[[1, 2, 3]], 23);
    }

    #[test]
    fn base64_rejects_wrong_shape() {
        let text = image_to_base64(&sample());
        let err = base64_to_image(&text, 3, 3, 4).unwrap_err();
        match err.downcast_ref::<BridgeError>() {
            Some(BridgeError::Shape { expected, actual }) => {
                assert_eq!(*expected, (3, 3, 4));
                assert_eq!(*actual, 24);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn base64_rejects_garbage() {
        let err = base64_to_image("not base64!!", 1, 1, 1).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BridgeError>(),
            Some(BridgeError::Base64(_))
        ));
    }

    #[test]
    fn json_accepts_flat_and_nested() {
        let flat = json_to_image("[1, 2, 3, 4, 5, 6]", 1, 2, 3).unwrap();
        let nested = json_to_image("[[[1, 2, 3], [4, 5, 6]]]", 1, 2, 3).unwrap();
        assert_eq!(flat, nested);
        assert_eq!(nested[[0, 1, 0]], 4);
    }

    #[test]
    fn json_rejects_ragged_and_out_of_range() {
        assert!(json_to_image("[[[1, 2, 3], [4, 5]]]", 1, 2, 3).is_err());
        let err = json_to_image("[1, 256]", 1, 1, 2).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BridgeError>(),
            Some(BridgeError::PixelRange(_))
        ));
    }

    #[test]
    fn to_rgb_handles_gray_and_alpha() {
        let gray = Array3::from_elem((2, 2, 1), 7u8);
        let rgb = to_rgb(&gray).unwrap();
        assert_eq!(rgb.dim(), (2, 2, 3));
        assert!(rgb.iter().all(|v| *v == 7));

        let rgba = sample();
        let rgb = to_rgb(&rgba).unwrap();
        assert_eq!(rgb.dim(), (2, 3, 3));
        assert_eq!(rgb[[1, 2, 2]], rgba[[1, 2, 2]]);

        assert!(to_rgb(&Array3::zeros((1, 1, 2))).is_err());
    }

    #[test]
    fn rgba_image_conversion() {
        let mut img = RgbaImage::new(3, 2);
        img.put_pixel(2, 1, image::Rgba([1, 2, 3, 4]));
        let arr = rgba_to_array(&img);
        assert_eq!(arr.dim(), (2, 3, 4));
        assert_eq!(arr[[1, 2, 3]], 4);
        assert_eq!(array_to_rgba(&arr).unwrap(), img);
    }

    #[test]
    fn huge_dimensions_are_shape_errors() {
        let huge = usize::MAX / 2 + 1;
        for err in [
            base64_to_image("AAAA", huge, huge, 1).unwrap_err(),
            json_to_image("[1, 2, 3]", huge, 2, 3).unwrap_err(),
            json_to_image("[[[1, 2, 3]]]", 1, huge, usize::MAX).unwrap_err(),
            json_to_image("[1, 2, 3]", usize::MAX, usize::MAX, usize::MAX).unwrap_err(),
        ] {
            assert!(
                matches!(err.downcast_ref::<BridgeError>(), Some(BridgeError::Shape { .. })),
                "unexpected error {err:?}"
            );
        }
    }

    #[test]
    fn json_length_is_checked_before_conversion() {
        // 256 would be a range error, the length mismatch is reported first
        let err = json_to_image("[1, 2, 256]", 1, 2, 1).unwrap_err();
        match err.downcast_ref::<BridgeError>() {
            Some(BridgeError::Shape { expected, actual }) => {
                assert_eq!(*expected, (1, 2, 1));
                assert_eq!(*actual, 3);
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(json_to_image("[]", 1, 1, 1).is_err());
        assert_eq!(json_to_image("[]", 0, 4, 3).unwrap().dim(), (0, 4, 3));
    }

    #[test]
    fn parsed_values_decode_like_text() {
        let value: Value = serde_json::from_str("[[[9], [8]], [[7], [6]]]").unwrap();
        let image = json_value_to_image(&value, 2, 2, 1).unwrap();
        assert_eq!(image, json_to_image(&value.to_string(), 2, 2, 1).unwrap());
        assert_eq!(image[[1, 0, 0]], 7);
        assert!(json_value_to_image(&Value::from(7), 1, 1, 1).is_err());
    }
}
