//! Encoded desktop regions and cursor images, ready for broadcast.

use crate::vm::surface::Surface;
use cvm_core::messages::{CursorPayload, RectPayload};
use cvm_core::{CvmError, CvmResult, Message, RegionEncoding};
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::{ExtendedColorType, ImageEncoder};

/// A compressed rectangle of the desktop.
#[derive(Debug, Clone, PartialEq)]
pub struct Region {
    pub x: i16,
    pub y: i16,
    pub width: i16,
    pub height: i16,
    pub encoding: RegionEncoding,
    pub data: Vec<u8>,
}

impl Region {
    /// Cut (x, y, w, h) out of `surface` and compress it.
    pub fn encode(
        surface: &Surface,
        x: u16,
        y: u16,
        w: u16,
        h: u16,
        encoding: RegionEncoding,
        jpeg_quality: u8,
    ) -> CvmResult<Self> {
        let sub = surface.sub_surface(x, y, w, h)?;
        let data = sub.encode(encoding, jpeg_quality)?;
        Ok(Self {
            x: to_i16(x)?,
            y: to_i16(y)?,
            width: to_i16(w)?,
            height: to_i16(h)?,
            encoding,
            data,
        })
    }

    pub fn into_message(self) -> Message {
        Message::Rect(RectPayload {
            x: self.x,
            y: self.y,
            width: self.width,
            height: self.height,
            encoding: self.encoding,
            data: self.data,
        })
    }
}

fn to_i16(v: u16) -> CvmResult<i16> {
    i16::try_from(v).map_err(|_| CvmError::Surface(format!("coordinate {v} exceeds i16")))
}

/// Cursor shape as straight RGBA.
#[derive(Debug, Clone, PartialEq)]
pub struct CursorImage {
    pub hotspot_x: u16,
    pub hotspot_y: u16,
    pub width: u16,
    pub height: u16,
    pub rgba: Vec<u8>,
}

impl CursorImage {
    /// Combine RFB cursor pixels with its 1-bit transparency mask
    /// (rows padded to whole bytes, MSB first).
    pub fn from_rfb(pixels: &Surface, mask: &[u8], hotspot_x: u16, hotspot_y: u16) -> Self {
        let width = pixels.width();
        let height = pixels.height();
        let mask_row = (width as usize).div_ceil(8);
        let rgb = pixels.to_rgb8();
        let mut rgba = Vec::with_capacity(width as usize * height as usize * 4);
        for y in 0..height as usize {
            for x in 0..width as usize {
                let i = (y * width as usize + x) * 3;
                let opaque = mask
                    .get(y * mask_row + x / 8)
                    .map(|b| b & (0x80 >> (x % 8)) != 0)
                    .unwrap_or(false);
                rgba.extend_from_slice(&rgb[i..i + 3]);
                rgba.push(if opaque { 0xff } else { 0 });
            }
        }
        Self {
            hotspot_x,
            hotspot_y,
            width,
            height,
            rgba,
        }
    }

    pub fn to_message(&self) -> Message {
        Message::Cursor(CursorPayload {
            hotspot_x: self.hotspot_x,
            hotspot_y: self.hotspot_y,
            width: self.width,
            height: self.height,
            data: self.rgba.clone(),
        })
    }
}

/// Compress packed RGB8 pixels. JPEG quality is clamped to 1..=100.
pub fn encode_rgb8(
    rgb: &[u8],
    width: u32,
    height: u32,
    encoding: RegionEncoding,
    jpeg_quality: u8,
) -> CvmResult<Vec<u8>> {
    let mut buf = Vec::new();
    let result = match encoding {
        RegionEncoding::Png => PngEncoder::new(&mut buf).write_image(
            rgb,
            width,
            height,
            ExtendedColorType::Rgb8,
        ),
        RegionEncoding::Jpeg => JpegEncoder::new_with_quality(&mut buf, jpeg_quality.clamp(1, 100))
            .write_image(rgb, width, height, ExtendedColorType::Rgb8),
    };
    result.map_err(|e| CvmError::Encode(format!("{encoding:?} encode failed: {e}")))?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::surface::PixelFormat;

    fn gradient(w: u16, h: u16) -> Surface {
        let mut s = Surface::new(w, h, PixelFormat::Bpp32).unwrap();
        let mut px = Vec::new();
        for y in 0..h {
            for x in 0..w {
                let r = (x * 255 / w.max(1)) as u8;
                let g = (y * 255 / h.max(1)) as u8;
                px.extend_from_slice(&[128, g, r, 0]);
            }
        }
        s.write_pixels(0, 0, w, h, &px).unwrap();
        s
    }

    #[test]
    fn png_region_is_lossless() {
        let s = gradient(32, 16);
        let region = Region::encode(&s, 4, 2, 16, 8, RegionEncoding::Png, 75).unwrap();
        assert_eq!((region.x, region.y, region.width, region.height), (4, 2, 16, 8));

        let decoded = image::load_from_memory(&region.data).unwrap().to_rgb8();
        let expected = s.sub_surface(4, 2, 16, 8).unwrap().to_rgb8();
        assert_eq!(decoded.as_raw(), &expected);
    }

    #[test]
    fn jpeg_region_is_close() {
        let s = gradient(32, 32);
        let region = Region::encode(&s, 0, 0, 32, 32, RegionEncoding::Jpeg, 90).unwrap();
        assert_eq!(&region.data[..2], &[0xff, 0xd8]);

        let decoded = image::load_from_memory(&region.data).unwrap().to_rgb8();
        let expected = s.to_rgb8();
        assert_eq!(decoded.as_raw().len(), expected.len());
        let total: u64 = decoded
            .as_raw()
            .iter()
            .zip(&expected)
            .map(|(a, b)| (*a as i16 - *b as i16).unsigned_abs() as u64)
            .sum();
        let mean = total as f64 / expected.len() as f64;
        assert!(mean < 8.0, "mean abs error {mean}");
    }

    #[test]
    fn region_outside_surface_fails() {
        let s = gradient(8, 8);
        assert!(Region::encode(&s, 4, 4, 8, 8, RegionEncoding::Png, 75).is_err());
    }

    #[test]
    fn cursor_mask_sets_alpha() {
        let mut px = Surface::new(2, 1, PixelFormat::Bpp32).unwrap();
        px.write_pixels(0, 0, 2, 1, &[0, 0, 255, 0, 255, 0, 0, 0]).unwrap();
        let cursor = CursorImage::from_rfb(&px, &[0b1000_0000], 1, 0);
        assert_eq!(cursor.rgba, vec![255, 0, 0, 255, 0, 0, 255, 0]);
        match cursor.to_message() {
            Message::Cursor(c) => assert_eq!((c.hotspot_x, c.width), (1, 2)),
            other => panic!("unexpected {}", other.kind()),
        }
    }
}
