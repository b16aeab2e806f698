//! In-memory pixel buffers for the upstream desktop and cursor.
//!
//! A surface is a tightly packed row-major buffer (`stride == width * bpp`).
//! Pixels are stored in the little-endian true-colour layout the upstream
//! client asks the VNC server for, so framebuffer rectangles can be copied in
//! without conversion.

use crate::vm::region;
use cvm_core::{CvmError, CvmResult, RegionEncoding};

/// Pixel layout of a surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// RGB565, little-endian.
    Bpp16,
    /// Packed B, G, R.
    Bpp24,
    /// B, G, R, padding (little-endian `0x00RRGGBB`).
    Bpp32,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            Self::Bpp16 => 2,
            Self::Bpp24 => 3,
            Self::Bpp32 => 4,
        }
    }

    /// Expand one pixel to 8-bit R, G, B.
    fn rgb(self, px: &[u8]) -> [u8; 3] {
        match self {
            Self::Bpp16 => {
                let v = u16::from_le_bytes([px[0], px[1]]);
                let r = ((v >> 11) & 0x1f) as u8;
                let g = ((v >> 5) & 0x3f) as u8;
                let b = (v & 0x1f) as u8;
                [(r << 3) | (r >> 2), (g << 2) | (g >> 4), (b << 3) | (b >> 2)]
            }
            Self::Bpp24 | Self::Bpp32 => [px[2], px[1], px[0]],
        }
    }
}

/// A width × height pixel buffer.
#[derive(Debug, Clone)]
pub struct Surface {
    width: u16,
    height: u16,
    format: PixelFormat,
    stride: usize,
    data: Vec<u8>,
}

impl Surface {
    /// Allocate a zeroed surface. Allocation failure is reported, not fatal.
    pub fn new(width: u16, height: u16, format: PixelFormat) -> CvmResult<Self> {
        let stride = width as usize * format.bytes_per_pixel();
        let len = stride * height as usize;
        let mut data = Vec::new();
        data.try_reserve_exact(len).map_err(|e| {
            CvmError::Surface(format!("cannot allocate {width}x{height} surface: {e}"))
        })?;
        data.resize(len, 0);
        Ok(Self {
            width,
            height,
            format,
            stride,
            data,
        })
    }

    pub fn width(&self) -> u16 {
        self.width
    }

    pub fn height(&self) -> u16 {
        self.height
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    /// Bytes per row.
    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Total byte length of the pixel buffer.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn check_rect(&self, x: u16, y: u16, w: u16, h: u16) -> CvmResult<()> {
        if x as u32 + w as u32 > self.width as u32 || y as u32 + h as u32 > self.height as u32 {
            return Err(CvmError::Surface(format!(
                "rect {w}x{h}+{x}+{y} outside {}x{} surface",
                self.width, self.height
            )));
        }
        Ok(())
    }

    /// Copy tightly packed rows (`w * bpp` bytes each) into the rectangle at (x, y).
    pub fn write_pixels(&mut self, x: u16, y: u16, w: u16, h: u16, src: &[u8]) -> CvmResult<()> {
        self.check_rect(x, y, w, h)?;
        let bpp = self.format.bytes_per_pixel();
        let row_len = w as usize * bpp;
        if src.len() < row_len * h as usize {
            return Err(CvmError::Surface(format!(
                "pixel data too short: {} bytes for {w}x{h}",
                src.len()
            )));
        }
        for row in 0..h as usize {
            let dst_off = (y as usize + row) * self.stride + x as usize * bpp;
            let src_off = row * row_len;
            self.data[dst_off..dst_off + row_len].copy_from_slice(&src[src_off..src_off + row_len]);
        }
        Ok(())
    }

    /// Extract a rectangle as a new surface of the same format.
    pub fn sub_surface(&self, x: u16, y: u16, w: u16, h: u16) -> CvmResult<Surface> {
        self.check_rect(x, y, w, h)?;
        let mut out = Surface::new(w, h, self.format)?;
        let bpp = self.format.bytes_per_pixel();
        let row_len = w as usize * bpp;
        for row in 0..h as usize {
            let src_off = (y as usize + row) * self.stride + x as usize * bpp;
            let dst_off = row * out.stride;
            out.data[dst_off..dst_off + row_len]
                .copy_from_slice(&self.data[src_off..src_off + row_len]);
        }
        Ok(out)
    }

    /// Blit `src` onto this surface at (x, y). Formats must match.
    pub fn draw(&mut self, src: &Surface, x: u16, y: u16) -> CvmResult<()> {
        if src.format != self.format {
            return Err(CvmError::Surface(format!(
                "format mismatch: {:?} onto {:?}",
                src.format, self.format
            )));
        }
        self.write_pixels(x, y, src.width, src.height, &src.data)
    }

    /// Copy a rectangle within the surface. Source and destination may overlap.
    pub fn copy_rect(
        &mut self,
        src_x: u16,
        src_y: u16,
        x: u16,
        y: u16,
        w: u16,
        h: u16,
    ) -> CvmResult<()> {
        let block = self.sub_surface(src_x, src_y, w, h)?;
        self.draw(&block, x, y)
    }

    /// Convert to packed 8-bit RGB.
    pub fn to_rgb8(&self) -> Vec<u8> {
        let bpp = self.format.bytes_per_pixel();
        let mut out = Vec::with_capacity(self.width as usize * self.height as usize * 3);
        for px in self.data.chunks_exact(bpp) {
            out.extend_from_slice(&self.format.rgb(px));
        }
        out
    }

    /// Compress the whole surface with the given region encoding.
    pub fn encode(&self, encoding: RegionEncoding, jpeg_quality: u8) -> CvmResult<Vec<u8>> {
        region::encode_rgb8(
            &self.to_rgb8(),
            self.width as u32,
            self.height as u32,
            encoding,
            jpeg_quality,
        )
    }
}
