//! Chroma conversion into the back buffer.
//!
//! One converter per input pixel format turns picture planes into packed
//! RGBA inside the picture region of a back buffer, scaling to the region
//! with nearest-neighbour sampling. Output channels pass through the
//! colour lookup tables, which the management pass rebuilds on gamma or
//! grayscale changes.

use common::{PixelFormat, Rect};

use super::heap::PictureLayout;

/// Gamma and grayscale lookup state.
pub struct ColorTables {
    gamma: [u8; 256],
    grayscale: bool,
}

impl Default for ColorTables {
    fn default() -> Self {
        let mut tables = Self {
            gamma: [0; 256],
            grayscale: false,
        };
        tables.rebuild(1.0, false);
        tables
    }
}

impl ColorTables {
    /// Rebuild the lookup tables for a new gamma exponent and grayscale
    /// toggle.
    pub fn rebuild(&mut self, gamma: f32, grayscale: bool) {
        let exponent = if gamma > 0.0 { 1.0 / gamma } else { 1.0 };
        for (i, entry) in self.gamma.iter_mut().enumerate() {
            let normalised = i as f32 / 255.0;
            *entry = (normalised.powf(exponent) * 255.0).round().clamp(0.0, 255.0) as u8;
        }
        self.grayscale = grayscale;
    }

    #[inline]
    fn map(&self, value: u8) -> u8 {
        self.gamma[value as usize]
    }

    pub fn grayscale(&self) -> bool {
        self.grayscale
    }
}

/// Destination span inside a back buffer.
pub struct DstSpan<'a> {
    pub data: &'a mut [u8],
    pub bytes_per_line: usize,
    pub rect: Rect,
}

/// One entry of the converter table.
pub type ChromaConverter = fn(&PictureLayout, &[u8], &ColorTables, DstSpan<'_>);

/// Converter table: one entry per input pixel format.
pub fn converter_for(pixel: PixelFormat) -> ChromaConverter {
    match pixel {
        PixelFormat::Yuv420 => convert_yuv420,
        PixelFormat::Yuv422 => convert_yuv422,
        PixelFormat::Yuv444 => convert_yuv444,
        PixelFormat::Rgb32 => convert_rgb32,
    }
}

fn convert_yuv420(layout: &PictureLayout, src: &[u8], tables: &ColorTables, dst: DstSpan<'_>) {
    convert_planar(layout, src, tables, dst, |x, y| (x / 2, y / 2));
}

fn convert_yuv422(layout: &PictureLayout, src: &[u8], tables: &ColorTables, dst: DstSpan<'_>) {
    convert_planar(layout, src, tables, dst, |x, y| (x / 2, y));
}

fn convert_yuv444(layout: &PictureLayout, src: &[u8], tables: &ColorTables, dst: DstSpan<'_>) {
    convert_planar(layout, src, tables, dst, |x, y| (x, y));
}

#[inline]
fn clamp_u8(value: i32) -> u8 {
    value.clamp(0, 255) as u8
}

fn convert_planar(
    layout: &PictureLayout,
    src: &[u8],
    tables: &ColorTables,
    dst: DstSpan<'_>,
    uv_map: impl Fn(u32, u32) -> (u32, u32),
) {
    let rect = dst.rect;
    if rect.width == 0 || rect.height == 0 || layout.width == 0 || layout.height == 0 {
        return;
    }

    for out_y in 0..rect.height {
        let src_y = out_y * layout.height / rect.height;
        let row = (rect.y + out_y) as usize * dst.bytes_per_line
            + rect.x as usize * BackPixel::SIZE;
        for out_x in 0..rect.width {
            let src_x = out_x * layout.width / rect.width;
            let luma = src[src_y as usize * layout.width as usize + src_x as usize] as i32;

            let (uv_x, uv_y) = uv_map(src_x, src_y);
            let uv_index = uv_y as usize * layout.chroma_width as usize + uv_x as usize;
            let u = src[layout.u_offset + uv_index] as i32;
            let v = src[layout.v_offset + uv_index] as i32;

            let c = luma - 16;
            let (r, g, b) = if tables.grayscale() {
                let y = clamp_u8((298 * c + 128) >> 8);
                (y, y, y)
            } else {
                let d = u - 128;
                let e = v - 128;
                (
                    clamp_u8((298 * c + 409 * e + 128) >> 8),
                    clamp_u8((298 * c - 100 * d - 208 * e + 128) >> 8),
                    clamp_u8((298 * c + 516 * d + 128) >> 8),
                )
            };

            let offset = row + out_x as usize * BackPixel::SIZE;
            dst.data[offset] = tables.map(r);
            dst.data[offset + 1] = tables.map(g);
            dst.data[offset + 2] = tables.map(b);
            dst.data[offset + 3] = 0xff;
        }
    }
}

fn convert_rgb32(layout: &PictureLayout, src: &[u8], tables: &ColorTables, dst: DstSpan<'_>) {
    let rect = dst.rect;
    if rect.width == 0 || rect.height == 0 || layout.width == 0 || layout.height == 0 {
        return;
    }

    for out_y in 0..rect.height {
        let src_y = out_y * layout.height / rect.height;
        let row = (rect.y + out_y) as usize * dst.bytes_per_line
            + rect.x as usize * BackPixel::SIZE;
        for out_x in 0..rect.width {
            let src_x = out_x * layout.width / rect.width;
            let from = (src_y as usize * layout.width as usize + src_x as usize) * 4;
            let (mut r, mut g, mut b) = (src[from], src[from + 1], src[from + 2]);
            if tables.grayscale() {
                // Integer BT.601 luma weights.
                let luma =
                    ((77 * r as u32 + 150 * g as u32 + 29 * b as u32) >> 8) as u8;
                r = luma;
                g = luma;
                b = luma;
            }
            let offset = row + out_x as usize * BackPixel::SIZE;
            dst.data[offset] = tables.map(r);
            dst.data[offset + 1] = tables.map(g);
            dst.data[offset + 2] = tables.map(b);
            dst.data[offset + 3] = 0xff;
        }
    }
}

/// Marker for the packed output pixel.
pub struct BackPixel;

impl BackPixel {
    pub const SIZE: usize = 4;
}
