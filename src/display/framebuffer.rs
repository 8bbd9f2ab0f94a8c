//! 1-bit framebuffer and the clipped canvas widgets draw through.
//!
//! Convention throughout the widget layer: 0 = background, 1 = foreground.
//! Panel polarity is the driver's problem.

use embedded_graphics::pixelcolor::BinaryColor;
use embedded_graphics::prelude::{Dimensions, DrawTarget, Point, Size};
use embedded_graphics::primitives::Rectangle;
use embedded_graphics::Pixel;

use super::Rect;

/// Packed 1-bit raster, row-major, MSB first inside each byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Framebuffer {
    width: u32,
    height: u32,
    stride: usize,
    data: Vec<u8>,
}

impl Framebuffer {
    /// All-background buffer of the given size.
    pub fn new(width: u32, height: u32) -> Framebuffer {
        let stride = width.div_ceil(8) as usize;
        Framebuffer {
            width,
            height,
            stride,
            data: vec![0; stride * height as usize],
        }
    }

    /// Panel width in pixels.
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Panel height in pixels.
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Bytes per row.
    pub fn stride(&self) -> usize {
        self.stride
    }

    /// Raw bytes, row-major.
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    /// Reset every pixel to background.
    pub fn clear(&mut self) {
        self.data.fill(0);
    }

    /// Pixel accessor; out-of-bounds reads are background.
    pub fn get(&self, x: u32, y: u32) -> bool {
        if x >= self.width || y >= self.height {
            return false;
        }
        let byte = self.data[y as usize * self.stride + (x / 8) as usize];
        byte & (0x80 >> (x % 8)) != 0
    }

    /// Pixel mutator; out-of-bounds writes are dropped.
    pub fn set(&mut self, x: u32, y: u32, on: bool) {
        if x >= self.width || y >= self.height {
            return;
        }
        let index = y as usize * self.stride + (x / 8) as usize;
        let mask = 0x80 >> (x % 8);
        if on {
            self.data[index] |= mask;
        } else {
            self.data[index] &= !mask;
        }
    }

    /// Whether any byte under `region` differs from `other`.
    pub fn region_differs(&self, other: &Framebuffer, region: Rect) -> bool {
        debug_assert_eq!(self.stride, other.stride);
        let (x0, x1) = (region.x / 8, (region.x + region.w - 1) / 8);
        for y in region.y..(region.y + region.h).min(self.height) {
            let row = y as usize * self.stride;
            let a = &self.data[row + x0 as usize..=row + (x1 as usize).min(self.stride - 1)];
            let b = &other.data[row + x0 as usize..=row + (x1 as usize).min(self.stride - 1)];
            if a != b {
                return true;
            }
        }
        false
    }

    /// Byte offsets (into [`Framebuffer::bytes`]) that differ from `other`.
    pub fn changed_bytes(&self, other: &Framebuffer) -> Vec<usize> {
        self.data
            .iter()
            .zip(other.data.iter())
            .enumerate()
            .filter_map(|(i, (a, b))| (a != b).then_some(i))
            .collect()
    }

    /// Overwrite from another buffer of identical geometry.
    pub fn copy_from(&mut self, other: &Framebuffer) {
        debug_assert_eq!(self.data.len(), other.data.len());
        self.data.copy_from_slice(&other.data);
    }

    /// Bytes of one region, row by row, for a panel partial-window write.
    pub fn region_bytes(&self, region: Rect) -> Vec<u8> {
        let x0 = (region.x / 8) as usize;
        let x1 = (((region.x + region.w - 1) / 8) as usize).min(self.stride - 1);
        let mut out = Vec::with_capacity((x1 - x0 + 1) * region.h as usize);
        for y in region.y..(region.y + region.h).min(self.height) {
            let row = y as usize * self.stride;
            out.extend_from_slice(&self.data[row + x0..=row + x1]);
        }
        out
    }

    /// Borrow a clipped, translated drawing surface for one widget.
    pub fn canvas(&mut self, bounds: Rect) -> Canvas<'_> {
        Canvas { fb: self, bounds }
    }
}

/// A widget-local view: the origin is the widget's top-left corner and
/// drawing is clipped to its bounds.
pub struct Canvas<'a> {
    fb: &'a mut Framebuffer,
    bounds: Rect,
}

impl Canvas<'_> {
    /// Widget-local size.
    pub fn size(&self) -> Size {
        Size::new(self.bounds.w, self.bounds.h)
    }

    /// Fill the whole widget area with background.
    pub fn clear_background(&mut self) {
        for y in 0..self.bounds.h {
            for x in 0..self.bounds.w {
                self.set_local(x as i32, y as i32, false);
            }
        }
    }

    /// Set one widget-local pixel.
    pub fn set_local(&mut self, x: i32, y: i32, on: bool) {
        if x < 0 || y < 0 || x as u32 >= self.bounds.w || y as u32 >= self.bounds.h {
            return;
        }
        self.fb
            .set(self.bounds.x + x as u32, self.bounds.y + y as u32, on);
    }

    /// Read one widget-local pixel.
    pub fn get_local(&self, x: i32, y: i32) -> bool {
        if x < 0 || y < 0 || x as u32 >= self.bounds.w || y as u32 >= self.bounds.h {
            return false;
        }
        self.fb
            .get(self.bounds.x + x as u32, self.bounds.y + y as u32)
    }
}

impl Dimensions for Canvas<'_> {
    fn bounding_box(&self) -> Rectangle {
        Rectangle::new(Point::zero(), Size::new(self.bounds.w, self.bounds.h))
    }
}

impl DrawTarget for Canvas<'_> {
    type Color = BinaryColor;
    type Error = core::convert::Infallible;

    fn draw_iter<I>(&mut self, pixels: I) -> core::result::Result<(), Self::Error>
    where
        I: IntoIterator<Item = Pixel<Self::Color>>,
    {
        for Pixel(point, color) in pixels {
            self.set_local(point.x, point.y, color == BinaryColor::On);
        }
        Ok(())
    }
}
