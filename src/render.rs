//! Compositing of captured outputs into one image.
//!
//! Every canvas pixel is traced back through three spaces: the target region (logical units
//! multiplied by the target scale), the output's logical geometry, and the output's framebuffer
//! (logical scale applied, transform undone). Outputs are painted in record order and later ones
//! overwrite earlier ones.

use log::debug;
use thiserror::Error;

use crate::buffer::PixelBuffer;
use crate::format::{create_converter, Argb8, Convert, PixelFormat};
use crate::geometry::GeoBox;
use crate::record::OutputCaptureRecord;
use crate::transform::Transform;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RenderError {
    #[error("supplied geometry did not intersect with any outputs")]
    NoIntersection,
    #[error("output {output} uses {format}, which can not be converted")]
    UnsupportedFormat { output: String, format: PixelFormat },
    #[error("output {0} has not been captured")]
    NotReady(String),
    #[error("invalid scale {0}")]
    InvalidScale(f64),
    #[error("can not allocate a {width}x{height} image")]
    CanvasTooLarge { width: u32, height: u32 },
}

/// The composed image. Pixels are non-premultiplied ARGB packed as `0xAARRGGBB`, row major.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Canvas {
    width: u32,
    height: u32,
    pixels: Vec<u32>,
}

impl Canvas {
    /// A fully transparent canvas.
    pub fn new(width: u32, height: u32) -> Result<Self, RenderError> {
        let len = (width as usize)
            .checked_mul(height as usize)
            .ok_or(RenderError::CanvasTooLarge { width, height })?;
        let mut pixels = Vec::new();
        pixels
            .try_reserve_exact(len)
            .map_err(|_| RenderError::CanvasTooLarge { width, height })?;
        pixels.resize(len, 0);
        Ok(Self {
            width,
            height,
            pixels,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixels(&self) -> &[u32] {
        &self.pixels
    }

    fn index(&self, x: u32, y: u32) -> Option<usize> {
        (x < self.width && y < self.height)
            .then(|| y as usize * self.width as usize + x as usize)
    }

    /// The pixel at `x`, `y`, or `None` outside the canvas.
    pub fn pixel(&self, x: u32, y: u32) -> Option<u32> {
        self.index(x, y).map(|index| self.pixels[index])
    }

    pub fn pixel_mut(&mut self, x: u32, y: u32) -> Option<&mut u32> {
        let index = self.index(x, y)?;
        self.pixels.get_mut(index)
    }

    /// Bytes in R, G, B, A order.
    pub fn to_rgba8(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(self.pixels.len() * 4);
        for pixel in &self.pixels {
            let Argb8 { a, r, g, b } = Argb8::from_u32(*pixel);
            data.extend_from_slice(&[r, g, b, a]);
        }
        data
    }

    /// Bytes in R, G, B order, alpha dropped.
    pub fn to_rgb8(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(self.pixels.len() * 3);
        for pixel in &self.pixels {
            let Argb8 { r, g, b, .. } = Argb8::from_u32(*pixel);
            data.extend_from_slice(&[r, g, b]);
        }
        data
    }
}

/// How source pixels are sampled.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Filter {
    /// Source and destination grids match, copy pixels.
    Exact,
    /// Upscaling.
    Bilinear,
    /// Downscaling, average everything under the destination pixel.
    Area,
}

impl Filter {
    /// Pick the filter for a destination/source density ratio.
    pub fn for_scale(effective_scale: f64) -> Self {
        if effective_scale == 1.0 {
            Filter::Exact
        } else if effective_scale > 1.0 {
            Filter::Bilinear
        } else {
            Filter::Area
        }
    }
}

/// Premultiplied channels in A, R, G, B order.
type Premultiplied = [f64; 4];

fn resolve(pixel: Premultiplied) -> Argb8 {
    let [a, r, g, b] = pixel;
    if a <= 0.0 {
        return Argb8::TRANSPARENT;
    }
    let channel = |c: f64| (c * 255.0 / a).round().clamp(0.0, 255.0) as u8;
    Argb8 {
        a: a.round().clamp(0.0, 255.0) as u8,
        r: channel(r),
        g: channel(g),
        b: channel(b),
    }
}

/// One output's framebuffer seen in its displayed orientation.
struct Source<'a> {
    buffer: &'a PixelBuffer,
    converter: Box<dyn Convert>,
    bpp: usize,
    premultiplied: bool,
    /// Maps displayed coordinates back into the framebuffer.
    inverse: Transform,
    /// Size of the framebuffer after the transform.
    bounds: (f64, f64),
}

impl<'a> Source<'a> {
    fn new(record: &'a OutputCaptureRecord) -> Result<Self, RenderError> {
        let buffer = record
            .buffer()
            .filter(|_| record.is_ready())
            .ok_or_else(|| RenderError::NotReady(record.to_string()))?;
        let format = buffer.format();
        let unsupported = || RenderError::UnsupportedFormat {
            output: record.to_string(),
            format,
        };
        let converter = create_converter(format).ok_or_else(unsupported)?;
        let bpp = format.bytes_per_pixel().ok_or_else(unsupported)?;
        let bounds = record
            .transform
            .apply_to_dimensions(buffer.width() as f64, buffer.height() as f64);

        Ok(Self {
            buffer,
            converter,
            bpp,
            premultiplied: format.is_premultiplied(),
            inverse: record.transform.inverse(),
            bounds,
        })
    }

    fn fetch(&self, x: u32, y: u32) -> Argb8 {
        let offset = x as usize * self.bpp;
        self.converter
            .unpack(&self.buffer.row(y)[offset..offset + self.bpp])
    }

    fn fetch_premultiplied(&self, x: u32, y: u32) -> Premultiplied {
        let Argb8 { a, r, g, b } = self.fetch(x, y);
        let (a, r, g, b) = (a as f64, r as f64, g as f64, b as f64);
        if self.premultiplied {
            [a, r, g, b]
        } else {
            let f = a / 255.0;
            [a, r * f, g * f, b * f]
        }
    }

    fn to_buffer(&self, point: (f64, f64)) -> (f64, f64) {
        self.inverse.map_point(point, self.bounds)
    }

    fn clamp_x(&self, x: f64) -> u32 {
        (x.max(0.0) as u32).min(self.buffer.width() - 1)
    }

    fn clamp_y(&self, y: f64) -> u32 {
        (y.max(0.0) as u32).min(self.buffer.height() - 1)
    }

    /// The pixel under `point`, bit exact.
    fn nearest(&self, point: (f64, f64)) -> Argb8 {
        let (x, y) = self.to_buffer(point);
        let pixel = self.fetch(self.clamp_x(x.floor()), self.clamp_y(y.floor()));
        if self.premultiplied {
            pixel.unpremultiply()
        } else {
            pixel
        }
    }

    fn bilinear(&self, point: (f64, f64)) -> Argb8 {
        let (x, y) = self.to_buffer(point);
        let (x, y) = (x - 0.5, y - 0.5);
        let (x0, y0) = (x.floor(), y.floor());
        let (tx, ty) = (x - x0, y - y0);
        let (xa, xb) = (self.clamp_x(x0), self.clamp_x(x0 + 1.0));
        let (ya, yb) = (self.clamp_y(y0), self.clamp_y(y0 + 1.0));

        let top = lerp(self.fetch_premultiplied(xa, ya), self.fetch_premultiplied(xb, ya), tx);
        let bottom = lerp(self.fetch_premultiplied(xa, yb), self.fetch_premultiplied(xb, yb), tx);
        resolve(lerp(top, bottom, ty))
    }

    /// Area weighted average over the rectangle spanned by two displayed corners.
    fn area(&self, from: (f64, f64), to: (f64, f64)) -> Argb8 {
        let (ax, ay) = self.to_buffer(from);
        let (bx, by) = self.to_buffer(to);
        let (width, height) = (self.buffer.width() as f64, self.buffer.height() as f64);
        let (x0, x1) = (ax.min(bx).max(0.0), ax.max(bx).min(width));
        let (y0, y1) = (ay.min(by).max(0.0), ay.max(by).min(height));
        if x1 <= x0 || y1 <= y0 {
            return self.nearest(((from.0 + to.0) / 2.0, (from.1 + to.1) / 2.0));
        }

        let mut sum = [0.0; 4];
        let mut total = 0.0;
        for py in (y0.floor() as u32)..(y1.ceil() as u32) {
            let wy = y1.min(py as f64 + 1.0) - y0.max(py as f64);
            for px in (x0.floor() as u32)..(x1.ceil() as u32) {
                let weight = wy * (x1.min(px as f64 + 1.0) - x0.max(px as f64));
                if weight <= 0.0 {
                    continue;
                }
                let pixel = self.fetch_premultiplied(px, py);
                for (acc, c) in sum.iter_mut().zip(pixel) {
                    *acc += c * weight;
                }
                total += weight;
            }
        }

        if total <= 0.0 {
            return Argb8::TRANSPARENT;
        }
        resolve(sum.map(|c| c / total))
    }
}

fn lerp(a: Premultiplied, b: Premultiplied, t: f64) -> Premultiplied {
    [
        a[0] + (b[0] - a[0]) * t,
        a[1] + (b[1] - a[1]) * t,
        a[2] + (b[2] - a[2]) * t,
        a[3] + (b[3] - a[3]) * t,
    ]
}

/// Destination pixel range covering `[start, start + len)` of a region starting at `origin`.
fn span(start: i32, len: u32, origin: i32, scale: f64, limit: u32) -> (u32, u32) {
    let edge = |logical: i64| {
        (((logical - origin as i64) as f64) * scale)
            .round()
            .clamp(0.0, limit as f64) as u32
    };
    (edge(start as i64), edge(start as i64 + len as i64))
}

fn paint(
    canvas: &mut Canvas,
    record: &OutputCaptureRecord,
    source: &Source<'_>,
    overlap: GeoBox,
    region: GeoBox,
    scale: f64,
) {
    let logical = record.logical_geometry;
    let logical_scale = record.logical_scale;
    let filter = Filter::for_scale(scale / logical_scale);
    debug!(
        "Paint output {} at {} with {:?} sampling",
        record, overlap, filter
    );

    // Displayed framebuffer coordinate of the region origin, and the size of one canvas pixel.
    let origin_x = (region.x as i64 - logical.x as i64) as f64 * logical_scale;
    let origin_y = (region.y as i64 - logical.y as i64) as f64 * logical_scale;
    let step = logical_scale / scale;

    let (x_start, x_end) = span(overlap.x, overlap.width, region.x, scale, canvas.width);
    let (y_start, y_end) = span(overlap.y, overlap.height, region.y, scale, canvas.height);
    for dy in y_start..y_end {
        for dx in x_start..x_end {
            let (x, y) = (dx as f64, dy as f64);
            let centre = (origin_x + (x + 0.5) * step, origin_y + (y + 0.5) * step);
            let pixel = match filter {
                Filter::Exact => source.nearest(centre),
                Filter::Bilinear => source.bilinear(centre),
                Filter::Area => source.area(
                    (origin_x + x * step, origin_y + y * step),
                    (origin_x + (x + 1.0) * step, origin_y + (y + 1.0) * step),
                ),
            };
            if let Some(target) = canvas.pixel_mut(dx, dy) {
                *target = pixel.to_u32();
            }
        }
    }
}

/// Compose the outputs overlapping `region` into one image, `scale` canvas pixels per logical unit.
pub fn render(
    records: &[OutputCaptureRecord],
    region: GeoBox,
    scale: f64,
) -> Result<Canvas, RenderError> {
    if !scale.is_finite() || scale <= 0.0 {
        return Err(RenderError::InvalidScale(scale));
    }

    // Validate everything before touching a pixel.
    let mut sources = Vec::new();
    for record in records {
        let overlap = match record.logical_geometry.intersection(&region) {
            Some(overlap) => overlap,
            None => continue,
        };
        if !record.logical_scale.is_finite() || record.logical_scale <= 0.0 {
            return Err(RenderError::InvalidScale(record.logical_scale));
        }
        sources.push((record, overlap, Source::new(record)?));
    }
    if sources.is_empty() {
        return Err(RenderError::NoIntersection);
    }

    let width = (region.width as f64 * scale).round() as u32;
    let height = (region.height as f64 * scale).round() as u32;
    debug!(
        "Render {} outputs into a {}x{} image of {} at scale {}",
        sources.len(),
        width,
        height,
        region,
        scale
    );

    let mut canvas = Canvas::new(width, height)?;
    for (record, overlap, source) in &sources {
        paint(&mut canvas, record, source, *overlap, region, scale);
    }
    Ok(canvas)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A captured output filled by `fill(x, y)` with ARGB8888 values.
    fn captured(
        name: &str,
        logical: GeoBox,
        (width, height): (u32, u32),
        transform: Transform,
        fill: impl Fn(u32, u32) -> u32,
    ) -> OutputCaptureRecord {
        let mut record = OutputCaptureRecord::new();
        record.name = Some(name.into());
        record.transform = transform;
        record.logical_geometry = logical;
        record.set_mode(width, height).unwrap();
        let (displayed_width, _) = transform.apply_to_dimensions(width, height);
        record.logical_scale = displayed_width as f64 / logical.width as f64;

        let mut buffer = PixelBuffer::allocate(PixelFormat::Argb8888, width, height, width * 4).unwrap();
        for y in 0..height {
            for x in 0..width {
                let offset = (y * width * 4 + x * 4) as usize;
                buffer.data_mut()[offset..offset + 4].copy_from_slice(&fill(x, y).to_le_bytes());
            }
        }
        record.attach_buffer(buffer).unwrap();
        record.mark_capture_requested().unwrap();
        record.mark_ready().unwrap();
        record
    }

    fn solid(name: &str, logical: GeoBox, color: u32) -> OutputCaptureRecord {
        captured(
            name,
            logical,
            (logical.width, logical.height),
            Transform::Normal,
            |_, _| color,
        )
    }

    #[test]
    fn exact_blit_copies_pixels() {
        let region = GeoBox::new(0, 0, 8, 4);
        let record = captured("DP-1", region, (8, 4), Transform::Normal, |x, y| {
            0xff000000 | (x << 16) | (y << 8)
        });
        let canvas = render(&[record], region, 1.0).unwrap();
        assert_eq!((canvas.width(), canvas.height()), (8, 4));
        for y in 0..4 {
            for x in 0..8 {
                assert_eq!(canvas.pixel(x, y), Some(0xff000000 | (x << 16) | (y << 8)));
            }
        }
    }

    #[test]
    fn hidpi_output_blits_at_its_own_scale() {
        let record = captured(
            "eDP-1",
            GeoBox::new(0, 0, 2, 2),
            (4, 4),
            Transform::Normal,
            |x, y| 0xff000000 | (x << 16) | y,
        );
        assert_eq!(record.logical_scale, 2.0);
        let canvas = render(&[record], GeoBox::new(0, 0, 2, 2), 2.0).unwrap();
        assert_eq!(canvas.pixel(3, 1), Some(0xff030001));
        assert_eq!(canvas.pixel(0, 3), Some(0xff000003));
    }

    #[test]
    fn outputs_tile_without_seams() {
        let left = solid("DP-1", GeoBox::new(0, 0, 800, 600), 0xffff0000);
        let right = solid("DP-2", GeoBox::new(800, 0, 800, 600), 0xff0000ff);
        let canvas = render(&[left, right], GeoBox::new(0, 0, 1600, 600), 1.0).unwrap();
        for y in [0, 300, 599] {
            assert_eq!(canvas.pixel(0, y), Some(0xffff0000));
            assert_eq!(canvas.pixel(799, y), Some(0xffff0000));
            assert_eq!(canvas.pixel(800, y), Some(0xff0000ff));
            assert_eq!(canvas.pixel(1599, y), Some(0xff0000ff));
        }
    }

    #[test]
    fn rotated_output_is_turned_clockwise() {
        // 0  1  2  3
        // 10 11 12 13
        let fill = |x: u32, y: u32| 0xff000000 | (y * 10 + x);
        let record = captured("DP-1", GeoBox::new(0, 0, 2, 4), (4, 2), Transform::Rot90, fill);
        let canvas = render(&[record], GeoBox::new(0, 0, 2, 4), 1.0).unwrap();
        assert_eq!((canvas.width(), canvas.height()), (2, 4));
        let labels: Vec<u32> = canvas.pixels().iter().map(|pixel| pixel & 0xff).collect();
        assert_eq!(labels, [10, 0, 11, 1, 12, 2, 13, 3]);
    }

    #[test]
    fn pixels_outside_the_canvas_are_none() {
        let mut canvas = Canvas::new(2, 1).unwrap();
        assert_eq!(canvas.pixel(1, 0), Some(0));
        assert_eq!(canvas.pixel(2, 0), None);
        assert_eq!(canvas.pixel(0, 1), None);
        assert!(canvas.pixel_mut(0, 5).is_none());
    }

    #[test]
    fn flipped_output_is_mirrored() {
        let fill = |x: u32, _| 0xff000000 | x;
        let record = captured("DP-1", GeoBox::new(0, 0, 3, 1), (3, 1), Transform::Flipped, fill);
        let canvas = render(&[record], GeoBox::new(0, 0, 3, 1), 1.0).unwrap();
        assert_eq!(canvas.pixels(), &[0xff000002, 0xff000001, 0xff000000]);
    }

    #[test]
    fn downscaling_averages_areas() {
        // Every 2x2 block has two white and two black pixels.
        let record = captured(
            "DP-1",
            GeoBox::new(0, 0, 2, 2),
            (4, 4),
            Transform::Normal,
            |x, _| if x % 2 == 0 { 0xffffffff } else { 0xff000000 },
        );
        let canvas = render(&[record], GeoBox::new(0, 0, 2, 2), 1.0).unwrap();
        assert_eq!(canvas.pixels(), &[0xff808080; 4]);
    }

    #[test]
    fn upscaling_interpolates() {
        let record = captured(
            "DP-1",
            GeoBox::new(0, 0, 2, 1),
            (2, 1),
            Transform::Normal,
            |x, _| if x == 0 { 0xff000000 } else { 0xffff0000 },
        );
        let canvas = render(&[record], GeoBox::new(0, 0, 2, 1), 2.0).unwrap();
        assert_eq!((canvas.width(), canvas.height()), (4, 2));
        let red: Vec<u32> = (0..4).map(|x| (canvas.pixel(x, 0).unwrap() >> 16) & 0xff).collect();
        assert_eq!(red, vec![0, 64, 191, 255]);
        assert!(canvas.pixels().iter().all(|p| p >> 24 == 0xff));
    }

    #[test]
    fn solid_colours_survive_resampling() {
        for scale in [0.3, 0.5, 1.5, 2.0, 3.7] {
            let record = solid("DP-1", GeoBox::new(0, 0, 10, 10), 0xff336699);
            let canvas = render(&[record], GeoBox::new(0, 0, 10, 10), scale).unwrap();
            assert!(canvas.pixels().iter().all(|p| *p == 0xff336699), "scale {}", scale);
        }
    }

    #[test]
    fn premultiplied_pixels_are_unpremultiplied() {
        let record = solid("DP-1", GeoBox::new(0, 0, 1, 1), 0x80402000);
        let canvas = render(&[record], GeoBox::new(0, 0, 1, 1), 1.0).unwrap();
        assert_eq!(canvas.pixel(0, 0), Some(0x80804000));
    }

    #[test]
    fn later_outputs_win_on_overlap() {
        let first = solid("DP-1", GeoBox::new(0, 0, 4, 4), 0xffff0000);
        let second = solid("DP-2", GeoBox::new(2, 0, 4, 4), 0xff00ff00);
        let canvas = render(&[first, second], GeoBox::new(0, 0, 6, 4), 1.0).unwrap();
        assert_eq!(canvas.pixel(1, 0), Some(0xffff0000));
        assert_eq!(canvas.pixel(2, 0), Some(0xff00ff00));
        assert_eq!(canvas.pixel(5, 3), Some(0xff00ff00));
    }

    #[test]
    fn uncovered_pixels_stay_transparent() {
        let record = solid("DP-1", GeoBox::new(0, 0, 4, 4), 0xffffffff);
        let canvas = render(&[record], GeoBox::new(2, 2, 4, 4), 1.0).unwrap();
        assert_eq!(canvas.pixel(0, 0), Some(0xffffffff));
        assert_eq!(canvas.pixel(1, 1), Some(0xffffffff));
        assert_eq!(canvas.pixel(2, 0), Some(0));
        assert_eq!(canvas.pixel(3, 3), Some(0));
    }

    #[test]
    fn canvas_size_rounds_half_away_from_zero() {
        let record = solid("DP-1", GeoBox::new(0, 0, 3, 5), 0xffffffff);
        let canvas = render(&[record], GeoBox::new(0, 0, 3, 5), 0.5).unwrap();
        assert_eq!((canvas.width(), canvas.height()), (2, 3));
    }

    #[test]
    fn disjoint_region_is_rejected() {
        let record = solid("DP-1", GeoBox::new(0, 0, 4, 4), 0xffffffff);
        assert_eq!(
            render(&[record], GeoBox::new(4, 0, 4, 4), 1.0),
            Err(RenderError::NoIntersection)
        );
        assert_eq!(render(&[], GeoBox::new(0, 0, 4, 4), 1.0), Err(RenderError::NoIntersection));
    }

    #[test]
    fn unknown_format_is_rejected() {
        let mut record = OutputCaptureRecord::new();
        record.name = Some("DP-1".into());
        record.logical_geometry = GeoBox::new(0, 0, 2, 2);
        record.set_mode(2, 2).unwrap();
        let buffer = PixelBuffer::allocate(PixelFormat::Unknown(0x3231564e), 2, 2, 8).unwrap();
        record.attach_buffer(buffer).unwrap();
        record.mark_capture_requested().unwrap();
        record.mark_ready().unwrap();

        assert!(matches!(
            render(&[record], GeoBox::new(0, 0, 2, 2), 1.0),
            Err(RenderError::UnsupportedFormat { .. })
        ));
    }

    #[test]
    fn uncaptured_output_is_rejected() {
        let mut record = OutputCaptureRecord::new();
        record.name = Some("DP-1".into());
        record.logical_geometry = GeoBox::new(0, 0, 2, 2);
        assert_eq!(
            render(&[record], GeoBox::new(0, 0, 2, 2), 1.0),
            Err(RenderError::NotReady("DP-1".into()))
        );
    }

    #[test]
    fn invalid_scale_is_rejected() {
        let record = solid("DP-1", GeoBox::new(0, 0, 2, 2), 0xffffffff);
        let records = [record];
        for scale in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            assert!(matches!(
                render(&records, GeoBox::new(0, 0, 2, 2), scale),
                Err(RenderError::InvalidScale(_))
            ));
        }
    }

    #[test]
    fn filter_follows_effective_scale() {
        assert_eq!(Filter::for_scale(1.0), Filter::Exact);
        assert_eq!(Filter::for_scale(2.0), Filter::Bilinear);
        assert_eq!(Filter::for_scale(0.5), Filter::Area);
    }

    #[test]
    fn canvas_exports_byte_orders() {
        let mut canvas = Canvas::new(1, 1).unwrap();
        *canvas.pixel_mut(0, 0).unwrap() = 0x80112233;
        assert_eq!(canvas.to_rgba8(), vec![0x11, 0x22, 0x33, 0x80]);
        assert_eq!(canvas.to_rgb8(), vec![0x11, 0x22, 0x33]);
    }
}
