// Downsampled PNG rendering of a layer stack. Tiles are read in bands of
// rows so a full resolution tile is never held in memory.

use image::{Rgb as ImageRgb, RgbImage};
use log::{info, warn};
use ndarray::{Array3, ArrayView2};
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::error::SurfaceError;
use crate::surface::{ImageLayer, ImageSource, LayerStack, PointsLayer, RenderSurface};

pub const DEFAULT_MAX_DIM: u32 = 2048;
pub const DEFAULT_BAND_ROWS: u64 = 1024;
// Used for tiles that carry no contrast limits.
const FALLBACK_LIMITS: (f32, f32) = (0.0, 65535.0);

pub struct Preview {
    path: PathBuf,
    max_dim: u32,
    band_rows: u64,
    include_hidden: bool,
    stack: LayerStack,
}

impl Preview {
    pub fn new(path: &Path, max_dim: u32, include_hidden: bool) -> Self {
        Preview {
            path: path.to_path_buf(),
            max_dim: max_dim.max(1),
            band_rows: DEFAULT_BAND_ROWS,
            include_hidden,
            stack: LayerStack::new(),
        }
    }

    pub fn with_band_rows(mut self, band_rows: u64) -> Self {
        self.band_rows = band_rows.max(1);
        self
    }

    pub fn render(&self) -> Result<RgbImage, SurfaceError> {
        render(&self.stack, self.max_dim, self.band_rows, self.include_hidden)
    }

    pub fn finish(self) -> Result<PathBuf, SurfaceError> {
        let t0 = Instant::now();
        let img = self.render()?;
        img.save(&self.path)?;
        info!(
            "Wrote {} x {} preview to {} in {:?}",
            img.width(),
            img.height(),
            self.path.display(),
            t0.elapsed()
        );
        Ok(self.path)
    }
}

impl RenderSurface for Preview {
    fn add_image(&mut self, layer: ImageLayer) -> Result<(), SurfaceError> {
        self.stack.add_image(layer)
    }

    fn add_points(&mut self, layer: PointsLayer) -> Result<(), SurfaceError> {
        self.stack.add_points(layer)
    }
}

// World coordinates to canvas pixels.
struct Canvas {
    pixels: Array3<f32>,
    factor: f64,
}

impl Canvas {
    fn new(extent: (f64, f64), max_dim: u32) -> Self {
        let longest = extent.0.max(extent.1).max(1.0);
        let factor = (longest / max_dim as f64).max(1.0);
        let nrows = ((extent.0 / factor).ceil() as usize).max(1);
        let ncols = ((extent.1 / factor).ceil() as usize).max(1);
        Canvas {
            pixels: Array3::zeros((nrows, ncols, 3)),
            factor,
        }
    }

    fn nrows(&self) -> usize {
        self.pixels.dim().0
    }

    fn ncols(&self) -> usize {
        self.pixels.dim().1
    }

    fn blend(&mut self, cy: usize, cx: usize, color: [f32; 3], alpha: f32, additive: bool) {
        for (k, &c) in color.iter().enumerate() {
            let v = &mut self.pixels[[cy, cx, k]];
            if additive {
                *v += alpha * c;
            } else {
                *v = *v * (1.0 - alpha) + alpha * c;
            }
        }
    }

    fn into_image(self) -> RgbImage {
        let (nrows, ncols, _) = self.pixels.dim();
        RgbImage::from_fn(ncols as u32, nrows as u32, |x, y| {
            let px = |k: usize| {
                (self.pixels[[y as usize, x as usize, k]].clamp(0.0, 1.0) * 255.0).round() as u8
            };
            ImageRgb([px(0), px(1), px(2)])
        })
    }
}

fn world_extent(stack: &LayerStack) -> (f64, f64) {
    let mut extent = (0.0_f64, 0.0_f64);
    for layer in stack.images() {
        let (rows, cols) = layer.extent();
        extent = (extent.0.max(rows), extent.1.max(cols));
    }
    for layer in stack.points() {
        for p in &layer.points {
            extent = (
                extent.0.max(p.row + layer.size),
                extent.1.max(p.col + layer.size),
            );
        }
    }
    extent
}

// Canvas cells covered by one axis of a layer, paired with the source index
// sampled for each.
fn axis_samples(
    canvas_len: usize,
    factor: f64,
    translate: f64,
    scale: f64,
    len: u64,
) -> Vec<(usize, u64)> {
    (0..canvas_len)
        .filter_map(|c| {
            let world = (c as f64 + 0.5) * factor;
            let src = ((world - translate) / scale).floor();
            if src >= 0.0 && src < len as f64 {
                Some((c, src as u64))
            } else {
                None
            }
        })
        .collect()
}

fn for_each_band<F>(source: &ImageSource, band_rows: u64, mut f: F) -> Result<(), SurfaceError>
where
    F: FnMut(u64, ArrayView2<f32>),
{
    match source {
        ImageSource::Raster { pixels, .. } => f(0, pixels.view()),
        ImageSource::Tile(tile) => {
            let mut start = 0;
            while start < tile.region.rows {
                let end = (start + band_rows).min(tile.region.rows);
                let band = tile.read_rows(start..end)?;
                f(start, band.view());
                start = end;
            }
        }
    }
    Ok(())
}

fn intensity_limits(layer: &ImageLayer) -> (f32, f32) {
    if let Some(limits) = layer.display.contrast_limits {
        return limits;
    }
    match &layer.source {
        ImageSource::Raster { pixels, .. } => {
            let lo = pixels.iter().cloned().fold(f32::INFINITY, f32::min);
            let hi = pixels.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
            if lo.is_finite() && hi.is_finite() {
                (lo, hi)
            } else {
                FALLBACK_LIMITS
            }
        }
        ImageSource::Tile(_) => FALLBACK_LIMITS,
    }
}

fn draw_image(
    canvas: &mut Canvas,
    layer: &ImageLayer,
    band_rows: u64,
) -> Result<(), SurfaceError> {
    let (rows, cols) = layer.shape();
    let row_samples = axis_samples(
        canvas.nrows(),
        canvas.factor,
        layer.translate.0,
        layer.scale.0,
        rows,
    );
    let col_samples = axis_samples(
        canvas.ncols(),
        canvas.factor,
        layer.translate.1,
        layer.scale.1,
        cols,
    );
    if row_samples.is_empty() || col_samples.is_empty() {
        return Ok(());
    }

    let (lo, hi) = intensity_limits(layer);
    let span = if hi > lo { hi - lo } else { 1.0 };
    let inverted = match layer.display.colormap.as_str() {
        "gray" | "grey" => false,
        "gray_r" | "grey_r" => true,
        other => {
            warn!("Unsupported colormap '{}' for {}, using gray", other, layer.name);
            false
        }
    };
    let additive = layer.display.blending == "additive";
    let alpha = layer.display.opacity as f32;

    for_each_band(&layer.source, band_rows, |start, band| {
        let end = start + band.nrows() as u64;
        for &(cy, r) in row_samples.iter().filter(|(_, r)| *r >= start && *r < end) {
            for &(cx, c) in &col_samples {
                let v = band[[(r - start) as usize, c as usize]];
                let t = ((v - lo) / span).clamp(0.0, 1.0);
                let t = if inverted { 1.0 - t } else { t };
                canvas.blend(cy, cx, [t, t, t], alpha, additive);
            }
        }
    })
}

fn draw_points(canvas: &mut Canvas, layer: &PointsLayer) {
    let radius = (layer.size / 2.0 / canvas.factor).max(0.5);
    let reach = radius.ceil() as i64;
    let color = [layer.face_color.r, layer.face_color.g, layer.face_color.b];
    let alpha = layer.opacity as f32;
    let square = layer.symbol == "square";
    let (nrows, ncols) = (canvas.nrows() as i64, canvas.ncols() as i64);

    for p in &layer.points {
        let cy = (p.row / canvas.factor).floor() as i64;
        let cx = (p.col / canvas.factor).floor() as i64;
        for dy in -reach..=reach {
            for dx in -reach..=reach {
                let (y, x) = (cy + dy, cx + dx);
                if y < 0 || x < 0 || y >= nrows || x >= ncols {
                    continue;
                }
                let inside = if square {
                    (dy.abs() as f64) < radius && (dx.abs() as f64) < radius
                } else {
                    ((dy * dy + dx * dx) as f64) < radius * radius
                };
                if inside {
                    canvas.blend(y as usize, x as usize, color, alpha, false);
                }
            }
        }
    }
}

pub fn render(
    stack: &LayerStack,
    max_dim: u32,
    band_rows: u64,
    include_hidden: bool,
) -> Result<RgbImage, SurfaceError> {
    let mut canvas = Canvas::new(world_extent(stack), max_dim);
    for layer in stack.images() {
        draw_image(&mut canvas, layer, band_rows.max(1))?;
    }
    for layer in stack.points() {
        if layer.visible || include_hidden {
            draw_points(&mut canvas, layer);
        }
    }
    Ok(canvas.into_image())
}
