// Layers handed to a rendering surface. Surfaces receive background images
// first and point overlays after, in the order they should be drawn.

use ndarray::Array2;
use std::path::PathBuf;
use std::sync::Arc;

use crate::background::{DisplaySettings, Tile};
use crate::error::SurfaceError;
use crate::tables::{Point, Rgb};

#[derive(Clone)]
pub enum ImageSource {
    Raster {
        path: PathBuf,
        pixels: Arc<Array2<f32>>,
    },
    Tile(Tile),
}

#[derive(Clone)]
pub struct ImageLayer {
    pub name: String,
    pub source: ImageSource,
    pub display: DisplaySettings,
    pub scale: (f64, f64),
    pub translate: (f64, f64),
}

impl ImageLayer {
    /// Pixel dimensions of the layer data, before scaling.
    pub fn shape(&self) -> (u64, u64) {
        match &self.source {
            ImageSource::Raster { pixels, .. } => (pixels.nrows() as u64, pixels.ncols() as u64),
            ImageSource::Tile(tile) => (tile.region.rows, tile.region.cols),
        }
    }

    /// Bottom right corner in world coordinates.
    pub fn extent(&self) -> (f64, f64) {
        let (rows, cols) = self.shape();
        (
            self.translate.0 + rows as f64 * self.scale.0,
            self.translate.1 + cols as f64 * self.scale.1,
        )
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct PointsLayer {
    pub name: String,
    pub entity: String,
    pub points: Vec<Point>,
    pub face_color: Rgb,
    pub edge_color: Rgb,
    pub opacity: f64,
    pub symbol: String,
    pub size: f64,
    pub visible: bool,
}

pub trait RenderSurface {
    fn add_image(&mut self, layer: ImageLayer) -> Result<(), SurfaceError>;
    fn add_points(&mut self, layer: PointsLayer) -> Result<(), SurfaceError>;
}

#[derive(Clone)]
pub enum Layer {
    Image(ImageLayer),
    Points(PointsLayer),
}

impl Layer {
    pub fn name(&self) -> &str {
        match self {
            Layer::Image(layer) => &layer.name,
            Layer::Points(layer) => &layer.name,
        }
    }
}

/// Keeps layers in memory in the order they were added.
#[derive(Clone, Default)]
pub struct LayerStack {
    pub layers: Vec<Layer>,
}

impl LayerStack {
    pub fn new() -> Self {
        LayerStack::default()
    }

    pub fn images(&self) -> impl Iterator<Item = &ImageLayer> {
        self.layers.iter().filter_map(|layer| match layer {
            Layer::Image(image) => Some(image),
            Layer::Points(_) => None,
        })
    }

    pub fn points(&self) -> impl Iterator<Item = &PointsLayer> {
        self.layers.iter().filter_map(|layer| match layer {
            Layer::Points(points) => Some(points),
            Layer::Image(_) => None,
        })
    }

    /// Feed every recorded layer, in order, to another surface.
    pub fn replay(&self, surface: &mut dyn RenderSurface) -> Result<(), SurfaceError> {
        for layer in &self.layers {
            match layer {
                Layer::Image(image) => surface.add_image(image.clone())?,
                Layer::Points(points) => surface.add_points(points.clone())?,
            }
        }
        Ok(())
    }
}

impl RenderSurface for LayerStack {
    fn add_image(&mut self, layer: ImageLayer) -> Result<(), SurfaceError> {
        self.layers.push(Layer::Image(layer));
        Ok(())
    }

    fn add_points(&mut self, layer: PointsLayer) -> Result<(), SurfaceError> {
        self.layers.push(Layer::Points(layer));
        Ok(())
    }
}
