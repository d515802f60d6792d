// Tunables for overlay building and background location. Two presets match
// the two layouts seen in practice: a full experiment folder with a
// stitched nuclei image, and a flat folder of demo tables.

use std::path::{Path, PathBuf};

pub const DEFAULT_CBR_COLUMN: &str = "CBR";
pub const STITCHED_IMAGE_DIR: &str = "Stitched_images";
pub const TABLES_DIR: &str = "Tables";

#[derive(Clone, Debug, PartialEq)]
pub struct OverlayConfig {
    pub cbr_column: String,
    // Rows are kept when cbr_min < CBR < cbr_max.
    pub cbr_min: f64,
    pub cbr_max: f64,
    pub point_size: f64,
    pub opacity: f64,
    pub symbol: String,
    pub visible: bool,
}

impl OverlayConfig {
    /// Experiment folders with a stitched background. Spots start hidden so
    /// the nuclei image is readable until genes are toggled on.
    pub fn stitched() -> Self {
        OverlayConfig {
            cbr_column: String::from(DEFAULT_CBR_COLUMN),
            cbr_min: 2.0,
            cbr_max: 10.0,
            point_size: 1.0,
            opacity: 0.95,
            symbol: String::from("disc"),
            visible: false,
        }
    }

    /// Flat folders of demo tables, without a background image.
    pub fn demo() -> Self {
        OverlayConfig {
            cbr_min: 2.2,
            cbr_max: 7.0,
            visible: true,
            ..OverlayConfig::stitched()
        }
    }
}

impl Default for OverlayConfig {
    fn default() -> Self {
        OverlayConfig::stitched()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct BackgroundConfig {
    pub image_dir: String,
    // Single file rasters, tried in order.
    pub raster_candidates: Vec<String>,
    pub zarr_name: String,
    pub use_zarr: bool,
    pub raster_scale: f64,
    // Chunked arrays whose larger side exceeds this are split into tiles.
    pub tile_threshold: u64,
    pub tile_grid: u64,
    pub contrast_limits: (f32, f32),
    pub colormap: String,
    pub blending: String,
    pub opacity: f64,
}

impl Default for BackgroundConfig {
    fn default() -> Self {
        BackgroundConfig {
            image_dir: String::from(STITCHED_IMAGE_DIR),
            raster_candidates: vec![
                String::from("nuclei_stitched_Cycle_1.tif"),
                String::from("nuclei_stitched_coarse_cycle_1.tif"),
            ],
            zarr_name: String::from("nuclei_stitched_Cycle_1.zarr"),
            use_zarr: true,
            raster_scale: 4.0,
            tile_threshold: 33766,
            tile_grid: 2,
            contrast_limits: (0.0, 33000.0),
            colormap: String::from("gray_r"),
            blending: String::from("additive"),
            opacity: 1.0,
        }
    }
}

/// Where inputs live for one run.
#[derive(Clone, Debug)]
pub struct LayerPaths {
    pub rootdir: PathBuf,
    pub tables_dir: PathBuf,
}

impl LayerPaths {
    // The stitched layout keeps tables under Tables/. The demo layout keeps
    // them directly in the root.
    pub fn new(rootdir: &Path, tables_dir: Option<&Path>, demo_layout: bool) -> Self {
        let tables_dir = match tables_dir {
            Some(dir) => dir.to_path_buf(),
            None if demo_layout => rootdir.to_path_buf(),
            None => rootdir.join(TABLES_DIR),
        };
        LayerPaths {
            rootdir: rootdir.to_path_buf(),
            tables_dir,
        }
    }
}
