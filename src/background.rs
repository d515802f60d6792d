// Locating the stitched nuclei image for an experiment and splitting large
// chunked arrays into tiles that can be read independently.

mod raster;
pub mod zarr;

use log::{debug, info};
use ndarray::Array2;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::BackgroundConfig;
use crate::error::BackgroundError;
pub use raster::read_grayscale;
pub use zarr::ChunkedArray;

#[derive(Clone, Debug, PartialEq)]
pub struct DisplaySettings {
    pub colormap: String,
    pub blending: String,
    pub opacity: f64,
    pub contrast_limits: Option<(f32, f32)>,
}

/// A rectangle of the source array, in pixels.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct TileRegion {
    pub row_offset: u64,
    pub col_offset: u64,
    pub rows: u64,
    pub cols: u64,
}

impl TileRegion {
    pub fn row_range(&self) -> Range<u64> {
        self.row_offset..self.row_offset + self.rows
    }

    pub fn col_range(&self) -> Range<u64> {
        self.col_offset..self.col_offset + self.cols
    }

    pub fn area(&self) -> u64 {
        self.rows * self.cols
    }
}

/// Split a (rows, cols) array into tiles. Arrays whose larger side exceeds
/// `threshold` become a `grid` x `grid` partition with boundaries at
/// `k * extent / grid`; anything else is a single tile at the origin.
pub fn plan_tiles(rows: u64, cols: u64, threshold: u64, grid: u64) -> Vec<TileRegion> {
    let grid = if rows.max(cols) > threshold {
        grid.max(1)
    } else {
        1
    };

    let bounds = |extent: u64| -> Vec<u64> { (0..=grid).map(|k| k * extent / grid).collect() };
    let row_bounds = bounds(rows);
    let col_bounds = bounds(cols);

    let mut tiles = Vec::with_capacity((grid * grid) as usize);
    for rb in row_bounds.windows(2) {
        for cb in col_bounds.windows(2) {
            let tile = TileRegion {
                row_offset: rb[0],
                col_offset: cb[0],
                rows: rb[1] - rb[0],
                cols: cb[1] - cb[0],
            };
            if tile.area() > 0 || grid == 1 {
                tiles.push(tile);
            }
        }
    }
    tiles
}

/// One lazily read piece of a chunked background. Pixels are only fetched by
/// `read_rows`.
#[derive(Clone)]
pub struct Tile {
    pub source: Arc<ChunkedArray>,
    pub region: TileRegion,
    pub display: DisplaySettings,
}

impl Tile {
    // Rows are relative to the tile and clipped to it.
    pub fn read_rows(&self, rows: Range<u64>) -> Result<Array2<f32>, BackgroundError> {
        let full = self.region.row_range();
        let start = (full.start + rows.start).min(full.end);
        let end = (full.start + rows.end).clamp(start, full.end);
        self.source.read_region(start..end, self.region.col_range())
    }

    pub fn translate(&self) -> (f64, f64) {
        (self.region.row_offset as f64, self.region.col_offset as f64)
    }
}

pub struct RasterBackground {
    pub path: PathBuf,
    pub pixels: Arc<Array2<f32>>,
    pub scale: f64,
    pub display: DisplaySettings,
}

pub struct TiledBackground {
    pub path: PathBuf,
    pub shape: (u64, u64),
    pub tiles: Vec<Tile>,
}

pub enum Background {
    None,
    Raster(RasterBackground),
    Tiled(TiledBackground),
}

impl Background {
    pub fn nlayers(&self) -> usize {
        match self {
            Background::None => 0,
            Background::Raster(_) => 1,
            Background::Tiled(tiled) => tiled.tiles.len(),
        }
    }
}

pub fn open_raster(
    path: &Path,
    config: &BackgroundConfig,
) -> Result<RasterBackground, BackgroundError> {
    let pixels = read_grayscale(path)?;
    info!(
        "Read stitched raster {} ({} x {})",
        path.display(),
        pixels.nrows(),
        pixels.ncols()
    );
    Ok(RasterBackground {
        path: path.to_path_buf(),
        pixels: Arc::new(pixels),
        scale: config.raster_scale,
        display: DisplaySettings {
            colormap: config.colormap.clone(),
            blending: config.blending.clone(),
            opacity: config.opacity,
            contrast_limits: None,
        },
    })
}

pub fn open_tiled(path: &Path, config: &BackgroundConfig) -> Result<TiledBackground, BackgroundError> {
    let source = Arc::new(ChunkedArray::open(path)?);
    let (rows, cols) = source.dims();
    let regions = plan_tiles(rows, cols, config.tile_threshold, config.tile_grid);
    info!(
        "Opened chunked array {} with shape {:?}, {} tile(s)",
        path.display(),
        source.shape(),
        regions.len()
    );

    let display = DisplaySettings {
        colormap: config.colormap.clone(),
        blending: config.blending.clone(),
        opacity: config.opacity,
        contrast_limits: Some(config.contrast_limits),
    };
    let tiles = regions
        .into_iter()
        .map(|region| Tile {
            source: source.clone(),
            region,
            display: display.clone(),
        })
        .collect();

    Ok(TiledBackground {
        path: path.to_path_buf(),
        shape: (rows, cols),
        tiles,
    })
}

pub type Strategy = fn(&Path, &BackgroundConfig) -> Result<Option<Background>, BackgroundError>;

/// Single file raster under the stitched image directory, trying each
/// configured file name in turn.
pub fn stitched_raster(
    root: &Path,
    config: &BackgroundConfig,
) -> Result<Option<Background>, BackgroundError> {
    for name in &config.raster_candidates {
        let path = root.join(&config.image_dir).join(name);
        if path.is_file() {
            return Ok(Some(Background::Raster(open_raster(&path, config)?)));
        }
        debug!("No stitched raster at {}", path.display());
    }
    Ok(None)
}

pub fn stitched_zarr(
    root: &Path,
    config: &BackgroundConfig,
) -> Result<Option<Background>, BackgroundError> {
    let path = root.join(&config.image_dir).join(&config.zarr_name);
    if !path.is_dir() {
        debug!("No stitched zarr at {}", path.display());
        return Ok(None);
    }
    Ok(Some(Background::Tiled(open_tiled(&path, config)?)))
}

pub fn candidate_strategies(config: &BackgroundConfig) -> Vec<(&'static str, Strategy)> {
    let mut strategies: Vec<(&'static str, Strategy)> = vec![("stitched raster", stitched_raster as Strategy)];
    if config.use_zarr {
        strategies.push(("stitched zarr", stitched_zarr as Strategy));
    }
    strategies
}

/// Find the background for an experiment root. The first candidate that
/// exists wins; finding none is not an error.
pub fn locate_background(
    root: &Path,
    config: &BackgroundConfig,
) -> Result<Background, BackgroundError> {
    for (name, strategy) in candidate_strategies(config) {
        if let Some(background) = strategy(root, config)? {
            info!("Using {} background", name);
            return Ok(background);
        }
    }
    info!(
        "No stitched background found under {}",
        root.join(&config.image_dir).display()
    );
    Ok(Background::None)
}

/// Load an explicitly given background: directories are opened as zarr
/// arrays, files as rasters.
pub fn open_background(path: &Path, config: &BackgroundConfig) -> Result<Background, BackgroundError> {
    if path.is_dir() {
        Ok(Background::Tiled(open_tiled(path, config)?))
    } else if path.is_file() {
        Ok(Background::Raster(open_raster(path, config)?))
    } else {
        info!("Background {} does not exist", path.display());
        Ok(Background::None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Luma};
    use std::collections::HashSet;
    use tempfile::TempDir;

    fn assert_partition(tiles: &[TileRegion], rows: u64, cols: u64) {
        let total: u64 = tiles.iter().map(|t| t.area()).sum();
        assert_eq!(total, rows * cols);
        for (i, a) in tiles.iter().enumerate() {
            assert!(a.row_range().end <= rows && a.col_range().end <= cols);
            for b in &tiles[i + 1..] {
                let rows_overlap =
                    a.row_offset < b.row_range().end && b.row_offset < a.row_range().end;
                let cols_overlap =
                    a.col_offset < b.col_range().end && b.col_offset < a.col_range().end;
                assert!(!(rows_overlap && cols_overlap), "{:?} overlaps {:?}", a, b);
            }
        }
    }

    #[test]
    fn test_oversized_array_splits_into_quadrants() {
        let tiles = plan_tiles(40000, 20000, 33766, 2);
        assert_eq!(tiles.len(), 4);
        let offsets: HashSet<(u64, u64)> =
            tiles.iter().map(|t| (t.row_offset, t.col_offset)).collect();
        let expected: HashSet<(u64, u64)> = [(0, 0), (0, 10000), (20000, 0), (20000, 10000)]
            .into_iter()
            .collect();
        assert_eq!(offsets, expected);
        assert!(tiles.iter().all(|t| t.rows == 20000 && t.cols == 10000));
        assert_partition(&tiles, 40000, 20000);
    }

    #[test]
    fn test_small_array_is_single_tile() {
        let tiles = plan_tiles(10000, 10000, 33766, 2);
        assert_eq!(
            tiles,
            vec![TileRegion {
                row_offset: 0,
                col_offset: 0,
                rows: 10000,
                cols: 10000
            }]
        );
    }

    #[test]
    fn test_threshold_is_exclusive() {
        assert_eq!(plan_tiles(33766, 100, 33766, 2).len(), 1);
        assert_eq!(plan_tiles(100, 33767, 33766, 2).len(), 4);
    }

    #[test]
    fn test_odd_extents_still_partition() {
        let tiles = plan_tiles(40001, 33767, 33766, 3);
        assert_eq!(tiles.len(), 9);
        assert_partition(&tiles, 40001, 33767);
    }

    fn stitched_dir(root: &Path) -> PathBuf {
        let dir = root.join("Stitched_images");
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn write_raster(path: &Path) {
        let img: ImageBuffer<Luma<u16>, Vec<u16>> =
            ImageBuffer::from_fn(8, 6, |x, y| Luma([(x + y) as u16]));
        img.save(path).unwrap();
    }

    #[test]
    fn test_nothing_found_is_not_an_error() {
        let root = TempDir::new().unwrap();
        let background = locate_background(root.path(), &BackgroundConfig::default()).unwrap();
        assert!(matches!(background, Background::None));
        assert_eq!(background.nlayers(), 0);
    }

    #[test]
    fn test_raster_preferred_over_zarr() {
        let root = TempDir::new().unwrap();
        let dir = stitched_dir(root.path());
        write_raster(&dir.join("nuclei_stitched_Cycle_1.tif"));
        zarr::tests::write_test_array(&dir.join("nuclei_stitched_Cycle_1.zarr"), "/", &[4, 4]);

        match locate_background(root.path(), &BackgroundConfig::default()).unwrap() {
            Background::Raster(raster) => {
                assert_eq!(raster.pixels.dim(), (6, 8));
                assert_eq!(raster.scale, 4.0);
                assert_eq!(raster.display.contrast_limits, None);
                assert_eq!(raster.display.colormap, "gray_r");
            }
            _ => panic!("expected raster background"),
        }
    }

    #[test]
    fn test_coarse_raster_fallback() {
        let root = TempDir::new().unwrap();
        let dir = stitched_dir(root.path());
        write_raster(&dir.join("nuclei_stitched_coarse_cycle_1.tif"));

        match locate_background(root.path(), &BackgroundConfig::default()).unwrap() {
            Background::Raster(raster) => {
                assert!(raster.path.ends_with("nuclei_stitched_coarse_cycle_1.tif"))
            }
            _ => panic!("expected raster background"),
        }
    }

    #[test]
    fn test_zarr_tiles_read_lazily() {
        let root = TempDir::new().unwrap();
        let dir = stitched_dir(root.path());
        zarr::tests::write_test_array(&dir.join("nuclei_stitched_Cycle_1.zarr"), "/", &[6, 10]);

        let config = BackgroundConfig {
            tile_threshold: 8,
            ..BackgroundConfig::default()
        };
        let Background::Tiled(tiled) = locate_background(root.path(), &config).unwrap() else {
            panic!("expected tiled background");
        };
        assert_eq!(tiled.shape, (6, 10));
        assert_eq!(tiled.tiles.len(), 4);

        let last = &tiled.tiles[3];
        assert_eq!(last.translate(), (3.0, 5.0));
        assert_eq!(last.display.contrast_limits, Some((0.0, 33000.0)));
        let pixels = last.read_rows(0..last.region.rows).unwrap();
        assert_eq!(pixels.dim(), (3, 5));
        assert_eq!(pixels[[0, 0]], 305.0);

        let band = last.read_rows(1..10).unwrap();
        assert_eq!(band.dim(), (2, 5));
        assert_eq!(band[[1, 4]], 509.0);
    }

    #[test]
    fn test_zarr_disabled() {
        let root = TempDir::new().unwrap();
        let dir = stitched_dir(root.path());
        zarr::tests::write_test_array(&dir.join("nuclei_stitched_Cycle_1.zarr"), "/", &[4, 4]);

        let config = BackgroundConfig {
            use_zarr: false,
            ..BackgroundConfig::default()
        };
        assert!(matches!(
            locate_background(root.path(), &config).unwrap(),
            Background::None
        ));
    }

    #[test]
    fn test_corrupt_raster_is_reported() {
        let root = TempDir::new().unwrap();
        let dir = stitched_dir(root.path());
        std::fs::write(dir.join("nuclei_stitched_Cycle_1.tif"), b"garbage").unwrap();
        assert!(locate_background(root.path(), &BackgroundConfig::default()).is_err());
    }

    #[test]
    fn test_open_background_by_path() {
        let root = TempDir::new().unwrap();
        let path = root.path().join("image.zarr");
        zarr::tests::write_test_array(&path, "/", &[4, 4]);
        let config = BackgroundConfig::default();
        assert_eq!(open_background(&path, &config).unwrap().nlayers(), 1);
        assert!(matches!(
            open_background(&root.path().join("missing.tif"), &config).unwrap(),
            Background::None
        ));
    }
}
