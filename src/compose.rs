// Assemble the layer stack: background layers first so the spot overlays
// draw on top, then one points layer per gene table.

use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, error, info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use regex::Regex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::background::Background;
use crate::config::OverlayConfig;
use crate::error::{SurfaceError, TableError};
use crate::surface::{ImageLayer, ImageSource, PointsLayer, RenderSurface};
use crate::tables::{build_overlay, entity_name, EntityOverlay};

pub struct CompositionInputs<'a> {
    pub tables: Vec<PathBuf>,
    pub background: &'a Background,
    pub overlay: &'a OverlayConfig,
    pub excluded_entities: Option<&'a Regex>,
}

#[derive(Debug, Default)]
pub struct CompositionSummary {
    pub background_layers: usize,
    pub added: Vec<String>,
    pub missing: Vec<String>,
    pub failed: Vec<(String, String)>,
    pub excluded: Vec<String>,
}

fn is_table(path: &Path) -> bool {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    name.ends_with(".csv") || name.ends_with(".csv.gz")
}

/// List the per-gene tables in a directory, sorted by path. A missing
/// directory gives an empty list.
pub fn discover_tables(dir: &Path) -> Result<Vec<PathBuf>, std::io::Error> {
    if !dir.is_dir() {
        warn!("Table directory {} does not exist", dir.display());
        return Ok(Vec::new());
    }

    let mut tables = Vec::new();
    for entry in dir.read_dir()? {
        let path = entry?.path();
        if path.is_file() && is_table(&path) {
            tables.push(path);
        }
    }
    tables.sort();

    // One table per entity: `Gad1.csv` wins over `Gad1.csv.gz`.
    let mut seen = HashSet::new();
    tables.retain(|path| {
        let entity = entity_name(path);
        if seen.insert(entity.clone()) {
            true
        } else {
            warn!("Ignoring {}, {} already has a table", path.display(), entity);
            false
        }
    });
    Ok(tables)
}

fn layer_stem(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| String::from("background"))
}

pub fn background_layers(background: &Background) -> Vec<ImageLayer> {
    match background {
        Background::None => Vec::new(),
        Background::Raster(raster) => vec![ImageLayer {
            name: layer_stem(&raster.path),
            source: ImageSource::Raster {
                path: raster.path.clone(),
                pixels: raster.pixels.clone(),
            },
            display: raster.display.clone(),
            scale: (raster.scale, raster.scale),
            translate: (0.0, 0.0),
        }],
        Background::Tiled(tiled) => {
            let stem = layer_stem(&tiled.path);
            let ntiles = tiled.tiles.len();
            debug!(
                "{}: {} x {} pixels in {} tile layer(s)",
                stem, tiled.shape.0, tiled.shape.1, ntiles
            );
            tiled
                .tiles
                .iter()
                .enumerate()
                .map(|(i, tile)| ImageLayer {
                    name: if ntiles == 1 {
                        stem.clone()
                    } else {
                        format!("{}_tile{}", stem, i)
                    },
                    source: ImageSource::Tile(tile.clone()),
                    display: tile.display.clone(),
                    scale: (1.0, 1.0),
                    translate: tile.translate(),
                })
                .collect()
        }
    }
}

pub fn points_layer(overlay: EntityOverlay, config: &OverlayConfig) -> PointsLayer {
    PointsLayer {
        name: overlay.name,
        entity: overlay.entity,
        points: overlay.points,
        face_color: overlay.color,
        edge_color: overlay.color,
        opacity: config.opacity,
        symbol: config.symbol.clone(),
        size: config.point_size,
        visible: config.visible,
    }
}

type LoadResult = (String, Result<Option<EntityOverlay>, TableError>);

// Each table gets its own color stream seeded from the caller's rng, so the
// result does not depend on which thread builds which overlay.
fn load_all(tables: &[(PathBuf, u64)], config: &OverlayConfig) -> Vec<LoadResult> {
    let progress = ProgressBar::new(tables.len() as u64);
    if let Ok(style) = ProgressStyle::with_template("{bar:40} {pos}/{len} tables") {
        progress.set_style(style);
    }

    // Collected in input order regardless of which thread finishes first.
    let loaded = tables
        .par_iter()
        .map(|(path, seed)| {
            let mut rng = StdRng::seed_from_u64(*seed);
            let result = (entity_name(path), build_overlay(path, config, &mut rng));
            progress.inc(1);
            result
        })
        .collect();
    progress.finish_and_clear();
    loaded
}

/// Build every layer and hand it to `surface`. Missing or malformed tables
/// are recorded in the summary and skipped; only surface failures abort.
pub fn compose<R: Rng + ?Sized>(
    inputs: CompositionInputs,
    surface: &mut dyn RenderSurface,
    rng: &mut R,
) -> Result<CompositionSummary, SurfaceError> {
    let mut summary = CompositionSummary::default();

    for layer in background_layers(inputs.background) {
        surface.add_image(layer)?;
        summary.background_layers += 1;
    }

    // Seeds are drawn serially in table order so a seeded rng reproduces
    // every color.
    let mut tables = Vec::with_capacity(inputs.tables.len());
    for path in inputs.tables {
        let entity = entity_name(&path);
        match inputs.excluded_entities {
            Some(pattern) if pattern.is_match(&entity) => {
                info!("Excluding {}", entity);
                summary.excluded.push(entity);
            }
            _ => tables.push((path, rng.next_u64())),
        }
    }

    let t0 = Instant::now();
    let loaded = load_all(&tables, inputs.overlay);
    info!("Read {} tables in {:?}", tables.len(), t0.elapsed());

    for (entity, result) in loaded {
        match result {
            Ok(Some(overlay)) => {
                info!("{}: {} spots", entity, overlay.points.len());
                surface.add_points(points_layer(overlay, inputs.overlay))?;
                summary.added.push(entity);
            }
            Ok(None) => summary.missing.push(entity),
            Err(err) => {
                error!("Skipping {}: {}", entity, err);
                summary.failed.push((entity, err.to_string()));
            }
        }
    }

    Ok(summary)
}
