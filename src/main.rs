use clap::Parser;
use itertools::Itertools;
use log::{debug, error, info, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::current_num_threads;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::time::Instant;

mod background;
mod compose;
mod config;
mod error;
mod output;
mod preview;
mod schemas;
mod surface;
mod tables;

use background::{locate_background, open_background, Background};
use compose::{compose, discover_tables, CompositionInputs};
use config::{BackgroundConfig, LayerPaths, OverlayConfig};
use error::SpotviewError;
use output::LayerExport;
use preview::{Preview, DEFAULT_BAND_ROWS, DEFAULT_MAX_DIM};
use schemas::OutputFormat;
use surface::LayerStack;

const DEFAULT_OUTDIR: &str = "spotview-layers";

#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Experiment root holding Tables/ and Stitched_images/
    #[arg(long, default_value = ".")]
    rootdir: PathBuf,

    /// Directory of per-gene spot tables, overriding the layout default
    #[arg(long, default_value = None)]
    tables: Option<PathBuf>,

    /// Raster image or zarr array to use instead of the stitched image
    #[arg(long, default_value = None)]
    background: Option<PathBuf>,

    #[arg(long, default_value_t = false)]
    no_background: bool,

    /// Experiment folder with a stitched nuclei image (the default)
    #[arg(long, default_value_t = false, conflicts_with = "demo")]
    stitched: bool,

    /// Flat folder of demo tables
    #[arg(long, default_value_t = false)]
    demo: bool,

    #[arg(long, default_value = None)]
    cbr_min: Option<f64>,

    #[arg(long, default_value = None)]
    cbr_max: Option<f64>,

    #[arg(long, default_value = None)]
    cbr_column: Option<String>,

    #[arg(long, default_value = None)]
    point_size: Option<f64>,

    /// Show spot layers initially
    #[arg(long, default_value_t = false)]
    visible: bool,

    #[arg(long, default_value = None)]
    tile_threshold: Option<u64>,

    #[arg(long, default_value = None)]
    tile_grid: Option<u64>,

    #[arg(long, default_value = None)]
    raster_scale: Option<f64>,

    /// Regex matching gene names to leave out
    #[arg(long, default_value = None)]
    excluded_entities: Option<String>,

    /// Seed for layer colors
    #[arg(long, default_value = None)]
    seed: Option<u64>,

    /// Write a layer manifest and points tables here
    #[arg(short, long, default_value = None)]
    outdir: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = OutputFormat::Infer)]
    points_fmt: OutputFormat,

    /// Render a downsampled PNG of the composition
    #[arg(long, default_value = None)]
    preview: Option<PathBuf>,

    #[arg(long, default_value_t = DEFAULT_MAX_DIM)]
    preview_max_dim: u32,

    /// Draw spot layers in the preview even when they start hidden
    #[arg(long, default_value_t = false)]
    preview_hidden: bool,

    /// Rows of a background tile read at once while rendering the preview
    #[arg(long, default_value_t = DEFAULT_BAND_ROWS)]
    preview_band_rows: u64,

    #[arg(short = 't', long, default_value = None)]
    nthreads: Option<usize>,
}

// Unset options take the preset's values; explicit options win.
fn set_overlay_presets(args: &mut Args, preset: OverlayConfig) -> OverlayConfig {
    OverlayConfig {
        cbr_column: args
            .cbr_column
            .get_or_insert_with(|| preset.cbr_column.clone())
            .clone(),
        cbr_min: *args.cbr_min.get_or_insert(preset.cbr_min),
        cbr_max: *args.cbr_max.get_or_insert(preset.cbr_max),
        point_size: *args.point_size.get_or_insert(preset.point_size),
        visible: args.visible || preset.visible,
        ..preset
    }
}

fn set_background_presets(args: &mut Args, preset: BackgroundConfig) -> BackgroundConfig {
    BackgroundConfig {
        tile_threshold: *args.tile_threshold.get_or_insert(preset.tile_threshold),
        tile_grid: *args.tile_grid.get_or_insert(preset.tile_grid),
        raster_scale: *args.raster_scale.get_or_insert(preset.raster_scale),
        ..preset
    }
}

fn check_overlay_config(config: &OverlayConfig) -> Result<(), SpotviewError> {
    if !(config.cbr_min < config.cbr_max) {
        return Err(SpotviewError::Argument(format!(
            "--cbr-min ({}) must be less than --cbr-max ({})",
            config.cbr_min, config.cbr_max
        )));
    }
    if !(config.point_size > 0.0) {
        return Err(SpotviewError::Argument(String::from(
            "--point-size must be positive",
        )));
    }
    Ok(())
}

fn check_background_config(config: &BackgroundConfig) -> Result<(), SpotviewError> {
    if config.tile_grid == 0 {
        return Err(SpotviewError::Argument(String::from(
            "--tile-grid must be at least 1",
        )));
    }
    if !(config.raster_scale > 0.0) {
        return Err(SpotviewError::Argument(String::from(
            "--raster-scale must be positive",
        )));
    }
    Ok(())
}

// Background problems never stop a run; the overlays are still useful.
fn load_background(args: &Args, paths: &LayerPaths, config: &BackgroundConfig) -> Background {
    if args.no_background {
        info!("Background disabled");
        return Background::None;
    }

    let result = match &args.background {
        Some(path) => open_background(path, config),
        None if args.demo => {
            info!("Demo layout, no background");
            Ok(Background::None)
        }
        None => locate_background(&paths.rootdir, config),
    };

    result.unwrap_or_else(|err| {
        warn!("Unable to load background: {}", err);
        Background::None
    })
}

fn run(mut args: Args) -> Result<(), SpotviewError> {
    if let Some(nthreads) = args.nthreads {
        rayon::ThreadPoolBuilder::new()
            .num_threads(nthreads)
            .build_global()?;
    }
    info!("Using {} threads", current_num_threads());

    let layout = match (args.demo, args.stitched) {
        (true, _) => "demo",
        (false, true) => "stitched",
        (false, false) => "stitched (default)",
    };
    info!("Using the {} layout", layout);

    let overlay_preset = if args.demo {
        OverlayConfig::demo()
    } else {
        OverlayConfig::stitched()
    };
    let overlay = set_overlay_presets(&mut args, overlay_preset);
    check_overlay_config(&overlay)?;
    let background_cfg = set_background_presets(&mut args, BackgroundConfig::default());
    check_background_config(&background_cfg)?;

    let excluded_entities = args
        .excluded_entities
        .as_deref()
        .map(Regex::new)
        .transpose()?;

    let paths = LayerPaths::new(&args.rootdir, args.tables.as_deref(), args.demo);

    let t0 = Instant::now();
    let background = load_background(&args, &paths, &background_cfg);
    info!(
        "Background ready with {} layer(s) in {:?}",
        background.nlayers(),
        t0.elapsed()
    );

    let tables = discover_tables(&paths.tables_dir).unwrap_or_else(|err| {
        warn!(
            "Unable to list tables in {}: {}",
            paths.tables_dir.display(),
            err
        );
        Vec::new()
    });
    info!(
        "Found {} table(s) in {}",
        tables.len(),
        paths.tables_dir.display()
    );

    let mut rng = match args.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_os_rng(),
    };

    let mut stack = LayerStack::new();
    let summary = compose(
        CompositionInputs {
            tables,
            background: &background,
            overlay: &overlay,
            excluded_entities: excluded_entities.as_ref(),
        },
        &mut stack,
        &mut rng,
    )?;

    info!(
        "Composed {} background layer(s) and {} spot layer(s) ({} missing, {} failed, {} excluded)",
        summary.background_layers,
        summary.added.len(),
        summary.missing.len(),
        summary.failed.len(),
        summary.excluded.len()
    );
    debug!(
        "Layer order: {}",
        stack.layers.iter().map(|layer| layer.name()).join(", ")
    );
    for (entity, reason) in &summary.failed {
        warn!("{} was not loaded: {}", entity, reason);
    }

    let outdir = match (&args.outdir, &args.preview) {
        (None, None) => Some(PathBuf::from(DEFAULT_OUTDIR)),
        (outdir, _) => outdir.clone(),
    };

    if let Some(outdir) = outdir {
        write_export(&stack, &outdir, args.points_fmt)?;
    }

    if let Some(path) = &args.preview {
        let mut preview = Preview::new(path, args.preview_max_dim, args.preview_hidden)
            .with_band_rows(args.preview_band_rows);
        stack.replay(&mut preview)?;
        preview.finish()?;
    }

    Ok(())
}

fn write_export(stack: &LayerStack, outdir: &Path, fmt: OutputFormat) -> Result<(), SpotviewError> {
    let t0 = Instant::now();
    let mut export = LayerExport::new(outdir, fmt)?;
    stack.replay(&mut export)?;
    let manifest = export.finish()?;
    info!(
        "Exported {} layer(s) to {} in {:?}",
        stack.layers.len(),
        manifest.display(),
        t0.elapsed()
    );
    Ok(())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    if let Err(err) = run(args) {
        error!("{}", err);
        std::process::exit(1);
    }
}
