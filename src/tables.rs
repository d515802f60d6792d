// Per-gene spot tables: parsing, CBR filtering, deduplication, and the
// overlay each table becomes.

use flate2::read::GzDecoder;
use itertools::Itertools;
use log::{debug, info, warn};
use rand::Rng;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use crate::config::OverlayConfig;
use crate::error::TableError;

pub const X_COLUMN: &str = "x";
pub const Y_COLUMN: &str = "y";
pub const SPOT_X_COLUMN: &str = "Spot location (X)";
pub const SPOT_Y_COLUMN: &str = "Spot location (Y)";
pub const LAYER_NAME_SUFFIX: &str = "_CBR";

// Cells treated as missing values rather than malformed input.
const MISSING_VALUES: [&str; 8] = ["", "nan", "na", "n/a", "null", "none", "<na>", "#n/a"];

/// A spot position in image axis order: `row` is the Y coordinate, `col`
/// the X coordinate.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Point {
    pub row: f64,
    pub col: f64,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Rgb {
    pub r: f32,
    pub g: f32,
    pub b: f32,
}

impl Rgb {
    // Blue is drawn from a narrower range to avoid near-black overlays.
    pub fn random<R: Rng + ?Sized>(rng: &mut R) -> Self {
        Rgb {
            r: rng.random_range(0.0..=1.0),
            g: rng.random_range(0.0..=1.0),
            b: rng.random_range(0.2..=1.0),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct SpotRecord {
    pub row: f64,
    pub col: f64,
    pub cbr: Option<f64>,
}

pub struct SpotTable {
    pub entity: String,
    pub records: Vec<SpotRecord>,
    pub nrows: usize,
    pub has_coordinates: bool,
    pub has_cbr: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct EntityOverlay {
    pub entity: String,
    pub name: String,
    pub points: Vec<Point>,
    pub color: Rgb,
}

impl EntityOverlay {
    pub fn new(entity: String, points: Vec<Point>, color: Rgb) -> Self {
        let name = format!("{}{}", entity, LAYER_NAME_SUFFIX);
        EntityOverlay {
            entity,
            name,
            points,
            color,
        }
    }
}

/// Entity name for a table file: the file name without `.csv` or `.csv.gz`.
pub fn entity_name(path: &Path) -> String {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let lower = name.to_ascii_lowercase();
    for ext in [".csv.gz", ".csv"] {
        if lower.ends_with(ext) {
            return name[..name.len() - ext.len()].to_string();
        }
    }
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or(name)
}

fn find_column(headers: &csv::StringRecord, column: &str) -> Option<usize> {
    headers.iter().position(|x| x.trim() == column)
}

// Ok(None) marks a missing value.
fn parse_value(value: &str) -> Result<Option<f64>, ()> {
    let value = value.trim();
    if MISSING_VALUES.contains(&value.to_ascii_lowercase().as_str()) {
        return Ok(None);
    }
    match value.parse::<f64>() {
        Ok(v) if v.is_nan() => Ok(None),
        Ok(v) => Ok(Some(v)),
        Err(_) => Err(()),
    }
}

pub fn read_spot_table(path: &Path, cbr_column: &str) -> Result<SpotTable, TableError> {
    let file = File::open(path).map_err(|source| TableError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let is_gz = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("gz"))
        .unwrap_or(false);

    if is_gz {
        read_spot_table_from_reader(GzDecoder::new(file), path, cbr_column)
    } else {
        read_spot_table_from_reader(file, path, cbr_column)
    }
}

fn read_spot_table_from_reader<T>(
    input: T,
    path: &Path,
    cbr_column: &str,
) -> Result<SpotTable, TableError>
where
    T: Read,
{
    let csv_err = |source: csv::Error| TableError::Csv {
        path: path.to_path_buf(),
        source,
    };

    let mut rdr = csv::Reader::from_reader(input);
    let headers = rdr.headers().map_err(csv_err)?.clone();

    // The named spot location columns take precedence over plain x/y.
    let named = (
        find_column(&headers, SPOT_Y_COLUMN),
        find_column(&headers, SPOT_X_COLUMN),
    );
    let plain = (
        find_column(&headers, Y_COLUMN),
        find_column(&headers, X_COLUMN),
    );
    let coordinate_cols = match (named, plain) {
        ((Some(row_col), Some(col_col)), _) => Some((row_col, col_col, SPOT_Y_COLUMN, SPOT_X_COLUMN)),
        (_, (Some(row_col), Some(col_col))) => Some((row_col, col_col, Y_COLUMN, X_COLUMN)),
        _ => None,
    };
    let cbr_col = find_column(&headers, cbr_column);

    let mut table = SpotTable {
        entity: entity_name(path),
        records: Vec::new(),
        nrows: 0,
        has_coordinates: coordinate_cols.is_some(),
        has_cbr: cbr_col.is_some(),
    };

    let mut ndropped = 0;
    for (i, result) in rdr.records().enumerate() {
        let row = result.map_err(csv_err)?;
        table.nrows += 1;

        let Some((row_col, col_col, row_name, col_name)) = coordinate_cols else {
            continue;
        };

        let line = row.position().map(|pos| pos.line()).unwrap_or(i as u64 + 2);
        let parse = |idx: usize, column: &str| {
            let value = row.get(idx).unwrap_or("");
            parse_value(value).map_err(|_| TableError::Parse {
                path: path.to_path_buf(),
                line,
                column: column.to_string(),
                value: value.to_string(),
            })
        };

        let y = parse(row_col, row_name)?;
        let x = parse(col_col, col_name)?;
        let cbr = match cbr_col {
            Some(idx) => parse(idx, cbr_column)?,
            None => None,
        };

        match (y, x) {
            (Some(y), Some(x)) => table.records.push(SpotRecord { row: y, col: x, cbr }),
            _ => ndropped += 1,
        }
    }

    if ndropped > 0 {
        debug!(
            "{}: dropped {} rows without coordinates",
            table.entity, ndropped
        );
    }

    Ok(table)
}

// Exact equality, with 0.0 and -0.0 treated as the same coordinate.
fn coordinate_key(p: &Point) -> (u64, u64) {
    let bits = |v: f64| if v == 0.0 { 0 } else { v.to_bits() };
    (bits(p.row), bits(p.col))
}

/// Apply the CBR window and ordering, then drop duplicate positions keeping
/// the first occurrence.
pub fn select_points(table: &SpotTable, config: &OverlayConfig) -> Vec<Point> {
    let ordered: Vec<&SpotRecord> = if table.has_cbr {
        let mut kept: Vec<(f64, &SpotRecord)> = table
            .records
            .iter()
            .filter_map(|record| match record.cbr {
                Some(cbr) if cbr > config.cbr_min && cbr < config.cbr_max => Some((cbr, record)),
                _ => None,
            })
            .collect();
        kept.sort_by(|a, b| a.0.total_cmp(&b.0));
        kept.into_iter().map(|(_, record)| record).collect()
    } else {
        table.records.iter().collect()
    };

    ordered
        .into_iter()
        .map(|record| Point {
            row: record.row,
            col: record.col,
        })
        .unique_by(coordinate_key)
        .collect()
}

/// Read and filter one table. A missing file is not an error and gives
/// `Ok(None)`.
pub fn load_points(path: &Path, config: &OverlayConfig) -> Result<Option<Vec<Point>>, TableError> {
    if !path.is_file() {
        info!(
            "{} file does not exist in {}",
            entity_name(path),
            path.display()
        );
        return Ok(None);
    }

    let table = read_spot_table(path, &config.cbr_column)?;
    if !table.has_coordinates {
        warn!(
            "{}: no '{}'/'{}' or '{}'/'{}' columns, overlay will be empty",
            table.entity, X_COLUMN, Y_COLUMN, SPOT_X_COLUMN, SPOT_Y_COLUMN
        );
    }

    let points = select_points(&table, config);
    debug!(
        "{}: kept {} of {} rows",
        table.entity,
        points.len(),
        table.nrows
    );
    Ok(Some(points))
}

pub fn build_overlay<R: Rng + ?Sized>(
    path: &Path,
    config: &OverlayConfig,
    rng: &mut R,
) -> Result<Option<EntityOverlay>, TableError> {
    let Some(points) = load_points(path, config)? else {
        return Ok(None);
    };
    Ok(Some(EntityOverlay::new(
        entity_name(path),
        points,
        Rgb::random(rng),
    )))
}
