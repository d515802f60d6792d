// Layer export: a JSON manifest describing every layer in draw order, plus
// one coordinates table per points layer. Background pixels are referenced
// by source path and region rather than copied.

use arrow::array::{Float64Array, RecordBatch};
use flate2::write::GzEncoder;
use flate2::Compression;
use json::JsonValue;
use log::info;
use parquet::arrow::ArrowWriter;
use parquet::basic::{Compression::ZSTD, ZstdLevel};
use parquet::file::properties::WriterProperties;
use std::collections::HashSet;
use std::fs::{create_dir_all, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::background::DisplaySettings;
use crate::error::SurfaceError;
use crate::schemas::{determine_format, points_schema, OutputFormat};
use crate::surface::{ImageLayer, ImageSource, PointsLayer, RenderSurface};
use crate::tables::{Point, Rgb};

pub const MANIFEST_NAME: &str = "layers.json";
pub const POINTS_DIR: &str = "points";

pub struct LayerExport {
    outdir: PathBuf,
    fmt: OutputFormat,
    layers: Vec<JsonValue>,
    // Points files already written, relative to `outdir`.
    written: HashSet<PathBuf>,
}

impl LayerExport {
    pub fn new(outdir: &Path, fmt: OutputFormat) -> Result<Self, SurfaceError> {
        create_dir_all(outdir.join(POINTS_DIR))?;
        Ok(LayerExport {
            outdir: outdir.to_path_buf(),
            fmt: if fmt == OutputFormat::Infer {
                OutputFormat::Csv
            } else {
                fmt
            },
            layers: Vec::new(),
            written: HashSet::new(),
        })
    }

    // Distinct layer names can sanitize to the same file name, so later
    // layers get a numeric suffix.
    fn points_path(&mut self, name: &str) -> PathBuf {
        let stem = file_safe(name);
        let ext = self.fmt.extension();
        let mut relpath = Path::new(POINTS_DIR).join(format!("{}.{}", stem, ext));
        let mut n = 2;
        while self.written.contains(&relpath) {
            relpath = Path::new(POINTS_DIR).join(format!("{}_{}.{}", stem, n, ext));
            n += 1;
        }
        self.written.insert(relpath.clone());
        relpath
    }

    /// Write the manifest and return its path.
    pub fn finish(self) -> Result<PathBuf, SurfaceError> {
        let mut manifest = JsonValue::new_object();
        manifest.insert("layers", JsonValue::from(self.layers))?;

        let path = self.outdir.join(MANIFEST_NAME);
        let mut output = File::create(&path)?;
        output.write_all(manifest.pretty(2).as_bytes())?;
        info!("Wrote layer manifest to {}", path.display());
        Ok(path)
    }
}

fn color_json(color: Rgb) -> JsonValue {
    JsonValue::from(vec![color.r, color.g, color.b])
}

fn display_json(entry: &mut JsonValue, display: &DisplaySettings) -> Result<(), json::Error> {
    entry.insert("colormap", display.colormap.as_str())?;
    entry.insert("blending", display.blending.as_str())?;
    entry.insert("opacity", display.opacity)?;
    entry.insert(
        "contrast_limits",
        display.contrast_limits.map(|(lo, hi)| vec![lo, hi]),
    )?;
    Ok(())
}

// Layer names become file names.
fn file_safe(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

impl RenderSurface for LayerExport {
    fn add_image(&mut self, layer: ImageLayer) -> Result<(), SurfaceError> {
        let mut source = JsonValue::new_object();
        match &layer.source {
            ImageSource::Raster { path, .. } => {
                source.insert("kind", "raster")?;
                source.insert("path", path.to_string_lossy().into_owned())?;
            }
            ImageSource::Tile(tile) => {
                source.insert("kind", "zarr")?;
                source.insert("path", tile.source.path().to_string_lossy().into_owned())?;
                source.insert("node", tile.source.node())?;
                source.insert(
                    "region",
                    vec![
                        tile.region.row_offset,
                        tile.region.col_offset,
                        tile.region.rows,
                        tile.region.cols,
                    ],
                )?;
            }
        }

        let (rows, cols) = layer.shape();
        let mut entry = JsonValue::new_object();
        entry.insert("type", "image")?;
        entry.insert("name", layer.name.as_str())?;
        entry.insert("source", source)?;
        entry.insert("shape", vec![rows, cols])?;
        entry.insert("scale", vec![layer.scale.0, layer.scale.1])?;
        entry.insert("translate", vec![layer.translate.0, layer.translate.1])?;
        display_json(&mut entry, &layer.display)?;

        self.layers.push(entry);
        Ok(())
    }

    fn add_points(&mut self, layer: PointsLayer) -> Result<(), SurfaceError> {
        let relpath = self.points_path(&layer.name);
        write_points(&self.outdir.join(&relpath), self.fmt, &layer.points)?;

        let mut entry = JsonValue::new_object();
        entry.insert("type", "points")?;
        entry.insert("name", layer.name.as_str())?;
        entry.insert("entity", layer.entity.as_str())?;
        entry.insert("path", relpath.to_string_lossy().into_owned())?;
        entry.insert("count", layer.points.len())?;
        entry.insert("face_color", color_json(layer.face_color))?;
        entry.insert("edge_color", color_json(layer.edge_color))?;
        entry.insert("opacity", layer.opacity)?;
        entry.insert("symbol", layer.symbol.as_str())?;
        entry.insert("size", layer.size)?;
        entry.insert("visible", layer.visible)?;

        self.layers.push(entry);
        Ok(())
    }
}

pub fn write_points(path: &Path, fmt: OutputFormat, points: &[Point]) -> Result<(), SurfaceError> {
    let fmt = determine_format(&path.to_string_lossy(), fmt)?;
    let schema = Arc::new(points_schema());
    let batch = RecordBatch::try_new(
        schema.clone(),
        vec![
            Arc::new(points.iter().map(|p| p.row).collect::<Float64Array>()),
            Arc::new(points.iter().map(|p| p.col).collect::<Float64Array>()),
        ],
    )?;

    let file = File::create(path)?;
    match fmt {
        OutputFormat::Csv | OutputFormat::Infer => {
            let mut writer = arrow::csv::WriterBuilder::new()
                .with_header(true)
                .build(file);
            writer.write(&batch)?;
        }
        OutputFormat::CsvGz => {
            let encoder = GzEncoder::new(file, Compression::default());
            let mut writer = arrow::csv::WriterBuilder::new()
                .with_header(true)
                .build(encoder);
            writer.write(&batch)?;
            writer.into_inner().finish()?;
        }
        OutputFormat::Parquet => {
            let props = WriterProperties::builder()
                .set_compression(ZSTD(ZstdLevel::default()))
                .build();
            let mut writer = ArrowWriter::try_new(file, schema, Some(props))?;
            writer.write(&batch)?;
            writer.close()?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::background::{open_tiled, zarr, Background};
    use crate::compose::background_layers;
    use crate::config::BackgroundConfig;
    use flate2::read::GzDecoder;
    use ndarray::Array2;
    use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
    use std::io::Read;
    use tempfile::TempDir;

    fn points_layer(name: &str, points: Vec<Point>) -> PointsLayer {
        let color = Rgb {
            r: 0.25,
            g: 0.5,
            b: 1.0,
        };
        PointsLayer {
            name: format!("{}_CBR", name),
            entity: name.to_string(),
            points,
            face_color: color,
            edge_color: color,
            opacity: 0.95,
            symbol: String::from("disc"),
            size: 1.0,
            visible: false,
        }
    }

    fn raster_layer() -> ImageLayer {
        ImageLayer {
            name: String::from("nuclei_stitched_Cycle_1"),
            source: ImageSource::Raster {
                path: PathBuf::from("/data/Stitched_images/nuclei_stitched_Cycle_1.tif"),
                pixels: Arc::new(Array2::zeros((3, 5))),
            },
            display: DisplaySettings {
                colormap: String::from("gray_r"),
                blending: String::from("additive"),
                opacity: 1.0,
                contrast_limits: None,
            },
            scale: (4.0, 4.0),
            translate: (0.0, 0.0),
        }
    }

    #[test]
    fn test_manifest_lists_layers_in_order() {
        let dir = TempDir::new().unwrap();
        let mut export = LayerExport::new(dir.path(), OutputFormat::Infer).unwrap();
        export.add_image(raster_layer()).unwrap();
        export
            .add_points(points_layer(
                "Gad1",
                vec![Point { row: 1.0, col: 2.0 }, Point { row: 3.5, col: 4.0 }],
            ))
            .unwrap();
        let manifest_path = export.finish().unwrap();

        let manifest = json::parse(&std::fs::read_to_string(manifest_path).unwrap()).unwrap();
        let layers = &manifest["layers"];
        assert_eq!(layers.len(), 2);
        assert_eq!(layers[0]["type"], "image");
        assert_eq!(layers[0]["source"]["kind"], "raster");
        assert_eq!(layers[0]["scale"][0], 4.0);
        assert_eq!(layers[0]["shape"][1], 5);
        assert!(layers[0]["contrast_limits"].is_null());
        assert_eq!(layers[1]["name"], "Gad1_CBR");
        assert_eq!(layers[1]["count"], 2);
        assert_eq!(layers[1]["visible"], false);
        assert_eq!(layers[1]["face_color"][2], 1.0);

        let csv = std::fs::read_to_string(dir.path().join("points/Gad1_CBR.csv")).unwrap();
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines[0], "row,col");
        assert_eq!(lines.len(), 3);
        assert!(lines[2].starts_with("3.5,"));
    }

    #[test]
    fn test_colliding_names_keep_separate_files() {
        let dir = TempDir::new().unwrap();
        let mut export = LayerExport::new(dir.path(), OutputFormat::Csv).unwrap();
        export
            .add_points(points_layer(
                "Gene A",
                vec![Point { row: 1.0, col: 1.0 }, Point { row: 2.0, col: 2.0 }],
            ))
            .unwrap();
        export
            .add_points(points_layer(
                "Gene_A",
                vec![
                    Point { row: 3.0, col: 3.0 },
                    Point { row: 4.0, col: 4.0 },
                    Point { row: 5.0, col: 5.0 },
                ],
            ))
            .unwrap();
        let manifest_path = export.finish().unwrap();

        let manifest = json::parse(&std::fs::read_to_string(manifest_path).unwrap()).unwrap();
        let layers = &manifest["layers"];
        assert_eq!(layers[0]["path"], "points/Gene_A_CBR.csv");
        assert_eq!(layers[1]["path"], "points/Gene_A_CBR_2.csv");
        for layer in layers.members() {
            let path = dir.path().join(layer["path"].as_str().unwrap());
            let nrows = std::fs::read_to_string(path).unwrap().lines().count() - 1;
            assert_eq!(nrows, layer["count"].as_usize().unwrap());
        }
    }

    #[test]
    fn test_tiled_layers_reference_zarr_regions() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nuclei.zarr");
        zarr::tests::write_test_array(&path, "/", &[6, 10]);
        let config = BackgroundConfig {
            tile_threshold: 8,
            ..BackgroundConfig::default()
        };
        let background = Background::Tiled(open_tiled(&path, &config).unwrap());

        let outdir = dir.path().join("layers");
        let mut export = LayerExport::new(&outdir, OutputFormat::Infer).unwrap();
        for layer in background_layers(&background) {
            export.add_image(layer).unwrap();
        }
        let manifest_path = export.finish().unwrap();

        let manifest = json::parse(&std::fs::read_to_string(manifest_path).unwrap()).unwrap();
        let layers = &manifest["layers"];
        assert_eq!(layers.len(), 4);
        let last = &layers[3];
        assert_eq!(last["name"], "nuclei_tile3");
        assert_eq!(last["source"]["kind"], "zarr");
        assert_eq!(last["source"]["node"], "/");
        assert_eq!(last["source"]["region"][0], 3);
        assert_eq!(last["source"]["region"][1], 5);
        assert_eq!(last["source"]["region"][2], 3);
        assert_eq!(last["source"]["region"][3], 5);
        assert_eq!(last["translate"][0], 3.0);
        assert_eq!(last["translate"][1], 5.0);
        assert_eq!(last["scale"][0], 1.0);
        assert_eq!(last["contrast_limits"][1], 33000.0);
    }

    #[test]
    fn test_gzipped_points() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("p.csv.gz");
        write_points(&path, OutputFormat::Infer, &[Point { row: 1.0, col: 2.0 }]).unwrap();

        let mut content = String::new();
        GzDecoder::new(File::open(&path).unwrap())
            .read_to_string(&mut content)
            .unwrap();
        assert_eq!(content.lines().next(), Some("row,col"));
        assert_eq!(content.lines().count(), 2);
    }

    #[test]
    fn test_parquet_points() {
        let dir = TempDir::new().unwrap();
        let mut export = LayerExport::new(dir.path(), OutputFormat::Parquet).unwrap();
        export
            .add_points(points_layer("Sst/v2", vec![Point { row: 7.0, col: 8.0 }]))
            .unwrap();
        export.finish().unwrap();

        let file = File::open(dir.path().join("points/Sst_v2_CBR.parquet")).unwrap();
        let reader = ParquetRecordBatchReaderBuilder::try_new(file)
            .unwrap()
            .build()
            .unwrap();
        let nrows: usize = reader.map(|batch| batch.unwrap().num_rows()).sum();
        assert_eq!(nrows, 1);
    }
}
