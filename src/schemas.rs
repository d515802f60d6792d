// Output table schemas and formats shared by the layer export.

use arrow::datatypes::{DataType, Field, Schema};
use clap::ValueEnum;

use crate::error::SurfaceError;

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
pub enum OutputFormat {
    Infer,
    Csv,
    CsvGz,
    Parquet,
}

impl OutputFormat {
    pub fn extension(self) -> &'static str {
        match self {
            OutputFormat::Csv | OutputFormat::Infer => "csv",
            OutputFormat::CsvGz => "csv.gz",
            OutputFormat::Parquet => "parquet",
        }
    }
}

pub fn determine_format(filename: &str, fmt: OutputFormat) -> Result<OutputFormat, SurfaceError> {
    if fmt != OutputFormat::Infer {
        return Ok(fmt);
    }

    if filename.ends_with(".csv.gz") {
        Ok(OutputFormat::CsvGz)
    } else if filename.ends_with(".csv") {
        Ok(OutputFormat::Csv)
    } else if filename.ends_with(".parquet") {
        Ok(OutputFormat::Parquet)
    } else {
        Err(SurfaceError::UnknownFormat(filename.to_string()))
    }
}

// Point coordinates in image axis order, matching the layer translate/scale.
pub fn points_schema() -> Schema {
    Schema::new(vec![
        Field::new("row", DataType::Float64, false),
        Field::new("col", DataType::Float64, false),
    ])
}
