// Lazy access to a stitched image stored as a zarr array. Only metadata is
// read on open; pixels are fetched per region.

use ndarray::Array2;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use zarrs::array::{Array, DataType, ElementOwned};
use zarrs::array_subset::ArraySubset;
use zarrs::filesystem::FilesystemStore;

use crate::error::BackgroundError;

pub struct ChunkedArray {
    path: PathBuf,
    node: String,
    array: Array<FilesystemStore>,
    shape: Vec<u64>,
}

impl ChunkedArray {
    /// Open a zarr array, or the full resolution level `/0` when the path
    /// holds a multiscale group.
    pub fn open(path: &Path) -> Result<Self, BackgroundError> {
        let store = Arc::new(
            FilesystemStore::new(path).map_err(|e| BackgroundError::zarr(path, e))?,
        );

        let (array, node) = match Array::open(store.clone(), "/") {
            Ok(array) => (array, "/"),
            Err(root_err) => match Array::open(store, "/0") {
                Ok(array) => (array, "/0"),
                Err(_) => return Err(BackgroundError::zarr(path, root_err)),
            },
        };

        let shape = array.shape().to_vec();
        if shape.len() < 2 {
            return Err(BackgroundError::BadShape(shape));
        }

        Ok(ChunkedArray {
            path: path.to_path_buf(),
            node: node.to_string(),
            array,
            shape,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn shape(&self) -> &[u64] {
        &self.shape
    }

    /// (rows, cols) of the last two dimensions. Leading dimensions are read
    /// at index 0.
    pub fn dims(&self) -> (u64, u64) {
        let n = self.shape.len();
        (self.shape[n - 2], self.shape[n - 1])
    }

    pub fn read_region(
        &self,
        rows: Range<u64>,
        cols: Range<u64>,
    ) -> Result<Array2<f32>, BackgroundError> {
        let (nrows, ncols) = self.dims();
        if rows.start > rows.end || cols.start > cols.end || rows.end > nrows || cols.end > ncols
        {
            return Err(BackgroundError::OutOfBounds {
                rows,
                cols,
                shape: (nrows, ncols),
            });
        }

        let mut ranges: Vec<Range<u64>> = vec![0..1; self.shape.len() - 2];
        ranges.push(rows.clone());
        ranges.push(cols.clone());
        let subset = ArraySubset::new_with_ranges(&ranges);

        let data = match self.array.data_type() {
            DataType::UInt8 => self.retrieve_f32::<u8>(&subset)?,
            DataType::UInt16 => self.retrieve_f32::<u16>(&subset)?,
            DataType::UInt32 => self.retrieve_f32::<u32>(&subset)?,
            DataType::Int8 => self.retrieve_f32::<i8>(&subset)?,
            DataType::Int16 => self.retrieve_f32::<i16>(&subset)?,
            DataType::Int32 => self.retrieve_f32::<i32>(&subset)?,
            DataType::Float32 => self.retrieve_f32::<f32>(&subset)?,
            DataType::Float64 => self.retrieve_f32::<f64>(&subset)?,
            dt => return Err(BackgroundError::UnsupportedDataType(format!("{:?}", dt))),
        };

        let shape = (
            (rows.end - rows.start) as usize,
            (cols.end - cols.start) as usize,
        );
        Array2::from_shape_vec(shape, data).map_err(|e| BackgroundError::zarr(&self.path, e))
    }

    fn retrieve_f32<T>(&self, subset: &ArraySubset) -> Result<Vec<f32>, BackgroundError>
    where
        T: ElementOwned + Into<f64>,
    {
        let values = self
            .array
            .retrieve_array_subset_elements::<T>(subset)
            .map_err(|e| BackgroundError::zarr(&self.path, e))?;
        Ok(values.into_iter().map(|v| v.into() as f32).collect())
    }
}
