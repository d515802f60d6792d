use image::{DynamicImage, ImageReader};
use ndarray::Array2;
use std::path::Path;

use crate::error::BackgroundError;

// Decode a single-frame raster into one grayscale channel. Color images are
// converted to luma, keeping 8-bit sources at 8-bit range.
pub fn read_grayscale(path: &Path) -> Result<Array2<f32>, BackgroundError> {
    let image_err = |source: image::ImageError| BackgroundError::Image {
        path: path.to_path_buf(),
        source,
    };

    let img = ImageReader::open(path)
        .map_err(|e| image_err(image::ImageError::IoError(e)))?
        .with_guessed_format()
        .map_err(|e| image_err(image::ImageError::IoError(e)))?
        .decode()
        .map_err(image_err)?;

    let (width, height) = (img.width() as usize, img.height() as usize);
    let pixels: Vec<f32> = match img {
        DynamicImage::ImageLuma8(buf) => buf.into_raw().into_iter().map(f32::from).collect(),
        DynamicImage::ImageLuma16(buf) => buf.into_raw().into_iter().map(f32::from).collect(),
        img if is_8bit(&img) => img.to_luma8().into_raw().into_iter().map(f32::from).collect(),
        img => img.to_luma16().into_raw().into_iter().map(f32::from).collect(),
    };

    Array2::from_shape_vec((height, width), pixels)
        .map_err(|_| BackgroundError::BadShape(vec![height as u64, width as u64]))
}

fn is_8bit(img: &DynamicImage) -> bool {
    let color = img.color();
    color.bytes_per_pixel() == color.channel_count()
}
