//! Pixel work for collages: scale, place, encode.

use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::{DynamicImage, GenericImageView, Rgb, RgbImage};

use super::layout::{self, GridLayout};
use super::GridError;

/// JPEG quality for finished collages.
pub const GRID_JPEG_QUALITY: u8 = 75;

/// Lay out and draw the images onto one canvas.
pub fn compose(images: &[DynamicImage]) -> Result<RgbImage, GridError> {
    let sizes: Vec<(u32, u32)> = images.iter().map(|img| img.dimensions()).collect();
    let layout = layout::plan(&sizes)?;
    draw(images, &layout)
}

/// Draw onto a canvas using an already computed layout.
pub fn draw(images: &[DynamicImage], layout: &GridLayout) -> Result<RgbImage, GridError> {
    let mut canvas = RgbImage::from_pixel(layout.canvas_width, layout.canvas_height, Rgb([0, 0, 0]));
    for placement in &layout.placements {
        let source = images.get(placement.index).ok_or_else(|| {
            GridError::Internal(format!("layout references missing image {}", placement.index))
        })?;
        let scaled = imageops::resize(
            &source.to_rgb8(),
            placement.width,
            placement.height,
            FilterType::Triangle,
        );
        imageops::overlay(&mut canvas, &scaled, placement.x as i64, placement.y as i64);
    }
    Ok(canvas)
}

pub fn encode_jpeg(canvas: &RgbImage, quality: u8) -> Result<Vec<u8>, GridError> {
    let mut buf = Vec::new();
    let encoder = JpegEncoder::new_with_quality(&mut buf, quality);
    canvas.write_with_encoder(encoder)?;
    Ok(buf)
}
