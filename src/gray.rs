//! Grayscale image access shared by the detector and the landmark regressor.

use image::imageops::{self, FilterType};
use image::{DynamicImage, GrayImage, Luma, Rgb};

/// Trait for accessing pixel intensities from an image.
pub trait ImageAccess {
    /// Get the grayscale intensity at (x, y). Returns 0 for out-of-bounds pixels.
    /// Coordinates are in image space (not normalized).
    fn get_pixel(&self, x: i32, y: i32) -> u8;

    /// Image dimensions.
    fn width(&self) -> u32;
    fn height(&self) -> u32;
}

impl ImageAccess for GrayImage {
    fn get_pixel(&self, x: i32, y: i32) -> u8 {
        if x < 0 || y < 0 || x >= self.width() as i32 || y >= self.height() as i32 {
            return 0;
        }
        let Luma([v]) = *image::ImageBuffer::get_pixel(self, x as u32, y as u32);
        v
    }

    fn width(&self) -> u32 {
        self.dimensions().0
    }

    fn height(&self) -> u32 {
        self.dimensions().1
    }
}

/// Collapse any decoded image to 8-bit intensity.
///
/// Color pixels become the truncated mean of their three channels, as dlib
/// assigns RGB pixels to grayscale.
pub fn to_gray(image: &DynamicImage) -> GrayImage {
    if let DynamicImage::ImageLuma8(gray) = image {
        return gray.clone();
    }
    let rgb = image.to_rgb8();
    GrayImage::from_fn(rgb.width(), rgb.height(), |x, y| {
        let Rgb([r, g, b]) = *rgb.get_pixel(x, y);
        Luma([((r as u16 + g as u16 + b as u16) / 3) as u8])
    })
}

/// Left-right mirror of an image.
pub fn flip_left_right(image: &GrayImage) -> GrayImage {
    imageops::flip_horizontal(image)
}

/// Size of the next pyramid level, `(n - 1) / n` of `(width, height)`.
/// Returns `None` once a side would reach zero.
pub fn downsampled_size(width: u32, height: u32, n: u32) -> Option<(u32, u32)> {
    let shrink = |v: u32| (v as u64 * (n as u64 - 1) / n as u64) as u32;
    let (w, h) = (shrink(width), shrink(height));
    (w > 0 && h > 0).then_some((w, h))
}

/// Resample `image` to exactly `width` x `height`.
pub fn resize(image: &GrayImage, width: u32, height: u32) -> GrayImage {
    if image.dimensions() == (width, height) {
        return image.clone();
    }
    imageops::resize(image, width, height, FilterType::Triangle)
}
