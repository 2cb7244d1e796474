// THEORY:
// The `normalizer` is the first stage of the screening engine. It turns an arbitrary
// fundus photograph into the fixed-size, contrast-enhanced image the grading model
// was tuned on (the Ben Graham preprocessing used in retinal image competitions).
//
// Key architectural principles:
// 1.  **Auto-Crop**: Fundus cameras leave a wide black frame around the retina. Pixels
//     whose luminance is at or below a small threshold are treated as background and
//     the image is cropped to the bounding box of everything brighter. An image with
//     no bright pixel at all is passed through uncropped.
// 2.  **Fixed Geometry**: The crop is stretched to a square `target_size` raster. The
//     aspect ratio is not preserved; the model expects a square retina.
// 3.  **Local Contrast**: The resized image is blended with a heavily blurred copy of
//     itself (`4 * img - 4 * blur + 128`). Uniform illumination cancels out, leaving
//     small, high-frequency structures such as microaneurysms and hemorrhages.
// 4.  **Determinism**: Every step is a pure function of the input pixels, the blur
//     sigma and the target size. The same input always yields the same bytes.
//
// The working channel order is RGB, the order images are decoded in, so the color
// conversion into and out of the working space is the identity. The crop luminance
// applies Rec. 601 weights in that order (0.299 R + 0.587 G + 0.114 B). A pipeline
// that feeds BGR buffers into an RGB-to-gray conversion effectively weights blue by
// 0.299 instead, so dim blue-dominant pixels such as RGB(0, 0, 30) count as
// foreground there and as background here.

use crate::error::NormalizeError;
use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};
use imageproc::filter::gaussian_blur_f32;
use tracing::debug;

/// Side length of the square image fed to the model.
pub const DEFAULT_TARGET_SIZE: u32 = 300;
/// Standard deviation of the Gaussian used for background estimation.
pub const DEFAULT_BLUR_SIGMA: f32 = 10.0;

/// Pixels with a luminance at or below this value are background.
const CROP_LUMINANCE_THRESHOLD: u32 = 7;
const ORIGINAL_WEIGHT: f32 = 4.0;
const BLUR_WEIGHT: f32 = -4.0;
const CONTRAST_OFFSET: f32 = 128.0;

/// An arbitrary-size RGB photograph as decoded by the caller.
pub type RawImage = RgbImage;

/// A square, contrast-enhanced fundus image ready to be tensorized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedImage {
    image: RgbImage,
}

impl NormalizedImage {
    /// Side length of the square raster.
    pub fn size(&self) -> u32 {
        self.image.width()
    }

    pub fn as_image(&self) -> &RgbImage {
        &self.image
    }

    pub fn into_image(self) -> RgbImage {
        self.image
    }
}

/// The region of a raw image that survives auto-cropping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Runs the full normalization: auto-crop, square resize, local contrast enhancement.
pub fn normalize(
    image: &RawImage,
    blur_sigma: f32,
    target_size: u32,
) -> Result<NormalizedImage, NormalizeError> {
    validate(image, blur_sigma, target_size)?;

    // --- 1. Auto-Crop ---
    let cropped = match crop_box(image) {
        Some(region) => {
            debug!(?region, "cropping fundus background");
            imageops::crop_imm(image, region.x, region.y, region.width, region.height).to_image()
        }
        None => {
            debug!("no foreground pixels found, skipping crop");
            image.clone()
        }
    };

    // --- 2. Square Resize ---
    let resized = imageops::resize(&cropped, target_size, target_size, FilterType::Triangle);

    // --- 3. Local Contrast Enhancement ---
    let enhanced = enhance_local_contrast(&resized, blur_sigma);
    debug!(target_size, blur_sigma, "fundus image normalized");

    Ok(NormalizedImage { image: enhanced })
}

/// Normalizes with the default sigma and target size.
pub fn normalize_default(image: &RawImage) -> Result<NormalizedImage, NormalizeError> {
    normalize(image, DEFAULT_BLUR_SIGMA, DEFAULT_TARGET_SIZE)
}

fn validate(image: &RawImage, blur_sigma: f32, target_size: u32) -> Result<(), NormalizeError> {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return Err(NormalizeError::InvalidImage {
            reason: format!("image has zero size ({width}x{height})"),
        });
    }
    if image.as_raw().len() != (width as usize) * (height as usize) * 3 {
        return Err(NormalizeError::InvalidImage {
            reason: "pixel buffer does not match image dimensions".to_string(),
        });
    }
    if target_size == 0 {
        return Err(NormalizeError::InvalidImage {
            reason: "target size must be positive".to_string(),
        });
    }
    if !blur_sigma.is_finite() || blur_sigma <= 0.0 {
        return Err(NormalizeError::InvalidImage {
            reason: format!("blur sigma must be a positive number, got {blur_sigma}"),
        });
    }
    Ok(())
}

/// Rec. 601 luma in fixed point, rounded to the nearest integer.
fn luminance(pixel: &Rgb<u8>) -> u32 {
    let [r, g, b] = pixel.0;
    (u32::from(r) * 4899 + u32::from(g) * 9617 + u32::from(b) * 1868 + 8192) >> 14
}

/// Finds the bounding box of all pixels brighter than the background threshold.
/// Returns `None` when the whole image is background.
pub fn crop_box(image: &RawImage) -> Option<CropBox> {
    let mut min_x = u32::MAX;
    let mut min_y = u32::MAX;
    let mut max_x = 0;
    let mut max_y = 0;
    let mut found = false;

    for (x, y, pixel) in image.enumerate_pixels() {
        if luminance(pixel) > CROP_LUMINANCE_THRESHOLD {
            found = true;
            min_x = min_x.min(x);
            min_y = min_y.min(y);
            max_x = max_x.max(x);
            max_y = max_y.max(y);
        }
    }

    found.then(|| CropBox {
        x: min_x,
        y: min_y,
        width: max_x - min_x + 1,
        height: max_y - min_y + 1,
    })
}

/// Subtracts the blurred background: `clamp(4 * img - 4 * blur + 128)` per channel.
fn enhance_local_contrast(image: &RgbImage, blur_sigma: f32) -> RgbImage {
    let blurred = gaussian_blur_f32(image, blur_sigma);
    let mut enhanced = RgbImage::new(image.width(), image.height());

    for ((out, original), background) in enhanced
        .pixels_mut()
        .zip(image.pixels())
        .zip(blurred.pixels())
    {
        for c in 0..3 {
            let value = ORIGINAL_WEIGHT * f32::from(original[c])
                + BLUR_WEIGHT * f32::from(background[c])
                + CONTRAST_OFFSET;
            out[c] = value.round().clamp(0.0, 255.0) as u8;
        }
    }

    enhanced
}
