use image::{ImageEncoder, RgbImage};
use std::path::Path;

/// Writes an RGB raster as a PNG file.
pub fn save_png<P: AsRef<Path>>(path: P, image: &RgbImage) -> Result<(), image::error::ImageError> {
    let output = std::io::BufWriter::new(std::fs::File::create(path)?);
    let encoder = image::codecs::png::PngEncoder::new(output);

    encoder.write_image(
        image.as_raw(),
        image.width(),
        image.height(),
        image::ExtendedColorType::Rgb8,
    )?;

    Ok(())
}

/// Decodes an image file into RGB, dropping any alpha channel.
pub fn load_rgb<P: AsRef<Path>>(path: P) -> Result<RgbImage, image::error::ImageError> {
    Ok(image::open(path)?.to_rgb8())
}
