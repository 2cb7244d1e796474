// THEORY:
// The bridge between image space and model space. A normalized fundus image is
// reinterpreted as a dense NCHW tensor with a batch dimension of one and values
// scaled into [0, 1]. Feature maps observed inside a model share the same layout.

use crate::core_modules::normalizer::NormalizedImage;
use ndarray::Array4;

/// Model input in NCHW layout, shape `[1, 3, H, W]`, values in `[0, 1]`.
pub type InputTensor = Array4<f32>;

/// An intermediate activation or gradient in NCHW layout.
pub type FeatureMap = Array4<f32>;

/// Number of color channels fed to the model.
pub const RGB_CHANNELS: usize = 3;

/// Converts a normalized image into the model's channel-first input tensor.
pub fn to_input_tensor(image: &NormalizedImage) -> InputTensor {
    let raster = image.as_image();
    let (width, height) = (raster.width() as usize, raster.height() as usize);

    Array4::from_shape_fn((1, RGB_CHANNELS, height, width), |(_, c, y, x)| {
        f32::from(raster.get_pixel(x as u32, y as u32)[c]) / 255.0
    })
}
