//! False-color rendering for saliency maps.
//! Maps values in [0, 1] through the JET palette: blue -> cyan -> yellow -> red.

use image::{Rgb, RgbImage};
use ndarray::Array2;

/// JET color for a value in `[0, 1]`; out-of-range values are clamped.
pub fn jet(value: f32) -> Rgb<u8> {
    let t = if value.is_nan() { 0.0 } else { value.clamp(0.0, 1.0) };
    let channel =
        |center: f32| ((1.5 - (4.0 * t - center).abs()).clamp(0.0, 1.0) * 255.0).round() as u8;

    Rgb([channel(3.0), channel(2.0), channel(1.0)])
}

/// Renders a 2D map of values in `[0, 1]` as a JET heatmap of the same size.
pub fn render_jet(values: &Array2<f32>) -> RgbImage {
    let (rows, cols) = values.dim();
    RgbImage::from_fn(cols as u32, rows as u32, |x, y| {
        jet(values[[y as usize, x as usize]])
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jet_runs_from_blue_to_red() {
        assert_eq!(jet(0.0), Rgb([0, 0, 128]));
        assert_eq!(jet(0.5), Rgb([128, 255, 128]));
        assert_eq!(jet(1.0), Rgb([128, 0, 0]));
    }

    #[test]
    fn out_of_range_values_clamp() {
        assert_eq!(jet(-3.0), jet(0.0));
        assert_eq!(jet(7.0), jet(1.0));
        assert_eq!(jet(f32::NAN), jet(0.0));
    }

    #[test]
    fn rendered_image_matches_map_layout() {
        let mut values = Array2::zeros((2, 3));
        values[[1, 2]] = 1.0;
        let image = render_jet(&values);
        assert_eq!(image.dimensions(), (3, 2));
        assert_eq!(*image.get_pixel(2, 1), jet(1.0));
        assert_eq!(*image.get_pixel(0, 0), jet(0.0));
    }
}
