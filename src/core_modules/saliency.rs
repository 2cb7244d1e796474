// THEORY:
// The `saliency` module explains a grade with Grad-CAM: it finds out which regions
// of the fundus image pushed the model's regression score up.
//
// Key architectural principles:
// 1.  **Scoped Observation**: Two observers are attached to the designated layer, one
//     recording its forward activations and one recording the gradient flowing back
//     into it. They are owned by a `LayerHooks` guard whose `Drop` detaches both, so
//     every exit path (success, early error, panic unwinding) leaves the shared model
//     exactly as it was found.
// 2.  **Critical Section**: Observers live on a model instance shared by concurrent
//     requests. The whole attach/forward/backward/detach sequence runs while holding
//     the model's attribution lock, so captures from unrelated requests never mix.
// 3.  **Gradient-Weighted Activations**: Each activation channel is weighted by the
//     spatial mean of its gradient. The weighted channels are summed into one spatial
//     map and rectified; regions that argue against the score are discarded.
// 4.  **Display Space**: The coarse map is upsampled bilinearly to the display size and
//     scaled so its peak is exactly 1.0. A map with no positive evidence stays all zero.
//     Rendering through the JET palette is a separate, pure step.

use crate::core_modules::model::{
    ObservableLayer, Observer, ObserverId, Phase, RegressionModel, SharedModel,
};
use crate::core_modules::palette::render_jet;
use crate::core_modules::tensor::{FeatureMap, InputTensor};
use crate::error::{ModelError, SaliencyError};
use image::RgbImage;
use ndarray::{Array2, Axis};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, warn};

/// Default side length of the rendered heatmap.
pub const DEFAULT_DISPLAY_SIZE: u32 = 300;

/// Peaks at or below this value are numerical noise and yield an all-zero map.
const PEAK_EPSILON: f32 = 1e-7;

/// A non-negative importance map in display space, peak 1.0 unless all zero.
#[derive(Debug, Clone, PartialEq)]
pub struct SaliencyMap {
    values: Array2<f32>,
}

impl SaliencyMap {
    pub fn values(&self) -> &Array2<f32> {
        &self.values
    }

    pub fn max(&self) -> f32 {
        self.values.iter().copied().fold(0.0, f32::max)
    }

    pub fn is_empty(&self) -> bool {
        self.max() == 0.0
    }

    /// Renders the map as a false-color heatmap.
    pub fn to_heatmap(&self) -> RgbImage {
        render_jet(&self.values)
    }
}

/// Buffer shared between an observer callback and the generator.
#[derive(Clone, Default)]
struct Capture {
    maps: Arc<Mutex<Vec<FeatureMap>>>,
}

impl Capture {
    fn observer(&self) -> Observer {
        let maps = Arc::clone(&self.maps);
        Arc::new(move |map: &FeatureMap| {
            maps.lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(map.clone());
        })
    }

    /// Takes the single expected capture, warning if the layer fired more than once.
    fn take(&self, what: &str) -> Option<FeatureMap> {
        let mut maps = self.maps.lock().unwrap_or_else(PoisonError::into_inner);
        if maps.len() > 1 {
            warn!(count = maps.len(), what, "layer fired more than once, using the first capture");
        }
        let mut drained = maps.drain(..);
        drained.next()
    }
}

/// Observers attached to one layer for the lifetime of this guard.
struct LayerHooks<'a> {
    layer: &'a dyn ObservableLayer,
    ids: [ObserverId; 2],
}

impl<'a> LayerHooks<'a> {
    fn attach(layer: &'a dyn ObservableLayer, activations: &Capture, gradients: &Capture) -> Self {
        let ids = [
            layer.attach(Phase::Forward, activations.observer()),
            layer.attach(Phase::Backward, gradients.observer()),
        ];
        debug!(layer = layer.name(), "attached Grad-CAM observers");
        Self { layer, ids }
    }
}

impl Drop for LayerHooks<'_> {
    fn drop(&mut self) {
        for id in self.ids {
            self.layer.detach(id);
        }
        debug!(layer = self.layer.name(), "detached Grad-CAM observers");
    }
}

/// Produces a Grad-CAM saliency map of `target_layer` for `tensor`, sized `display_size`².
pub fn explain<M: RegressionModel>(
    tensor: &InputTensor,
    model: &SharedModel<M>,
    target_layer: &str,
    display_size: u32,
) -> Result<SaliencyMap, SaliencyError> {
    let _session = model.lock_attribution();
    let (activation, gradient) = capture(tensor, model.model(), target_layer)?;

    // --- 1. Channel Weights & Weighted Sum ---
    let cam = weighted_activation(&activation, &gradient)?;

    // --- 2. Upsample & Normalize ---
    let values = normalize_peak(upsample_bilinear(&cam, display_size as usize));
    let map = SaliencyMap { values };
    debug!(target_layer, display_size, empty = map.is_empty(), "saliency map generated");

    Ok(map)
}

/// Runs one observed forward + backward pass and returns the layer's activation and gradient.
fn capture<M: RegressionModel>(
    tensor: &InputTensor,
    model: &M,
    target_layer: &str,
) -> Result<(FeatureMap, FeatureMap), SaliencyError> {
    let not_captured = || SaliencyError::LayerNotCaptured {
        layer: target_layer.to_string(),
    };
    let not_differentiable = || SaliencyError::NonDifferentiableOutput {
        layer: target_layer.to_string(),
    };

    let layer = model.layer(target_layer).ok_or_else(not_captured)?;
    let activations = Capture::default();
    let gradients = Capture::default();
    let _hooks = LayerHooks::attach(layer, &activations, &gradients);

    let output = model.forward(tensor)?;
    let activation = activations.take("activation").ok_or_else(not_captured)?;
    debug!(score = output.value(), "forward pass observed");

    model.zero_grad();
    model.backward(&output).map_err(|err| match err {
        ModelError::Detached => not_differentiable(),
        other => SaliencyError::Model(other),
    })?;
    let gradient = gradients.take("gradient").ok_or_else(not_differentiable)?;

    Ok((activation, gradient))
}

/// Sums activation channels weighted by their spatially averaged gradients, then rectifies.
fn weighted_activation(
    activation: &FeatureMap,
    gradient: &FeatureMap,
) -> Result<Array2<f32>, SaliencyError> {
    if activation.shape() != gradient.shape() || activation.shape()[0] != 1 {
        return Err(ModelError::ShapeMismatch {
            expected: format!("gradient matching activation {:?} with batch 1", activation.shape()),
            actual: format!("{:?}", gradient.shape()),
        }
        .into());
    }

    let activation = activation.index_axis(Axis(0), 0);
    let gradient = gradient.index_axis(Axis(0), 0);
    let empty = || ModelError::ShapeMismatch {
        expected: "non-empty spatial feature map".to_string(),
        actual: format!("{:?}", activation.shape()),
    };
    let weights = gradient
        .mean_axis(Axis(2))
        .and_then(|rows| rows.mean_axis(Axis(1)))
        .ok_or_else(empty)?;

    let (_, height, width) = activation.dim();
    let mut cam = Array2::<f32>::zeros((height, width));
    for (channel, &weight) in activation.outer_iter().zip(weights.iter()) {
        cam.scaled_add(weight, &channel);
    }
    cam.mapv_inplace(|v| v.max(0.0));

    Ok(cam)
}

/// Bilinear resize to `size`×`size` using pixel-center alignment.
fn upsample_bilinear(data: &Array2<f32>, size: usize) -> Array2<f32> {
    let (rows, cols) = data.dim();
    let scale_y = rows as f32 / size as f32;
    let scale_x = cols as f32 / size as f32;

    Array2::from_shape_fn((size, size), |(y, x)| {
        let v = ((y as f32 + 0.5) * scale_y - 0.5).clamp(0.0, (rows - 1) as f32);
        let u = ((x as f32 + 0.5) * scale_x - 0.5).clamp(0.0, (cols - 1) as f32);

        let v0 = v.floor() as usize;
        let u0 = u.floor() as usize;
        let v1 = (v0 + 1).min(rows - 1);
        let u1 = (u0 + 1).min(cols - 1);
        let fv = v - v0 as f32;
        let fu = u - u0 as f32;

        let top = data[[v0, u0]] * (1.0 - fu) + data[[v0, u1]] * fu;
        let bottom = data[[v1, u0]] * (1.0 - fu) + data[[v1, u1]] * fu;
        top * (1.0 - fv) + bottom * fv
    })
}

/// Scales a non-negative map so its maximum is 1.0.
fn normalize_peak(mut values: Array2<f32>) -> Array2<f32> {
    let peak = values.iter().copied().fold(0.0, f32::max);
    if peak <= PEAK_EPSILON {
        values.fill(0.0);
    } else {
        values.mapv_inplace(|v| (v / peak).clamp(0.0, 1.0));
    }
    values
}
