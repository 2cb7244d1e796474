// THEORY:
// `PatchRegressor` is a compact reference backend for the `RegressionModel`
// capabilities. It is small enough to reason about by hand, which makes it the
// model of choice for tests and demos, yet it has the same shape as a real
// grading CNN:
//
//   input [1,3,H,W]
//     -> patch convolution (kernel == stride) + ReLU   == layer "features" [1,C,H/p,W/p]
//     -> global average pooling                        == layer "pooled"   [1,C,1,1]
//     -> linear head                                   -> scalar score
//
// Backpropagation from the scalar is analytic: the gradient reaching every cell of
// channel `c` of the feature map is `head[c] / (H/p * W/p)`, and the gradient of the
// head weights is the pooled feature vector. Head gradients accumulate across
// backward passes until `zero_grad` is called.
//
// Weights are always supplied by the caller; loading them from disk is not this
// module's concern.

use crate::core_modules::model::{LayerTap, ModelOutput, ObservableLayer, Phase, RegressionModel};
use crate::core_modules::tensor::{FeatureMap, InputTensor, RGB_CHANNELS};
use crate::error::ModelError;
use ndarray::{Array1, Array4, Axis};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

pub const FEATURES_LAYER: &str = "features";
pub const POOLED_LAYER: &str = "pooled";

/// What a forward pass with gradients enabled remembers.
#[derive(Debug, Clone)]
pub struct PatchTape {
    /// Spatial size of the feature map, needed to shape and scale its gradient.
    rows: usize,
    cols: usize,
    pooled: Array1<f32>,
}

/// Patch-convolution regressor with an average-pooled linear head.
pub struct PatchRegressor {
    /// Convolution kernels, shape `[C, 3, p, p]`.
    kernels: Array4<f32>,
    bias: Array1<f32>,
    head: Array1<f32>,
    head_bias: f32,
    patch: usize,
    grad_enabled: AtomicBool,
    head_grad: Mutex<Array1<f32>>,
    features: LayerTap,
    pooled: LayerTap,
}

impl PatchRegressor {
    pub fn new(
        kernels: Array4<f32>,
        bias: Array1<f32>,
        head: Array1<f32>,
        head_bias: f32,
    ) -> Result<Self, ModelError> {
        let (channels, in_channels, patch_h, patch_w) = kernels.dim();
        if in_channels != RGB_CHANNELS || patch_h != patch_w || patch_h == 0 || channels == 0 {
            return Err(ModelError::ShapeMismatch {
                expected: "[C, 3, p, p] with C, p > 0".to_string(),
                actual: format!("{:?}", kernels.shape()),
            });
        }
        if bias.len() != channels || head.len() != channels {
            return Err(ModelError::ShapeMismatch {
                expected: format!("bias and head of length {channels}"),
                actual: format!("bias {}, head {}", bias.len(), head.len()),
            });
        }

        Ok(Self {
            kernels,
            bias,
            head_grad: Mutex::new(Array1::zeros(channels)),
            head,
            head_bias,
            patch: patch_h,
            grad_enabled: AtomicBool::new(true),
            features: LayerTap::new(FEATURES_LAYER),
            pooled: LayerTap::new(POOLED_LAYER),
        })
    }

    pub fn channels(&self) -> usize {
        self.head.len()
    }

    pub fn patch_size(&self) -> usize {
        self.patch
    }

    /// When disabled, `forward` returns detached outputs (inference mode).
    pub fn set_grad_enabled(&self, enabled: bool) {
        self.grad_enabled.store(enabled, Ordering::SeqCst);
    }

    /// Accumulated gradient of the output with respect to the head weights.
    pub fn head_grad(&self) -> Array1<f32> {
        self.head_grad
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn check_input(&self, input: &InputTensor) -> Result<(usize, usize), ModelError> {
        let (batch, channels, height, width) = input.dim();
        if batch != 1 || channels != RGB_CHANNELS || height < self.patch || width < self.patch {
            return Err(ModelError::ShapeMismatch {
                expected: format!("[1, 3, >={p}, >={p}]", p = self.patch),
                actual: format!("{:?}", input.shape()),
            });
        }
        Ok((height / self.patch, width / self.patch))
    }

    /// Patch convolution followed by ReLU.
    fn feature_map(&self, input: &InputTensor, rows: usize, cols: usize) -> FeatureMap {
        let p = self.patch;
        let image = input.index_axis(Axis(0), 0);

        Array4::from_shape_fn((1, self.channels(), rows, cols), |(_, c, i, j)| {
            let window = image.slice(ndarray::s![.., i * p..(i + 1) * p, j * p..(j + 1) * p]);
            let kernel = self.kernels.index_axis(Axis(0), c);
            let response: f32 = window.iter().zip(kernel.iter()).map(|(x, w)| x * w).sum();
            (response + self.bias[c]).max(0.0)
        })
    }

    fn pool(features: &FeatureMap) -> Array1<f32> {
        let (_, channels, rows, cols) = features.dim();
        let cells = (rows * cols) as f32;
        Array1::from_shape_fn(channels, |c| {
            features.index_axis(Axis(1), c).sum() / cells
        })
    }

    fn head_output(&self, pooled: &Array1<f32>) -> f32 {
        pooled.dot(&self.head) + self.head_bias
    }
}

impl RegressionModel for PatchRegressor {
    type Tape = PatchTape;

    fn forward(&self, input: &InputTensor) -> Result<ModelOutput<PatchTape>, ModelError> {
        let (rows, cols) = self.check_input(input)?;

        let features = self.feature_map(input, rows, cols);
        self.features.notify(Phase::Forward, &features);

        let pooled = Self::pool(&features);
        if self.pooled.has_observers(Phase::Forward) {
            let pooled_map = pooled
                .clone()
                .into_shape_with_order((1, self.channels(), 1, 1))
                .map_err(|err| ModelError::Backend(err.to_string()))?;
            self.pooled.notify(Phase::Forward, &pooled_map);
        }

        let value = self.head_output(&pooled);
        if !self.grad_enabled.load(Ordering::SeqCst) {
            return Ok(ModelOutput::detached(value));
        }

        Ok(ModelOutput::with_tape(
            value,
            PatchTape { rows, cols, pooled },
        ))
    }

    fn infer(&self, input: &InputTensor) -> Result<f32, ModelError> {
        let (rows, cols) = self.check_input(input)?;
        let features = self.feature_map(input, rows, cols);
        Ok(self.head_output(&Self::pool(&features)))
    }

    fn zero_grad(&self) {
        self.head_grad
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .fill(0.0);
    }

    fn backward(&self, output: &ModelOutput<PatchTape>) -> Result<(), ModelError> {
        let tape = output.tape().ok_or(ModelError::Detached)?;
        let channels = self.channels();

        // d(out)/d(pooled[c]) == head[c]
        if self.pooled.has_observers(Phase::Backward) {
            let grad = self
                .head
                .clone()
                .into_shape_with_order((1, channels, 1, 1))
                .map_err(|err| ModelError::Backend(err.to_string()))?;
            self.pooled.notify(Phase::Backward, &grad);
        }

        // d(pooled[c])/d(features[c, i, j]) == 1 / cells
        if self.features.has_observers(Phase::Backward) {
            let cells = (tape.rows * tape.cols) as f32;
            let grad = Array4::from_shape_fn((1, channels, tape.rows, tape.cols), |(_, c, _, _)| {
                self.head[c] / cells
            });
            self.features.notify(Phase::Backward, &grad);
        }

        let mut head_grad = self.head_grad.lock().unwrap_or_else(PoisonError::into_inner);
        *head_grad += &tape.pooled;
        Ok(())
    }

    fn layer(&self, id: &str) -> Option<&dyn ObservableLayer> {
        match id {
            FEATURES_LAYER => Some(&self.features),
            POOLED_LAYER => Some(&self.pooled),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr1;
    use std::sync::Arc;

    /// Two channels with 2x2 patches: channel 0 sums red, channel 1 sums blue.
    fn color_probe() -> PatchRegressor {
        let mut kernels = Array4::zeros((2, 3, 2, 2));
        kernels.index_axis_mut(Axis(0), 0).index_axis_mut(Axis(0), 0).fill(1.0);
        kernels.index_axis_mut(Axis(0), 1).index_axis_mut(Axis(0), 2).fill(1.0);
        PatchRegressor::new(kernels, arr1(&[0.0, 0.0]), arr1(&[2.0, -1.0]), 0.5).unwrap()
    }

    fn red_input() -> InputTensor {
        let mut input = InputTensor::zeros((1, 3, 4, 4));
        input.index_axis_mut(Axis(1), 0).fill(0.25);
        input
    }

    #[test]
    fn forward_matches_hand_computation() {
        let model = color_probe();
        // Every red patch sums to 4 * 0.25 = 1.0; blue is empty.
        // pooled = [1.0, 0.0] -> 2.0 * 1.0 - 1.0 * 0.0 + 0.5
        let output = model.forward(&red_input()).unwrap();
        assert_eq!(output.value(), 2.5);
        assert!(output.is_differentiable());
        assert_eq!(model.infer(&red_input()).unwrap(), 2.5);
    }

    #[test]
    fn features_layer_sees_the_patch_grid() {
        let model = color_probe();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let layer = model.layer(FEATURES_LAYER).unwrap();
        let id = layer.attach(
            Phase::Forward,
            Arc::new(move |map: &FeatureMap| sink.lock().unwrap().push(map.clone())),
        );

        model.forward(&red_input()).unwrap();
        layer.detach(id);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].shape(), &[1, 2, 2, 2]);
        assert!(seen[0].index_axis(Axis(1), 0).iter().all(|&v| v == 1.0));
    }

    #[test]
    fn infer_does_not_notify_observers() {
        let model = color_probe();
        let calls = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&calls);
        model.layer(FEATURES_LAYER).unwrap().attach(
            Phase::Forward,
            Arc::new(move |_: &FeatureMap| *counter.lock().unwrap() += 1),
        );

        model.infer(&red_input()).unwrap();
        assert_eq!(*calls.lock().unwrap(), 0);
    }

    #[test]
    fn backward_delivers_feature_gradients_and_accumulates_head_grad() {
        let model = color_probe();
        let grads = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&grads);
        model.layer(FEATURES_LAYER).unwrap().attach(
            Phase::Backward,
            Arc::new(move |map: &FeatureMap| sink.lock().unwrap().push(map.clone())),
        );

        let output = model.forward(&red_input()).unwrap();
        model.zero_grad();
        model.backward(&output).unwrap();
        model.backward(&output).unwrap();

        let grads = grads.lock().unwrap();
        assert_eq!(grads.len(), 2);
        assert_eq!(grads[0].shape(), &[1, 2, 2, 2]);
        assert!(grads[0].index_axis(Axis(1), 0).iter().all(|&v| v == 0.5));
        assert!(grads[0].index_axis(Axis(1), 1).iter().all(|&v| v == -0.25));
        assert_eq!(model.head_grad(), arr1(&[2.0, 0.0]));

        model.zero_grad();
        assert_eq!(model.head_grad(), arr1(&[0.0, 0.0]));
    }

    #[test]
    fn detached_outputs_cannot_backpropagate() {
        let model = color_probe();
        model.set_grad_enabled(false);
        let output = model.forward(&red_input()).unwrap();
        assert!(!output.is_differentiable());
        assert_eq!(model.backward(&output), Err(ModelError::Detached));
    }

    #[test]
    fn malformed_inputs_and_weights_are_rejected() {
        let model = color_probe();
        assert!(matches!(
            model.forward(&InputTensor::zeros((1, 1, 4, 4))),
            Err(ModelError::ShapeMismatch { .. })
        ));
        assert!(matches!(
            model.infer(&InputTensor::zeros((1, 3, 1, 1))),
            Err(ModelError::ShapeMismatch { .. })
        ));

        let bad = PatchRegressor::new(
            Array4::zeros((2, 3, 2, 2)),
            arr1(&[0.0]),
            arr1(&[1.0, 1.0]),
            0.0,
        );
        assert!(bad.is_err());
    }

    #[test]
    fn unknown_layers_are_not_exposed() {
        let model = color_probe();
        assert!(model.layer("classifier").is_none());
        assert_eq!(model.layer(POOLED_LAYER).unwrap().name(), POOLED_LAYER);
    }
}
