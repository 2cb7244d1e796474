// THEORY:
// The grading model is an external collaborator. The screening engine never looks
// inside it; it only relies on a small set of capabilities:
//
// 1.  **Forward**: evaluate the model on an input tensor and get a scalar regression
//     output that remembers how it was computed (a gradient tape).
// 2.  **Inference**: evaluate without a tape. Used for plain grading; it must not
//     notify layer observers, so it can run while another request is explaining.
// 3.  **Zero Grad / Backward**: reset accumulated parameter gradients and
//     backpropagate from a scalar output.
// 4.  **Named Layers**: expose internal layers that can be observed. An observer is a
//     callback attached to one phase (forward activations or backward gradients) of
//     one layer. Observers live on the shared model instance, so whoever attaches one
//     is responsible for detaching it again.
//
// `LayerTap` is a ready-made observer registry that backends embed in each layer
// they want to expose. `SharedModel` pairs a model with the lock that serializes
// attribution sessions on it.

use crate::core_modules::tensor::{FeatureMap, InputTensor};
use crate::error::ModelError;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Which pass of the model an observer listens to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Receives the layer's output activations during `forward`.
    Forward,
    /// Receives the gradient of the output with respect to the layer's output during `backward`.
    Backward,
}

/// Handle returned by `ObservableLayer::attach`, used to detach the observer again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

/// Callback receiving a layer's activation or gradient.
pub type Observer = Arc<dyn Fn(&FeatureMap) + Send + Sync>;

/// A model layer whose forward output and backward gradient can be observed.
pub trait ObservableLayer: Send + Sync {
    fn name(&self) -> &str;
    fn attach(&self, phase: Phase, observer: Observer) -> ObserverId;
    /// Returns `false` if the observer was not attached.
    fn detach(&self, id: ObserverId) -> bool;
    fn observer_count(&self) -> usize;
}

/// The scalar result of a forward pass, with the backend's gradient tape when recorded.
#[derive(Debug, Clone)]
pub struct ModelOutput<T> {
    value: f32,
    tape: Option<T>,
}

impl<T> ModelOutput<T> {
    pub fn with_tape(value: f32, tape: T) -> Self {
        Self {
            value,
            tape: Some(tape),
        }
    }

    /// An output that cannot be backpropagated.
    pub fn detached(value: f32) -> Self {
        Self { value, tape: None }
    }

    pub fn value(&self) -> f32 {
        self.value
    }

    pub fn tape(&self) -> Option<&T> {
        self.tape.as_ref()
    }

    pub fn is_differentiable(&self) -> bool {
        self.tape.is_some()
    }

    pub fn detach(self) -> Self {
        Self::detached(self.value)
    }
}

/// The capabilities the screening engine needs from a differentiable regression model.
pub trait RegressionModel: Send + Sync {
    /// Backend-specific record of a forward pass.
    type Tape: Send;

    fn forward(&self, input: &InputTensor) -> Result<ModelOutput<Self::Tape>, ModelError>;

    /// Evaluates without recording a tape and without notifying observers.
    fn infer(&self, input: &InputTensor) -> Result<f32, ModelError>;

    fn zero_grad(&self);

    fn backward(&self, output: &ModelOutput<Self::Tape>) -> Result<(), ModelError>;

    fn layer(&self, id: &str) -> Option<&dyn ObservableLayer>;
}

/// Observer registry for one named layer.
pub struct LayerTap {
    name: String,
    next_id: AtomicU64,
    observers: Mutex<Vec<(ObserverId, Phase, Observer)>>,
}

impl LayerTap {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            next_id: AtomicU64::new(0),
            observers: Mutex::new(Vec::new()),
        }
    }

    fn observers(&self) -> MutexGuard<'_, Vec<(ObserverId, Phase, Observer)>> {
        self.observers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Delivers `tensor` to every observer attached to `phase`.
    pub fn notify(&self, phase: Phase, tensor: &FeatureMap) {
        // Snapshot first so observers may attach or detach from inside the callback.
        let listeners: Vec<Observer> = self
            .observers()
            .iter()
            .filter(|(_, p, _)| *p == phase)
            .map(|(_, _, observer)| Arc::clone(observer))
            .collect();

        for observer in listeners {
            observer(tensor);
        }
    }

    pub fn has_observers(&self, phase: Phase) -> bool {
        self.observers().iter().any(|(_, p, _)| *p == phase)
    }
}

impl ObservableLayer for LayerTap {
    fn name(&self) -> &str {
        &self.name
    }

    fn attach(&self, phase: Phase, observer: Observer) -> ObserverId {
        let id = ObserverId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.observers().push((id, phase, observer));
        id
    }

    fn detach(&self, id: ObserverId) -> bool {
        let mut observers = self.observers();
        let before = observers.len();
        observers.retain(|(existing, _, _)| *existing != id);
        observers.len() != before
    }

    fn observer_count(&self) -> usize {
        self.observers().len()
    }
}

/// A model instance shared between requests, with the lock that makes each
/// attach/run/detach attribution sequence a critical section.
pub struct SharedModel<M> {
    model: M,
    attribution: Mutex<()>,
}

impl<M: RegressionModel> SharedModel<M> {
    pub fn new(model: M) -> Self {
        Self {
            model,
            attribution: Mutex::new(()),
        }
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    /// Blocks until no other attribution session is running on this model.
    pub fn lock_attribution(&self) -> MutexGuard<'_, ()> {
        self.attribution.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_observer(counter: &Arc<AtomicUsize>) -> Observer {
        let counter = Arc::clone(counter);
        Arc::new(move |_: &FeatureMap| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn observers_only_hear_their_phase() {
        let tap = LayerTap::new("features");
        let forward = Arc::new(AtomicUsize::new(0));
        let backward = Arc::new(AtomicUsize::new(0));
        tap.attach(Phase::Forward, counting_observer(&forward));
        tap.attach(Phase::Backward, counting_observer(&backward));

        let tensor = FeatureMap::zeros((1, 2, 3, 3));
        tap.notify(Phase::Forward, &tensor);
        tap.notify(Phase::Forward, &tensor);
        tap.notify(Phase::Backward, &tensor);

        assert_eq!(forward.load(Ordering::SeqCst), 2);
        assert_eq!(backward.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn detached_observers_stop_receiving() {
        let tap = LayerTap::new("features");
        let calls = Arc::new(AtomicUsize::new(0));
        let id = tap.attach(Phase::Forward, counting_observer(&calls));
        assert_eq!(tap.observer_count(), 1);
        assert!(tap.has_observers(Phase::Forward));

        assert!(tap.detach(id));
        assert!(!tap.detach(id));
        tap.notify(Phase::Forward, &FeatureMap::zeros((1, 1, 1, 1)));

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(tap.observer_count(), 0);
    }

    #[test]
    fn output_tape_tracks_differentiability() {
        let output = ModelOutput::with_tape(1.5, ());
        assert!(output.is_differentiable());
        assert_eq!(output.value(), 1.5);

        let detached = output.detach();
        assert!(!detached.is_differentiable());
        assert_eq!(detached.value(), 1.5);
        assert!(detached.tape().is_none());
    }
}
