// THEORY:
// The `service` module adapts the synchronous screening pipeline to an async
// server. Every stage of the pipeline is CPU-bound, so each request runs on tokio's
// blocking pool instead of an executor thread.
//
// Key architectural principles:
// 1.  **One Shared Model**: All requests go through the same `ScreeningPipeline` and
//     therefore the same model instance. Grading is reentrant; explaining serializes
//     itself on the model's attribution lock, so no extra coordination is needed here.
// 2.  **Bounded Parallelism**: A semaphore caps the number of analyses in flight
//     (by default one per CPU core) so a burst of uploads queues instead of
//     oversubscribing the blocking pool.
// 3.  **No Hidden Policy**: Timeouts and cancellation belong to the caller. A request
//     that fails reports the pipeline's own error untouched.

use crate::core_modules::model::RegressionModel;
use crate::core_modules::normalizer::RawImage;
use crate::error::{Error, Result};
use crate::pipeline::{Analysis, ScreeningPipeline, ScreeningReport};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::debug;

/// Async front end for a shared `ScreeningPipeline`.
pub struct ScreeningService<M> {
    pipeline: Arc<ScreeningPipeline<M>>,
    permits: Arc<Semaphore>,
}

impl<M> Clone for ScreeningService<M> {
    fn clone(&self) -> Self {
        Self {
            pipeline: Arc::clone(&self.pipeline),
            permits: Arc::clone(&self.permits),
        }
    }
}

impl<M: RegressionModel + 'static> ScreeningService<M> {
    /// Creates a service allowing one analysis per CPU core at a time.
    pub fn new(pipeline: ScreeningPipeline<M>) -> Self {
        Self::with_concurrency(pipeline, num_cpus::get())
    }

    pub fn with_concurrency(pipeline: ScreeningPipeline<M>, max_in_flight: usize) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
            permits: Arc::new(Semaphore::new(max_in_flight.max(1))),
        }
    }

    pub fn pipeline(&self) -> &ScreeningPipeline<M> {
        &self.pipeline
    }

    /// Grades and explains one photograph.
    pub async fn analyze(&self, image: RawImage) -> Result<Analysis> {
        self.run(move |pipeline| pipeline.analyze(&image)).await
    }

    /// Grades one photograph without explaining it.
    pub async fn screen(&self, image: RawImage) -> Result<ScreeningReport> {
        self.run(move |pipeline| pipeline.screen(&image)).await
    }

    async fn run<T, F>(&self, job: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&ScreeningPipeline<M>) -> Result<T> + Send + 'static,
    {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|err| Error::Task(err.to_string()))?;
        debug!(available = self.permits.available_permits(), "analysis permit acquired");

        let pipeline = Arc::clone(&self.pipeline);
        tokio::task::spawn_blocking(move || job(&pipeline))
            .await
            .map_err(|err| Error::Task(err.to_string()))?
    }
}
