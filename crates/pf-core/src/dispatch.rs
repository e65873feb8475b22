//! Concurrent request dispatch
//!
//! Each request runs the blocking [`Pipeline`] on tokio's blocking pool,
//! with at most `workers.count` builds in flight. Every outcome, including
//! a timeout or a panicking build, comes back as a [`BuildFailure`] value.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use pf_kernel::KernelFactory;
use tokio::sync::Semaphore;

use crate::config::WorkerConfig;
use crate::engine::CancelToken;
use crate::error::BuildFailure;
use crate::export::ExportFormat;
use crate::pipeline::{BuildOutcome, Pipeline};

pub struct Dispatcher<F: KernelFactory + 'static> {
    pipeline: Arc<Pipeline<F>>,
    permits: Arc<Semaphore>,
    timeout: Duration,
}

impl<F: KernelFactory + 'static> Dispatcher<F> {
    pub fn new(pipeline: Pipeline<F>, workers: &WorkerConfig) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
            permits: Arc::new(Semaphore::new(workers.count.max(1))),
            timeout: workers.request_timeout(),
        }
    }

    pub fn pipeline(&self) -> &Arc<Pipeline<F>> {
        &self.pipeline
    }

    /// Builds that could start right now
    pub fn available_workers(&self) -> usize {
        self.permits.available_permits()
    }

    /// Run one JSON request to completion
    ///
    /// On timeout the cancel token is set and the failure is returned at
    /// once; the build stops at its next node boundary and keeps its worker
    /// slot until then.
    pub async fn submit(
        &self,
        request: String,
        formats: Vec<ExportFormat>,
        cancel: CancelToken,
    ) -> Result<BuildOutcome, BuildFailure> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| BuildFailure::internal("dispatcher is shut down"))?;

        let pipeline = self.pipeline.clone();
        let task_cancel = cancel.clone();
        let task = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            pipeline.run(&request, &formats, &task_cancel)
        });

        match tokio::time::timeout(self.timeout, task).await {
            Ok(Ok(Ok(outcome))) => Ok(outcome),
            Ok(Ok(Err(error))) => Err(BuildFailure::from(&error)),
            Ok(Err(join_error)) => {
                let message = if join_error.is_panic() {
                    panic_message(join_error.into_panic())
                } else {
                    "build task was aborted".to_string()
                };
                tracing::error!(%message, "build panicked");
                Err(BuildFailure::internal(message))
            }
            Err(_) => {
                cancel.cancel();
                tracing::warn!(timeout_ms = self.timeout.as_millis() as u64, "request timed out");
                Err(BuildFailure::timeout(self.timeout))
            }
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("build panicked: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("build panicked: {}", s)
    } else {
        "build panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::error::FailureKind;
    use pf_kernel::KernelResult;
    use pf_kernel::kernel::fake::FakeKernel;
    use std::time::Instant;

    const ONE_BOX: &str = r#"{"operations": [{"id": "a", "op": "box", "size": [1, 1, 1]}]}"#;

    fn workers(count: usize, timeout_ms: u64) -> WorkerConfig {
        WorkerConfig {
            count,
            request_timeout_ms: timeout_ms,
        }
    }

    fn slow_factory(delay_ms: u64) -> impl KernelFactory<Kernel = FakeKernel> {
        move || -> KernelResult<FakeKernel> { Ok(FakeKernel::new().with_delay(Duration::from_millis(delay_ms))) }
    }

    #[tokio::test]
    async fn test_successful_submit() {
        let pipeline = Pipeline::new(slow_factory(0), &PipelineConfig::default());
        let dispatcher = Dispatcher::new(pipeline, &workers(2, 5_000));

        let outcome = dispatcher
            .submit(ONE_BOX.to_string(), vec![ExportFormat::Stl], CancelToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.artifacts.len(), 1);
        assert_eq!(dispatcher.available_workers(), 2);
    }

    #[tokio::test]
    async fn test_single_worker_serializes_builds() {
        // construct + tessellate, 50ms each
        let pipeline = Pipeline::new(slow_factory(50), &PipelineConfig::default());
        let dispatcher = Dispatcher::new(pipeline, &workers(1, 5_000));

        let started = Instant::now();
        let (a, b) = tokio::join!(
            dispatcher.submit(ONE_BOX.to_string(), vec![ExportFormat::Obj], CancelToken::new()),
            dispatcher.submit(ONE_BOX.to_string(), vec![ExportFormat::Obj], CancelToken::new()),
        );
        assert!(a.is_ok() && b.is_ok());
        assert!(started.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_timeout_sets_cancel_token() {
        let pipeline = Pipeline::new(slow_factory(100), &PipelineConfig::default());
        let dispatcher = Dispatcher::new(pipeline, &workers(1, 20));
        let cancel = CancelToken::new();

        let failure = dispatcher
            .submit(ONE_BOX.to_string(), vec![ExportFormat::Stl], cancel.clone())
            .await
            .unwrap_err();
        assert_eq!(failure.kind, FailureKind::Timeout);
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_panic_becomes_internal_failure() {
        let factory = || -> KernelResult<FakeKernel> { panic!("kernel exploded") };
        let dispatcher = Dispatcher::new(Pipeline::new(factory, &PipelineConfig::default()), &workers(1, 5_000));

        let failure = dispatcher
            .submit(ONE_BOX.to_string(), vec![ExportFormat::Stl], CancelToken::new())
            .await
            .unwrap_err();
        assert_eq!(failure.kind, FailureKind::Internal);
        assert!(failure.message.contains("kernel exploded"));
        assert_eq!(dispatcher.available_workers(), 1);
    }

    #[tokio::test]
    async fn test_request_errors_are_mapped() {
        let dispatcher = Dispatcher::new(
            Pipeline::new(slow_factory(0), &PipelineConfig::default()),
            &workers(1, 5_000),
        );
        let failure = dispatcher
            .submit(
                r#"{"operations": [{"id": "a", "op": "sphere", "radius": 0}]}"#.to_string(),
                vec![ExportFormat::Stl],
                CancelToken::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(failure.kind, FailureKind::Validation);
        assert_eq!(failure.field.as_deref(), Some("operations[0].radius"));
    }
}
