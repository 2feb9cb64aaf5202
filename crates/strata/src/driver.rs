//! Optional async driver for compression requests.
//!
//! The engine never generates text itself. [`drive_requests`] is a
//! convenience for callers that do: it runs a [`Generator`] over a batch of
//! requests concurrently (bounded by [`DriverConfig::max_concurrent`], each
//! call bounded by [`DriverConfig::timeout`]) and then applies the results
//! to the engine one at a time, in request order.
//!
//! ```ignore
//! let generator = FnGenerator::new(|req: CompressionRequest| async move {
//!     my_client.complete(&req.system_prompt, &req.user_prompt).await
//! });
//! let report = engine.maintain(step);
//! let driven = drive_requests(&mut engine, &generator, report.requests, &DriverConfig::default()).await;
//! ```

use crate::context::compression::{CompressionRequest, RequestId};
use crate::engine::{CompressionOutcome, ContextEngine};
use crate::error::EngineError;
use futures::StreamExt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tracing::warn;

/// Boxed future returned by [`Generator::generate`].
pub type GenerateFuture<'a> = Pin<Box<dyn Future<Output = Result<String, String>> + Send + 'a>>;

/// Produces text for a compression request.
pub trait Generator: Send + Sync {
    /// Generate text for `request`. `Err` carries a human-readable reason.
    fn generate<'a>(&'a self, request: &'a CompressionRequest) -> GenerateFuture<'a>;
}

/// Type-erased async handler for [`FnGenerator`].
type ErasedGenerate =
    Box<dyn Fn(CompressionRequest) -> Pin<Box<dyn Future<Output = Result<String, String>> + Send>> + Send + Sync>;

/// A closure-backed [`Generator`].
pub struct FnGenerator {
    handler: ErasedGenerate,
}

impl FnGenerator {
    pub fn new<F, Fut>(handler: F) -> Self
    where
        F: Fn(CompressionRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, String>> + Send + 'static,
    {
        let erased = move |request: CompressionRequest| -> Pin<Box<dyn Future<Output = Result<String, String>> + Send>> {
            Box::pin(handler(request))
        };
        Self {
            handler: Box::new(erased),
        }
    }
}

impl Generator for FnGenerator {
    fn generate<'a>(&'a self, request: &'a CompressionRequest) -> GenerateFuture<'a> {
        (self.handler)(request.clone())
    }
}

impl std::fmt::Debug for FnGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnGenerator").finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Per-request generation timeout.
    pub timeout: Duration,
    /// Maximum generations in flight at once.
    pub max_concurrent: usize,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            max_concurrent: 4,
        }
    }
}

impl DriverConfig {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_concurrent(mut self, n: usize) -> Self {
        self.max_concurrent = n.max(1);
        self
    }
}

/// What happened to each driven request.
#[derive(Debug, Default)]
pub struct DriveReport {
    pub outcomes: Vec<(RequestId, CompressionOutcome)>,
    /// Requests whose generation failed or timed out.
    pub failed: Vec<RequestId>,
    /// Requests no longer pending by the time results were applied
    /// (e.g. superseded by a restore).
    pub skipped: Vec<RequestId>,
}

impl DriveReport {
    pub fn completed(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, o)| !matches!(o, CompressionOutcome::Rejected(_)))
            .count()
    }
}

/// Generate text for `requests` concurrently, then apply every result to
/// `engine` in request order.
pub async fn drive_requests(
    engine: &mut ContextEngine,
    generator: &dyn Generator,
    requests: Vec<CompressionRequest>,
    config: &DriverConfig,
) -> DriveReport {
    let timeout = config.timeout;
    let results: Vec<(usize, Result<String, String>)> =
        futures::stream::iter(requests.iter().enumerate())
            .map(|(idx, request)| async move {
                let result = match tokio::time::timeout(timeout, generator.generate(request)).await {
                    Ok(r) => r,
                    Err(_) => Err(format!("generation timed out after {}s", timeout.as_secs_f64())),
                };
                (idx, result)
            })
            .buffer_unordered(config.max_concurrent.max(1))
            .collect()
            .await;

    let mut ordered: Vec<Option<Result<String, String>>> = vec![None; requests.len()];
    for (idx, result) in results {
        if let Some(slot) = ordered.get_mut(idx) {
            *slot = Some(result);
        }
    }

    let mut report = DriveReport::default();
    for (request, result) in requests.iter().zip(ordered) {
        let Some(result) = result else {
            continue;
        };
        let applied = match result {
            Ok(text) => engine
                .complete_compression(request.id, &text)
                .map(|outcome| report.outcomes.push((request.id, outcome))),
            Err(reason) => engine.fail_compression(request.id, reason).map(|_| {
                report.failed.push(request.id);
            }),
        };
        match applied {
            Ok(()) => {}
            Err(EngineError::RequestNotPending { .. } | EngineError::UnknownRequest(_)) => {
                report.skipped.push(request.id);
            }
            Err(e) => {
                warn!("Could not apply result for {}: {e}", request.id);
                report.skipped.push(request.id);
            }
        }
    }
    report
}

/// Convenience: drive every request the engine currently has pending.
pub async fn drive_pending(
    engine: &mut ContextEngine,
    generator: &dyn Generator,
    config: &DriverConfig,
) -> DriveReport {
    let requests: Vec<CompressionRequest> = engine.pending_requests().cloned().collect();
    drive_requests(engine, generator, requests, config).await
}
