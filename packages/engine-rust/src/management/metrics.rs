//! Metrics middleware for management requests.
//!
//! Records request duration and outcome in a `tracing` span and through the
//! `metrics` facade.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use tower::{Layer, Service};
use tracing::{info_span, Instrument};

use super::{ManagementError, ManagementRequest, ManagementResponse};

// ---------------------------------------------------------------------------
// MetricsLayer
// ---------------------------------------------------------------------------

/// Tower layer that instruments management requests with timing and counting.
#[derive(Debug, Clone)]
pub struct MetricsLayer;

impl<S> Layer<S> for MetricsLayer {
    type Service = MetricsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        MetricsService { inner }
    }
}

// ---------------------------------------------------------------------------
// MetricsService
// ---------------------------------------------------------------------------

/// Service wrapper that records request duration and outcome.
#[derive(Debug, Clone)]
pub struct MetricsService<S> {
    inner: S,
}

impl<S> Service<ManagementRequest> for MetricsService<S>
where
    S: Service<ManagementRequest, Response = ManagementResponse, Error = ManagementError> + Send,
    S::Future: Send + 'static,
{
    type Response = ManagementResponse;
    type Error = ManagementError;
    type Future =
        Pin<Box<dyn Future<Output = Result<ManagementResponse, ManagementError>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: ManagementRequest) -> Self::Future {
        let operation = request.operation();
        let span = info_span!(
            "management",
            operation = operation,
            duration_ms = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );

        let fut = self.inner.call(request);

        Box::pin(
            async move {
                let start = Instant::now();
                let result = fut.await;
                let elapsed = start.elapsed();

                let outcome = match &result {
                    Ok(_) => "ok",
                    Err(_) => "error",
                };

                #[allow(clippy::cast_possible_truncation)]
                let duration_ms = elapsed.as_millis() as u64;
                tracing::Span::current().record("duration_ms", duration_ms);
                tracing::Span::current().record("outcome", outcome);
                metrics::counter!(
                    "officefloor_management_requests_total",
                    "operation" => operation,
                    "outcome" => outcome
                )
                .increment(1);
                metrics::histogram!(
                    "officefloor_management_request_duration_seconds",
                    "operation" => operation
                )
                .record(elapsed.as_secs_f64());

                if let Err(e) = &result {
                    tracing::warn!(operation, duration_ms, error = %e, "management request failed");
                } else {
                    tracing::info!(operation, duration_ms, "management request complete");
                }

                result
            }
            .instrument(span),
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
