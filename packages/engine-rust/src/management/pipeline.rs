//! Pipeline composition: wraps the management service with its layers.

use std::sync::Arc;
use std::time::Duration;

use tower::ServiceBuilder;

use super::metrics::MetricsLayer;
use super::service::ManagementService;
use super::timeout::TimeoutLayer;
use super::{ManagementError, ManagementRequest, ManagementResponse};
use crate::floor::OfficeFloor;

/// Builds the management pipeline over `floor`.
///
/// Layer order (outermost to innermost):
/// 1. `TimeoutLayer` -- bound each request by `timeout`
/// 2. `MetricsLayer` -- record timing and outcome (closest to the floor)
#[must_use]
pub fn build_management_pipeline(
    floor: Arc<OfficeFloor>,
    timeout: Duration,
) -> impl tower::Service<
    ManagementRequest,
    Response = ManagementResponse,
    Error = ManagementError,
> + Clone {
    ServiceBuilder::new()
        .layer(TimeoutLayer::new(timeout))
        .layer(MetricsLayer)
        .service(ManagementService::new(floor))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
