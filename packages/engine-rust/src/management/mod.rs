//! Management operations over an open office floor.
//!
//! - [`service`]: `ManagementService`, answering requests against the floor
//! - [`timeout`]: Per-request timeout enforcement
//! - [`metrics`]: Request timing and counting via `tracing` spans and `metrics`
//! - [`pipeline`]: Composes the layers into a single service stack

pub mod metrics;
pub mod pipeline;
pub mod service;
pub mod timeout;

use officefloor_core::{ParameterType, ProcessId};
use serde::{Deserialize, Serialize};

use crate::floor::InvokeError;

pub use metrics::MetricsLayer;
pub use pipeline::build_management_pipeline;
pub use service::ManagementService;
pub use timeout::TimeoutLayer;

/// A management request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum ManagementRequest {
    ListOffices,
    ListFunctions {
        office: String,
    },
    ParameterType {
        office: String,
        function: String,
    },
    /// Runs a function to completion with a string-encoded parameter.
    Invoke {
        office: String,
        function: String,
        #[serde(default)]
        parameter: Option<String>,
    },
}

impl ManagementRequest {
    /// Operation name used in logs and metrics.
    #[must_use]
    pub fn operation(&self) -> &'static str {
        match self {
            ManagementRequest::ListOffices => "list-offices",
            ManagementRequest::ListFunctions { .. } => "list-functions",
            ManagementRequest::ParameterType { .. } => "parameter-type",
            ManagementRequest::Invoke { .. } => "invoke",
        }
    }
}

/// Response to a [`ManagementRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "kebab-case")]
pub enum ManagementResponse {
    Offices { offices: Vec<String> },
    Functions { functions: Vec<String> },
    ParameterType { parameter_type: Option<ParameterType> },
    Invoked {
        process_id: ProcessId,
        /// `completed` or `escalated`.
        outcome: &'static str,
        escalation: Option<String>,
        handled_escalations: usize,
        cleanup_escalations: usize,
    },
}

/// Errors from management requests.
#[derive(Debug, thiserror::Error)]
pub enum ManagementError {
    #[error(transparent)]
    Invoke(#[from] InvokeError),
    #[error("management request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}
