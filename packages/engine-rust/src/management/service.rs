//! The innermost management service, answering requests against the floor.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use anyhow::anyhow;
use tower::Service;

use super::{ManagementError, ManagementRequest, ManagementResponse};
use crate::floor::OfficeFloor;

/// Answers [`ManagementRequest`]s. Invocations start on a blocking thread,
/// since functions bound to passive teams run on the invoking thread, and
/// resolve once the process completes.
#[derive(Debug, Clone)]
pub struct ManagementService {
    floor: Arc<OfficeFloor>,
}

impl ManagementService {
    #[must_use]
    pub fn new(floor: Arc<OfficeFloor>) -> Self {
        Self { floor }
    }
}

impl Service<ManagementRequest> for ManagementService {
    type Response = ManagementResponse;
    type Error = ManagementError;
    type Future =
        Pin<Box<dyn Future<Output = Result<ManagementResponse, ManagementError>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: ManagementRequest) -> Self::Future {
        let floor = Arc::clone(&self.floor);
        Box::pin(async move {
            match request {
                ManagementRequest::ListOffices => Ok(ManagementResponse::Offices {
                    offices: floor.office_names(),
                }),
                ManagementRequest::ListFunctions { office } => Ok(ManagementResponse::Functions {
                    functions: floor.function_names(&office)?,
                }),
                ManagementRequest::ParameterType { office, function } => {
                    Ok(ManagementResponse::ParameterType {
                        parameter_type: floor.parameter_type(&office, &function)?,
                    })
                }
                ManagementRequest::Invoke {
                    office,
                    function,
                    parameter,
                } => {
                    let handle = tokio::task::spawn_blocking(move || {
                        floor.invoke_by_name(&office, &function, parameter.as_deref())
                    })
                    .await
                    .map_err(|e| anyhow!("invocation task failed: {e}"))??;
                    let report = handle
                        .completed()
                        .await
                        .ok_or_else(|| anyhow!("process {} never completed", handle.id()))?;
                    Ok(ManagementResponse::Invoked {
                        process_id: report.process_id,
                        outcome: report.outcome.label(),
                        escalation: report.outcome.escalation().map(ToString::to_string),
                        handled_escalations: report.handled_escalations.len(),
                        cleanup_escalations: report.cleanup_escalations.len(),
                    })
                }
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use officefloor_core::ParameterType;
    use tower::ServiceExt;

    use super::*;
    use crate::floor::InvokeError;
    use crate::testing::open_counter_floor;

    #[tokio::test]
    async fn lists_offices_and_functions() {
        let (floor, _) = open_counter_floor();
        let service = ManagementService::new(Arc::new(floor));

        let offices = service.clone().oneshot(ManagementRequest::ListOffices).await.unwrap();
        assert_eq!(
            offices,
            ManagementResponse::Offices {
                offices: vec!["counter".to_string()]
            }
        );

        let functions = service
            .oneshot(ManagementRequest::ListFunctions {
                office: "counter".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(
            functions,
            ManagementResponse::Functions {
                functions: vec!["add".to_string(), "report".to_string()]
            }
        );
    }

    #[tokio::test]
    async fn reports_parameter_type() {
        let (floor, _) = open_counter_floor();
        let response = ManagementService::new(Arc::new(floor))
            .oneshot(ManagementRequest::ParameterType {
                office: "counter".to_string(),
                function: "add".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(
            response,
            ManagementResponse::ParameterType {
                parameter_type: Some(ParameterType::Int)
            }
        );
    }

    #[tokio::test]
    async fn invoke_parses_parameter_and_waits_for_completion() {
        let (floor, total) = open_counter_floor();
        let response = ManagementService::new(Arc::new(floor))
            .oneshot(ManagementRequest::Invoke {
                office: "counter".to_string(),
                function: "add".to_string(),
                parameter: Some("5".to_string()),
            })
            .await
            .unwrap();
        assert!(matches!(
            response,
            ManagementResponse::Invoked {
                outcome: "completed",
                escalation: None,
                ..
            }
        ));
        assert_eq!(*total.lock(), 5);
    }

    #[tokio::test]
    async fn invoke_rejects_malformed_parameter() {
        let (floor, total) = open_counter_floor();
        let err = ManagementService::new(Arc::new(floor))
            .oneshot(ManagementRequest::Invoke {
                office: "counter".to_string(),
                function: "add".to_string(),
                parameter: Some("five".to_string()),
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ManagementError::Invoke(InvokeError::Parameter { .. })
        ));
        assert_eq!(*total.lock(), 0);
    }

    #[tokio::test]
    async fn unknown_office_is_an_error() {
        let (floor, _) = open_counter_floor();
        let err = ManagementService::new(Arc::new(floor))
            .oneshot(ManagementRequest::ListFunctions {
                office: "nowhere".to_string(),
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ManagementError::Invoke(InvokeError::UnknownOffice { .. })
        ));
    }

    #[test]
    fn request_decodes_from_json() {
        let request: ManagementRequest = serde_json::from_str(
            r#"{"op":"invoke","office":"counter","function":"add","parameter":"3"}"#,
        )
        .unwrap();
        assert_eq!(request.operation(), "invoke");
        assert_eq!(
            request,
            ManagementRequest::Invoke {
                office: "counter".to_string(),
                function: "add".to_string(),
                parameter: Some("3".to_string()),
            }
        );
    }
}
