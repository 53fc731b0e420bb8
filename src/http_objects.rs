use std::collections::HashMap;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use data_model::{
    ControlAck,
    HostStatus,
    InvocationResult,
    WorkerChannelDescriptor,
    WorkerPoolSnapshot,
};
use serde::{Deserialize, Serialize};
use tracing::error;
use utoipa::ToSchema;

use crate::dispatcher::DispatchError;

#[derive(Debug, ToSchema, Serialize, Deserialize)]
pub struct FuncHostAPIError {
    #[serde(skip)]
    status_code: StatusCode,
    message: String,
}

impl FuncHostAPIError {
    pub fn new(status_code: StatusCode, message: &str) -> Self {
        Self {
            status_code,
            message: message.to_string(),
        }
    }

    pub fn status_code(&self) -> StatusCode {
        self.status_code
    }

    pub fn internal_error(e: anyhow::Error) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string().as_str())
    }

    pub fn not_found(message: &str) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn bad_request(message: &str) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn unavailable(message: &str) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, message)
    }
}

impl IntoResponse for FuncHostAPIError {
    fn into_response(self) -> Response {
        error!("API Error: {} - {}", self.status_code, self.message);
        (self.status_code, self.message).into_response()
    }
}

impl From<serde_json::Error> for FuncHostAPIError {
    fn from(e: serde_json::Error) -> Self {
        Self::bad_request(&e.to_string())
    }
}

impl From<DispatchError> for FuncHostAPIError {
    fn from(e: DispatchError) -> Self {
        let message = e.to_string();
        match e {
            DispatchError::NotFound(_) => Self::not_found(&message),
            DispatchError::HostUnavailable { .. } |
            DispatchError::AdmissionRefused |
            DispatchError::WorkerUnavailable { .. } => Self::unavailable(&message),
            DispatchError::WorkerFault { .. } => Self::new(StatusCode::BAD_GATEWAY, &message),
            DispatchError::FunctionFailed { .. } => Self::internal_error(anyhow::anyhow!(message)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AckStatus {
    Accepted,
    AlreadyInProgress,
    Rejected,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ControlResponse {
    pub status: AckStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl From<ControlAck> for ControlResponse {
    fn from(ack: ControlAck) -> Self {
        match ack {
            ControlAck::Accepted => Self {
                status: AckStatus::Accepted,
                reason: None,
            },
            ControlAck::AlreadyInProgress => Self {
                status: AckStatus::AlreadyInProgress,
                reason: None,
            },
            ControlAck::Rejected { reason } => Self {
                status: AckStatus::Rejected,
                reason: Some(reason),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct HostStatusResponse {
    pub state: String,
    pub mode: Option<String>,
    pub generation: Option<u64>,
    pub functions: Vec<String>,
    pub drain_state: String,
    pub last_error: Option<String>,
    pub updated_at: u64,
}

impl From<HostStatus> for HostStatusResponse {
    fn from(status: HostStatus) -> Self {
        Self {
            state: status.state.to_string(),
            mode: status.mode.map(|m| m.to_string()),
            generation: status.generation,
            functions: status.functions,
            drain_state: status.drain_state.to_string(),
            last_error: status.last_error,
            updated_at: status.updated_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct DrainStatusResponse {
    pub state: String,
}

/// Assignment payload for a standby instance.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct AssignmentRequest {
    pub worker_runtime: String,
    #[serde(default)]
    pub script_root: Option<String>,
    #[serde(default)]
    pub app_settings: HashMap<String, String>,
}

impl From<AssignmentRequest> for data_model::SpecializationContext {
    fn from(req: AssignmentRequest) -> Self {
        Self {
            worker_runtime: req.worker_runtime,
            script_root: req.script_root,
            app_settings: req.app_settings,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct WorkerChannel {
    pub id: String,
    pub state: String,
    pub pending_invocations: u64,
    pub created_at: u64,
    pub ready_at: Option<u64>,
}

impl From<WorkerChannelDescriptor> for WorkerChannel {
    fn from(channel: WorkerChannelDescriptor) -> Self {
        Self {
            id: channel.id.to_string(),
            state: channel.state.to_string(),
            pending_invocations: channel.pending_invocations,
            created_at: channel.created_at,
            ready_at: channel.ready_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct WorkerPool {
    pub language: String,
    pub target_process_count: usize,
    pub ready_count: usize,
    pub channels: Vec<WorkerChannel>,
    pub error: Option<String>,
}

impl From<WorkerPoolSnapshot> for WorkerPool {
    fn from(snapshot: WorkerPoolSnapshot) -> Self {
        Self {
            ready_count: snapshot.ready_count(),
            language: snapshot.language,
            target_process_count: snapshot.target_process_count,
            channels: snapshot.channels.into_iter().map(Into::into).collect(),
            error: snapshot.error,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct InvokeResponse {
    pub invocation_id: String,
    pub function_name: String,
    pub host_generation: u64,
    pub worker_id: String,
    #[schema(value_type = Object)]
    pub output: serde_json::Value,
    pub duration_ms: u64,
}

impl From<InvocationResult> for InvokeResponse {
    fn from(result: InvocationResult) -> Self {
        Self {
            invocation_id: result.invocation_id.to_string(),
            function_name: result.function_name,
            host_generation: result.host_generation,
            worker_id: result.worker_id.to_string(),
            output: result.output,
            duration_ms: result.duration_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use data_model::{HostState, WorkerId};

    use super::*;

    #[test]
    fn test_dispatch_error_status_codes() {
        let cases = [
            (DispatchError::NotFound("f".to_string()), StatusCode::NOT_FOUND),
            (DispatchError::AdmissionRefused, StatusCode::SERVICE_UNAVAILABLE),
            (
                DispatchError::HostUnavailable {
                    state: HostState::Error,
                },
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                DispatchError::WorkerFault {
                    worker_id: WorkerId::new("w".to_string()),
                    message: "gone".to_string(),
                },
                StatusCode::BAD_GATEWAY,
            ),
        ];
        for (err, code) in cases {
            assert_eq!(FuncHostAPIError::from(err).status_code(), code);
        }
    }

    #[test]
    fn test_control_response_shape() {
        let json = serde_json::to_value(ControlResponse::from(ControlAck::rejected("busy"))).unwrap();
        assert_eq!(json, serde_json::json!({"status": "rejected", "reason": "busy"}));
        let json = serde_json::to_value(ControlResponse::from(ControlAck::Accepted)).unwrap();
        assert_eq!(json, serde_json::json!({"status": "accepted"}));
    }
}
