pub mod test_objects;

use std::{
    collections::HashMap,
    fmt::{self, Display},
};

use anyhow::{anyhow, Result};
use derive_builder::Builder;
use funchost_utils::get_epoch_time_in_ms;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display as StrumDisplay, EnumString};

/// Readiness of the whole host. Only the lifecycle orchestrator writes it.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, AsRefStr, StrumDisplay,
)]
pub enum HostState {
    Initializing,
    Standby,
    Specializing,
    Running,
    Restarting,
    Draining,
    Offline,
    Error,
}

impl HostState {
    pub fn can_transition_to(&self, next: HostState) -> bool {
        use HostState::*;
        if next == Error {
            return true;
        }
        matches!(
            (self, next),
            (Initializing, Standby) |
                (Initializing, Running) |
                (Standby, Specializing) |
                (Specializing, Running) |
                (Running, Restarting) |
                (Restarting, Running) |
                (Running, Draining) |
                (Draining, Offline) |
                // operator restart is the way out of a failed build
                (Error, Restarting) |
                (Draining, Running) |
                (Offline, Running)
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, AsRefStr, StrumDisplay)]
pub enum HostMode {
    Standby,
    Specialized,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, AsRefStr, StrumDisplay)]
pub enum DrainState {
    Disabled,
    InProgress,
    Completed,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, AsRefStr, StrumDisplay)]
pub enum ChannelState {
    NotReady,
    Ready,
    Terminated,
}

impl ChannelState {
    pub fn as_u8(&self) -> u8 {
        match self {
            ChannelState::NotReady => 0,
            ChannelState::Ready => 1,
            ChannelState::Terminated => 2,
        }
    }

    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => ChannelState::NotReady,
            1 => ChannelState::Ready,
            _ => ChannelState::Terminated,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WorkerId(String);

impl WorkerId {
    pub fn new(id: String) -> Self {
        Self(id)
    }

    pub fn generate(language: &str) -> Self {
        Self(format!("{}-{}", language, nanoid::nanoid!(10)))
    }

    pub fn get(&self) -> &str {
        &self.0
    }
}

impl Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InvocationId(String);

impl InvocationId {
    pub fn new(id: String) -> Self {
        Self(id)
    }

    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn get(&self) -> &str {
        &self.0
    }
}

impl Display for InvocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for InvocationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Trigger kinds the host knows by name. Anything else is carried verbatim.
#[derive(Debug, Clone, PartialEq, Eq, AsRefStr, EnumString)]
#[strum(serialize_all = "camelCase")]
pub enum KnownTrigger {
    HttpTrigger,
    TimerTrigger,
    QueueTrigger,
    BlobTrigger,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Builder)]
#[builder(build_fn(skip))]
pub struct FunctionMetadata {
    pub name: String,
    pub language: String,
    pub trigger_type: String,
    pub script_file: Option<String>,
    #[serde(default)]
    pub disabled: bool,
}

impl FunctionMetadata {
    pub fn is_trigger(&self, trigger: KnownTrigger) -> bool {
        self.trigger_type == trigger.as_ref()
    }
}

impl Display for FunctionMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Function(name: {}, language: {}, trigger: {})",
            self.name, self.language, self.trigger_type
        )
    }
}

impl FunctionMetadataBuilder {
    pub fn build(&self) -> Result<FunctionMetadata> {
        let name = self
            .name
            .clone()
            .ok_or(anyhow!("function name is not present"))?;
        if name.is_empty() {
            return Err(anyhow!("function name is empty"));
        }
        let language = self
            .language
            .clone()
            .ok_or(anyhow!("language is not present for function {}", name))?;
        let trigger_type = self
            .trigger_type
            .clone()
            .unwrap_or_else(|| KnownTrigger::HttpTrigger.as_ref().to_string());
        Ok(FunctionMetadata {
            name,
            language,
            trigger_type,
            script_file: self.script_file.clone().flatten(),
            disabled: self.disabled.unwrap_or(false),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InvocationRequest {
    pub id: InvocationId,
    pub function_name: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl InvocationRequest {
    pub fn new(function_name: &str, payload: serde_json::Value) -> Self {
        Self {
            id: InvocationId::generate(),
            function_name: function_name.to_string(),
            payload,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InvocationResult {
    pub invocation_id: InvocationId,
    pub function_name: String,
    /// Generation of the host that served the invocation end to end.
    pub host_generation: u64,
    pub worker_id: WorkerId,
    pub output: serde_json::Value,
    pub duration_ms: u64,
}

/// One usage sample written for the external scale controller.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct MetricsSnapshot {
    #[serde(rename = "ExecutionCount")]
    pub execution_count: u64,
    #[serde(rename = "ExecutionTimeMS")]
    pub execution_time_ms: u64,
    #[serde(rename = "TotalTimeMS")]
    pub total_time_ms: u64,
    #[serde(rename = "IsAlwaysReady")]
    pub is_always_ready: bool,
}

impl MetricsSnapshot {
    pub fn has_activity(&self) -> bool {
        self.execution_count > 0
    }
}

/// The assignment signal that turns a standby instance into a customer host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct SpecializationContext {
    pub worker_runtime: String,
    #[serde(default)]
    pub script_root: Option<String>,
    #[serde(default)]
    pub app_settings: HashMap<String, String>,
}

impl SpecializationContext {
    pub fn new(worker_runtime: &str) -> Self {
        Self {
            worker_runtime: worker_runtime.to_string(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkerChannelDescriptor {
    pub id: WorkerId,
    pub language: String,
    pub state: ChannelState,
    pub pending_invocations: u64,
    pub created_at: u64,
    pub ready_at: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkerPoolSnapshot {
    pub language: String,
    pub target_process_count: usize,
    pub channels: Vec<WorkerChannelDescriptor>,
    /// Set when the restart circuit breaker has tripped for this language.
    pub error: Option<String>,
}

impl WorkerPoolSnapshot {
    pub fn ready_count(&self) -> usize {
        self.channels
            .iter()
            .filter(|c| c.state == ChannelState::Ready)
            .count()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HostStatus {
    pub state: HostState,
    pub mode: Option<HostMode>,
    pub generation: Option<u64>,
    pub functions: Vec<String>,
    pub drain_state: DrainState,
    pub last_error: Option<String>,
    pub updated_at: u64,
}

impl HostStatus {
    pub fn new(state: HostState, drain_state: DrainState) -> Self {
        Self {
            state,
            mode: None,
            generation: None,
            functions: Vec::new(),
            drain_state,
            last_error: None,
            updated_at: get_epoch_time_in_ms(),
        }
    }
}

/// Immediate answer to a control-plane request. The outcome is observed
/// through status reads.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ControlAck {
    Accepted,
    AlreadyInProgress,
    Rejected { reason: String },
}

impl ControlAck {
    pub fn rejected(reason: impl Into<String>) -> Self {
        ControlAck::Rejected {
            reason: reason.into(),
        }
    }

    pub fn is_accepted(&self) -> bool {
        !matches!(self, ControlAck::Rejected { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_state_edges() {
        use HostState::*;
        assert!(Initializing.can_transition_to(Standby));
        assert!(Initializing.can_transition_to(Running));
        assert!(Standby.can_transition_to(Specializing));
        assert!(Specializing.can_transition_to(Running));
        assert!(Running.can_transition_to(Draining));
        assert!(Draining.can_transition_to(Offline));
        assert!(Standby.can_transition_to(Error));
        assert!(Offline.can_transition_to(Error));

        assert!(!Standby.can_transition_to(Running));
        assert!(!Specializing.can_transition_to(Standby));
        assert!(!Running.can_transition_to(Specializing));
        assert!(!Draining.can_transition_to(Restarting));
        assert!(!Initializing.can_transition_to(Offline));
    }

    #[test]
    fn test_metrics_snapshot_wire_names() {
        let snapshot = MetricsSnapshot {
            execution_count: 3,
            execution_time_ms: 3000,
            total_time_ms: 500,
            is_always_ready: true,
        };
        let json = serde_json::to_value(snapshot).unwrap();
        assert_eq!(json["ExecutionCount"], 3);
        assert_eq!(json["ExecutionTimeMS"], 3000);
        assert_eq!(json["TotalTimeMS"], 500);
        assert_eq!(json["IsAlwaysReady"], true);
    }

    #[test]
    fn test_function_metadata_builder() {
        let meta = FunctionMetadataBuilder::default()
            .name("hello".to_string())
            .language("node".to_string())
            .build()
            .unwrap();
        assert!(meta.is_trigger(KnownTrigger::HttpTrigger));
        assert!(!meta.disabled);

        let err = FunctionMetadataBuilder::default()
            .language("node".to_string())
            .build();
        assert!(err.is_err());
    }

    #[test]
    fn test_control_ack_serialization() {
        let json = serde_json::to_value(ControlAck::rejected("draining")).unwrap();
        assert_eq!(json["status"], "rejected");
        assert_eq!(json["reason"], "draining");
        assert!(ControlAck::AlreadyInProgress.is_accepted());
    }

    #[test]
    fn test_channel_state_round_trips_through_u8() {
        for state in [
            ChannelState::NotReady,
            ChannelState::Ready,
            ChannelState::Terminated,
        ] {
            assert_eq!(ChannelState::from_u8(state.as_u8()), state);
        }
    }
}
