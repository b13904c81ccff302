use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle of a submitted task. Terminal states are exactly the ones that
/// carry a `completed_at` timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled)
    }
}

/// Sub-state machine of one (task, vm) pipeline instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmTaskStatus {
    Pending,
    Preparing,
    Uploading,
    Analyzing,
    Collecting,
    Restoring,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConnection {
    pub src_ip: String,
    pub src_port: String,
    pub dst_ip: String,
    pub dst_port: String,
    pub protocol: String,
    pub process: String,
    pub timestamp: String,
}

/// A normalized detection. `detection_time` keeps the vendor's own timestamp
/// string; conversion to local display form happens only when the HTTP result
/// handler serializes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub severity: Severity,
    pub alert_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_line: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detect_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detection_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub file_paths: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub network_connections: Vec<NetworkConnection>,
    pub source: String,
}

impl Alert {
    pub fn new(source: &str, severity: Severity, alert_type: impl Into<String>) -> Self {
        Alert {
            severity,
            alert_type: alert_type.into(),
            process_name: None,
            command_line: None,
            detect_reason: None,
            detection_time: None,
            file_path: None,
            file_paths: Vec::new(),
            network_connections: Vec::new(),
            source: source.to_string(),
        }
    }
}

/// Result of one (task, vm) sub-analysis, authored by exactly one pipeline
/// instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmResult {
    pub vm_name: String,
    pub status: VmTaskStatus,
    pub start_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default)]
    pub alerts: Vec<Alert>,
}

impl VmResult {
    pub fn pending(vm_name: &str) -> Self {
        VmResult {
            vm_name: vm_name.to_string(),
            status: VmTaskStatus::Pending,
            start_time: Utc::now(),
            end_time: None,
            error_message: None,
            alerts: Vec::new(),
        }
    }
}

/// One structural tracer record. Field presence depends on the event id;
/// unknown message fields are dropped during parsing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SysmonEvent {
    pub event_id: String,
    pub event_name: String,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub computer_name: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub process_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_line: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_process_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_filename: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub creation_utc_time: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_port: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination_ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination_port: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub query_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query_results: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_process_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_process_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub granted_access: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub call_trace: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_loaded: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signed: Option<String>,
}

/// Derived counts over a collected event window.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BehaviorStats {
    pub total_events: usize,
    #[serde(default)]
    pub event_types: std::collections::BTreeMap<String, usize>,
    pub process_creations: usize,
    pub file_creations: usize,
    pub file_deletions: usize,
    pub network_connections: usize,
    pub dns_queries: usize,
    pub process_accesses: usize,
    pub image_loads: usize,
    pub unique_processes: usize,
    pub unique_destinations: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_event_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_event_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub analysis_duration: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BehaviorResult {
    pub analysis_engine: String,
    pub status: VmTaskStatus,
    pub start_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default)]
    pub events: Vec<SysmonEvent>,
    #[serde(default)]
    pub statistics: BehaviorStats,
}

impl BehaviorResult {
    pub fn pending() -> Self {
        BehaviorResult {
            analysis_engine: "sysmon".to_string(),
            status: VmTaskStatus::Pending,
            start_time: Utc::now(),
            end_time: None,
            error_message: None,
            events: Vec::new(),
            statistics: BehaviorStats::default(),
        }
    }
}

/// One submitted sample analysis. Created at submission, mutated only by the
/// worker that owns it once picked up, removed by the TTL sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisTask {
    pub task_id: String,
    pub file_name: String,
    pub file_hash: String,
    pub file_size: u64,
    pub file_path: String,
    pub vm_names: Vec<String>,
    pub timeout: u64,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default)]
    pub vm_results: Vec<VmResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub behavior_results: Option<BehaviorResult>,
}

impl AnalysisTask {
    pub fn new(
        file_name: String,
        file_hash: String,
        file_size: u64,
        file_path: String,
        vm_names: Vec<String>,
        timeout: u64,
    ) -> Self {
        AnalysisTask {
            task_id: Uuid::new_v4().to_string(),
            file_name,
            file_hash,
            file_size,
            file_path,
            vm_names,
            timeout,
            status: TaskStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error_message: None,
            vm_results: Vec::new(),
            behavior_results: None,
        }
    }
}
