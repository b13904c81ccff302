use thiserror::Error;

/// Faults raised by the hypervisor driver. Every operation carries an explicit
/// deadline; the driver itself never retries.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("VM `{0}` not found")]
    NotFound(String),
    #[error("operation `{op}` on VM `{vm}` timed out after {seconds}s")]
    Timeout { vm: String, op: String, seconds: u64 },
    #[error("host error on VM `{vm}`: {message}")]
    HostError { vm: String, message: String },
    #[error("guest authentication failed on VM `{vm}`: {message}")]
    GuestAuth { vm: String, message: String },
    #[error("guest execution failed on VM `{vm}`: {message}")]
    GuestExec { vm: String, message: String },
}

/// Rejections surfaced at submission time. Not recoverable locally; the
/// caller retries or fixes the request.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("task queue is full")]
    QueueFull,
    #[error("unknown VM name(s): {0}")]
    UnknownVm(String),
    #[error("timeout must be between {min} and {max} seconds")]
    InvalidTimeout { min: u64, max: u64 },
}

/// A pipeline-stage failure, wrapped with the stage and VM it happened on.
/// The analysis engine converts these into a Failed VmResult; they never
/// cross the sub-analysis boundary.
#[derive(Debug, Error)]
#[error("[{stage}] {vm}: {message}")]
pub struct StageError {
    pub stage: &'static str,
    pub vm: String,
    pub message: String,
}

impl StageError {
    pub fn new(stage: &'static str, vm: &str, message: impl ToString) -> Self {
        StageError { stage, vm: vm.to_string(), message: message.to_string() }
    }
}

pub type DriverResult<T> = std::result::Result<T, DriverError>;
pub type StageResult<T> = std::result::Result<T, StageError>;
