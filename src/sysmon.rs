use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use log::{debug, info, warn};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::config::SysmonAnalysisConfig;
use crate::engine::{cancellable_sleep, guest_destination, wait_for_vm_ready, EngineTunables};
use crate::error::{StageError, StageResult};
use crate::models::{AnalysisTask, BehaviorResult, BehaviorStats, SysmonEvent, VmTaskStatus};
use crate::vbox::{GuestCredentials, VmDriver};

const SYSMON_LOG: &str = "Microsoft-Windows-Sysmon/Operational";
const GUEST_SYSMON_PATH: &str = "C:\\Windows\\Temp\\Sysmon64.exe";
const GUEST_CONFIG_PATH: &str = "C:\\Windows\\Temp\\sysmon-config.xml";
const SYSMON_DOWNLOAD_URL: &str = "https://live.sysinternals.com/Sysmon64.exe";

/// Service names Sysmon registers under, in probe order.
const SERVICE_NAMES: &[&str] = &["Sysmon64", "Sysmon", "SysmonDrv"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SysmonConfigType {
    Light,
    Full,
    Custom,
}

impl SysmonConfigType {
    pub fn parse(raw: &str) -> SysmonConfigType {
        match raw {
            "full" => SysmonConfigType::Full,
            "custom" => SysmonConfigType::Custom,
            _ => SysmonConfigType::Light,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SysmonStatus {
    NotInstalled,
    Installed,
    Running,
    Stopped,
}

/// One raw record out of `Get-WinEvent ... | ConvertTo-Json`.
#[derive(Debug, Clone, Deserialize)]
pub struct RawSysmonEvent {
    #[serde(rename = "TimeCreated")]
    pub time_created: Option<serde_json::Value>,
    #[serde(rename = "Id")]
    pub id: Option<serde_json::Value>,
    #[serde(rename = "Message")]
    pub message: Option<String>,
}

/// Installs, probes, and reads Sysmon on analysis VMs. Installation is
/// idempotent: an installed-and-running tracer is left alone.
pub struct SysmonManager {
    driver: Arc<dyn VmDriver>,
    tools_dir: PathBuf,
}

impl SysmonManager {
    pub fn new(driver: Arc<dyn VmDriver>) -> Self {
        SysmonManager { driver, tools_dir: PathBuf::from("./tools/sysmon") }
    }

    /// Probe chain: known service names, then the executable under
    /// C:\Windows, then the driver file. Service state wins when present.
    pub async fn status(&self, vm: &str, creds: &GuestCredentials) -> (SysmonStatus, String) {
        for service in SERVICE_NAMES {
            let cmd = format!(
                "Get-Service -Name \"{}\" -ErrorAction SilentlyContinue | Select-Object Name, Status | ConvertTo-Json",
                service
            );
            match self.driver.exec_command(vm, &cmd, creds, 30).await {
                Ok(r) if r.success && !r.output.trim().is_empty() && r.output.trim() != "null" => {
                    let detail = format!("service {} reported: {}", service, r.output.trim());
                    return (parse_service_status(&r.output), detail);
                }
                Ok(_) => continue,
                Err(e) => {
                    debug!("[SYSMON] {}: service probe {} failed: {}", vm, service, e);
                    continue;
                }
            }
        }

        let exe_check = "Get-ChildItem -Path \"C:\\Windows\\Sysmon*.exe\" -ErrorAction SilentlyContinue | Select-Object Name";
        if let Ok(r) = self.driver.exec_command(vm, exe_check, creds, 30).await {
            if r.success && r.output.to_lowercase().contains("sysmon") {
                return (SysmonStatus::Installed, "executable present, service not running".to_string());
            }
        }

        let driver_check = "Test-Path \"C:\\Windows\\System32\\drivers\\SysmonDrv.sys\"";
        if let Ok(r) = self.driver.exec_command(vm, driver_check, creds, 15).await {
            if r.success && r.output.to_lowercase().contains("true") {
                return (SysmonStatus::Installed, "driver file present".to_string());
            }
        }

        (SysmonStatus::NotInstalled, "no service, executable, or driver found".to_string())
    }

    pub async fn install(
        &self,
        vm: &str,
        creds: &GuestCredentials,
        config_type: SysmonConfigType,
        custom_config: &str,
        force_reinstall: bool,
    ) -> Result<String, String> {
        info!("[SYSMON] installing on {}", vm);

        if !force_reinstall {
            let (status, _) = self.status(vm, creds).await;
            if matches!(status, SysmonStatus::Installed | SysmonStatus::Running) {
                info!("[SYSMON] already installed on {}", vm);
                return Ok("already installed".to_string());
            }
        }

        let installer = self.resolve_installer().await?;
        let config = self.resolve_config(config_type, custom_config)?;

        self.driver
            .copy_to_vm(vm, &installer, GUEST_SYSMON_PATH, creds)
            .await
            .map_err(|e| format!("failed to stage Sysmon executable: {}", e))?;
        self.driver
            .copy_to_vm(vm, &config, GUEST_CONFIG_PATH, creds)
            .await
            .map_err(|e| format!("failed to stage Sysmon configuration: {}", e))?;

        if force_reinstall {
            self.uninstall(vm, creds).await;
        }

        let install_cmd = format!("& \"{}\" -accepteula -i \"{}\"", GUEST_SYSMON_PATH, GUEST_CONFIG_PATH);
        match self.driver.exec_command(vm, &install_cmd, creds, 120).await {
            Ok(r) if r.success => {}
            Ok(r) => return Err(format!("installation failed: {}", r.output.trim())),
            Err(e) => return Err(format!("installation failed: {}", e)),
        }

        tokio::time::sleep(std::time::Duration::from_secs(5)).await;
        let (status, detail) = self.status(vm, creds).await;
        if matches!(status, SysmonStatus::Installed | SysmonStatus::Running) {
            info!("[SYSMON] installed on {} ({})", vm, detail);
            Ok(detail)
        } else {
            Err(format!("verification failed after install: {}", detail))
        }
    }

    async fn uninstall(&self, vm: &str, creds: &GuestCredentials) {
        info!("[SYSMON] uninstalling from {}", vm);
        match self.driver.exec_command(vm, "Sysmon64.exe -u", creds, 60).await {
            Ok(r) if r.success => {}
            _ => {
                warn!("[SYSMON] {}: standard uninstall failed, deleting service", vm);
                let _ = self.driver.exec_command(vm, "sc.exe delete Sysmon64", creds, 30).await;
            }
        }
    }

    pub async fn clear_event_log(&self, vm: &str, creds: &GuestCredentials) {
        let cmd = format!("wevtutil cl \"{}\"", SYSMON_LOG);
        if let Err(e) = self.driver.exec_command(vm, &cmd, creds, 30).await {
            warn!("[SYSMON] {}: clearing event log failed: {}", vm, e);
        }
    }

    pub async fn collect_events(
        &self,
        vm: &str,
        max_events: u32,
        timeout_secs: u64,
        creds: &GuestCredentials,
    ) -> Vec<RawSysmonEvent> {
        let cmd = format!(
            "Get-WinEvent -LogName \"{}\" -MaxEvents {} -ErrorAction SilentlyContinue | Select-Object TimeCreated, Id, LevelDisplayName, Message | ConvertTo-Json",
            SYSMON_LOG, max_events
        );
        match self.driver.exec_command(vm, &cmd, creds, timeout_secs).await {
            Ok(r) if r.success => parse_event_json(&r.output),
            Ok(r) => {
                warn!("[SYSMON] {}: event query failed: {}", vm, r.output.trim());
                Vec::new()
            }
            Err(e) => {
                warn!("[SYSMON] {}: event query failed: {}", vm, e);
                Vec::new()
            }
        }
    }

    async fn resolve_installer(&self) -> Result<PathBuf, String> {
        let local = self.tools_dir.join("Sysmon64.exe");
        if local.exists() {
            return Ok(local);
        }

        info!("[SYSMON] local installer missing, downloading from Sysinternals");
        let response = reqwest::get(SYSMON_DOWNLOAD_URL)
            .await
            .map_err(|e| format!("Sysmon download failed: {}", e))?;
        if !response.status().is_success() {
            return Err(format!("Sysmon download failed: HTTP {}", response.status()));
        }
        let bytes = response.bytes().await.map_err(|e| format!("Sysmon download failed: {}", e))?;

        let dest = std::env::temp_dir().join("Sysmon64.exe");
        tokio::fs::write(&dest, &bytes)
            .await
            .map_err(|e| format!("cannot write {}: {}", dest.display(), e))?;
        Ok(dest)
    }

    fn resolve_config(&self, config_type: SysmonConfigType, custom_config: &str) -> Result<PathBuf, String> {
        let path = match config_type {
            SysmonConfigType::Light => self.tools_dir.join("configs/sysmon-config-light.xml"),
            SysmonConfigType::Full => self.tools_dir.join("configs/sysmon-config.xml"),
            SysmonConfigType::Custom => {
                if custom_config.is_empty() {
                    return Err("custom config type selected but no path configured".to_string());
                }
                PathBuf::from(custom_config)
            }
        };
        if path.exists() {
            Ok(path)
        } else {
            Err(format!("Sysmon configuration not found: {}", path.display()))
        }
    }
}

/// Runs the behavioral branch: one sub-analysis against the dedicated Sysmon
/// VM, producing raw events plus derived statistics instead of alerts.
pub struct BehavioralEngine {
    driver: Arc<dyn VmDriver>,
    manager: SysmonManager,
    config: SysmonAnalysisConfig,
    cleanup_after_analysis: bool,
    tunables: EngineTunables,
}

impl BehavioralEngine {
    pub fn new(
        driver: Arc<dyn VmDriver>,
        config: SysmonAnalysisConfig,
        cleanup_after_analysis: bool,
        tunables: EngineTunables,
    ) -> Self {
        let manager = SysmonManager::new(driver.clone());
        BehavioralEngine { driver, manager, config, cleanup_after_analysis, tunables }
    }

    pub async fn run(&self, task: &AnalysisTask, cancel: &CancellationToken) -> BehaviorResult {
        let mut result = BehaviorResult::pending();
        info!("[SYSMON] task {}: behavioral analysis on {}", task.task_id, self.config.vm.name);

        match self.run_inner(task, &mut result, cancel).await {
            Ok(()) => {
                result.status = VmTaskStatus::Completed;
                info!(
                    "[SYSMON] task {}: collected {} event(s)",
                    task.task_id,
                    result.events.len()
                );
            }
            Err(e) => {
                warn!("[SYSMON] task {}: behavioral analysis failed: {}", task.task_id, e);
                result.status = VmTaskStatus::Failed;
                result.error_message = Some(e.to_string());
            }
        }
        result.end_time = Some(Utc::now());
        result
    }

    async fn run_inner(
        &self,
        task: &AnalysisTask,
        result: &mut BehaviorResult,
        cancel: &CancellationToken,
    ) -> StageResult<()> {
        let vm = self.config.vm.name.clone();
        let creds = GuestCredentials {
            username: self.config.vm.username.clone(),
            password: self.config.vm.password.clone(),
        };
        let started = std::time::Instant::now();

        result.status = VmTaskStatus::Preparing;
        if let Err(e) = self.driver.cleanup_resources(&vm).await {
            warn!("[SYSMON] {}: pre-revert cleanup failed: {}", vm, e);
        }
        self.driver
            .revert_snapshot(&vm, &self.config.vm.baseline_snapshot)
            .await
            .map_err(|e| StageError::new("prepare", &vm, format!("snapshot revert failed: {}", e)))?;
        self.driver
            .power_on(&vm)
            .await
            .map_err(|e| StageError::new("prepare", &vm, format!("power on failed: {}", e)))?;
        wait_for_vm_ready(self.driver.as_ref(), &vm, &creds, &self.tunables, cancel).await?;

        self.ensure_sysmon(&vm, &creds).await.map_err(|e| StageError::new("prepare", &vm, e))?;
        self.manager.clear_event_log(&vm, &creds).await;

        result.status = VmTaskStatus::Uploading;
        let destination = guest_destination(&self.config.vm.desktop_path(), &task.file_name);
        self.driver
            .copy_to_vm(&vm, Path::new(&task.file_path), &destination, &creds)
            .await
            .map_err(|e| StageError::new("upload", &vm, format!("sample upload failed: {}", e)))?;

        result.status = VmTaskStatus::Analyzing;
        cancellable_sleep(self.config.analysis_settings.pre_execution_delay, cancel, "analyze", &vm).await?;

        let execute_cmd = format!("Start-Process -FilePath \"{}\" -WindowStyle Hidden", destination);
        match self.driver.exec_command(&vm, &execute_cmd, &creds, self.tunables.exec_timeout_secs).await {
            Ok(r) if !r.success => warn!("[SYSMON] {}: sample may not have started: {}", vm, r.output.trim()),
            Err(e) => warn!("[SYSMON] {}: sample may not have started: {}", vm, e),
            _ => {}
        }

        let post_delay = self.config.analysis_settings.post_execution_delay;
        info!("[SYSMON] {}: monitoring activity for {}s", vm, post_delay);
        cancellable_sleep(post_delay, cancel, "analyze", &vm).await?;

        result.status = VmTaskStatus::Collecting;
        let raw_events = self
            .manager
            .collect_events(
                &vm,
                self.config.event_collection.max_events,
                self.config.event_collection.collection_timeout,
                &creds,
            )
            .await;
        result.events = raw_events.iter().filter_map(to_sysmon_event).collect();
        result.statistics = compute_stats(&result.events, Some(started.elapsed().as_secs_f64()));

        result.status = VmTaskStatus::Restoring;
        if let Err(e) = self.driver.cleanup_resources(&vm).await {
            warn!("[SYSMON] {}: post-analysis cleanup failed: {}", vm, e);
        }
        if self.cleanup_after_analysis {
            self.driver
                .revert_snapshot(&vm, &self.config.vm.baseline_snapshot)
                .await
                .map_err(|e| StageError::new("restore", &vm, format!("snapshot revert failed: {}", e)))?;
        }
        Ok(())
    }

    async fn ensure_sysmon(&self, vm: &str, creds: &GuestCredentials) -> Result<(), String> {
        let config_type = SysmonConfigType::parse(&self.config.config_type);
        let (status, detail) = self.manager.status(vm, creds).await;
        debug!("[SYSMON] {}: status {:?} ({})", vm, status, detail);

        match status {
            SysmonStatus::Running | SysmonStatus::Installed => Ok(()),
            SysmonStatus::NotInstalled => {
                self.manager
                    .install(vm, creds, config_type, &self.config.custom_config_path, false)
                    .await
                    .map(|_| ())
            }
            SysmonStatus::Stopped => {
                warn!("[SYSMON] {}: tracer stopped, reinstalling", vm);
                self.manager
                    .install(vm, creds, config_type, &self.config.custom_config_path, true)
                    .await
                    .map(|_| ())
            }
        }
    }
}

/// `Get-Service | ConvertTo-Json` yields `Status` as either the enum name or
/// its numeric value depending on the PowerShell version.
fn parse_service_status(json: &str) -> SysmonStatus {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(json) {
        match &value["Status"] {
            serde_json::Value::String(s) => {
                return match s.to_lowercase().as_str() {
                    "running" => SysmonStatus::Running,
                    "stopped" => SysmonStatus::Stopped,
                    _ => SysmonStatus::Installed,
                }
            }
            serde_json::Value::Number(n) => {
                return match n.as_i64() {
                    Some(4) => SysmonStatus::Running,
                    Some(1) => SysmonStatus::Stopped,
                    _ => SysmonStatus::Installed,
                }
            }
            _ => {}
        }
    }
    let lower = json.to_lowercase();
    if lower.contains("running") {
        SysmonStatus::Running
    } else if lower.contains("stopped") {
        SysmonStatus::Stopped
    } else {
        SysmonStatus::Installed
    }
}

/// The events query returns one object for a single hit, an array otherwise,
/// and the literal `null` for an empty log.
pub fn parse_event_json(raw: &str) -> Vec<RawSysmonEvent> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed == "null" {
        return Vec::new();
    }
    match serde_json::from_str::<serde_json::Value>(trimmed) {
        Ok(serde_json::Value::Array(items)) => items
            .into_iter()
            .filter_map(|v| serde_json::from_value(v).ok())
            .collect(),
        Ok(value) => serde_json::from_value::<RawSysmonEvent>(value).map(|e| vec![e]).unwrap_or_default(),
        Err(e) => {
            warn!("[SYSMON] cannot parse event JSON: {}", e);
            Vec::new()
        }
    }
}

/// Sysmon message bodies are `Key: value` lines; RuleName is noise.
pub fn parse_message_fields(message: &str) -> BTreeMap<String, String> {
    let mut fields = BTreeMap::new();
    for line in message.lines() {
        let line = line.trim();
        if line.starts_with("RuleName") {
            continue;
        }
        if let Some((key, value)) = line.split_once(':') {
            let key = key.trim();
            if !key.is_empty() {
                fields.insert(key.to_string(), value.trim().to_string());
            }
        }
    }
    fields
}

pub fn event_name_for(event_id: &str) -> &'static str {
    match event_id {
        "1" => "Process Creation",
        "3" => "Network Connection",
        "5" => "Process Terminated",
        "7" => "Image Loaded",
        "10" => "Process Access",
        "11" => "File Create",
        "22" => "DNS Query",
        "23" => "File Delete",
        _ => "Other",
    }
}

/// Flatten one raw record into the typed event model. Only fields defined
/// for the event id are populated; everything else in the message is
/// dropped.
pub fn to_sysmon_event(raw: &RawSysmonEvent) -> Option<SysmonEvent> {
    let message = raw.message.as_deref()?;
    let fields = parse_message_fields(message);

    let event_id = match &raw.id {
        Some(serde_json::Value::Number(n)) => n.to_string(),
        Some(serde_json::Value::String(s)) => s.clone(),
        _ => return None,
    };
    let time_created = match &raw.time_created {
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    };

    let get = |key: &str| fields.get(key).filter(|v| !v.is_empty()).cloned();

    let mut event = SysmonEvent {
        event_id: event_id.clone(),
        event_name: event_name_for(&event_id).to_string(),
        // UtcTime inside the message beats the event envelope timestamp.
        timestamp: get("UtcTime").unwrap_or(time_created),
        computer_name: get("Computer"),
        user: get("User"),
        ..Default::default()
    };

    match event_id.as_str() {
        "1" => {
            event.process_id = get("ProcessId");
            event.image = get("Image");
            event.command_line = get("CommandLine");
            event.parent_process_id = get("ParentProcessId");
            event.parent_image = get("ParentImage");
            event.process_name = event.image.as_deref().and_then(basename);
        }
        "3" => {
            event.process_id = get("ProcessId");
            event.image = get("Image");
            event.protocol = get("Protocol");
            event.source_ip = get("SourceIp");
            event.source_port = get("SourcePort");
            event.destination_ip = get("DestinationIp");
            event.destination_port = get("DestinationPort");
        }
        "5" => {
            event.process_id = get("ProcessId");
            event.image = get("Image");
        }
        "7" => {
            event.process_id = get("ProcessId");
            event.image = get("Image");
            event.image_loaded = get("ImageLoaded");
            event.signed = get("Signed");
            event.signature = get("Signature");
        }
        "10" => {
            event.source_process_id = get("SourceProcessId");
            event.source_image = get("SourceImage");
            event.target_process_id = get("TargetProcessId");
            event.target_image = get("TargetImage");
            event.granted_access = get("GrantedAccess");
            event.call_trace = get("CallTrace");
        }
        "11" | "23" => {
            event.process_id = get("ProcessId");
            event.image = get("Image");
            event.target_filename = get("TargetFilename");
            event.creation_utc_time = get("CreationUtcTime");
        }
        "22" => {
            event.process_id = get("ProcessId");
            event.image = get("Image");
            event.query_name = get("QueryName");
            event.query_results = get("QueryResults");
        }
        _ => {
            event.process_id = get("ProcessId");
            event.image = get("Image");
        }
    }

    Some(event)
}

fn basename(path: &str) -> Option<String> {
    path.rsplit(['\\', '/']).next().map(|s| s.to_string()).filter(|s| !s.is_empty())
}

/// Derive the summary counters the report surfaces alongside raw events.
pub fn compute_stats(events: &[SysmonEvent], analysis_duration: Option<f64>) -> BehaviorStats {
    let mut stats = BehaviorStats { total_events: events.len(), analysis_duration, ..Default::default() };
    let mut images: BTreeSet<&str> = BTreeSet::new();
    let mut destinations: BTreeSet<&str> = BTreeSet::new();
    let mut timestamps: Vec<&str> = Vec::new();

    for event in events {
        *stats.event_types.entry(event.event_id.clone()).or_insert(0) += 1;
        if !event.timestamp.is_empty() {
            timestamps.push(&event.timestamp);
        }
        match event.event_id.as_str() {
            "1" => {
                stats.process_creations += 1;
                if let Some(image) = event.image.as_deref() {
                    images.insert(image);
                }
            }
            "3" => {
                stats.network_connections += 1;
                if let Some(dst) = event.destination_ip.as_deref() {
                    destinations.insert(dst);
                }
            }
            "7" => stats.image_loads += 1,
            "10" => stats.process_accesses += 1,
            "11" => stats.file_creations += 1,
            "22" => stats.dns_queries += 1,
            "23" => stats.file_deletions += 1,
            _ => {}
        }
    }

    stats.unique_processes = images.len();
    stats.unique_destinations = destinations.len();
    timestamps.sort_unstable();
    stats.first_event_time = timestamps.first().map(|t| t.to_string());
    stats.last_event_time = timestamps.last().map(|t| t.to_string());
    stats
}
