use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use log::{debug, error, info, warn};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::config::{EdrVmConfig, Settings};
use crate::edr::{collector_for, dedupe_alerts};
use crate::error::{StageError, StageResult};
use crate::models::{AnalysisTask, VmResult, VmTaskStatus};
use crate::pool::VmPool;
use crate::vbox::{GuestCredentials, VmDriver};

/// At most this many sub-analyses run concurrently inside one task.
const MAX_CONCURRENT_VMS: usize = 8;

/// Stage timings for the per-VM pipeline. Production uses the defaults; tests
/// zero them out so the pipeline runs without wall-clock sleeps.
#[derive(Debug, Clone, Copy)]
pub struct EngineTunables {
    pub ready_timeout_secs: u64,
    pub status_poll_secs: u64,
    pub boot_grace_secs: u64,
    /// Wait before each readiness probe retry, one entry per attempt.
    pub ready_probe_backoff: [u64; 5],
    pub av_settle_secs: u64,
    pub exec_timeout_secs: u64,
    pub file_check_timeout_secs: u64,
    pub wait_deleted_secs: u64,
    pub wait_exec_failed_secs: u64,
    pub wait_normal_cap_secs: u64,
}

impl Default for EngineTunables {
    fn default() -> Self {
        EngineTunables {
            ready_timeout_secs: 600,
            status_poll_secs: 10,
            boot_grace_secs: 30,
            ready_probe_backoff: [10, 15, 20, 25, 30],
            av_settle_secs: 3,
            exec_timeout_secs: 30,
            file_check_timeout_secs: 15,
            wait_deleted_secs: 10,
            wait_exec_failed_secs: 15,
            wait_normal_cap_secs: 25,
        }
    }
}

impl EngineTunables {
    /// All delays collapsed for unit tests.
    #[cfg(test)]
    pub fn immediate() -> Self {
        EngineTunables {
            ready_timeout_secs: 5,
            status_poll_secs: 0,
            boot_grace_secs: 0,
            ready_probe_backoff: [0; 5],
            av_settle_secs: 0,
            exec_timeout_secs: 1,
            file_check_timeout_secs: 1,
            wait_deleted_secs: 0,
            wait_exec_failed_secs: 0,
            wait_normal_cap_secs: 0,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct ExecutionOutcome {
    file_deleted_by_edr: bool,
    execution_failed: bool,
}

/// Drives the per-VM pipeline for one task: prepare, upload, execute,
/// collect, restore. Holds no state beyond references to the pool, the
/// driver, and the config.
pub struct AnalysisEngine {
    driver: Arc<dyn VmDriver>,
    pool: Arc<VmPool>,
    settings: Arc<Settings>,
    tunables: EngineTunables,
}

impl AnalysisEngine {
    pub fn new(
        driver: Arc<dyn VmDriver>,
        pool: Arc<VmPool>,
        settings: Arc<Settings>,
        tunables: EngineTunables,
    ) -> Self {
        AnalysisEngine { driver, pool, settings, tunables }
    }

    /// Fan one task out across its target VMs. Individual sub-analysis
    /// failures are recorded per-VM and never cancel siblings; the list of
    /// VmResults comes back in `vm_names` order.
    pub async fn analyze_sample(&self, task: &AnalysisTask, cancel: &CancellationToken) -> Vec<VmResult> {
        info!(
            "[ENGINE] task {}: analyzing {} on {} VM(s)",
            task.task_id,
            task.file_name,
            task.vm_names.len()
        );

        let semaphore = Arc::new(Semaphore::new(task.vm_names.len().clamp(1, MAX_CONCURRENT_VMS)));
        let mut futures = Vec::new();

        for vm_name in &task.vm_names {
            let semaphore = semaphore.clone();
            let vm_name = vm_name.clone();
            let cancel = cancel.clone();
            futures.push(async move {
                let _permit = semaphore.acquire().await.expect("semaphore never closed");
                self.analyze_on_vm(task, &vm_name, &cancel).await
            });
        }

        let results = join_all(futures).await;

        let successful = results.iter().filter(|r| r.status == VmTaskStatus::Completed).count();
        let total_alerts: usize = results.iter().map(|r| r.alerts.len()).sum();
        info!(
            "[ENGINE] task {}: {} succeeded, {} failed, {} alert(s) total",
            task.task_id,
            successful,
            results.len() - successful,
            total_alerts
        );
        results
    }

    /// One (task, vm) sub-analysis. Always releases the VM; converts every
    /// stage failure into a Failed VmResult instead of propagating.
    async fn analyze_on_vm(&self, task: &AnalysisTask, vm_name: &str, cancel: &CancellationToken) -> VmResult {
        let mut result = VmResult::pending(vm_name);
        let started = std::time::Instant::now();

        if !self.pool.acquire(vm_name, &task.task_id).await {
            // The task-level gate already admitted us; a refusal means the
            // VM is double-booked or unknown. Fail fast, never block.
            result.status = VmTaskStatus::Failed;
            result.error_message = Some(format!("resource busy: could not acquire VM {}", vm_name));
            result.end_time = Some(Utc::now());
            self.pool.update_stats(false, started.elapsed().as_secs_f64()).await;
            return result;
        }

        let outcome = self.run_pipeline(task, vm_name, &mut result, cancel).await;

        match outcome {
            Ok(()) => {
                result.status = VmTaskStatus::Completed;
                result.end_time = Some(Utc::now());
                self.pool.update_stats(true, started.elapsed().as_secs_f64()).await;
                info!(
                    "[ENGINE] {} on {}: completed with {} alert(s) in {:.1}s",
                    task.task_id,
                    vm_name,
                    result.alerts.len(),
                    started.elapsed().as_secs_f64()
                );
            }
            Err(stage_err) => {
                error!("[ENGINE] {} on {}: {}", task.task_id, vm_name, stage_err);
                result.status = VmTaskStatus::Failed;
                result.error_message = Some(stage_err.to_string());
                result.end_time = Some(Utc::now());
                self.recover_vm(vm_name, &stage_err).await;
                self.pool.update_stats(false, started.elapsed().as_secs_f64()).await;
            }
        }

        self.pool.release(vm_name).await;
        result
    }

    async fn run_pipeline(
        &self,
        task: &AnalysisTask,
        vm_name: &str,
        result: &mut VmResult,
        cancel: &CancellationToken,
    ) -> StageResult<()> {
        let vm_config = self
            .pool
            .vm_config(vm_name)
            .cloned()
            .ok_or_else(|| StageError::new("prepare", vm_name, "no configuration for VM"))?;
        let creds = credentials(&vm_config);

        result.status = VmTaskStatus::Preparing;
        self.prepare_vm(&vm_config, &creds, cancel).await?;

        result.status = VmTaskStatus::Uploading;
        let guest_path = self.upload_sample(task, &vm_config, &creds, cancel).await?;

        result.status = VmTaskStatus::Analyzing;
        let analysis_start = Utc::now();
        let outcome = self.execute_sample(&guest_path, &vm_config, &creds, cancel).await?;

        let wait_secs = if outcome.file_deleted_by_edr {
            info!("[ENGINE] {}: sample removed by EDR, short wait", vm_name);
            self.tunables.wait_deleted_secs
        } else if outcome.execution_failed {
            info!("[ENGINE] {}: sample execution failed, short wait", vm_name);
            self.tunables.wait_exec_failed_secs
        } else {
            task.timeout.min(self.tunables.wait_normal_cap_secs)
        };
        debug!("[ENGINE] {}: letting the EDR watch for {}s", vm_name, wait_secs);
        cancellable_sleep(wait_secs, cancel, "analyze", vm_name).await?;

        result.status = VmTaskStatus::Collecting;
        checkpoint(cancel, "collect", vm_name)?;
        let collector = collector_for(
            &vm_config.antivirus,
            vm_name,
            self.driver.clone(),
            creds.clone(),
            self.settings.edr_timeouts(),
        );
        let raw_alerts = collector
            .get_alerts(analysis_start, Some(Utc::now()), Some(&task.file_hash), Some(&task.file_name))
            .await;
        let alerts = dedupe_alerts(raw_alerts);
        info!("[ENGINE] {}: {} alert(s) after dedup", vm_name, alerts.len());
        result.alerts = alerts;

        result.status = VmTaskStatus::Restoring;
        checkpoint(cancel, "restore", vm_name)?;
        self.restore_vm(&vm_config).await?;

        Ok(())
    }

    /// Stop, revert to baseline, boot, and wait until the guest answers.
    async fn prepare_vm(
        &self,
        vm_config: &EdrVmConfig,
        creds: &GuestCredentials,
        cancel: &CancellationToken,
    ) -> StageResult<()> {
        let vm = &vm_config.name;
        info!("[ENGINE] preparing {}", vm);
        checkpoint(cancel, "prepare", vm)?;

        if let Err(e) = self.driver.cleanup_resources(vm).await {
            // Not fatal on its own, the revert below may still succeed.
            warn!("[ENGINE] {}: pre-revert cleanup failed: {}", vm, e);
            let _ = self.driver.power_off(vm).await;
        }

        checkpoint(cancel, "prepare", vm)?;
        self.driver
            .revert_snapshot(vm, &vm_config.baseline_snapshot)
            .await
            .map_err(|e| StageError::new("prepare", vm, format!("snapshot revert failed: {}", e)))?;

        self.driver
            .power_on(vm)
            .await
            .map_err(|e| StageError::new("prepare", vm, format!("power on failed: {}", e)))?;

        wait_for_vm_ready(self.driver.as_ref(), vm, creds, &self.tunables, cancel).await?;
        info!("[ENGINE] {} is ready", vm);
        Ok(())
    }

    async fn upload_sample(
        &self,
        task: &AnalysisTask,
        vm_config: &EdrVmConfig,
        creds: &GuestCredentials,
        cancel: &CancellationToken,
    ) -> StageResult<String> {
        let vm = &vm_config.name;
        checkpoint(cancel, "upload", vm)?;

        let destination = guest_destination(&vm_config.desktop_path(), &task.file_name);
        info!("[ENGINE] {}: uploading sample to {}", vm, destination);

        self.driver
            .copy_to_vm(vm, Path::new(&task.file_path), &destination, creds)
            .await
            .map_err(|e| StageError::new("upload", vm, format!("sample upload failed: {}", e)))?;
        Ok(destination)
    }

    /// Trigger the sample. A guest-side execution failure is recorded, not
    /// fatal: the EDR may already have acted on the file, which is exactly
    /// the evidence we are after.
    async fn execute_sample(
        &self,
        guest_path: &str,
        vm_config: &EdrVmConfig,
        creds: &GuestCredentials,
        cancel: &CancellationToken,
    ) -> StageResult<ExecutionOutcome> {
        let vm = &vm_config.name;
        let mut outcome = ExecutionOutcome::default();

        // Give the resident AV a moment to notice the new file.
        cancellable_sleep(self.tunables.av_settle_secs, cancel, "analyze", vm).await?;

        let check_cmd = format!("Test-Path '{}'", guest_path);
        match self
            .driver
            .exec_command(vm, &check_cmd, creds, self.tunables.file_check_timeout_secs)
            .await
        {
            Ok(r) if !r.success || r.output.to_lowercase().contains("false") => {
                info!("[ENGINE] {}: sample already removed by the EDR, skipping execution", vm);
                outcome.file_deleted_by_edr = true;
                return Ok(outcome);
            }
            Ok(_) => {}
            Err(e) => return Err(StageError::new("analyze", vm, format!("file check failed: {}", e))),
        }

        let execute_cmd = execution_command(guest_path);
        info!("[ENGINE] {}: executing sample: {}", vm, execute_cmd);
        checkpoint(cancel, "analyze", vm)?;

        match self
            .driver
            .exec_command(vm, &execute_cmd, creds, self.tunables.exec_timeout_secs)
            .await
        {
            Ok(r) if r.success => {
                if !r.output.trim().is_empty() {
                    debug!("[ENGINE] {}: execution output: {}", vm, r.output.trim());
                }
            }
            Ok(r) => {
                warn!("[ENGINE] {}: sample execution failed: {}", vm, r.output.trim());
                outcome.execution_failed = true;
            }
            Err(e) => {
                warn!("[ENGINE] {}: sample execution errored: {}", vm, e);
                outcome.execution_failed = true;
            }
        }
        Ok(outcome)
    }

    async fn restore_vm(&self, vm_config: &EdrVmConfig) -> StageResult<()> {
        let vm = &vm_config.name;
        info!("[ENGINE] restoring {}", vm);

        if let Err(e) = self.driver.cleanup_resources(vm).await {
            warn!("[ENGINE] {}: cleanup before revert failed: {}", vm, e);
        }
        self.driver
            .revert_snapshot(vm, &vm_config.baseline_snapshot)
            .await
            .map_err(|e| StageError::new("restore", vm, format!("snapshot revert failed: {}", e)))
    }

    /// Best-effort recovery after a failed sub-analysis. A recovered VM goes
    /// back to Idle; an unrecoverable one is marked Error so the scheduler
    /// prefers its peers.
    async fn recover_vm(&self, vm_name: &str, cause: &StageError) {
        let Some(vm_config) = self.pool.vm_config(vm_name).cloned() else {
            self.pool.mark_error(vm_name, &cause.to_string()).await;
            return;
        };

        let revert = self.driver.revert_snapshot(vm_name, &vm_config.baseline_snapshot).await;
        let cleanup = self.driver.cleanup_resources(vm_name).await;

        match (revert, cleanup) {
            (Ok(()), Ok(())) => {
                info!("[ENGINE] {}: recovered after failure, clearing error state", vm_name);
                self.pool.reset_error(vm_name).await;
            }
            (revert, cleanup) => {
                let detail = revert.err().or(cleanup.err()).map(|e| e.to_string()).unwrap_or_default();
                error!("[ENGINE] {}: recovery failed: {}", vm_name, detail);
                self.pool.mark_error(vm_name, &cause.to_string()).await;
            }
        }
    }
}

fn credentials(vm_config: &EdrVmConfig) -> GuestCredentials {
    GuestCredentials { username: vm_config.username.clone(), password: vm_config.password.clone() }
}

/// `<desktop>\<basename>`, with `.bin` appended when the name carries no
/// extension (a bare hash would otherwise confuse the execution dispatch).
pub fn guest_destination(desktop_path: &str, file_name: &str) -> String {
    let base = file_name.rsplit(['/', '\\']).next().unwrap_or(file_name);
    let base = if base.contains('.') { base.to_string() } else { format!("{}.bin", base) };
    format!("{}\\{}", desktop_path.trim_end_matches('\\'), base)
}

/// PowerShell command line for one sample, dispatched on its extension.
pub fn execution_command(guest_path: &str) -> String {
    let extension = guest_path.rsplit('.').next().unwrap_or("").to_lowercase();
    match extension.as_str() {
        "exe" | "com" | "scr" | "bat" | "cmd" => format!("Start-Process -FilePath '{}'", guest_path),
        "ps1" => format!("powershell -ExecutionPolicy Bypass -File '{}'", guest_path),
        "vbs" | "js" => format!("cscript '{}'", guest_path),
        // Not runnable on Windows; touching the content is enough to make
        // the on-access scanner look at it.
        "elf" => format!("Get-Content '{}' -TotalCount 1", guest_path),
        _ => format!("Start-Process -FilePath '{}'", guest_path),
    }
}

/// Poll the VM status until it reports Running, give the OS a boot grace
/// period, then probe in-guest readiness with an echo round-trip, retried
/// with increasing backoff. Shared by the EDR and Sysmon pipelines.
pub(crate) async fn wait_for_vm_ready(
    driver: &dyn VmDriver,
    vm: &str,
    creds: &GuestCredentials,
    tunables: &EngineTunables,
    cancel: &CancellationToken,
) -> StageResult<()> {
    let deadline = std::time::Instant::now() + Duration::from_secs(tunables.ready_timeout_secs);
    let mut last_state = String::from("unknown");

    loop {
        if std::time::Instant::now() >= deadline {
            return Err(StageError::new(
                "prepare",
                vm,
                format!("VM not ready within {}s (last state: {})", tunables.ready_timeout_secs, last_state),
            ));
        }
        checkpoint(cancel, "prepare", vm)?;

        match driver.get_status(vm).await {
            Ok(status) => {
                if status.power_state != last_state {
                    debug!("[ENGINE] {}: state {} -> {}", vm, last_state, status.power_state);
                    last_state = status.power_state.clone();
                }
                if status.power_state == "running" {
                    break;
                }
            }
            Err(e) => debug!("[ENGINE] {}: status poll failed: {}", vm, e),
        }
        cancellable_sleep(tunables.status_poll_secs, cancel, "prepare", vm).await?;
    }

    // The hypervisor says running; let the OS finish booting before probing.
    cancellable_sleep(tunables.boot_grace_secs, cancel, "prepare", vm).await?;

    for (attempt, backoff) in tunables.ready_probe_backoff.iter().enumerate() {
        checkpoint(cancel, "prepare", vm)?;
        match driver.exec_command(vm, "echo \"system_ready\"", creds, 30).await {
            Ok(r) if r.success && r.output.contains("system_ready") => {
                debug!("[ENGINE] {}: readiness probe passed on attempt {}", vm, attempt + 1);
                return Ok(());
            }
            Ok(r) => debug!("[ENGINE] {}: probe attempt {} not ready: {}", vm, attempt + 1, r.output.trim()),
            Err(e) => debug!("[ENGINE] {}: probe attempt {} failed: {}", vm, attempt + 1, e),
        }
        cancellable_sleep(*backoff, cancel, "prepare", vm).await?;
    }

    Err(StageError::new("prepare", vm, "guest readiness probe never answered"))
}

fn checkpoint(cancel: &CancellationToken, stage: &'static str, vm: &str) -> StageResult<()> {
    if cancel.is_cancelled() {
        Err(StageError::new(stage, vm, "cancelled"))
    } else {
        Ok(())
    }
}

pub(crate) async fn cancellable_sleep(
    secs: u64,
    cancel: &CancellationToken,
    stage: &'static str,
    vm: &str,
) -> StageResult<()> {
    if secs == 0 {
        return checkpoint(cancel, stage, vm);
    }
    tokio::select! {
        _ = cancel.cancelled() => Err(StageError::new(stage, vm, "cancelled")),
        _ = tokio::time::sleep(Duration::from_secs(secs)) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::VmState;
    use crate::testing::MockDriver;

    fn vm_config(name: &str, antivirus: &str) -> EdrVmConfig {
        EdrVmConfig {
            name: name.to_string(),
            antivirus: antivirus.to_string(),
            username: "vboxuser".to_string(),
            password: "123456".to_string(),
            baseline_snapshot: "disable-realtime".to_string(),
            desktop_path: None,
        }
    }

    fn settings(vms: &[EdrVmConfig]) -> Arc<Settings> {
        let mut s: Settings = serde_yaml::from_str(
            "server: {api_key: k}\ntask_settings: {}\n",
        )
        .unwrap();
        s.windows.edr_analysis = Some(crate::config::EdrAnalysisConfig {
            vms: vms.to_vec(),
            edr_timeouts: Default::default(),
        });
        Arc::new(s)
    }

    fn task(vm_names: &[&str]) -> AnalysisTask {
        let f = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(f.path(), b"MZ fake sample").unwrap();
        let (file, path) = f.keep().unwrap();
        drop(file);
        AnalysisTask::new(
            "sample.exe".to_string(),
            "deadbeef".to_string(),
            14,
            path.to_string_lossy().to_string(),
            vm_names.iter().map(|s| s.to_string()).collect(),
            120,
        )
    }

    fn engine_with(driver: Arc<MockDriver>, vms: &[EdrVmConfig]) -> (AnalysisEngine, Arc<VmPool>) {
        let pool = Arc::new(VmPool::new(vms));
        let engine = AnalysisEngine::new(
            driver,
            pool.clone(),
            settings(vms),
            EngineTunables::immediate(),
        );
        (engine, pool)
    }

    #[tokio::test(start_paused = true)]
    async fn two_vm_fanout_produces_one_result_each() {
        let driver = Arc::new(MockDriver::new());
        let vms = [vm_config("defender-vm", "defender"), vm_config("kaspersky-vm", "kaspersky")];
        let (engine, pool) = engine_with(driver, &vms);

        let task = task(&["defender-vm", "kaspersky-vm"]);
        let results = engine.analyze_sample(&task, &CancellationToken::new()).await;

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].vm_name, "defender-vm");
        assert_eq!(results[1].vm_name, "kaspersky-vm");
        for r in &results {
            assert_eq!(r.status, VmTaskStatus::Completed);
            assert!(r.end_time.is_some());
        }
        // Both VMs back to Idle after their sub-analyses.
        assert_eq!(pool.busy_count().await, 0);
        assert!(pool.acquire("defender-vm", "next").await);
        assert!(pool.acquire("kaspersky-vm", "next").await);
    }

    #[tokio::test(start_paused = true)]
    async fn power_on_failure_marks_vm_error_and_sorts_it_last() {
        let driver = Arc::new(MockDriver::new());
        // Power-on fails, and recovery's revert fails too, so the VM must
        // end up marked Error.
        driver.state.lock().unwrap().fail_power_on.insert("defender-vm".to_string(), 1);
        driver.state.lock().unwrap().fail_revert.insert("defender-vm".to_string(), 2);
        let vms = [vm_config("defender-vm", "defender"), vm_config("kaspersky-vm", "kaspersky")];
        let (engine, pool) = engine_with(driver, &vms);

        let task = task(&["defender-vm"]);
        let results = engine.analyze_sample(&task, &CancellationToken::new()).await;

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].status, VmTaskStatus::Failed);
        let message = results[0].error_message.as_deref().unwrap();
        assert!(message.contains("power on failed"), "unexpected: {message}");

        let status = pool.status().await;
        assert_eq!(status.vm_details["defender-vm"].state, VmState::Error);
        assert_eq!(status.vm_details["defender-vm"].error_count, 1);
        assert_eq!(status.stats.failed_tasks, 1);
        // The damaged VM sorts last for the next scheduling decision.
        let available = pool.available_vms(None).await;
        assert_eq!(available, vec!["kaspersky-vm".to_string(), "defender-vm".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_with_successful_recovery_leaves_vm_idle() {
        let driver = Arc::new(MockDriver::new());
        driver.state.lock().unwrap().fail_copy.insert("defender-vm".to_string(), 1);
        let vms = [vm_config("defender-vm", "defender")];
        let (engine, pool) = engine_with(driver, &vms);

        let task = task(&["defender-vm"]);
        let results = engine.analyze_sample(&task, &CancellationToken::new()).await;

        assert_eq!(results[0].status, VmTaskStatus::Failed);
        assert!(results[0].error_message.as_deref().unwrap().contains("upload"));
        // Revert + cleanup succeeded, so the VM is schedulable again.
        let status = pool.status().await;
        assert_eq!(status.vm_details["defender-vm"].state, VmState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn double_booked_vm_fails_fast_with_resource_busy() {
        let driver = Arc::new(MockDriver::new());
        let vms = [vm_config("defender-vm", "defender")];
        let (engine, pool) = engine_with(driver.clone(), &vms);

        assert!(pool.acquire("defender-vm", "other-task").await);
        let task = task(&["defender-vm"]);
        let results = engine.analyze_sample(&task, &CancellationToken::new()).await;

        assert_eq!(results[0].status, VmTaskStatus::Failed);
        assert!(results[0].error_message.as_deref().unwrap().contains("resource busy"));
        // The engine never touched the hypervisor for the refused VM.
        assert!(driver.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_task_cleans_up_and_releases() {
        let driver = Arc::new(MockDriver::new());
        let vms = [vm_config("defender-vm", "defender")];
        let (engine, pool) = engine_with(driver, &vms);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let task = task(&["defender-vm"]);
        let results = engine.analyze_sample(&task, &cancel).await;

        assert_eq!(results[0].status, VmTaskStatus::Failed);
        assert!(results[0].error_message.as_deref().unwrap().contains("cancelled"));
        assert_eq!(pool.busy_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn deleted_sample_skips_execution() {
        let driver = Arc::new(MockDriver::new());
        driver.respond("Test-Path", true, "False");
        let vms = [vm_config("defender-vm", "defender")];
        let (engine, _pool) = engine_with(driver.clone(), &vms);

        let task = task(&["defender-vm"]);
        let results = engine.analyze_sample(&task, &CancellationToken::new()).await;

        assert_eq!(results[0].status, VmTaskStatus::Completed);
        let calls = driver.calls();
        let exec_count = calls.iter().filter(|c| c.starts_with("exec_command")).count();
        // Readiness probe + Test-Path + collector query, but no Start-Process.
        assert!(exec_count >= 2);
    }

    #[test]
    fn guest_destination_appends_bin_without_extension() {
        assert_eq!(
            guest_destination("C:\\Users\\vboxuser\\Desktop", "sample.exe"),
            "C:\\Users\\vboxuser\\Desktop\\sample.exe"
        );
        assert_eq!(
            guest_destination("C:\\Users\\vboxuser\\Desktop\\", "deadbeefcafe"),
            "C:\\Users\\vboxuser\\Desktop\\deadbeefcafe.bin"
        );
        assert_eq!(
            guest_destination("C:\\Users\\vboxuser\\Desktop", "dir/nested/payload.ps1"),
            "C:\\Users\\vboxuser\\Desktop\\payload.ps1"
        );
    }

    #[test]
    fn execution_command_dispatches_on_extension() {
        assert!(execution_command("C:\\d\\a.exe").starts_with("Start-Process"));
        assert!(execution_command("C:\\d\\a.scr").starts_with("Start-Process"));
        assert!(execution_command("C:\\d\\a.ps1").contains("-ExecutionPolicy Bypass"));
        assert!(execution_command("C:\\d\\a.vbs").starts_with("cscript"));
        assert!(execution_command("C:\\d\\a.js").starts_with("cscript"));
        assert!(execution_command("C:\\d\\a.elf").starts_with("Get-Content"));
        assert!(execution_command("C:\\d\\a.docx").starts_with("Start-Process"));
    }
}
