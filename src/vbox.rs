use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use log::{debug, info, warn};
use tokio::process::Command;

use crate::error::{DriverError, DriverResult};

const VBOXMANAGE_CANDIDATES: &[&str] = &[
    "C:\\Program Files\\Oracle\\VirtualBox\\VBoxManage.exe",
    "/usr/bin/VBoxManage",
    "/Applications/VirtualBox.app/Contents/MacOS/VBoxManage",
];

/// PowerShell command lines have a practical length ceiling; the base64
/// fallback transfer stays well under it.
const TRANSFER_CHUNK_CHARS: usize = 8000;

const POWER_OP_TIMEOUT: u64 = 300;
const STATUS_TIMEOUT: u64 = 60;
const MKDIR_TIMEOUT: u64 = 60;
const COPYTO_TIMEOUT: u64 = 120;
const COPYFROM_TIMEOUT: u64 = 60;

#[derive(Debug, Clone)]
pub struct GuestCredentials {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Default)]
pub struct VmStatus {
    pub power_state: String,
    pub guest_additions: Option<String>,
}

impl VmStatus {
    /// States that require a shutdown before the VM can be reverted.
    pub fn is_active(&self) -> bool {
        matches!(self.power_state.as_str(), "running" | "paused" | "stuck" | "starting")
    }

    pub fn is_stopped(&self) -> bool {
        matches!(self.power_state.as_str(), "poweroff" | "aborted" | "saved")
    }
}

/// Outcome of an in-guest command. `success` reflects the guest exit status;
/// infrastructure faults (spawn, deadline, authentication) surface as
/// `DriverError` instead.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub success: bool,
    pub output: String,
}

/// Hypervisor capability set for one fleet. All operations block with an
/// explicit deadline and never retry internally; retry policy belongs to the
/// caller.
#[async_trait]
pub trait VmDriver: Send + Sync {
    async fn power_on(&self, vm: &str) -> DriverResult<()>;
    async fn power_off(&self, vm: &str) -> DriverResult<()>;
    async fn acpi_power_button(&self, vm: &str) -> DriverResult<()>;
    async fn get_status(&self, vm: &str) -> DriverResult<VmStatus>;
    async fn revert_snapshot(&self, vm: &str, snapshot: &str) -> DriverResult<()>;
    async fn copy_to_vm(
        &self,
        vm: &str,
        local: &Path,
        remote: &str,
        creds: &GuestCredentials,
    ) -> DriverResult<()>;
    async fn copy_from_vm(
        &self,
        vm: &str,
        remote: &str,
        local: &Path,
        creds: &GuestCredentials,
    ) -> DriverResult<()>;
    async fn exec_command(
        &self,
        vm: &str,
        command: &str,
        creds: &GuestCredentials,
        timeout_secs: u64,
    ) -> DriverResult<ExecOutput>;
    async fn exec_program(
        &self,
        vm: &str,
        program: &str,
        args: &[&str],
        creds: &GuestCredentials,
        timeout_secs: u64,
    ) -> DriverResult<ExecOutput>;

    /// Bring a VM to a known stopped state: graceful shutdown, then ACPI,
    /// then force power-off, then poll at 1 s intervals until the VM reports
    /// stopped or ~30 s elapse. Returns Ok even when the deadline expires;
    /// the caller decides what an unstopped VM means. No-op when already
    /// stopped.
    async fn cleanup_resources(&self, vm: &str) -> DriverResult<()> {
        let status = self.get_status(vm).await?;
        debug!("[VBOX] cleanup {}: current state `{}`", vm, status.power_state);

        if status.is_active() {
            if self.power_off(vm).await.is_ok() {
                tokio::time::sleep(Duration::from_secs(3)).await;
            } else {
                warn!("[VBOX] {}: graceful power-off failed, trying ACPI", vm);
                if self.acpi_power_button(vm).await.is_ok() {
                    // ACPI shutdown needs longer to land.
                    tokio::time::sleep(Duration::from_secs(5)).await;
                } else {
                    warn!("[VBOX] {}: ACPI failed, forcing power-off", vm);
                    let _ = self.power_off(vm).await;
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }

        let mut waited = 0u32;
        while waited < 30 {
            match self.get_status(vm).await {
                Ok(s) if s.is_stopped() => {
                    debug!("[VBOX] cleanup {}: stopped ({})", vm, s.power_state);
                    break;
                }
                Ok(s) => {
                    debug!("[VBOX] cleanup {}: waiting, state `{}` ({}/30)", vm, s.power_state, waited + 1)
                }
                Err(e) => debug!("[VBOX] cleanup {}: status poll failed: {}", vm, e),
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
            waited += 1;
        }
        if waited >= 30 {
            warn!("[VBOX] {}: not fully stopped after 30s, continuing anyway", vm);
        }

        // Give the hypervisor a moment to release the session lock.
        tokio::time::sleep(Duration::from_secs(2)).await;
        Ok(())
    }
}

/// Drives VirtualBox through the VBoxManage CLI. Guest interaction goes over
/// `guestcontrol`, so the baseline snapshots must carry Guest Additions.
pub struct VBoxManageDriver {
    vboxmanage: PathBuf,
    startup_mode: String,
}

impl VBoxManageDriver {
    pub fn new(configured_path: &str, startup_mode: &str) -> Result<Self, String> {
        let vboxmanage = if configured_path == "auto" {
            VBOXMANAGE_CANDIDATES
                .iter()
                .map(PathBuf::from)
                .find(|p| p.exists())
                .ok_or_else(|| {
                    "VBoxManage not found in any known location; set \
                     virtualization.virtualbox.vboxmanage_path"
                        .to_string()
                })?
        } else {
            let p = PathBuf::from(configured_path);
            if !p.exists() {
                return Err(format!("VBoxManage not found at {}", p.display()));
            }
            p
        };

        let startup_mode = match startup_mode {
            "gui" | "headless" => startup_mode.to_string(),
            other => {
                warn!("[VBOX] invalid vm_startup_mode `{}`, using headless", other);
                "headless".to_string()
            }
        };

        info!("[VBOX] using {} (startup mode: {})", vboxmanage.display(), startup_mode);
        Ok(VBoxManageDriver { vboxmanage, startup_mode })
    }

    async fn run(
        &self,
        vm: &str,
        op: &'static str,
        args: &[&str],
        timeout_secs: u64,
    ) -> DriverResult<std::process::Output> {
        debug!("[VBOX] {} {}: VBoxManage {}", op, vm, args.join(" "));
        let mut cmd = Command::new(&self.vboxmanage);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        isolate_process(&mut cmd);

        let child = cmd.spawn().map_err(|e| DriverError::HostError {
            vm: vm.to_string(),
            message: format!("failed to spawn VBoxManage: {}", e),
        })?;
        let pid = child.id();

        match tokio::time::timeout(Duration::from_secs(timeout_secs), child.wait_with_output()).await
        {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(DriverError::HostError {
                vm: vm.to_string(),
                message: format!("VBoxManage I/O failure: {}", e),
            }),
            Err(_) => {
                if let Some(pid) = pid {
                    kill_process_tree(pid);
                }
                Err(DriverError::Timeout { vm: vm.to_string(), op: op.to_string(), seconds: timeout_secs })
            }
        }
    }

    /// Run a VBoxManage subcommand where only success matters.
    async fn run_checked(
        &self,
        vm: &str,
        op: &'static str,
        args: &[&str],
        timeout_secs: u64,
    ) -> DriverResult<()> {
        let output = self.run(vm, op, args, timeout_secs).await?;
        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            Err(classify_host_failure(vm, stderr))
        }
    }

    /// Fallback transfer when `guestcontrol copyto` refuses to cooperate:
    /// push the file through in-guest PowerShell as base64 chunks and verify
    /// the final size.
    async fn copy_via_guest_shell(
        &self,
        vm: &str,
        data: &[u8],
        remote: &str,
        creds: &GuestCredentials,
    ) -> DriverResult<()> {
        let encoded = base64::engine::general_purpose::STANDARD.encode(data);
        let chunks = chunk_string(&encoded, TRANSFER_CHUNK_CHARS);
        info!("[VBOX] {}: fallback transfer of {} in {} chunks", vm, remote, chunks.len());

        let clear = format!(
            "if (Test-Path '{p}') {{ Remove-Item '{p}' -Force }}",
            p = remote
        );
        let _ = self.exec_command(vm, &clear, creds, 30).await?;

        for (i, chunk) in chunks.iter().enumerate() {
            let cmdlet = if i == 0 { "Set-Content" } else { "Add-Content" };
            let write = format!(
                "[System.Convert]::FromBase64String('{chunk}') | {cmdlet} -Path '{remote}' -Encoding Byte"
            );
            let result = self.exec_command(vm, &write, creds, 60).await?;
            if !result.success {
                return Err(DriverError::GuestExec {
                    vm: vm.to_string(),
                    message: format!("chunk {}/{} failed: {}", i + 1, chunks.len(), result.output),
                });
            }
        }

        let verify = format!("(Get-Item \"{}\").Length", remote);
        let result = self.exec_command(vm, &verify, creds, 30).await?;
        if result.success {
            if let Ok(remote_size) = result.output.trim().parse::<usize>() {
                if remote_size != data.len() {
                    return Err(DriverError::GuestExec {
                        vm: vm.to_string(),
                        message: format!(
                            "size mismatch after fallback transfer: local {} vs remote {}",
                            data.len(),
                            remote_size
                        ),
                    });
                }
            }
        } else {
            warn!("[VBOX] {}: could not verify remote size, transfer reported no errors", vm);
        }
        Ok(())
    }
}

#[async_trait]
impl VmDriver for VBoxManageDriver {
    async fn power_on(&self, vm: &str) -> DriverResult<()> {
        info!("[VBOX] starting {} ({})", vm, self.startup_mode);
        self.run_checked(vm, "power_on", &["startvm", vm, "--type", self.startup_mode.as_str()], POWER_OP_TIMEOUT)
            .await
    }

    async fn power_off(&self, vm: &str) -> DriverResult<()> {
        self.run_checked(vm, "power_off", &["controlvm", vm, "poweroff"], POWER_OP_TIMEOUT).await
    }

    async fn acpi_power_button(&self, vm: &str) -> DriverResult<()> {
        self.run_checked(vm, "acpi", &["controlvm", vm, "acpipowerbutton"], POWER_OP_TIMEOUT).await
    }

    async fn get_status(&self, vm: &str) -> DriverResult<VmStatus> {
        let output = self
            .run(vm, "get_status", &["showvminfo", vm, "--machinereadable"], STATUS_TIMEOUT)
            .await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(classify_host_failure(vm, stderr));
        }
        Ok(parse_machine_readable(&String::from_utf8_lossy(&output.stdout)))
    }

    async fn revert_snapshot(&self, vm: &str, snapshot: &str) -> DriverResult<()> {
        info!("[VBOX] reverting {} to snapshot `{}`", vm, snapshot);
        self.run_checked(vm, "revert_snapshot", &["snapshot", vm, "restore", snapshot], POWER_OP_TIMEOUT)
            .await
    }

    async fn copy_to_vm(
        &self,
        vm: &str,
        local: &Path,
        remote: &str,
        creds: &GuestCredentials,
    ) -> DriverResult<()> {
        if !local.exists() {
            return Err(DriverError::HostError {
                vm: vm.to_string(),
                message: format!("local file missing: {}", local.display()),
            });
        }
        let local_str = local.to_string_lossy().to_string();

        // Target directory first; an already-existing directory is fine.
        let target_dir = remote.rsplit_once('\\').map(|(d, _)| d.replace('\\', "/")).unwrap_or_default();
        if !target_dir.is_empty() {
            let mkdir = self
                .run(
                    vm,
                    "mkdir",
                    &[
                        "guestcontrol", vm,
                        "--username", creds.username.as_str(),
                        "--password", creds.password.as_str(),
                        "mkdir", target_dir.as_str(), "--parents",
                    ],
                    MKDIR_TIMEOUT,
                )
                .await?;
            if !mkdir.status.success() {
                debug!(
                    "[VBOX] {}: mkdir {} failed (may already exist): {}",
                    vm,
                    target_dir,
                    String::from_utf8_lossy(&mkdir.stderr).trim()
                );
            }
        }

        let copy = self
            .run(
                vm,
                "copy_to_vm",
                &[
                    "guestcontrol", vm,
                    "--username", creds.username.as_str(),
                    "--password", creds.password.as_str(),
                    "copyto", local_str.as_str(), remote,
                ],
                COPYTO_TIMEOUT,
            )
            .await?;

        if copy.status.success() {
            info!("[VBOX] {}: copied {} -> {}", vm, local.display(), remote);
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&copy.stderr).trim().to_string();
        if stderr.to_lowercase().contains("authentication") {
            return Err(DriverError::GuestAuth { vm: vm.to_string(), message: stderr });
        }
        warn!("[VBOX] {}: copyto failed ({}), trying guest-shell fallback", vm, stderr);

        let data = tokio::fs::read(local).await.map_err(|e| DriverError::HostError {
            vm: vm.to_string(),
            message: format!("cannot read {}: {}", local.display(), e),
        })?;
        self.copy_via_guest_shell(vm, &data, remote, creds).await
    }

    async fn copy_from_vm(
        &self,
        vm: &str,
        remote: &str,
        local: &Path,
        creds: &GuestCredentials,
    ) -> DriverResult<()> {
        let local_str = local.to_string_lossy().to_string();
        self.run_checked(
            vm,
            "copy_from_vm",
            &[
                "guestcontrol", vm,
                "--username", creds.username.as_str(),
                "--password", creds.password.as_str(),
                "copyfrom", remote, local_str.as_str(),
            ],
            COPYFROM_TIMEOUT,
        )
        .await
    }

    async fn exec_command(
        &self,
        vm: &str,
        command: &str,
        creds: &GuestCredentials,
        timeout_secs: u64,
    ) -> DriverResult<ExecOutput> {
        let output = self
            .run(
                vm,
                "exec_command",
                &[
                    "guestcontrol", vm,
                    "--username", creds.username.as_str(),
                    "--password", creds.password.as_str(),
                    "run", "--exe", "cmd.exe",
                    "--",
                    "/c", "powershell", "-Command", command,
                ],
                timeout_secs,
            )
            .await?;
        guest_exec_result(vm, output)
    }

    async fn exec_program(
        &self,
        vm: &str,
        program: &str,
        args: &[&str],
        creds: &GuestCredentials,
        timeout_secs: u64,
    ) -> DriverResult<ExecOutput> {
        let mut vbox_args = vec![
            "guestcontrol", vm, "run",
            "--exe", program,
            "--username", creds.username.as_str(),
            "--password", creds.password.as_str(),
            "--wait-stdout", "--wait-stderr",
        ];
        if !args.is_empty() {
            vbox_args.push("--");
            vbox_args.extend_from_slice(args);
        }
        let output = self.run(vm, "exec_program", &vbox_args, timeout_secs).await?;
        guest_exec_result(vm, output)
    }
}

/// Distinguish auth failures and unknown machines from plain command errors.
fn classify_host_failure(vm: &str, stderr: String) -> DriverError {
    let lower = stderr.to_lowercase();
    if lower.contains("could not find a registered machine") || lower.contains("vbox_e_object_not_found")
    {
        DriverError::NotFound(vm.to_string())
    } else if lower.contains("authentication") || lower.contains("logon") {
        DriverError::GuestAuth { vm: vm.to_string(), message: stderr }
    } else {
        DriverError::HostError { vm: vm.to_string(), message: stderr }
    }
}

fn guest_exec_result(vm: &str, output: std::process::Output) -> DriverResult<ExecOutput> {
    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    if output.status.success() {
        Ok(ExecOutput { success: true, output: stdout })
    } else {
        let lower = stderr.to_lowercase();
        if lower.contains("authentication") || lower.contains("logon failure") {
            return Err(DriverError::GuestAuth { vm: vm.to_string(), message: stderr.trim().to_string() });
        }
        Ok(ExecOutput { success: false, output: stderr })
    }
}

/// Parse `showvminfo --machinereadable` key="value" lines.
fn parse_machine_readable(raw: &str) -> VmStatus {
    let mut info: HashMap<&str, &str> = HashMap::new();
    for line in raw.lines() {
        if let Some((key, value)) = line.split_once('=') {
            info.insert(key.trim(), value.trim().trim_matches('"'));
        }
    }
    VmStatus {
        power_state: info.get("VMState").unwrap_or(&"unknown").to_lowercase(),
        guest_additions: info.get("GuestAdditionsVersion").map(|s| s.to_string()),
    }
}

fn chunk_string(s: &str, size: usize) -> Vec<String> {
    s.as_bytes()
        .chunks(size)
        // base64 output is pure ASCII, chunking on bytes is safe
        .map(|c| String::from_utf8_lossy(c).to_string())
        .collect()
}

/// New session on POSIX / new process group on Windows so a deadline kill
/// takes down the whole child tree, not just VBoxManage itself.
#[cfg(unix)]
fn isolate_process(cmd: &mut Command) {
    unsafe {
        cmd.pre_exec(|| {
            libc::setsid();
            Ok(())
        });
    }
}

#[cfg(windows)]
fn isolate_process(cmd: &mut Command) {
    const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
    cmd.creation_flags(CREATE_NEW_PROCESS_GROUP);
}

#[cfg(unix)]
fn kill_process_tree(pid: u32) {
    unsafe {
        libc::killpg(pid as i32, libc::SIGKILL);
    }
}

#[cfg(windows)]
fn kill_process_tree(pid: u32) {
    let _ = std::process::Command::new("taskkill")
        .args(["/T", "/F", "/PID", &pid.to_string()])
        .output();
}
