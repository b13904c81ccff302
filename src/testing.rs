//! Scriptable in-memory stand-in for the hypervisor, used by engine, pool,
//! and collector tests.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::{DriverError, DriverResult};
use crate::vbox::{ExecOutput, GuestCredentials, VmDriver, VmStatus};

#[derive(Default)]
pub struct MockState {
    /// vm -> current power state; unknown VMs report "poweroff".
    pub power_state: HashMap<String, String>,
    /// vm -> number of power_on calls that should fail before succeeding.
    pub fail_power_on: HashMap<String, u32>,
    /// vm -> revert_snapshot calls fail while > 0.
    pub fail_revert: HashMap<String, u32>,
    /// vm -> copy_to_vm calls fail while > 0.
    pub fail_copy: HashMap<String, u32>,
    /// Substring matchers against the executed command line, first hit wins.
    pub exec_responses: Vec<(String, ExecOutput)>,
    /// Chronological `op:vm` call log.
    pub calls: Vec<String>,
}

pub struct MockDriver {
    pub state: Mutex<MockState>,
}

impl MockDriver {
    pub fn new() -> Self {
        MockDriver { state: Mutex::new(MockState::default()) }
    }

    pub fn respond(&self, needle: &str, success: bool, output: &str) {
        self.state
            .lock()
            .unwrap()
            .exec_responses
            .push((needle.to_string(), ExecOutput { success, output: output.to_string() }));
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    fn log(&self, op: &str, vm: &str) {
        self.state.lock().unwrap().calls.push(format!("{}:{}", op, vm));
    }

    fn lookup_exec(&self, command: &str) -> ExecOutput {
        let state = self.state.lock().unwrap();
        for (needle, response) in &state.exec_responses {
            if command.contains(needle.as_str()) {
                return response.clone();
            }
        }
        // Default: commands succeed and echo probes look ready.
        if command.contains("echo") {
            ExecOutput { success: true, output: "system_ready".to_string() }
        } else {
            ExecOutput { success: true, output: String::new() }
        }
    }
}

#[async_trait]
impl VmDriver for MockDriver {
    async fn power_on(&self, vm: &str) -> DriverResult<()> {
        self.log("power_on", vm);
        let mut state = self.state.lock().unwrap();
        if let Some(remaining) = state.fail_power_on.get_mut(vm) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(DriverError::HostError {
                    vm: vm.to_string(),
                    message: "scripted power-on failure".to_string(),
                });
            }
        }
        state.power_state.insert(vm.to_string(), "running".to_string());
        Ok(())
    }

    async fn power_off(&self, vm: &str) -> DriverResult<()> {
        self.log("power_off", vm);
        self.state.lock().unwrap().power_state.insert(vm.to_string(), "poweroff".to_string());
        Ok(())
    }

    async fn acpi_power_button(&self, vm: &str) -> DriverResult<()> {
        self.log("acpi", vm);
        self.state.lock().unwrap().power_state.insert(vm.to_string(), "poweroff".to_string());
        Ok(())
    }

    async fn get_status(&self, vm: &str) -> DriverResult<VmStatus> {
        let state = self.state.lock().unwrap();
        let power_state =
            state.power_state.get(vm).cloned().unwrap_or_else(|| "poweroff".to_string());
        Ok(VmStatus { power_state, guest_additions: None })
    }

    async fn revert_snapshot(&self, vm: &str, _snapshot: &str) -> DriverResult<()> {
        self.log("revert", vm);
        let mut state = self.state.lock().unwrap();
        if let Some(remaining) = state.fail_revert.get_mut(vm) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(DriverError::HostError {
                    vm: vm.to_string(),
                    message: "scripted revert failure".to_string(),
                });
            }
        }
        state.power_state.insert(vm.to_string(), "poweroff".to_string());
        Ok(())
    }

    async fn copy_to_vm(
        &self,
        vm: &str,
        _local: &Path,
        _remote: &str,
        _creds: &GuestCredentials,
    ) -> DriverResult<()> {
        self.log("copy_to_vm", vm);
        let mut state = self.state.lock().unwrap();
        if let Some(remaining) = state.fail_copy.get_mut(vm) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(DriverError::HostError {
                    vm: vm.to_string(),
                    message: "scripted copy failure".to_string(),
                });
            }
        }
        Ok(())
    }

    async fn copy_from_vm(
        &self,
        vm: &str,
        _remote: &str,
        _local: &Path,
        _creds: &GuestCredentials,
    ) -> DriverResult<()> {
        self.log("copy_from_vm", vm);
        Ok(())
    }

    async fn exec_command(
        &self,
        vm: &str,
        command: &str,
        _creds: &GuestCredentials,
        _timeout_secs: u64,
    ) -> DriverResult<ExecOutput> {
        self.log("exec_command", vm);
        Ok(self.lookup_exec(command))
    }

    async fn exec_program(
        &self,
        vm: &str,
        _program: &str,
        args: &[&str],
        _creds: &GuestCredentials,
        _timeout_secs: u64,
    ) -> DriverResult<ExecOutput> {
        self.log("exec_program", vm);
        Ok(self.lookup_exec(&args.join(" ")))
    }
}

pub fn test_creds() -> GuestCredentials {
    GuestCredentials { username: "vboxuser".to_string(), password: "123456".to_string() }
}
