use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::Serialize;
use tokio::sync::Mutex;

use crate::config::EdrVmConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VmState {
    Idle,
    Busy,
    Error,
}

#[derive(Debug)]
struct VmResourceState {
    state: VmState,
    current_task_id: Option<String>,
    last_used: Option<DateTime<Utc>>,
    error_count: u64,
    last_error: Option<String>,
}

/// One fleet member. The mutable state sits behind its own mutex; only
/// acquire/release/mark/reset touch it.
pub struct VmResource {
    pub vm_name: String,
    pub config: EdrVmConfig,
    state: Mutex<VmResourceState>,
}

impl VmResource {
    fn new(config: EdrVmConfig) -> Self {
        VmResource {
            vm_name: config.name.clone(),
            config,
            state: Mutex::new(VmResourceState {
                state: VmState::Idle,
                current_task_id: None,
                last_used: None,
                error_count: 0,
                last_error: None,
            }),
        }
    }

    /// Atomic: succeeds only from Idle. An Error VM must be reset first.
    async fn acquire(&self, task_id: &str) -> bool {
        let mut s = self.state.lock().await;
        if s.state == VmState::Idle {
            s.state = VmState::Busy;
            s.current_task_id = Some(task_id.to_string());
            s.last_used = Some(Utc::now());
            true
        } else {
            false
        }
    }

    async fn release(&self) {
        let mut s = self.state.lock().await;
        if s.state == VmState::Busy {
            s.state = VmState::Idle;
        } else if s.state == VmState::Idle {
            warn!("[POOL] release of already-idle VM {}", self.vm_name);
        }
        s.current_task_id = None;
    }

    async fn mark_error(&self, msg: &str) {
        let mut s = self.state.lock().await;
        s.state = VmState::Error;
        s.error_count += 1;
        s.current_task_id = None;
        s.last_error = Some(msg.to_string());
        warn!(
            "[POOL] VM {} entered error state: {} (error count: {})",
            self.vm_name, msg, s.error_count
        );
    }

    async fn reset_error(&self) {
        let mut s = self.state.lock().await;
        if s.state == VmState::Error {
            s.state = VmState::Idle;
            info!("[POOL] VM {} error state cleared", self.vm_name);
        }
    }

    pub async fn state(&self) -> VmState {
        self.state.lock().await.state
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolStats {
    pub total_tasks: u64,
    pub successful_tasks: u64,
    pub failed_tasks: u64,
    pub avg_task_time: f64,
}

#[derive(Debug, Serialize)]
pub struct VmDetail {
    pub state: VmState,
    pub current_task: Option<String>,
    pub error_count: u64,
    pub last_used: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct PoolStatus {
    pub total_vms: usize,
    pub idle_vms: usize,
    pub busy_vms: usize,
    pub error_vms: usize,
    pub vm_details: HashMap<String, VmDetail>,
    #[serde(flatten)]
    pub stats: PoolStats,
}

/// Fleet of analysis VMs. The name map is populated once at construction and
/// only read afterwards; per-VM state carries its own lock.
pub struct VmPool {
    resources: HashMap<String, Arc<VmResource>>,
    stats: Mutex<PoolStats>,
}

impl VmPool {
    pub fn new(vm_configs: &[EdrVmConfig]) -> Self {
        let mut resources = HashMap::new();
        for config in vm_configs {
            info!("[POOL] registering VM {} ({})", config.name, config.antivirus);
            resources.insert(config.name.clone(), Arc::new(VmResource::new(config.clone())));
        }
        info!("[POOL] initialized with {} VMs", resources.len());
        VmPool { resources, stats: Mutex::new(PoolStats::default()) }
    }

    pub fn vm_config(&self, vm_name: &str) -> Option<&EdrVmConfig> {
        self.resources.get(vm_name).map(|r| &r.config)
    }

    pub async fn acquire(&self, vm_name: &str, task_id: &str) -> bool {
        let Some(resource) = self.resources.get(vm_name) else {
            return false;
        };
        let acquired = resource.acquire(task_id).await;
        if acquired {
            debug!("[POOL] acquired {} for task {}", vm_name, task_id);
        } else {
            debug!("[POOL] could not acquire {} (not idle)", vm_name);
        }
        acquired
    }

    pub async fn release(&self, vm_name: &str) {
        if let Some(resource) = self.resources.get(vm_name) {
            resource.release().await;
            debug!("[POOL] released {}", vm_name);
        }
    }

    pub async fn mark_error(&self, vm_name: &str, msg: &str) {
        if let Some(resource) = self.resources.get(vm_name) {
            resource.mark_error(msg).await;
        }
    }

    pub async fn reset_error(&self, vm_name: &str) {
        if let Some(resource) = self.resources.get(vm_name) {
            resource.reset_error().await;
        }
    }

    /// VMs currently schedulable: Idle or Error (an Error VM is still a
    /// candidate, it just sorts last). When `requested` is given the result
    /// is the intersection. Ascending by error count so healthy VMs lead.
    pub async fn available_vms(&self, requested: Option<&[String]>) -> Vec<String> {
        let mut candidates: Vec<(String, u64)> = Vec::new();

        match requested {
            Some(names) => {
                for name in names {
                    match self.resources.get(name) {
                        Some(resource) => {
                            let s = resource.state.lock().await;
                            if matches!(s.state, VmState::Idle | VmState::Error) {
                                candidates.push((name.clone(), s.error_count));
                            }
                        }
                        None => warn!("[POOL] requested VM does not exist: {}", name),
                    }
                }
            }
            None => {
                for (name, resource) in &self.resources {
                    let s = resource.state.lock().await;
                    if matches!(s.state, VmState::Idle | VmState::Error) {
                        candidates.push((name.clone(), s.error_count));
                    }
                }
            }
        }

        candidates.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        candidates.into_iter().map(|(name, _)| name).collect()
    }

    pub async fn status(&self) -> PoolStatus {
        let mut status = PoolStatus {
            total_vms: self.resources.len(),
            idle_vms: 0,
            busy_vms: 0,
            error_vms: 0,
            vm_details: HashMap::new(),
            stats: self.stats.lock().await.clone(),
        };

        for (name, resource) in &self.resources {
            let s = resource.state.lock().await;
            match s.state {
                VmState::Idle => status.idle_vms += 1,
                VmState::Busy => status.busy_vms += 1,
                VmState::Error => status.error_vms += 1,
            }
            status.vm_details.insert(
                name.clone(),
                VmDetail {
                    state: s.state,
                    current_task: s.current_task_id.clone(),
                    error_count: s.error_count,
                    last_used: s.last_used,
                    last_error: s.last_error.clone(),
                },
            );
        }
        status
    }

    /// Called by the analysis engine once per sub-analysis completion.
    pub async fn update_stats(&self, successful: bool, duration_secs: f64) {
        let mut stats = self.stats.lock().await;
        stats.total_tasks += 1;
        if successful {
            stats.successful_tasks += 1;
        } else {
            stats.failed_tasks += 1;
        }
        let total_time = stats.avg_task_time * (stats.total_tasks - 1) as f64 + duration_secs;
        stats.avg_task_time = total_time / stats.total_tasks as f64;
    }

    pub async fn busy_count(&self) -> usize {
        let mut busy = 0;
        for resource in self.resources.values() {
            if resource.state().await == VmState::Busy {
                busy += 1;
            }
        }
        busy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vm(name: &str) -> EdrVmConfig {
        EdrVmConfig {
            name: name.to_string(),
            antivirus: "defender".to_string(),
            username: "vboxuser".to_string(),
            password: "123456".to_string(),
            baseline_snapshot: "disable-realtime".to_string(),
            desktop_path: None,
        }
    }

    fn pool() -> VmPool {
        VmPool::new(&[vm("defender-vm"), vm("kaspersky-vm")])
    }

    #[tokio::test]
    async fn acquire_only_from_idle() {
        let pool = pool();
        assert!(pool.acquire("defender-vm", "t1").await);
        // Busy VM refuses a second acquire.
        assert!(!pool.acquire("defender-vm", "t2").await);
        pool.release("defender-vm").await;
        assert!(pool.acquire("defender-vm", "t2").await);
    }

    #[tokio::test]
    async fn unknown_vm_is_not_acquirable() {
        let pool = pool();
        assert!(!pool.acquire("no-such-vm", "t1").await);
    }

    #[tokio::test]
    async fn error_state_blocks_acquire_until_reset() {
        let pool = pool();
        pool.mark_error("defender-vm", "boom").await;
        assert!(!pool.acquire("defender-vm", "t1").await);
        pool.reset_error("defender-vm").await;
        assert!(pool.acquire("defender-vm", "t1").await);
    }

    #[tokio::test]
    async fn release_is_safe_when_idle() {
        let pool = pool();
        pool.release("defender-vm").await;
        assert!(pool.acquire("defender-vm", "t1").await);
    }

    #[tokio::test]
    async fn available_vms_sorted_by_error_count() {
        let pool = pool();
        pool.mark_error("defender-vm", "x").await;
        pool.mark_error("defender-vm", "y").await;
        pool.reset_error("defender-vm").await;
        let available = pool.available_vms(None).await;
        assert_eq!(available, vec!["kaspersky-vm".to_string(), "defender-vm".to_string()]);
    }

    #[tokio::test]
    async fn available_vms_intersects_with_request() {
        let pool = pool();
        assert!(pool.acquire("defender-vm", "t1").await);
        let available = pool
            .available_vms(Some(&["defender-vm".to_string(), "kaspersky-vm".to_string()]))
            .await;
        assert_eq!(available, vec!["kaspersky-vm".to_string()]);
        let available = pool.available_vms(Some(&["ghost-vm".to_string()])).await;
        assert!(available.is_empty());
    }

    #[tokio::test]
    async fn error_vms_remain_listed_as_available() {
        let pool = pool();
        pool.mark_error("kaspersky-vm", "x").await;
        let available = pool.available_vms(None).await;
        assert_eq!(available, vec!["defender-vm".to_string(), "kaspersky-vm".to_string()]);
    }

    #[tokio::test]
    async fn status_counts_and_stats() {
        let pool = pool();
        assert!(pool.acquire("defender-vm", "t1").await);
        pool.mark_error("kaspersky-vm", "bad").await;
        pool.update_stats(true, 10.0).await;
        pool.update_stats(false, 20.0).await;

        let status = pool.status().await;
        assert_eq!(status.total_vms, 2);
        assert_eq!(status.busy_vms, 1);
        assert_eq!(status.error_vms, 1);
        assert_eq!(status.idle_vms, 0);
        assert_eq!(status.stats.total_tasks, 2);
        assert_eq!(status.stats.successful_tasks, 1);
        assert_eq!(status.stats.failed_tasks, 1);
        assert!((status.stats.avg_task_time - 15.0).abs() < f64::EPSILON);
        let detail = &status.vm_details["defender-vm"];
        assert_eq!(detail.current_task.as_deref(), Some("t1"));
    }

    #[tokio::test]
    async fn busy_vm_has_task_and_others_do_not() {
        let pool = pool();
        assert!(pool.acquire("defender-vm", "t1").await);
        let status = pool.status().await;
        assert!(status.vm_details["kaspersky-vm"].current_task.is_none());
        pool.release("defender-vm").await;
        let status = pool.status().await;
        assert!(status.vm_details["defender-vm"].current_task.is_none());
    }
}
