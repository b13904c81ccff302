use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{debug, info, warn};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::config::Settings;
use crate::engine::AnalysisEngine;
use crate::error::SubmitError;
use crate::models::{AnalysisTask, TaskStatus};
use crate::sysmon::BehavioralEngine;

type SharedTask = Arc<RwLock<AnalysisTask>>;

struct RunningTask {
    cancel: CancellationToken,
    handle: tokio::task::JoinHandle<()>,
}

#[derive(Debug, serde::Serialize)]
pub struct QueueStatus {
    pub pending_tasks: usize,
    pub running_tasks: usize,
    pub total_tasks: usize,
    pub completed_tasks: usize,
    pub failed_tasks: usize,
    pub queue_capacity: usize,
    pub is_running: bool,
}

/// Owns the task store, the bounded FIFO queue, and the dispatcher that
/// admits tasks under the global concurrency gate.
pub struct TaskManager {
    settings: Arc<Settings>,
    engine: Arc<AnalysisEngine>,
    behavioral: Option<Arc<BehavioralEngine>>,
    tasks: RwLock<HashMap<String, SharedTask>>,
    queue_tx: mpsc::Sender<String>,
    queue_rx: Mutex<Option<mpsc::Receiver<String>>>,
    running: Mutex<HashMap<String, RunningTask>>,
    shutdown: CancellationToken,
    is_running: std::sync::atomic::AtomicBool,
}

impl TaskManager {
    pub fn new(
        settings: Arc<Settings>,
        engine: Arc<AnalysisEngine>,
        behavioral: Option<Arc<BehavioralEngine>>,
    ) -> Arc<Self> {
        let (queue_tx, queue_rx) = mpsc::channel(settings.task_settings.max_queue_size.max(1));
        Arc::new(TaskManager {
            settings,
            engine,
            behavioral,
            tasks: RwLock::new(HashMap::new()),
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
            running: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
            is_running: std::sync::atomic::AtomicBool::new(false),
        })
    }

    /// Launch the dispatcher. Idempotent.
    pub async fn start(self: &Arc<Self>) {
        if self.is_running.swap(true, std::sync::atomic::Ordering::SeqCst) {
            return;
        }
        let Some(queue_rx) = self.queue_rx.lock().await.take() else {
            warn!("[DISPATCH] dispatcher already consumed the queue");
            return;
        };
        let manager = self.clone();
        tokio::spawn(async move { manager.dispatch_loop(queue_rx).await });
        info!("[DISPATCH] task manager started");
    }

    /// Cancel the dispatcher and every running worker, then wait for the
    /// workers to wind down through their cleanup paths.
    pub async fn stop(self: &Arc<Self>) {
        if !self.is_running.swap(false, std::sync::atomic::Ordering::SeqCst) {
            return;
        }
        self.shutdown.cancel();

        let drained: Vec<(String, RunningTask)> = self.running.lock().await.drain().collect();
        for (task_id, running) in &drained {
            info!("[DISPATCH] cancelling running task {}", task_id);
            running.cancel.cancel();
        }
        for (_, running) in drained {
            let _ = running.handle.await;
        }
        info!("[DISPATCH] task manager stopped");
    }

    /// Non-blocking admission: the task is stored and queued, or rejected
    /// with `QueueFull` without side effects.
    pub async fn submit(&self, task: AnalysisTask) -> Result<String, SubmitError> {
        let task_id = task.task_id.clone();
        let shared: SharedTask = Arc::new(RwLock::new(task));
        self.tasks.write().await.insert(task_id.clone(), shared);

        match self.queue_tx.try_send(task_id.clone()) {
            Ok(()) => {
                info!("[DISPATCH] task {} queued", task_id);
                Ok(task_id)
            }
            Err(mpsc::error::TrySendError::Full(_)) | Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!("[DISPATCH] queue full, rejecting task {}", task_id);
                self.tasks.write().await.remove(&task_id);
                Err(SubmitError::QueueFull)
            }
        }
    }

    pub async fn get(&self, task_id: &str) -> Option<AnalysisTask> {
        let shared = self.tasks.read().await.get(task_id).cloned()?;
        let task = shared.read().await.clone();
        Some(task)
    }

    /// Newest first, optionally filtered by status.
    pub async fn list(&self, status: Option<TaskStatus>, limit: usize) -> Vec<AnalysisTask> {
        let shared: Vec<SharedTask> = self.tasks.read().await.values().cloned().collect();
        let mut tasks = Vec::with_capacity(shared.len());
        for s in shared {
            let task = s.read().await.clone();
            if status.map_or(true, |want| task.status == want) {
                tasks.push(task);
            }
        }
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        tasks.truncate(limit);
        tasks
    }

    /// Cooperative cancel. A running worker aborts at its next suspension
    /// point and still runs VM cleanup; a queued task just flips terminal.
    pub async fn cancel(&self, task_id: &str) -> bool {
        let Some(shared) = self.tasks.read().await.get(task_id).cloned() else {
            return false;
        };

        if let Some(running) = self.running.lock().await.get(task_id) {
            running.cancel.cancel();
        }

        let mut task = shared.write().await;
        if task.status.is_terminal() {
            return false;
        }
        task.status = TaskStatus::Cancelled;
        task.completed_at = Some(Utc::now());
        info!("[DISPATCH] task {} cancelled", task_id);
        true
    }

    pub async fn queue_status(&self) -> QueueStatus {
        let capacity = self.queue_tx.max_capacity();
        let pending = capacity - self.queue_tx.capacity();
        let running = self.running.lock().await.len();

        let mut completed = 0;
        let mut failed = 0;
        let shared: Vec<SharedTask> = self.tasks.read().await.values().cloned().collect();
        let total = shared.len();
        for s in &shared {
            match s.read().await.status {
                TaskStatus::Completed => completed += 1,
                TaskStatus::Failed => failed += 1,
                _ => {}
            }
        }

        QueueStatus {
            pending_tasks: pending,
            running_tasks: running,
            total_tasks: total,
            completed_tasks: completed,
            failed_tasks: failed,
            queue_capacity: capacity,
            is_running: self.is_running.load(std::sync::atomic::Ordering::SeqCst),
        }
    }

    /// TTL sweep: drop terminal tasks older than the cutoff.
    pub async fn cleanup_old(&self, days: i64) -> usize {
        let cutoff = Utc::now() - chrono::Duration::days(days);
        let mut to_remove = Vec::new();

        for (task_id, shared) in self.tasks.read().await.iter() {
            let task = shared.read().await;
            if task.status.is_terminal() && task.completed_at.map_or(false, |t| t < cutoff) {
                to_remove.push(task_id.clone());
            }
        }

        let mut tasks = self.tasks.write().await;
        for task_id in &to_remove {
            tasks.remove(task_id);
        }
        if !to_remove.is_empty() {
            info!("[DISPATCH] swept {} old task(s)", to_remove.len());
        }
        to_remove.len()
    }

    async fn dispatch_loop(self: Arc<Self>, mut queue_rx: mpsc::Receiver<String>) {
        info!("[DISPATCH] dispatcher running");
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }
            let task_id = match tokio::time::timeout(Duration::from_secs(1), queue_rx.recv()).await {
                Ok(Some(task_id)) => task_id,
                Ok(None) => break,
                Err(_) => continue,
            };

            // Global concurrency gate.
            if self.running.lock().await.len() >= self.settings.task_settings.concurrent_tasks {
                // Best-effort re-enqueue and back off.
                if self.queue_tx.try_send(task_id.clone()).is_err() {
                    warn!("[DISPATCH] queue full while re-enqueueing {}, task dropped", task_id);
                }
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }

            let Some(shared) = self.tasks.read().await.get(&task_id).cloned() else {
                debug!("[DISPATCH] task {} disappeared before dispatch", task_id);
                continue;
            };
            if shared.read().await.status != TaskStatus::Pending {
                debug!("[DISPATCH] task {} no longer pending, skipping", task_id);
                continue;
            }

            let cancel = CancellationToken::new();
            let manager = self.clone();
            let worker_cancel = cancel.clone();
            let worker_id = task_id.clone();
            // The worker must not outrun its own registration, or its
            // completion hook would fire before the insert below and leave a
            // stale entry holding the gate open.
            let (ready_tx, ready_rx) = tokio::sync::oneshot::channel::<()>();
            let handle = tokio::spawn(async move {
                let _ = ready_rx.await;
                manager.process_task(shared, &worker_id, worker_cancel).await;
                // Completion hook: the worker removes itself from the
                // running set no matter how it finished.
                manager.running.lock().await.remove(&worker_id);
            });

            self.running.lock().await.insert(task_id.clone(), RunningTask { cancel, handle });
            let _ = ready_tx.send(());
            info!("[DISPATCH] task {} started", task_id);
        }
        info!("[DISPATCH] dispatcher exited");
    }

    async fn process_task(&self, shared: SharedTask, task_id: &str, cancel: CancellationToken) {
        let snapshot = {
            let mut task = shared.write().await;
            task.status = TaskStatus::Running;
            task.started_at = Some(Utc::now());
            task.clone()
        };

        // Behavioral branch first, then the EDR fan-out.
        if let Some(behavioral) = &self.behavioral {
            let behavior = behavioral.run(&snapshot, &cancel).await;
            shared.write().await.behavior_results = Some(behavior);
        }

        if snapshot.vm_names.is_empty() {
            warn!("[DISPATCH] task {} has no EDR VMs, skipping EDR analysis", task_id);
        } else {
            let results = self.engine.analyze_sample(&snapshot, &cancel).await;
            shared.write().await.vm_results = results;
        }

        let mut task = shared.write().await;
        if task.status.is_terminal() {
            // A cancel landed while we were winding down; leave it be.
            return;
        }
        if cancel.is_cancelled() {
            task.status = TaskStatus::Cancelled;
        } else {
            // Zero successful sub-analyses is still Completed; Failed is
            // reserved for the orchestrator itself falling over.
            task.status = TaskStatus::Completed;
        }
        task.completed_at = Some(Utc::now());
        info!("[DISPATCH] task {} finished as {:?}", task_id, task.status);
    }
}

impl Drop for TaskManager {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Validate and clamp a submitted timeout into `[60, max_analysis_timeout]`.
pub fn validate_timeout(timeout: u64, settings: &Settings) -> Result<u64, SubmitError> {
    let max = settings.task_settings.max_analysis_timeout;
    if timeout < 60 || timeout > max {
        return Err(SubmitError::InvalidTimeout { min: 60, max });
    }
    Ok(timeout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EdrVmConfig;
    use crate::engine::EngineTunables;
    use crate::models::VmTaskStatus;
    use crate::pool::VmPool;
    use crate::testing::MockDriver;

    fn vm(name: &str) -> EdrVmConfig {
        EdrVmConfig {
            name: name.to_string(),
            antivirus: "defender".to_string(),
            username: "u".to_string(),
            password: "p".to_string(),
            baseline_snapshot: "base".to_string(),
            desktop_path: None,
        }
    }

    fn settings(concurrent: usize, queue: usize) -> Arc<Settings> {
        let yaml = format!(
            "server: {{api_key: k}}\ntask_settings: {{concurrent_tasks: {}, max_queue_size: {}}}\n",
            concurrent, queue
        );
        let mut s: Settings = serde_yaml::from_str(&yaml).unwrap();
        s.windows.edr_analysis = Some(crate::config::EdrAnalysisConfig {
            vms: vec![vm("defender-vm")],
            edr_timeouts: Default::default(),
        });
        Arc::new(s)
    }

    fn manager(concurrent: usize, queue: usize) -> Arc<TaskManager> {
        let settings = settings(concurrent, queue);
        let pool = Arc::new(VmPool::new(&[vm("defender-vm")]));
        let engine = Arc::new(AnalysisEngine::new(
            Arc::new(MockDriver::new()),
            pool,
            settings.clone(),
            EngineTunables::immediate(),
        ));
        TaskManager::new(settings, engine, None)
    }

    fn task(vm_names: &[&str]) -> AnalysisTask {
        AnalysisTask::new(
            "sample.exe".to_string(),
            "deadbeef".to_string(),
            4,
            "/tmp/nonexistent-sample".to_string(),
            vm_names.iter().map(|s| s.to_string()).collect(),
            120,
        )
    }

    #[tokio::test]
    async fn queue_capacity_is_enforced() {
        let manager = manager(3, 10);
        let mut accepted = 0;
        let mut rejected = 0;
        for _ in 0..12 {
            match manager.submit(task(&["defender-vm"])).await {
                Ok(_) => accepted += 1,
                Err(SubmitError::QueueFull) => rejected += 1,
                Err(e) => panic!("unexpected rejection: {e}"),
            }
        }
        assert_eq!(accepted, 10);
        assert_eq!(rejected, 2);
        // Rejected tasks leave no trace in the store.
        assert_eq!(manager.queue_status().await.total_tasks, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn serialized_tasks_share_one_vm_without_conflicts() {
        let manager = manager(1, 10);
        let id1 = manager.submit(task(&["defender-vm"])).await.unwrap();
        let id2 = manager.submit(task(&["defender-vm"])).await.unwrap();
        manager.start().await;

        // Under a gate of 1 the two tasks never contend for the VM, so both
        // complete with a successful sub-analysis.
        for id in [&id1, &id2] {
            let mut waited = 0;
            loop {
                let t = manager.get(id).await.unwrap();
                if t.status.is_terminal() {
                    assert_eq!(t.status, TaskStatus::Completed);
                    assert_eq!(t.vm_results.len(), 1);
                    assert_eq!(t.vm_results[0].status, VmTaskStatus::Completed);
                    break;
                }
                waited += 1;
                assert!(waited < 600, "task {id} never finished");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
        manager.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn task_with_no_vms_still_completes() {
        let manager = manager(2, 10);
        let id = manager.submit(task(&[])).await.unwrap();
        manager.start().await;

        let mut waited = 0;
        loop {
            let t = manager.get(&id).await.unwrap();
            if t.status.is_terminal() {
                assert_eq!(t.status, TaskStatus::Completed);
                assert!(t.vm_results.is_empty());
                break;
            }
            waited += 1;
            assert!(waited < 600, "task never finished");
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        manager.stop().await;
    }

    #[tokio::test]
    async fn cancel_of_pending_task_is_terminal() {
        let manager = manager(1, 10);
        let id = manager.submit(task(&["defender-vm"])).await.unwrap();
        assert!(manager.cancel(&id).await);

        let t = manager.get(&id).await.unwrap();
        assert_eq!(t.status, TaskStatus::Cancelled);
        assert!(t.completed_at.is_some());
        // Double-cancel reports failure.
        assert!(!manager.cancel(&id).await);
        // Unknown ids too.
        assert!(!manager.cancel("no-such-task").await);
    }

    #[tokio::test]
    async fn list_sorts_newest_first_and_filters() {
        let manager = manager(1, 10);
        let mut ids = Vec::new();
        for _ in 0..3 {
            ids.push(manager.submit(task(&[])).await.unwrap());
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        manager.cancel(&ids[0]).await;

        let all = manager.list(None, 10).await;
        assert_eq!(all.len(), 3);
        assert!(all[0].created_at >= all[1].created_at);
        assert!(all[1].created_at >= all[2].created_at);

        let cancelled = manager.list(Some(TaskStatus::Cancelled), 10).await;
        assert_eq!(cancelled.len(), 1);
        assert_eq!(cancelled[0].task_id, ids[0]);

        let limited = manager.list(None, 2).await;
        assert_eq!(limited.len(), 2);
    }

    #[tokio::test]
    async fn cleanup_sweeps_only_old_terminal_tasks() {
        let manager = manager(1, 10);
        let old_id = manager.submit(task(&[])).await.unwrap();
        let fresh_id = manager.submit(task(&[])).await.unwrap();
        manager.cancel(&old_id).await;
        manager.cancel(&fresh_id).await;

        // Backdate one completion.
        {
            let tasks = manager.tasks.read().await;
            let mut t = tasks.get(&old_id).unwrap().write().await;
            t.completed_at = Some(Utc::now() - chrono::Duration::days(30));
        }

        assert_eq!(manager.cleanup_old(7).await, 1);
        assert!(manager.get(&old_id).await.is_none());
        assert!(manager.get(&fresh_id).await.is_some());
    }

    #[tokio::test]
    async fn timeout_validation_bounds() {
        let s = settings(1, 10);
        assert!(validate_timeout(59, &s).is_err());
        assert!(validate_timeout(60, &s).is_ok());
        assert!(validate_timeout(1800, &s).is_ok());
        assert!(validate_timeout(1801, &s).is_err());
    }
}
