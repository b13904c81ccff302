use std::sync::Arc;

use actix_multipart::Multipart;
use actix_web::{delete, get, post, web, HttpRequest, HttpResponse, Responder};
use futures::TryStreamExt;
use log::{info, warn};
use uuid::Uuid;

use crate::config::Settings;
use crate::error::SubmitError;
use crate::helpers::{sanitize_filename, sha256_hex, to_local_time};
use crate::models::{AnalysisTask, TaskStatus};
use crate::pool::VmPool;
use crate::router::select_vms;
use crate::tasks::{validate_timeout, TaskManager};

pub struct AppState {
    pub settings: Arc<Settings>,
    pub manager: Arc<TaskManager>,
    pub pool: Arc<VmPool>,
    pub api_key: String,
}

fn authorized(req: &HttpRequest, state: &AppState) -> bool {
    req.headers()
        .get("X-API-Key")
        .and_then(|v| v.to_str().ok())
        .map_or(false, |key| key == state.api_key)
}

fn unauthorized() -> HttpResponse {
    HttpResponse::Unauthorized().json(serde_json::json!({ "error": "invalid API key" }))
}

pub fn parse_status(raw: &str) -> Option<TaskStatus> {
    match raw.to_lowercase().as_str() {
        "pending" => Some(TaskStatus::Pending),
        "running" => Some(TaskStatus::Running),
        "completed" => Some(TaskStatus::Completed),
        "failed" => Some(TaskStatus::Failed),
        "cancelled" => Some(TaskStatus::Cancelled),
        _ => None,
    }
}

#[get("/api/health")]
pub async fn health() -> impl Responder {
    HttpResponse::Ok().json(serde_json::json!({ "status": "healthy", "service": "vbox-warden" }))
}

#[post("/api/analyze")]
pub async fn analyze(
    req: HttpRequest,
    state: web::Data<AppState>,
    mut payload: Multipart,
) -> Result<HttpResponse, actix_web::Error> {
    if !authorized(&req, &state) {
        return Ok(unauthorized());
    }

    let mut file_name = String::new();
    let mut file_bytes: Vec<u8> = Vec::new();
    let mut vm_names_raw = String::new();
    let mut timeout = state.settings.task_settings.default_analysis_timeout;
    let max_file_size = state.settings.server.max_file_size;

    while let Ok(Some(mut field)) = TryStreamExt::try_next(&mut payload).await {
        let content_disposition = field.content_disposition();
        let upload_name = content_disposition.as_ref().and_then(|cd| cd.get_filename()).map(String::from);
        let field_name = content_disposition
            .as_ref()
            .and_then(|cd| cd.get_name())
            .unwrap_or("")
            .to_string();

        if let Some(name) = upload_name {
            file_name = sanitize_filename(&name);
            while let Ok(Some(chunk)) = TryStreamExt::try_next(&mut field).await {
                if file_bytes.len() + chunk.len() > max_file_size {
                    return Ok(HttpResponse::PayloadTooLarge().json(serde_json::json!({
                        "error": format!("file exceeds the {} byte limit", max_file_size)
                    })));
                }
                file_bytes.extend_from_slice(&chunk);
            }
        } else if field_name == "vm_names" {
            let mut value = Vec::new();
            while let Ok(Some(chunk)) = TryStreamExt::try_next(&mut field).await {
                value.extend_from_slice(&chunk);
            }
            vm_names_raw = String::from_utf8_lossy(&value).trim().to_string();
        } else if field_name == "timeout" {
            let mut value = Vec::new();
            while let Ok(Some(chunk)) = TryStreamExt::try_next(&mut field).await {
                value.extend_from_slice(&chunk);
            }
            if let Ok(parsed) = String::from_utf8_lossy(&value).trim().parse::<u64>() {
                timeout = parsed;
            }
        }
    }

    if file_name.is_empty() || file_bytes.is_empty() {
        return Ok(HttpResponse::BadRequest().json(serde_json::json!({ "error": "no file uploaded" })));
    }

    let timeout = match validate_timeout(timeout, &state.settings) {
        Ok(t) => t,
        Err(e) => {
            return Ok(HttpResponse::BadRequest().json(serde_json::json!({ "error": e.to_string() })))
        }
    };

    let upload_dir = &state.settings.server.upload_dir;
    if let Err(e) = tokio::fs::create_dir_all(upload_dir).await {
        return Ok(HttpResponse::InternalServerError()
            .json(serde_json::json!({ "error": format!("cannot create upload dir: {}", e) })));
    }
    let file_hash = sha256_hex(&file_bytes);
    let staged_path = format!("{}/{}_{}", upload_dir, Uuid::new_v4(), file_name);
    if let Err(e) = tokio::fs::write(&staged_path, &file_bytes).await {
        return Ok(HttpResponse::InternalServerError()
            .json(serde_json::json!({ "error": format!("cannot stage sample: {}", e) })));
    }
    info!("[API] staged {} ({} bytes, sha256 {})", staged_path, file_bytes.len(), file_hash);

    let requested: Option<Vec<String>> = if vm_names_raw.is_empty() {
        None
    } else {
        Some(vm_names_raw.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
    };

    let routed = match select_vms(std::path::Path::new(&staged_path), requested.as_deref(), &state.settings) {
        Ok(r) => r,
        Err(e) => {
            let _ = tokio::fs::remove_file(&staged_path).await;
            return Ok(HttpResponse::BadRequest().json(serde_json::json!({ "error": e.to_string() })));
        }
    };
    if let Some(linux_vm) = &routed.linux_vm {
        info!("[API] sample matched Linux behavioral VM {}", linux_vm);
    }

    // Healthy VMs (fewest recorded errors) go first, so the scheduler lands
    // on a damaged machine only when nothing better is left.
    let mut vm_names = routed.vm_names;
    if requested.is_none() && !vm_names.is_empty() {
        let preferred = state.pool.available_vms(Some(&vm_names)).await;
        let rest: Vec<String> = vm_names.iter().filter(|n| !preferred.contains(*n)).cloned().collect();
        vm_names = preferred.into_iter().chain(rest).collect();
    }

    let task = AnalysisTask::new(
        file_name,
        file_hash,
        file_bytes.len() as u64,
        staged_path,
        vm_names,
        timeout,
    );

    match state.manager.submit(task).await {
        Ok(task_id) => Ok(HttpResponse::Ok().json(serde_json::json!({
            "task_id": task_id,
            "status": "pending",
            "message": "task submitted"
        }))),
        Err(SubmitError::QueueFull) => {
            warn!("[API] submission rejected: queue full");
            Ok(HttpResponse::ServiceUnavailable()
                .json(serde_json::json!({ "error": "queue_full" })))
        }
        Err(e) => Ok(HttpResponse::BadRequest().json(serde_json::json!({ "error": e.to_string() }))),
    }
}

#[get("/api/task/{id}")]
pub async fn task_status(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> impl Responder {
    if !authorized(&req, &state) {
        return unauthorized();
    }
    match state.manager.get(&path.into_inner()).await {
        Some(task) => HttpResponse::Ok().json(task),
        None => HttpResponse::NotFound().json(serde_json::json!({ "error": "task not found" })),
    }
}

#[get("/api/result/{id}")]
pub async fn task_result(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> impl Responder {
    if !authorized(&req, &state) {
        return unauthorized();
    }
    let Some(mut task) = state.manager.get(&path.into_inner()).await else {
        return HttpResponse::NotFound().json(serde_json::json!({ "error": "task not found" }));
    };
    if !task.status.is_terminal() {
        return HttpResponse::BadRequest().json(serde_json::json!({ "error": "task not finished yet" }));
    }

    // Vendor timestamps stay verbatim in storage; the local-time rewrite
    // happens here, at the serialization boundary, and nowhere else.
    for vm_result in &mut task.vm_results {
        for alert in &mut vm_result.alerts {
            if let Some(time) = &alert.detection_time {
                alert.detection_time = Some(to_local_time(time));
            }
        }
    }

    let total_alerts: usize = task.vm_results.iter().map(|r| r.alerts.len()).sum();
    let successful = task
        .vm_results
        .iter()
        .filter(|r| r.status == crate::models::VmTaskStatus::Completed)
        .count();
    let summary = serde_json::json!({
        "total_vms": task.vm_results.len(),
        "successful_vms": successful,
        "failed_vms": task.vm_results.len() - successful,
        "analysis_duration": task
            .started_at
            .zip(task.completed_at)
            .map(|(s, c)| (c - s).num_milliseconds() as f64 / 1000.0),
    });

    HttpResponse::Ok().json(serde_json::json!({
        "task_id": task.task_id,
        "status": task.status,
        "total_alerts": total_alerts,
        "vm_results": task.vm_results,
        "behavior_results": task.behavior_results,
        "summary": summary,
    }))
}

#[derive(serde::Deserialize)]
pub struct ListQuery {
    status: Option<String>,
    limit: Option<usize>,
}

#[get("/api/tasks")]
pub async fn list_tasks(
    req: HttpRequest,
    state: web::Data<AppState>,
    query: web::Query<ListQuery>,
) -> impl Responder {
    if !authorized(&req, &state) {
        return unauthorized();
    }
    let status = match &query.status {
        Some(raw) => match parse_status(raw) {
            Some(s) => Some(s),
            None => {
                return HttpResponse::BadRequest()
                    .json(serde_json::json!({ "error": format!("unknown status: {}", raw) }))
            }
        },
        None => None,
    };
    let tasks = state.manager.list(status, query.limit.unwrap_or(50)).await;
    HttpResponse::Ok().json(tasks)
}

#[delete("/api/task/{id}")]
pub async fn cancel_task(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> impl Responder {
    if !authorized(&req, &state) {
        return unauthorized();
    }
    if state.manager.cancel(&path.into_inner()).await {
        HttpResponse::Ok().json(serde_json::json!({ "message": "task cancelled" }))
    } else {
        HttpResponse::NotFound()
            .json(serde_json::json!({ "error": "task not found or already finished" }))
    }
}

#[get("/api/queue/status")]
pub async fn queue_status(req: HttpRequest, state: web::Data<AppState>) -> impl Responder {
    if !authorized(&req, &state) {
        return unauthorized();
    }
    HttpResponse::Ok().json(state.manager.queue_status().await)
}

#[get("/api/vm-pool/status")]
pub async fn pool_status(req: HttpRequest, state: web::Data<AppState>) -> impl Responder {
    if !authorized(&req, &state) {
        return unauthorized();
    }
    HttpResponse::Ok().json(state.pool.status().await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EdrVmConfig;
    use crate::engine::{AnalysisEngine, EngineTunables};
    use crate::testing::MockDriver;
    use actix_web::{test, App};

    fn state() -> web::Data<AppState> {
        let settings: Arc<Settings> =
            Arc::new(serde_yaml::from_str("server: {api_key: sekrit}\ntask_settings: {}\n").unwrap());
        let vms: Vec<EdrVmConfig> = Vec::new();
        let pool = Arc::new(VmPool::new(&vms));
        let engine = Arc::new(AnalysisEngine::new(
            Arc::new(MockDriver::new()),
            pool.clone(),
            settings.clone(),
            EngineTunables::immediate(),
        ));
        let manager = TaskManager::new(settings.clone(), engine, None);
        web::Data::new(AppState { settings, manager, pool, api_key: "sekrit".to_string() })
    }

    #[actix_web::test]
    async fn health_needs_no_auth() {
        let app = test::init_service(App::new().service(health)).await;
        let resp = test::call_service(&app, test::TestRequest::get().uri("/api/health").to_request()).await;
        assert!(resp.status().is_success());
    }

    #[actix_web::test]
    async fn endpoints_reject_missing_api_key() {
        let app = test::init_service(
            App::new().app_data(state()).service(queue_status).service(pool_status).service(list_tasks),
        )
        .await;
        for uri in ["/api/queue/status", "/api/vm-pool/status", "/api/tasks"] {
            let resp = test::call_service(&app, test::TestRequest::get().uri(uri).to_request()).await;
            assert_eq!(resp.status(), 401, "{uri} should demand a key");
        }
        let resp = test::call_service(
            &app,
            test::TestRequest::get()
                .uri("/api/queue/status")
                .insert_header(("X-API-Key", "sekrit"))
                .to_request(),
        )
        .await;
        assert!(resp.status().is_success());
    }

    #[actix_web::test]
    async fn result_of_unfinished_task_is_400() {
        let data = state();
        let task = AnalysisTask::new(
            "a.exe".into(),
            "hash".into(),
            1,
            "/tmp/none".into(),
            vec![],
            120,
        );
        let id = data.manager.submit(task).await.unwrap();
        let app = test::init_service(App::new().app_data(data).service(task_result)).await;
        let resp = test::call_service(
            &app,
            test::TestRequest::get()
                .uri(&format!("/api/result/{}", id))
                .insert_header(("X-API-Key", "sekrit"))
                .to_request(),
        )
        .await;
        assert_eq!(resp.status(), 400);
    }

    #[::core::prelude::v1::test]
    fn status_strings_parse() {
        assert_eq!(parse_status("completed"), Some(TaskStatus::Completed));
        assert_eq!(parse_status("CANCELLED"), Some(TaskStatus::Cancelled));
        assert_eq!(parse_status("bogus"), None);
    }
}
