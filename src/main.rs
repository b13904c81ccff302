use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use dotenv::dotenv;
use log::{error, info};

mod config;
mod edr;
mod engine;
mod error;
mod helpers;
mod models;
mod pool;
mod router;
mod routes;
mod sysmon;
mod tasks;
#[cfg(test)]
mod testing;
mod vbox;

use config::Settings;
use engine::{AnalysisEngine, EngineTunables};
use pool::VmPool;
use routes::AppState;
use sysmon::BehavioralEngine;
use tasks::TaskManager;
use vbox::{VBoxManageDriver, VmDriver};

/// Terminal tasks older than this many days get swept.
const TASK_TTL_DAYS: i64 = 7;
const SWEEP_INTERVAL: Duration = Duration::from_secs(12 * 60 * 60);

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenv().ok();
    env_logger::init();

    let config_path = std::env::var("WARDEN_CONFIG").unwrap_or_else(|_| "config.yaml".to_string());
    let settings = match Settings::load_from_yaml(Path::new(&config_path)) {
        Ok(settings) => Arc::new(settings),
        Err(e) => {
            error!("[MAIN] {}", e);
            std::process::exit(1);
        }
    };
    let api_key = std::env::var("API_KEY").unwrap_or_else(|_| settings.server.api_key.clone());

    let vbox = &settings.virtualization.virtualbox;
    let driver: Arc<dyn VmDriver> =
        match VBoxManageDriver::new(&vbox.vboxmanage_path, &vbox.vm_startup_mode) {
            Ok(driver) => Arc::new(driver),
            Err(e) => {
                error!("[MAIN] {}", e);
                std::process::exit(1);
            }
        };

    if let Err(e) = std::fs::create_dir_all(&settings.server.upload_dir) {
        error!("[MAIN] cannot create upload dir {}: {}", settings.server.upload_dir, e);
        std::process::exit(1);
    }

    let fleet = settings
        .windows
        .edr_analysis
        .as_ref()
        .map(|c| c.vms.clone())
        .unwrap_or_default();
    if fleet.is_empty() {
        info!("[MAIN] no Windows EDR VMs configured; only behavioral analysis will run");
    }
    let pool = Arc::new(VmPool::new(&fleet));

    let engine = Arc::new(AnalysisEngine::new(
        driver.clone(),
        pool.clone(),
        settings.clone(),
        EngineTunables::default(),
    ));
    let behavioral = settings
        .windows
        .sysmon_analysis
        .as_ref()
        .filter(|c| c.enabled)
        .map(|c| {
            info!("[MAIN] behavioral branch enabled on VM {}", c.vm.name);
            Arc::new(BehavioralEngine::new(
                driver.clone(),
                c.clone(),
                settings.task_settings.cleanup_after_analysis,
                EngineTunables::default(),
            ))
        });

    let manager = TaskManager::new(settings.clone(), engine, behavioral);
    manager.start().await;

    {
        let manager = manager.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(SWEEP_INTERVAL).await;
                manager.cleanup_old(TASK_TTL_DAYS).await;
            }
        });
    }

    let state = web::Data::new(AppState {
        settings: settings.clone(),
        manager: manager.clone(),
        pool,
        api_key,
    });

    let bind = (settings.server.host.clone(), settings.server.port);
    info!("[MAIN] vbox-warden listening on {}:{}", bind.0, bind.1);

    HttpServer::new(move || {
        App::new()
            .wrap(Cors::permissive())
            .app_data(state.clone())
            .service(routes::health)
            .service(routes::analyze)
            .service(routes::task_status)
            .service(routes::task_result)
            .service(routes::list_tasks)
            .service(routes::cancel_task)
            .service(routes::queue_status)
            .service(routes::pool_status)
    })
    .bind(bind)?
    .run()
    .await?;

    manager.stop().await;
    info!("[MAIN] shut down cleanly");
    Ok(())
}
