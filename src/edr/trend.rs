use async_trait::async_trait;
use chrono::{DateTime, Local, TimeZone, Utc};
use log::{info, warn};
use quick_xml::events::Event;
use quick_xml::Reader;

use crate::models::{Alert, Severity};

use super::{Collector, GuestContext};

const REPORT_DIR: &str = "C:\\ProgramData\\Trend Micro\\AMSP\\report\\10009";
const POWERSHELL_EXE: &str = "C:\\Windows\\System32\\WindowsPowerShell\\v1.0\\powershell.exe";

#[derive(Debug, PartialEq)]
pub struct RcaRecord {
    pub virus_name: String,
    pub file_name: String,
    pub trigger_time: i64,
}

/// Trend Micro drops one `rca*.xml` root-cause report per detection; the
/// virus name and file name live in `Trigger/Items` `<Item name= value=>`
/// attributes and the trigger timestamp under `Summary/TriggerTime`.
pub struct TrendCollector {
    ctx: GuestContext,
}

impl TrendCollector {
    pub fn new(ctx: GuestContext) -> Self {
        TrendCollector { ctx }
    }

    async fn list_reports(&self) -> Vec<String> {
        let list_cmd = format!(
            "Get-ChildItem '{}\\' -File -Filter '*.xml' | Select-Object -ExpandProperty Name",
            REPORT_DIR
        );
        match self
            .ctx
            .driver
            .exec_program(
                &self.ctx.vm_name,
                POWERSHELL_EXE,
                &["-Command", &list_cmd],
                &self.ctx.creds,
                self.ctx.timeouts.file_list,
            )
            .await
        {
            Ok(r) if r.success => r
                .output
                .lines()
                .map(|l| l.trim().to_string())
                .filter(|l| !l.is_empty())
                .collect(),
            Ok(r) => {
                info!("[EDR:trend] {}: no report directory yet: {}", self.ctx.vm_name, r.output.trim());
                Vec::new()
            }
            Err(e) => {
                warn!("[EDR:trend] {}: report listing failed: {}", self.ctx.vm_name, e);
                Vec::new()
            }
        }
    }

    fn record_to_alert(&self, record: RcaRecord) -> Alert {
        let detection_time = Local
            .timestamp_opt(record.trigger_time, 0)
            .single()
            .map(|t| t.format("%Y-%m-%dT%H:%M:%S").to_string());

        let mut alert = Alert::new("Trend", Severity::Critical, record.virus_name);
        alert.detect_reason = Some("Log".to_string());
        alert.detection_time = detection_time;
        alert.file_path = Some(record.file_name);
        alert
    }
}

/// Pull the three well-known fields out of an rca report, preserving the
/// attribute-carried values.
pub fn parse_rca_report(xml: &str) -> Option<RcaRecord> {
    let mut reader = Reader::from_str(xml);
    let mut path: Vec<String> = Vec::new();
    let mut virus_name: Option<String> = None;
    let mut file_name: Option<String> = None;
    let mut trigger_time: Option<i64> = None;

    fn capture_item(
        path: &[String],
        e: &quick_xml::events::BytesStart<'_>,
        virus_name: &mut Option<String>,
        file_name: &mut Option<String>,
    ) {
        if !path.ends_with(&["Trigger".to_string(), "Items".to_string()]) {
            return;
        }
        let mut name = None;
        let mut value = None;
        for attr in e.attributes().flatten() {
            match attr.key.as_ref() {
                b"name" => name = attr.unescape_value().ok().map(|v| v.to_string()),
                b"value" => value = attr.unescape_value().ok().map(|v| v.to_string()),
                _ => {}
            }
        }
        match (name.as_deref(), value) {
            (Some("VirusName"), Some(v)) => *virus_name = Some(v),
            (Some("FileName"), Some(v)) => *file_name = Some(v),
            _ => {}
        }
    }

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let tag = String::from_utf8_lossy(e.name().as_ref()).to_string();
                if tag == "Item" {
                    capture_item(&path, &e, &mut virus_name, &mut file_name);
                }
                path.push(tag);
            }
            Ok(Event::Empty(e)) => {
                if e.name().as_ref() == b"Item" {
                    capture_item(&path, &e, &mut virus_name, &mut file_name);
                }
            }
            Ok(Event::Text(t)) => {
                if path.last().map(String::as_str) == Some("TriggerTime")
                    && path.iter().any(|p| p == "Summary")
                {
                    if let Ok(text) = t.unescape() {
                        trigger_time = text.trim().parse::<i64>().ok();
                    }
                }
            }
            Ok(Event::End(_)) => {
                path.pop();
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                warn!("[EDR:trend] malformed rca report: {}", e);
                return None;
            }
            _ => {}
        }
    }

    Some(RcaRecord { virus_name: virus_name?, file_name: file_name?, trigger_time: trigger_time? })
}

#[async_trait]
impl Collector for TrendCollector {
    async fn get_alerts(
        &self,
        _start_time: DateTime<Utc>,
        _end_time: Option<DateTime<Utc>>,
        _file_hash: Option<&str>,
        _file_name: Option<&str>,
    ) -> Vec<Alert> {
        let reports = self.list_reports().await;
        if reports.is_empty() {
            info!("[EDR:trend] {}: no rca reports, nothing detected", self.ctx.vm_name);
            return Vec::new();
        }

        let mut alerts = Vec::new();
        for report in reports {
            if !(report.starts_with("rca") && report.ends_with(".xml")) {
                continue;
            }
            let read_cmd = format!("Get-Content '{}\\{}'", REPORT_DIR, report);
            match self
                .ctx
                .driver
                .exec_program(
                    &self.ctx.vm_name,
                    POWERSHELL_EXE,
                    &["-Command", &read_cmd],
                    &self.ctx.creds,
                    self.ctx.timeouts.file_read,
                )
                .await
            {
                Ok(r) if r.success && !r.output.trim().is_empty() => {
                    match parse_rca_report(&r.output) {
                        Some(record) => {
                            info!(
                                "[EDR:trend] {}: {} detected {} in {}",
                                self.ctx.vm_name, report, record.virus_name, record.file_name
                            );
                            alerts.push(self.record_to_alert(record));
                        }
                        None => warn!("[EDR:trend] {}: {} has no trigger fields", self.ctx.vm_name, report),
                    }
                }
                Ok(_) => warn!("[EDR:trend] {}: reading {} produced no output", self.ctx.vm_name, report),
                Err(e) => warn!("[EDR:trend] {}: reading {} failed: {}", self.ctx.vm_name, report, e),
            }
        }

        info!("[EDR:trend] {}: {} alert(s)", self.ctx.vm_name, alerts.len());
        alerts
    }

    fn name(&self) -> &str {
        "trend"
    }
}
