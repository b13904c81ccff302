use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::Deserialize;

use crate::models::{Alert, Severity};

use super::{Collector, GuestContext};

const DETECTION_LOG: &str = "C:\\ProgramData\\McAfee\\wps\\Detection.log";

#[derive(Debug, Deserialize)]
struct DetectionEntry {
    detection_name: Option<String>,
    initiator_name: Option<String>,
    timestamp: Option<String>,
    target_name: Option<String>,
}

/// McAfee writes detections to a fixed JSON log; this collector reads it
/// back and translates the fields directly.
pub struct McafeeCollector {
    ctx: GuestContext,
}

impl McafeeCollector {
    pub fn new(ctx: GuestContext) -> Self {
        McafeeCollector { ctx }
    }

    /// The log holds either one detection object or an array of them.
    pub fn parse_detection_log(&self, raw: &str) -> Vec<Alert> {
        let entries: Vec<DetectionEntry> = match serde_json::from_str::<serde_json::Value>(raw) {
            Ok(serde_json::Value::Array(items)) => items
                .into_iter()
                .filter_map(|v| serde_json::from_value(v).ok())
                .collect(),
            Ok(value) => serde_json::from_value::<DetectionEntry>(value).map(|e| vec![e]).unwrap_or_default(),
            Err(e) => {
                warn!("[EDR:mcafee] {}: detection log is not valid JSON: {}", self.ctx.vm_name, e);
                return Vec::new();
            }
        };

        entries
            .into_iter()
            .filter_map(|entry| {
                let detection_name = entry.detection_name?;
                let mut alert = Alert::new("McAfee", Severity::Critical, detection_name);
                alert.process_name = entry.initiator_name;
                alert.detect_reason = Some("Log".to_string());
                alert.detection_time = entry.timestamp;
                alert.file_path = entry.target_name;
                Some(alert)
            })
            .collect()
    }
}

#[async_trait]
impl Collector for McafeeCollector {
    async fn get_alerts(
        &self,
        _start_time: DateTime<Utc>,
        _end_time: Option<DateTime<Utc>>,
        _file_hash: Option<&str>,
        _file_name: Option<&str>,
    ) -> Vec<Alert> {
        let read_cmd = format!("Get-Content '{}'", DETECTION_LOG);
        info!("[EDR:mcafee] {}: reading detection log", self.ctx.vm_name);

        let raw = match self
            .ctx
            .driver
            .exec_command(&self.ctx.vm_name, &read_cmd, &self.ctx.creds, self.ctx.timeouts.complex_operation)
            .await
        {
            Ok(r) if r.success && !r.output.trim().is_empty() => r.output,
            Ok(_) => {
                info!("[EDR:mcafee] {}: no detection log, nothing to report", self.ctx.vm_name);
                return Vec::new();
            }
            Err(e) => {
                warn!("[EDR:mcafee] {}: detection log read failed: {}", self.ctx.vm_name, e);
                return Vec::new();
            }
        };

        let alerts = self.parse_detection_log(&raw);
        info!("[EDR:mcafee] {}: {} alert(s)", self.ctx.vm_name, alerts.len());
        alerts
    }

    fn name(&self) -> &str {
        "mcafee"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::edr::tests_support::mock_context;

    #[test]
    fn translates_single_detection_object() {
        let c = McafeeCollector::new(mock_context());
        let raw = r#"{
            "ThreatID": "12345",
            "detection_name": "GenericRXAA-FA!ABCDEF123456",
            "initiator_name": "explorer.exe",
            "timestamp": "2025-09-27T15:02:25",
            "target_name": "C:\\Users\\vboxuser\\Desktop\\sample.exe"
        }"#;
        let alerts = c.parse_detection_log(raw);
        assert_eq!(alerts.len(), 1);
        let a = &alerts[0];
        assert_eq!(a.source, "McAfee");
        assert_eq!(a.severity, Severity::Critical);
        assert_eq!(a.alert_type, "GenericRXAA-FA!ABCDEF123456");
        assert_eq!(a.process_name.as_deref(), Some("explorer.exe"));
        assert_eq!(a.detect_reason.as_deref(), Some("Log"));
        assert_eq!(a.detection_time.as_deref(), Some("2025-09-27T15:02:25"));
        assert_eq!(a.file_path.as_deref(), Some("C:\\Users\\vboxuser\\Desktop\\sample.exe"));
    }

    #[test]
    fn translates_detection_array() {
        let c = McafeeCollector::new(mock_context());
        let raw = r#"[
            {"detection_name": "A", "target_name": "p1"},
            {"detection_name": "B", "target_name": "p2"}
        ]"#;
        let alerts = c.parse_detection_log(raw);
        assert_eq!(alerts.len(), 2);
    }

    #[test]
    fn garbage_log_yields_empty() {
        let c = McafeeCollector::new(mock_context());
        assert!(c.parse_detection_log("not json at all").is_empty());
        assert!(c.parse_detection_log("{\"no_detection_name\": true}").is_empty());
    }
}
