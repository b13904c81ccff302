use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{info, warn};

use crate::models::{Alert, Severity};

use super::{Collector, GuestContext};

const AVP_EXE: &str = "C:\\Program Files (x86)\\Kaspersky Lab\\Kaspersky 21.15\\avp.com";

/// Marker Kaspersky prints in the status column of file-monitor report rows
/// that represent a detection.
const DETECTED_MARKER: &str = "检测到";

/// Exports the file-monitor report with `avp.com report FM /RA:<path>`,
/// reads it back, and scans the tab-separated rows for detections of the
/// submitted sample.
pub struct KasperskyCollector {
    ctx: GuestContext,
}

impl KasperskyCollector {
    pub fn new(ctx: GuestContext) -> Self {
        KasperskyCollector { ctx }
    }

    fn report_path(&self) -> String {
        format!("C:\\Users\\{}\\Desktop\\report.txt", self.ctx.creds.username)
    }

    /// Report columns (tab-separated, blanks dropped): 0 event time, 1 object
    /// path, 2 object name, 5 status, 8 threat type, 10 severity, 19 reason.
    pub fn parse_report(&self, report: &str, file_name: Option<&str>) -> Vec<Alert> {
        let mut alerts = Vec::new();

        for line in report.lines() {
            let mut parts: Vec<String> = line
                .split('\t')
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty())
                .collect();
            if parts.len() < 16 {
                parts.resize(16, String::new());
            }

            if parts[5] != DETECTED_MARKER {
                continue;
            }
            if let Some(name) = file_name {
                if parts[2] != name {
                    continue;
                }
            }

            let event_time = parts[0].replace("今天，", "");
            let severity = match parts[10].as_str() {
                "高" => Severity::High,
                "中" => Severity::Medium,
                "低" => Severity::Low,
                _ => Severity::Info,
            };
            let detect_reason = parts
                .get(19)
                .filter(|r| !r.is_empty())
                .map(|r| match r.as_str() {
                    "专家分析" => "Expert Analysis".to_string(),
                    other => other.to_string(),
                });

            let mut alert = Alert::new("Kaspersky", severity, parts[8].clone());
            alert.detection_time = Some(event_time);
            alert.file_path = Some(parts[1].clone());
            alert.detect_reason = detect_reason;
            alerts.push(alert);
        }
        alerts
    }
}

#[async_trait]
impl Collector for KasperskyCollector {
    async fn get_alerts(
        &self,
        _start_time: DateTime<Utc>,
        _end_time: Option<DateTime<Utc>>,
        _file_hash: Option<&str>,
        file_name: Option<&str>,
    ) -> Vec<Alert> {
        let probe = format!("Test-Path '{}'", AVP_EXE);
        if let Ok(r) = self
            .ctx
            .driver
            .exec_command(&self.ctx.vm_name, &probe, &self.ctx.creds, self.ctx.timeouts.availability_check)
            .await
        {
            if r.success && r.output.to_lowercase().contains("false") {
                warn!("[EDR:kaspersky] {}: avp.com not found, nothing to export", self.ctx.vm_name);
                return Vec::new();
            }
        }

        let report_path = self.report_path();
        let export_cmd = format!("& '{}' report FM /RA:{}", AVP_EXE, report_path);
        info!("[EDR:kaspersky] {}: exporting report to {}", self.ctx.vm_name, report_path);

        match self
            .ctx
            .driver
            .exec_command(&self.ctx.vm_name, &export_cmd, &self.ctx.creds, self.ctx.timeouts.report_export)
            .await
        {
            Ok(r) if !r.success => {
                warn!("[EDR:kaspersky] {}: report export failed: {}", self.ctx.vm_name, r.output.trim())
            }
            Err(e) => {
                warn!("[EDR:kaspersky] {}: report export failed: {}", self.ctx.vm_name, e);
                return Vec::new();
            }
            _ => {}
        }

        let read_cmd = format!("Get-Content {}", report_path);
        let report = match self
            .ctx
            .driver
            .exec_command(&self.ctx.vm_name, &read_cmd, &self.ctx.creds, self.ctx.timeouts.file_read)
            .await
        {
            Ok(r) if r.success && !r.output.trim().is_empty() => r.output,
            Ok(_) => {
                info!("[EDR:kaspersky] {}: empty report, no detections", self.ctx.vm_name);
                return Vec::new();
            }
            Err(e) => {
                warn!("[EDR:kaspersky] {}: reading report failed: {}", self.ctx.vm_name, e);
                return Vec::new();
            }
        };

        let alerts = self.parse_report(&report, file_name);
        info!("[EDR:kaspersky] {}: {} alert(s)", self.ctx.vm_name, alerts.len());
        alerts
    }

    fn name(&self) -> &str {
        "kaspersky"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::edr::tests_support::mock_context;

    fn report_row(time: &str, path: &str, name: &str, status: &str, threat: &str, severity: &str) -> String {
        // Columns up to 19 the way avp.com lays the FM report out; the
        // filler columns just have to be non-empty to keep their index.
        let mut cols = vec!["-"; 20];
        cols[0] = time;
        cols[1] = path;
        cols[2] = name;
        cols[5] = status;
        cols[8] = threat;
        cols[10] = severity;
        cols[19] = "专家分析";
        cols.join("\t")
    }

    #[test]
    fn detected_rows_become_alerts() {
        let c = KasperskyCollector::new(mock_context());
        let report = report_row(
            "今天，2025/9/27 15:02:25",
            "C:\\Users\\vboxuser\\Desktop\\sample.exe",
            "sample.exe",
            "检测到",
            "Trojan.Win32.Agent.gen",
            "高",
        );
        let alerts = c.parse_report(&report, Some("sample.exe"));
        assert_eq!(alerts.len(), 1);
        let a = &alerts[0];
        assert_eq!(a.source, "Kaspersky");
        assert_eq!(a.alert_type, "Trojan.Win32.Agent.gen");
        assert_eq!(a.severity, Severity::High);
        assert_eq!(a.detection_time.as_deref(), Some("2025/9/27 15:02:25"));
        assert_eq!(a.file_path.as_deref(), Some("C:\\Users\\vboxuser\\Desktop\\sample.exe"));
        assert_eq!(a.detect_reason.as_deref(), Some("Expert Analysis"));
    }

    #[test]
    fn non_detection_rows_are_skipped() {
        let c = KasperskyCollector::new(mock_context());
        let report = report_row("t", "p", "sample.exe", "已扫描", "x", "高");
        assert!(c.parse_report(&report, Some("sample.exe")).is_empty());
    }

    #[test]
    fn other_files_are_skipped_when_filename_given() {
        let c = KasperskyCollector::new(mock_context());
        let report = report_row("t", "p", "other.exe", "检测到", "x", "高");
        assert!(c.parse_report(&report, Some("sample.exe")).is_empty());
        assert_eq!(c.parse_report(&report, None).len(), 1);
    }

    #[test]
    fn short_rows_do_not_panic() {
        let c = KasperskyCollector::new(mock_context());
        assert!(c.parse_report("just\ttwo\n", None).is_empty());
        assert!(c.parse_report("", None).is_empty());
    }
}
