use async_trait::async_trait;
use chrono::{DateTime, Local, TimeZone, Utc};
use log::{info, warn};
use serde::Deserialize;

use crate::models::{Alert, Severity};

use super::{Collector, GuestContext};

const QUARANTINE_DIR: &str = "C:\\ProgramData\\Avira\\Endpoint Protection SDK\\quarantine";
const POWERSHELL_EXE: &str = "C:\\Windows\\System32\\WindowsPowerShell\\v1.0\\powershell.exe";
const DECODE_SCRIPT: &str = "C:\\get_report\\get_report_.ps1";

/// Output of the in-guest helper script that decodes a `.qua` quarantine
/// header.
#[derive(Debug, Deserialize)]
struct QuarantineRecord {
    malware: String,
    path: String,
    utc: i64,
}

/// Avira encrypts quarantined files and prefixes them with a metadata
/// header; an in-guest PowerShell helper decodes each `.qua` entry to JSON.
pub struct AviraCollector {
    ctx: GuestContext,
}

impl AviraCollector {
    pub fn new(ctx: GuestContext) -> Self {
        AviraCollector { ctx }
    }

    fn record_to_alert(&self, record: QuarantineRecord) -> Alert {
        // Quarantine paths come back in extended-length form.
        let path = record.path.strip_prefix("\\\\?\\").unwrap_or(&record.path).to_string();
        let detection_time = Local
            .timestamp_opt(record.utc, 0)
            .single()
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string());

        let mut alert = Alert::new("Avira", Severity::Info, record.malware);
        alert.file_path = Some(path);
        alert.detection_time = detection_time;
        alert
    }

    async fn list_quarantine(&self) -> Vec<String> {
        let list_cmd = format!(
            "Get-ChildItem '{}' -File -Filter '*.qua' | Select-Object -ExpandProperty Name",
            QUARANTINE_DIR
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
                warn!("[EDR:avira] {}: quarantine listing failed: {}", self.ctx.vm_name, r.output.trim());
                Vec::new()
            }
            Err(e) => {
                warn!("[EDR:avira] {}: quarantine listing failed: {}", self.ctx.vm_name, e);
                Vec::new()
            }
        }
    }
}

#[async_trait]
impl Collector for AviraCollector {
    async fn get_alerts(
        &self,
        _start_time: DateTime<Utc>,
        _end_time: Option<DateTime<Utc>>,
        _file_hash: Option<&str>,
        _file_name: Option<&str>,
    ) -> Vec<Alert> {
        let entries = self.list_quarantine().await;
        if entries.is_empty() {
            info!("[EDR:avira] {}: quarantine is empty", self.ctx.vm_name);
            return Vec::new();
        }

        let mut alerts = Vec::new();
        for entry in entries {
            if !entry.ends_with(".qua") {
                warn!("[EDR:avira] {}: skipping non-quarantine entry {}", self.ctx.vm_name, entry);
                continue;
            }
            let decode_cmd =
                format!("{} -FilePath '{}\\{}'", DECODE_SCRIPT, QUARANTINE_DIR, entry);
            match self
                .ctx
                .driver
                .exec_program(
                    &self.ctx.vm_name,
                    POWERSHELL_EXE,
                    &["-Command", &decode_cmd],
                    &self.ctx.creds,
                    self.ctx.timeouts.file_read,
                )
                .await
            {
                Ok(r) if r.success && !r.output.trim().is_empty() => {
                    match serde_json::from_str::<QuarantineRecord>(r.output.trim()) {
                        Ok(record) => alerts.push(self.record_to_alert(record)),
                        Err(e) => {
                            warn!("[EDR:avira] {}: cannot parse helper output for {}: {}", self.ctx.vm_name, entry, e)
                        }
                    }
                }
                Ok(_) => warn!("[EDR:avira] {}: helper produced no output for {}", self.ctx.vm_name, entry),
                Err(e) => warn!("[EDR:avira] {}: helper failed for {}: {}", self.ctx.vm_name, entry, e),
            }
        }

        info!("[EDR:avira] {}: {} alert(s)", self.ctx.vm_name, alerts.len());
        alerts
    }

    fn name(&self) -> &str {
        "avira"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::edr::tests_support::{mock_context, mock_context_with};
    use crate::testing::MockDriver;
    use std::sync::Arc;

    #[test]
    fn record_strips_extended_path_prefix() {
        let c = AviraCollector::new(mock_context());
        let alert = c.record_to_alert(QuarantineRecord {
            malware: "TR/Dropper.Gen".to_string(),
            path: "\\\\?\\C:\\Users\\vboxuser\\Desktop\\sample.exe".to_string(),
            utc: 1758956545,
        });
        assert_eq!(alert.source, "Avira");
        assert_eq!(alert.alert_type, "TR/Dropper.Gen");
        assert_eq!(alert.file_path.as_deref(), Some("C:\\Users\\vboxuser\\Desktop\\sample.exe"));
        let time = alert.detection_time.unwrap();
        assert_eq!(time.len(), 19);
        assert!(time.starts_with("20"));
    }

    #[tokio::test]
    async fn empty_quarantine_is_not_an_error() {
        let driver = Arc::new(MockDriver::new());
        driver.respond("Get-ChildItem", true, "");
        let c = AviraCollector::new(mock_context_with(driver));
        let alerts = c.get_alerts(Utc::now(), None, None, None).await;
        assert!(alerts.is_empty());
    }

    #[tokio::test]
    async fn quarantined_entry_is_decoded() {
        let driver = Arc::new(MockDriver::new());
        driver.respond("Get-ChildItem", true, "ABCD1234.qua\n");
        driver.respond(
            "get_report_.ps1",
            true,
            r#"{"malware": "TR/Crypt.XPACK.Gen", "path": "\\\\?\\C:\\Users\\vboxuser\\Desktop\\x.exe", "utc": 1758956545}"#,
        );
        let c = AviraCollector::new(mock_context_with(driver));
        let alerts = c.get_alerts(Utc::now(), None, None, None).await;
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].alert_type, "TR/Crypt.XPACK.Gen");
        assert_eq!(alerts[0].file_path.as_deref(), Some("C:\\Users\\vboxuser\\Desktop\\x.exe"));
    }
}
