use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use log::{debug, info, warn};
use regex::Regex;

use crate::models::{Alert, Severity};

use super::{Collector, GuestContext};

const EVENT_QUERY: &str = "Get-WinEvent -FilterHashtable @{LogName='Microsoft-Windows-Windows Defender/Operational'; ID=1116,1117,1118,1119} -MaxEvents 20 | Select-Object TimeCreated, Id, LevelDisplayName, Message | Format-List";

const POWERSHELL_EXE: &str = "C:\\Windows\\System32\\WindowsPowerShell\\v1.0\\powershell.exe";

/// Detection times show up in whatever shape the guest locale produces.
const DETECTION_TIME_FORMATS: &[&str] = &[
    "%Y/%m/%d %H:%M:%S",
    "%Y-%m-%d %H:%M:%S",
    "%m/%d/%Y %H:%M:%S",
    "%Y年%m月%d日 %H:%M:%S",
    "%Y/%m/%d %H:%M",
    "%Y-%m-%d %H:%M",
];

#[derive(Debug, Default, Clone)]
pub struct ThreatRecord {
    pub threat_name: String,
    pub detection_time: Option<String>,
    pub file_path: Option<String>,
    pub process_name: Option<String>,
    pub action: Option<String>,
}

/// Ordered per-field patterns; the event log message is bilingual
/// (Chinese or English field labels depending on the guest locale) and the
/// first matching pattern wins.
struct FieldPatterns {
    name: Vec<Regex>,
    path: Vec<Regex>,
    process: Vec<Regex>,
    action: Vec<Regex>,
}

impl FieldPatterns {
    fn compile() -> Self {
        let build = |patterns: &[&str]| {
            patterns
                .iter()
                .map(|p| Regex::new(&format!("(?im){}", p)).expect("static pattern"))
                .collect()
        };
        FieldPatterns {
            name: build(&[r"名称:\s*([^\r\n]+)", r"Name:\s*([^\r\n]+)", r"ThreatName:\s*([^\r\n]+)"]),
            path: build(&[
                r"路径:\s*file:_([^\r\n]+)",
                r"Path:\s*file:_([^\r\n]+)",
                r"file:_([^\r\n;,\s]+)",
            ]),
            process: build(&[
                r"进程名称:\s*([^\r\n]+)",
                r"Process Name:\s*([^\r\n]+)",
                r"ProcessName:\s*([^\r\n]+)",
            ]),
            action: build(&[r"操作:\s*([^\r\n]+)", r"Action:\s*([^\r\n]+)"]),
        }
    }

    fn first_match(patterns: &[Regex], message: &str) -> Option<String> {
        patterns
            .iter()
            .find_map(|re| re.captures(message))
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().trim().to_string())
            .filter(|s| !s.is_empty())
    }
}

/// Reads Windows Defender detections from the operational event log
/// (IDs 1116–1119) and normalizes the Format-List output.
pub struct DefenderCollector {
    ctx: GuestContext,
    patterns: FieldPatterns,
}

impl DefenderCollector {
    pub fn new(ctx: GuestContext) -> Self {
        DefenderCollector { ctx, patterns: FieldPatterns::compile() }
    }

    /// Cheap service-status probe. A failure is only advisory; collection is
    /// attempted regardless so a wedged probe cannot hide real detections.
    async fn service_running(&self) -> Option<bool> {
        let probe = "Get-Service -Name WinDefend -ErrorAction SilentlyContinue | Select-Object -ExpandProperty Status";
        match self
            .ctx
            .driver
            .exec_command(&self.ctx.vm_name, probe, &self.ctx.creds, self.ctx.timeouts.service_status)
            .await
        {
            Ok(r) if r.success => Some(r.output.to_lowercase().contains("running")),
            _ => None,
        }
    }

    async fn query_event_log(&self) -> Option<String> {
        let result = self
            .ctx
            .driver
            .exec_program(
                &self.ctx.vm_name,
                POWERSHELL_EXE,
                &["-Command", EVENT_QUERY],
                &self.ctx.creds,
                self.ctx.timeouts.simple_command,
            )
            .await;

        let result = match result {
            Ok(r) if r.success => Ok(r),
            // Direct invocation sometimes trips over guest-control quirks;
            // the cmd.exe wrapper is the reliable second path.
            _ => {
                warn!("[EDR:defender] {}: direct PowerShell failed, retrying via cmd.exe", self.ctx.vm_name);
                self.ctx
                    .driver
                    .exec_command(&self.ctx.vm_name, EVENT_QUERY, &self.ctx.creds, self.ctx.timeouts.log_analysis)
                    .await
            }
        };

        match result {
            Ok(r) if r.success && !r.output.trim().is_empty() => Some(r.output),
            Ok(r) => {
                debug!("[EDR:defender] {}: event log query returned nothing: {}", self.ctx.vm_name, r.output.trim());
                None
            }
            Err(e) => {
                warn!("[EDR:defender] {}: event log query failed: {}", self.ctx.vm_name, e);
                None
            }
        }
    }

    /// Split Format-List output into records (blank-line separated, top-level
    /// `Key : value` lines, message continuations indented) and extract the
    /// threat fields from each message body.
    pub fn parse_event_log_output(&self, output: &str, file_name: Option<&str>) -> Vec<ThreatRecord> {
        let mut records = Vec::new();
        if output.trim().is_empty() {
            return records;
        }

        let lower = output.to_lowercase();
        let has_threat_marker = ["名称:", "name:", "threat", "trojan", "virus", "malware", "worm", "defender"]
            .iter()
            .any(|kw| lower.contains(kw));
        if !has_threat_marker {
            debug!("[EDR:defender] no threat markers in event log output");
            return records;
        }

        let mut time_created: Option<String> = None;
        let mut message_lines: Vec<String> = Vec::new();
        let mut in_message = false;

        let mut flush = |time_created: &mut Option<String>, message_lines: &mut Vec<String>, records: &mut Vec<ThreatRecord>| {
            if let Some(created) = time_created.take() {
                let message = message_lines.join("\n");
                if let Some(record) = self.extract_record(&created, &message, file_name) {
                    info!("[EDR:defender] parsed threat {} -> {:?}", record.threat_name, record.file_path);
                    records.push(record);
                }
            }
            message_lines.clear();
        };

        for line in output.lines() {
            let stripped = line.trim();
            if stripped.is_empty() {
                flush(&mut time_created, &mut message_lines, &mut records);
                in_message = false;
                continue;
            }

            let top_level = (!line.starts_with(' ') && !line.starts_with('\t'))
                .then(|| line.split_once(':'))
                .flatten();
            if let Some((key, value)) = top_level {
                let value = value.trim();
                match key.trim() {
                    "TimeCreated" => {
                        time_created = Some(value.to_string());
                        in_message = false;
                    }
                    "Id" | "LevelDisplayName" => in_message = false,
                    "Message" => {
                        message_lines = if value.is_empty() { Vec::new() } else { vec![value.to_string()] };
                        in_message = true;
                    }
                    _ => {}
                }
            } else if in_message {
                // Keep the indentation, the field regexes tolerate it.
                message_lines.push(line.to_string());
            }
        }
        flush(&mut time_created, &mut message_lines, &mut records);

        records
    }

    fn extract_record(&self, time_created: &str, message: &str, file_name: Option<&str>) -> Option<ThreatRecord> {
        let threat_name = FieldPatterns::first_match(&self.patterns.name, message);
        let file_path = FieldPatterns::first_match(&self.patterns.path, message);

        // A record is interesting when it names a threat, or when the caller
        // asked about a specific sample and the detection path mentions it.
        let keep = threat_name.is_some()
            || matches!((file_name, &file_path), (Some(f), Some(p)) if p.to_lowercase().contains(&f.to_lowercase()));
        if !keep {
            return None;
        }

        Some(ThreatRecord {
            threat_name: threat_name.unwrap_or_else(|| "Unknown".to_string()),
            detection_time: Some(time_created.to_string()),
            file_path,
            process_name: FieldPatterns::first_match(&self.patterns.process, message),
            action: FieldPatterns::first_match(&self.patterns.action, message),
        })
    }

    pub fn convert_records(
        &self,
        records: Vec<ThreatRecord>,
        start_time: DateTime<Utc>,
        end_time: Option<DateTime<Utc>>,
        file_name: Option<&str>,
    ) -> Vec<Alert> {
        let end = end_time.unwrap_or_else(Utc::now);
        let mut alerts = Vec::new();

        for record in records {
            // A record without an identified threat name never becomes an
            // alert, even when its path mentions the submitted sample.
            if record.threat_name == "Unknown" {
                continue;
            }

            if let Some(parsed) = record.detection_time.as_deref().and_then(parse_detection_time) {
                // A filename-matched detection may predate this run (the AV
                // can flag the file on upload); give it a day of slack.
                // Otherwise require the detection to sit in the analysis
                // window, with an hour of clock-skew tolerance.
                let in_window = if file_name.is_some() && record.file_path.is_some() {
                    parsed >= Utc::now() - Duration::hours(24)
                } else {
                    parsed >= start_time - Duration::hours(1) && parsed <= end
                };
                if !in_window {
                    debug!("[EDR:defender] dropping out-of-window detection at {:?}", record.detection_time);
                    continue;
                }
            }

            let mut alert = Alert::new("Windows Defender", severity_for(&record.threat_name), record.threat_name.clone());
            alert.detect_reason = Some("WinEVT".to_string());
            alert.detection_time = record.detection_time.clone();
            alert.file_path = record.file_path.clone();
            alert.process_name = record.process_name.clone();
            alerts.push(alert);
        }
        alerts
    }
}

fn severity_for(threat_name: &str) -> Severity {
    let lower = threat_name.to_lowercase();
    if ["trojan", "virus", "malware", "worm"].iter().any(|kw| lower.contains(kw)) {
        Severity::Critical
    } else if ["adware", "pup"].iter().any(|kw| lower.contains(kw)) {
        Severity::Medium
    } else {
        Severity::High
    }
}

fn parse_detection_time(raw: &str) -> Option<DateTime<Utc>> {
    // Strip trailing timezone annotations and fractional seconds before
    // trying the known locale shapes.
    let cleaned = raw.split(" (").next().unwrap_or(raw).split('.').next().unwrap_or(raw).trim();
    for fmt in DETECTION_TIME_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(cleaned, fmt) {
            return Some(DateTime::from_naive_utc_and_offset(naive, Utc));
        }
    }
    None
}

#[async_trait]
impl Collector for DefenderCollector {
    async fn get_alerts(
        &self,
        start_time: DateTime<Utc>,
        end_time: Option<DateTime<Utc>>,
        _file_hash: Option<&str>,
        file_name: Option<&str>,
    ) -> Vec<Alert> {
        info!("[EDR:defender] {}: collecting threat events", self.ctx.vm_name);

        if self.service_running().await == Some(false) {
            warn!("[EDR:defender] {}: WinDefend service not running, evidence may be stale", self.ctx.vm_name);
        }

        let Some(output) = self.query_event_log().await else {
            return Vec::new();
        };
        if !output.contains("TimeCreated") && !output.contains("Message") {
            debug!("[EDR:defender] {}: no event records in output", self.ctx.vm_name);
            return Vec::new();
        }

        let records = self.parse_event_log_output(&output, file_name);
        let alerts = self.convert_records(records, start_time, end_time, file_name);
        info!("[EDR:defender] {}: {} alert(s)", self.ctx.vm_name, alerts.len());
        alerts
    }

    fn name(&self) -> &str {
        "defender"
    }
}
