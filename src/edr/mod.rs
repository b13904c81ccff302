pub mod avira;
pub mod defender;
pub mod kaspersky;
pub mod mcafee;
pub mod trend;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::warn;

use crate::config::EdrTimeouts;
use crate::models::Alert;
use crate::vbox::{GuestCredentials, VmDriver};

pub use avira::AviraCollector;
pub use defender::DefenderCollector;
pub use kaspersky::KasperskyCollector;
pub use mcafee::McafeeCollector;
pub use trend::TrendCollector;

/// Everything a collector needs to interrogate its guest: the VM identity,
/// the driver, guest credentials, and the per-operation deadlines.
pub struct GuestContext {
    pub vm_name: String,
    pub driver: Arc<dyn VmDriver>,
    pub creds: GuestCredentials,
    pub timeouts: EdrTimeouts,
}

/// Vendor-specific extraction of normalized alerts from a post-execution VM.
/// Implementations tolerate empty evidence (no detections -> empty vec, not
/// an error) and preserve the vendor's own timestamp strings.
#[async_trait]
pub trait Collector: Send + Sync {
    async fn get_alerts(
        &self,
        start_time: DateTime<Utc>,
        end_time: Option<DateTime<Utc>>,
        file_hash: Option<&str>,
        file_name: Option<&str>,
    ) -> Vec<Alert>;

    /// Vendor tag, e.g. "defender".
    fn name(&self) -> &str;
}

/// Registry: antivirus tag -> concrete collector. An unknown tag never fails
/// task creation; it falls back to the Defender collector with a warning.
pub fn collector_for(
    antivirus: &str,
    vm_name: &str,
    driver: Arc<dyn VmDriver>,
    creds: GuestCredentials,
    timeouts: EdrTimeouts,
) -> Box<dyn Collector> {
    let ctx = GuestContext { vm_name: vm_name.to_string(), driver, creds, timeouts };
    match antivirus.to_lowercase().as_str() {
        "defender" => Box::new(DefenderCollector::new(ctx)),
        "kaspersky" => Box::new(KasperskyCollector::new(ctx)),
        "mcafee" => Box::new(McafeeCollector::new(ctx)),
        "avira" => Box::new(AviraCollector::new(ctx)),
        "trend" => Box::new(TrendCollector::new(ctx)),
        other => {
            warn!("[EDR] unsupported antivirus tag `{}` on {}, falling back to defender", other, vm_name);
            Box::new(DefenderCollector::new(ctx))
        }
    }
}

/// Collapse alerts sharing `(source, alert_type, file_path)` to one
/// representative: the lexicographically greatest `detection_time` wins,
/// first-seen on ties, and a timestamped alert beats one without. Pure
/// function; applied before a VmResult is sealed.
pub fn dedupe_alerts(alerts: Vec<Alert>) -> Vec<Alert> {
    let mut kept: Vec<Alert> = Vec::with_capacity(alerts.len());

    'next_alert: for alert in alerts {
        for existing in kept.iter_mut() {
            let same_key = existing.source == alert.source
                && existing.alert_type == alert.alert_type
                && existing.file_path == alert.file_path;
            if !same_key {
                continue;
            }
            let replace = match (&existing.detection_time, &alert.detection_time) {
                (Some(old), Some(new)) => new > old,
                (None, Some(_)) => true,
                _ => false,
            };
            if replace {
                *existing = alert;
            }
            continue 'next_alert;
        }
        kept.push(alert);
    }
    kept
}

#[cfg(test)]
pub(crate) mod tests_support {
    use std::sync::Arc;

    use super::GuestContext;
    use crate::config::EdrTimeouts;
    use crate::testing::{test_creds, MockDriver};

    pub fn mock_context() -> GuestContext {
        mock_context_with(Arc::new(MockDriver::new()))
    }

    pub fn mock_context_with(driver: Arc<MockDriver>) -> GuestContext {
        GuestContext {
            vm_name: "test-vm".to_string(),
            driver,
            creds: test_creds(),
            timeouts: EdrTimeouts::default(),
        }
    }
}
