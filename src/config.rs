use std::path::Path;

use serde::Deserialize;

/// Top-level configuration tree, loaded once at startup from `config.yaml`
/// (or the path in `WARDEN_CONFIG`). Missing file or malformed YAML is fatal.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub server: ServerConfig,
    #[serde(default)]
    pub virtualization: VirtualizationConfig,
    pub task_settings: TaskConfig,
    #[serde(default)]
    pub windows: WindowsConfig,
    #[serde(default)]
    pub linux: LinuxConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub api_key: String,
    #[serde(default = "default_upload_dir")]
    pub upload_dir: String,
    #[serde(default = "default_max_file_size")]
    pub max_file_size: usize,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct VirtualizationConfig {
    #[serde(default)]
    pub virtualbox: VirtualBoxConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VirtualBoxConfig {
    /// `auto` probes the canonical install locations.
    #[serde(default = "default_auto")]
    pub vboxmanage_path: String,
    /// `gui` or `headless`; anything else falls back to headless with a warning.
    #[serde(default = "default_startup_mode")]
    pub vm_startup_mode: String,
}

impl Default for VirtualBoxConfig {
    fn default() -> Self {
        VirtualBoxConfig {
            vboxmanage_path: default_auto(),
            vm_startup_mode: default_startup_mode(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TaskConfig {
    #[serde(default = "default_task_timeout")]
    pub default_analysis_timeout: u64,
    #[serde(default = "default_max_timeout")]
    pub max_analysis_timeout: u64,
    #[serde(default = "default_true")]
    pub cleanup_after_analysis: bool,
    #[serde(default = "default_concurrent")]
    pub concurrent_tasks: usize,
    #[serde(default = "default_queue_size")]
    pub max_queue_size: usize,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct WindowsConfig {
    pub edr_analysis: Option<EdrAnalysisConfig>,
    pub sysmon_analysis: Option<SysmonAnalysisConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EdrAnalysisConfig {
    pub vms: Vec<EdrVmConfig>,
    #[serde(default)]
    pub edr_timeouts: EdrTimeouts,
}

/// One Windows EDR analysis VM. The desktop path doubles as the sample
/// staging directory inside the guest.
#[derive(Debug, Clone, Deserialize)]
pub struct EdrVmConfig {
    pub name: String,
    pub antivirus: String,
    pub username: String,
    pub password: String,
    #[serde(default = "default_snapshot")]
    pub baseline_snapshot: String,
    pub desktop_path: Option<String>,
}

impl EdrVmConfig {
    pub fn desktop_path(&self) -> String {
        self.desktop_path
            .clone()
            .unwrap_or_else(|| format!("C:\\Users\\{}\\Desktop", self.username))
    }
}

/// Per-operation deadlines for in-guest evidence gathering. Collectors must
/// not stall the pipeline; these stay in the seconds-to-low-minutes range.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct EdrTimeouts {
    #[serde(default = "default_file_read")]
    pub file_read: u64,
    #[serde(default = "default_file_list")]
    pub file_list: u64,
    #[serde(default = "default_simple_command")]
    pub simple_command: u64,
    #[serde(default = "default_report_export")]
    pub report_export: u64,
    #[serde(default = "default_log_analysis")]
    pub log_analysis: u64,
    #[serde(default = "default_complex_operation")]
    pub complex_operation: u64,
    #[serde(default = "default_availability_check")]
    pub availability_check: u64,
    #[serde(default = "default_service_status")]
    pub service_status: u64,
}

impl Default for EdrTimeouts {
    fn default() -> Self {
        EdrTimeouts {
            file_read: default_file_read(),
            file_list: default_file_list(),
            simple_command: default_simple_command(),
            report_export: default_report_export(),
            log_analysis: default_log_analysis(),
            complex_operation: default_complex_operation(),
            availability_check: default_availability_check(),
            service_status: default_service_status(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SysmonAnalysisConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_sysmon_config")]
    pub config_type: String,
    #[serde(default)]
    pub custom_config_path: String,
    pub vm: SysmonVmConfig,
    #[serde(default)]
    pub event_collection: SysmonEventCollection,
    #[serde(default)]
    pub analysis_settings: SysmonAnalysisSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SysmonVmConfig {
    pub name: String,
    pub username: String,
    pub password: String,
    #[serde(default = "default_snapshot")]
    pub baseline_snapshot: String,
    pub desktop_path: Option<String>,
}

impl SysmonVmConfig {
    pub fn desktop_path(&self) -> String {
        self.desktop_path
            .clone()
            .unwrap_or_else(|| format!("C:\\Users\\{}\\Desktop", self.username))
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct SysmonEventCollection {
    #[serde(default = "default_max_events")]
    pub max_events: u32,
    #[serde(default = "default_collection_timeout")]
    pub collection_timeout: u64,
}

impl Default for SysmonEventCollection {
    fn default() -> Self {
        SysmonEventCollection {
            max_events: default_max_events(),
            collection_timeout: default_collection_timeout(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct SysmonAnalysisSettings {
    #[serde(default = "default_pre_delay")]
    pub pre_execution_delay: u64,
    #[serde(default = "default_post_delay")]
    pub post_execution_delay: u64,
}

impl Default for SysmonAnalysisSettings {
    fn default() -> Self {
        SysmonAnalysisSettings {
            pre_execution_delay: default_pre_delay(),
            post_execution_delay: default_post_delay(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LinuxConfig {
    pub behavioral_analysis: Option<LinuxBehavioralConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LinuxBehavioralConfig {
    #[serde(default)]
    pub vms: Vec<LinuxVmConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LinuxVmConfig {
    pub name: String,
    pub architecture: String,
}

impl Settings {
    pub fn load_from_yaml(path: &Path) -> Result<Settings, String> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| format!("cannot read config {}: {}", path.display(), e))?;
        serde_yaml::from_str(&raw)
            .map_err(|e| format!("malformed config {}: {}", path.display(), e))
    }

    /// All Windows EDR VM names, in config order.
    pub fn windows_vm_names(&self) -> Vec<String> {
        self.windows
            .edr_analysis
            .as_ref()
            .map(|c| c.vms.iter().map(|v| v.name.clone()).collect())
            .unwrap_or_default()
    }

    /// All Linux behavioral VM names.
    pub fn linux_vm_names(&self) -> Vec<String> {
        self.linux
            .behavioral_analysis
            .as_ref()
            .map(|c| c.vms.iter().map(|v| v.name.clone()).collect())
            .unwrap_or_default()
    }

    pub fn edr_vm(&self, name: &str) -> Option<&EdrVmConfig> {
        self.windows
            .edr_analysis
            .as_ref()
            .and_then(|c| c.vms.iter().find(|v| v.name == name))
    }

    pub fn edr_timeouts(&self) -> EdrTimeouts {
        self.windows
            .edr_analysis
            .as_ref()
            .map(|c| c.edr_timeouts)
            .unwrap_or_default()
    }

    /// Linux VM matching a detected ELF architecture, if one is configured.
    pub fn linux_vm_for_arch(&self, arch: &str) -> Option<&LinuxVmConfig> {
        self.linux
            .behavioral_analysis
            .as_ref()
            .and_then(|c| c.vms.iter().find(|v| v.architecture == arch))
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8000
}
fn default_upload_dir() -> String {
    "./uploads".to_string()
}
fn default_max_file_size() -> usize {
    104_857_600
}
fn default_auto() -> String {
    "auto".to_string()
}
fn default_startup_mode() -> String {
    "headless".to_string()
}
fn default_task_timeout() -> u64 {
    300
}
fn default_max_timeout() -> u64 {
    1800
}
fn default_true() -> bool {
    true
}
fn default_concurrent() -> usize {
    2
}
fn default_queue_size() -> usize {
    100
}
fn default_snapshot() -> String {
    "disable-realtime".to_string()
}
fn default_sysmon_config() -> String {
    "light".to_string()
}
fn default_file_read() -> u64 {
    30
}
fn default_file_list() -> u64 {
    30
}
fn default_simple_command() -> u64 {
    60
}
fn default_report_export() -> u64 {
    120
}
fn default_log_analysis() -> u64 {
    90
}
fn default_complex_operation() -> u64 {
    180
}
fn default_availability_check() -> u64 {
    15
}
fn default_service_status() -> u64 {
    10
}
fn default_max_events() -> u32 {
    1000
}
fn default_collection_timeout() -> u64 {
    30
}
fn default_pre_delay() -> u64 {
    5
}
fn default_post_delay() -> u64 {
    60
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
server:
  api_key: "secret"
  upload_dir: "/tmp/warden-uploads"
task_settings:
  concurrent_tasks: 3
  max_queue_size: 10
windows:
  edr_analysis:
    vms:
      - name: defender-vm
        antivirus: defender
        username: vboxuser
        password: "123456"
      - name: kaspersky-vm
        antivirus: kaspersky
        username: vboxuser
        password: "123456"
        desktop_path: "C:\\Samples"
linux:
  behavioral_analysis:
    vms:
      - name: linux-arm64
        architecture: aarch64
"#;

    #[test]
    fn parses_sample_config() {
        let settings: Settings = serde_yaml::from_str(SAMPLE).unwrap();
        assert_eq!(settings.server.port, 8000);
        assert_eq!(settings.task_settings.concurrent_tasks, 3);
        assert_eq!(settings.task_settings.max_analysis_timeout, 1800);
        assert_eq!(
            settings.windows_vm_names(),
            vec!["defender-vm".to_string(), "kaspersky-vm".to_string()]
        );
        assert_eq!(settings.linux_vm_names(), vec!["linux-arm64".to_string()]);
        assert_eq!(settings.linux_vm_for_arch("aarch64").unwrap().name, "linux-arm64");
        assert!(settings.linux_vm_for_arch("mips").is_none());
    }

    #[test]
    fn desktop_path_defaults_to_user_desktop() {
        let settings: Settings = serde_yaml::from_str(SAMPLE).unwrap();
        let vm = settings.edr_vm("defender-vm").unwrap();
        assert_eq!(vm.desktop_path(), "C:\\Users\\vboxuser\\Desktop");
        let vm = settings.edr_vm("kaspersky-vm").unwrap();
        assert_eq!(vm.desktop_path(), "C:\\Samples");
    }

    #[test]
    fn edr_timeouts_use_original_defaults() {
        let t = EdrTimeouts::default();
        assert_eq!(t.file_read, 30);
        assert_eq!(t.simple_command, 60);
        assert_eq!(t.report_export, 120);
        assert_eq!(t.service_status, 10);
    }
}
