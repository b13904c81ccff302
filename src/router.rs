use std::io::Read;
use std::path::Path;

use log::{info, warn};

use crate::config::Settings;
use crate::error::SubmitError;

/// ELF e_machine -> architecture tag used by the Linux fleet config.
const ELF_ARCH_MAPPING: &[(u16, &str)] = &[
    (0x3E, "x86_64"),
    (0xB7, "aarch64"),
    (0x08, "mips"),
    (0x15, "ppc64"),
    (0x28, "arm"),
];

/// Where a sample gets routed. `vm_names` feeds the Windows EDR fan-out;
/// ELF samples instead carry the matching Linux behavioral VM (when one is
/// configured) and run with an empty EDR set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutedSelection {
    pub vm_names: Vec<String>,
    pub linux_vm: Option<String>,
}

/// Pick the VM set for one submission. Deterministic: same file bytes + same
/// config produce the same selection.
pub fn select_vms(
    file_path: &Path,
    user_requested: Option<&[String]>,
    settings: &Settings,
) -> Result<RoutedSelection, SubmitError> {
    if let Some(requested) = user_requested {
        if !requested.is_empty() {
            let windows = settings.windows_vm_names();
            let linux = settings.linux_vm_names();
            let unknown: Vec<String> = requested
                .iter()
                .filter(|name| !windows.contains(*name) && !linux.contains(*name))
                .cloned()
                .collect();
            if !unknown.is_empty() {
                return Err(SubmitError::UnknownVm(unknown.join(", ")));
            }
            return Ok(RoutedSelection { vm_names: requested.to_vec(), linux_vm: None });
        }
    }

    let header = read_header(file_path);

    if header.starts_with(b"\x7fELF") {
        return Ok(route_elf(&header, settings));
    }

    // MZ, and anything we do not recognize, goes to the full Windows fleet.
    let vm_names = settings.windows_vm_names();
    info!("[ROUTER] windows path: {} EDR VM(s) selected", vm_names.len());
    Ok(RoutedSelection { vm_names, linux_vm: None })
}

fn route_elf(header: &[u8], settings: &Settings) -> RoutedSelection {
    let Some(arch) = detect_elf_architecture(header) else {
        warn!("[ROUTER] ELF sample with unrecognized machine type, no Linux VM matched");
        return RoutedSelection { vm_names: Vec::new(), linux_vm: None };
    };

    match settings.linux_vm_for_arch(arch) {
        Some(vm) => {
            info!("[ROUTER] ELF {} sample routed to Linux VM {}", arch, vm.name);
            RoutedSelection { vm_names: Vec::new(), linux_vm: Some(vm.name.clone()) }
        }
        None => {
            warn!("[ROUTER] no Linux VM configured for ELF architecture {}, task will run without EDR", arch);
            RoutedSelection { vm_names: Vec::new(), linux_vm: None }
        }
    }
}

/// Read EI_DATA at offset 5 for byte order, then e_machine at offset 18.
fn detect_elf_architecture(header: &[u8]) -> Option<&'static str> {
    if header.len() < 20 {
        return None;
    }
    let machine = match header[5] {
        1 => u16::from_le_bytes([header[18], header[19]]),
        _ => u16::from_be_bytes([header[18], header[19]]),
    };
    ELF_ARCH_MAPPING.iter().find(|(m, _)| *m == machine).map(|(_, arch)| *arch)
}

fn read_header(file_path: &Path) -> Vec<u8> {
    let mut header = vec![0u8; 64];
    match std::fs::File::open(file_path) {
        Ok(mut f) => match f.read(&mut header) {
            Ok(n) => {
                header.truncate(n);
                header
            }
            Err(e) => {
                warn!("[ROUTER] cannot read {}: {}", file_path.display(), e);
                Vec::new()
            }
        },
        Err(e) => {
            warn!("[ROUTER] cannot open {}: {}", file_path.display(), e);
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn settings() -> Settings {
        serde_yaml::from_str(
            r#"
server: {api_key: "k"}
task_settings: {}
windows:
  edr_analysis:
    vms:
      - {name: defender-vm, antivirus: defender, username: u, password: p}
      - {name: kaspersky-vm, antivirus: kaspersky, username: u, password: p}
linux:
  behavioral_analysis:
    vms:
      - {name: linux-arm64, architecture: aarch64}
"#,
        )
        .unwrap()
    }

    fn elf_header(endian: u8, machine: u16) -> Vec<u8> {
        let mut bytes = vec![0u8; 64];
        bytes[..4].copy_from_slice(b"\x7fELF");
        bytes[4] = 2;
        bytes[5] = endian;
        let m = if endian == 1 { machine.to_le_bytes() } else { machine.to_be_bytes() };
        bytes[18] = m[0];
        bytes[19] = m[1];
        bytes
    }

    fn write_sample(bytes: &[u8]) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(bytes).unwrap();
        f.flush().unwrap();
        f
    }

    #[test]
    fn elf_aarch64_routes_to_matching_linux_vm() {
        let f = write_sample(&elf_header(1, 0xB7));
        let routed = select_vms(f.path(), None, &settings()).unwrap();
        assert!(routed.vm_names.is_empty());
        assert_eq!(routed.linux_vm.as_deref(), Some("linux-arm64"));
    }

    #[test]
    fn elf_without_matching_vm_yields_empty_selection() {
        let f = write_sample(&elf_header(1, 0x3E));
        let routed = select_vms(f.path(), None, &settings()).unwrap();
        assert!(routed.vm_names.is_empty());
        assert!(routed.linux_vm.is_none());
    }

    #[test]
    fn big_endian_machine_field_is_honored() {
        // mips, EI_DATA = 2 (big endian)
        let f = write_sample(&elf_header(2, 0x08));
        let routed = select_vms(f.path(), None, &settings()).unwrap();
        assert!(routed.vm_names.is_empty());
        assert!(routed.linux_vm.is_none());
        assert_eq!(detect_elf_architecture(&elf_header(2, 0x08)), Some("mips"));
    }

    #[test]
    fn mz_routes_to_all_windows_vms() {
        let f = write_sample(b"MZ\x90\x00rest-of-pe-header");
        let routed = select_vms(f.path(), None, &settings()).unwrap();
        assert_eq!(routed.vm_names, vec!["defender-vm".to_string(), "kaspersky-vm".to_string()]);
    }

    #[test]
    fn unknown_magic_routes_to_windows_fleet() {
        let f = write_sample(b"#!/bin/sh\necho hi\n");
        let routed = select_vms(f.path(), None, &settings()).unwrap();
        assert_eq!(routed.vm_names.len(), 2);
    }

    #[test]
    fn user_request_is_validated_and_passed_through() {
        let f = write_sample(b"MZ");
        let requested = vec!["kaspersky-vm".to_string()];
        let routed = select_vms(f.path(), Some(&requested), &settings()).unwrap();
        assert_eq!(routed.vm_names, requested);

        let requested = vec!["kaspersky-vm".to_string(), "ghost-vm".to_string()];
        let err = select_vms(f.path(), Some(&requested), &settings()).unwrap_err();
        assert!(matches!(err, SubmitError::UnknownVm(ref names) if names == "ghost-vm"));
    }

    #[test]
    fn linux_vm_names_are_valid_user_requests() {
        let f = write_sample(b"MZ");
        let requested = vec!["linux-arm64".to_string()];
        let routed = select_vms(f.path(), Some(&requested), &settings()).unwrap();
        assert_eq!(routed.vm_names, requested);
    }

    #[test]
    fn selection_is_deterministic() {
        let f = write_sample(&elf_header(1, 0xB7));
        let s = settings();
        let a = select_vms(f.path(), None, &s).unwrap();
        let b = select_vms(f.path(), None, &s).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn truncated_elf_header_is_not_misrouted() {
        let f = write_sample(b"\x7fELF\x02");
        let routed = select_vms(f.path(), None, &settings()).unwrap();
        assert!(routed.vm_names.is_empty());
        assert!(routed.linux_vm.is_none());
    }
}
