use std::path::{Path, PathBuf};

use tracing::warn;

use crate::configuration::QemuSettings;
use crate::engine::EngineError;
use crate::model::vm_config::{ArchType, VmConfig, is_valid_vm_name};

/// Files QEMU reads or writes for one VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmPaths {
    pub disk: PathBuf,
    pub qmp_socket: PathBuf,
    pub log: PathBuf,
}

impl VmPaths {
    pub fn new(settings: &QemuSettings, name: &str) -> Result<Self, EngineError> {
        if !is_valid_vm_name(name) {
            return Err(EngineError::InvalidName(name.to_string()));
        }
        Ok(Self {
            disk: settings.runtime_dir.join(format!("{}.qcow2", name)),
            qmp_socket: settings.runtime_dir.join(format!("{}.qmp", name)),
            log: settings.log_dir.join(format!("{}.log", name)),
        })
    }
}

fn machine_and_cpu(arch: ArchType) -> (&'static str, &'static str) {
    match arch {
        ArchType::Aarch64 => ("virt,gic-version=3", "max"),
        ArchType::X86_64 => ("pc", "qemu64"),
        ArchType::I386 => ("pc", "qemu32"),
    }
}

fn accel(requested: Option<&str>, kvm_usable: bool) -> &'static str {
    match requested {
        Some(mode) if mode.eq_ignore_ascii_case("kvm") => {
            if kvm_usable {
                "kvm"
            } else {
                warn!("KVM requested but /dev/kvm is not usable, falling back to TCG");
                "tcg,thread=multi"
            }
        }
        Some(mode) if mode.eq_ignore_ascii_case("hvf") => "hvf",
        _ => "tcg,thread=multi",
    }
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// QEMU splits option strings on `,`; a literal comma is written `,,`.
fn option_value(value: &str) -> String {
    value.replace(',', ",,")
}

/// Full `qemu-system-*` argument list for `config`.
pub fn build_args(
    config: &VmConfig,
    paths: &VmPaths,
    settings: &QemuSettings,
    kvm_usable: bool,
) -> Vec<String> {
    let (machine, cpu) = machine_and_cpu(config.arch_type);
    let mut args: Vec<String> = vec![
        "-name".into(),
        config.name.clone(),
        "-machine".into(),
        machine.into(),
        "-cpu".into(),
        cpu.into(),
        "-accel".into(),
        accel(config.accel.as_deref(), kvm_usable).into(),
        "-m".into(),
        config.memory_mb.to_string(),
        "-smp".into(),
        config.cpu_count.to_string(),
    ];

    if let Some(efi) = &config.efi_firmware {
        args.push("-drive".into());
        args.push(format!(
            "if=pflash,format=raw,readonly=on,file={}",
            option_value(efi)
        ));
    }

    args.push("-drive".into());
    args.push(format!(
        "file={},if=virtio,format=qcow2",
        option_value(&path_arg(&paths.disk))
    ));

    if let Some(iso) = &config.iso_path {
        args.push("-cdrom".into());
        args.push(iso.clone());
    }

    args.push("-netdev".into());
    args.push(format!(
        "user,id=net0,hostfwd=tcp::{}-:3389,hostfwd=tcp::{}-:22",
        settings.rdp_host_port, settings.ssh_host_port
    ));
    args.push("-device".into());
    args.push("virtio-net-pci,netdev=net0".into());

    if config.nographic {
        args.push("-nographic".into());
    } else {
        if config.arch_type == ArchType::Aarch64 {
            // virt has no default graphics adapter.
            args.push("-device".into());
            args.push("virtio-gpu-pci".into());
        }
        match config.display.as_deref() {
            Some(mode) if !mode.eq_ignore_ascii_case("vnc") => {
                args.push("-display".into());
                args.push(mode.to_string());
            }
            _ => {
                args.push("-vnc".into());
                args.push(format!(":{}", settings.vnc_display));
            }
        }
    }

    args.push("-qmp".into());
    args.push(format!(
        "unix:{},server=on,wait=off",
        option_value(&path_arg(&paths.qmp_socket))
    ));
    args.push("-D".into());
    args.push(path_arg(&paths.log));

    args
}

/// `qemu-img` arguments creating the VM's disk image.
pub fn disk_create_args(paths: &VmPaths, size_gb: u32) -> Vec<String> {
    vec![
        "create".into(),
        "-f".into(),
        "qcow2".into(),
        path_arg(&paths.disk),
        format!("{}G", size_gb),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> QemuSettings {
        QemuSettings {
            binary_dir: None,
            qemu_img: None,
            runtime_dir: PathBuf::from("/run/vmorch"),
            log_dir: PathBuf::from("/var/log/vmorch"),
            rdp_host_port: 3390,
            ssh_host_port: 2222,
            vnc_display: 1,
            monitor_timeout_ms: 2000,
        }
    }

    fn config(arch: ArchType) -> VmConfig {
        VmConfig {
            name: "vm1".into(),
            arch_type: arch,
            iso_path: None,
            disk_size_gb: 8,
            memory_mb: 1024,
            cpu_count: 2,
            accel: None,
            display: None,
            nographic: false,
            efi_firmware: None,
        }
    }

    fn value_after<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
        args.iter()
            .position(|a| a == flag)
            .and_then(|i| args.get(i + 1))
            .map(String::as_str)
    }

    #[test]
    fn paths_live_under_configured_dirs() {
        let paths = VmPaths::new(&settings(), "vm1").unwrap();
        assert_eq!(paths.disk, PathBuf::from("/run/vmorch/vm1.qcow2"));
        assert_eq!(paths.qmp_socket, PathBuf::from("/run/vmorch/vm1.qmp"));
        assert_eq!(paths.log, PathBuf::from("/var/log/vmorch/vm1.log"));
    }

    #[test]
    fn paths_refuse_names_outside_the_runtime_dir() {
        for name in ["../../escaped", "a/b", "..", ""] {
            assert_eq!(
                VmPaths::new(&settings(), name),
                Err(EngineError::InvalidName(name.to_string()))
            );
        }
    }

    #[test]
    fn machine_and_cpu_follow_the_architecture() {
        let settings = settings();
        for (arch, machine, cpu) in [
            (ArchType::Aarch64, "virt,gic-version=3", "max"),
            (ArchType::X86_64, "pc", "qemu64"),
            (ArchType::I386, "pc", "qemu32"),
        ] {
            let args = build_args(&config(arch), &VmPaths::new(&settings, "vm1").unwrap(), &settings, false);
            assert_eq!(value_after(&args, "-machine"), Some(machine));
            assert_eq!(value_after(&args, "-cpu"), Some(cpu));
        }
    }

    #[test]
    fn kvm_is_used_only_when_usable() {
        let settings = settings();
        let paths = VmPaths::new(&settings, "vm1").unwrap();
        let mut config = config(ArchType::X86_64);
        config.accel = Some("kvm".into());

        let args = build_args(&config, &paths, &settings, true);
        assert_eq!(value_after(&args, "-accel"), Some("kvm"));

        let args = build_args(&config, &paths, &settings, false);
        assert_eq!(value_after(&args, "-accel"), Some("tcg,thread=multi"));

        config.accel = Some("hvf".into());
        let args = build_args(&config, &paths, &settings, false);
        assert_eq!(value_after(&args, "-accel"), Some("hvf"));
    }

    #[test]
    fn optional_media_and_monitor_wiring() {
        let settings = settings();
        let paths = VmPaths::new(&settings, "vm1").unwrap();
        let mut config = config(ArchType::X86_64);
        config.iso_path = Some("/iso/win.iso".into());
        config.efi_firmware = Some("/fw/OVMF.fd".into());

        let args = build_args(&config, &paths, &settings, false);
        assert_eq!(value_after(&args, "-cdrom"), Some("/iso/win.iso"));
        assert!(args.contains(&"if=pflash,format=raw,readonly=on,file=/fw/OVMF.fd".to_string()));
        assert!(args.contains(&"file=/run/vmorch/vm1.qcow2,if=virtio,format=qcow2".to_string()));
        assert_eq!(
            value_after(&args, "-netdev"),
            Some("user,id=net0,hostfwd=tcp::3390-:3389,hostfwd=tcp::2222-:22")
        );
        assert_eq!(
            value_after(&args, "-qmp"),
            Some("unix:/run/vmorch/vm1.qmp,server=on,wait=off")
        );
        assert_eq!(value_after(&args, "-D"), Some("/var/log/vmorch/vm1.log"));
    }

    #[test]
    fn commas_in_option_values_are_doubled() {
        let mut settings = settings();
        settings.runtime_dir = PathBuf::from("/srv/vms,fast");
        let paths = VmPaths::new(&settings, "vm1").unwrap();
        let mut config = config(ArchType::X86_64);
        config.efi_firmware = Some("/fw/OVMF,v2.fd".into());

        let args = build_args(&config, &paths, &settings, false);
        assert!(args.contains(&"if=pflash,format=raw,readonly=on,file=/fw/OVMF,,v2.fd".to_string()));
        assert!(args.contains(&"file=/srv/vms,,fast/vm1.qcow2,if=virtio,format=qcow2".to_string()));
        assert_eq!(
            value_after(&args, "-qmp"),
            Some("unix:/srv/vms,,fast/vm1.qmp,server=on,wait=off")
        );
    }

    #[test]
    fn display_selection() {
        let settings = settings();
        let paths = VmPaths::new(&settings, "vm1").unwrap();
        let mut config = config(ArchType::X86_64);

        let args = build_args(&config, &paths, &settings, false);
        assert_eq!(value_after(&args, "-vnc"), Some(":1"));

        config.display = Some("gtk".into());
        let args = build_args(&config, &paths, &settings, false);
        assert_eq!(value_after(&args, "-display"), Some("gtk"));
        assert!(value_after(&args, "-vnc").is_none());

        config.nographic = true;
        let args = build_args(&config, &paths, &settings, false);
        assert!(args.contains(&"-nographic".to_string()));
        assert!(value_after(&args, "-display").is_none());
    }

    #[test]
    fn disk_image_arguments() {
        let paths = VmPaths::new(&settings(), "vm1").unwrap();
        assert_eq!(
            disk_create_args(&paths, 16),
            vec!["create", "-f", "qcow2", "/run/vmorch/vm1.qcow2", "16G"]
        );
    }
}
