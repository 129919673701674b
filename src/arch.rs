//! Guest architectures supported by the sandbox.
//!
//! Each architecture maps to a `qemu-system-*` binary and a fixed flag
//! profile that is filled in with the image directory, the NIC helper
//! path, and the guest MAC address. The fake-C2 guest is modelled as its
//! own pseudo-architecture so it can be driven the same way as every
//! other VM.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// An architecture tag for a sandbox or C2 guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Arch {
    Arm,
    Mips,
    Mipsel,
    M68k,
    Ppc,
    I386,
    Amd64,
    /// The fake command-and-control guest
    Cnc,
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            Arch::Arm => "ARM",
            Arch::Mips => "MIPS",
            Arch::Mipsel => "MIPSEL",
            Arch::M68k => "M68K",
            Arch::Ppc => "PPC",
            Arch::I386 => "I386",
            Arch::Amd64 => "AMD64",
            Arch::Cnc => "CNC",
        };
        f.write_str(tag)
    }
}

impl std::str::FromStr for Arch {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "ARM" => Ok(Arch::Arm),
            "MIPS" => Ok(Arch::Mips),
            "MIPSEL" => Ok(Arch::Mipsel),
            "M68K" => Ok(Arch::M68k),
            "PPC" => Ok(Arch::Ppc),
            "I386" => Ok(Arch::I386),
            "AMD64" => Ok(Arch::Amd64),
            "CNC" => Ok(Arch::Cnc),
            other => Err(Error::Config(format!("unknown architecture '{other}'"))),
        }
    }
}

impl Arch {
    /// The `qemu-system-*` executable that emulates this architecture.
    pub fn qemu_binary(&self) -> &'static str {
        match self {
            Arch::Arm => "qemu-system-arm",
            Arch::Mips => "qemu-system-mips",
            Arch::Mipsel => "qemu-system-mipsel",
            Arch::M68k => "qemu-system-m68k",
            Arch::Ppc => "qemu-system-ppc",
            Arch::I386 => "qemu-system-i386",
            Arch::Amd64 | Arch::Cnc => "qemu-system-x86_64",
        }
    }

    /// Whether snapshot/reset must be performed offline with `qemu-img`.
    ///
    /// `loadvm`/`savevm` on a live `qemu-system-mips{,el}` instance
    /// segfaults, so those guests are snapshotted against the disk image
    /// while stopped.
    pub fn needs_offline_snapshot(&self) -> bool {
        matches!(self, Arch::Mips | Arch::Mipsel)
    }

    /// Command-line arguments for invoking QEMU for this architecture.
    ///
    /// `vmdir` is the guest image directory, `helper` the qemu-bridge
    /// NIC helper path, `macaddr` the guest MAC address.
    pub fn qemu_args(&self, vmdir: &Path, helper: &str, macaddr: &str) -> Vec<String> {
        let dir = vmdir.display();
        match self {
            Arch::Arm => vec![
                "-M".into(),
                "versatilepb".into(),
                "-kernel".into(),
                format!("{dir}/kernel.img"),
                "-dtb".into(),
                format!("{dir}/versatile-pb.dtb"),
                "-drive".into(),
                format!("file={dir}/rootfs.qcow2,if=scsi,format=qcow2"),
                "-append".into(),
                "rootwait quiet root=/dev/sda console=ttyAMA0,115200".into(),
                "-nic".into(),
                format!("tap,model=rtl8139,helper={helper},mac={macaddr}"),
            ],
            Arch::Mips | Arch::Mipsel => vec![
                "-M".into(),
                "malta".into(),
                "-cpu".into(),
                "mips32r6-generic".into(),
                "-kernel".into(),
                format!("{dir}/kernel.img"),
                "-drive".into(),
                format!("file={dir}/rootfs.qcow2,format=qcow2"),
                "-append".into(),
                "rootwait quiet root=/dev/sda".into(),
                "-nic".into(),
                format!("tap,model=pcnet,helper={helper},mac={macaddr}"),
            ],
            Arch::M68k => vec![
                "-M".into(),
                "virt".into(),
                "-kernel".into(),
                format!("{dir}/kernel.img"),
                "-drive".into(),
                format!("file={dir}/rootfs.qcow2,format=qcow2"),
                "-append".into(),
                "rootwait quiet root=/dev/vda".into(),
                "-nic".into(),
                format!("tap,model=virtio-net-device,helper={helper},mac={macaddr}"),
            ],
            Arch::Ppc => vec![
                "-M".into(),
                "g3beige".into(),
                "-kernel".into(),
                format!("{dir}/kernel.img"),
                "-drive".into(),
                format!("file={dir}/rootfs.qcow2,format=qcow2"),
                "-append".into(),
                "rootwait quiet root=/dev/hda".into(),
                "-nic".into(),
                format!("tap,model=rtl8139,helper={helper},mac={macaddr}"),
            ],
            Arch::I386 | Arch::Amd64 => vec![
                "-drive".into(),
                format!("file={dir}/rootfs.qcow2,format=qcow2"),
                "-m".into(),
                "256M".into(),
                "-nic".into(),
                format!("tap,model=e1000,helper={helper},mac={macaddr}"),
            ],
            Arch::Cnc => vec![
                "-drive".into(),
                format!("file={dir}/rootfs.qcow2,format=qcow2"),
                "-enable-kvm".into(),
                "-nic".into(),
                format!("tap,model=virtio-net-pci,helper={helper},mac={macaddr}"),
                "-m".into(),
                "2G".into(),
                "-smp".into(),
                "2".into(),
            ],
        }
    }
}

// ELF identification offsets/values needed to classify a sample.
const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];
const EI_DATA: usize = 5;
const ELFDATA2LSB: u8 = 1;
const E_MACHINE_OFFSET: usize = 18;

const EM_68K: u16 = 4;
const EM_MIPS: u16 = 8;
const EM_386: u16 = 3;
const EM_ARM: u16 = 40;
const EM_PPC: u16 = 20;
const EM_X86_64: u16 = 62;

/// Determine the guest architecture to detonate on from a sample's ELF
/// header. Little-endian MIPS is reported as [`Arch::Mipsel`].
pub fn detect_elf_arch(data: &[u8]) -> Result<Arch> {
    if data.len() < E_MACHINE_OFFSET + 2 || data[..4] != ELF_MAGIC {
        return Err(Error::Config("sample is not an ELF executable".into()));
    }

    let little_endian = data[EI_DATA] == ELFDATA2LSB;
    let raw = [data[E_MACHINE_OFFSET], data[E_MACHINE_OFFSET + 1]];
    let machine = if little_endian {
        u16::from_le_bytes(raw)
    } else {
        u16::from_be_bytes(raw)
    };

    match machine {
        EM_ARM => Ok(Arch::Arm),
        EM_MIPS if little_endian => Ok(Arch::Mipsel),
        EM_MIPS => Ok(Arch::Mips),
        EM_68K => Ok(Arch::M68k),
        EM_PPC => Ok(Arch::Ppc),
        EM_386 => Ok(Arch::I386),
        EM_X86_64 => Ok(Arch::Amd64),
        other => Err(Error::Config(format!(
            "unsupported ELF machine type {other:#06x}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn elf_header(little_endian: bool, machine: u16) -> Vec<u8> {
        let mut hdr = vec![0u8; 20];
        hdr[..4].copy_from_slice(&ELF_MAGIC);
        hdr[4] = 1; // ELFCLASS32
        hdr[EI_DATA] = if little_endian { 1 } else { 2 };
        let raw = if little_endian {
            machine.to_le_bytes()
        } else {
            machine.to_be_bytes()
        };
        hdr[E_MACHINE_OFFSET..E_MACHINE_OFFSET + 2].copy_from_slice(&raw);
        hdr
    }

    #[test]
    fn detects_arm() {
        let hdr = elf_header(true, EM_ARM);
        assert_eq!(detect_elf_arch(&hdr).unwrap(), Arch::Arm);
    }

    #[test]
    fn mips_endianness_selects_variant() {
        assert_eq!(detect_elf_arch(&elf_header(false, EM_MIPS)).unwrap(), Arch::Mips);
        assert_eq!(
            detect_elf_arch(&elf_header(true, EM_MIPS)).unwrap(),
            Arch::Mipsel
        );
    }

    #[test]
    fn rejects_non_elf() {
        assert!(detect_elf_arch(b"#!/bin/sh\n").is_err());
    }

    #[test]
    fn offline_snapshot_archs() {
        assert!(Arch::Mips.needs_offline_snapshot());
        assert!(Arch::Mipsel.needs_offline_snapshot());
        assert!(!Arch::Arm.needs_offline_snapshot());
        assert!(!Arch::Cnc.needs_offline_snapshot());
    }

    #[test]
    fn arm_args_substitute_paths() {
        let args = Arch::Arm.qemu_args(
            &PathBuf::from("/vms/arm"),
            "/usr/lib/qemu-bridge-helper",
            "52:54:00:12:34:56",
        );
        assert!(args.contains(&"-M".to_string()));
        assert!(args
            .iter()
            .any(|a| a == "file=/vms/arm/rootfs.qcow2,if=scsi,format=qcow2"));
        assert!(args
            .iter()
            .any(|a| a.contains("helper=/usr/lib/qemu-bridge-helper")));
        assert!(args.iter().any(|a| a.contains("mac=52:54:00:12:34:56")));
    }

    #[test]
    fn arch_parses_from_tag() {
        assert_eq!("mipsel".parse::<Arch>().unwrap(), Arch::Mipsel);
        assert!("SPARC".parse::<Arch>().is_err());
    }
}
