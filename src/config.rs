//! Static VM configuration.
//!
//! Mirrors `vm_configs[CONFIG_MAX_VM_NUM]` (spec section 6): a const table
//! describing each statically-provisioned guest. Parsing a textual config
//! format (CLI/config file) is an external collaborator — only the typed
//! in-memory shape lives here, the way the teacher's `platform.rs` held
//! const board geometry rather than a parser.

/// Maximum number of statically-configured VMs.
pub const CONFIG_MAX_VM_NUM: usize = 4;
/// Maximum number of vCPUs any single VM may create.
pub const MAX_VCPUS_PER_VM: usize = 8;
/// Maximum number of physical CPUs this image can run on.
pub const MAX_PCPU_NUM: usize = 8;

bitflags::bitflags! {
    /// Guest flags (`vm_configs[i].guest_flags`).
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct GuestFlags: u32 {
        const SECURE_WORLD_ENABLED = 1 << 0;
        const LAPIC_PASSTHROUGH    = 1 << 1;
        const RT                   = 1 << 2;
        /// Safety VM: precondition violations on this VM are fatal to the
        /// whole hypervisor (spec section 7) rather than shutting down just the VM.
        const SAFETY_VM            = 1 << 3;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OsKind {
    BzImage,
    Zephyr,
}

#[derive(Clone, Copy, Debug)]
pub struct OsConfig {
    pub kind: OsKind,
    pub load_addr: u64,
    pub entry_addr: u64,
    pub bootargs: &'static str,
}

#[derive(Clone, Copy, Debug)]
pub struct PtDevConfig {
    /// Virtual BDF as seen by the guest.
    pub vbdf: u16,
    /// Physical BDF of the backing device.
    pub pbdf: u16,
    /// Virtual BAR base address.
    pub vbar_base: u64,
}

#[derive(Clone, Copy, Debug)]
pub struct VuartConfig {
    pub io_base: u16,
    pub irq: u8,
}

#[derive(Clone, Copy, Debug)]
pub struct VcpuConfig {
    /// Bitmap of pCPUs this vCPU may be pinned to.
    pub pcpu_bitmap: u64,
}

#[derive(Clone, Copy, Debug)]
pub struct VmConfig {
    pub name: &'static str,
    pub vcpu_count: usize,
    pub vcpus: [VcpuConfig; MAX_VCPUS_PER_VM],
    pub guest_flags: GuestFlags,
    pub mem_start_hpa: u64,
    pub mem_size: u64,
    pub pt_devs: &'static [PtDevConfig],
    pub os: OsConfig,
    pub vuarts: [Option<VuartConfig>; 2],
}

const EMPTY_VCPU: VcpuConfig = VcpuConfig { pcpu_bitmap: 0 };

/// Compile-time VM table. A deployment-specific build would generate this
/// from the (external) CLI/config parser; what ships in the core is only
/// the typed representation and its accessors.
pub static VM_CONFIGS: [VmConfig; CONFIG_MAX_VM_NUM] = [
    VmConfig {
        name: "safety-vm",
        vcpu_count: 2,
        vcpus: [
            VcpuConfig { pcpu_bitmap: 1 << 0 },
            VcpuConfig { pcpu_bitmap: 1 << 1 },
            EMPTY_VCPU, EMPTY_VCPU, EMPTY_VCPU, EMPTY_VCPU, EMPTY_VCPU, EMPTY_VCPU,
        ],
        guest_flags: GuestFlags::from_bits_truncate(
            GuestFlags::LAPIC_PASSTHROUGH.bits() | GuestFlags::SAFETY_VM.bits(),
        ),
        mem_start_hpa: 0x1_0000_0000,
        mem_size: 1024 * 1024 * 1024,
        pt_devs: &[],
        os: OsConfig {
            kind: OsKind::BzImage,
            load_addr: 0x1_0010_0000,
            entry_addr: 0x1_0010_0000,
            bootargs: "console=ttyS0",
        },
        vuarts: [Some(VuartConfig { io_base: 0x3F8, irq: 4 }), None],
    },
    VmConfig {
        name: "rt-vm",
        vcpu_count: 1,
        vcpus: [
            VcpuConfig { pcpu_bitmap: 1 << 2 },
            EMPTY_VCPU, EMPTY_VCPU, EMPTY_VCPU, EMPTY_VCPU, EMPTY_VCPU, EMPTY_VCPU, EMPTY_VCPU,
        ],
        guest_flags: GuestFlags::from_bits_truncate(
            GuestFlags::LAPIC_PASSTHROUGH.bits() | GuestFlags::RT.bits(),
        ),
        mem_start_hpa: 0x2_0000_0000,
        mem_size: 256 * 1024 * 1024,
        pt_devs: &[],
        os: OsConfig {
            kind: OsKind::Zephyr,
            load_addr: 0x2_0010_0000,
            entry_addr: 0x2_0010_0000,
            bootargs: "",
        },
        vuarts: [None, None],
    },
    VmConfig {
        name: "unused-0",
        vcpu_count: 0,
        vcpus: [EMPTY_VCPU; MAX_VCPUS_PER_VM],
        guest_flags: GuestFlags::empty(),
        mem_start_hpa: 0,
        mem_size: 0,
        pt_devs: &[],
        os: OsConfig { kind: OsKind::BzImage, load_addr: 0, entry_addr: 0, bootargs: "" },
        vuarts: [None, None],
    },
    VmConfig {
        name: "unused-1",
        vcpu_count: 0,
        vcpus: [EMPTY_VCPU; MAX_VCPUS_PER_VM],
        guest_flags: GuestFlags::empty(),
        mem_start_hpa: 0,
        mem_size: 0,
        pt_devs: &[],
        os: OsConfig { kind: OsKind::BzImage, load_addr: 0, entry_addr: 0, bootargs: "" },
        vuarts: [None, None],
    },
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safety_vm_is_flagged() {
        assert!(VM_CONFIGS[0].guest_flags.contains(GuestFlags::SAFETY_VM));
        assert!(!VM_CONFIGS[1].guest_flags.contains(GuestFlags::SAFETY_VM));
    }

    #[test]
    fn vcpu_counts_within_capacity() {
        for cfg in VM_CONFIGS.iter() {
            assert!(cfg.vcpu_count <= MAX_VCPUS_PER_VM);
        }
    }
}
