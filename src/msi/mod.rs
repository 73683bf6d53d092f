//! MSI/MSI-X passthrough remapper (component F).
//!
//! No teacher analogue exists; built from the spec's 5-step remap
//! algorithm directly atop [`crate::vtd`] and the remappable-MSI address
//! encoding in [`crate::platform`].

use crate::error::MsiError;
use crate::percpu;
use crate::platform::remappable_msi_address;
use crate::vtd::IrteTable;

/// vLAPIC mode gate the remapper consults before committing a
/// passthrough IRTE (section 4.F, section 4.I vLAPIC-mode accounting): a
/// remap started mid-mode-transition is rejected rather than racing the
/// mode switch, and a stable mode also picks which vector the IRTE
/// carries — the guest's own vector once every vCPU is in x2APIC, the
/// host-allocated vector while any vCPU is still in xAPIC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VlapicModeGate {
    Stable { x2apic: bool },
    Transitioning,
}

/// Destination addressing mode of an MSI/MSI-X descriptor's address
/// register, mirroring `vmsi_addr.dest_mode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsiDestMode {
    Physical,
    Logical,
}

/// The destination half of a guest MSI/MSI-X descriptor: `vmsi_addr`'s
/// `dest_field`/`dest_mode`, naming which of the VM's vCPUs the guest
/// addressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsiDest {
    pub dest_field: u32,
    pub mode: MsiDestMode,
}

/// Remapped MSI address/data pair to program into the device's MSI
/// capability (or MSI-X table entry).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemappedMsi {
    pub address: u64,
    pub data: u32,
}

/// Translate a guest MSI destination descriptor into the vCPU bitmap it
/// names: physical addressing selects exactly one vCPU, logical
/// addressing passes the mask through directly (section 4.F step 1).
fn vcpu_bitmap(dest: MsiDest) -> u64 {
    match dest.mode {
        MsiDestMode::Physical => 1u64 << dest.dest_field,
        MsiDestMode::Logical => dest.dest_field as u64,
    }
}

/// Resolve a guest destination descriptor to the LDR-OR destination mask
/// the IRTE is programmed with (section 4.F step 2-3): translate the
/// vCPU bitmap to the pCPUs those vCPUs are pinned to via
/// `vcpu_pcpu_bitmaps` (the VM's per-vCPU `pcpu_bitmap`, indexed by vCPU
/// id), then OR every destination pCPU's cached LDR together.
fn resolve_dest_mask(vcpu_pcpu_bitmaps: &[u64], dest: MsiDest) -> u32 {
    let vcpus = vcpu_bitmap(dest);
    let mut mask = 0u32;
    for (i, pcpu_bitmap) in vcpu_pcpu_bitmaps.iter().enumerate() {
        if vcpus & (1 << i) == 0 {
            continue;
        }
        let mut remaining = *pcpu_bitmap;
        while remaining != 0 {
            let pcpu_id = remaining.trailing_zeros() as usize;
            mask |= percpu::lapic_ldr(pcpu_id);
            remaining &= remaining - 1;
        }
    }
    mask
}

/// Establish a passthrough MSI/MSI-X remapping (section 4.F):
/// 1. reject if the vLAPIC mode is mid-transition,
/// 2. resolve the guest destination to a pCPU LDR-OR destination mask,
/// 3. compute the IRTE index from `(vm_id, virt_bdf)`,
/// 4. program the IRTE with the mode-appropriate vector targeting that
///    destination (mode-appropriate: the guest vector in `X2APIC`, the
///    host-allocated vector in `XAPIC`),
/// 5. flush the entry out of the page-walk cache (done inside `assign`),
/// 6. return the remappable-format address/data the guest's MSI-X table
///    entry should carry.
///
/// `vcpu_pcpu_bitmaps` is the owning VM's per-vCPU `pcpu_bitmap` table
/// (`crate::config::VmConfig::vcpus[..].pcpu_bitmap`, indexed by vCPU id).
pub fn msix_remap(
    table: &IrteTable,
    gate: VlapicModeGate,
    vm_id: u8,
    virt_bdf: u16,
    vcpu_pcpu_bitmaps: &[u64],
    dest: MsiDest,
    guest_vector: u8,
    host_vector: u8,
) -> Result<RemappedMsi, MsiError> {
    let x2apic = match gate {
        VlapicModeGate::Transitioning => return Err(MsiError::ModeTransition),
        VlapicModeGate::Stable { x2apic } => x2apic,
    };
    let vector = if x2apic { guest_vector } else { host_vector };
    let dest_mask = resolve_dest_mask(vcpu_pcpu_bitmaps, dest);
    let idx = table.assign(vm_id, virt_bdf, vector, dest_mask)?;
    Ok(RemappedMsi {
        address: remappable_msi_address(idx as u16),
        data: 0, // remappable format ignores the data payload's vector/mode fields
    })
}

/// Tear down a previously established remapping (section 4.F remove path).
pub fn remove_msix_remapping(table: &IrteTable, vm_id: u8, virt_bdf: u16) {
    table.free(vm_id, virt_bdf);
}

#[cfg(test)]
mod tests {
    use super::*;

    const PHYSICAL_VCPU_1: MsiDest = MsiDest { dest_field: 1, mode: MsiDestMode::Physical };

    // vCPU 1 pinned to pCPU 1, matching the safety-VM's own layout.
    const PCPU_BITMAPS: [u64; 2] = [1 << 0, 1 << 1];

    #[test]
    fn remap_happy_path_matches_scenario() {
        // Section 8 scenario 5: vm_id=2, virt_bdf=0x0100 -> irte index 0x80,
        // dest_field=1 (physical) -> dest = per_cpu(lapic_ldr, pcpu of vcpu 1).
        crate::percpu::init_identity(1, 1);
        let table = IrteTable::new();
        let remapped = msix_remap(
            &table,
            VlapicModeGate::Stable { x2apic: true },
            2,
            0x0100,
            &PCPU_BITMAPS,
            PHYSICAL_VCPU_1,
            0x40,
            0x30,
        )
        .unwrap();
        assert_eq!(remapped.address, remappable_msi_address(0x80));
        let irte = table.get(crate::vtd::irte_index(2, 0x0100));
        assert_eq!(irte.vector(), 0x40); // x2APIC-stable: guest vector
        assert!(irte.destination_mode_logical());
        assert_eq!(irte.destination(), crate::percpu::lapic_ldr(1));
    }

    #[test]
    fn xapic_mode_uses_the_host_vector() {
        let table = IrteTable::new();
        let remapped = msix_remap(
            &table,
            VlapicModeGate::Stable { x2apic: false },
            0,
            0x10,
            &PCPU_BITMAPS,
            PHYSICAL_VCPU_1,
            0x40,
            0x30,
        )
        .unwrap();
        let irte = table.get(crate::vtd::irte_index(0, 0x10));
        assert_eq!(irte.vector(), 0x30);
        let _ = remapped;
    }

    #[test]
    fn remap_rejected_during_mode_transition() {
        let table = IrteTable::new();
        let err = msix_remap(
            &table,
            VlapicModeGate::Transitioning,
            0,
            0,
            &PCPU_BITMAPS,
            PHYSICAL_VCPU_1,
            0x41,
            0x41,
        )
        .unwrap_err();
        assert_eq!(err, MsiError::ModeTransition);
    }

    #[test]
    fn remove_then_remap_reuses_slot() {
        let table = IrteTable::new();
        msix_remap(&table, VlapicModeGate::Stable { x2apic: true }, 0, 0x10, &PCPU_BITMAPS, PHYSICAL_VCPU_1, 0x41, 0x41)
            .unwrap();
        remove_msix_remapping(&table, 0, 0x10);
        let remapped = msix_remap(
            &table,
            VlapicModeGate::Stable { x2apic: true },
            0,
            0x10,
            &PCPU_BITMAPS,
            PHYSICAL_VCPU_1,
            0x50,
            0x50,
        )
        .unwrap();
        assert_eq!(remapped.address, remappable_msi_address(crate::vtd::irte_index(0, 0x10)));
    }
}
