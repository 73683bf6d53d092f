//! Virtual x2APIC (component D).
//!
//! No teacher analogue exists (GICv3 has no APIC-ID/LDR/ICR model); the
//! register-image-plus-back-reference shape follows the same "plain
//! struct behind a lock, no trait object" convention the teacher used
//! for its per-vCPU interrupt state (`vcpu_interrupt.rs`).

use crate::error::LapicError;
use crate::platform::{APIC_BASE_BSP, APIC_BASE_ENABLED, APIC_BASE_X2APIC, DEFAULT_APIC_BASE};
use bitflags::bitflags;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct IcrFlags: u64 {
        const DELIVERY_MODE_INIT = 0b101 << 8;
        const DELIVERY_MODE_STARTUP = 0b110 << 8;
        const DELIVERY_MODE_FIXED = 0;
        const LEVEL_ASSERT = 1 << 14;
        const DEST_SHORTHAND_ALL_EXCL_SELF = 0b11 << 18;
    }
}

/// Destination-resolution outcome for an ICR write (section 4.D).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    Physical(u32),
    Logical(u32),
    Broadcast,
    LowestPriority(u32),
}

/// A single vLAPIC register image, owned by its vCPU.
pub struct VLapic {
    pub vcpu_id: u32,
    pub id: u32,
    pub ldr: u32,
    pub icr_lo: u32,
    pub icr_hi: u32,
    pub ppr: u8,
    pub lvt_timer: u32,
    pub lvt_lint0: u32,
    pub lvt_lint1: u32,
    pub lvt_error: u32,
    pub msr_apicbase: u64,
    pub tsc_deadline: u64,
}

impl VLapic {
    /// x2APIC identity for `vcpu_id`: `id = vcpu_id`, `ldr = (cluster<<16)
    /// | (1<<logical)` with `cluster = vcpu_id>>4`, `logical = vcpu_id&0xF`
    /// (section 4.D identity).
    pub fn new(vcpu_id: u32, is_bsp: bool) -> Self {
        let cluster = vcpu_id >> 4;
        let logical = vcpu_id & 0xF;
        let ldr = (cluster << 16) | (1 << logical);
        let mut msr_apicbase = DEFAULT_APIC_BASE | APIC_BASE_ENABLED | APIC_BASE_X2APIC;
        if is_bsp {
            msr_apicbase |= APIC_BASE_BSP;
        }
        Self {
            vcpu_id,
            id: vcpu_id,
            ldr,
            icr_lo: 0,
            icr_hi: 0,
            ppr: 0,
            lvt_timer: 1 << 16, // masked
            lvt_lint0: 1 << 16,
            lvt_lint1: 1 << 16,
            lvt_error: 1 << 16,
            msr_apicbase,
            tsc_deadline: 0,
        }
    }

    pub fn cluster(&self) -> u32 {
        self.vcpu_id >> 4
    }

    pub fn logical(&self) -> u32 {
        self.vcpu_id & 0xF
    }

    /// Does this vLAPIC's LDR match the logical destination mask `dest`?
    pub fn matches_logical(&self, dest: u32) -> bool {
        let dest_cluster = dest >> 16;
        let dest_logical = dest & 0xFFFF;
        dest_cluster == self.cluster() && (dest_logical & (1 << self.logical())) != 0
    }

    /// Read the combined 64-bit ICR (`icr_hi:icr_lo`) written via
    /// `MSR_IA32_EXT_APIC_ICR` (x2APIC ICR is a single 64-bit MSR).
    pub fn icr(&self) -> u64 {
        ((self.icr_hi as u64) << 32) | self.icr_lo as u64
    }

    /// Handle a write to the ICR MSR: classify delivery mode and resolve
    /// the destination (section 4.D ICR-write handling). Returns the
    /// destination so the caller can route INIT/STARTUP/fixed delivery;
    /// direct IPIs (fixed delivery, not INIT/STARTUP) are dispatched by
    /// the caller without further emulation.
    pub fn write_icr(&mut self, value: u64) -> Result<(IcrFlags, Destination, u8), LapicError> {
        self.icr_lo = value as u32;
        self.icr_hi = (value >> 32) as u32;
        let flags = IcrFlags::from_bits_truncate(value & 0xFFFF_FFFF);
        let vector = (value & 0xFF) as u8;
        let dest_field = (value >> 32) as u32;

        let dest = if flags.contains(IcrFlags::DEST_SHORTHAND_ALL_EXCL_SELF) {
            Destination::Broadcast
        } else {
            // Destination-mode bit lives in bit 11 of the low dword.
            let logical_mode = value & (1 << 11) != 0;
            if logical_mode {
                Destination::Logical(dest_field)
            } else {
                Destination::Physical(dest_field)
            }
        };
        Ok((flags, dest, vector))
    }

    /// `IA32_APIC_BASE` write (section 4.D): update the cached value and
    /// report whether this write is the `{XAPIC}` -> `{XAPIC|X2APIC}`
    /// transition, the only one that must trigger the apicv-mode switch
    /// and the VM-wide vLAPIC-state accounting.
    pub fn write_apic_base(&mut self, value: u64) -> bool {
        let was_x2apic = self.msr_apicbase & APIC_BASE_X2APIC != 0;
        let is_x2apic = value & APIC_BASE_X2APIC != 0;
        self.msr_apicbase = value;
        !was_x2apic && is_x2apic
    }

    /// `IA32_APIC_BASE` read (section 4.D): always the cached value.
    pub fn read_apic_base(&self) -> u64 {
        self.msr_apicbase
    }

    /// x2APIC MSR-range access dispatch (section 4.D x2APIC-MSR-access):
    /// `true` if `msr` falls in the x2APIC register window this vLAPIC
    /// must intercept rather than let pass through.
    pub fn owns_msr(msr: u32) -> bool {
        (0x800..=0x8FF).contains(&msr)
    }

    /// TSC-deadline MSR virtualization: record the deadline, the caller
    /// arms the actual preemption timer against it.
    pub fn write_tsc_deadline(&mut self, value: u64) {
        self.tsc_deadline = value;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_matches_section_4d_formula() {
        let lapic = VLapic::new(0x13, false);
        assert_eq!(lapic.cluster(), 1);
        assert_eq!(lapic.logical(), 3);
        assert_eq!(lapic.ldr, (1 << 16) | (1 << 3));
    }

    #[test]
    fn logical_destination_match() {
        let lapic = VLapic::new(0x13, false);
        let dest = (1 << 16) | (1 << 3);
        assert!(lapic.matches_logical(dest));
        assert!(!lapic.matches_logical((2 << 16) | (1 << 3)));
    }

    #[test]
    fn icr_write_classifies_init() {
        let mut lapic = VLapic::new(0, true);
        let value = IcrFlags::DELIVERY_MODE_INIT.bits() | IcrFlags::LEVEL_ASSERT.bits() | (7u64 << 32);
        let (flags, dest, _vector) = lapic.write_icr(value).unwrap();
        assert!(flags.contains(IcrFlags::DELIVERY_MODE_INIT));
        assert_eq!(dest, Destination::Physical(7));
    }

    #[test]
    fn owns_x2apic_msr_range() {
        assert!(VLapic::owns_msr(0x830));
        assert!(!VLapic::owns_msr(0x1B));
    }

    #[test]
    fn apic_base_write_reports_xapic_to_x2apic_transition() {
        let mut lapic = VLapic::new(0, true);
        lapic.msr_apicbase &= !APIC_BASE_X2APIC; // start in xAPIC
        let base = lapic.msr_apicbase;
        let became_x2apic = lapic.write_apic_base(base | APIC_BASE_X2APIC);
        assert!(became_x2apic);
        assert_eq!(lapic.read_apic_base(), base | APIC_BASE_X2APIC);
    }

    #[test]
    fn apic_base_write_within_x2apic_is_not_a_transition() {
        let mut lapic = VLapic::new(0, true); // already x2APIC by default
        let base = lapic.msr_apicbase;
        assert!(!lapic.write_apic_base(base));
    }
}
