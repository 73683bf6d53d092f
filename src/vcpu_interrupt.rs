//! Pending-request bitmap, exception queue/combining, and VM-entry
//! interruption-information construction (component E).
//!
//! No teacher analogue exists (the aarch64 original drove `HCR_EL2.VI/VF`
//! directly); the pending-request bitmap keeps the teacher's "plain
//! struct, not a lock-protected queue, single-writer per vCPU" shape from
//! `vcpu_interrupt.rs`, generalized from two flags to the six-bit request
//! set this hypervisor tracks.

use bitflags::bitflags;

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct PendingReq: u8 {
        const INIT_VMCS = 1 << 0;
        const TRP_FAULT = 1 << 1;
        const LAPIC_RESET = 1 << 2;
        const EPT_FLUSH = 1 << 3;
        const NMI = 1 << 4;
        const EXCP = 1 << 5;
    }
}

/// Exception-combining classes (Intel SDM Vol. 3A 6.15, "Double Fault").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExceptionClass {
    Benign,
    Contributory,
    PageFault,
}

fn classify(vector: u8) -> ExceptionClass {
    match vector {
        0 | 10 | 11 | 12 | 13 => ExceptionClass::Contributory, // #DE,#TS,#NP,#SS,#GP
        14 => ExceptionClass::PageFault,
        _ => ExceptionClass::Benign,
    }
}

pub const DOUBLE_FAULT_VECTOR: u8 = 8;

/// The hardware vectors that push an error code onto the IDT-delivered
/// frame, used to decide whether a queued exception carries one.
fn vector_has_error_code(vector: u8) -> bool {
    matches!(vector, 8 | 10 | 11 | 12 | 13 | 14 | 17)
}

/// A single pending (possibly combined) exception, queued until the next
/// VM-entry can inject it.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExceptionQueue {
    vector: Option<u8>,
    error_code: u32,
}

impl ExceptionQueue {
    pub const fn new() -> Self {
        Self { vector: None, error_code: 0 }
    }

    pub fn pending(&self) -> Option<(u8, u32)> {
        self.vector.map(|v| (v, self.error_code))
    }

    pub fn take(&mut self) -> Option<(u8, u32)> {
        let result = self.pending();
        self.vector = None;
        self.error_code = 0;
        result
    }

    /// Queue `vector` (with `error_code` if the caller has one), combining
    /// with any exception already queued per the #DF promotion table, and
    /// signaling a triple fault if a second non-benign exception arrives
    /// while a double fault is already queued.
    pub fn queue(&mut self, vector: u8, error_code: u32) -> Result<(), ()> {
        let new_error_code = if vector_has_error_code(vector) { error_code } else { 0 };
        match self.vector {
            None => {
                self.vector = Some(vector);
                self.error_code = new_error_code;
                Ok(())
            }
            Some(existing) if existing == DOUBLE_FAULT_VECTOR => {
                if classify(vector) != ExceptionClass::Benign {
                    Err(()) // triple fault: caller maps to HvError::TripleFault
                } else {
                    Ok(()) // benign second event is simply dropped per #DF semantics
                }
            }
            Some(existing) => {
                let promote = matches!(
                    (classify(existing), classify(vector)),
                    (ExceptionClass::Contributory, ExceptionClass::Contributory)
                        | (ExceptionClass::Contributory, ExceptionClass::PageFault)
                        | (ExceptionClass::PageFault, ExceptionClass::PageFault)
                        | (ExceptionClass::PageFault, ExceptionClass::Contributory)
                );
                if promote {
                    self.vector = Some(DOUBLE_FAULT_VECTOR);
                    self.error_code = 0;
                } else {
                    self.vector = Some(vector);
                    self.error_code = new_error_code;
                }
                Ok(())
            }
        }
    }

    pub fn inject_gp(&mut self, error_code: u32) -> Result<(), ()> {
        self.queue(13, error_code)
    }

    pub fn inject_pf(&mut self, error_code: u32, faulting_addr: u64, cr2_out: &mut u64) -> Result<(), ()> {
        *cr2_out = faulting_addr;
        self.queue(14, error_code)
    }

    pub fn inject_ud(&mut self) -> Result<(), ()> {
        self.queue(6, 0)
    }
}

/// VM-entry interruption-information field layout (bits [10:8] = type,
/// [7:0] = vector, bit 31 = valid, bit 11 = deliver-error-code).
pub fn entry_intr_info(vector: u8, intr_type: crate::vmcs::VmxInterruptionType, has_error: bool) -> u32 {
    let mut info = vector as u32;
    info |= (intr_type as u32) << 8;
    if has_error {
        info |= 1 << 11;
    }
    info |= 1 << 31; // valid
    info
}

/// Pick what to inject on the next VM-entry, in priority order: a pending
/// NMI first, then a queued exception (possibly already promoted to #DF),
/// then an external interrupt if the interrupt window is open. Only one
/// event is injected per entry; the others stay pending for the next one
/// (section 4.E injection order). Returns the entry-interruption-info word
/// together with the error code to vmwrite when bit 11 (deliver-error-code)
/// is set.
pub fn select_injection(
    pending: &mut PendingReq,
    excp: &mut ExceptionQueue,
    ext_irq: Option<u8>,
    interrupt_window_open: bool,
) -> Option<(u32, u32)> {
    if pending.contains(PendingReq::NMI) {
        pending.remove(PendingReq::NMI);
        return Some((entry_intr_info(2, crate::vmcs::VmxInterruptionType::Nmi, false), 0));
    }
    if let Some((vector, error_code)) = excp.pending() {
        let has_error = vector_has_error_code(vector);
        pending.remove(PendingReq::EXCP);
        let info = entry_intr_info(vector, crate::vmcs::VmxInterruptionType::HardException, has_error);
        return Some((info, error_code));
    }
    if interrupt_window_open {
        if let Some(vector) = ext_irq {
            return Some((entry_intr_info(vector, crate::vmcs::VmxInterruptionType::External, false), 0));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn benign_then_anything_no_combine() {
        let mut q = ExceptionQueue::new();
        q.queue(3, 0).unwrap(); // #BP, benign
        q.queue(13, 0).unwrap(); // #GP
        assert_eq!(q.pending(), Some((13, 0)));
    }

    #[test]
    fn contributory_then_contributory_promotes_df() {
        let mut q = ExceptionQueue::new();
        q.queue(13, 0).unwrap(); // #GP
        q.queue(0, 0).unwrap(); // #DE
        assert_eq!(q.pending(), Some((DOUBLE_FAULT_VECTOR, 0)));
    }

    #[test]
    fn contributory_then_pagefault_promotes_df() {
        let mut q = ExceptionQueue::new();
        q.queue(13, 0).unwrap();
        q.queue(14, 0).unwrap();
        assert_eq!(q.pending(), Some((DOUBLE_FAULT_VECTOR, 0)));
    }

    #[test]
    fn double_fault_then_non_benign_triple_faults() {
        let mut q = ExceptionQueue::new();
        q.queue(13, 0).unwrap();
        q.queue(0, 0).unwrap(); // now #DF
        assert!(q.queue(13, 0).is_err());
    }

    #[test]
    fn double_fault_then_benign_is_dropped() {
        let mut q = ExceptionQueue::new();
        q.queue(13, 0).unwrap();
        q.queue(0, 0).unwrap(); // now #DF
        q.queue(3, 0).unwrap(); // benign, dropped
        assert_eq!(q.pending(), Some((DOUBLE_FAULT_VECTOR, 0)));
    }

    #[test]
    fn nmi_takes_priority_over_exception_and_irq() {
        let mut pending = PendingReq::NMI;
        let mut excp = ExceptionQueue::new();
        excp.queue(13, 0).unwrap();
        let (info, error_code) = select_injection(&mut pending, &mut excp, Some(0x41), true).unwrap();
        assert_eq!(info & 0xFF, 2);
        assert_eq!(error_code, 0);
        assert!(!pending.contains(PendingReq::NMI));
        // the exception stays queued for the next VM-entry
        assert_eq!(excp.pending(), Some((13, 0)));
    }

    #[test]
    fn exception_carries_its_error_code_once_nmi_is_clear() {
        let mut pending = PendingReq::empty();
        let mut excp = ExceptionQueue::new();
        excp.queue(13, 0xBEEF).unwrap(); // #GP(0xBEEF)
        let (info, error_code) = select_injection(&mut pending, &mut excp, Some(0x41), true).unwrap();
        assert_eq!(info & 0xFF, 13);
        assert_ne!(info & (1 << 11), 0, "deliver-error-code bit must be set for #GP");
        assert_eq!(error_code, 0xBEEF);
        assert_eq!(excp.pending(), None);
    }

    #[test]
    fn nmi_before_external_interrupt() {
        let mut pending = PendingReq::NMI;
        let mut excp = ExceptionQueue::new();
        let (info, _) = select_injection(&mut pending, &mut excp, Some(0x41), true).unwrap();
        assert_eq!(info & 0xFF, 2);
        assert!(!pending.contains(PendingReq::NMI));
    }

    #[test]
    fn interrupt_window_closed_blocks_external_irq() {
        let mut pending = PendingReq::empty();
        let mut excp = ExceptionQueue::new();
        assert!(select_injection(&mut pending, &mut excp, Some(0x41), false).is_none());
    }
}
