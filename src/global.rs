//! Process-wide mutable state: the VM array and per-vCPU pending-request
//! bitmaps (section 9 "Two arenas are process-wide").
//!
//! Generalizes the teacher's `PendingCpuOn` request/take atomic pattern
//! (a `bool` flag plus payload fields, set with `Release`, taken with
//! `Acquire`) from a single PSCI CPU_ON slot to the six-bit
//! [`crate::vcpu_interrupt::PendingReq`] set, one slot per
//! `(vm_id, vcpu_id)`. The VM array itself keeps the teacher's
//! `UnsafeCell`-behind-an-init-flag shape from `GlobalDeviceManager`
//! rather than reaching for an allocator-backed container.

use crate::config::{CONFIG_MAX_VM_NUM, MAX_VCPUS_PER_VM};
use crate::vcpu_interrupt::PendingReq;
use crate::vm::Vm;
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

const SLOTS: usize = CONFIG_MAX_VM_NUM * MAX_VCPUS_PER_VM;

pub const fn vcpu_slot(vm_id: usize, vcpu_id: usize) -> usize {
    vm_id * MAX_VCPUS_PER_VM + vcpu_id
}

/// The fixed-size VM table. Each slot starts empty and is populated once
/// by `create_vm`; slots are never reallocated or moved once created.
struct VmArray(UnsafeCell<[Option<Vm>; CONFIG_MAX_VM_NUM]>);
unsafe impl Sync for VmArray {}

static VMS: VmArray = VmArray(UnsafeCell::new([const { None }; CONFIG_MAX_VM_NUM]));

/// Access VM slot `id`.
///
/// # Safety
/// Caller must hold that VM's `vm_lock` (or be the single-threaded
/// `create_vm` path populating an empty slot) before mutating through
/// the returned reference.
pub unsafe fn vm_slot(id: usize) -> *mut Option<Vm> {
    debug_assert!(id < CONFIG_MAX_VM_NUM);
    &raw mut (*VMS.0.get())[id]
}

/// Per-(vm,vcpu) pending-request bitmap (section 3.3). `request` ORs bits
/// in with `Release` ordering so whatever state the requester wrote
/// becomes visible to the `Acquire` `take`; `take` swaps the whole byte
/// out rather than clearing bit-by-bit since every requested bit is
/// always handled in the same pass.
pub struct PendingReqTable {
    slots: [AtomicU8; SLOTS],
}

impl PendingReqTable {
    const fn new() -> Self {
        Self { slots: [const { AtomicU8::new(0) }; SLOTS] }
    }

    pub fn request(&self, slot: usize, req: PendingReq) {
        self.slots[slot].fetch_or(req.bits(), Ordering::Release);
    }

    pub fn take(&self, slot: usize) -> PendingReq {
        let bits = self.slots[slot].swap(0, Ordering::Acquire);
        PendingReq::from_bits_truncate(bits)
    }

    pub fn peek(&self, slot: usize) -> PendingReq {
        PendingReq::from_bits_truncate(self.slots[slot].load(Ordering::Relaxed))
    }
}

pub static PENDING_REQS: PendingReqTable = PendingReqTable::new();

/// The vCPU slot currently executing on this pCPU thread of control.
/// Single-pCPU builds drive this from the scheduler loop; multi-pCPU
/// builds would instead derive it from the pCPU's assigned thread, but
/// the flattened index is still useful as a fast lookup key either way.
pub static CURRENT_VCPU_SLOT: AtomicUsize = AtomicUsize::new(usize::MAX);

pub fn current_vcpu_slot() -> Option<usize> {
    match CURRENT_VCPU_SLOT.load(Ordering::Relaxed) {
        usize::MAX => None,
        slot => Some(slot),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_then_take_roundtrips() {
        let table = PendingReqTable::new();
        table.request(vcpu_slot(0, 1), PendingReq::NMI | PendingReq::EXCP);
        assert_eq!(table.peek(vcpu_slot(0, 1)), PendingReq::NMI | PendingReq::EXCP);
        let taken = table.take(vcpu_slot(0, 1));
        assert_eq!(taken, PendingReq::NMI | PendingReq::EXCP);
        assert_eq!(table.peek(vcpu_slot(0, 1)), PendingReq::empty());
    }

    #[test]
    fn slots_are_independent() {
        let table = PendingReqTable::new();
        table.request(vcpu_slot(0, 0), PendingReq::INIT_VMCS);
        assert_eq!(table.peek(vcpu_slot(0, 1)), PendingReq::empty());
    }
}
