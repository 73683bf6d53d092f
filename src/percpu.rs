//! Per-pCPU state (section 3.1).
//!
//! Keeps the teacher's `UnsafeCell`-array-indexed-by-own-ID idiom from
//! `percpu.rs` ("each pCPU only touches its own slot, so no locking is
//! needed for the array itself"), with the CPU-ID source swapped from
//! `MPIDR_EL1.Aff0` to the x2APIC ID and the per-CPU payload expanded
//! from a bare vcpu-id counter to the full set section 3.1 names.

use crate::arch::x86_64::msr;
use crate::lapic::VLapic;
use crate::platform::MAX_PCPU_NUM;
use crate::scheduler::SchedControlBlock;
use core::cell::UnsafeCell;

/// Per-pCPU state. `active_vmcs_hpa` is the VMCS currently loaded via
/// VMPTRLD on this pCPU, kept here rather than recomputed so
/// `switch_vmcs` can skip a redundant reload when it is already current.
pub struct PerCpu {
    pub lapic_id: u32,
    pub ldr: u32,
    pub active_vmcs_hpa: u64,
    pub sched: SchedControlBlock,
    pub idle_thread_slot: usize,
}

impl PerCpu {
    const fn new() -> Self {
        Self {
            lapic_id: 0,
            ldr: 0,
            active_vmcs_hpa: 0,
            sched: SchedControlBlock::new(),
            idle_thread_slot: 0,
        }
    }
}

struct PerCpuArray(UnsafeCell<[PerCpu; MAX_PCPU_NUM]>);
unsafe impl Sync for PerCpuArray {}

static PER_CPU: PerCpuArray = PerCpuArray(UnsafeCell::new([const { PerCpu::new() }; MAX_PCPU_NUM]));

/// Read the current pCPU's x2APIC ID (`MSR_IA32_EXT_XAPICID`).
///
/// # Safety
/// Requires x2APIC mode already enabled in `IA32_APIC_BASE`.
#[inline(always)]
pub unsafe fn current_cpu_id() -> usize {
    msr::rdmsr(msr::MSR_IA32_EXT_XAPICID) as usize
}

/// Get a raw pointer to the current pCPU's state.
///
/// Returns a raw pointer rather than `&'static mut PerCpu` to avoid
/// manufacturing aliasing `&mut` references; callers dereference locally
/// and do not retain the pointer across a pCPU migration (there is none —
/// vCPU-to-pCPU affinity is fixed once assigned).
///
/// # Safety
/// Caller must be running on the pCPU this slot was assigned to.
#[inline]
pub unsafe fn this_cpu(cpu_id: usize) -> *mut PerCpu {
    debug_assert!(cpu_id < MAX_PCPU_NUM);
    &raw mut (*PER_CPU.0.get())[cpu_id]
}

/// Record this pCPU's identity after LAPIC/x2APIC enablement
/// (`init_pcpu_pre` -> `init_pcpu_post`, section 3.1 lifecycle).
pub fn init_identity(cpu_id: usize, lapic_id: u32) {
    let pcpu = unsafe { &mut *this_cpu(cpu_id) };
    pcpu.lapic_id = lapic_id;
    let cluster = lapic_id >> 4;
    let logical = lapic_id & 0xF;
    pcpu.ldr = (cluster << 16) | (1 << logical);
}

pub fn matches_ldr(cpu_id: usize, vlapic: &VLapic) -> bool {
    let pcpu = unsafe { &*this_cpu(cpu_id) };
    pcpu.ldr == vlapic.ldr
}

/// Read `cpu_id`'s cached LDR, for destination-mask construction
/// (`per_cpu(lapic_ldr, pcpu)`, section 4.F MSI remap). `ldr` is written
/// once at `init_identity` and never mutated again, so reading another
/// pCPU's slot here races nothing.
pub fn lapic_ldr(cpu_id: usize) -> u32 {
    unsafe { (*this_cpu(cpu_id)).ldr }
}
