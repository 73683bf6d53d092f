//! vCPU lifecycle (component H).
//!
//! Generalized from the teacher's `Vcpu{id,state,context,virt_irq}` shape
//! in `vcpu.rs`: the aarch64 `VcpuContext`/`VirtualInterruptState` pair is
//! replaced by a VMCS + `GuestCpuContext` + `VLapic` + pending-request/
//! exception-queue group, and `run()`'s HCR_EL2 priming is replaced by
//! `vmcs::builder::init_vmcs` plus guest-state loading, but the
//! `new/state/run/stop/reset` method names and the state-machine-guard
//! style of each method carry over directly.

use crate::arch::x86_64::regs::GuestCpuContext;
use crate::arch::x86_64::vmx;
use crate::config::OsConfig;
use crate::error::HvError;
use crate::lapic::VLapic;
use crate::mm::ept::{ept_pointer, EptPool};
use crate::vcpu_interrupt::{ExceptionQueue, PendingReq};
use crate::vmcs::builder::{init_vmcs, VmcsInit};
use crate::vmcs::{fields::Field, VmcsRegion};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VcpuState {
    Offline,
    Init,
    Running,
    Paused,
    Zombie,
}

/// A guest vCPU: its VMCS, extended register context, vLAPIC, and
/// pending-interrupt bookkeeping (section 3.3).
pub struct Vcpu {
    pub id: usize,
    pub vm_id: usize,
    state: VcpuState,
    vmcs: VmcsRegion,
    launched: bool,
    context: GuestCpuContext,
    pub vlapic: VLapic,
    pub pending: PendingReq,
    pub excp: ExceptionQueue,
    pub nr_sipi: u32,
    /// STARTUP-IPI entry vector (section 4.D STARTUP handling), applied as
    /// a `GuestRip` edit the next time `INIT_VMCS` is serviced rather than
    /// a direct cross-vCPU VMCS write (the issuing vCPU may be on a
    /// different pCPU and must not touch a VMCS it hasn't VMPTRLD'd).
    pub pending_startup_rip: Option<u64>,
}

impl Vcpu {
    /// `create_vcpu` (section 4.H): allocate the VMCS region, build a
    /// fresh x2APIC identity, and leave the vCPU `Offline` until the
    /// owning VM calls `reset`.
    pub fn create(vm_id: usize, id: usize, is_bsp: bool) -> Self {
        Self {
            id,
            vm_id,
            state: VcpuState::Offline,
            vmcs: VmcsRegion::new(),
            launched: false,
            context: GuestCpuContext::new(),
            vlapic: VLapic::new(id as u32, is_bsp),
            pending: PendingReq::empty(),
            excp: ExceptionQueue::new(),
            nr_sipi: 0,
            pending_startup_rip: None,
        }
    }

    pub fn state(&self) -> VcpuState {
        self.state
    }

    pub fn context(&self) -> &GuestCpuContext {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut GuestCpuContext {
        &mut self.context
    }

    /// `reset` (section 4.H): clear and reload the VMCS, run
    /// `init_vmcs`'s control/host-state group, and point RIP/RSP/CR3 at
    /// the guest image entry described by `os`. Valid from `Offline` or
    /// `Paused`; moves to `Init`.
    pub fn reset(
        &mut self,
        os: &OsConfig,
        ept: &EptPool,
        io_bitmap_a_hpa: u64,
        io_bitmap_b_hpa: u64,
        msr_bitmap_hpa: u64,
        vmexit_stub: u64,
        host_rsp: u64,
    ) -> Result<(), HvError> {
        if !matches!(self.state, VcpuState::Offline | VcpuState::Paused) {
            return Err(HvError::Precondition("reset from invalid vcpu state"));
        }
        self.vmcs.stamp_revision();
        match unsafe { vmx::vmclear(self.vmcs.hpa()) } {
            vmx::VmxResult::Ok => {}
            _ => return Err(HvError::Precondition("vmclear failed")),
        }
        match unsafe { vmx::vmptrld(self.vmcs.hpa()) } {
            vmx::VmxResult::Ok => {}
            _ => return Err(HvError::Precondition("vmptrld failed")),
        }

        init_vmcs(&VmcsInit {
            eptp: ept_pointer(ept),
            io_bitmap_a_hpa,
            io_bitmap_b_hpa,
            msr_bitmap_hpa,
            vpid: (self.id + 1) as u16,
            vmexit_stub,
            host_rsp,
        })?;

        load_guest_reset_state(os)?;

        self.context = GuestCpuContext::new();
        self.launched = false;
        self.pending = PendingReq::empty();
        self.excp = ExceptionQueue::new();
        self.nr_sipi = 0;
        self.pending_startup_rip = None;
        self.state = VcpuState::Init;
        Ok(())
    }

    /// `launch` (section 4.H): VMLAUNCH on the first entry, VMRESUME on
    /// every later one. Only returns on a VM-exit (or a VMX instruction
    /// failure); the caller re-enters the scheduler loop on return.
    /// Valid from `Init`, `Paused` (after a reschedule), or `Running`
    /// (re-entry after handling a VM-exit); moves to `Running`.
    pub fn launch(&mut self) -> Result<(), HvError> {
        if matches!(self.state, VcpuState::Offline | VcpuState::Zombie) {
            return Err(HvError::Precondition("launch from invalid vcpu state"));
        }
        self.state = VcpuState::Running;
        let result = if self.launched {
            unsafe { vmx::vmresume() }
        } else {
            self.launched = true;
            unsafe { vmx::vmlaunch() }
        };
        match result {
            vmx::VmxResult::Ok => Ok(()),
            _ => {
                let err = unsafe { vmx::vm_instruction_error() };
                self.launched = false;
                Err(HvError::Precondition(err.as_str()))
            }
        }
    }

    /// `pause` (section 4.H): requests a reschedule of this vCPU's thread
    /// and transitions it to `new_state`, which must be `Paused` (resumable
    /// by a later `launch`) or `Zombie` (terminal, used when the owning VM
    /// is shutting down). Valid from `Running` or `Init`.
    pub fn pause(&mut self, new_state: VcpuState) -> Result<(), HvError> {
        if !matches!(self.state, VcpuState::Running | VcpuState::Init) {
            return Err(HvError::Precondition("pause from invalid vcpu state"));
        }
        if !matches!(new_state, VcpuState::Paused | VcpuState::Zombie) {
            return Err(HvError::Precondition("pause target must be Paused or Zombie"));
        }
        self.state = new_state;
        Ok(())
    }

    /// `offline` (section 4.H): tear the vCPU down to `Offline` so its
    /// slot can be reused by a later `reset`, or `Zombie` if it can never
    /// run again (the owning VM is shutting down).
    pub fn offline(&mut self, permanent: bool) -> Result<(), HvError> {
        if matches!(self.state, VcpuState::Zombie) {
            return Ok(());
        }
        let _ = unsafe { vmx::vmclear(self.vmcs.hpa()) };
        self.launched = false;
        self.state = if permanent { VcpuState::Zombie } else { VcpuState::Offline };
        Ok(())
    }

    pub fn record_sipi(&mut self) {
        self.nr_sipi += 1;
    }

    /// `IA32_APIC_BASE` write (section 4.D): update the cached vLAPIC
    /// value and, on the `{XAPIC}` -> `{XAPIC|X2APIC}` transition, run
    /// the apicv-mode switch against the VMCS currently VMPTRLD'd for
    /// this vCPU and flip this vCPU's scheduler thread to INIT-IPI
    /// reschedule kicks. `pcpu_id` is the pCPU this vCPU is pinned to
    /// (the caller already knows it from the VM's static config).
    /// VM-wide vLAPIC-mode accounting is the caller's job (it needs
    /// `vm_lock`, which this method does not take).
    pub fn write_apic_base(&mut self, value: u64, pcpu_id: usize) -> Result<(), HvError> {
        if self.vlapic.write_apic_base(value) {
            crate::vmcs::builder::apicv_mode_switch_to_x2apic()?;
            let slot = crate::global::vcpu_slot(self.vm_id, self.id);
            unsafe {
                (*crate::percpu::this_cpu(pcpu_id)).sched.set_notify_mode(slot, crate::scheduler::NotifyMode::InitIpi);
            }
        }
        Ok(())
    }

    /// `queue_exception` (section 4.E): validate, classify-and-combine into
    /// `excp`, and request the matching pending-request bit. A triple fault
    /// (combining Err from the queue itself) requests `TRP_FAULT` instead
    /// of `EXCP` and is surfaced to the caller so it can stop driving this
    /// vCPU forward; `enter` turns the pending bit into the actual
    /// shutdown on the next VM-entry attempt.
    pub fn queue_exception(&mut self, vector: u8, error_code: u32) -> Result<(), HvError> {
        if vector >= 32 {
            return Err(HvError::Precondition("exception vector out of range"));
        }
        match self.excp.queue(vector, error_code) {
            Ok(()) => {
                self.pending.insert(PendingReq::EXCP);
                Ok(())
            }
            Err(()) => {
                self.pending.insert(PendingReq::TRP_FAULT);
                Err(HvError::TripleFault(self.id))
            }
        }
    }

    pub fn inject_gp(&mut self, error_code: u32) -> Result<(), HvError> {
        self.queue_exception(13, error_code)
    }

    pub fn inject_pf(&mut self, error_code: u32, faulting_addr: u64) -> Result<(), HvError> {
        self.context.cr2 = faulting_addr;
        self.queue_exception(14, error_code)
    }

    pub fn inject_ud(&mut self) -> Result<(), HvError> {
        self.queue_exception(6, 0)
    }

    pub fn vmcs_hpa(&self) -> u64 {
        self.vmcs.hpa()
    }

    /// `acrn_handle_pending_request` followed by `launch` (section 4.E
    /// injection order, section 4.H launch): service `pending_req` in
    /// priority order, inject at most one event into the entry-interruption
    /// field, then enter VMX non-root. The VMCS for this vCPU must already
    /// be the one VMPTRLD'd on the current pCPU.
    pub fn enter(
        &mut self,
        ept: &EptPool,
        io_bitmap_a_hpa: u64,
        io_bitmap_b_hpa: u64,
        msr_bitmap_hpa: u64,
        vmexit_stub: u64,
        host_rsp: u64,
        ext_irq: Option<u8>,
        interrupt_window_open: bool,
    ) -> Result<(), HvError> {
        if self.pending.contains(PendingReq::INIT_VMCS) {
            self.pending.remove(PendingReq::INIT_VMCS);
            if let Some(rip) = self.pending_startup_rip.take() {
                // STARTUP-IPI path (section 4.D): only the entry vector
                // changed, the control/host-state group is still valid.
                vmwrite(Field::GuestRip, rip)?;
                self.state = VcpuState::Init;
            } else {
                init_vmcs(&VmcsInit {
                    eptp: ept_pointer(ept),
                    io_bitmap_a_hpa,
                    io_bitmap_b_hpa,
                    msr_bitmap_hpa,
                    vpid: (self.id + 1) as u16,
                    vmexit_stub,
                    host_rsp,
                })?;
            }
        }
        if self.pending.contains(PendingReq::TRP_FAULT) {
            self.pending.remove(PendingReq::TRP_FAULT);
            self.state = VcpuState::Zombie;
            return Err(HvError::TripleFault(self.id));
        }
        if self.pending.contains(PendingReq::LAPIC_RESET) {
            self.pending.remove(PendingReq::LAPIC_RESET);
            let is_bsp = self.vlapic.msr_apicbase & crate::platform::APIC_BASE_BSP != 0;
            self.vlapic = VLapic::new(self.id as u32, is_bsp);
        }
        if self.pending.contains(PendingReq::EPT_FLUSH) {
            self.pending.remove(PendingReq::EPT_FLUSH);
            unsafe { vmx::invept_single_context(ept_pointer(ept)) };
        }
        if let Some((info, error_code)) = crate::vcpu_interrupt::select_injection(
            &mut self.pending,
            &mut self.excp,
            ext_irq,
            interrupt_window_open,
        ) {
            vmwrite(Field::VmEntryIntrInfoField, info as u64)?;
            if info & (1 << 11) != 0 {
                vmwrite(Field::VmEntryExceptionErrorCode, error_code as u64)?;
            }
        }
        self.launch()
    }
}

fn vmwrite(field: Field, value: u64) -> Result<(), HvError> {
    match unsafe { vmx::vmwrite(field as u32, value) } {
        vmx::VmxResult::Ok => Ok(()),
        _ => Err(HvError::Precondition("vmwrite failed during guest reset")),
    }
}

/// Load the guest-state group of a freshly reset VMCS (unrestricted-guest
/// real-address-mode-like start state with CR0.PE=1 so the OS image's
/// protected-mode entry point runs immediately, matching a direct-boot
/// loader rather than emulating real-mode BIOS handoff).
fn load_guest_reset_state(os: &OsConfig) -> Result<(), HvError> {
    const CR0_PE: u64 = 1 << 0;
    const CR0_NE: u64 = 1 << 5;
    const CR4_VMXE: u64 = 1 << 13;
    const CODE_SEGMENT_AR: u64 = 0xA09B; // present, DPL0, code, exec/read, accessed, 32-bit
    const DATA_SEGMENT_AR: u64 = 0xC093; // present, DPL0, data, read/write, accessed

    vmwrite(Field::GuestCr0, CR0_PE | CR0_NE)?;
    vmwrite(Field::GuestCr3, 0)?;
    vmwrite(Field::GuestCr4, CR4_VMXE)?;
    vmwrite(Field::GuestRip, os.entry_addr)?;
    vmwrite(Field::GuestRsp, 0)?;
    vmwrite(Field::GuestRflags, 1 << 1)?; // reserved bit 1 always set

    vmwrite(Field::GuestCsSelector, 0)?;
    vmwrite(Field::GuestCsBase, 0)?;
    vmwrite(Field::GuestCsAccessRights, CODE_SEGMENT_AR)?;
    for sel in [
        Field::GuestSsSelector,
        Field::GuestDsSelector,
        Field::GuestEsSelector,
        Field::GuestFsSelector,
        Field::GuestGsSelector,
    ] {
        vmwrite(sel, 0)?;
    }
    for base in [
        Field::GuestSsBase,
        Field::GuestDsBase,
        Field::GuestEsBase,
        Field::GuestFsBase,
        Field::GuestGsBase,
    ] {
        vmwrite(base, 0)?;
    }
    for ar in [
        Field::GuestSsAccessRights,
        Field::GuestDsAccessRights,
        Field::GuestEsAccessRights,
        Field::GuestFsAccessRights,
        Field::GuestGsAccessRights,
    ] {
        vmwrite(ar, DATA_SEGMENT_AR)?;
    }

    vmwrite(Field::GuestLdtrAccessRights, 1 << 16)?; // unusable
    vmwrite(Field::GuestInterruptibilityInfo, 0)?;
    vmwrite(Field::GuestActivityState, 0)?; // active

    let _ = os; // load_addr/bootargs consumed by the (external) guest-image loader
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_starts_offline() {
        let vcpu = Vcpu::create(0, 0, true);
        assert_eq!(vcpu.state(), VcpuState::Offline);
        assert_eq!(vcpu.nr_sipi, 0);
    }

    #[test]
    fn pause_rejected_from_offline() {
        let mut vcpu = Vcpu::create(0, 0, true);
        assert!(vcpu.pause(VcpuState::Paused).is_err());
    }

    #[test]
    fn queue_exception_rejects_out_of_range_vector() {
        let mut vcpu = Vcpu::create(0, 0, true);
        assert!(vcpu.queue_exception(32, 0).is_err());
        assert!(vcpu.pending.is_empty());
    }

    #[test]
    fn queue_exception_sets_excp_pending() {
        let mut vcpu = Vcpu::create(0, 0, true);
        vcpu.inject_gp(0).unwrap();
        assert!(vcpu.pending.contains(PendingReq::EXCP));
        assert_eq!(vcpu.excp.pending(), Some((13, 0)));
    }

    #[test]
    fn inject_pf_sets_cr2() {
        let mut vcpu = Vcpu::create(0, 0, true);
        vcpu.inject_pf(0, 0xDEAD_BEEF).unwrap();
        assert_eq!(vcpu.context().cr2, 0xDEAD_BEEF);
    }

    #[test]
    fn double_fault_then_gp_requests_triple_fault() {
        let mut vcpu = Vcpu::create(0, 0, true);
        vcpu.inject_gp(0).unwrap();
        vcpu.queue_exception(0, 0).unwrap(); // #DE combines with #GP into #DF
        assert_eq!(vcpu.excp.pending(), Some((crate::vcpu_interrupt::DOUBLE_FAULT_VECTOR, 0)));
        let err = vcpu.inject_gp(0).unwrap_err();
        assert_eq!(err, HvError::TripleFault(0));
        assert!(vcpu.pending.contains(PendingReq::TRP_FAULT));
    }

    #[test]
    fn record_sipi_increments_counter() {
        let mut vcpu = Vcpu::create(0, 1, false);
        vcpu.record_sipi();
        vcpu.record_sipi();
        assert_eq!(vcpu.nr_sipi, 2);
    }
}
