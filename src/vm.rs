//! VM lifecycle wrapper (component I).
//!
//! Composes the paging pool (A, via [`crate::mm::ept`]) and the vCPU
//! lifecycle (H, via [`crate::vcpu`]) into the `create_vm` / `prepare_vm`
//! / `pause_vm` / `shutdown_vm` transitions section 4.I names, plus the
//! vLAPIC-mode accounting the MSI remapper (F) consults. No teacher
//! analogue carries a VM abstraction at all — the aarch64 original's
//! `Vm` mixed GICv3 device emulation and Stage-2 setup into one 900-line
//! file; this keeps only the lifecycle-composition role and leaves
//! PIO/MMIO emulation, vUART/vRTC/vPCI construction, IOMMU enablement,
//! and vCPUID programming to the external collaborators section 1 names
//! (not modeled in this core).

use crate::config::{GuestFlags, VmConfig, MAX_VCPUS_PER_VM, VM_CONFIGS};
use crate::error::HvError;
use crate::global;
use crate::lapic::{Destination, IcrFlags};
use crate::mm::ept::{EptOps, EptPool, EPT_MEMTYPE_WB};
use crate::mm::paging::{MemoryOps, Page, PageSize};
use crate::mm::paging::LARGE_PAGE_SIZE;
use crate::msi::VlapicModeGate;
use crate::platform::{APIC_BASE_ENABLED, APIC_BASE_X2APIC};
use crate::sync::SpinLock;
use crate::vcpu::{Vcpu, VcpuState};

/// VM lifecycle state (section 3.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmState {
    PoweredOff,
    Created,
    Started,
    Paused,
    PoweringOff,
}

/// VM-wide vLAPIC mode, recomputed by scanning every created vCPU
/// (section 4.I vLAPIC-mode accounting).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VlapicMode {
    XApic,
    X2Apic,
    Transition,
    Disabled,
}

/// One entry of the guest's synthesized memory map (section 4.I step 4).
#[derive(Debug, Clone, Copy)]
pub struct E820Entry {
    pub base: u64,
    pub len: u64,
    pub kind: E820Kind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum E820Kind {
    Ram,
    Reserved,
}

const MAX_E820_ENTRIES: usize = 4;

/// A single partitioned guest VM (section 3.2).
pub struct Vm {
    id: usize,
    state: VmState,
    vlapic_mode: VlapicMode,
    /// Protects `state` transitions and `vlapic_mode` accounting.
    lock: SpinLock<()>,
    ept: EptPool,
    io_bitmap_a: Page,
    io_bitmap_b: Page,
    msr_bitmap: Page,
    vcpus: [Option<Vcpu>; MAX_VCPUS_PER_VM],
    created_vcpus: usize,
    e820: [Option<E820Entry>; MAX_E820_ENTRIES],
    /// Address of the shared vm-exit landing stub and the host stack it
    /// resumes on, supplied once by the (external) boot/trampoline
    /// collaborator at `prepare_vm` time and replayed on every later
    /// `INIT_VMCS` re-init (section 4.C host-state group).
    vmexit_stub: u64,
    host_rsp: u64,
}

impl Vm {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn state(&self) -> VmState {
        self.state
    }

    pub fn vlapic_mode(&self) -> VlapicMode {
        self.vlapic_mode
    }

    pub fn ept(&self) -> &EptPool {
        &self.ept
    }

    pub fn e820(&self) -> &[Option<E820Entry>] {
        &self.e820
    }

    /// Read-only vCPU lookup for the `vcpu_list`/`vcpu_dumpreg` debug-shell
    /// collaborator (section 6 debug shell); core state transitions never
    /// go through this accessor.
    pub fn vcpu(&self, idx: usize) -> Option<&Vcpu> {
        self.vcpus.get(idx)?.as_ref()
    }

    /// The gate the MSI remapper (section 4.F) consults before committing
    /// a passthrough IRTE: refuse in `Transition` or `Disabled`.
    pub fn msi_gate(&self) -> VlapicModeGate {
        match self.vlapic_mode {
            VlapicMode::XApic => VlapicModeGate::Stable { x2apic: false },
            VlapicMode::X2Apic => VlapicModeGate::Stable { x2apic: true },
            VlapicMode::Transition | VlapicMode::Disabled => VlapicModeGate::Transitioning,
        }
    }

    fn new(id: usize, cfg: &VmConfig) -> Result<Self, HvError> {
        let ept = EptPool::new();

        let mut io_bitmap_a = Page::zeroed();
        let mut io_bitmap_b = Page::zeroed();
        for word in io_bitmap_a.0.iter_mut() {
            *word = u64::MAX; // section 4.I step 5: every port traps
        }
        for word in io_bitmap_b.0.iter_mut() {
            *word = u64::MAX;
        }
        // The MSR bitmap is built by the (external) MSR-emulation
        // subsystem; the core only owns the page it lands in.
        let msr_bitmap = Page::zeroed();

        let mut e820 = [None; MAX_E820_ENTRIES];
        e820[0] = Some(E820Entry { base: 0, len: cfg.mem_size, kind: E820Kind::Ram });

        map_region::<EptOps>(
            &ept,
            0,
            cfg.mem_start_hpa,
            cfg.mem_size,
            EptOps::default_access_right() | EPT_MEMTYPE_WB,
        )?;

        Ok(Self {
            id,
            state: VmState::Created,
            vlapic_mode: VlapicMode::XApic,
            lock: SpinLock::new(()),
            ept,
            io_bitmap_a,
            io_bitmap_b,
            msr_bitmap,
            vcpus: [const { None }; MAX_VCPUS_PER_VM],
            created_vcpus: 0,
            e820,
            vmexit_stub: 0,
            host_rsp: 0,
        })
    }
}

/// Map a size-aligned guest-physical region to host-physical memory,
/// preferring 2 MiB leaves and falling back to 4 KiB for any unaligned
/// remainder (section 4.I step 4 RAM-entry mapping).
fn map_region<M: MemoryOps>(pool: &EptPool, gpa_base: u64, hpa_base: u64, len: u64, access: u64) -> Result<(), HvError> {
    let mut off = 0u64;
    while off < len {
        let remaining = len - off;
        if (gpa_base + off) % LARGE_PAGE_SIZE == 0
            && (hpa_base + off) % LARGE_PAGE_SIZE == 0
            && remaining >= LARGE_PAGE_SIZE
        {
            pool.map::<M>(gpa_base + off, hpa_base + off, PageSize::Size2M, access)?;
            off += LARGE_PAGE_SIZE;
        } else {
            pool.map::<M>(gpa_base + off, hpa_base + off, PageSize::Size4K, access)?;
            off += crate::mm::paging::PAGE_SIZE;
        }
    }
    Ok(())
}

/// `create_vm` (section 4.I): build a fresh VM from its static config and
/// install it in the global VM table. Steps 3 (PIO/MMIO handler
/// registration), 6 (vUART/vRTC/vPCI/IOMMU), and 7 (vCPUID) are external
/// collaborators (section 1) and are not performed here.
pub fn create_vm(vm_id: usize) -> Result<(), HvError> {
    let cfg = VM_CONFIGS.get(vm_id).ok_or(HvError::Precondition("vm_id out of range"))?;
    let vm = Vm::new(vm_id, cfg)?;
    unsafe {
        *global::vm_slot(vm_id) = Some(vm);
    }
    Ok(())
}

/// `prepare_vm` (section 4.I): create every vCPU named in the config's
/// per-vCPU `pcpu_bitmap`, reset each into its OS entry point, pin its
/// scheduler thread to the requested pCPU, and move the VM to `Started`.
/// The first vCPU created is the BSP.
pub fn prepare_vm(vm_id: usize, vmexit_stub: u64, host_rsp: u64) -> Result<(), HvError> {
    let cfg = VM_CONFIGS.get(vm_id).ok_or(HvError::Precondition("vm_id out of range"))?;
    let vm = vm_mut(vm_id)?;
    let _guard = vm.lock.lock();
    if vm.state != VmState::Created {
        return Err(HvError::Precondition("prepare_vm from non-Created state"));
    }
    vm.vmexit_stub = vmexit_stub;
    vm.host_rsp = host_rsp;

    let io_a = vm.io_bitmap_a.hpa();
    let io_b = vm.io_bitmap_b.hpa();
    let msr = vm.msr_bitmap.hpa();

    for i in 0..cfg.vcpu_count {
        let pcpu_bitmap = cfg.vcpus[i].pcpu_bitmap;
        if pcpu_bitmap == 0 {
            return Err(HvError::Precondition("vcpu has no pcpu affinity"));
        }
        let pcpu_id = pcpu_bitmap.trailing_zeros() as usize;
        let is_bsp = i == 0;

        let mut vcpu = Vcpu::create(vm_id, i, is_bsp);
        vcpu.reset(&cfg.os, &vm.ept, io_a, io_b, msr, vmexit_stub, host_rsp)?;
        vm.vcpus[i] = Some(vcpu);
        vm.created_vcpus += 1;

        let slot = global::vcpu_slot(vm_id, i);
        unsafe {
            (*crate::percpu::this_cpu(pcpu_id)).sched.init_thread_data(slot, pcpu_id, vcpu_thread_entry);
        }
    }
    recompute_vlapic_mode(&vm.vcpus, &mut vm.vlapic_mode);
    vm.state = VmState::Started;
    Ok(())
}

/// `pause_vm` (section 4.I): pause every created vCPU (resumable; the VM
/// stays `Paused↔Started`-reversible per section 3.2's invariant).
pub fn pause_vm(vm_id: usize) -> Result<(), HvError> {
    let vm = vm_mut(vm_id)?;
    let _guard = vm.lock.lock();
    if vm.state != VmState::Started {
        return Err(HvError::Precondition("pause_vm from non-Started state"));
    }
    for vcpu in vm.vcpus.iter_mut().flatten() {
        let _ = vcpu.pause(VcpuState::Paused);
    }
    vm.state = VmState::Paused;
    Ok(())
}

/// `shutdown_vm` (section 4.I): drain every vCPU to `Zombie`, drop the
/// slots, and return the VM to `PoweredOff`. Freeing vPCI/vUART/IOMMU/EPT
/// resources is left to the external collaborators that own them.
pub fn shutdown_vm(vm_id: usize) -> Result<(), HvError> {
    let vm = vm_mut(vm_id)?;
    let _guard = vm.lock.lock();
    if vm.state == VmState::PoweredOff {
        return Ok(());
    }
    vm.state = VmState::PoweringOff;
    for slot in vm.vcpus.iter_mut() {
        if let Some(vcpu) = slot.as_mut() {
            let _ = vcpu.pause(VcpuState::Zombie);
            let _ = vcpu.offline(true);
        }
        *slot = None;
    }
    vm.created_vcpus = 0;
    recompute_vlapic_mode(&vm.vcpus, &mut vm.vlapic_mode);
    vm.state = VmState::PoweredOff;
    Ok(())
}

/// Error-taxonomy precondition-violation dispatch (section 7): fatal to
/// the whole hypervisor on the safety VM, a VM-scoped shutdown otherwise.
/// `reason` is for the panic message only; non-safety VMs never see it.
pub fn fatal_error_shutdown_vm(vm_id: usize, reason: &'static str) {
    if VM_CONFIGS[vm_id].guest_flags.contains(GuestFlags::SAFETY_VM) {
        panic!("precondition violated on safety vm {}: {}", vm_id, reason);
    }
    let _ = shutdown_vm(vm_id);
}

fn vm_mut(vm_id: usize) -> Result<&'static mut Vm, HvError> {
    let slot = unsafe { &mut *global::vm_slot(vm_id) };
    slot.as_mut().ok_or(HvError::Precondition("create_vm not called for this vm_id"))
}

/// Read-only counterpart to `vm_mut`, for collaborators that only inspect
/// state (the debug shell's `vm_list`/`vcpu_list`, section 6).
pub fn vm(vm_id: usize) -> Result<&'static Vm, HvError> {
    let slot = unsafe { &*global::vm_slot(vm_id) };
    slot.as_ref().ok_or(HvError::Precondition("create_vm not called for this vm_id"))
}

/// vLAPIC-mode accounting (section 4.I): scan every live vCPU's cached
/// `msr_apicbase` and derive the VM-wide mode. Must be called with
/// `vm.lock` already held; takes the two fields it touches rather than
/// the whole `Vm` so the call site can still hold the lock guard (which
/// borrows `vm.lock`) across the call.
fn recompute_vlapic_mode(vcpus: &[Option<Vcpu>; MAX_VCPUS_PER_VM], vlapic_mode: &mut VlapicMode) {
    let (mut any_x2apic, mut any_xapic, mut any_disabled) = (false, false, false);
    for vcpu in vcpus.iter().flatten() {
        let base = vcpu.vlapic.msr_apicbase;
        if base & APIC_BASE_ENABLED == 0 {
            any_disabled = true;
        } else if base & APIC_BASE_X2APIC != 0 {
            any_x2apic = true;
        } else {
            any_xapic = true;
        }
    }
    *vlapic_mode = if any_x2apic && any_xapic {
        VlapicMode::Transition
    } else if any_x2apic {
        VlapicMode::X2Apic
    } else if any_xapic {
        VlapicMode::XApic
    } else if any_disabled {
        VlapicMode::Disabled
    } else {
        *vlapic_mode
    };
}

/// ICR-write dispatch (section 4.D ICR write): classify the delivery mode
/// written to `source_vcpu`'s vLAPIC and either emulate INIT/STARTUP
/// against the target vCPU, or let the caller issue a direct IPI for any
/// other delivery mode (fixed/lowest-priority/SMI/NMI/external are not
/// emulated here — they go out on the wire as the spec describes, which
/// is a raw LAPIC MSR write the platform leaf performs, not core state).
pub fn dispatch_icr_write(vm_id: usize, source_vcpu: usize, value: u64) -> Result<Option<(Destination, u8)>, HvError> {
    let vm = vm_mut(vm_id)?;
    let (flags, dest, vector) = {
        let vcpu = vm.vcpus[source_vcpu].as_mut().ok_or(HvError::Precondition("no such vcpu"))?;
        vcpu.vlapic.write_icr(value).map_err(HvError::from)?
    };
    let target_id = match dest {
        Destination::Physical(id) => id as usize,
        _ => return Ok(Some((dest, vector))), // non-INIT/STARTUP: caller issues the IPI directly
    };

    let _guard = vm.lock.lock();
    if flags.contains(IcrFlags::DELIVERY_MODE_INIT) {
        let cfg = &VM_CONFIGS[vm_id];
        let target = vm.vcpus[target_id].as_mut().ok_or(HvError::Precondition("no such vcpu"))?;
        // Pause (not Zombie: `reset` below only accepts Offline/Paused) and
        // re-arm for exactly one STARTUP IPI, per section 4.D INIT handling.
        let _ = target.pause(VcpuState::Paused);
        target.reset(&cfg.os, &vm.ept, vm.io_bitmap_a.hpa(), vm.io_bitmap_b.hpa(), vm.msr_bitmap.hpa(), vm.vmexit_stub, vm.host_rsp)?;
        target.nr_sipi = 1;
        Ok(None)
    } else if flags.contains(IcrFlags::DELIVERY_MODE_STARTUP) {
        let target = vm.vcpus[target_id].as_mut().ok_or(HvError::Precondition("no such vcpu"))?;
        if target.state() == VcpuState::Init && target.nr_sipi != 0 {
            target.nr_sipi -= 1;
            target.pending_startup_rip = Some(((value & 0xFF) as u64) << 12);
            global::PENDING_REQS.request(global::vcpu_slot(vm_id, target_id), crate::vcpu_interrupt::PendingReq::INIT_VMCS);
        }
        Ok(None)
    } else {
        Ok(Some((dest, vector))) // fixed/lowest-priority/SMI/NMI/external: direct IPI on the wire
    }
}

/// Thread entry pinned to a vCPU's slot by `prepare_vm`: drain this
/// vCPU's pending-request bitmap into it and drive one `enter` per
/// scheduling quantum. Exit-reason-specific emulation (I/O traps, MMIO
/// traps) is an external collaborator's job, not modeled here; this loop
/// only performs the core VM-entry composition (section 4.E + 4.H).
fn vcpu_thread_entry(slot: usize) {
    let vm_id = slot / MAX_VCPUS_PER_VM;
    let vcpu_id = slot % MAX_VCPUS_PER_VM;
    loop {
        let requested = global::PENDING_REQS.take(slot);
        let vm_opt = unsafe { &mut *global::vm_slot(vm_id) };
        let Some(vm) = vm_opt.as_mut() else { return };
        match vm.vcpus[vcpu_id].as_mut() {
            Some(vcpu) => vcpu.pending.insert(requested),
            None => return,
        }

        let (io_a, io_b, msr, vmexit_stub, host_rsp) =
            (vm.io_bitmap_a.hpa(), vm.io_bitmap_b.hpa(), vm.msr_bitmap.hpa(), vm.vmexit_stub, vm.host_rsp);
        let result = match vm.vcpus[vcpu_id].as_mut() {
            Some(vcpu) => vcpu.enter(&vm.ept, io_a, io_b, msr, vmexit_stub, host_rsp, None, true),
            None => return,
        };
        match result {
            Ok(()) => {}
            Err(HvError::TripleFault(_)) => {
                fatal_error_shutdown_vm(vm_id, "triple fault");
                return;
            }
            Err(_) => {
                fatal_error_shutdown_vm(vm_id, "vcpu precondition violation");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_vm_maps_guest_ram() {
        create_vm(0).unwrap();
        let vm = vm_mut(0).unwrap();
        assert_eq!(vm.state(), VmState::Created);
        let (hpa, _) = vm.ept().lookup::<EptOps>(0).unwrap();
        assert_eq!(hpa, VM_CONFIGS[0].mem_start_hpa);
        shutdown_vm(0).unwrap();
    }

    #[test]
    fn prepare_vm_rejects_before_create() {
        // vm_id 3 ("unused-1") is never created by this test module.
        assert!(prepare_vm(3, 0, 0).is_err());
    }

    #[test]
    fn fatal_error_shuts_down_non_safety_vm_without_panicking() {
        // VM_CONFIGS[2] ("unused-0") carries no SAFETY_VM flag.
        create_vm(2).unwrap();
        fatal_error_shutdown_vm(2, "test-induced precondition violation");
        assert_eq!(vm_mut(2).unwrap().state(), VmState::PoweredOff);
    }

    #[test]
    #[should_panic]
    fn fatal_error_panics_on_safety_vm() {
        // VM_CONFIGS[0] ("safety-vm") carries SAFETY_VM; the panic must
        // fire before touching the VM slot, so this never races the other
        // tests in this module that use vm_id 0.
        fatal_error_shutdown_vm(0, "test-induced precondition violation");
    }

    #[test]
    fn vlapic_mode_starts_xapic_then_tracks_x2apic() {
        create_vm(1).unwrap();
        prepare_vm(1, 0x1000, 0x2000).unwrap();
        let vm = vm_mut(1).unwrap();
        // VM_CONFIGS[1] ("rt-vm") vCPUs are constructed with is_bsp driving
        // x2APIC-enabled resets, so the mode should already read X2Apic.
        assert_eq!(vm.vlapic_mode(), VlapicMode::X2Apic);
        shutdown_vm(1).unwrap();
    }
}
