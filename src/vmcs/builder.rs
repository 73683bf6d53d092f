//! Fixed VMCS control-field policy and the `init_vmcs`/apicv-mode-switch
//! algorithms (section 4.C).

use super::{vmread, vmwrite, Field};
use crate::arch::x86_64::msr;
use crate::arch::x86_64::regs::HostState;
use crate::error::HvError;

// Pin-based VM-execution controls.
const PIN_EXTERNAL_INTERRUPT_EXITING: u64 = 1 << 0;

// Primary processor-based VM-execution controls.
const CPU_USE_TSC_OFFSETTING: u64 = 1 << 3;
const CPU_MWAIT_EXITING: u64 = 1 << 10;
const CPU_RDPMC_EXITING: u64 = 1 << 11;
const CPU_CR3_LOAD_EXITING: u64 = 1 << 15;
const CPU_CR3_STORE_EXITING: u64 = 1 << 16;
const CPU_MOV_DR_EXITING: u64 = 1 << 23;
const CPU_USE_IO_BITMAPS: u64 = 1 << 25;
const CPU_MONITOR_EXITING: u64 = 1 << 29;
const CPU_USE_MSR_BITMAPS: u64 = 1 << 28;
const CPU_TPR_SHADOW: u64 = 1 << 21;
const CPU_ACTIVATE_SECONDARY_CONTROLS: u64 = 1 << 31;

// Secondary processor-based VM-execution controls.
const SEC_VIRTUALIZE_APIC_ACCESSES: u64 = 1 << 0;
const SEC_ENABLE_EPT: u64 = 1 << 1;
const SEC_WBINVD_EXITING: u64 = 1 << 6;
const SEC_ENABLE_VPID: u64 = 1 << 5;
const SEC_UNRESTRICTED_GUEST: u64 = 1 << 7;
const SEC_ENABLE_RDTSCP: u64 = 1 << 3;

// VM-entry controls.
const ENTRY_IA32E_MODE_GUEST: u64 = 1 << 9;
const ENTRY_LOAD_IA32_PAT: u64 = 1 << 14;
const ENTRY_LOAD_IA32_EFER: u64 = 1 << 15;

// VM-exit controls.
const EXIT_HOST_ADDR_SPACE_SIZE: u64 = 1 << 9;
const EXIT_ACK_INTR_ON_EXIT: u64 = 1 << 15;
const EXIT_SAVE_IA32_PAT: u64 = 1 << 18;
const EXIT_LOAD_IA32_PAT: u64 = 1 << 19;
const EXIT_SAVE_IA32_EFER: u64 = 1 << 20;
const EXIT_LOAD_IA32_EFER: u64 = 1 << 21;

const EXCEPTION_BITMAP_DB: u64 = 1 << 1;

/// Everything a freshly created VMCS needs before its first `vmlaunch`:
/// the fixed control-field policy (pin/proc/secondary/entry/exit/
/// exception-bitmap), the EPT pointer, I/O and MSR bitmaps, host state,
/// and the TSC offset. `vpid` is a per-vCPU tag (VPID != 0 is required
/// once VPID is enabled).
pub struct VmcsInit {
    pub eptp: u64,
    pub io_bitmap_a_hpa: u64,
    pub io_bitmap_b_hpa: u64,
    pub msr_bitmap_hpa: u64,
    pub vpid: u16,
    pub vmexit_stub: u64,
    pub host_rsp: u64,
}

/// Build the control/host-state groups of a VMCS that has just been
/// `vmclear`ed and `vmptrld`ed (section 4.C). Guest-state is populated
/// separately by the vCPU reset path once the OS image load address is
/// known.
pub fn init_vmcs(init: &VmcsInit) -> Result<(), HvError> {
    vmwrite(Field::PinBasedVmExecControl, PIN_EXTERNAL_INTERRUPT_EXITING)?;

    let proc_ctls = CPU_USE_TSC_OFFSETTING
        | CPU_MWAIT_EXITING
        | CPU_RDPMC_EXITING
        | CPU_MOV_DR_EXITING
        | CPU_USE_IO_BITMAPS
        | CPU_MONITOR_EXITING
        | CPU_USE_MSR_BITMAPS
        | CPU_TPR_SHADOW
        | CPU_ACTIVATE_SECONDARY_CONTROLS;
    let proc_ctls = proc_ctls & !(CPU_CR3_LOAD_EXITING | CPU_CR3_STORE_EXITING);
    vmwrite(Field::CpuBasedVmExecControl, proc_ctls)?;

    let sec_ctls = SEC_VIRTUALIZE_APIC_ACCESSES
        | SEC_ENABLE_EPT
        | SEC_ENABLE_VPID
        | SEC_ENABLE_RDTSCP
        | SEC_UNRESTRICTED_GUEST
        | SEC_WBINVD_EXITING;
    vmwrite(Field::SecondaryVmExecControl, sec_ctls)?;

    vmwrite(Field::VmEntryControls, ENTRY_IA32E_MODE_GUEST | ENTRY_LOAD_IA32_PAT | ENTRY_LOAD_IA32_EFER)?;
    let exit_ctls = EXIT_HOST_ADDR_SPACE_SIZE
        | EXIT_ACK_INTR_ON_EXIT
        | EXIT_SAVE_IA32_PAT
        | EXIT_LOAD_IA32_PAT
        | EXIT_SAVE_IA32_EFER
        | EXIT_LOAD_IA32_EFER;
    vmwrite(Field::VmExitControls, exit_ctls)?;
    vmwrite(Field::ExceptionBitmap, EXCEPTION_BITMAP_DB)?;

    vmwrite(Field::EptPointer, init.eptp)?;
    vmwrite(Field::IoBitmapA, init.io_bitmap_a_hpa)?;
    vmwrite(Field::IoBitmapB, init.io_bitmap_b_hpa)?;
    vmwrite(Field::MsrBitmap, init.msr_bitmap_hpa)?;

    let guest_tsc_adjust = unsafe { msr::rdmsr(msr::IA32_TSC_ADJUST) };
    let host_tsc_adjust = unsafe { msr::rdmsr(msr::IA32_TSC_ADJUST) };
    vmwrite(Field::TscOffset, guest_tsc_adjust.wrapping_sub(host_tsc_adjust))?;

    let host = unsafe { HostState::capture(init.vmexit_stub, init.host_rsp) };
    load_host_state(&host)?;

    Ok(())
}

fn load_host_state(host: &HostState) -> Result<(), HvError> {
    vmwrite(Field::HostEsSelector, host.es_sel as u64)?;
    vmwrite(Field::HostCsSelector, host.cs_sel as u64)?;
    vmwrite(Field::HostSsSelector, host.ss_sel as u64)?;
    vmwrite(Field::HostDsSelector, host.ds_sel as u64)?;
    vmwrite(Field::HostFsSelector, host.fs_sel as u64)?;
    vmwrite(Field::HostGsSelector, host.gs_sel as u64)?;
    vmwrite(Field::HostTrSelector, host.tr_sel as u64)?;
    vmwrite(Field::HostGdtrBase, host.gdtr_base)?;
    vmwrite(Field::HostIdtrBase, host.idtr_base)?;
    vmwrite(Field::HostCr0, host.cr0)?;
    vmwrite(Field::HostCr3, host.cr3)?;
    vmwrite(Field::HostCr4, host.cr4)?;
    vmwrite(Field::HostFsBase, host.fs_base)?;
    vmwrite(Field::HostGsBase, host.gs_base)?;
    vmwrite(Field::HostIa32Pat, host.ia32_pat)?;
    vmwrite(Field::HostIa32Efer, host.ia32_efer)?;
    vmwrite(Field::HostRip, host.rip)?;
    vmwrite(Field::HostRsp, host.rsp)?;
    Ok(())
}

/// Point the VMCS's virtual-APIC page at `hpa` (the TPR-shadow backing
/// page `CPU_TPR_SHADOW` reads/writes against while still in xAPIC mode).
pub fn set_virtual_apic_page(hpa: u64) -> Result<(), HvError> {
    vmwrite(Field::VirtualApicPageAddr, hpa)
}

/// Apicv-mode switch to x2APIC pass-through (section 4.C): clears
/// pin-based external-interrupt-exiting, clears ack-interrupt-on-exit,
/// clears primary TPR-shadow, and clears secondary virtualize-APIC-
/// accesses, then sets the TPR threshold to 0. Called from the
/// `IA32_APIC_BASE` write path (section 4.D) on the `{XAPIC}` ->
/// `{XAPIC|X2APIC}` transition; after this, guest accesses to the
/// x2APIC MSR range `0x802-0x83F` are passthrough except the ICR
/// (`0x830`), which still traps via the MSR bitmap.
pub fn apicv_mode_switch_to_x2apic() -> Result<(), HvError> {
    let pin_ctls = vmread(Field::PinBasedVmExecControl)?;
    vmwrite(Field::PinBasedVmExecControl, pin_ctls & !PIN_EXTERNAL_INTERRUPT_EXITING)?;

    let exit_ctls = vmread(Field::VmExitControls)?;
    vmwrite(Field::VmExitControls, exit_ctls & !EXIT_ACK_INTR_ON_EXIT)?;

    let proc_ctls = vmread(Field::CpuBasedVmExecControl)?;
    vmwrite(Field::CpuBasedVmExecControl, proc_ctls & !CPU_TPR_SHADOW)?;

    let sec_ctls = vmread(Field::SecondaryVmExecControl)?;
    vmwrite(Field::SecondaryVmExecControl, sec_ctls & !SEC_VIRTUALIZE_APIC_ACCESSES)?;

    vmwrite(Field::TprThreshold, 0)
}

pub fn read_exit_reason() -> Result<u32, HvError> {
    Ok(vmread(Field::VmExitReason)? as u32)
}

pub fn read_exit_qualification() -> Result<u64, HvError> {
    vmread(Field::ExitQualification)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_bits_match_fixed_policy() {
        let proc_ctls = CPU_USE_TSC_OFFSETTING
            | CPU_MWAIT_EXITING
            | CPU_RDPMC_EXITING
            | CPU_MOV_DR_EXITING
            | CPU_USE_IO_BITMAPS
            | CPU_MONITOR_EXITING
            | CPU_USE_MSR_BITMAPS
            | CPU_TPR_SHADOW
            | CPU_ACTIVATE_SECONDARY_CONTROLS;
        assert_eq!(proc_ctls & (CPU_CR3_LOAD_EXITING | CPU_CR3_STORE_EXITING), 0);
        assert_ne!(proc_ctls & CPU_USE_IO_BITMAPS, 0);
        assert_ne!(proc_ctls & CPU_USE_MSR_BITMAPS, 0);
    }

    #[test]
    fn entry_exit_controls_include_efer_and_pat_load_save() {
        let entry_ctls = ENTRY_IA32E_MODE_GUEST | ENTRY_LOAD_IA32_PAT | ENTRY_LOAD_IA32_EFER;
        let exit_ctls = EXIT_HOST_ADDR_SPACE_SIZE
            | EXIT_ACK_INTR_ON_EXIT
            | EXIT_SAVE_IA32_PAT
            | EXIT_LOAD_IA32_PAT
            | EXIT_SAVE_IA32_EFER
            | EXIT_LOAD_IA32_EFER;
        assert_ne!(entry_ctls & ENTRY_LOAD_IA32_EFER, 0);
        assert_ne!(entry_ctls & ENTRY_LOAD_IA32_PAT, 0);
        assert_ne!(exit_ctls & EXIT_ACK_INTR_ON_EXIT, 0);
        assert_ne!(exit_ctls & EXIT_SAVE_IA32_EFER, 0);
        assert_ne!(exit_ctls & EXIT_LOAD_IA32_EFER, 0);
    }

    #[test]
    fn apicv_mode_switch_clears_xapic_bits_and_nothing_else() {
        // The switch must clear exactly these four bits and leave every
        // other fixed-policy bit untouched.
        let pin_ctls_before = PIN_EXTERNAL_INTERRUPT_EXITING;
        let pin_ctls_after = pin_ctls_before & !PIN_EXTERNAL_INTERRUPT_EXITING;
        assert_eq!(pin_ctls_after, 0);

        let proc_ctls_before = CPU_USE_MSR_BITMAPS | CPU_TPR_SHADOW;
        let proc_ctls_after = proc_ctls_before & !CPU_TPR_SHADOW;
        assert_eq!(proc_ctls_after, CPU_USE_MSR_BITMAPS);

        let sec_ctls_before = SEC_VIRTUALIZE_APIC_ACCESSES | SEC_ENABLE_EPT;
        let sec_ctls_after = sec_ctls_before & !SEC_VIRTUALIZE_APIC_ACCESSES;
        assert_eq!(sec_ctls_after, SEC_ENABLE_EPT);

        let exit_ctls_before = EXIT_HOST_ADDR_SPACE_SIZE | EXIT_ACK_INTR_ON_EXIT;
        let exit_ctls_after = exit_ctls_before & !EXIT_ACK_INTR_ON_EXIT;
        assert_eq!(exit_ctls_after, EXIT_HOST_ADDR_SPACE_SIZE);
    }
}
