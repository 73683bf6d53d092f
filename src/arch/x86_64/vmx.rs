//! Raw VMX instruction wrappers.
//!
//! Grounded on `VmxInstructionError`'s numbering from the pack's
//! `lkdWind-x86_vcpu` vmx-definitions file; the instructions themselves are
//! emitted as raw mnemonics rather than routed through a crate API because
//! the wrapper only needs to know the flags-based success/failure
//! convention common to every VMX instruction (SDM Vol. 3C 30.2).

use core::fmt;

/// VM-instruction error numbers (SDM Vol. 3C, 30.4), read back from VMCS
/// field `VM_INSTRUCTION_ERROR` (0x4400) after a VMfailValid.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct VmxInstructionError(pub u32);

impl VmxInstructionError {
    pub fn as_str(&self) -> &'static str {
        match self.0 {
            0 => "OK",
            1 => "VMCALL executed in VMX root operation",
            2 => "VMCLEAR with invalid physical address",
            3 => "VMCLEAR with VMXON pointer",
            4 => "VMLAUNCH with non-clear VMCS",
            5 => "VMRESUME with non-launched VMCS",
            7 => "VM entry with invalid control field(s)",
            8 => "VM entry with invalid host-state field(s)",
            9 => "VMPTRLD with invalid physical address",
            10 => "VMPTRLD with VMXON pointer",
            11 => "VMPTRLD with incorrect VMCS revision identifier",
            12 => "VMREAD/VMWRITE from/to unsupported VMCS component",
            13 => "VMWRITE to read-only VMCS component",
            28 => "Invalid operand to INVEPT/INVVPID",
            _ => "[other]",
        }
    }
}

impl fmt::Debug for VmxInstructionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VmxInstructionError({}, {:?})", self.0, self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmxResult {
    Ok,
    /// VMfailInvalid — no current VMCS, error number unavailable.
    FailInvalid,
    /// VMfailValid — error number is in `VM_INSTRUCTION_ERROR`.
    FailValid,
}

/// Decode RFLAGS.{CF,ZF} per the VMX success/failure convention shared by
/// every instruction in this module: CF=1 -> FailInvalid, ZF=1 -> FailValid.
#[inline]
fn result_from_flags(flags: u64) -> VmxResult {
    const CF: u64 = 1 << 0;
    const ZF: u64 = 1 << 6;
    if flags & CF != 0 {
        VmxResult::FailInvalid
    } else if flags & ZF != 0 {
        VmxResult::FailValid
    } else {
        VmxResult::Ok
    }
}

/// # Safety
/// Must be called in VMX root operation with `region` a valid, zeroed,
/// revision-stamped 4 KiB-aligned physical page.
#[inline]
pub unsafe fn vmxon(region: u64) -> VmxResult {
    let flags: u64;
    core::arch::asm!(
        "vmxon [{region}]",
        "pushfq", "pop {flags}",
        region = in(reg) &region,
        flags = out(reg) flags,
        options(nostack),
    );
    result_from_flags(flags)
}

/// # Safety
/// Must be called in VMX root operation.
#[inline]
pub unsafe fn vmxoff() {
    core::arch::asm!("vmxoff", options(nostack, nomem));
}

/// # Safety
/// `vmcs_pa` must be a valid, revision-stamped VMCS physical address.
#[inline]
pub unsafe fn vmclear(vmcs_pa: u64) -> VmxResult {
    let flags: u64;
    core::arch::asm!(
        "vmclear [{pa}]",
        "pushfq", "pop {flags}",
        pa = in(reg) &vmcs_pa,
        flags = out(reg) flags,
        options(nostack),
    );
    result_from_flags(flags)
}

/// # Safety
/// `vmcs_pa` must be a valid, cleared VMCS physical address.
#[inline]
pub unsafe fn vmptrld(vmcs_pa: u64) -> VmxResult {
    let flags: u64;
    core::arch::asm!(
        "vmptrld [{pa}]",
        "pushfq", "pop {flags}",
        pa = in(reg) &vmcs_pa,
        flags = out(reg) flags,
        options(nostack),
    );
    result_from_flags(flags)
}

/// # Safety
/// `field` must be a valid VMCS field encoding; a VMCS must be loaded.
#[inline]
pub unsafe fn vmread(field: u32) -> (u64, VmxResult) {
    let value: u64;
    let flags: u64;
    core::arch::asm!(
        "vmread {value}, {field}",
        "pushfq", "pop {flags}",
        field = in(reg) field as u64,
        value = out(reg) value,
        flags = out(reg) flags,
        options(nostack, nomem),
    );
    (value, result_from_flags(flags))
}

/// # Safety
/// `field` must be a valid, writable VMCS field encoding; a VMCS must be
/// loaded.
#[inline]
pub unsafe fn vmwrite(field: u32, value: u64) -> VmxResult {
    let flags: u64;
    core::arch::asm!(
        "vmwrite {field}, {value}",
        "pushfq", "pop {flags}",
        field = in(reg) field as u64,
        value = in(reg) value,
        flags = out(reg) flags,
        options(nostack, nomem),
    );
    result_from_flags(flags)
}

/// # Safety
/// A loaded, initialized VMCS must be present; this never returns on
/// success (control transfers to the guest).
#[inline]
pub unsafe fn vmlaunch() -> VmxResult {
    let flags: u64;
    core::arch::asm!(
        "vmlaunch",
        "pushfq", "pop {flags}",
        flags = out(reg) flags,
        options(nostack),
    );
    result_from_flags(flags)
}

/// # Safety
/// A loaded, launched VMCS must be present; this only returns on failure
/// (control transfers to the guest on success, back to the host on exit).
#[inline]
pub unsafe fn vmresume() -> VmxResult {
    let flags: u64;
    core::arch::asm!(
        "vmresume",
        "pushfq", "pop {flags}",
        flags = out(reg) flags,
        options(nostack),
    );
    result_from_flags(flags)
}

/// Read the current `VM_INSTRUCTION_ERROR` field (0x4400) after a
/// `VmxResult::FailValid`.
///
/// # Safety
/// A VMCS must be loaded.
#[inline]
pub unsafe fn vm_instruction_error() -> VmxInstructionError {
    const VM_INSTRUCTION_ERROR: u32 = 0x4400;
    let (v, _) = vmread(VM_INSTRUCTION_ERROR);
    VmxInstructionError(v as u32)
}

/// INVEPT single-context invalidation (section 4.E step 4).
///
/// # Safety
/// `eptp` must identify a valid EPT pointer.
#[inline]
pub unsafe fn invept_single_context(eptp: u64) {
    #[repr(C, align(16))]
    struct Descriptor {
        eptp: u64,
        reserved: u64,
    }
    let desc = Descriptor { eptp, reserved: 0 };
    core::arch::asm!(
        "invept {rcx}, [{desc}]",
        rcx = in(reg) 1u64, // type 1 = single-context
        desc = in(reg) &desc,
        options(nostack),
    );
}
