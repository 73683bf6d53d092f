//! MSR access, thin wrapper over the `x86` crate.

pub use crate::platform::{
    MSR_IA32_APIC_BASE, MSR_IA32_EXT_APIC_ICR, MSR_IA32_EXT_APIC_LDR, MSR_IA32_EXT_XAPICID,
    MSR_IA32_TSC_DEADLINE,
};

pub const IA32_VMX_BASIC: u32 = 0x480;
pub const IA32_FS_BASE: u32 = 0xC000_0100;
pub const IA32_GS_BASE: u32 = 0xC000_0101;
pub const IA32_PAT: u32 = 0x277;
pub const IA32_EFER: u32 = 0xC000_0080;
pub const IA32_MISC_ENABLE: u32 = 0x1A0;
pub const IA32_TSC_ADJUST: u32 = 0x3B;

/// Read a model-specific register.
///
/// # Safety
/// Caller must know `msr` is a defined, readable register on this CPU.
#[inline]
pub unsafe fn rdmsr(msr: u32) -> u64 {
    x86::msr::rdmsr(msr)
}

/// Write a model-specific register.
///
/// # Safety
/// Caller must know `msr` is a defined, writable register and that `value`
/// is a legal value for it.
#[inline]
pub unsafe fn wrmsr(msr: u32, value: u64) {
    x86::msr::wrmsr(msr, value)
}

/// `IA32_VMX_BASIC[31:0]`, used to stamp the VMCS revision identifier.
#[inline]
pub fn vmcs_revision_id() -> u32 {
    unsafe { rdmsr(IA32_VMX_BASIC) as u32 }
}
