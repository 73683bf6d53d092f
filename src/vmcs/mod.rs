//! VMCS builder and loading discipline (component C).
//!
//! No teacher analogue exists (aarch64 has no VMCS); the fixed
//! control-field policy, host/guest state population order, and
//! `switch_vmcs`/`init_vmcs` split are grounded directly in the spec's
//! algorithm description, with field numbering from
//! `other_examples/df418ba9_casys-kaist-kev__kev-src-vmcs.rs` and
//! interruption-type classification from
//! `other_examples/efaa581b_lkdWind-x86_vcpu__src-vmx-definitions.rs`.

pub mod builder;
pub mod fields;

pub use fields::{Field, VmxExitReason, VmxInterruptionType};

use crate::arch::x86_64::vmx;
use crate::error::{HvError, VmxError};

/// A 4 KiB-aligned VMCS region (section 3.3). The revision identifier
/// must be stamped before the first `vmclear`.
#[repr(C, align(4096))]
pub struct VmcsRegion {
    revision_id: u32,
    abort_indicator: u32,
    _data: [u8; 4096 - 8],
}

impl VmcsRegion {
    pub const fn new() -> Self {
        Self { revision_id: 0, abort_indicator: 0, _data: [0; 4096 - 8] }
    }

    pub fn stamp_revision(&mut self) {
        self.revision_id = crate::arch::x86_64::msr::vmcs_revision_id();
    }

    pub fn hpa(&self) -> u64 {
        self as *const Self as u64
    }
}

fn vmwrite(field: Field, value: u64) -> Result<(), HvError> {
    match unsafe { vmx::vmwrite(field as u32, value) } {
        vmx::VmxResult::Ok => Ok(()),
        vmx::VmxResult::FailInvalid => Err(VmxError::UnknownField(field as u32).into()),
        vmx::VmxResult::FailValid => {
            Err(VmxError::InstructionFailed(unsafe { vmx::vm_instruction_error() }).into())
        }
    }
}

fn vmread(field: Field) -> Result<u64, HvError> {
    let (value, result) = unsafe { vmx::vmread(field as u32) };
    match result {
        vmx::VmxResult::Ok => Ok(value),
        vmx::VmxResult::FailInvalid => Err(VmxError::UnknownField(field as u32).into()),
        vmx::VmxResult::FailValid => {
            Err(VmxError::InstructionFailed(unsafe { vmx::vm_instruction_error() }).into())
        }
    }
}

/// Make `vmcs` the current active VMCS for this pCPU (`VMPTRLD`), per the
/// percpu "currently-active VMCS pointer" bookkeeping (section 3.1).
pub fn switch_vmcs(vmcs_hpa: u64) -> Result<(), HvError> {
    match unsafe { vmx::vmptrld(vmcs_hpa) } {
        vmx::VmxResult::Ok => Ok(()),
        _ => Err(HvError::Precondition("vmptrld failed")),
    }
}
