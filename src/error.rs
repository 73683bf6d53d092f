//! Crate-wide error taxonomy.
//!
//! Every fallible core operation returns `Result<T, HvError>` (or a
//! subsystem error that converts into it via `From`) instead of the bare
//! `&'static str` codes a first draft of this code used. The taxonomy and
//! propagation rules mirror the hypervisor's status-return discipline:
//! no unwinding, one unconditional abort path (`panic!` on a safety-VM
//! precondition violation), everything else is a value.

use thiserror::Error;

/// Crate-wide error type. Subsystem errors convert into this via `From`
/// so call sites can use `?` across module boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HvError {
    /// Caller violated a documented precondition (alignment, range, ...).
    /// On the safety VM this is promoted to `panic!` by the caller; this
    /// variant is what non-safety-VM paths see instead of an abort.
    #[error("precondition violated: {0}")]
    Precondition(&'static str),

    /// No free slot/page/index for the requested resource.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(&'static str),

    /// Transient condition (e.g. vLAPIC mode mid-transition); caller may
    /// retry once the condition clears.
    #[error("transient: {0}")]
    Transient(&'static str),

    /// A vCPU requested a triple fault; the owning VM is being shut down.
    #[error("triple fault on vcpu {0}")]
    TripleFault(usize),

    /// A wait with a finite internal bound did not complete in time.
    #[error("timed out: {0}")]
    Timeout(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum VmxError {
    #[error("VMX instruction failed: {0:?}")]
    InstructionFailed(crate::arch::x86_64::vmx::VmxInstructionError),
    #[error("VMCS field not found: {0:#x}")]
    UnknownField(u32),
}

impl From<VmxError> for HvError {
    fn from(_: VmxError) -> Self {
        HvError::Precondition("vmx instruction failure")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EptError {
    #[error("address/size not aligned to requested page size")]
    Misaligned,
    #[error("paging pool exhausted")]
    PoolExhausted,
    #[error("address not mapped")]
    NotMapped,
}

impl From<EptError> for HvError {
    fn from(e: EptError) -> Self {
        match e {
            EptError::Misaligned => HvError::Precondition("unaligned EPT/MMU request"),
            EptError::PoolExhausted => HvError::ResourceExhausted("paging pool exhausted"),
            EptError::NotMapped => HvError::Precondition("address not mapped"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum IrteError {
    #[error("virt_bdf low 6 bits reserved (0x3F)")]
    ReservedBdf,
    #[error("index {0} already in use by a different (vm,bdf)")]
    IndexCollision(u8),
}

impl From<IrteError> for HvError {
    fn from(e: IrteError) -> Self {
        match e {
            IrteError::ReservedBdf => HvError::Precondition("virt_bdf & 0x3F == 0x3F"),
            IrteError::IndexCollision(_) => HvError::ResourceExhausted("irte index collision"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LapicError {
    #[error("ICR write set a reserved bit")]
    ReservedBit,
    #[error("destination could not be resolved to a vcpu")]
    NoSuchDestination,
}

impl From<LapicError> for HvError {
    fn from(e: LapicError) -> Self {
        match e {
            LapicError::ReservedBit => HvError::Precondition("icr reserved bits set"),
            LapicError::NoSuchDestination => HvError::Precondition("unresolvable icr destination"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MsiError {
    #[error("vlapic mode is mid-transition")]
    ModeTransition,
    #[error(transparent)]
    Irte(#[from] IrteError),
}

impl From<MsiError> for HvError {
    fn from(e: MsiError) -> Self {
        match e {
            MsiError::ModeTransition => HvError::Transient("vlapic mode transitioning"),
            MsiError::Irte(i) => i.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SchedError {
    #[error("wait for pcpus to come back online timed out")]
    PcpuWaitTimeout,
}

impl From<SchedError> for HvError {
    fn from(_: SchedError) -> Self {
        HvError::Timeout("wait_pcpus_offline")
    }
}
