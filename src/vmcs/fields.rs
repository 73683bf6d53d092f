//! VMCS field encodings and exit-reason/exit-qualification enums.
//!
//! Field numbering is grounded on
//! `other_examples/df418ba9_casys-kaist-kev__kev-src-vmcs.rs`'s `Field`
//! enum; only the fields `builder.rs`'s fixed control-field policy and
//! the interrupt-injection path actually touch are carried over here —
//! the full ~200-entry table the SDM defines is not reproduced since
//! nothing else in this crate reads it. Exit-reason numbering is
//! grounded on `other_examples/efaa581b_lkdWind-x86_vcpu__src-vmx-
//! definitions.rs`'s `VmxExitReason`.

use numeric_enum_macro::numeric_enum;

numeric_enum! {
#[repr(u32)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Field {
    // 16-bit guest/host selector fields.
    GuestEsSelector = 0x0800,
    GuestCsSelector = 0x0802,
    GuestSsSelector = 0x0804,
    GuestDsSelector = 0x0806,
    GuestFsSelector = 0x0808,
    GuestGsSelector = 0x080A,
    GuestLdtrSelector = 0x080C,
    GuestTrSelector = 0x080E,
    HostEsSelector = 0x0C00,
    HostCsSelector = 0x0C02,
    HostSsSelector = 0x0C04,
    HostDsSelector = 0x0C06,
    HostFsSelector = 0x0C08,
    HostGsSelector = 0x0C0A,
    HostTrSelector = 0x0C0C,

    // 64-bit fields.
    IoBitmapA = 0x2000,
    IoBitmapB = 0x2002,
    MsrBitmap = 0x2004,
    TscOffset = 0x2010,
    VirtualApicPageAddr = 0x2012,
    EptPointer = 0x201A,
    GuestIa32Pat = 0x2804,
    GuestIa32Efer = 0x2806,
    HostIa32Pat = 0x2C00,
    HostIa32Efer = 0x2C02,

    // 32-bit control/status fields.
    PinBasedVmExecControl = 0x4000,
    CpuBasedVmExecControl = 0x4002,
    ExceptionBitmap = 0x4004,
    Cr3TargetCount = 0x400A,
    VmExitControls = 0x400C,
    VmExitMsrStoreCount = 0x400E,
    VmExitMsrLoadCount = 0x4010,
    VmEntryControls = 0x4012,
    VmEntryMsrLoadCount = 0x4014,
    VmEntryIntrInfoField = 0x4016,
    VmEntryExceptionErrorCode = 0x4018,
    VmEntryInstructionLen = 0x401A,
    TprThreshold = 0x401C,
    SecondaryVmExecControl = 0x401E,
    VmInstructionError = 0x4400,
    VmExitReason = 0x4402,
    VmExitIntrInfo = 0x4404,
    VmExitIntrErrorCode = 0x4406,
    IdtVectoringInfoField = 0x4408,
    IdtVectoringErrorCode = 0x440A,
    VmExitInstructionLen = 0x440C,
    GuestEsAccessRights = 0x4814,
    GuestCsAccessRights = 0x4816,
    GuestSsAccessRights = 0x4818,
    GuestDsAccessRights = 0x481A,
    GuestFsAccessRights = 0x481C,
    GuestGsAccessRights = 0x481E,
    GuestLdtrAccessRights = 0x4820,
    GuestTrAccessRights = 0x4822,
    GuestInterruptibilityInfo = 0x4824,
    GuestActivityState = 0x4826,
    HostIa32SysenterCs = 0x4C00,

    // Natural-width fields.
    Cr0GuestHostMask = 0x6000,
    Cr4GuestHostMask = 0x6002,
    Cr0ReadShadow = 0x6004,
    Cr4ReadShadow = 0x6006,
    ExitQualification = 0x6400,
    GuestLinearAddress = 0x640A,
    GuestCr0 = 0x6800,
    GuestCr3 = 0x6802,
    GuestCr4 = 0x6804,
    GuestEsBase = 0x6806,
    GuestCsBase = 0x6808,
    GuestSsBase = 0x680A,
    GuestDsBase = 0x680C,
    GuestFsBase = 0x680E,
    GuestGsBase = 0x6810,
    GuestLdtrBase = 0x6812,
    GuestTrBase = 0x6814,
    GuestGdtrBase = 0x6816,
    GuestIdtrBase = 0x6818,
    GuestDr7 = 0x681A,
    GuestRsp = 0x681C,
    GuestRip = 0x681E,
    GuestRflags = 0x6820,
    GuestSysenterEsp = 0x6824,
    GuestSysenterEip = 0x6826,
    HostCr0 = 0x6C00,
    HostCr3 = 0x6C02,
    HostCr4 = 0x6C04,
    HostFsBase = 0x6C06,
    HostGsBase = 0x6C08,
    HostTrBase = 0x6C0A,
    HostGdtrBase = 0x6C0C,
    HostIdtrBase = 0x6C0E,
    HostIa32SysenterEsp = 0x6C10,
    HostIa32SysenterEip = 0x6C12,
    HostRsp = 0x6C14,
    HostRip = 0x6C16,
}
}

numeric_enum! {
#[repr(u32)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[allow(non_camel_case_types)]
/// VMX basic exit reasons (SDM Vol. 3D Appendix C), limited to the
/// subset this hypervisor's exit dispatcher actually distinguishes.
pub enum VmxExitReason {
    EXCEPTION_NMI = 0,
    EXTERNAL_INTERRUPT = 1,
    TRIPLE_FAULT = 2,
    INIT = 3,
    SIPI = 4,
    INTERRUPT_WINDOW = 7,
    NMI_WINDOW = 8,
    TASK_SWITCH = 9,
    CPUID = 10,
    HLT = 12,
    INVLPG = 14,
    RDPMC = 15,
    RDTSC = 16,
    VMCALL = 18,
    CR_ACCESS = 28,
    DR_ACCESS = 29,
    IO_INSTRUCTION = 30,
    RDMSR = 31,
    WRMSR = 32,
    ENTRY_FAILURE_INVALID_GUEST_STATE = 33,
    MWAIT = 36,
    MONITOR_TRAP_FLAG = 37,
    MONITOR = 39,
    EPT_VIOLATION = 48,
    EPT_MISCONFIG = 49,
    INVEPT = 50,
    RDTSCP = 51,
    PREEMPTION_TIMER = 52,
    INVVPID = 53,
    WBINVD = 54,
    XSETBV = 55,
    APIC_WRITE = 56,
    RDRAND = 57,
    INVPCID = 58,
}
}

numeric_enum! {
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
/// VM-entry/exit interruption-information `type` sub-field (bits 10:8).
pub enum VmxInterruptionType {
    External = 0,
    Reserved = 1,
    Nmi = 2,
    HardException = 3,
    SoftIntr = 4,
    PrivSoftException = 5,
    SoftException = 6,
    Other = 7,
}
}

impl VmxInterruptionType {
    /// Whether this vector class pushes a hardware error code, per the
    /// exception-combining table (section 8).
    pub fn vector_has_error_code(vector: u8) -> bool {
        matches!(vector, 8 | 10 | 11 | 12 | 13 | 14 | 17)
    }
}
