pub mod msr;
pub mod regs;
pub mod vmx;

pub use regs::{GuestCpuContext, HostState};
