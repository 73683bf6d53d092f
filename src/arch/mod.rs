//! Architecture-specific code.
//!
//! Only x86-64/VT-x is supported; the module is still separated from the
//! rest of the core the way the teacher split `arch::aarch64` out, so a
//! second architecture could be added beside it without touching the
//! VM/vCPU/scheduler logic.

pub mod x86_64;
