//! External-collaborator interfaces (section 1).
//!
//! Everything named here (ACPI synthesis, a debug shell, the 16550 UART
//! backend, vUART/vRTC/vPCI config emulation, the AP boot trampoline, the
//! E820 builder, guest image loaders, the CLI/config parser) sits outside
//! this crate's scope; the core only depends on the trait a platform
//! integration implements. Shaped like the teacher's `MmioDevice` trait
//! (`devices/mod.rs`): a narrow read/write-style contract, not a framework.
//! Each trait ships one minimal stub implementation, just enough to drive
//! and test the core — never a fully-realized subsystem.

use crate::config::{OsConfig, VmConfig};
use crate::vm::E820Entry;

/// 8250/16550-compatible byte sink a vUART collaborator writes through.
pub trait UartBackend {
    fn write_byte(&mut self, byte: u8);
    fn read_byte(&mut self) -> Option<u8>;
}

/// Discards writes, never has input. Used where no console is wired up.
pub struct NullUartBackend;

impl UartBackend for NullUartBackend {
    fn write_byte(&mut self, _byte: u8) {}
    fn read_byte(&mut self) -> Option<u8> {
        None
    }
}

/// ACPI table synthesis (MADT/DSDT/FACP) for a guest's boot firmware.
pub trait AcpiSynthesizer {
    /// Write the tables for `vm_id` into `out`, returning the byte count.
    fn build_tables(&self, vm_id: usize, out: &mut [u8]) -> usize;
}

/// Interactive debug shell bound to a management console.
pub trait DebugShell {
    fn poll_line(&mut self) -> Option<&str>;
    fn write_line(&mut self, line: &str);
}

/// Guest memory layout source the E820 builder consults (RAM regions, MMIO
/// holes, reserved ranges) before `create_vm` maps them into EPT.
pub trait E820Builder {
    /// Fill `out` with this VM's memory map, returning the entry count.
    fn build(&self, vm_id: usize, out: &mut [Option<E820Entry>]) -> usize;
}

/// Loads a guest's kernel/firmware image into guest RAM ahead of
/// `prepare_vm`'s first `launch`.
pub trait GuestImageLoader {
    fn load(&self, os: &OsConfig, guest_ram: &mut [u8]) -> Result<(), &'static str>;
}

/// Real-mode AP bring-up code run between a STARTUP IPI and the first
/// VM-entry (16-bit trampoline, GDT/IDT setup, jump to protected mode).
pub trait BootTrampoline {
    /// Physical address the trampoline's entry point is assembled at.
    fn entry_point(&self) -> u64;
}

/// Parses a deployment's textual configuration (CLI flags or a config
/// file) into the typed `VmConfig` the const `VM_CONFIGS` table otherwise
/// ships as a compiled-in default.
pub trait ConfigParser {
    fn parse(&self, text: &str) -> Result<VmConfig, &'static str>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_uart_backend_drops_everything() {
        let mut uart = NullUartBackend;
        uart.write_byte(b'x');
        assert_eq!(uart.read_byte(), None);
    }
}
