//! Section 8 scenario 1: INIT+STARTUP brings up an AP.
//!
//! "safety-vm" (`VM_CONFIGS[0]`) has two vCPUs pinned to pCPU 0 (BSP) and
//! pCPU 1 (AP); the BSP drives the AP through INIT then STARTUP exactly as
//! a guest firmware's AP bring-up sequence would.

use pvisor::vm;

const DELIVERY_MODE_INIT: u64 = 0x4500; // LEVEL_ASSERT | INIT, no vector
const DELIVERY_MODE_STARTUP: u64 = 0x4608; // LEVEL_ASSERT | STARTUP, vector 0x08
const TARGET_APIC_ID: u64 = 1 << 32; // physical destination, apic id 1

#[test]
fn init_then_startup_brings_up_the_ap() {
    vm::create_vm(0).unwrap();
    vm::prepare_vm(0, 0x1000, 0x2000).unwrap();

    // BSP (vcpu 0) writes INIT to the AP (vcpu 1, apic id 1).
    let result = vm::dispatch_icr_write(0, 0, TARGET_APIC_ID | DELIVERY_MODE_INIT).unwrap();
    assert_eq!(result, None, "INIT is emulated, never forwarded as a raw IPI");

    let vm_ref = vm::vm(0).unwrap();
    let ap = vm_ref.vcpu(1).unwrap();
    assert_eq!(ap.nr_sipi, 1);

    // BSP writes STARTUP with vector 0x08 -> entry 0x08000.
    let result = vm::dispatch_icr_write(0, 0, TARGET_APIC_ID | DELIVERY_MODE_STARTUP).unwrap();
    assert_eq!(result, None);

    let ap = vm_ref.vcpu(1).unwrap();
    assert_eq!(ap.nr_sipi, 0);
    assert_eq!(ap.pending_startup_rip, Some(0x0800_0u64));
    // The deferred RIP write and the Running transition happen inside the
    // AP's own scheduler thread the next time it services `INIT_VMCS`
    // (`vcpu::enter`), not synchronously here; see `vcpu::tests` for the
    // VMCS-edit half of that path.

    vm::shutdown_vm(0).unwrap();
}

#[test]
fn startup_is_ignored_without_a_prior_init() {
    vm::create_vm(1).unwrap();
    vm::prepare_vm(1, 0x1000, 0x2000).unwrap();

    // rt-vm only has one vcpu; target an apic id that doesn't exist as a
    // second vcpu so the STARTUP is a no-op either way, but the important
    // assertion is that the call itself can't panic on a fresh (Init,
    // nr_sipi == 0) vcpu even when addressed at the BSP itself.
    let result = vm::dispatch_icr_write(1, 0, (0u64 << 32) | DELIVERY_MODE_STARTUP).unwrap();
    assert_eq!(result, None);
    assert_eq!(vm::vm(1).unwrap().vcpu(0).unwrap().nr_sipi, 0);

    vm::shutdown_vm(1).unwrap();
}
