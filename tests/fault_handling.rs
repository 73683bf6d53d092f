//! Section 8 scenarios 2 and 4: the precondition-violation/triple-fault
//! branches of the error taxonomy (section 7).

use pvisor::error::HvError;
use pvisor::vm;

#[test]
fn fault_on_non_safety_vm_shuts_it_down_without_a_panic() {
    // "rt-vm" (VM_CONFIGS[1]) carries no SAFETY_VM flag.
    vm::create_vm(1).unwrap();
    vm::prepare_vm(1, 0x1000, 0x2000).unwrap();

    vm::fatal_error_shutdown_vm(1, "#GP(0) observed on vcpu 0");

    assert_eq!(vm::vm(1).unwrap().state(), vm::VmState::PoweredOff);
}

#[test]
#[should_panic]
fn fault_on_the_safety_vm_is_fatal_to_the_hypervisor() {
    // "safety-vm" (VM_CONFIGS[0]) is the one VM where a precondition
    // violation must never be downgraded to a shutdown.
    vm::fatal_error_shutdown_vm(0, "#GP(0) observed on vcpu 0");
}

#[test]
fn double_fault_then_gp_requests_a_triple_fault() {
    // Scenario 4, driven through the public queue_exception surface
    // exposed for the safety-VM debug shell's fault-injection commands
    // rather than by reaching into a running VM's scheduler loop.
    let mut vcpu = pvisor::vcpu::Vcpu::create(0, 0, true);
    vcpu.inject_gp(0).unwrap(); // #GP, contributory
    vcpu.queue_exception(0, 0).unwrap(); // #DE combines into #DF
    let err = vcpu.inject_gp(0).unwrap_err(); // second contributory -> triple fault
    assert_eq!(err, HvError::TripleFault(0));
}
