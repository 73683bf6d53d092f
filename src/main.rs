#![no_std]
#![no_main]

use core::panic::PanicInfo;
use pvisor::{config, logging, vm};

/// Entry point handed off by the (external) boot/trampoline collaborator
/// once long mode, a valid stack, and VMX-root operation are already
/// established on this pCPU. Brings up logging and every statically
/// configured VM; driving each vCPU's scheduler loop across pCPUs is
/// itself wired up by that same external bring-up code (section 1), not
/// by this stub.
#[no_mangle]
pub extern "C" fn hv_main() -> ! {
    logging::init();
    log::info!("pvisor core initialized");

    for vm_id in 0..config::CONFIG_MAX_VM_NUM {
        if config::VM_CONFIGS[vm_id].vcpu_count == 0 {
            continue;
        }
        if vm::create_vm(vm_id).is_err() {
            log::error!("create_vm({}) failed", vm_id);
        }
    }

    loop {
        core::hint::spin_loop();
    }
}

#[panic_handler]
fn panic(_info: &PanicInfo) -> ! {
    loop {
        core::hint::spin_loop();
    }
}
