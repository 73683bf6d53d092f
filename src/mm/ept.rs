//! EPT-flavored `MemoryOps` policy and EPT-pointer construction.
//!
//! Bank sizes below size a per-VM paging pool generously enough for a
//! handful of contiguous guest RAM regions plus a few passthrough MMIO
//! windows; exhaustion surfaces as `EptError::PoolExhausted` rather than
//! silently failing, matching the resource-exhausted half of the error
//! taxonomy (section 7).

use crate::mm::paging::{MemoryOps, PagingPool};

pub const EPT_READ: u64 = 1 << 0;
pub const EPT_WRITE: u64 = 1 << 1;
pub const EPT_EXEC: u64 = 1 << 2;
pub const EPT_MEMTYPE_WB: u64 = 6 << 3;
pub const EPT_IGNORE_PAT: u64 = 1 << 6;

const NPDPT: usize = 4;
const NPD: usize = 16;
const NPT: usize = 64;

pub type EptPool = PagingPool<NPDPT, NPD, NPT>;

pub struct EptOps;

impl MemoryOps for EptOps {
    fn default_access_right() -> u64 {
        EPT_READ | EPT_WRITE | EPT_EXEC
    }

    fn entry_present(entry: u64) -> bool {
        entry & (EPT_READ | EPT_WRITE | EPT_EXEC) != 0
    }

    fn large_page_enabled() -> bool {
        true
    }

    fn tweak_exe_right(entry: u64) -> u64 {
        entry & !EPT_EXEC
    }

    fn recover_exe_right(entry: u64) -> u64 {
        entry | EPT_EXEC
    }

    fn clflush_pagewalk(entry_ptr: *const u64) {
        unsafe { core::arch::asm!("clflush [{p}]", p = in(reg) entry_ptr, options(nostack)) };
    }
}

/// Build the `EPTP` VMCS field value: HPA of the PML4 root, 4-level walk
/// length, write-back memory type (section 4.C / section 8 scenario 6).
pub fn ept_pointer(pool: &EptPool) -> u64 {
    const WALK_LENGTH_4: u64 = 3 << 3; // encodes "4" as (n-1)
    const MEMTYPE_WB: u64 = 6;
    (pool.root_hpa() & 0x000F_FFFF_FFFF_F000) | WALK_LENGTH_4 | MEMTYPE_WB
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::paging::PageSize;

    #[test]
    fn eptp_has_walk_length_and_memtype() {
        let pool = EptPool::new();
        let eptp = ept_pointer(&pool);
        assert_eq!(eptp & 0x7, 6); // memory type WB
        assert_eq!((eptp >> 3) & 0x7, 3); // walk length - 1
    }

    #[test]
    fn map_2mib_guest_region() {
        let pool = EptPool::new();
        pool.map::<EptOps>(0x0020_0000, 0x1_0020_0000, PageSize::Size2M, EptOps::default_access_right())
            .unwrap();
        let (hpa, size) = pool.lookup::<EptOps>(0x0020_1234).unwrap();
        assert_eq!(hpa, 0x1_0020_0000);
        assert_eq!(size, PageSize::Size2M);
    }
}
