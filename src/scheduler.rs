//! Per-pCPU cooperative scheduler (component G).
//!
//! Generalized from the teacher's single round-robin-over-a-VM
//! `Scheduler` into the spec's richer model: a thread-object state
//! machine (BLOCKED/RUNNABLE/RUNNING), one scheduler-control block per
//! pCPU guarding a fixed thread-slot table, and an `arch_switch_to`
//! context-switch routine. The "no trait object, fixed dispatch table"
//! idiom is kept — `pick_next` plays the role the teacher's scheduler
//! v-table would, but is a concrete method since there is exactly one
//! scheduler policy (`sched_noop`: run whichever single thread is
//! runnable on this pCPU, falling through to idle otherwise).

use crate::config::{CONFIG_MAX_VM_NUM, MAX_VCPUS_PER_VM};
use crate::sync::SpinLock;
use bitflags::bitflags;

/// Upper bound on live thread objects a single pCPU's scheduler needs to
/// track: every vCPU slot in every VM could, in principle, be pinned here.
pub const MAX_THREADS: usize = CONFIG_MAX_VM_NUM * MAX_VCPUS_PER_VM;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadStatus {
    Blocked,
    Runnable,
    Running,
}

/// How a remote reschedule kick is delivered to this thread's pCPU
/// (section 3.7). `None` until the owning vCPU's vLAPIC has passed
/// through the apicv-mode switch; `InitIpi` once it has, since a kick
/// under x2APIC pass-through is an actual INIT-IPI rather than a flag
/// the target polls for on its next VM-exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NotifyMode {
    #[default]
    None,
    InitIpi,
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct SchedFlags: u32 {
        const NEED_RESCHEDULE = 1 << 0;
    }
}

/// A schedulable unit of execution (section 3.7). `host_sp` is the saved
/// host stack pointer `arch_switch_to` restores into `rsp` on resume;
/// `thread_entry` is invoked the first time this slot is switched into.
#[derive(Clone, Copy)]
pub struct ThreadObject {
    pub pcpu_id: usize,
    pub status: ThreadStatus,
    pub host_sp: u64,
    pub thread_entry: Option<fn(usize)>,
    pub notify_mode: NotifyMode,
    started: bool,
}

impl ThreadObject {
    const fn unused() -> Self {
        Self {
            pcpu_id: 0,
            status: ThreadStatus::Blocked,
            host_sp: 0,
            thread_entry: None,
            notify_mode: NotifyMode::None,
            started: false,
        }
    }
}

struct Inner {
    flags: SchedFlags,
    threads: [ThreadObject; MAX_THREADS],
    registered: [bool; MAX_THREADS],
    curr: Option<usize>,
}

/// One instance lives per pCPU (section 3.8).
pub struct SchedControlBlock {
    inner: SpinLock<Inner>,
}

impl SchedControlBlock {
    pub const fn new() -> Self {
        Self {
            inner: SpinLock::new(Inner {
                flags: SchedFlags::empty(),
                threads: [ThreadObject::unused(); MAX_THREADS],
                registered: [false; MAX_THREADS],
                curr: None,
            }),
        }
    }

    /// Register `slot` as a runnable thread pinned to `pcpu_id` with the
    /// given entry point (`init_thread_data`).
    pub fn init_thread_data(&self, slot: usize, pcpu_id: usize, entry: fn(usize)) {
        let mut inner = self.inner.lock();
        inner.threads[slot] = ThreadObject {
            pcpu_id,
            status: ThreadStatus::Runnable,
            host_sp: 0,
            thread_entry: Some(entry),
            notify_mode: NotifyMode::None,
            started: false,
        };
        inner.registered[slot] = true;
    }

    /// Switch `slot`'s reschedule-kick delivery to `mode` (section 4.C
    /// apicv-mode switch: flips to `InitIpi` once that vCPU's vLAPIC has
    /// passed through to x2APIC pass-through).
    pub fn set_notify_mode(&self, slot: usize, mode: NotifyMode) {
        self.inner.lock().threads[slot].notify_mode = mode;
    }

    /// Move a blocked thread back to runnable and request a reschedule.
    pub fn wake_thread(&self, slot: usize) {
        let mut inner = self.inner.lock();
        if inner.threads[slot].status == ThreadStatus::Blocked {
            inner.threads[slot].status = ThreadStatus::Runnable;
        }
        inner.flags.insert(SchedFlags::NEED_RESCHEDULE);
    }

    /// Move the current thread to blocked; it will not be picked again
    /// until `wake_thread` is called.
    pub fn sleep_thread(&self, slot: usize) {
        let mut inner = self.inner.lock();
        inner.threads[slot].status = ThreadStatus::Blocked;
        if inner.curr == Some(slot) {
            inner.curr = None;
        }
        inner.flags.insert(SchedFlags::NEED_RESCHEDULE);
    }

    /// Request that `slot`'s owning pCPU reschedule soon. On a real
    /// remote pCPU this also sends an INIT-IPI kick (section 4.G);
    /// single-pCPU builds only need the flag since there is nowhere
    /// else for the flag to be observed from.
    #[cfg(feature = "multi_pcpu")]
    pub fn kick_thread(&self, slot: usize, send_ipi: impl FnOnce(usize)) {
        let pcpu_id = {
            let mut inner = self.inner.lock();
            inner.flags.insert(SchedFlags::NEED_RESCHEDULE);
            inner.threads[slot].pcpu_id
        };
        send_ipi(pcpu_id);
    }

    #[cfg(not(feature = "multi_pcpu"))]
    pub fn kick_thread(&self, _slot: usize) {
        self.inner.lock().flags.insert(SchedFlags::NEED_RESCHEDULE);
    }

    pub fn need_reschedule(&self) -> bool {
        self.inner.lock().flags.contains(SchedFlags::NEED_RESCHEDULE)
    }

    /// `sched_noop`: the first runnable thread pinned to `pcpu_id`,
    /// preferring whatever is already running there.
    pub fn pick_next(&self, pcpu_id: usize) -> Option<usize> {
        let mut inner = self.inner.lock();
        inner.flags.remove(SchedFlags::NEED_RESCHEDULE);
        if let Some(curr) = inner.curr {
            if inner.threads[curr].status == ThreadStatus::Running
                && inner.threads[curr].pcpu_id == pcpu_id
            {
                return Some(curr);
            }
        }
        for i in 0..MAX_THREADS {
            if inner.registered[i]
                && inner.threads[i].pcpu_id == pcpu_id
                && inner.threads[i].status == ThreadStatus::Runnable
            {
                inner.threads[i].status = ThreadStatus::Running;
                inner.curr = Some(i);
                return Some(i);
            }
        }
        None
    }

    pub fn schedule(&self, pcpu_id: usize) -> Option<usize> {
        self.pick_next(pcpu_id)
    }

    /// Switch from `prev` to `next`. On a thread's first run this calls
    /// into its `thread_entry`; on subsequent runs it resumes via
    /// `arch_switch_to`. Never returns if `next`'s thread never blocks.
    ///
    /// # Safety
    /// Must be called with `prev` the slot currently executing on this
    /// pCPU and `next` a slot `pick_next` just returned for it.
    pub unsafe fn run_thread(&self, prev: usize, next: usize) {
        let (next_started, next_entry, next_sp) = {
            let mut inner = self.inner.lock();
            let started = inner.threads[next].started;
            inner.threads[next].started = true;
            (started, inner.threads[next].thread_entry, inner.threads[next].host_sp)
        };
        if !next_started {
            if let Some(entry) = next_entry {
                entry(next);
            }
            return;
        }
        let prev_sp_slot = {
            let inner = self.inner.lock();
            &inner.threads[prev].host_sp as *const u64 as *mut u64
        };
        arch_switch_to(prev_sp_slot, next_sp);
    }
}

/// Save callee-saved registers and the current `rsp` into `*prev_sp_slot`,
/// then load `next_sp` into `rsp` and restore its callee-saved set. This
/// is the only primitive that actually changes which thread's stack is
/// live; everything above it is bookkeeping.
///
/// # Safety
/// `next_sp` must point at a stack previously saved by this same
/// function (or be freshly prepared with a matching register layout),
/// and `prev_sp_slot` must be valid for writes.
#[inline(never)]
pub unsafe fn arch_switch_to(prev_sp_slot: *mut u64, next_sp: u64) {
    core::arch::asm!(
        "push rbp",
        "push rbx",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "mov [{prev}], rsp",
        "mov rsp, {next}",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop rbx",
        "pop rbp",
        prev = in(reg) prev_sp_slot,
        next = in(reg) next_sp,
        options(nostack),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_entry(_slot: usize) {}

    #[test]
    fn pick_next_respects_pcpu_pinning() {
        let sched = SchedControlBlock::new();
        sched.init_thread_data(0, 0, noop_entry);
        sched.init_thread_data(1, 1, noop_entry);
        assert_eq!(sched.pick_next(1), Some(1));
        assert_eq!(sched.pick_next(0), Some(0));
    }

    #[test]
    fn sleep_then_wake_roundtrips() {
        let sched = SchedControlBlock::new();
        sched.init_thread_data(0, 0, noop_entry);
        assert_eq!(sched.pick_next(0), Some(0));
        sched.sleep_thread(0);
        assert_eq!(sched.pick_next(0), None);
        sched.wake_thread(0);
        assert_eq!(sched.pick_next(0), Some(0));
    }

    #[test]
    fn need_reschedule_flag_clears_on_pick() {
        let sched = SchedControlBlock::new();
        sched.init_thread_data(0, 0, noop_entry);
        sched.wake_thread(0);
        assert!(sched.need_reschedule());
        sched.pick_next(0);
        assert!(!sched.need_reschedule());
    }
}
