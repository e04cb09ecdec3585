//! Global process table.
//!
//! A dense, resizable sequence of PCBs indexed by PID. Slots are never
//! reordered: an exited process leaves an unused slot behind so live PIDs
//! stay stable, and only trailing unused slots are trimmed.

use alloc::vec::Vec;

use crate::sync::SpinLock;

use super::pcb::{Pcb, Pid, PID_UNUSED};

/// The PCB table.
pub struct ProcessTable {
    pub pcbs: Vec<Pcb>,
}

impl ProcessTable {
    pub const fn new() -> Self {
        Self { pcbs: Vec::new() }
    }

    /// Number of slots (live and unused).
    pub fn len(&self) -> usize {
        self.pcbs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pcbs.is_empty()
    }

    /// Reserve an unused PID: the first free slot, or a new slot pushed
    /// onto the end. The slot's `pid` field is claimed immediately.
    pub fn get_open_pid(&mut self) -> Pid {
        for i in 0..self.pcbs.len() {
            if !self.pcbs[i].in_use() {
                self.pcbs[i].pid = i as Pid;
                return i as Pid;
            }
        }

        let pid = self.pcbs.len() as Pid;
        let mut slot = Pcb::unused();
        slot.pid = pid;
        self.pcbs.push(slot);
        pid
    }

    /// The PCB for `pid`, if the index is in range.
    pub fn pcb(&self, pid: Pid) -> Option<&Pcb> {
        if pid < 0 {
            return None;
        }
        self.pcbs.get(pid as usize)
    }

    pub fn pcb_mut(&mut self, pid: Pid) -> Option<&mut Pcb> {
        if pid < 0 {
            return None;
        }
        self.pcbs.get_mut(pid as usize)
    }

    /// Mark `pid` unused and pop trailing unused slots so live indices
    /// are preserved.
    pub fn release_slot(&mut self, pid: Pid) {
        if let Some(pcb) = self.pcb_mut(pid) {
            pcb.pid = PID_UNUSED;
        }

        while let Some(last) = self.pcbs.last() {
            if last.in_use() {
                break;
            }
            self.pcbs.pop();
        }
    }
}

impl Default for ProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

/// The global PCB table behind its lock. Held across every mutation of
/// slots, states, blocking calls, fd tables and page mappings.
static PCB_TABLE: SpinLock<ProcessTable> = SpinLock::new(ProcessTable::new());

/// Acquire the PCB table guard directly; for the few paths (execute,
/// context switch) that must interleave the critical section with
/// assembly.
pub fn table_guard() -> crate::sync::SpinLockIrqGuard<'static, ProcessTable> {
    PCB_TABLE.lock_irqsave()
}

/// Run `f` with the PCB table locked (interrupts masked).
pub fn with_table<R>(f: impl FnOnce(&mut ProcessTable) -> R) -> R {
    let mut guard = table_guard();
    f(&mut guard)
}

/// The PID of the process whose kernel stack is executing, read from the
/// word stored at the top of the current 8 KiB kernel stack.
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub fn current_pid() -> Pid {
    use crate::mm::{KERNEL_STACK_BASE_MASK, KERNEL_STACK_SIZE};

    let esp0 = crate::arch::tss_esp0();
    let pid_slot = (esp0 & KERNEL_STACK_BASE_MASK) + KERNEL_STACK_SIZE - 4;
    // SAFETY: every kernel stack is created with its owning PID written to
    // its topmost word, and esp0 always points into the current stack.
    unsafe { *(pid_slot as *const Pid) }
}

#[cfg(not(all(target_arch = "x86", target_os = "none")))]
mod host {
    use core::sync::atomic::{AtomicI32, Ordering};

    static CURRENT_PID: AtomicI32 = AtomicI32::new(0);

    pub fn current_pid() -> super::Pid {
        CURRENT_PID.load(Ordering::Relaxed)
    }

    /// Host-side stand-in for the kernel-stack PID word.
    pub fn set_current_pid(pid: super::Pid) {
        CURRENT_PID.store(pid, Ordering::Relaxed);
    }

    /// Serialize host tests that rely on the ambient current PID.
    #[cfg(test)]
    pub fn with_current_pid<R>(pid: super::Pid, f: impl FnOnce() -> R) -> R {
        static AMBIENT_PID: std::sync::Mutex<()> = std::sync::Mutex::new(());
        let _guard = AMBIENT_PID.lock().unwrap_or_else(|e| e.into_inner());
        set_current_pid(pid);
        f()
    }
}

#[cfg(not(all(target_arch = "x86", target_os = "none")))]
pub use host::{current_pid, set_current_pid};
#[cfg(all(test, not(all(target_arch = "x86", target_os = "none"))))]
pub use host::with_current_pid;
