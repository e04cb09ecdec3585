//! Scheduler core.
//!
//! The PIT interrupt is the only source of involuntary preemption. Each
//! tick walks the PCB table in PID order starting after the current
//! process, switches to the first runnable entry, and reaps any exited
//! process it passes on the way -- never the one whose kernel stack is
//! executing.

use alloc::vec::Vec;

use crate::{
    error::{KernelError, KernelResult},
    process::{
        self,
        lifecycle::{free_pid, map_process, unmap_process},
        table::table_guard,
        KernelContext, Pid, ProcessState, ProcessTable,
    },
    sync,
};

/// Scheduling decision: the next PID to run (if any other process is
/// runnable) and the exited PIDs passed over on the way, in walk order.
pub fn pick_next(table: &ProcessTable, current: Pid) -> (Option<Pid>, Vec<Pid>) {
    let len = table.len();
    let mut reap = Vec::new();

    if len == 0 || current < 0 {
        return (None, reap);
    }

    let mut i = (current as usize + 1) % len;
    while i != current as usize {
        let pcb = &table.pcbs[i];

        if pcb.in_use() && pcb.state == ProcessState::Running {
            return (Some(i as Pid), reap);
        }

        if pcb.in_use() && pcb.state == ProcessState::Stopping {
            reap.push(i as Pid);
        }

        i = (i + 1) % len;
    }

    (None, reap)
}

/// Timer-driven scheduling pass.
///
/// Preemption only happens when the timer interrupt is the only frame on
/// the current kernel stack; nested interrupt activity finishes first.
pub fn scheduler_tick() {
    if !crate::arch::timer_is_only_frame() {
        return;
    }

    let current = process::current_pid();

    let next = process::with_table(|t| {
        if t.is_empty() {
            return None;
        }

        let (next, reap) = pick_next(t, current);
        for pid in reap {
            // Reaping is deferred to this point precisely so the freed
            // kernel stack is never the one in use.
            log::debug!("reaping stopped pid {}", pid);
            free_pid(t, pid);
        }
        next
    });

    match next {
        Some(next) => {
            let _ = context_switch(next);
        }
        None => {
            // Keep running the current process.
            crate::signal::handle_signals();
        }
    }
}

/// Switch from the current process to `new_pid`: remap user pages, point
/// the TSS at the new kernel stack, save a resume point for the outgoing
/// process, and restore the incoming one.
///
/// Returns after this process is eventually scheduled again; at that
/// point pending signals are delivered if the scheduler's interrupt is
/// the only thing on the stack.
pub fn context_switch(new_pid: Pid) -> KernelResult<()> {
    let flags = sync::irq_save();
    let mut table = table_guard();

    let valid = table
        .pcb(new_pid)
        .map(|p| p.in_use() && p.state != ProcessState::Stopping)
        .unwrap_or(false);
    if !valid {
        drop(table);
        sync::irq_restore(flags);
        return Err(KernelError::ProcessNotFound { pid: new_pid });
    }

    let old_pid = process::current_pid();

    let _ = unmap_process(&table, old_pid);
    if let Err(e) = map_process(&table, new_pid) {
        let _ = map_process(&table, old_pid);
        drop(table);
        sync::irq_restore(flags);
        return Err(e);
    }

    let new_stack_base = table.pcb(new_pid).expect("validated above").kernel_stack_base;
    crate::arch::set_tss_esp0(new_stack_base as u32 - 4);
    crate::arch::set_tss_ss0(crate::arch::KERNEL_DS);

    let Some(old_ctx) = table
        .pcb_mut(old_pid)
        .map(|p| &mut p.context as *mut KernelContext)
    else {
        drop(table);
        sync::irq_restore(flags);
        return Err(KernelError::ProcessNotFound { pid: old_pid });
    };
    let new_ctx: *const KernelContext =
        &table.pcb(new_pid).expect("validated above").context as *const KernelContext;

    // The guard is dropped before the switch; interrupts stay masked (via
    // `flags`) so nothing can mutate the table while the raw context
    // pointers are live.
    drop(table);

    // SAFETY: both context pointers were derived from live PCB slots and
    // the table cannot change until the switch assembly re-enables
    // interrupts with the new stack in place.
    unsafe {
        crate::arch::switch_context(old_ctx, new_ctx);
    }

    // Resumed: some other process switched back to us.
    sync::irq_restore(flags);

    if crate::arch::timer_is_only_frame() {
        crate::signal::handle_signals();
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_with_states(states: &[(bool, ProcessState)]) -> ProcessTable {
        let mut table = ProcessTable::new();
        for &(used, state) in states {
            let pid = table.get_open_pid();
            let pcb = table.pcb_mut(pid).unwrap();
            pcb.state = state;
            if !used {
                pcb.pid = crate::process::pcb::PID_UNUSED;
            }
        }
        table
    }

    #[test]
    fn test_round_robin_order() {
        let table = table_with_states(&[
            (true, ProcessState::Running),
            (true, ProcessState::Running),
            (true, ProcessState::Running),
        ]);

        let (next, _) = pick_next(&table, 0);
        assert_eq!(next, Some(1));
        let (next, _) = pick_next(&table, 1);
        assert_eq!(next, Some(2));
        let (next, _) = pick_next(&table, 2);
        assert_eq!(next, Some(0));
    }

    #[test]
    fn test_sleeping_processes_skipped() {
        let table = table_with_states(&[
            (true, ProcessState::Running),
            (true, ProcessState::Sleeping),
            (true, ProcessState::Running),
        ]);

        let (next, _) = pick_next(&table, 0);
        assert_eq!(next, Some(2));
    }

    #[test]
    fn test_no_other_runnable_stays_put() {
        let table = table_with_states(&[
            (true, ProcessState::Running),
            (true, ProcessState::Sleeping),
        ]);

        let (next, _) = pick_next(&table, 0);
        assert_eq!(next, None);
    }

    #[test]
    fn test_stopping_entries_reported_for_reaping() {
        let table = table_with_states(&[
            (true, ProcessState::Running),
            (true, ProcessState::Stopping),
            (true, ProcessState::Running),
        ]);

        let (next, reap) = pick_next(&table, 0);
        assert_eq!(next, Some(2));
        assert_eq!(reap, alloc::vec![1]);
    }

    #[test]
    fn test_unused_slots_skipped() {
        let table = table_with_states(&[
            (true, ProcessState::Running),
            (false, ProcessState::Running),
            (true, ProcessState::Running),
        ]);

        let (next, _) = pick_next(&table, 2);
        assert_eq!(next, Some(0));
    }

    #[test]
    fn test_fairness_within_one_sweep() {
        // With k continuously runnable processes, every process is
        // scheduled at least once in any k consecutive decisions.
        let table = table_with_states(&[
            (true, ProcessState::Running),
            (true, ProcessState::Running),
            (true, ProcessState::Running),
            (true, ProcessState::Running),
        ]);

        let mut current: Pid = 0;
        let mut seen = std::collections::HashSet::new();
        for _ in 0..4 {
            let (next, _) = pick_next(&table, current);
            current = next.unwrap();
            seen.insert(current);
        }
        assert_eq!(seen.len(), 4);
    }

    #[test]
    fn test_reap_never_touches_current() {
        // The walk reaps exited entries but never the current process,
        // even when it is itself Stopping.
        let mut table = table_with_states(&[
            (true, ProcessState::Stopping),
            (true, ProcessState::Stopping),
        ]);

        let (next, reap) = pick_next(&table, 1);
        assert_eq!(next, None);
        assert_eq!(reap, alloc::vec![0]);
        for pid in reap {
            free_pid(&mut table, pid);
        }
        assert!(table.pcb(0).map(|p| !p.in_use()).unwrap_or(true));
        assert!(table.pcb(1).unwrap().in_use());
    }
}
